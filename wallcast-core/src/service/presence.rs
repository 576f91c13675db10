//! Live session tracking: register, heartbeat, disconnect, and the periodic
//! sweep that evicts silent connections.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::{DeviceEvent, RejectReason};
use crate::hub::EventHub;
use crate::models::{Capabilities, DeviceId, PlaybackState, SessionId};
use crate::service::registry::DeviceRegistry;
use crate::{Error, Result};

/// What `register` decided; also pushed to the session as a `registered` or
/// `rejected` event so transports never have to interpret errors.
#[derive(Debug, Clone)]
pub enum RegisterOutcome {
    Registered(PlaybackState),
    Rejected(RejectReason),
}

#[derive(Debug, Clone)]
struct SessionInfo {
    device_id: DeviceId,
    last_heartbeat: Instant,
}

/// Binds live connections to devices and tracks online/offline edges.
///
/// Membership is a set, not a counter, so duplicate disconnects are
/// idempotent. The 0→1 and 1→0 edges are computed under the device's map
/// entry so each fires at most once.
#[derive(Clone)]
pub struct SessionManager {
    registry: DeviceRegistry,
    hub: EventHub,
    sessions: Arc<DashMap<SessionId, SessionInfo>>,
    members: Arc<DashMap<DeviceId, HashSet<SessionId>>>,
    heartbeat_timeout: Duration,
}

impl SessionManager {
    #[must_use]
    pub fn new(registry: DeviceRegistry, hub: EventHub, heartbeat_timeout: Duration) -> Self {
        Self {
            registry,
            hub,
            sessions: Arc::new(DashMap::new()),
            members: Arc::new(DashMap::new()),
            heartbeat_timeout,
        }
    }

    /// Attach a new connection. The caller gets the session's event stream;
    /// the session gets a snapshot of currently online devices.
    pub fn connect(&self, session_id: SessionId) -> mpsc::UnboundedReceiver<DeviceEvent> {
        let rx = self.hub.subscribe(session_id.clone());
        self.hub.send_to_session(
            &session_id,
            DeviceEvent::OnlineSnapshot {
                devices: self.online_devices(),
                timestamp: Utc::now(),
            },
        );
        rx
    }

    /// Bind a connection to a device. Unknown devices are rejected with an
    /// explicit signal, never silently dropped.
    pub async fn register(
        &self,
        session_id: &SessionId,
        device_id: &str,
        device_type: Option<String>,
        platform: Option<String>,
        capabilities: Option<Capabilities>,
    ) -> Result<RegisterOutcome> {
        let device_id = match DeviceId::parse(device_id) {
            Ok(id) => id,
            Err(err) => {
                self.reject(session_id);
                return Err(err);
            }
        };
        if let Err(err) = self.registry.get_device(&device_id).await {
            if matches!(err, Error::NotFound(_)) {
                warn!(
                    session_id = %session_id.as_str(),
                    device_id = %device_id.as_str(),
                    "registration for unknown device rejected"
                );
                self.reject(session_id);
                return Ok(RegisterOutcome::Rejected(RejectReason::UnknownDevice));
            }
            return Err(err);
        }

        let rebind = match self.sessions.get(session_id) {
            Some(existing) if existing.device_id == device_id => {
                // Same live connection, same device: reset to idle and report
                // current state without duplicate bookkeeping.
                drop(existing);
                self.touch(session_id);
                let state = self.registry.reset_playback(&device_id).await?;
                self.hub.send_to_session(
                    session_id,
                    DeviceEvent::Registered {
                        device_id: device_id.clone(),
                        state: state.clone(),
                        timestamp: Utc::now(),
                    },
                );
                return Ok(RegisterOutcome::Registered(state));
            }
            Some(existing) => Some(existing.device_id.clone()),
            None => None,
        };
        if let Some(previous) = rebind {
            self.leave(session_id, &previous);
        }

        self.sessions.insert(
            session_id.clone(),
            SessionInfo {
                device_id: device_id.clone(),
                last_heartbeat: Instant::now(),
            },
        );
        let went_online = {
            let mut set = self.members.entry(device_id.clone()).or_default();
            let was_empty = set.is_empty();
            set.insert(session_id.clone());
            was_empty
        };
        self.hub.join_device(session_id, &device_id);

        self.registry
            .touch_registration(&device_id, device_type, platform, capabilities)
            .await?;
        let state = self.registry.reset_playback(&device_id).await?;

        if went_online {
            info!(device_id = %device_id.as_str(), "device online");
            self.hub.publish(DeviceEvent::DeviceOnline {
                device_id: device_id.clone(),
                timestamp: Utc::now(),
            });
        }
        self.hub.send_to_session(
            session_id,
            DeviceEvent::Registered {
                device_id,
                state: state.clone(),
                timestamp: Utc::now(),
            },
        );
        Ok(RegisterOutcome::Registered(state))
    }

    fn reject(&self, session_id: &SessionId) {
        self.hub.send_to_session(
            session_id,
            DeviceEvent::Rejected {
                reason: RejectReason::UnknownDevice,
                timestamp: Utc::now(),
            },
        );
    }

    /// Record connection liveness.
    pub fn heartbeat(&self, session_id: &SessionId) {
        self.touch(session_id);
    }

    fn touch(&self, session_id: &SessionId) {
        if let Some(mut info) = self.sessions.get_mut(session_id) {
            info.last_heartbeat = Instant::now();
        }
    }

    /// Tear down a connection. Safe to call more than once; the session set
    /// makes duplicate close events no-ops.
    pub fn disconnect(&self, session_id: &SessionId) {
        if let Some((_, info)) = self.sessions.remove(session_id) {
            self.leave(session_id, &info.device_id);
        }
        self.hub.unsubscribe(session_id);
    }

    fn leave(&self, session_id: &SessionId, device_id: &DeviceId) {
        let went_offline = {
            let Some(mut set) = self.members.get_mut(device_id) else {
                return;
            };
            set.remove(session_id) && set.is_empty()
        };
        if went_offline {
            self.members.remove_if(device_id, |_, set| set.is_empty());
            info!(device_id = %device_id.as_str(), "device offline");
            self.hub.publish(DeviceEvent::DeviceOffline {
                device_id: device_id.clone(),
                timestamp: Utc::now(),
            });
        }
    }

    /// Evict every session of a device, used when the device is deleted.
    pub fn evict_device(&self, device_id: &DeviceId) {
        let victims: Vec<SessionId> = self
            .members
            .get(device_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        for session_id in victims {
            self.disconnect(&session_id);
        }
    }

    #[must_use]
    pub fn is_online(&self, device_id: &DeviceId) -> bool {
        self.members.get(device_id).is_some_and(|set| !set.is_empty())
    }

    #[must_use]
    pub fn online_devices(&self) -> Vec<DeviceId> {
        let mut online: Vec<DeviceId> = self
            .members
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        online.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        online
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// One sweep pass: force-disconnect every session silent past the
    /// heartbeat timeout. Returns how many were evicted.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|entry| {
                now.duration_since(entry.value().last_heartbeat) > self.heartbeat_timeout
            })
            .map(|entry| entry.key().clone())
            .collect();

        for session_id in &stale {
            debug!(session_id = %session_id.as_str(), "evicting silent session");
            self.disconnect(session_id);
        }
        stale.len()
    }

    /// Run the sweep on an interval until `shutdown` fires.
    #[must_use]
    pub fn spawn_sweeper(
        &self,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = manager.sweep();
                        if evicted > 0 {
                            info!(evicted, "heartbeat sweep evicted sessions");
                        }
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::status::StatusTracker;
    use crate::repository::{MemoryAssetStore, MemoryDeviceStore};

    async fn manager_with(timeout: Duration) -> (SessionManager, DeviceId, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let registry = DeviceRegistry::new(
            Arc::new(MemoryDeviceStore::new()),
            Arc::new(MemoryAssetStore::new()),
            StatusTracker::new(),
            tmp.path().to_path_buf(),
        );
        let device = registry.create_device("tv1", "Lobby").await.unwrap();
        (
            SessionManager::new(registry, EventHub::new(), timeout),
            device.id,
            tmp,
        )
    }

    fn online_edges(events: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> (usize, usize) {
        let (mut online, mut offline) = (0, 0);
        while let Ok(event) = events.try_recv() {
            match event {
                DeviceEvent::DeviceOnline { .. } => online += 1,
                DeviceEvent::DeviceOffline { .. } => offline += 1,
                _ => {}
            }
        }
        (online, offline)
    }

    #[tokio::test]
    async fn unknown_device_is_rejected_explicitly() {
        let (manager, _, _tmp) = manager_with(Duration::from_secs(30)).await;
        let session = SessionId::new();
        let mut rx = manager.connect(session.clone());
        // Drain the snapshot.
        assert!(matches!(
            rx.try_recv().unwrap(),
            DeviceEvent::OnlineSnapshot { .. }
        ));

        let outcome = manager
            .register(&session, "ghost", None, None, None)
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            RegisterOutcome::Rejected(RejectReason::UnknownDevice)
        ));
        assert!(matches!(rx.try_recv().unwrap(), DeviceEvent::Rejected { .. }));
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test]
    async fn online_and_offline_fire_once_per_edge() {
        let (manager, device_id, _tmp) = manager_with(Duration::from_secs(30)).await;

        let watcher = SessionId::new();
        let mut watch_rx = manager.connect(watcher.clone());

        let s1 = SessionId::new();
        let s2 = SessionId::new();
        let _rx1 = manager.connect(s1.clone());
        let _rx2 = manager.connect(s2.clone());
        manager.register(&s1, "tv1", None, None, None).await.unwrap();
        manager.register(&s2, "tv1", None, None, None).await.unwrap();
        assert!(manager.is_online(&device_id));

        manager.disconnect(&s1);
        assert!(manager.is_online(&device_id));
        manager.disconnect(&s2);
        manager.disconnect(&s2); // duplicate close is a no-op
        assert!(!manager.is_online(&device_id));

        let (online, offline) = online_edges(&mut watch_rx);
        assert_eq!(online, 1, "0→1 edge fires once");
        assert_eq!(offline, 1, "1→0 edge fires once");
    }

    #[tokio::test]
    async fn reregistering_resets_state_without_duplicates() {
        let (manager, device_id, _tmp) = manager_with(Duration::from_secs(30)).await;
        let session = SessionId::new();
        let _rx = manager.connect(session.clone());

        manager.register(&session, "tv1", None, None, None).await.unwrap();
        let outcome = manager
            .register(&session, "tv1", None, None, None)
            .await
            .unwrap();

        assert!(matches!(outcome, RegisterOutcome::Registered(state) if state.is_idle()));
        assert_eq!(manager.session_count(), 1);
        assert_eq!(
            manager
                .members
                .get(&device_id)
                .map(|set| set.len())
                .unwrap_or_default(),
            1
        );
    }

    #[tokio::test]
    async fn sweep_evicts_silent_sessions() {
        let (manager, device_id, _tmp) = manager_with(Duration::from_millis(10)).await;
        let session = SessionId::new();
        let _rx = manager.connect(session.clone());
        manager.register(&session, "tv1", None, None, None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let evicted = manager.sweep();
        assert_eq!(evicted, 1);
        assert!(!manager.is_online(&device_id));

        // A fresh heartbeat keeps the next session alive.
        let s2 = SessionId::new();
        let _rx2 = manager.connect(s2.clone());
        manager.register(&s2, "tv1", None, None, None).await.unwrap();
        manager.heartbeat(&s2);
        assert_eq!(manager.sweep(), 0);
    }

    #[tokio::test]
    async fn registering_elsewhere_leaves_the_previous_device() {
        let (manager, tv1, _tmp) = manager_with(Duration::from_secs(30)).await;
        manager.registry.create_device("tv2", "Hall").await.unwrap();

        let session = SessionId::new();
        let _rx = manager.connect(session.clone());
        manager.register(&session, "tv1", None, None, None).await.unwrap();
        manager.register(&session, "tv2", None, None, None).await.unwrap();

        assert!(!manager.is_online(&tv1));
        assert!(manager.is_online(&DeviceId::from_string("tv2".into())));
        assert_eq!(manager.session_count(), 1);
    }
}
