use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, warn};

use crate::events::DeviceEvent;
use crate::models::id::{DeviceId, SessionId};

/// Message sender for one live session
pub type MessageSender = mpsc::UnboundedSender<DeviceEvent>;

const OBSERVER_CHANNEL_CAPACITY: usize = 256;

/// In-memory hub routing events to live sessions and global observers.
///
/// Sessions subscribe first and join a device group once registered, so
/// registration replies can reach a session that is not yet bound to any
/// device. Device-scoped broadcasts fan out only to that device's group;
/// `publish` reaches every session plus the lossy observer channel.
#[derive(Clone)]
pub struct EventHub {
    /// Map of session_id -> event sender
    sessions: Arc<DashMap<SessionId, MessageSender>>,

    /// Map of device_id -> sessions in that device's group
    groups: Arc<DashMap<DeviceId, Vec<SessionId>>>,

    /// Map of session_id -> joined device, for cleanup
    memberships: Arc<DashMap<SessionId, DeviceId>>,

    /// Best-effort channel for external observers (admin surfaces)
    observers: broadcast::Sender<DeviceEvent>,
}

impl EventHub {
    #[must_use]
    pub fn new() -> Self {
        let (observers, _) = broadcast::channel(OBSERVER_CHANNEL_CAPACITY);
        Self {
            sessions: Arc::new(DashMap::new()),
            groups: Arc::new(DashMap::new()),
            memberships: Arc::new(DashMap::new()),
            observers,
        }
    }

    /// Attach a session and return its event receiver.
    pub fn subscribe(&self, session_id: SessionId) -> mpsc::UnboundedReceiver<DeviceEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.insert(session_id.clone(), tx);
        debug!(session_id = %session_id.as_str(), "session subscribed");
        rx
    }

    /// Detach a session and drop its group membership.
    pub fn unsubscribe(&self, session_id: &SessionId) {
        self.leave_device(session_id);
        self.sessions.remove(session_id);
        debug!(session_id = %session_id.as_str(), "session unsubscribed");
    }

    /// Put a session into a device's broadcast group, leaving any previous
    /// group first.
    pub fn join_device(&self, session_id: &SessionId, device_id: &DeviceId) {
        self.leave_device(session_id);
        self.groups
            .entry(device_id.clone())
            .or_default()
            .push(session_id.clone());
        self.memberships
            .insert(session_id.clone(), device_id.clone());
        debug!(
            session_id = %session_id.as_str(),
            device_id = %device_id.as_str(),
            "session joined device group"
        );
    }

    /// Remove a session from its device group, if it is in one.
    pub fn leave_device(&self, session_id: &SessionId) {
        if let Some((_, device_id)) = self.memberships.remove(session_id) {
            if let Some(mut group) = self.groups.get_mut(&device_id) {
                group.retain(|member| member != session_id);
                if group.is_empty() {
                    drop(group); // Drop the RefMut before removing
                    self.groups.remove(&device_id);
                }
            }
        }
    }

    /// Send an event to one session. Returns false when the session is gone.
    pub fn send_to_session(&self, session_id: &SessionId, event: DeviceEvent) -> bool {
        let Some(sender) = self.sessions.get(session_id) else {
            return false;
        };
        if sender.send(event).is_err() {
            drop(sender);
            self.unsubscribe(session_id);
            return false;
        }
        true
    }

    /// Broadcast an event to every session in a device's group.
    pub fn broadcast_device(&self, device_id: &DeviceId, event: DeviceEvent) -> usize {
        let members: Vec<SessionId> = self
            .groups
            .get(device_id)
            .map(|group| group.clone())
            .unwrap_or_default();

        let mut sent = 0;
        let mut dead = Vec::new();
        for session_id in &members {
            match self.sessions.get(session_id) {
                Some(sender) if sender.send(event.clone()).is_ok() => sent += 1,
                _ => dead.push(session_id.clone()),
            }
        }

        for session_id in dead {
            warn!(
                session_id = %session_id.as_str(),
                device_id = %device_id.as_str(),
                "dropping dead session from device group"
            );
            self.unsubscribe(&session_id);
        }

        debug!(
            device_id = %device_id.as_str(),
            event_type = %event.event_type(),
            sent,
            "device broadcast complete"
        );
        sent
    }

    /// Publish an event to every session and to the observer channel.
    pub fn publish(&self, event: DeviceEvent) -> usize {
        let mut sent = 0;
        let mut dead = Vec::new();
        for entry in self.sessions.iter() {
            if entry.value().send(event.clone()).is_ok() {
                sent += 1;
            } else {
                dead.push(entry.key().clone());
            }
        }
        for session_id in dead {
            self.unsubscribe(&session_id);
        }

        // Lagging or absent observers are fine, the channel is best-effort.
        let _ = self.observers.send(event);
        sent
    }

    /// Subscribe an external observer to the global event stream.
    #[must_use]
    pub fn watch(&self) -> broadcast::Receiver<DeviceEvent> {
        self.observers.subscribe()
    }

    #[must_use]
    pub fn group_size(&self, device_id: &DeviceId) -> usize {
        self.groups.get(device_id).map_or(0, |group| group.len())
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
