//! Playback command handling: the `Idle ⇄ Playing ⇄ Paused` machine plus the
//! paginated page cursor, broadcast to the owning device's session group.

use chrono::Utc;
use tracing::{debug, info};

use crate::events::DeviceEvent;
use crate::hub::EventHub;
use crate::models::{DeviceId, Lifecycle, MediaKind, PlaybackState};
use crate::pipeline::convert::ConversionService;
use crate::service::registry::DeviceRegistry;
use crate::{Error, Result};

/// Applies control commands to a device's playback state and fans the result
/// out to that device's sessions. Commands for one device are applied in the
/// order received; nothing is ordered across devices.
#[derive(Clone)]
pub struct ControlService {
    registry: DeviceRegistry,
    conversion: ConversionService,
    hub: EventHub,
}

impl ControlService {
    #[must_use]
    pub fn new(registry: DeviceRegistry, conversion: ConversionService, hub: EventHub) -> Self {
        Self {
            registry,
            conversion,
            hub,
        }
    }

    /// `play(file)` starts the named asset; `play()` resumes. Unclassifiable
    /// names are rejected, never defaulted.
    pub async fn play(&self, device_id: &DeviceId, file: Option<&str>) -> Result<PlaybackState> {
        match file {
            Some(name) => self.play_file(device_id, name).await,
            None => self.resume(device_id).await,
        }
    }

    async fn play_file(&self, device_id: &DeviceId, name: &str) -> Result<PlaybackState> {
        let kind = MediaKind::from_name(name);
        if kind == MediaKind::Unknown {
            return Err(Error::Validation(format!(
                "'{name}' is not a playable media type"
            )));
        }

        // Documents render lazily on first access; playback starts right away
        // and paging becomes effective once pages exist.
        if matches!(kind, MediaKind::Pdf | MediaKind::Pptx)
            && self.conversion.page_count(device_id, name).await? == 0
        {
            let conversion = self.conversion.clone();
            let device_id = device_id.clone();
            let name = name.to_string();
            tokio::spawn(async move {
                if let Err(err) = conversion.convert(&device_id, &name).await {
                    debug!(
                        device_id = %device_id.as_str(),
                        file = %name,
                        error = %err,
                        "lazy conversion failed"
                    );
                }
            });
        }

        let owned = name.to_string();
        let state = self
            .registry
            .update_playback(device_id, |s| s.start(kind, owned))
            .await?;
        info!(device_id = %device_id.as_str(), file = %name, "play");
        self.hub.broadcast_device(
            device_id,
            DeviceEvent::Play {
                device_id: device_id.clone(),
                state: state.clone(),
                timestamp: Utc::now(),
            },
        );
        Ok(state)
    }

    /// Resume: re-broadcast the known current-asset state, or emit a generic
    /// resume hint when the server holds no asset (playback position is
    /// endpoint-local).
    async fn resume(&self, device_id: &DeviceId) -> Result<PlaybackState> {
        let current = self.registry.playback_state(device_id).await?;
        if current.asset.is_some() {
            let state = self
                .registry
                .update_playback(device_id, PlaybackState::resume)
                .await?;
            self.hub.broadcast_device(
                device_id,
                DeviceEvent::Play {
                    device_id: device_id.clone(),
                    state: state.clone(),
                    timestamp: Utc::now(),
                },
            );
            Ok(state)
        } else {
            self.hub.broadcast_device(
                device_id,
                DeviceEvent::Resume {
                    device_id: device_id.clone(),
                    timestamp: Utc::now(),
                },
            );
            Ok(current)
        }
    }

    pub async fn pause(&self, device_id: &DeviceId) -> Result<PlaybackState> {
        let state = self
            .registry
            .update_playback(device_id, PlaybackState::pause)
            .await?;
        self.hub.broadcast_device(
            device_id,
            DeviceEvent::Pause {
                device_id: device_id.clone(),
                timestamp: Utc::now(),
            },
        );
        Ok(state)
    }

    /// Restart the current asset from the beginning.
    pub async fn restart(&self, device_id: &DeviceId) -> Result<PlaybackState> {
        let state = self
            .registry
            .update_playback(device_id, |s| {
                s.lifecycle = Lifecycle::Playing;
                s.updated_at = Utc::now();
            })
            .await?;
        self.hub.broadcast_device(
            device_id,
            DeviceEvent::Restart {
                device_id: device_id.clone(),
                timestamp: Utc::now(),
            },
        );
        Ok(state)
    }

    pub async fn stop(&self, device_id: &DeviceId) -> Result<PlaybackState> {
        let state = self.registry.reset_playback(device_id).await?;
        self.hub.broadcast_device(
            device_id,
            DeviceEvent::Stop {
                device_id: device_id.clone(),
                timestamp: Utc::now(),
            },
        );
        Ok(state)
    }

    pub async fn page_left(&self, device_id: &DeviceId) -> Result<Option<u32>> {
        self.page_step(device_id, -1).await
    }

    pub async fn page_right(&self, device_id: &DeviceId) -> Result<Option<u32>> {
        self.page_step(device_id, 1).await
    }

    /// Move the page cursor, clamped to `[1, max_page]`. Returns `None` when
    /// nothing is paginated or the page count is still unresolved; boundary
    /// steps keep the cursor in place.
    async fn page_step(&self, device_id: &DeviceId, delta: i64) -> Result<Option<u32>> {
        let current = self.registry.playback_state(device_id).await?;
        let (Some(asset), true) = (current.asset.clone(), current.is_paginated()) else {
            return Ok(None);
        };

        let max_page = self.conversion.page_count(device_id, &asset).await?;
        if max_page == 0 {
            return Ok(None);
        }

        let page = i64::from(current.page.unwrap_or(1));
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let target = (page + delta).clamp(1, i64::from(max_page)) as u32;
        if Some(target) == current.page {
            return Ok(Some(target));
        }

        self.registry
            .update_playback(device_id, |s| s.set_page(target))
            .await?;
        self.hub.broadcast_device(
            device_id,
            DeviceEvent::PageChanged {
                device_id: device_id.clone(),
                page: target,
                timestamp: Utc::now(),
            },
        );
        Ok(Some(target))
    }

    /// Best-effort global signal for external observers; deliberately not
    /// routed through device groups.
    pub fn content_changed(&self) {
        self.hub.publish(DeviceEvent::DevicesChanged {
            timestamp: Utc::now(),
        });
    }
}
