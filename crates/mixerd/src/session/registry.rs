// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SessionRegistry — spec §4.6. Owns the rate-limited enumeration of
//! platform audio sessions; the actual enumeration is an out-of-scope
//! external collaborator (spec §1: "platform-specific audio-session
//! enumeration (PulseAudio / WASAPI)") reached through [`AudioBackend`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Soft minimum spacing between non-forced refreshes (spec §4.6).
pub const SOFT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

/// Hard maximum cache age before the next event forces a refresh (spec §4.6).
pub const HARD_MAX_REFRESH_INTERVAL: Duration = Duration::from_secs(45);

/// One capability-bearing audio endpoint handle (spec §3 `Session`). Async
/// because every call is a round trip to the platform backend.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    /// Case-insensitive identifier: `"master"`, `"system"`, `"mic"`, a
    /// process basename, or a friendly device name `Name (Driver)`.
    fn key(&self) -> &str;

    /// Absolute filesystem path of the owning process, or empty.
    fn process_path(&self) -> &str;

    async fn get_volume(&self) -> anyhow::Result<f32>;
    async fn set_volume(&self, percent: f32) -> anyhow::Result<()>;
    async fn get_mute(&self) -> anyhow::Result<bool>;
    async fn set_mute(&self, mute: bool) -> anyhow::Result<()>;

    /// Release the underlying platform object. Called exactly once, by the
    /// next refresh or by registry shutdown (spec §5).
    async fn release(&self);
}

/// One enumerable audio device, logged once at init (spec §4.6).
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub key: String,
}

/// Platform audio-session enumeration, out of scope per spec §1. The
/// orchestration core only depends on this narrow contract.
#[async_trait]
pub trait AudioBackend: Send + Sync {
    async fn get_all_sessions(&self) -> anyhow::Result<Vec<Arc<dyn SessionHandle>>>;
    async fn get_all_devices(&self) -> anyhow::Result<Vec<DeviceInfo>>;
}

/// Test/headless double: returns whatever sessions/devices are seeded into
/// it, standing in for PulseAudio/WASAPI.
#[derive(Default)]
pub struct NullAudioBackend {
    sessions: Mutex<Vec<Arc<dyn SessionHandle>>>,
    devices: Mutex<Vec<DeviceInfo>>,
}

impl NullAudioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_sessions(&self, sessions: Vec<Arc<dyn SessionHandle>>) {
        *self.sessions.lock().await = sessions;
    }

    pub async fn set_devices(&self, devices: Vec<DeviceInfo>) {
        *self.devices.lock().await = devices;
    }
}

#[async_trait]
impl AudioBackend for NullAudioBackend {
    async fn get_all_sessions(&self) -> anyhow::Result<Vec<Arc<dyn SessionHandle>>> {
        Ok(self.sessions.lock().await.clone())
    }

    async fn get_all_devices(&self) -> anyhow::Result<Vec<DeviceInfo>> {
        Ok(self.devices.lock().await.clone())
    }
}

/// Outcome of a refresh attempt.
pub enum RefreshOutcome {
    /// Suppressed by the soft-minimum rate limit.
    Suppressed,
    Done(anyhow::Result<Vec<Arc<dyn SessionHandle>>>),
}

/// Rate-limited front door onto [`AudioBackend`]. Does not hold the session
/// cache itself (that's [`super::map::SessionMap`]'s job) — only decides
/// *whether* and *when* to call the backend, and records the refresh
/// timestamp used by spec §8's monotonicity invariant.
pub struct SessionRegistry {
    backend: Arc<dyn AudioBackend>,
    last_refresh: Mutex<Option<Instant>>,
}

impl SessionRegistry {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        Self { backend, last_refresh: Mutex::new(None) }
    }

    /// Log the device list once, per spec §4.6. Does not affect the
    /// refresh rate limit.
    pub async fn log_devices_once(&self) {
        match self.backend.get_all_devices().await {
            Ok(devices) => {
                for d in &devices {
                    tracing::info!(device = %d.name, key = %d.key, "audio device discovered");
                }
            }
            Err(e) => tracing::warn!("failed to enumerate audio devices: {e:#}"),
        }
    }

    /// Attempt a refresh. `force` bypasses the soft minimum; a hard-stale
    /// cache should always be refreshed with `force = true` by the caller.
    pub async fn refresh(&self, force: bool) -> RefreshOutcome {
        {
            let last = *self.last_refresh.lock().await;
            if !force {
                if let Some(t) = last {
                    if t.elapsed() < SOFT_MIN_REFRESH_INTERVAL {
                        return RefreshOutcome::Suppressed;
                    }
                }
            }
        }
        *self.last_refresh.lock().await = Some(Instant::now());
        RefreshOutcome::Done(self.backend.get_all_sessions().await)
    }

    pub async fn last_refresh(&self) -> Option<Instant> {
        *self.last_refresh.lock().await
    }

    /// Whether the cache is past the hard maximum (or has never been
    /// populated) and must be force-refreshed before the next event.
    pub async fn is_hard_stale(&self) -> bool {
        match *self.last_refresh.lock().await {
            Some(t) => t.elapsed() > HARD_MAX_REFRESH_INTERVAL,
            None => true,
        }
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod tests;
