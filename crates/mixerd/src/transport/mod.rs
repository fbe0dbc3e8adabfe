// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Transport layer — spec §4.2/§4.3/§4.4. Two interchangeable providers
//! (serial, SSE) plus the supervisor that owns exactly one of them at a
//! time.

pub mod serial;
pub mod sse;
pub mod supervisor;

use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::MixerError;
use crate::event::Event;

/// Fixed retry interval for both transports (spec §4.2/§4.3).
pub const RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// SSE idle timeout (spec §4.3): no data for this long is a disconnect.
pub const SSE_IDLE_TIMEOUT: Duration = Duration::from_secs(12);

/// Deadline the supervisor gives `wait_for_stop` during a swap (spec §4.4).
pub const STOP_WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// Pause between stopping the old transport and starting the new one
/// (spec §4.4).
pub const SWAP_SETTLE_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Disconnected,
    Connecting,
    Connected,
}

/// Atomic, `Copy`-friendly status cell shared between a transport's tasks.
#[derive(Default)]
pub struct StatusCell(AtomicU8);

impl StatusCell {
    pub fn new(initial: TransportStatus) -> Self {
        let cell = Self(AtomicU8::new(0));
        cell.set(initial);
        cell
    }

    pub fn set(&self, status: TransportStatus) {
        let value = match status {
            TransportStatus::Disconnected => 0,
            TransportStatus::Connecting => 1,
            TransportStatus::Connected => 2,
        };
        self.0.store(value, Ordering::SeqCst);
    }

    pub fn get(&self) -> TransportStatus {
        match self.0.load(Ordering::SeqCst) {
            1 => TransportStatus::Connecting,
            2 => TransportStatus::Connected,
            _ => TransportStatus::Disconnected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.get() == TransportStatus::Connected
    }
}

/// A transport owns its connection exclusively; the [`supervisor`] owns
/// *which* transport is active. Contract per spec §4.2.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Start the transport's read + reconnect tasks, delivering decoded
    /// events on `event_tx`. Returns once the initial connection attempt
    /// resolves (connected, or a terminal/recoverable error).
    async fn start(&self, event_tx: mpsc::Sender<Event>) -> Result<(), MixerError>;

    /// Signal all tasks to stop and close the connection. Idempotent.
    async fn stop(&self);

    /// Poll until `is_connected()` is false or `timeout` elapses. Returns
    /// whether the stop was confirmed within the deadline.
    async fn wait_for_stop(&self, timeout: Duration) -> bool;

    fn is_connected(&self) -> bool;

    /// The configured connection parameter (serial port name or SSE URL),
    /// used by the supervisor to detect parameter changes on reload.
    fn connection_key(&self) -> String;
}

/// Poll [`Transport::is_connected`] until it reports `false` or `timeout`
/// elapses. Shared by every `Transport` impl's `wait_for_stop`.
pub async fn poll_until_disconnected(is_connected: impl Fn() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_connected() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
