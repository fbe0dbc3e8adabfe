// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! EventDistributor — spec §4.5. Subscribers register once and get an
//! at-most-one-pending channel: the producer always sends non-blocking, and
//! if the slot is already full the event is dropped for that subscriber
//! only. This trades loss for liveness under the hardware's ~100 Hz
//! aggregate burst rate (spec §5).

use tokio::sync::{mpsc, RwLock};

use crate::event::Event;

/// Fans out decoded events to registered subscribers (SessionMap,
/// ButtonEngine, RelayServer). Append-only subscriber list under a write
/// lock; delivery copies the list under a read lock and releases it before
/// sending, so a slow/blocked subscriber can never stall registration or
/// the transport's read loop (design note, spec §9).
#[derive(Default)]
pub struct EventDistributor {
    subscribers: RwLock<Vec<mpsc::Sender<Event>>>,
}

impl EventDistributor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber. Returns a receiver with a single-slot
    /// mailbox: at most one undelivered event is ever buffered for it.
    pub async fn subscribe(&self) -> mpsc::Receiver<Event> {
        let (tx, rx) = mpsc::channel(1);
        self.subscribers.write().await.push(tx);
        rx
    }

    /// Deliver `event` to every subscriber, non-blocking. A subscriber whose
    /// slot is already full (single-slot overwrite semantics: the newest
    /// event supersedes an unread older one) simply misses this delivery —
    /// the transport's read loop is never slowed down by a lagging
    /// subscriber.
    pub async fn distribute(&self, event: Event) {
        let subscribers = self.subscribers.read().await.clone();
        for tx in &subscribers {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!("subscriber slot full, dropping event for liveness");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Subscriber already exited; nothing to do until the
                    // next prune (shutdown) drops the stale handle.
                }
            }
        }
    }

    /// Close every subscriber channel exactly once. Idempotent: a second
    /// call finds an empty list and does nothing.
    pub async fn shutdown(&self) {
        self.subscribers.write().await.clear();
    }
}

#[cfg(test)]
#[path = "distributor_tests.rs"]
mod tests;
