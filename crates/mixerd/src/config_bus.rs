// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! ConfigBus — spec §4.10. Holds the current immutable mapping snapshot and
//! publishes reloads to subscribers via `tokio::sync::watch`, which gives
//! exactly the single-slot, at-most-one-pending semantics spec §4.5
//! prescribes for subscriber delivery: a watch receiver always observes the
//! *latest* published value, never a backlog.

use std::sync::Arc;

use tokio::sync::watch;

use crate::mapping::Mapping;

/// Publishes [`Mapping`] snapshots to the transport supervisor, session map,
/// button engine, and relay server.
pub struct ConfigBus {
    tx: watch::Sender<Arc<Mapping>>,
}

/// A subscriber handle. Clone freely; each clone tracks its own "have I seen
/// the latest value" cursor independently, matching `watch::Receiver`.
pub type ConfigSubscriber = watch::Receiver<Arc<Mapping>>;

impl ConfigBus {
    pub fn new(initial: Mapping) -> Self {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Self { tx }
    }

    /// Publish a new snapshot. All subscribers observe it on their next
    /// `changed()`/`borrow()` call; no subscriber can ever see a backlog of
    /// more than one pending snapshot.
    pub fn publish(&self, mapping: Mapping) {
        self.tx.send_replace(Arc::new(mapping));
    }

    pub fn current(&self) -> Arc<Mapping> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> ConfigSubscriber {
        self.tx.subscribe()
    }
}

#[cfg(test)]
#[path = "config_bus_tests.rs"]
mod tests;
