// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TransportSupervisor — spec §4.4. Decides which transport runs, owns the
//! single active transport exclusively, and distributes events to
//! subscribers (EventDistributor, spec §4.5).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::Mutex;

use crate::config_bus::ConfigBus;
use crate::distributor::EventDistributor;
use crate::error::ErrorKind;
use crate::mapping::Mapping;
use crate::notify::Notifier;

use super::serial::SerialTransport;
use super::sse::SseTransport;
use super::{Transport, STOP_WAIT_TIMEOUT, SWAP_SETTLE_DELAY};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActiveKind {
    Serial,
    Sse,
}

struct ActiveTransport {
    kind: ActiveKind,
    transport: Arc<dyn Transport>,
    connection_key: String,
}

/// Outcome of a (re)load decision, surfaced to the runtime so it can signal
/// graceful shutdown when appropriate (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    Running,
    NoneConfigured,
    Terminal,
}

enum StartOutcome {
    Started(ActiveTransport),
    FallbackToSse(String),
    Terminal,
}

/// Owns the single active transport. Every public entry point serializes
/// under `active`'s mutex, so swaps never race (invariant: at most one
/// transport Started at any time, spec §8).
pub struct TransportSupervisor {
    active: Mutex<Option<ActiveTransport>>,
    distributor: Arc<EventDistributor>,
    config_bus: Arc<ConfigBus>,
    switch_prev_state: Arc<StdMutex<HashMap<u16, bool>>>,
    generation: Arc<AtomicU64>,
    notifier: Arc<dyn Notifier>,
}

impl TransportSupervisor {
    pub fn new(
        distributor: Arc<EventDistributor>,
        config_bus: Arc<ConfigBus>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            active: Mutex::new(None),
            distributor,
            config_bus,
            switch_prev_state: Arc::new(StdMutex::new(HashMap::new())),
            generation: Arc::new(AtomicU64::new(0)),
            notifier,
        }
    }

    pub fn distributor(&self) -> Arc<EventDistributor> {
        Arc::clone(&self.distributor)
    }

    /// Apply a (possibly new) mapping snapshot, starting, swapping, or
    /// stopping the active transport as needed. Serialized under a single
    /// mutex per spec §4.4.
    pub async fn reload(&self, mapping: &Mapping) -> ReloadOutcome {
        let mut guard = self.active.lock().await;
        self.reload_locked(mapping, &mut guard).await
    }

    async fn reload_locked(
        &self,
        mapping: &Mapping,
        guard: &mut Option<ActiveTransport>,
    ) -> ReloadOutcome {
        let Some(desired_kind) = preferred_kind(mapping) else {
            if let Some(running) = guard.take() {
                running.transport.stop().await;
                running.transport.wait_for_stop(STOP_WAIT_TIMEOUT).await;
            }
            return ReloadOutcome::NoneConfigured;
        };

        let desired_key = connection_key_for(mapping, desired_kind);

        let needs_swap = match guard.as_ref() {
            None => true,
            Some(active) => active.kind != desired_kind || active.connection_key != desired_key,
        };

        if !needs_swap {
            return ReloadOutcome::Running;
        }

        if let Some(running) = guard.take() {
            running.transport.stop().await;
            running.transport.wait_for_stop(STOP_WAIT_TIMEOUT).await;
            tokio::time::sleep(SWAP_SETTLE_DELAY).await;
        }

        self.generation.fetch_add(1, Ordering::SeqCst);

        match self.start_preferred(mapping, desired_kind).await {
            StartOutcome::Started(active) => {
                *guard = Some(active);
                ReloadOutcome::Running
            }
            StartOutcome::FallbackToSse(reason) => {
                tracing::info!(%reason, "serial port missing, falling back to SSE");
                // Serial is missing, not busy: spec §4.4 says try SSE
                // before giving up. Recurse once with SSE preferred by
                // temporarily clearing the serial slot; `guard` is still
                // `None` here since the swap above took it.
                let sse_only = Mapping {
                    connection: crate::mapping::Connection {
                        serial_port: None,
                        ..mapping.connection.clone()
                    },
                    ..mapping.clone()
                };
                Box::pin(self.reload_locked(&sse_only, guard)).await
            }
            StartOutcome::Terminal => {
                self.notifier.notify("serial port busy or permission denied; stopping");
                ReloadOutcome::Terminal
            }
        }
    }

    async fn start_preferred(&self, mapping: &Mapping, kind: ActiveKind) -> StartOutcome {
        let gen_snapshot = self.generation.load(Ordering::SeqCst);
        let generation = Arc::clone(&self.generation);
        let is_active: Arc<dyn Fn() -> bool + Send + Sync> =
            Arc::new(move || generation.load(Ordering::SeqCst) == gen_snapshot);
        let config_rx = self.config_bus.subscribe();

        match kind {
            ActiveKind::Serial => {
                let port = mapping.connection.serial_port.clone().unwrap_or_default();
                let baud = mapping.connection.serial_baud.unwrap_or(9600);
                let transport = Arc::new(SerialTransport::new(
                    port.clone(),
                    baud,
                    is_active,
                    Arc::clone(&self.switch_prev_state),
                    config_rx,
                ));
                self.spawn_and_start(transport, ActiveKind::Serial, format!("{port}@{baud}"), mapping)
                    .await
            }
            ActiveKind::Sse => {
                let url = mapping.connection.sse_url.clone().unwrap_or_default();
                let transport = Arc::new(SseTransport::new(
                    url.clone(),
                    is_active,
                    Arc::clone(&self.switch_prev_state),
                    config_rx,
                ));
                self.spawn_and_start(transport, ActiveKind::Sse, url, mapping).await
            }
        }
    }

    async fn spawn_and_start<T: Transport + 'static>(
        &self,
        transport: Arc<T>,
        kind: ActiveKind,
        connection_key: String,
        mapping: &Mapping,
    ) -> StartOutcome {
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let start_result = transport.start(tx).await;

        match start_result {
            Ok(()) => {
                let distributor = Arc::clone(&self.distributor);
                tokio::spawn(async move {
                    while let Some(event) = rx.recv().await {
                        distributor.distribute(event).await;
                    }
                });
                StartOutcome::Started(ActiveTransport { kind, transport, connection_key })
            }
            Err(err) if err.kind == ErrorKind::TransportMissing && kind == ActiveKind::Serial => {
                if mapping.connection.sse_url.is_some() {
                    StartOutcome::FallbackToSse(err.message)
                } else {
                    StartOutcome::Terminal
                }
            }
            Err(_) => StartOutcome::Terminal,
        }
    }

    /// Stop the active transport and wait for confirmation, used on engine
    /// shutdown.
    pub async fn shutdown(&self) {
        let mut guard = self.active.lock().await;
        if let Some(running) = guard.take() {
            running.transport.stop().await;
            running.transport.wait_for_stop(STOP_WAIT_TIMEOUT).await;
        }
        self.distributor.shutdown().await;
    }

    #[cfg(test)]
    pub async fn is_connected(&self) -> bool {
        self.active.lock().await.as_ref().is_some_and(|a| a.transport.is_connected())
    }

    #[cfg(test)]
    pub async fn active_kind(&self) -> Option<ActiveKind> {
        self.active.lock().await.as_ref().map(|a| a.kind)
    }
}

fn preferred_kind(mapping: &Mapping) -> Option<ActiveKind> {
    if mapping.connection.serial_port.is_some() {
        Some(ActiveKind::Serial)
    } else if mapping.connection.sse_url.is_some() {
        Some(ActiveKind::Sse)
    } else {
        None
    }
}

fn connection_key_for(mapping: &Mapping, kind: ActiveKind) -> String {
    match kind {
        ActiveKind::Serial => format!(
            "{}@{}",
            mapping.connection.serial_port.as_deref().unwrap_or_default(),
            mapping.connection.serial_baud.unwrap_or(9600)
        ),
        ActiveKind::Sse => mapping.connection.sse_url.clone().unwrap_or_default(),
    }
}

#[cfg(test)]
#[path = "supervisor_tests.rs"]
mod tests;
