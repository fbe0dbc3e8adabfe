// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Serial transport — spec §4.2.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch};
use tokio_serial::SerialPortBuilderExt;
use tokio_util::sync::CancellationToken;

use super::{poll_until_disconnected, StatusCell, Transport, TransportStatus, RETRY_INTERVAL};
use crate::config_bus::ConfigSubscriber;
use crate::decoder;
use crate::error::{ErrorKind, MixerError};
use crate::event::Event;
use crate::mapping::Mapping;

// Fixed string literals checked once at startup; see decoder.rs's identical
// pattern-construction precedent for why panicking here is allowed.
#[allow(clippy::panic)]
fn ansi_pattern() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\x1b\[[0-9;]*[a-zA-Z]").unwrap_or_else(|e| panic!("ansi pattern: {e}"))
    })
}

#[allow(clippy::panic)]
fn log_tagged_pattern() -> &'static Regex {
    use std::sync::OnceLock;
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\[[^\]]+\]\[json:\d+\]:\s*(\{.*\})").unwrap_or_else(|e| panic!("log tag pattern: {e}"))
    })
}

/// Strip ANSI escape sequences from a line.
pub fn strip_ansi(line: &str) -> String {
    ansi_pattern().replace_all(line, "").into_owned()
}

/// Extract the JSON payload substring from one (already ANSI-stripped,
/// trimmed) line, per spec §4.2/§6.
pub fn extract_payload(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }
    let captures = log_tagged_pattern().captures(trimmed)?;
    match captures.get(1) {
        Some(m) => Some(m.as_str()),
        None => None,
    }
}

/// Classify a serial port open failure per spec §4.2: busy/permission is
/// terminal, missing-port is recoverable (supervisor may try SSE instead).
fn classify_open_error(err: &tokio_serial::Error) -> ErrorKind {
    use tokio_serial::ErrorKind as SK;
    match err.kind() {
        SK::NoDevice => ErrorKind::TransportMissing,
        SK::Io(io_kind) if *io_kind == std::io::ErrorKind::PermissionDenied => {
            ErrorKind::TransportBusy
        }
        SK::Io(io_kind) if *io_kind == std::io::ErrorKind::NotFound => ErrorKind::TransportMissing,
        _ => ErrorKind::TransportBusy,
    }
}

pub struct SerialTransport {
    port_name: String,
    baud: u32,
    status: Arc<StatusCell>,
    stop: Mutex<Option<CancellationToken>>,
    is_active: Arc<dyn Fn() -> bool + Send + Sync>,
    switch_prev_state: Arc<Mutex<HashMap<u16, bool>>>,
    mapping: ConfigSubscriber,
    running: AtomicBool,
}

impl SerialTransport {
    pub fn new(
        port_name: String,
        baud: u32,
        is_active: Arc<dyn Fn() -> bool + Send + Sync>,
        switch_prev_state: Arc<Mutex<HashMap<u16, bool>>>,
        mapping: ConfigSubscriber,
    ) -> Self {
        Self {
            port_name,
            baud,
            status: Arc::new(StatusCell::new(TransportStatus::Disconnected)),
            stop: Mutex::new(None),
            is_active,
            switch_prev_state,
            mapping,
            running: AtomicBool::new(false),
        }
    }

}

#[async_trait]
impl Transport for SerialTransport {
    async fn start(&self, event_tx: mpsc::Sender<Event>) -> Result<(), MixerError> {
        self.status.set(TransportStatus::Connecting);

        let port = tokio_serial::new(&self.port_name, self.baud)
            .timeout(Duration::from_millis(50))
            .open_native_async();

        let mut port = match port {
            Ok(p) => p,
            Err(e) => {
                let kind = classify_open_error(&e);
                self.status.set(TransportStatus::Disconnected);
                return Err(MixerError::new(kind, format!("open {}: {e}", self.port_name)));
            }
        };

        self.status.set(TransportStatus::Connected);
        self.running.store(true, Ordering::SeqCst);

        let token = CancellationToken::new();
        *self.stop.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());

        let status = Arc::clone(&self.status);
        let is_active = Arc::clone(&self.is_active);
        let switch_prev_state = Arc::clone(&self.switch_prev_state);
        let port_name = self.port_name.clone();
        let baud = self.baud;
        let mapping = self.mapping.clone();

        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut chunk = [0u8; 256];

            'outer: loop {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => {
                            status.set(TransportStatus::Disconnected);
                            return;
                        }
                        result = port.read(&mut chunk) => {
                            match result {
                                Ok(0) => break, // EOF
                                Ok(n) => {
                                    buf.extend_from_slice(&chunk[..n]);
                                    while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                                        let line_bytes: Vec<u8> = buf.drain(..=pos).collect();
                                        let line = String::from_utf8_lossy(&line_bytes).to_string();
                                        if let Some(event) = decode_owned(&port_name, &mapping, &switch_prev_state, &line) {
                                            let _ = event_tx.try_send(event);
                                        }
                                    }
                                }
                                Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                                Err(_) => break,
                            }
                        }
                    }
                }

                status.set(TransportStatus::Disconnected);

                // Mid-stream failure: reconnect at a fixed interval, but
                // bail silently if we're no longer the active transport.
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                    }
                    if !(is_active)() {
                        return;
                    }
                    status.set(TransportStatus::Connecting);
                    match tokio_serial::new(&port_name, baud)
                        .timeout(Duration::from_millis(50))
                        .open_native_async()
                    {
                        Ok(reopened) => {
                            port = reopened;
                            status.set(TransportStatus::Connected);
                            continue 'outer;
                        }
                        Err(_) => {
                            status.set(TransportStatus::Disconnected);
                            continue;
                        }
                    }
                }
            }
        });

        Ok(())
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(token) = self.stop.lock().unwrap_or_else(|e| e.into_inner()).take() {
            token.cancel();
        }
        self.status.set(TransportStatus::Disconnected);
    }

    async fn wait_for_stop(&self, timeout: Duration) -> bool {
        poll_until_disconnected(|| self.status.is_connected(), timeout).await
    }

    fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    fn connection_key(&self) -> String {
        format!("{}@{}", self.port_name, self.baud)
    }
}

/// Free function so the spawned read task doesn't need to capture `&self`.
fn decode_owned(
    _port_name: &str,
    mapping: &watch::Receiver<Arc<Mapping>>,
    switch_prev_state: &Mutex<HashMap<u16, bool>>,
    raw_line: &str,
) -> Option<Event> {
    let stripped = strip_ansi(raw_line);
    let payload_str = extract_payload(&stripped)?;
    let payload: Value = serde_json::from_str(payload_str).ok()?;
    let snapshot = mapping.borrow().clone();

    match decoder::decode(&payload, false)? {
        Event::SliderMove { .. } => {
            let event = decoder::decode(&payload, snapshot.invert_sliders)?;
            Some(decoder::apply_slider_override(event, &snapshot.slider_override, snapshot.invert_sliders))
        }
        Event::SwitchChange { switch_id, state, .. } => {
            let mut prev_map = switch_prev_state.lock().unwrap_or_else(|e| e.into_inner());
            let prev = prev_map.get(&switch_id).copied();
            prev_map.insert(switch_id, state);
            Some(decoder::apply_switch_context(
                Event::SwitchChange { switch_id, state, prev_state: None },
                snapshot.invert_switches,
                prev,
            ))
        }
    }
}

#[cfg(test)]
#[path = "serial_tests.rs"]
mod tests;
