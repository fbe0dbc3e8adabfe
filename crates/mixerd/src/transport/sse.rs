// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SSE client transport — spec §4.3.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{poll_until_disconnected, StatusCell, Transport, TransportStatus, RETRY_INTERVAL, SSE_IDLE_TIMEOUT};
use crate::config_bus::ConfigSubscriber;
use crate::decoder;
use crate::error::{ErrorKind, MixerError};
use crate::event::Event;
use crate::mapping::Mapping;

pub struct SseTransport {
    url: String,
    status: Arc<StatusCell>,
    stop: Mutex<Option<CancellationToken>>,
    is_active: Arc<dyn Fn() -> bool + Send + Sync>,
    switch_prev_state: Arc<Mutex<HashMap<u16, bool>>>,
    mapping: ConfigSubscriber,
    /// Enforces "exactly one connect attempt in flight" (spec §4.3).
    connecting: Arc<AtomicBool>,
    client: reqwest::Client,
}

impl SseTransport {
    pub fn new(
        url: String,
        is_active: Arc<dyn Fn() -> bool + Send + Sync>,
        switch_prev_state: Arc<Mutex<HashMap<u16, bool>>>,
        mapping: ConfigSubscriber,
    ) -> Self {
        Self {
            url,
            status: Arc::new(StatusCell::new(TransportStatus::Disconnected)),
            stop: Mutex::new(None),
            is_active,
            switch_prev_state,
            mapping,
            connecting: Arc::new(AtomicBool::new(false)),
            client: reqwest::Client::new(),
        }
    }
}

/// Decode one SSE `state` frame's JSON data payload into an [`Event`].
fn decode_frame(
    data: &str,
    mapping: &Mapping,
    switch_prev_state: &Mutex<HashMap<u16, bool>>,
) -> Option<Event> {
    let payload: serde_json::Value = serde_json::from_str(data).ok()?;
    match decoder::decode(&payload, false)? {
        Event::SliderMove { .. } => {
            let event = decoder::decode(&payload, mapping.invert_sliders)?;
            Some(decoder::apply_slider_override(event, &mapping.slider_override, mapping.invert_sliders))
        }
        Event::SwitchChange { switch_id, state, .. } => {
            let mut prev_map = switch_prev_state.lock().unwrap_or_else(|e| e.into_inner());
            let prev = prev_map.get(&switch_id).copied();
            prev_map.insert(switch_id, state);
            Some(decoder::apply_switch_context(
                Event::SwitchChange { switch_id, state, prev_state: None },
                mapping.invert_switches,
                prev,
            ))
        }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&self, event_tx: mpsc::Sender<Event>) -> Result<(), MixerError> {
        self.status.set(TransportStatus::Connecting);

        let token = CancellationToken::new();
        *self.stop.lock().unwrap_or_else(|e| e.into_inner()) = Some(token.clone());

        let url = self.url.clone();
        let status = Arc::clone(&self.status);
        let is_active = Arc::clone(&self.is_active);
        let switch_prev_state = Arc::clone(&self.switch_prev_state);
        let mapping = self.mapping.clone();
        let connecting = Arc::clone(&self.connecting);
        let client = self.client.clone();

        // First attempt happens synchronously so `start()` can surface
        // transport_missing/transport_busy to the supervisor for its
        // fallback decision; reconnects after that run in the background.
        let first = connect_once(&client, &url, &token).await;

        match first {
            Ok(mut stream) => {
                status.set(TransportStatus::Connected);
                tokio::spawn(async move {
                    loop {
                        let disconnect_reason = drive_stream(
                            &mut stream,
                            &event_tx,
                            &status,
                            &mapping,
                            &switch_prev_state,
                            &token,
                        )
                        .await;
                        if disconnect_reason.is_none() {
                            return; // cancelled
                        }
                        status.set(TransportStatus::Disconnected);

                        loop {
                            tokio::select! {
                                _ = token.cancelled() => return,
                                _ = tokio::time::sleep(RETRY_INTERVAL) => {}
                            }
                            if !(is_active)() {
                                return;
                            }
                            if connecting.swap(true, Ordering::SeqCst) {
                                continue; // another connect already in flight
                            }
                            status.set(TransportStatus::Connecting);
                            let attempt = connect_once(&client, &url, &token).await;
                            connecting.store(false, Ordering::SeqCst);
                            match attempt {
                                Ok(new_stream) => {
                                    stream = new_stream;
                                    status.set(TransportStatus::Connected);
                                    break;
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
            Err(kind) => {
                self.status.set(TransportStatus::Disconnected);
                Err(MixerError::new(kind, format!("connect {url}")))
            }
        }
    }

    async fn stop(&self) {
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
        self.url.clone()
    }
}

type FrameStream = std::pin::Pin<
    Box<dyn futures_util::Stream<Item = Result<eventsource_stream::Event, eventsource_stream::EventStreamError<reqwest::Error>>> + Send>,
>;

async fn connect_once(
    client: &reqwest::Client,
    url: &str,
    token: &CancellationToken,
) -> Result<FrameStream, ErrorKind> {
    let request = client.get(url).send();
    let response = tokio::select! {
        _ = token.cancelled() => return Err(ErrorKind::TransportMissing),
        result = request => result,
    };

    let response = response.map_err(|_| ErrorKind::TransportMissing)?;
    if !response.status().is_success() {
        return Err(ErrorKind::TransportMissing);
    }

    let stream = response.bytes_stream().eventsource();
    Ok(Box::pin(stream))
}

/// Drive one connection's frames until idle timeout, stream end, error, or
/// cancellation. Returns `Some(())` on a disconnect that should trigger a
/// reconnect, `None` if the loop exited because of explicit cancellation.
async fn drive_stream(
    stream: &mut FrameStream,
    event_tx: &mpsc::Sender<Event>,
    _status: &StatusCell,
    mapping: &ConfigSubscriber,
    switch_prev_state: &Mutex<HashMap<u16, bool>>,
    token: &CancellationToken,
) -> Option<()> {
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => return None,
            next = tokio::time::timeout(SSE_IDLE_TIMEOUT, stream.next()) => next,
        };

        match next {
            Ok(Some(Ok(frame))) => {
                if frame.event == "state" {
                    let snapshot = mapping.borrow().clone();
                    if let Some(event) = decode_frame(&frame.data, &snapshot, switch_prev_state) {
                        let _ = event_tx.try_send(event);
                    }
                }
                // "ping" and other event types are ignored (keep-alive).
            }
            Ok(Some(Err(_))) => return Some(()), // transport_io
            Ok(None) => return Some(()),          // stream ended
            Err(_elapsed) => return Some(()),     // idle timeout
        }
    }
}

#[cfg(test)]
#[path = "sse_tests.rs"]
mod tests;
