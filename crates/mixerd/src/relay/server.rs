// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! SSE relay server — spec §4.9. Broadcasts decoded device events to any
//! number of HTTP subscribers, bootstraps each new connection with the
//! current state of every known sensor/switch, and restarts its listener
//! when `relay_port` changes on reload.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::Event as SseEvent;
use axum::response::{IntoResponse, Sse};
use axum::routing::get;
use axum::Router;
use futures_util::stream::{self, Stream, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::config_bus::ConfigSubscriber;
use crate::event::Event as DeviceEvent;

/// Idle keep-alive cadence, spec §4.9: "one `ping` every 10 s".
const PING_INTERVAL: Duration = Duration::from_secs(10);
/// Graceful-shutdown deadline before a forced listener close, spec §4.9.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);
/// SSE reconnect hint sent once per connection, spec §6.
const RETRY_MS: u64 = 30_000;
/// Fixed `ping` metadata payload, spec §6.
const PING_PAYLOAD: &str = r#"{"title":"Mixer","comment":"","ota":false,"log":false,"lang":"en"}"#;
/// Broadcast channel depth; a lagging client drops frames rather than
/// blocking the broadcaster (spec §4.9: "must not block on any one slow
/// client").
const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
enum RelayFrame {
    Ping,
    State { id: String, value: serde_json::Value },
}

/// Shared relay state: the live-broadcast fan-out, the last-known value per
/// sensor/switch id (for new-connection bootstrap), and the monotonic SSE
/// `id:` counter (spec §4.9: "Assign monotonically increasing event IDs").
pub struct RelayServer {
    tx: broadcast::Sender<RelayFrame>,
    known: Mutex<HashMap<String, serde_json::Value>>,
    next_id: AtomicU64,
    /// Pinged by `ingest` so `run_ping_ticker` can restart its idle countdown
    /// on real traffic (spec §4.9: "on every 10 s tick *while idle*").
    activity: tokio::sync::Notify,
}

impl RelayServer {
    pub fn new() -> Arc<Self> {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(Self {
            tx,
            known: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            activity: tokio::sync::Notify::new(),
        })
    }

    /// Apply one upstream device event: record it as the latest known value
    /// for its id and broadcast a `state` frame to every connected client.
    pub async fn ingest(&self, event: &DeviceEvent) {
        let id = event.relay_id();
        let value = event.relay_value();
        self.known.lock().await.insert(id.clone(), value.clone());
        let _ = self.tx.send(RelayFrame::State { id, value });
        self.activity.notify_one();
    }

    /// Drive the EventDistributor subscription into `ingest`, spec §4.9/§5
    /// ("relay server... reacts on subscriber channels").
    pub async fn run_ingest(
        self: Arc<Self>,
        mut events: tokio::sync::mpsc::Receiver<DeviceEvent>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => {
                    match event {
                        Some(event) => self.ingest(&event).await,
                        None => break,
                    }
                }
            }
        }
    }

    /// One ping-ticker task: broadcast a keep-alive after 10 s of silence
    /// (spec §4.9: "on every 10 s tick while idle"). Any `ingest`-driven
    /// traffic resets the countdown, since a `state` frame already keeps the
    /// connection alive on its own.
    pub async fn run_ping_ticker(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(PING_INTERVAL);
        interval.tick().await; // first tick fires immediately; discard it.
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.activity.notified() => {
                    interval.reset();
                }
                _ = interval.tick() => {
                    let _ = self.tx.send(RelayFrame::Ping);
                }
            }
        }
    }

    fn next_event_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    async fn bootstrap_frames(&self) -> Vec<RelayFrame> {
        let known = self.known.lock().await;
        let mut ids: Vec<&String> = known.keys().collect();
        ids.sort();
        let mut frames = vec![RelayFrame::Ping];
        frames.extend(ids.into_iter().map(|id| RelayFrame::State {
            id: id.clone(),
            value: known[id].clone(),
        }));
        frames
    }
}

fn frame_to_sse_event(server_id: u64, frame: RelayFrame) -> SseEvent {
    match frame {
        RelayFrame::Ping => SseEvent::default().id(server_id.to_string()).event("ping").data(PING_PAYLOAD),
        RelayFrame::State { id, value } => SseEvent::default()
            .id(server_id.to_string())
            .event("state")
            .data(serde_json::json!({ "id": id, "value": value }).to_string()),
    }
}

/// Every path serves the same stream, spec §6: "The URL path is not
/// interpreted".
async fn relay_handler(
    State(server): State<Arc<RelayServer>>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let bootstrap = server.bootstrap_frames().await;
    let live = BroadcastStream::new(server.tx.subscribe()).filter_map(|result| async move {
        match result {
            Ok(frame) => Some(frame),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::debug!("relay client lagged by {n} frames");
                None
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    });

    let server_for_ids = Arc::clone(&server);
    let stream = stream::iter(bootstrap).chain(live).enumerate().map(move |(index, frame)| {
        let id = server_for_ids.next_event_id();
        let event = frame_to_sse_event(id, frame);
        // spec §6: "at connect, the server sends `retry: 30000`" — once,
        // attached to the very first frame of the connection.
        Ok(if index == 0 { event.retry(Duration::from_millis(RETRY_MS)) } else { event })
    });

    Sse::new(stream)
}

fn router(server: Arc<RelayServer>) -> Router {
    Router::new()
        .route("/", get(relay_handler))
        .route("/{*path}", get(relay_handler))
        .layer(CorsLayer::permissive())
        .with_state(server)
}

/// Drive the relay listener's lifecycle: bind/rebind on `relay_port`
/// changes (spec §4.9: "Restart-on-port-change"), tear down when the port
/// is set to 0, and stop entirely on `shutdown`.
pub async fn run(
    server: Arc<RelayServer>,
    host: String,
    mut config_rx: ConfigSubscriber,
    shutdown: CancellationToken,
) {
    let mut current_port = config_rx.borrow().connection.relay_port.unwrap_or(0);
    let mut current: Option<(CancellationToken, tokio::task::JoinHandle<()>)> =
        spawn_listener(&server, &host, current_port, &shutdown).await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some((child_cancel, handle)) = current.take() {
                    stop_listener(child_cancel, handle).await;
                }
                break;
            }
            changed = config_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let new_port = config_rx.borrow().connection.relay_port.unwrap_or(0);
                if new_port == current_port {
                    continue;
                }
                current_port = new_port;
                if let Some((child_cancel, handle)) = current.take() {
                    stop_listener(child_cancel, handle).await;
                }
                current = spawn_listener(&server, &host, current_port, &shutdown).await;
            }
        }
    }
}

async fn spawn_listener(
    server: &Arc<RelayServer>,
    host: &str,
    port: u16,
    parent_shutdown: &CancellationToken,
) -> Option<(CancellationToken, tokio::task::JoinHandle<()>)> {
    if port == 0 {
        return None;
    }

    let addr = format!("{host}:{port}");
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::warn!(addr, error = %e, "relay server failed to bind, staying disabled");
            return None;
        }
    };
    tracing::info!(addr, "relay server listening");

    let child_cancel = parent_shutdown.child_token();
    let app = router(Arc::clone(server));
    let serve_cancel = child_cancel.clone();
    let handle = tokio::spawn(async move {
        let result =
            axum::serve(listener, app).with_graceful_shutdown(serve_cancel.cancelled_owned()).await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "relay server exited with error");
        }
    });

    Some((child_cancel, handle))
}

async fn stop_listener(cancel: CancellationToken, handle: tokio::task::JoinHandle<()>) {
    cancel.cancel();
    if tokio::time::timeout(SHUTDOWN_DEADLINE, handle).await.is_err() {
        tracing::warn!("relay listener did not stop within the graceful deadline, abandoning it");
    }
}

#[cfg(test)]
#[path = "server_tests.rs"]
mod tests;
