// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level orchestration — spec §2/§4.4/§4.10. Wires the transport
//! supervisor, session map, button engine, and relay server to a shared
//! [`EventDistributor`] and [`ConfigBus`], and drives the reload and
//! shutdown lifecycle.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::button::{ButtonEngine, NullKeystrokeBackend, NullWindowProbe};
use crate::config::Config;
use crate::config_bus::ConfigBus;
use crate::distributor::EventDistributor;
use crate::event::Event;
use crate::mapping::Mapping;
use crate::notify::{Notifier, TracingNotifier};
use crate::relay::RelayServer;
use crate::session::{NullAudioBackend, NullFocusedProcessSource, SessionMap, SessionRegistry};
use crate::transport::supervisor::{ReloadOutcome, TransportSupervisor};

/// Initialize tracing/logging from config. Uses `try_init` so it's safe to
/// call multiple times (e.g. from tests).
pub fn init_tracing(config: &Config) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let result = match config.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).try_init(),
    };
    drop(result);
}

/// Run the daemon to completion: returns once `shutdown` has been cancelled
/// (by signal, by a reload that leaves no transport configured, or by an
/// unrecoverable setup error) and every task has wound down.
pub async fn run(config: Config) -> anyhow::Result<()> {
    init_tracing(&config);

    let mapping = config.bootstrap_mapping().await?;
    let shutdown = CancellationToken::new();
    let notifier: Arc<dyn Notifier> = Arc::new(TracingNotifier);

    let config_bus = Arc::new(ConfigBus::new(mapping.clone()));
    let distributor = Arc::new(EventDistributor::new());
    let supervisor =
        Arc::new(TransportSupervisor::new(Arc::clone(&distributor), Arc::clone(&config_bus), Arc::clone(&notifier)));

    let registry = Arc::new(SessionRegistry::new(Arc::new(NullAudioBackend::new())));
    registry.log_devices_once().await;
    let session_map = Arc::new(SessionMap::new(Arc::clone(&registry), Arc::new(NullFocusedProcessSource)));
    session_map.refresh(true, &mapping).await;

    let button_engine =
        ButtonEngine::new(Arc::new(NullWindowProbe), Arc::new(NullKeystrokeBackend), Arc::clone(&notifier));

    let relay_server = RelayServer::new();

    spawn_session_map_task(Arc::clone(&session_map), Arc::clone(&config_bus), distributor.subscribe().await, shutdown.clone());
    spawn_button_task(Arc::clone(&button_engine), Arc::clone(&config_bus), distributor.subscribe().await, shutdown.clone());
    tokio::spawn(Arc::clone(&relay_server).run_ingest(distributor.subscribe().await, shutdown.clone()));
    tokio::spawn(Arc::clone(&relay_server).run_ping_ticker(shutdown.clone()));
    tokio::spawn(crate::relay::server::run(
        Arc::clone(&relay_server),
        config.relay_host.clone(),
        config_bus.subscribe(),
        shutdown.clone(),
    ));

    apply_reload(&supervisor, &button_engine, &shutdown, &mapping).await;
    spawn_reload_watch_task(Arc::clone(&supervisor), Arc::clone(&button_engine), Arc::clone(&config_bus), shutdown.clone());

    spawn_mapping_watch_task(Arc::new(config), Arc::clone(&config_bus), shutdown.clone());
    spawn_signal_task(shutdown.clone());

    shutdown.cancelled().await;
    info!("shutting down");
    button_engine.cancel_all().await;
    supervisor.shutdown().await;

    Ok(())
}

/// Apply a mapping to the transport supervisor, honoring
/// `cancel_on_reload` and signaling shutdown when nothing is configured
/// (spec §4.4: "If after reload no transport is configured at all, signal
/// a graceful shutdown").
async fn apply_reload(
    supervisor: &TransportSupervisor,
    button_engine: &Arc<ButtonEngine>,
    shutdown: &CancellationToken,
    mapping: &Mapping,
) {
    if mapping.button_actions.cancel_on_reload {
        button_engine.cancel_all().await;
    }
    match supervisor.reload(mapping).await {
        ReloadOutcome::NoneConfigured => {
            info!("no transport configured, shutting down");
            shutdown.cancel();
        }
        ReloadOutcome::Terminal => warn!("transport reload reached a terminal state"),
        ReloadOutcome::Running => {}
    }
}

fn spawn_session_map_task(
    session_map: Arc<SessionMap>,
    config_bus: Arc<ConfigBus>,
    mut events: tokio::sync::mpsc::Receiver<Event>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    let mapping = config_bus.current();
                    match event {
                        Event::SliderMove { slider_id, percent } => {
                            session_map.handle_slider_move(slider_id, percent, &mapping).await;
                        }
                        Event::SwitchChange { switch_id, state, prev_state } => {
                            session_map.handle_switch_change(switch_id, state, prev_state, &mapping).await;
                        }
                    }
                }
            }
        }
    });
}

/// A button is a switch id declared in `button_actions` (SPEC_FULL design
/// decision, see DESIGN.md): the wire protocol has no separate button
/// event kind, so press/release edges arrive as [`Event::SwitchChange`]
/// and are routed here only when the current mapping claims the id.
fn spawn_button_task(
    button_engine: Arc<ButtonEngine>,
    config_bus: Arc<ConfigBus>,
    mut events: tokio::sync::mpsc::Receiver<Event>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if let Event::SwitchChange { switch_id, state, .. } = event {
                        let mapping = config_bus.current();
                        if mapping.button_actions.actions.contains_key(&switch_id) {
                            button_engine.handle_edge(switch_id, state, mapping).await;
                        }
                    }
                }
            }
        }
    });
}

fn spawn_reload_watch_task(
    supervisor: Arc<TransportSupervisor>,
    button_engine: Arc<ButtonEngine>,
    config_bus: Arc<ConfigBus>,
    shutdown: CancellationToken,
) {
    tokio::spawn(async move {
        let mut config_rx = config_bus.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = config_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let mapping = config_rx.borrow_and_update().clone();
                    apply_reload(&supervisor, &button_engine, &shutdown, &mapping).await;
                }
            }
        }
    });
}

/// Re-read the mapping file on SIGHUP, and on a filesystem change unless
/// `--no-watch` is set. Mirrors the teacher's `driver::log_watch` idiom:
/// `notify` for the filesystem event, a channel-based wake signal, and a
/// loop that treats any wake as "go re-read the file."
fn spawn_mapping_watch_task(config: Arc<Config>, config_bus: Arc<ConfigBus>, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let (wake_tx, mut wake_rx) = tokio::sync::mpsc::channel::<()>(1);
        let _watcher = if config.no_watch {
            None
        } else {
            setup_mapping_watcher(&config.mapping_file, wake_tx)
        };

        let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()).ok();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = wake_rx.recv() => {
                    info!("mapping file changed, reloading");
                }
                _ = async {
                    if let Some(ref mut s) = sighup { s.recv().await } else { std::future::pending().await }
                } => {
                    info!("received SIGHUP, reloading mapping");
                }
            }

            match config.bootstrap_mapping().await {
                Ok(mapping) => config_bus.publish(mapping),
                Err(e) => warn!("mapping reload failed, keeping previous mapping: {e:#}"),
            }
        }
    });
}

fn setup_mapping_watcher(
    path: &std::path::Path,
    wake_tx: tokio::sync::mpsc::Sender<()>,
) -> Option<notify::RecommendedWatcher> {
    use notify::{RecursiveMode, Watcher};

    let mut watcher = notify::recommended_watcher(move |_: notify::Result<notify::Event>| {
        let _ = wake_tx.try_send(());
    })
    .ok()?;

    let watch_path = path.parent().unwrap_or(path);
    watcher.watch(watch_path, RecursiveMode::NonRecursive).ok()?;
    Some(watcher)
}

/// SIGTERM/SIGINT handling: first signal cancels `shutdown` for a graceful
/// stop, a second signal forces an immediate exit. Mirrors the teacher's
/// double-signal escalation in `cli::run::run`.
fn spawn_signal_task(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()).ok();
        let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt()).ok();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => info!("received SIGTERM"),
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => info!("received SIGINT"),
        }
        shutdown.cancel();

        tokio::select! {
            _ = async {
                if let Some(ref mut s) = sigterm { s.recv().await } else { std::future::pending().await }
            } => info!("received SIGTERM again, forcing exit"),
            _ = async {
                if let Some(ref mut s) = sigint { s.recv().await } else { std::future::pending().await }
            } => info!("received SIGINT again, forcing exit"),
        }
        std::process::exit(130);
    });
}
