// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that spawn the real `mixerd` binary and drive it
//! through its only external surfaces: the mapping file, signals, and the
//! relay SSE stream.

use std::time::Duration;

use mixerd_specs::{collect_relay_frames, device_state_frame, free_port, spawn_fake_sse_device, MixerdProcess};
use nix::sys::signal::Signal;
use serde_json::json;

const TIMEOUT: Duration = Duration::from_secs(10);

/// A mapping with a relay port and a configured-but-unreachable serial
/// port: the supervisor reaches `Terminal`, not `NoneConfigured`, so the
/// process stays alive with its relay server up (spec §4.4/§9).
fn mapping_with_bogus_serial(relay_port: u16) -> serde_json::Value {
    json!({
        "connection": {
            "serial_port": "/dev/mixerd-test-nonexistent",
            "relay_port": relay_port,
        }
    })
}

// -- Relay bootstrap (Scenario E, partial) -------------------------------------

#[tokio::test]
async fn relay_bootstrap_sends_retry_then_ping() -> anyhow::Result<()> {
    let mixerd = MixerdProcess::start(&mapping_with_bogus_serial(free_port()?))?;

    let frames = collect_relay_frames(&mixerd.relay_url(), 1, TIMEOUT).await?;
    assert_eq!(frames[0].event, "ping");
    assert_eq!(frames[0].retry, Some(Duration::from_millis(30_000)));

    Ok(())
}

// -- Relay broadcast (Scenario E, full) ----------------------------------------

#[tokio::test]
async fn relay_relays_upstream_slider_move() -> anyhow::Result<()> {
    let (frame_tx, frame_rx) = tokio::sync::mpsc::channel(8);
    let (device_port, _device) = spawn_fake_sse_device(frame_rx).await?;

    let mapping = json!({
        "connection": {
            "sse_url": format!("http://127.0.0.1:{device_port}/events"),
            "relay_port": free_port()?,
        }
    });
    let mixerd = MixerdProcess::start(&mapping)?;

    // Bootstrap: just a ping (no known sensors yet). Then push an upstream
    // slider move through the fake device and expect it relayed as `state`.
    let bootstrap = collect_relay_frames(&mixerd.relay_url(), 1, TIMEOUT).await?;
    assert_eq!(bootstrap[0].event, "ping");

    frame_tx.send(device_state_frame("sensor-pot2", json!(81))).await?;

    let relayed = collect_relay_frames(&mixerd.relay_url(), 1, TIMEOUT).await?;
    assert_eq!(relayed[0].event, "state");
    let data: serde_json::Value = serde_json::from_str(&relayed[0].data)?;
    assert_eq!(data["id"], "sensor-pot2");
    assert_eq!(data["value"], 81);

    Ok(())
}

// -- Graceful shutdown on no transport configured ------------------------------

#[tokio::test]
async fn process_shuts_down_when_no_transport_is_configured() -> anyhow::Result<()> {
    let mapping = json!({ "connection": { "relay_port": free_port()? } });
    let mut mixerd = MixerdProcess::start(&mapping)?;
    let status = mixerd.wait_exit(TIMEOUT).await?;
    assert!(status.success(), "expected a clean exit, got {status:?}");
    Ok(())
}

// -- Signal handling ------------------------------------------------------------

#[tokio::test]
async fn sigterm_triggers_graceful_shutdown() -> anyhow::Result<()> {
    let mut mixerd = MixerdProcess::start(&mapping_with_bogus_serial(free_port()?))?;
    // Confirm it's actually up before asking it to stop.
    let _ = collect_relay_frames(&mixerd.relay_url(), 1, TIMEOUT).await?;

    mixerd.signal(Signal::SIGTERM)?;
    let status = mixerd.wait_exit(TIMEOUT).await?;
    assert!(status.success(), "expected a clean exit after SIGTERM, got {status:?}");
    Ok(())
}

// -- Mapping reload (Scenario F surface: relay restarts on port change) -------

#[tokio::test]
async fn sighup_reload_restarts_relay_on_port_change() -> anyhow::Result<()> {
    let mixerd = MixerdProcess::start(&mapping_with_bogus_serial(free_port()?))?;
    let _ = collect_relay_frames(&mixerd.relay_url(), 1, TIMEOUT).await?;

    let new_port = free_port()?;
    let reloaded = mapping_with_bogus_serial(new_port);
    mixerd.reload(&reloaded)?;

    let new_url = format!("http://127.0.0.1:{new_port}/");
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("relay never came up on the new port after reload");
        }
        if collect_relay_frames(&new_url, 1, Duration::from_millis(500)).await.is_ok() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Ok(())
}

// -- Button action end-to-end (Scenario-F-style: a real step executes) -------

#[tokio::test]
async fn button_single_press_executes_action() -> anyhow::Result<()> {
    let (frame_tx, frame_rx) = tokio::sync::mpsc::channel(8);
    let (device_port, _device) = spawn_fake_sse_device(frame_rx).await?;

    let marker_dir = tempfile::tempdir()?;
    let marker = marker_dir.path().join("pressed");

    let mapping = json!({
        "connection": {
            "sse_url": format!("http://127.0.0.1:{device_port}/events"),
            "relay_port": free_port()?,
        },
        "button_actions": {
            "actions": {
                "5": {
                    "single": {
                        "steps": [
                            { "type": "execute", "app": "touch", "args": [marker.to_string_lossy().into_owned()], "wait": true }
                        ]
                    }
                }
            }
        }
    });
    let _mixerd = MixerdProcess::start(&mapping)?;

    frame_tx.send(device_state_frame("binary_sensor-sw5", json!(true))).await?;
    frame_tx.send(device_state_frame("binary_sensor-sw5", json!(false))).await?;

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if marker.exists() {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("button action never created the marker file");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    Ok(())
}
