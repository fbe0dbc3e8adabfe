// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Spawns the real `mixerd` binary as a subprocess, drives it through a
//! mapping file and signals, and observes it over the relay SSE stream —
//! the only externally observable surface the daemon exposes.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::Once;
use std::time::Duration;

use futures_util::StreamExt;

static CRYPTO_INIT: Once = Once::new();

/// Install the ring crypto provider for reqwest/rustls.
/// Safe to call multiple times — only the first call has effect.
pub fn ensure_crypto() {
    CRYPTO_INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Resolve the path to the compiled `mixerd` binary.
pub fn mixerd_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("mixerd")
}

/// Find a free TCP port by binding to :0 then releasing.
pub fn free_port() -> anyhow::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

/// A running `mixerd` process that is killed on drop.
pub struct MixerdProcess {
    child: Child,
    relay_port: u16,
    mapping_path: PathBuf,
    _dir: tempfile::TempDir,
}

impl MixerdProcess {
    /// Write `mapping` to a fresh tempdir and spawn `mixerd` against it,
    /// with filesystem watching disabled (reload is driven explicitly via
    /// [`MixerdProcess::reload`] / SIGHUP in these tests).
    ///
    /// `mapping`'s `connection.relay_port` governs the relay's bound port:
    /// the `--relay-port` CLI flag is deliberately left unset here, since
    /// `Config::bootstrap_mapping` has flags win over the file on every
    /// reload (spec §6) — a fixed CLI override would make the relay-port
    /// reload scenario untestable.
    pub fn start(mapping: &serde_json::Value) -> anyhow::Result<Self> {
        ensure_crypto();
        let binary = mixerd_binary();
        anyhow::ensure!(binary.exists(), "mixerd binary not found at {}", binary.display());

        let relay_port = mapping["connection"]["relay_port"]
            .as_u64()
            .ok_or_else(|| anyhow::anyhow!("mapping must set connection.relay_port"))? as u16;

        let dir = tempfile::tempdir()?;
        let mapping_path = dir.path().join("mapping.json");
        write_mapping(&mapping_path, mapping)?;

        let child = Command::new(&binary)
            .arg("--mapping-file")
            .arg(&mapping_path)
            .arg("--relay-host")
            .arg("127.0.0.1")
            .arg("--log-format")
            .arg("text")
            .arg("--log-level")
            .arg("warn")
            .arg("--no-watch")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        Ok(Self { child, relay_port, mapping_path, _dir: dir })
    }

    pub fn relay_url(&self) -> String {
        format!("http://127.0.0.1:{}/", self.relay_port)
    }

    /// Overwrite the mapping file and signal `SIGHUP` to pick it up.
    pub fn reload(&self, mapping: &serde_json::Value) -> anyhow::Result<()> {
        write_mapping(&self.mapping_path, mapping)?;
        self.signal(nix::sys::signal::Signal::SIGHUP)
    }

    pub fn signal(&self, sig: nix::sys::signal::Signal) -> anyhow::Result<()> {
        let pid = nix::unistd::Pid::from_raw(self.child.id() as i32);
        nix::sys::signal::kill(pid, sig)?;
        Ok(())
    }

    /// Wait for the process to exit within `timeout`.
    pub async fn wait_exit(&mut self, timeout: Duration) -> anyhow::Result<std::process::ExitStatus> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if tokio::time::Instant::now() > deadline {
                anyhow::bail!("mixerd did not exit within {timeout:?}");
            }
            if let Some(status) = self.child.try_wait()? {
                return Ok(status);
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// True if the process is still running.
    pub fn is_alive(&mut self) -> anyhow::Result<bool> {
        Ok(self.child.try_wait()?.is_none())
    }
}

impl Drop for MixerdProcess {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn write_mapping(path: &Path, mapping: &serde_json::Value) -> anyhow::Result<()> {
    let mut file = std::fs::File::create(path)?;
    file.write_all(serde_json::to_string_pretty(mapping)?.as_bytes())?;
    Ok(())
}

/// One parsed relay SSE frame: event name (defaults to "message" when the
/// server omits it) and payload.
#[derive(Debug, Clone)]
pub struct RelayFrame {
    pub event: String,
    pub data: String,
    pub retry: Option<Duration>,
}

/// Connect to a relay SSE endpoint and collect the first `count` frames,
/// failing if they don't arrive within `timeout`.
pub async fn collect_relay_frames(
    url: &str,
    count: usize,
    timeout: Duration,
) -> anyhow::Result<Vec<RelayFrame>> {
    use eventsource_stream::Eventsource;

    ensure_crypto();
    let response = reqwest::get(url).await?;
    anyhow::ensure!(response.status().is_success(), "relay returned {}", response.status());

    let mut stream = response.bytes_stream().eventsource();
    let mut frames = Vec::with_capacity(count);

    let collect = async {
        while frames.len() < count {
            let Some(next) = stream.next().await else { break };
            let frame = next?;
            frames.push(RelayFrame {
                event: frame.event,
                data: frame.data,
                retry: frame.retry,
            });
        }
        Ok::<_, eventsource_stream::EventStreamError<reqwest::Error>>(())
    };

    tokio::time::timeout(timeout, collect).await.map_err(|_| {
        anyhow::anyhow!("relay produced only {} of {count} expected frames within {timeout:?}", frames.len())
    })??;

    Ok(frames)
}

/// A minimal hand-rolled SSE device: accepts one connection, writes a
/// `200 OK` / `text/event-stream` response, then streams whatever frames
/// are sent over `frame_rx` until the socket closes. Stands in for real
/// mixer hardware so the SSE transport path can be exercised end-to-end
/// without a device.
pub async fn spawn_fake_sse_device(
    mut frame_rx: tokio::sync::mpsc::Receiver<String>,
) -> anyhow::Result<(u16, tokio::task::JoinHandle<()>)> {
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    let handle = tokio::spawn(async move {
        let Ok((mut socket, _)) = listener.accept().await else { return };
        let header = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nTransfer-Encoding: chunked\r\n\r\n";
        if socket.write_all(header.as_bytes()).await.is_err() {
            return;
        }
        // The body is unbounded, so it's framed as HTTP/1.1 chunked
        // transfer-encoding rather than relying on a Content-Length the
        // server can't know in advance.
        while let Some(frame) = frame_rx.recv().await {
            let chunk = format!("{:x}\r\n{frame}\r\n", frame.len());
            if socket.write_all(chunk.as_bytes()).await.is_err() {
                return;
            }
        }
    });

    Ok((port, handle))
}

/// Format one `state` SSE frame the way a device would emit it.
pub fn device_state_frame(id: &str, value: serde_json::Value) -> String {
    let payload = serde_json::json!({ "id": id, "value": value });
    format!("event: state\ndata: {payload}\n\n")
}
