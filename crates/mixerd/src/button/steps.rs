// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Step-type semantics — spec §4.8. `Execute` spawning and process tracking
//! are in scope; window inspection and keystroke/type synthesis are
//! out-of-scope external collaborators (spec §1: "platform-specific
//! process-window inspection and keystroke/type synthesis"), reached
//! through [`WindowProbe`] and [`KeystrokeBackend`].

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorKind, MixerError};
use crate::mapping::{ActionKind, Step, WaitWindow};

/// Short, non-blocking poll for window readiness (spec §4.8: "≤ 100 ms
/// non-blocking probe"). Out-of-scope per spec §1; the real implementation
/// enumerates OS windows and inspects their owning process.
#[async_trait]
pub trait WindowProbe: Send + Sync {
    /// One probe attempt. `pid` is the spawned process if still alive, or
    /// `None` if it already exited ("launcher" mode, spec §4.8/§9).
    /// `title_contains` optionally filters by a substring of the window
    /// title. Returns whether a ready window was found on *this* attempt.
    async fn probe_once(&self, pid: Option<u32>, title_contains: Option<&str>) -> bool;
}

/// Always reports "not ready" — window enumeration is unavailable without a
/// platform implementation.
pub struct NullWindowProbe;

#[async_trait]
impl WindowProbe for NullWindowProbe {
    async fn probe_once(&self, _pid: Option<u32>, _title_contains: Option<&str>) -> bool {
        false
    }
}

/// Platform keystroke/type synthesis, out of scope per spec §1.
#[async_trait]
pub trait KeystrokeBackend: Send + Sync {
    async fn press_key(&self, key: &str) -> Result<(), MixerError>;
    async fn release_key(&self, key: &str) -> Result<(), MixerError>;
    async fn tap_key(&self, key: &str) -> Result<(), MixerError>;
    /// Acquire the foreground window and confirm it can accept input
    /// (spec §4.8 Typing: "verify input readiness, ≤ 100 ms probe").
    async fn acquire_foreground_window(&self) -> Result<(), MixerError>;
    async fn type_char(&self, ch: char) -> Result<(), MixerError>;
}

/// Always reports `keystroke_unavailable` — synthesis is unavailable
/// without a platform implementation (spec §4.8/§7).
pub struct NullKeystrokeBackend;

fn unavailable() -> MixerError {
    MixerError::new(ErrorKind::KeystrokeUnavailable, "keystroke/typing synthesis unavailable on this platform")
}

#[async_trait]
impl KeystrokeBackend for NullKeystrokeBackend {
    async fn press_key(&self, _key: &str) -> Result<(), MixerError> {
        Err(unavailable())
    }
    async fn release_key(&self, _key: &str) -> Result<(), MixerError> {
        Err(unavailable())
    }
    async fn tap_key(&self, _key: &str) -> Result<(), MixerError> {
        Err(unavailable())
    }
    async fn acquire_foreground_window(&self) -> Result<(), MixerError> {
        Err(unavailable())
    }
    async fn type_char(&self, _ch: char) -> Result<(), MixerError> {
        Err(unavailable())
    }
}

/// Key under which `tracked_children` (spec §3) holds a spawned, untracked
/// `wait == false` child alive across the rest of the action's steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackedKey {
    pub button_id: u16,
    pub action_kind: ActionKind,
    pub step_index: usize,
}

/// One live, detached child process under [`ButtonEngine`](super::engine::ButtonEngine)'s care.
pub struct TrackedChild {
    child: Mutex<Child>,
    pid: Option<u32>,
}

impl TrackedChild {
    fn new(child: Child) -> Self {
        let pid = child.id();
        Self { child: Mutex::new(child), pid }
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Terminate-then-confirm-exited (spec §5/§8.6): SIGTERM, poll for
    /// exit, escalate to SIGKILL, wait for the reap.
    pub async fn terminate(&self) {
        let mut child = self.child.lock().await;
        if let Some(pid) = self.pid {
            let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }
        let waited = tokio::time::timeout(Duration::from_millis(500), child.wait()).await;
        if waited.is_err() {
            if let Some(pid) = self.pid {
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
            let _ = child.wait().await;
        }
    }
}

pub struct StepContext {
    pub tracked_children: Arc<Mutex<HashMap<TrackedKey, Arc<TrackedChild>>>>,
    pub window_probe: Arc<dyn WindowProbe>,
    pub keystroke_backend: Arc<dyn KeystrokeBackend>,
    pub tracked_key: TrackedKey,
}

/// Resolve `app` per spec §4.8: absolute paths must exist, relative names
/// are searched on the host `PATH`.
fn resolve_executable(app: &str) -> Option<std::path::PathBuf> {
    let path = Path::new(app);
    if path.is_absolute() {
        return path.exists().then(|| path.to_path_buf());
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(app);
        if candidate.is_file() {
            return Some(candidate);
        }
        #[cfg(windows)]
        {
            let with_exe = dir.join(format!("{app}.exe"));
            if with_exe.is_file() {
                return Some(with_exe);
            }
        }
    }
    None
}

/// Translate the four escape sequences spec §4.8 Typing names.
fn translate_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('n') => {
                out.push('\n');
                chars.next();
            }
            Some('r') => {
                out.push('\r');
                chars.next();
            }
            Some('t') => {
                out.push('\t');
                chars.next();
            }
            Some('\\') => {
                out.push('\\');
                chars.next();
            }
            _ => out.push('\\'),
        }
    }
    out
}

/// Known modifier names for the Keystroke step, spec §4.8.
fn is_known_modifier(name: &str) -> bool {
    matches!(name, "ctrl" | "control" | "alt" | "shift" | "meta" | "cmd" | "win" | "super")
}

/// Named keys this system recognizes for Keystroke's final key, grounded in
/// the teacher's key-name table (`transport::encode_key` analogue) plus
/// single printable characters.
fn is_known_key_name(name: &str) -> bool {
    if name.chars().count() == 1 {
        return true;
    }
    matches!(
        name,
        "enter" | "return" | "tab" | "escape" | "esc" | "backspace" | "delete" | "del" | "up"
            | "down" | "left" | "right" | "home" | "end" | "pageup" | "page_up" | "pagedown"
            | "page_down" | "insert" | "space" | "f1" | "f2" | "f3" | "f4" | "f5" | "f6" | "f7"
            | "f8" | "f9" | "f10" | "f11" | "f12"
    )
}

/// Execute one step. Returns `Ok(())` on success or benign skip; `Err`
/// carries the taxonomy kind from spec §7.
pub async fn execute_step(
    step: &Step,
    ctx: &StepContext,
    cancel: &CancellationToken,
) -> Result<(), MixerError> {
    match step {
        Step::Execute { app, args, wait, wait_timeout_ms, wait_window } => {
            execute_program(app, args, *wait, *wait_timeout_ms, wait_window.as_ref(), ctx, cancel)
                .await
        }
        Step::Delay { ms } => delay(*ms, cancel).await,
        Step::Keystroke { keys } => keystroke(keys, ctx, cancel).await,
        Step::Typing { text, char_delay_ms } => typing(text, *char_delay_ms, ctx, cancel).await,
    }
}

async fn execute_program(
    app: &str,
    args: &[String],
    wait: bool,
    wait_timeout_ms: u64,
    wait_window: Option<&WaitWindow>,
    ctx: &StepContext,
    cancel: &CancellationToken,
) -> Result<(), MixerError> {
    let Some(resolved) = resolve_executable(app) else {
        return Err(MixerError::new(
            ErrorKind::ExecutableNotFound,
            format!("could not find executable: {app}"),
        ));
    };

    let mut command = tokio::process::Command::new(&resolved);
    command.args(args);
    let child = command
        .spawn()
        .map_err(|e| MixerError::new(ErrorKind::ExecutionFailed, format!("spawn {app}: {e}")))?;

    if wait {
        return wait_for_child(child, wait_timeout_ms, cancel).await;
    }

    let pid = child.id();
    let tracked = Arc::new(TrackedChild::new(child));
    ctx.tracked_children.lock().await.insert(ctx.tracked_key, Arc::clone(&tracked));

    if let Some(window) = wait_window {
        poll_for_window(&tracked, pid, window, ctx, cancel).await?;
    }

    Ok(())
}

async fn wait_for_child(
    mut child: Child,
    timeout_ms: u64,
    cancel: &CancellationToken,
) -> Result<(), MixerError> {
    let pid = child.id();

    let outcome = if timeout_ms == 0 {
        tokio::select! {
            _ = cancel.cancelled() => None,
            result = child.wait() => Some(result),
        }
    } else {
        tokio::select! {
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(Duration::from_millis(timeout_ms)) => None,
            result = child.wait() => Some(result),
        }
    };

    match outcome {
        Some(result) => result
            .map(|_| ())
            .map_err(|e| MixerError::new(ErrorKind::ExecutionFailed, e.to_string())),
        None => {
            if let Some(pid) = pid {
                let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                if tokio::time::timeout(Duration::from_millis(500), child.wait()).await.is_err() {
                    let _ = signal::kill(Pid::from_raw(pid as i32), Signal::SIGKILL);
                    let _ = child.wait().await;
                }
            }
            if cancel.is_cancelled() {
                Err(MixerError::new(ErrorKind::ExecutionFailed, "cancelled"))
            } else {
                Err(MixerError::new(ErrorKind::Timeout, "execute step timed out"))
            }
        }
    }
}

async fn poll_for_window(
    tracked: &TrackedChild,
    spawned_pid: Option<u32>,
    window: &WaitWindow,
    ctx: &StepContext,
    cancel: &CancellationToken,
) -> Result<(), MixerError> {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(window.timeout_ms);
    loop {
        if cancel.is_cancelled() {
            tracked.terminate().await;
            return Err(MixerError::new(ErrorKind::ExecutionFailed, "cancelled"));
        }
        if tokio::time::Instant::now() >= deadline {
            tracked.terminate().await;
            return Err(MixerError::new(ErrorKind::Timeout, "timed out waiting for window"));
        }

        // "launcher" mode (spec §4.8/§9): once the spawned process has
        // already exited, accept any foreground window.
        let pid_for_probe = if process_alive(spawned_pid) { spawned_pid } else { None };

        let probe = tokio::time::timeout(
            Duration::from_millis(100),
            ctx.window_probe.probe_once(pid_for_probe, window.title_contains.as_deref()),
        )
        .await;

        if matches!(probe, Ok(true)) {
            return Ok(());
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_millis(50)) => {}
        }
    }
}

fn process_alive(pid: Option<u32>) -> bool {
    match pid {
        Some(pid) => signal::kill(Pid::from_raw(pid as i32), None).is_ok(),
        None => false,
    }
}

async fn delay(ms: u64, cancel: &CancellationToken) -> Result<(), MixerError> {
    if ms == 0 {
        return Ok(());
    }
    tokio::select! {
        _ = cancel.cancelled() => Err(MixerError::new(ErrorKind::ExecutionFailed, "cancelled")),
        _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(()),
    }
}

async fn keystroke(keys: &str, ctx: &StepContext, cancel: &CancellationToken) -> Result<(), MixerError> {
    let parts: Vec<&str> = keys.split('+').collect();
    let Some((&main_key, modifiers)) = parts.split_last() else {
        return Ok(());
    };

    if !is_known_key_name(&main_key.to_lowercase())
        || modifiers.iter().any(|m| !is_known_modifier(&m.to_lowercase()))
    {
        tracing::debug!(keys, "unknown key name in sequence, skipping step");
        return Ok(());
    }

    for m in modifiers {
        if cancel.is_cancelled() {
            return Err(MixerError::new(ErrorKind::ExecutionFailed, "cancelled"));
        }
        ctx.keystroke_backend.press_key(m).await?;
    }
    let tap_result = ctx.keystroke_backend.tap_key(main_key).await;
    for m in modifiers.iter().rev() {
        let _ = ctx.keystroke_backend.release_key(m).await;
    }
    tap_result
}

async fn typing(
    text: &str,
    char_delay_ms: u64,
    ctx: &StepContext,
    cancel: &CancellationToken,
) -> Result<(), MixerError> {
    tokio::time::timeout(Duration::from_millis(100), ctx.keystroke_backend.acquire_foreground_window())
        .await
        .map_err(|_| MixerError::new(ErrorKind::Timeout, "foreground window not ready"))??;

    let translated = translate_escapes(text);
    let delay_ms = char_delay_ms.max(1);
    for ch in translated.chars() {
        if cancel.is_cancelled() {
            return Err(MixerError::new(ErrorKind::ExecutionFailed, "cancelled"));
        }
        ctx.keystroke_backend.type_char(ch).await?;
        tokio::select! {
            _ = cancel.cancelled() => return Err(MixerError::new(ErrorKind::ExecutionFailed, "cancelled")),
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "steps_tests.rs"]
mod tests;
