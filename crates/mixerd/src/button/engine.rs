// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Button press classification and action dispatch — spec §4.8.
//!
//! spec.md's data model (§3) defines only `SliderMove`/`SwitchChange`
//! events; it does not say how a physical button press becomes a
//! single/double/long classification. That timing FSM is this crate's
//! addition (see DESIGN.md), not something the distilled spec specifies:
//! a generation-counter-guarded pair of timers per button, matching the
//! debounce/timer idiom the decoder already uses for switch context.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::MixerError;
use crate::mapping::{Action, ActionKind, Mapping};
use crate::notify::Notifier;

use super::steps::{execute_step, KeystrokeBackend, StepContext, TrackedChild, TrackedKey, WindowProbe};

/// Maximum gap between two presses that still counts as a double press.
pub const DOUBLE_PRESS_WINDOW: Duration = Duration::from_millis(300);
/// Minimum hold duration that counts as a long press.
pub const LONG_PRESS_THRESHOLD: Duration = Duration::from_millis(600);

/// One button's timing state: a generation counter invalidates any timer
/// task spawned for a now-stale press sequence.
struct ButtonTiming {
    generation: AtomicU64,
    pending_single: Mutex<Option<JoinHandle<()>>>,
}

impl ButtonTiming {
    fn new() -> Self {
        Self { generation: AtomicU64::new(0), pending_single: Mutex::new(None) }
    }
}

/// Key for the `running` exclusivity map: a button's action-kind run is
/// exclusive with itself and, when `exclusive` is set on the `Action`,
/// with every other run on the same button.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RunKey {
    button_id: u16,
    action_kind: ActionKind,
}

/// Dispatches button press events into action runs, spec §4.8.
///
/// Lock order is always `running` before `tracked` (spec §5) to avoid a
/// deadlock cycle with [`ButtonEngine::cancel_all`], which must cancel a
/// run while holding `tracked` to kill its children.
pub struct ButtonEngine {
    timings: Mutex<HashMap<u16, Arc<ButtonTiming>>>,
    running: Mutex<HashMap<RunKey, CancellationToken>>,
    tracked_children: Arc<Mutex<HashMap<TrackedKey, Arc<TrackedChild>>>>,
    window_probe: Arc<dyn WindowProbe>,
    keystroke_backend: Arc<dyn KeystrokeBackend>,
    notifier: Arc<dyn Notifier>,
}

impl ButtonEngine {
    pub fn new(
        window_probe: Arc<dyn WindowProbe>,
        keystroke_backend: Arc<dyn KeystrokeBackend>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            timings: Mutex::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            tracked_children: Arc::new(Mutex::new(HashMap::new())),
            window_probe,
            keystroke_backend,
            notifier,
        })
    }

    /// Feed one raw press/release edge for `button_id`. `pressed = true` on
    /// the down edge, `false` on the up edge.
    pub async fn handle_edge(self: &Arc<Self>, button_id: u16, pressed: bool, mapping: Arc<Mapping>) {
        if pressed {
            self.on_press(button_id, mapping).await;
        } else {
            self.on_release(button_id, mapping).await;
        }
    }

    async fn timing_for(&self, button_id: u16) -> Arc<ButtonTiming> {
        let mut timings = self.timings.lock().await;
        Arc::clone(timings.entry(button_id).or_insert_with(|| Arc::new(ButtonTiming::new())))
    }

    async fn on_press(self: &Arc<Self>, button_id: u16, mapping: Arc<Mapping>) {
        let timing = self.timing_for(button_id).await;
        let generation = timing.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // Cancel a pending single-press timer from an earlier down edge —
        // this down edge might complete a double press instead.
        if let Some(handle) = timing.pending_single.lock().await.take() {
            handle.abort();
        }

        let engine = Arc::clone(self);
        let timing_for_long = Arc::clone(&timing);
        tokio::spawn(async move {
            tokio::time::sleep(LONG_PRESS_THRESHOLD).await;
            if timing_for_long.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            engine.dispatch(button_id, ActionKind::Long, &mapping).await;
        });
    }

    async fn on_release(self: &Arc<Self>, button_id: u16, mapping: Arc<Mapping>) {
        let timing = self.timing_for(button_id).await;
        let generation = timing.generation.load(Ordering::SeqCst);

        // A release that lands after the long-press timer already fired
        // for this generation produces no further action.
        let engine = Arc::clone(self);
        let timing_for_double = Arc::clone(&timing);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(DOUBLE_PRESS_WINDOW).await;
            if timing_for_double.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            engine.dispatch(button_id, ActionKind::Single, &mapping).await;
        });

        let mut pending = timing.pending_single.lock().await;
        if let Some(previous) = pending.take() {
            previous.abort();
            // Two releases inside the double-press window: this is the
            // second press. Bump the generation so the queued single/long
            // timers from the first press become no-ops, then dispatch.
            timing.generation.fetch_add(1, Ordering::SeqCst);
            handle.abort();
            drop(pending);
            self.dispatch(button_id, ActionKind::Double, &mapping).await;
            return;
        }
        *pending = Some(handle);
    }

    async fn dispatch(self: &Arc<Self>, button_id: u16, kind: ActionKind, mapping: &Mapping) {
        let Some(action_set) = mapping.button_actions.actions.get(&button_id) else {
            return;
        };
        let Some(action) = action_set.get(kind) else {
            return;
        };
        if action.steps.is_empty() {
            return;
        }

        let run_key = RunKey { button_id, action_kind: kind };
        let cancel = CancellationToken::new();

        {
            let mut running = self.running.lock().await;
            if action.exclusive && running.contains_key(&run_key) {
                // spec §4.8 step 2: an exclusive action with an instance of
                // the same key already running drops the press outright —
                // it does not preempt the in-flight run.
                return;
            }
            if let Some(existing) = running.get(&run_key) {
                existing.cancel();
            }
            running.insert(run_key, cancel.clone());
        }

        let action = action.clone();
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.run_action(button_id, kind, action, cancel).await;
            engine.running.lock().await.remove(&run_key);
        });
    }

    async fn run_action(&self, button_id: u16, kind: ActionKind, action: Action, cancel: CancellationToken) {
        for (step_index, step) in action.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                break;
            }
            let ctx = StepContext {
                tracked_children: Arc::clone(&self.tracked_children),
                window_probe: Arc::clone(&self.window_probe),
                keystroke_backend: Arc::clone(&self.keystroke_backend),
                tracked_key: TrackedKey { button_id, action_kind: kind, step_index },
            };
            if let Err(err) = execute_step(step, &ctx, &cancel).await {
                self.report_step_failure(button_id, step_index, &err);
                break;
            }
        }
    }

    fn report_step_failure(&self, button_id: u16, step_index: usize, err: &MixerError) {
        if err.kind.is_user_facing() {
            self.notifier.notify(&format!(
                "button {button_id} step {step_index} failed: {}",
                err.message
            ));
        } else {
            tracing::warn!(button_id, step_index, error = %err, "button action step failed");
        }
    }

    /// Cancel every in-flight action run and terminate its tracked
    /// children — called on mapping reload when `cancel_on_reload` is set,
    /// and on shutdown (spec §4.8/§5).
    pub async fn cancel_all(&self) {
        let tokens: Vec<CancellationToken> = {
            let running = self.running.lock().await;
            running.values().cloned().collect()
        };
        for token in tokens {
            token.cancel();
        }

        let children: Vec<Arc<TrackedChild>> = {
            let tracked = self.tracked_children.lock().await;
            tracked.values().cloned().collect()
        };
        for child in children {
            child.terminate().await;
        }
        self.tracked_children.lock().await.clear();
    }
}

#[cfg(test)]
#[path = "engine_tests.rs"]
mod tests;
