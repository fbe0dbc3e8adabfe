// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;

use super::*;
use crate::mapping::{Action, ButtonActionSet, ButtonActions, Step};
use crate::notify::NoopNotifier;

use super::super::steps::NullKeystrokeBackend;
use super::super::steps::NullWindowProbe;

fn engine() -> Arc<ButtonEngine> {
    ButtonEngine::new(Arc::new(NullWindowProbe), Arc::new(NullKeystrokeBackend), Arc::new(NoopNotifier))
}

fn mapping_with_delay_actions(single_ms: u64, double_ms: u64, long_ms: u64) -> Arc<Mapping> {
    let mut actions = HashMap::new();
    actions.insert(
        0,
        ButtonActionSet {
            single: Some(Action { exclusive: false, steps: vec![Step::Delay { ms: single_ms }] }),
            double: Some(Action { exclusive: false, steps: vec![Step::Delay { ms: double_ms }] }),
            long: Some(Action { exclusive: false, steps: vec![Step::Delay { ms: long_ms }] }),
        },
    );
    Arc::new(Mapping {
        button_actions: ButtonActions { actions, cancel_on_reload: false },
        ..Mapping::default()
    })
}

#[tokio::test]
async fn quick_press_release_dispatches_single_after_window() {
    let engine = engine();
    let mapping = mapping_with_delay_actions(1, 1, 1);

    engine.handle_edge(0, true, Arc::clone(&mapping)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.handle_edge(0, false, Arc::clone(&mapping)).await;

    tokio::time::sleep(DOUBLE_PRESS_WINDOW + Duration::from_millis(50)).await;

    let running = engine.running.lock().await;
    assert!(running.is_empty(), "single-press run should have finished and been cleared");
}

#[tokio::test]
async fn two_quick_presses_dispatch_double_not_two_singles() {
    let engine = engine();
    let mapping = mapping_with_delay_actions(1, 50, 1);

    engine.handle_edge(0, true, Arc::clone(&mapping)).await;
    engine.handle_edge(0, false, Arc::clone(&mapping)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.handle_edge(0, true, Arc::clone(&mapping)).await;
    engine.handle_edge(0, false, Arc::clone(&mapping)).await;

    // Give the double-press action (50ms delay) time to start running.
    tokio::time::sleep(Duration::from_millis(10)).await;
    {
        let running = engine.running.lock().await;
        assert_eq!(running.len(), 1, "exactly one action should be running (the double press)");
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    let running = engine.running.lock().await;
    assert!(running.is_empty());
}

#[tokio::test]
async fn held_press_past_threshold_dispatches_long() {
    let engine = engine();
    let mapping = mapping_with_delay_actions(1, 1, 1);

    engine.handle_edge(0, true, Arc::clone(&mapping)).await;
    tokio::time::sleep(LONG_PRESS_THRESHOLD + Duration::from_millis(50)).await;

    // By now the long-press timer fired and dispatched (1ms delay action),
    // which should already have completed and cleared from `running`.
    engine.handle_edge(0, false, Arc::clone(&mapping)).await;
    tokio::time::sleep(DOUBLE_PRESS_WINDOW + Duration::from_millis(50)).await;

    let running = engine.running.lock().await;
    assert!(running.is_empty());
}

#[tokio::test]
async fn unmapped_button_press_is_a_no_op() {
    let engine = engine();
    let mapping = Arc::new(Mapping::default());

    engine.handle_edge(7, true, Arc::clone(&mapping)).await;
    engine.handle_edge(7, false, Arc::clone(&mapping)).await;
    tokio::time::sleep(DOUBLE_PRESS_WINDOW + Duration::from_millis(50)).await;

    let running = engine.running.lock().await;
    assert!(running.is_empty());
}

#[tokio::test]
async fn exclusive_action_drops_press_while_same_key_still_running() {
    // spec §4.8 step 2 / §8 invariant 5: "key" is button_id+action_kind (the
    // same key `running` is indexed by). An exclusive action with that key
    // already in flight drops the new press outright — it does not preempt
    // the running one.
    let engine = engine();
    let mut actions = HashMap::new();
    actions.insert(
        0,
        ButtonActionSet {
            single: Some(Action { exclusive: true, steps: vec![Step::Delay { ms: 200 }] }),
            double: None,
            long: None,
        },
    );
    let mapping = Arc::new(Mapping {
        button_actions: ButtonActions { actions, cancel_on_reload: false },
        ..Mapping::default()
    });

    engine.handle_edge(0, true, Arc::clone(&mapping)).await;
    engine.handle_edge(0, false, Arc::clone(&mapping)).await;
    tokio::time::sleep(DOUBLE_PRESS_WINDOW + Duration::from_millis(20)).await;
    {
        let running = engine.running.lock().await;
        assert_eq!(running.len(), 1, "first single-press run should be in flight");
    }

    // A second press while the first is still running must be dropped, not
    // restart the run: the single slot stays owned by the original token.
    let cancel_before = {
        let running = engine.running.lock().await;
        running.values().next().unwrap().clone()
    };
    engine.handle_edge(0, true, Arc::clone(&mapping)).await;
    engine.handle_edge(0, false, Arc::clone(&mapping)).await;
    tokio::time::sleep(DOUBLE_PRESS_WINDOW + Duration::from_millis(20)).await;
    {
        let running = engine.running.lock().await;
        assert_eq!(running.len(), 1, "dropped press must not start a second run");
        assert!(!cancel_before.is_cancelled(), "the in-flight run must not have been cancelled");
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    let running = engine.running.lock().await;
    assert!(running.is_empty(), "original run should finish on its own");
}

#[tokio::test]
async fn non_exclusive_action_restarts_same_key_preempting_prior_run() {
    let engine = engine();
    let mut actions = HashMap::new();
    actions.insert(
        0,
        ButtonActionSet {
            single: Some(Action { exclusive: false, steps: vec![Step::Delay { ms: 500 }] }),
            double: None,
            long: None,
        },
    );
    let mapping = Arc::new(Mapping {
        button_actions: ButtonActions { actions, cancel_on_reload: false },
        ..Mapping::default()
    });

    engine.handle_edge(0, true, Arc::clone(&mapping)).await;
    engine.handle_edge(0, false, Arc::clone(&mapping)).await;
    tokio::time::sleep(DOUBLE_PRESS_WINDOW + Duration::from_millis(20)).await;
    let first_token = {
        let running = engine.running.lock().await;
        assert_eq!(running.len(), 1);
        running.values().next().unwrap().clone()
    };

    engine.handle_edge(0, true, Arc::clone(&mapping)).await;
    engine.handle_edge(0, false, Arc::clone(&mapping)).await;
    tokio::time::sleep(DOUBLE_PRESS_WINDOW + Duration::from_millis(20)).await;

    assert!(first_token.is_cancelled(), "non-exclusive restart should cancel the prior run");
}

#[tokio::test]
async fn cancel_all_terminates_tracked_children() {
    let engine = engine();
    let mut actions = HashMap::new();
    actions.insert(
        0,
        ButtonActionSet {
            single: Some(Action {
                exclusive: false,
                steps: vec![Step::Execute {
                    app: "/bin/sleep".into(),
                    args: vec!["5".into()],
                    wait: false,
                    wait_timeout_ms: 0,
                    wait_window: None,
                }],
            }),
            double: None,
            long: None,
        },
    );
    let mapping = Arc::new(Mapping {
        button_actions: ButtonActions { actions, cancel_on_reload: false },
        ..Mapping::default()
    });

    engine.handle_edge(0, true, Arc::clone(&mapping)).await;
    engine.handle_edge(0, false, Arc::clone(&mapping)).await;
    tokio::time::sleep(DOUBLE_PRESS_WINDOW + Duration::from_millis(50)).await;

    assert_eq!(engine.tracked_children.lock().await.len(), 1);
    engine.cancel_all().await;
    assert!(engine.tracked_children.lock().await.is_empty());
}
