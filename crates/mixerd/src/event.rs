// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The two event kinds emitted by a [`crate::transport::Transport`] after
//! decoding, per spec §3.

use serde::{Deserialize, Serialize};

/// One normalized device event. Ordering within a single `slider_id` /
/// `switch_id` is preserved by the transport; ordering across identifiers is
/// best-effort arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Event {
    SliderMove {
        slider_id: u16,
        /// Clamped to `[0.0, 1.0]`.
        percent: f32,
    },
    SwitchChange {
        switch_id: u16,
        state: bool,
        prev_state: Option<bool>,
    },
}

impl Event {
    /// The sensor identifier this event originated from, used by the
    /// distributor and relay server to key per-sensor state.
    pub fn sensor_id(&self) -> u16 {
        match self {
            Self::SliderMove { slider_id, .. } => *slider_id,
            Self::SwitchChange { switch_id, .. } => *switch_id,
        }
    }

    /// Minimal `{ id, value }` relay payload per spec §4.9/§6.
    pub fn relay_id(&self) -> String {
        match self {
            Self::SliderMove { slider_id, .. } => format!("sensor-pot{slider_id}"),
            Self::SwitchChange { switch_id, .. } => format!("binary_sensor-sw{switch_id}"),
        }
    }

    pub fn relay_value(&self) -> serde_json::Value {
        match self {
            Self::SliderMove { percent, .. } => {
                serde_json::json!((percent * 100.0).round() as i64)
            }
            Self::SwitchChange { state, .. } => serde_json::json!(state),
        }
    }
}
