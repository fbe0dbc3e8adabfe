// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! EventDecoder — spec §4.1. Pure, side-effect-free: turns one message
//! payload into zero or one [`Event`]. Never touches the registry or
//! mapping tables.

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

use crate::event::Event;

// These patterns are fixed string literals checked once at startup; a
// compile failure here is a bug in this file, not a runtime condition, so
// panicking matches the teacher's own `#[allow(clippy::panic)]` precedent
// for infra that cannot fail in practice (`cli/src/rendering_test_support.rs`).
#[allow(clippy::panic)]
fn slider_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^sensor-pot(\d+)$").unwrap_or_else(|e| {
        panic!("static slider id pattern must compile: {e}")
    }))
}

#[allow(clippy::panic)]
fn switch_id_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^binary_sensor-sw(\d+)$").unwrap_or_else(|e| {
        panic!("static switch id pattern must compile: {e}")
    }))
}

/// Decode one payload object into an [`Event`], or `None` if the payload is
/// malformed or its `id` doesn't match a known sensor/switch prefix.
///
/// `invert_sliders` applies the `v ← 1 − v` transform from spec §4.1 before
/// the event is emitted.
pub fn decode(payload: &Value, invert_sliders: bool) -> Option<Event> {
    let obj = payload.as_object()?;
    let id = obj.get("id")?.as_str()?;

    if let Some(caps) = slider_id_pattern().captures(id) {
        let slider_id: u16 = caps.get(1)?.as_str().parse().ok()?;
        let raw = obj.get("value")?.as_f64()?;
        let clamped = raw.clamp(0.0, 100.0);
        let mut percent = (clamped / 100.0) as f32;
        if invert_sliders {
            percent = 1.0 - percent;
        }
        return Some(Event::SliderMove { slider_id, percent: percent.clamp(0.0, 1.0) });
    }

    if let Some(caps) = switch_id_pattern().captures(id) {
        let switch_id: u16 = caps.get(1)?.as_str().parse().ok()?;
        let state = decode_switch_state(obj)?;
        return Some(Event::SwitchChange { switch_id, state, prev_state: None });
    }

    None
}

fn decode_switch_state(obj: &serde_json::Map<String, Value>) -> Option<bool> {
    if let Some(v) = obj.get("value") {
        if let Some(b) = v.as_bool() {
            return Some(b);
        }
    }
    if let Some(s) = obj.get("state").and_then(|v| v.as_str()) {
        return match s.to_ascii_uppercase().as_str() {
            "ON" => Some(true),
            "OFF" => Some(false),
            _ => None,
        };
    }
    None
}

/// Apply `slider_override` (spec §3) to a freshly decoded
/// [`Event::SliderMove`]: the configured percent replaces the live hardware
/// reading for that slider outright, then `invert_sliders` still applies
/// (the override is itself "a percent" entering the same pipeline).
pub fn apply_slider_override(
    event: Event,
    overrides: &std::collections::HashMap<u16, f32>,
    invert_sliders: bool,
) -> Event {
    match event {
        Event::SliderMove { slider_id, percent } => {
            let percent = match overrides.get(&slider_id) {
                Some(&pct_0_100) => {
                    let mut p = (pct_0_100.clamp(0.0, 100.0)) / 100.0;
                    if invert_sliders {
                        p = 1.0 - p;
                    }
                    p.clamp(0.0, 1.0)
                }
                None => percent,
            };
            Event::SliderMove { slider_id, percent }
        }
        other => other,
    }
}

/// Apply `invert_switches` to a freshly decoded [`Event::SwitchChange`],
/// carrying the previous known state forward (the decoder itself is
/// stateless; the transport supervisor tracks `prev_state` per switch id).
pub fn apply_switch_context(event: Event, invert_switches: bool, prev_state: Option<bool>) -> Event {
    match event {
        Event::SwitchChange { switch_id, state, .. } => {
            let state = if invert_switches { !state } else { state };
            Event::SwitchChange { switch_id, state, prev_state }
        }
        other => other,
    }
}

#[cfg(test)]
#[path = "decoder_tests.rs"]
mod tests;
