// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Immutable mapping snapshots (spec §3) and the narrow `MappingSource`
//! contract that feeds the reload pipeline (SPEC_FULL §4.10a).

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Step types for button actions, spec §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Execute {
        app: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        wait: bool,
        #[serde(default)]
        wait_timeout_ms: u64,
        #[serde(default)]
        wait_window: Option<WaitWindow>,
    },
    Delay {
        ms: u64,
    },
    Keystroke {
        keys: String,
    },
    Typing {
        text: String,
        #[serde(default = "default_char_delay_ms")]
        char_delay_ms: u64,
    },
}

fn default_char_delay_ms() -> u64 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitWindow {
    pub timeout_ms: u64,
    #[serde(default)]
    pub title_contains: Option<String>,
}

/// One button action: exclusivity flag plus an ordered step sequence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Action {
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// The three press kinds a button can map, spec §3.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ButtonActionSet {
    #[serde(default)]
    pub single: Option<Action>,
    #[serde(default)]
    pub double: Option<Action>,
    #[serde(default)]
    pub long: Option<Action>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Single,
    Double,
    Long,
}

impl ButtonActionSet {
    pub fn get(&self, kind: ActionKind) -> Option<&Action> {
        match kind {
            ActionKind::Single => self.single.as_ref(),
            ActionKind::Double => self.double.as_ref(),
            ActionKind::Long => self.long.as_ref(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ButtonActions {
    #[serde(default)]
    pub actions: HashMap<u16, ButtonActionSet>,
    #[serde(default)]
    pub cancel_on_reload: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Connection {
    #[serde(default)]
    pub serial_port: Option<String>,
    #[serde(default)]
    pub serial_baud: Option<u32>,
    #[serde(default)]
    pub sse_url: Option<String>,
    #[serde(default)]
    pub relay_port: Option<u16>,
}

/// Immutable snapshot of all configuration published by the [`crate::config_bus::ConfigBus`].
/// Swapped atomically on reload; shared-read, never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Mapping {
    #[serde(default)]
    pub slider_mapping: HashMap<u16, Vec<String>>,
    #[serde(default)]
    pub switch_mapping: HashMap<u16, Vec<String>>,
    #[serde(default)]
    pub button_actions: ButtonActions,
    #[serde(default)]
    pub connection: Connection,
    #[serde(default)]
    pub invert_sliders: bool,
    #[serde(default)]
    pub invert_switches: bool,
    /// `slider_id -> percent_0_100`, applied in place of the live hardware
    /// reading for that slider.
    #[serde(default)]
    pub slider_override: HashMap<u16, f32>,
}

/// Narrow external-loader contract (SPEC_FULL §4.10a). Parsing itself is
/// out of scope; this is only the trigger/snapshot half.
#[async_trait]
pub trait MappingSource: Send + Sync {
    async fn load(&self) -> anyhow::Result<Mapping>;
}

/// File-backed [`MappingSource`] — deserializes the documented JSON
/// configuration surface (spec §6) via `serde_json`.
pub struct FileMappingSource {
    pub path: PathBuf,
}

impl FileMappingSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl MappingSource for FileMappingSource {
    async fn load(&self) -> anyhow::Result<Mapping> {
        let contents = tokio::fs::read_to_string(&self.path).await?;
        let mapping: Mapping = serde_json::from_str(&contents)?;
        Ok(mapping)
    }
}

#[cfg(test)]
#[path = "mapping_tests.rs"]
mod tests;
