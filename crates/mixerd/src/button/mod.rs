// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Button action engine — spec §4.8.

pub mod engine;
pub mod steps;

pub use engine::ButtonEngine;
pub use steps::{KeystrokeBackend, NullKeystrokeBackend, NullWindowProbe, WindowProbe};
