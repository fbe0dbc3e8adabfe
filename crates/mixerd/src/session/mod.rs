// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session layer — spec §4.6/§4.7. [`registry`] owns the rate-limited
//! front door onto the platform audio backend; [`map`] owns the mapping
//! cache, target resolution, and volume/mute application.

pub mod map;
pub mod registry;

pub use map::{FocusedProcessSource, NullFocusedProcessSource, Session, SessionMap};
pub use registry::{AudioBackend, DeviceInfo, NullAudioBackend, SessionHandle, SessionRegistry};
