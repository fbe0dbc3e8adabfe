// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

/// Unified error taxonomy shared across transports, the session map, and the
/// button engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Serial port busy or permission denied. Terminal: surface and stop.
    TransportBusy,
    /// Serial port / SSE URL absent or unreachable. Recoverable: try the
    /// alternate transport, else stop.
    TransportMissing,
    /// Mid-stream I/O failure. Triggers reconnect.
    TransportIo,
    /// A volume/mute call returned a stale-handle signal; forces a refresh.
    SessionRefreshRequired,
    /// Button-engine `Execute` step could not resolve `app`.
    ExecutableNotFound,
    /// A step exceeded its timeout.
    Timeout,
    /// A step failed to execute for a reason other than the above.
    ExecutionFailed,
    /// The platform denied the operation.
    PermissionDenied,
    /// Keystroke/typing synthesis is unavailable on this platform.
    KeystrokeUnavailable,
    /// Decoder-level: payload dropped silently (never surfaced to a user).
    MalformedPayload,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransportBusy => "transport_busy",
            Self::TransportMissing => "transport_missing",
            Self::TransportIo => "transport_io",
            Self::SessionRefreshRequired => "session_refresh_required",
            Self::ExecutableNotFound => "executable_not_found",
            Self::Timeout => "timeout",
            Self::ExecutionFailed => "execution_failed",
            Self::PermissionDenied => "permission_denied",
            Self::KeystrokeUnavailable => "keystroke_unavailable",
            Self::MalformedPayload => "malformed_payload",
        }
    }

    /// Whether this error is a user-facing, notifier-surfaced error (as
    /// opposed to an internal transport/decoder transition).
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::ExecutableNotFound
                | Self::Timeout
                | Self::ExecutionFailed
                | Self::PermissionDenied
                | Self::KeystrokeUnavailable
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tagged error with a human-readable message, surfaced via the
/// [`crate::notify::Notifier`] for user-facing kinds and via `tracing::warn!`
/// for transport-lifecycle kinds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixerError {
    pub kind: ErrorKind,
    pub message: String,
}

impl MixerError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

impl fmt::Display for MixerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for MixerError {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
