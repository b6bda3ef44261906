//! Error taxonomy for the bridge and its collaborators.
//!
//! Errors are split by layer: [`PtyError`] for the PTY engine,
//! [`TransportError`] for the GATT layer, [`ScriptError`] for the Lua
//! runtime, and [`BridgeError`] as the umbrella the orchestrator returns.
//!
//! Ring-buffer overflow is deliberately absent: dropped bytes and records
//! are accounted for in stats and record flags, never raised as errors.

use thiserror::Error;

/// Errors from the PTY I/O engine.
#[derive(Debug, Error)]
pub enum PtyError {
    /// Operation attempted on a closed engine.
    #[error("pty engine closed")]
    Closed,

    /// Non-blocking read found no data; retryable.
    #[error("no data available")]
    WouldBlock,

    /// Underlying OS error with errno preserved.
    #[error("pty i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from the GATT transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Operation did not complete within its deadline.
    #[error("operation timed out")]
    Timeout,

    /// The peripheral disconnected.
    #[error("peripheral disconnected")]
    Disconnected,

    /// Protocol-level failure (GATT error response, malformed data).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The OS denied access to the adapter or device.
    #[error("permission denied: {0}")]
    Permission(String),

    /// No such device, service, or characteristic.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Errors from the script runtime.
///
/// `Fatal` means the script is unusable and the bridge must terminate.
/// `NonFatal` is a soft failure (the script asked to be retried with more
/// data); the caller logs it and continues.
#[derive(Debug, Error)]
pub enum ScriptError {
    /// Runtime or host-API failure; the script is considered unusable.
    #[error("script error: {0}")]
    Fatal(String),

    /// Soft failure signalled by the script (e.g. need more data).
    #[error("script deferred: {0}")]
    NonFatal(String),
}

impl ScriptError {
    /// Whether this error terminates the bridge.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, ScriptError::Fatal(_))
    }
}

/// Top-level errors returned by the bridge orchestrator.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Pty(#[from] PtyError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    /// The peripheral disconnected while the bridge was running.
    ///
    /// Distinct from user cancellation, which returns `Ok`.
    #[error("connection lost")]
    ConnectionLost,

    /// The operation was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,
}

impl BridgeError {
    /// One concise, user-facing line for this error.
    ///
    /// The CLI prints this instead of a debug dump; detail stays in the log.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            BridgeError::Transport(TransportError::Timeout) => "operation timed out".into(),
            BridgeError::Transport(TransportError::Disconnected) | BridgeError::ConnectionLost => {
                "connection lost".into()
            }
            BridgeError::Cancelled => "operation cancelled".into(),
            other => other.to_string(),
        }
    }
}
