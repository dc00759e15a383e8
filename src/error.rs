//! Error taxonomy shared by the loader, the step executor and the workers.
//!
//! Only [`ConfigurationError`] is fatal: it is raised while a script is loaded and
//! prevents the run from starting. Everything else is scoped to one request or one
//! iteration and ends up as a counter in the run report.

use std::fmt;

use thiserror::Error;

/// Fatal load-time error: the deluge declaration cannot be turned into a plan.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("invalid duration '{0}': expected an integer followed by ms, s or m")]
    InvalidDuration(String),

    #[error("no deluge(...) declaration found in {0}")]
    MissingDeluge(String),

    #[error("deluge(...) may only be declared once (found '{0}' after '{1}')")]
    DuplicateDeluge(String, String),

    #[error("scenario '{0}' is configured but not defined")]
    UnknownScenario(String),

    #[error("scenario '{0}' is defined more than once")]
    DuplicateScenario(String),

    #[error("invalid configuration for scenario '{scenario}': {reason}")]
    InvalidScenarioConfig { scenario: String, reason: String },

    #[error("invalid deluge declaration: {0}")]
    InvalidDeluge(String),

    #[error("failed to evaluate {origin}: {message}")]
    Script { origin: String, message: String },

    #[error("invalid engine configuration: {0}")]
    Engine(String),
}

/// Classification of a failed HTTP step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    InvalidRequest,
    Io,
    Cancelled,
}

impl TransportErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportErrorKind::Timeout => "timeout",
            TransportErrorKind::Connect => "connect",
            TransportErrorKind::InvalidRequest => "invalid_request",
            TransportErrorKind::Io => "io",
            TransportErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request that produced no HTTP response.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn new(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::new(
            TransportErrorKind::Timeout,
            format!("no response within {}ms", after.as_millis()),
        )
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(TransportErrorKind::InvalidRequest, message)
    }

    pub fn cancelled() -> Self {
        Self::new(TransportErrorKind::Cancelled, "request cancelled")
    }
}

/// Why a single iteration did not complete successfully.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum IterationFailure {
    #[error("assertion failed: {0}")]
    AssertionFailure(String),

    #[error("script error: {0}")]
    ScriptError(String),

    #[error("iteration cancelled")]
    Cancelled,
}
