use std::time::Duration;
use thiserror::Error;

/// Explicit error-kind tag consulted by the retry engine before it falls back
/// to message matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Timeout,
    Connection,
    SessionLost,
}

#[derive(Error, Debug)]
pub enum DapError {
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Session lost: {0}")]
    SessionLost(String),

    #[error("Adapter not ready: {0}")]
    AdapterNotReady(String),

    #[error("DAP request '{command}' failed: {message}")]
    Adapter { command: String, message: String },

    #[error("Request '{0}' cancelled")]
    Cancelled(String),

    #[error("Request '{operation}' failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: Box<DapError>,
    },

    #[error("Malformed DAP message: {0}")]
    Framing(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Notification delivery failed: {0}")]
    Delivery(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DapError {
    pub fn adapter(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Adapter {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Returns the explicit kind tag, if this variant carries one.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Timeout(_) => Some(ErrorKind::Timeout),
            Self::Connection(_) => Some(ErrorKind::Connection),
            Self::SessionLost(_) => Some(ErrorKind::SessionLost),
            Self::Io(e) => match e.kind() {
                std::io::ErrorKind::TimedOut => Some(ErrorKind::Timeout),
                std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::BrokenPipe => Some(ErrorKind::Connection),
                _ => None,
            },
            Self::RetriesExhausted { source, .. } => source.kind(),
            _ => None,
        }
    }
}
