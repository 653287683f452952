use std::time::Duration;
use thiserror::Error;

/// Categorizes errors for logging and metrics.
///
/// This is a lightweight, cloneable representation of the error type
/// that can be attached to log lines without carrying the full error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol error
    WebSocket,
    /// Connection failed (refused, DNS, TLS, handshake)
    ConnectionFailed,
    /// Connection attempt took longer than the configured timeout
    Timeout,
    /// Endpoint could not be turned into a connectable URL
    InvalidUrl,
    /// Operation requires a tokio runtime and none is running
    NoRuntime,
}

/// Errors that can occur in progress-sync
///
/// None of these cross the synchronous controller boundary: transport
/// failures are turned into connection state transitions and malformed
/// frames are dropped. They surface from [`Connector`](crate::Connector)
/// implementations and from endpoint derivation.
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Transport could not be established
    #[error("Connection to {url} failed: {reason}")]
    ConnectionFailed { url: String, reason: String },

    /// Connection attempt exceeded the connect timeout
    #[error("Connection attempt timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Endpoint URL is malformed or cannot carry an entity path
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// No tokio runtime available to drive the connection
    #[error("No tokio runtime available")]
    NoRuntime,
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::ConnectionFailed { .. } => ErrorKind::ConnectionFailed,
            Error::ConnectTimeout(_) => ErrorKind::Timeout,
            Error::InvalidUrl(_) => ErrorKind::InvalidUrl,
            Error::NoRuntime => ErrorKind::NoRuntime,
        }
    }

    pub(crate) fn connection_failed(url: &str, reason: impl Into<String>) -> Self {
        Error::ConnectionFailed {
            url: url.to_string(),
            reason: reason.into(),
        }
    }
}
