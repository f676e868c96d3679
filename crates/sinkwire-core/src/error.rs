//! Error types for sinkwire channels.
//!
//! Errors fall into four groups: transport-connect failures surfaced to the
//! caller, remote faults (which are *not* errors here and travel as normal
//! replies), per-connection servicing failures caught at the connection
//! boundary, and contract violations made by sink implementations.

use std::time::Duration;
use thiserror::Error;

/// Main error type for the channel layer.
#[derive(Debug, Error)]
pub enum ChannelError {
    // Transport errors
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<reqwest::Error>,
    },

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Failed to connect to {endpoint}: {message}")]
    Connect { endpoint: String, message: String },

    #[error("Timed out after {timeout:?} connecting to {endpoint}")]
    ConnectTimeout { endpoint: String, timeout: Duration },

    #[error("Connection closed by peer before a reply was received")]
    ConnectionClosed,

    #[error("HTTP {status} returned by {url}: {message}")]
    HttpStatus {
        status: u16,
        url: String,
        message: String,
    },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    // Framing and serialization errors
    #[error("Invalid IPC frame: {message}")]
    Frame { message: String },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // Addressing and configuration errors
    #[error("Invalid URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    #[error("Invalid pipe name: {0}")]
    InvalidPipeName(String),

    #[error("Configuration error for {key}: {message}")]
    Config { key: String, message: String },

    #[error("A channel named {0} is already registered")]
    DuplicateChannel(String),

    #[error("No registered channel accepts {0}")]
    NoChannel(String),

    // Dispatch errors
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    // Contract violations
    #[error("Sink stack mismatch: {0}")]
    StackMismatch(String),

    #[error("Asynchronous response continuation was dropped without being invoked")]
    ContinuationDropped,

    #[error("Sink returned an asynchronous outcome without suspending the sink stack")]
    NotSuspended,

    #[error("{0}")]
    Other(String),
}

/// Result type alias for channel operations.
pub type Result<T> = std::result::Result<T, ChannelError>;

impl From<std::io::Error> for ChannelError {
    fn from(err: std::io::Error) -> Self {
        ChannelError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for ChannelError {
    fn from(err: serde_json::Error) -> Self {
        ChannelError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<reqwest::Error> for ChannelError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ChannelError::Timeout(Duration::from_secs(0))
        } else {
            ChannelError::Network {
                message: err.to_string(),
                source: Some(err),
            }
        }
    }
}

impl ChannelError {
    /// Create a configuration error for a property key.
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        ChannelError::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    /// Whether the failure happened before any request bytes reached the peer.
    pub fn is_connect_failure(&self) -> bool {
        matches!(
            self,
            ChannelError::Connect { .. } | ChannelError::ConnectTimeout { .. }
        )
    }

    /// Check if this error should trigger another connect attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            ChannelError::Connect { .. } | ChannelError::Timeout(_) => true,
            ChannelError::Io {
                source: Some(io), ..
            } => matches!(
                io.kind(),
                std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Whether a sink implementation broke the chain or stack contract.
    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            ChannelError::StackMismatch(_)
                | ChannelError::ContinuationDropped
                | ChannelError::NotSuspended
        )
    }
}
