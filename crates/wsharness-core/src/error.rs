//! Error types for the harness client.
//!
//! Only construction and outbound sends can fail loudly. Everything that goes
//! wrong on the read side after construction is absorbed by the reader loop and
//! shows up to callers as a wait that times out.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Main error type for wsharness.
#[derive(Debug, Error)]
pub enum WsClientError {
    // Construction errors
    #[error("Failed to connect to {addr}: {message}")]
    Connect { addr: SocketAddr, message: String },

    #[error("WebSocket handshake with {addr} failed: {message}")]
    Handshake { addr: SocketAddr, message: String },

    #[error("Connecting to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: SocketAddr, timeout: Duration },

    // Endpoint resolution errors
    #[error("Missing WebSocket port for protocol {protocol}")]
    MissingWebSocketPort { protocol: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    // Request errors
    #[error("Invalid params: {message}")]
    InvalidParams { message: String },

    #[error("Send failed: {message}")]
    Send { message: String },

    #[error("Connection is closed")]
    Closed,

    // Transport errors
    #[error("WebSocket error: {message}")]
    WebSocket {
        message: String,
        #[source]
        source: Option<tungstenite::Error>,
    },

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    // File system errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for wsharness operations.
pub type Result<T> = std::result::Result<T, WsClientError>;

impl From<std::io::Error> for WsClientError {
    fn from(err: std::io::Error) -> Self {
        WsClientError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for WsClientError {
    fn from(err: serde_json::Error) -> Self {
        WsClientError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<tungstenite::Error> for WsClientError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                WsClientError::Closed
            }
            other => WsClientError::WebSocket {
                message: other.to_string(),
                source: Some(other),
            },
        }
    }
}

impl WsClientError {
    /// Whether this error can only come out of client construction.
    ///
    /// Construction failures are never retried by the client.
    pub fn is_fatal_at_construction(&self) -> bool {
        matches!(
            self,
            WsClientError::Connect { .. }
                | WsClientError::Handshake { .. }
                | WsClientError::ConnectTimeout { .. }
                | WsClientError::MissingWebSocketPort { .. }
        )
    }
}
