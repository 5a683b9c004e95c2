//! Error types for the HTTP server.

use thiserror::Error;

use crate::parser::Error as ParserError;

/// Errors that can occur during HTTP server operation.
#[derive(Debug, Error)]
pub enum Error {
    /// Error parsing an HTTP request.
    #[error("Parse error: {0}")]
    ParseError(#[from] ParserError),

    /// I/O error, including bind and accept failures.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// A handler failed to produce a response.
    #[error("Internal server error: {0}")]
    InternalError(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// The listening address could not be understood.
    #[error("Invalid listen address: {0}")]
    InvalidAddress(String),

    /// `start` was called on a server that is already running.
    #[error("Server already started")]
    AlreadyStarted,

    /// The server was closed by a shutdown. Returned from `start` after a
    /// deliberate shutdown; callers should treat it as success.
    #[error("Server closed")]
    ServerClosed,

    /// Shutting down the listener failed.
    #[error("Shutdown failed: {0}")]
    Shutdown(String),
}

impl Error {
    /// True for the sentinel returned by a shutdown-triggered close.
    pub fn is_server_closed(&self) -> bool {
        matches!(self, Error::ServerClosed)
    }
}
