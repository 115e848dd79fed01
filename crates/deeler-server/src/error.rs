//! Error types for the server.

use std::time::Duration;

use thiserror::Error;

/// Server lifecycle errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listening socket could not be set up.
    #[error("error starting server on {address}: {source}")]
    Bind {
        /// The `host:port` that was configured.
        address: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// In-flight connections did not finish within the shutdown timeout.
    #[error("error stopping server: graceful shutdown did not finish within {0:?}")]
    ShutdownTimeout(Duration),
}

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;
