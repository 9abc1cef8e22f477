//! Stratum session errors.

use std::time::Duration;

use thiserror::Error;

/// Errors that end (or refuse to start) a stratum session.
#[derive(Error, Debug)]
pub enum StratumError {
    /// Socket errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Undecodable JSON line
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Nothing received from the pool for this long
    #[error("no message from pool in {}s", .0.as_secs())]
    Timeout(Duration),

    /// Pool closed the connection
    #[error("connection closed by pool")]
    Disconnected,

    /// Well-formed JSON that is not a valid stratum message
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("subscription failed: {0}")]
    SubscriptionFailed(String),

    #[error("authorization failed: {0}")]
    AuthorizationFailed(String),

    /// A response we cannot make sense of during the handshake
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    /// Pool asked us to drop the connection and come back
    #[error("pool requested reconnect")]
    ReconnectRequested,
}

impl StratumError {
    /// Errors after which reconnecting straight away is pointless.
    pub fn is_auth(&self) -> bool {
        matches!(self, StratumError::AuthorizationFailed(_))
    }
}

/// Result alias for stratum operations.
pub type StratumResult<T> = std::result::Result<T, StratumError>;
