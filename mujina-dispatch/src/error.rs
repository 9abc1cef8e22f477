//! Common error types for mujina-dispatch.
//!
//! This module provides a centralized Error enum using thiserror,
//! with conversions from underlying error types used throughout the crate.

use thiserror::Error;

use crate::stratum_v1::StratumError;

/// Main error type for mujina-dispatch operations.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O errors from tokio or std
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport errors from the RPC client
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Stratum session errors
    #[error("Stratum error: {0}")]
    Stratum(#[from] StratumError),

    /// JSON-RPC error object returned by a pool or node
    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Protocol decode errors (missing or malformed fields)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Pool state errors
    #[error("Pool error: {0}")]
    Pool(String),

    /// Generic errors
    #[error("{0}")]
    Other(String),
}

impl From<hex::FromHexError> for Error {
    fn from(e: hex::FromHexError) -> Self {
        Error::Protocol(format!("invalid hex: {e}"))
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
