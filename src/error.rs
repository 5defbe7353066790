//! Error types for the fleet installer.
//!
//! All errors are represented by the `FleetError` enum. Command handlers turn
//! any of these into a failure envelope instead of crashing the process.

use std::io::ErrorKind;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unified error type for all installer operations.
///
/// Each variant represents one category of the error taxonomy: transport and
/// payload errors, store errors, packaging errors and downstream script errors.
#[derive(Deserialize, Serialize, Error, Debug, Clone, PartialEq)]
pub enum FleetError {
    /// Configuration parsing or validation errors.
    #[error("{0}")]
    Config(String),

    /// Entity schema declaration errors, raised when a table is derived.
    #[error("{0}")]
    Schema(String),

    /// Checkpoint store errors (bootstrap, statements, row decoding).
    #[error("{0}")]
    Store(String),

    /// No pooled connection became available within the acquire timeout.
    #[error("{0}")]
    PoolTimeout(String),

    /// Malformed or incomplete command payloads.
    #[error("{0}")]
    Protocol(String),

    /// Install package build or unpack errors.
    #[error("{0}")]
    Package(String),

    /// Errors talking to a remote coordinator or follower.
    #[error("{0}")]
    Transport(String),

    /// Local script execution errors.
    #[error("{0}")]
    Script(String),

    /// Node lifecycle errors (unknown node, no roles for an address).
    #[error("{0}")]
    Install(String),

    /// Data conversion errors (JSON, TOML, enum names).
    #[error("{0}")]
    Convert(String),

    /// I/O operation errors.
    #[error("{0}")]
    IoError(String),
}

impl From<FleetError> for String {
    fn from(val: FleetError) -> Self {
        val.to_string()
    }
}

impl From<std::io::Error> for FleetError {
    fn from(error: std::io::Error) -> Self {
        FleetError::IoError(error.to_string())
    }
}

impl From<FleetError> for std::io::Error {
    fn from(val: FleetError) -> Self {
        #[allow(clippy::io_other_error)]
        std::io::Error::new(ErrorKind::Other, val.to_string())
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(error: serde_json::Error) -> Self {
        FleetError::Convert(error.to_string())
    }
}

impl From<toml::de::Error> for FleetError {
    fn from(error: toml::de::Error) -> Self {
        FleetError::Config(error.to_string())
    }
}

impl From<sqlx::Error> for FleetError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => FleetError::PoolTimeout(error.to_string()),
            _ => FleetError::Store(error.to_string()),
        }
    }
}

impl From<sea_query::error::Error> for FleetError {
    fn from(error: sea_query::error::Error) -> Self {
        FleetError::Store(error.to_string())
    }
}

impl From<reqwest::Error> for FleetError {
    fn from(error: reqwest::Error) -> Self {
        FleetError::Transport(error.to_string())
    }
}

impl From<axum::extract::multipart::MultipartError> for FleetError {
    fn from(error: axum::extract::multipart::MultipartError) -> Self {
        FleetError::Protocol(error.to_string())
    }
}

impl From<strum::ParseError> for FleetError {
    fn from(error: strum::ParseError) -> Self {
        FleetError::Convert(error.to_string())
    }
}

impl From<tokio::task::JoinError> for FleetError {
    fn from(error: tokio::task::JoinError) -> Self {
        FleetError::Install(error.to_string())
    }
}
