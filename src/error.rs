// src/error.rs

//! Error types for aptd

use crate::enums::ErrorKind;
use thiserror::Error;

/// Result type alias using the crate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the daemon, the queue and the worker
///
/// The first group mirrors the errors a D-Bus client can receive when it
/// calls a method on a transaction. `Failed` carries the classification
/// that ends up in the transaction's `Error` property.
#[derive(Debug, Error)]
pub enum Error {
    #[error("The transaction belongs to a different user")]
    ForeignTransaction,

    #[error("The role of the transaction has already been set")]
    RoleAlreadySet,

    #[error("The transaction is already running or queued")]
    AlreadyRunning,

    #[error("The transaction is already being simulated")]
    AlreadySimulating,

    #[error("Invalid meta data: {0}")]
    InvalidMetaData(String),

    #[error("Invalid proxy: {0}")]
    InvalidProxy(String),

    #[error("Invalid property value: {0}")]
    InvalidProperty(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not authorized to perform {0}")]
    NotAuthorized(String),

    #[error("Authorization failed for {0}")]
    AuthFailed(String),

    #[error("{kind}: {details}")]
    Failed { kind: ErrorKind, details: String },

    #[error("Transaction was cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("D-Bus error: {0}")]
    DbusError(String),
}

impl Error {
    /// Shorthand for a classified transaction failure
    pub fn failed(kind: ErrorKind, details: impl Into<String>) -> Self {
        Error::Failed {
            kind,
            details: details.into(),
        }
    }

    /// The error classification reported on the transaction
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Failed { kind, .. } => *kind,
            Error::NotAuthorized(_) => ErrorKind::NotAuthorized,
            Error::AuthFailed(_) => ErrorKind::AuthFailed,
            _ => ErrorKind::Unknown,
        }
    }

    /// Human readable details for the transaction's error property
    pub fn details(&self) -> String {
        match self {
            Error::Failed { details, .. } => details.clone(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IoError(err.to_string())
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::ConfigError(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::ParseError(err.to_string())
    }
}

impl From<zbus::Error> for Error {
    fn from(err: zbus::Error) -> Self {
        Error::DbusError(err.to_string())
    }
}

impl From<zbus::fdo::Error> for Error {
    fn from(err: zbus::fdo::Error) -> Self {
        Error::DbusError(err.to_string())
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::IoError(err.to_string())
    }
}
