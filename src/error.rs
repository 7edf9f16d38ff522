use thiserror::Error;

use crate::director::DirectorError;
use crate::driver::DriverError;
use crate::ledger::LedgerError;
use crate::transport::TransportError;

/// Failure reported by one of the external collaborators (task queue,
/// replica catalog, sandbox store, accounting, job tracker).
///
/// These services are opaque to this crate, so only their message survives.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{service}: {message}")]
pub struct ExternalError {
    pub service: &'static str,
    pub message: String,
}

impl ExternalError {
    pub fn new(service: &'static str, message: impl Into<String>) -> Self {
        Self {
            service,
            message: message.into(),
        }
    }
}

pub type ExternalResult<T> = std::result::Result<T, ExternalError>;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Director error: {0}")]
    Director(#[from] DirectorError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("External service error: {0}")]
    External(#[from] ExternalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
