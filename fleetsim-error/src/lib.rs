pub mod provision;
pub mod schema;
pub mod storage;
pub mod transport;

use anyhow::Error as AnyhowError;
use config::ConfigError;
use provision::ProvisionError;
use schema::SchemaError;
use serde_json::Error as SerdeJsonError;
use std::{error::Error as StdError, io::Error as IoError};
use storage::StorageError;
use thiserror::Error;
use tokio::{task::JoinError, time::Duration};
use transport::TransportError;

pub type FSResult<T, E = FSError> = anyhow::Result<T, E>;
pub type StorageResult<T, E = StorageError> = Result<T, E>;
pub type ProvisionResult<T, E = ProvisionError> = Result<T, E>;
pub type TransportResult<T, E = TransportError> = Result<T, E>;

#[derive(Error, Debug, Default)]
pub enum FSError {
    #[error("service unavailable")]
    #[default]
    ServiceUnavailable,
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("operation cancelled")]
    Cancelled,
    #[error("{0}")]
    JoinError(#[from] JoinError),
    #[error("{0}")]
    StdError(#[from] Box<dyn StdError + Send + Sync>),
    #[error("{0}")]
    IoError(#[from] IoError),
    #[error("{0}")]
    Msg(String),
    #[error("{0}")]
    Anyhow(#[from] AnyhowError),
    #[error("{0}")]
    Json(#[from] SerdeJsonError),
    #[error("{0}")]
    ConfigError(#[from] ConfigError),
    #[error("{0}")]
    StorageError(#[from] StorageError),
    #[error("{0}")]
    Provision(#[from] ProvisionError),
    #[error("{0}")]
    Transport(#[from] TransportError),
    #[error("{0}")]
    Schema(#[from] SchemaError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Invalid state error: {0}")]
    InvalidStateError(String),
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
    #[error("Initialization error: {0}")]
    InitializationError(String),
}

impl From<String> for FSError {
    #[inline]
    fn from(e: String) -> Self {
        FSError::Msg(e)
    }
}

impl From<&str> for FSError {
    #[inline]
    fn from(e: &str) -> Self {
        FSError::Msg(e.to_string())
    }
}

impl From<&FSError> for FSError {
    #[inline]
    fn from(e: &FSError) -> Self {
        FSError::Msg(e.to_string())
    }
}
