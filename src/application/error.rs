use thiserror::Error;

use crate::cache::{CacheError, Operation};
use crate::infra::error::InfraError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Infra(#[from] InfraError),
    #[error("tag {operation} did not reach bin(s): {}", .bins.join(", "))]
    Incomplete {
        operation: Operation,
        bins: Vec<String>,
    },
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl AppError {
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self::Unexpected(message.into())
    }

    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Cache(CacheError::InvalidTag { .. } | CacheError::UnknownBin { .. }) => 2,
            Self::Incomplete { .. } => 3,
            _ => 1,
        }
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Infra(InfraError::Io(err))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::unexpected(format!("failed to render output: {err}"))
    }
}
