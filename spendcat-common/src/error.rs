//! Common error types for spendcat

use thiserror::Error;

/// Common result type for spendcat operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the worker and its collaborators
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Record (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested job, chunk or artifact not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Job id collision on create
    #[error("Duplicate job: {0}")]
    DuplicateJob(String),

    /// Invalid input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for the "absent artifact" family of errors
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound(_) => true,
            Error::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
