use thiserror::Error;

use crate::BackupFileId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {what}")]
    NotFound { what: String },

    #[error("No backup file with id {id}")]
    BackupNotFound { id: BackupFileId },

    #[error("Format error: {0}")]
    Format(String),

    #[error("Conflict: {path} already exists")]
    Conflict { path: String },

    #[error("The file is encrypted, but the key is empty")]
    EmptyKey,

    #[error("Unsupported file type: {path}")]
    UnsupportedType { path: String },

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Monitor error: {0}")]
    Monitor(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl Error {
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Error::NotFound { what: what.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
