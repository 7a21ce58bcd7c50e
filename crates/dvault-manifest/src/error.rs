use std::io;

use dvault_cas::CasError;
use dvault_diff::ScriptError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Malformed path: {0}")]
    MalformedPath(String),

    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("Refusing to delete the last version of {0}")]
    TooFewVersions(String),

    #[error("Not enough space on disc: need {needed} bytes, {available} available")]
    NotEnoughSpaceOnDisc { needed: u64, available: u64 },

    #[error("Wrong version number {index}: file has {count} versions")]
    WrongVersionNumber { index: usize, count: usize },

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    #[error("Upload session error: {0}")]
    UploadState(String),

    #[error("Chunk size {declared} does not match {expected} for a file of this size")]
    ChunkSizeMismatch { declared: usize, expected: usize },

    #[error("Store inconsistent: {0}")]
    Corrupt(String),

    #[error("Edit script does not fit its base: {0}")]
    Script(#[from] ScriptError),

    #[error("Object store error: {0}")]
    Cas(#[from] CasError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Serializable classification of a [`StoreError`] for clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    MalformedPath,
    BlockNotFound,
    TooFewVersions,
    NotEnoughSpaceOnDisc,
    WrongVersionNumber,
    NotFound,
    NotAFile,
    UploadState,
    ChunkSizeMismatch,
    Internal,
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::MalformedPath(_) => ErrorKind::MalformedPath,
            StoreError::BlockNotFound(_) => ErrorKind::BlockNotFound,
            StoreError::TooFewVersions(_) => ErrorKind::TooFewVersions,
            StoreError::NotEnoughSpaceOnDisc { .. } => ErrorKind::NotEnoughSpaceOnDisc,
            StoreError::WrongVersionNumber { .. } => ErrorKind::WrongVersionNumber,
            StoreError::NotFound(_) => ErrorKind::NotFound,
            StoreError::NotAFile(_) => ErrorKind::NotAFile,
            StoreError::UploadState(_) => ErrorKind::UploadState,
            StoreError::ChunkSizeMismatch { .. } => ErrorKind::ChunkSizeMismatch,
            StoreError::Corrupt(_)
            | StoreError::Script(_)
            | StoreError::Cas(_)
            | StoreError::Serialization(_)
            | StoreError::Io(_) => ErrorKind::Internal,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}
