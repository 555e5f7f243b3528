//! Error types.
//!
//! `StorageError` covers everything a backend call can report and is always
//! recoverable from the orchestrator's point of view. `ProvisionError` is the
//! fatal kind: local filesystem failures while managing scratch files.

use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(String),
    #[error("bucket `{0}` already exists")]
    BucketAlreadyExists(String),
    #[error("bucket `{0}` is not empty")]
    BucketNotEmpty(String),
    #[error("bucket `{name}` invalid: {reason}")]
    InvalidBucketName { name: String, reason: String },
    #[error("region `{0}` is not supported")]
    UnsupportedRegion(String),
    #[error("object `{key}` not found in bucket `{bucket}`")]
    ObjectNotFound { bucket: String, key: String },
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("{failed} of {requested} deletions failed in bucket `{bucket}`: {first}")]
    PartialDelete {
        bucket: String,
        requested: usize,
        failed: usize,
        first: String,
    },
    #[error("stored record is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Why a single orchestrated step failed. Recorded, never propagated.
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("downloaded copy of `{key}` differs from the uploaded file ({expected} bytes expected, {actual} read)")]
    ContentMismatch {
        key: String,
        expected: u64,
        actual: u64,
    },
    #[error("reading {path}: {source}")]
    LocalRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failures that end a provisioning run.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("{context} ({path}): {source}")]
    LocalIo {
        context: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl ProvisionError {
    pub fn local_io(context: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        ProvisionError::LocalIo {
            context,
            path: path.into(),
            source,
        }
    }
}
