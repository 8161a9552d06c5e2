//! Object store port for chart images and manifests.
//!
//! Objects are addressed by a bucket-relative path and always reported back as
//! `gs://<bucket>/<path>` URIs, whichever backend actually holds the bytes.

mod gcs;
mod local;
mod memory;

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

pub use gcs::{GCS_ACCESS_TOKEN_ENV, GcsObjectStore};
pub use local::LocalDirectoryObjectStore;
pub use memory::{InMemoryObjectStore, StoredObject};

/// URI scheme of every object reference written by the worker.
pub const GCS_SCHEME: &str = "gs://";

/// Errors surfaced by object store operations.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("invalid bucket '{0}': expected gs://<bucket> or a bare bucket name")]
    InvalidBucket(String),
    #[error("invalid object path '{0}'")]
    InvalidPath(String),
    /// Backend settings such as credentials are missing or malformed.
    #[error("object store configuration error: {0}")]
    Config(String),
    #[error("object store I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The backend rejected or failed the write.
    #[error("object write failed for {path}: {message}")]
    Write { path: String, message: String },
}

impl ObjectStoreError {
    pub fn write(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Write {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Validated bucket name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GcsBucket(String);

impl GcsBucket {
    /// Accepts `gs://<bucket>`, `gs://<bucket>/` or a bare `<bucket>`.
    ///
    /// # Errors
    /// Rejects empty names, object paths after the bucket, and characters
    /// outside the GCS bucket alphabet.
    pub fn parse(raw: &str) -> Result<Self, ObjectStoreError> {
        let trimmed = raw.trim();
        let name = trimmed.strip_prefix(GCS_SCHEME).unwrap_or(trimmed).trim_end_matches('/');

        let valid = !name.is_empty()
            && !name.contains('/')
            && name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(ObjectStoreError::InvalidBucket(raw.to_string()));
        }
        Ok(Self(name.to_string()))
    }

    pub fn name(&self) -> &str {
        &self.0
    }

    /// `gs://<bucket>`.
    pub fn uri(&self) -> String {
        format!("{GCS_SCHEME}{}", self.0)
    }

    /// `gs://<bucket>/<path>`.
    pub fn uri_for(&self, object_path: &str) -> String {
        format!("{GCS_SCHEME}{}/{}", self.0, object_path.trim_start_matches('/'))
    }
}

impl fmt::Display for GcsBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri())
    }
}

/// Write-only blob storage for produced artifacts.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Bucket every path is relative to.
    fn bucket(&self) -> &GcsBucket;

    /// Uploads `bytes` to `object_path` and returns its `gs://` URI.
    async fn upload(&self, object_path: &str, bytes: &[u8], content_type: &str) -> Result<String, ObjectStoreError>;
}

/// Rejects absolute paths and any `.`/`..` segment.
pub(crate) fn validate_object_path(object_path: &str) -> Result<(), ObjectStoreError> {
    let invalid = object_path.is_empty()
        || object_path.starts_with('/')
        || object_path
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == "..");
    if invalid {
        return Err(ObjectStoreError::InvalidPath(object_path.to_string()));
    }
    Ok(())
}
