//! Document store port used for flow runs, templates, and account usage.
//!
//! The contract is deliberately small: read a document together with an opaque
//! revision, apply leaf-scoped field updates conditioned on that revision, and
//! create a document only when it is absent. All concurrency safety in the
//! worker is built from these three primitives.

mod json_file;
mod memory;

use std::fmt;

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::field_paths::FieldUpdates;

pub use json_file::JsonFileDocumentStore;
pub use memory::InMemoryDocumentStore;

/// Field values of a stored document.
pub type Document = Map<String, Value>;

/// Collection plus document id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    pub collection: String,
    pub id: String,
}

impl DocumentKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// Opaque marker that changes on every successful write to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Revision(pub u64);

/// Result of a read: the document's fields, when it exists, and its revision.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSnapshot {
    pub key: DocumentKey,
    pub data: Option<Document>,
    pub revision: Option<Revision>,
}

impl DocumentSnapshot {
    pub fn missing(key: DocumentKey) -> Self {
        Self {
            key,
            data: None,
            revision: None,
        }
    }

    pub fn exists(&self) -> bool {
        self.data.is_some()
    }

    /// Returns the fields as a JSON object value, or `None` when missing.
    pub fn to_value(&self) -> Option<Value> {
        self.data.clone().map(Value::Object)
    }

    /// Precondition that only lets a write through if nobody wrote since this read.
    pub fn precondition(&self) -> Precondition {
        self.revision.map(Precondition::Revision).unwrap_or(Precondition::Unconditional)
    }
}

/// Guard attached to an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Apply regardless of concurrent writes.
    Unconditional,
    /// Apply only when the stored revision still equals this one.
    Revision(Revision),
}

/// Errors surfaced by document store operations.
#[derive(Debug, Error)]
pub enum DocumentStoreError {
    /// The stored revision moved since it was read.
    #[error("precondition failed for {key}")]
    PreconditionFailed { key: String },
    /// The backend aborted the write because of contention.
    #[error("write aborted for {key}: {reason}")]
    Aborted { key: String, reason: String },
    /// A create-only write found an existing document.
    #[error("document already exists: {key}")]
    AlreadyExists { key: String },
    /// An update targeted a document that does not exist.
    #[error("document not found: {key}")]
    NotFound { key: String },
    #[error("document store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("document store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Any other backend failure.
    #[error("document store backend error: {0}")]
    Backend(String),
}

impl DocumentStoreError {
    pub fn precondition_failed(key: &DocumentKey) -> Self {
        Self::PreconditionFailed { key: key.to_string() }
    }

    pub fn aborted(key: &DocumentKey, reason: impl Into<String>) -> Self {
        Self::Aborted {
            key: key.to_string(),
            reason: reason.into(),
        }
    }

    pub fn already_exists(key: &DocumentKey) -> Self {
        Self::AlreadyExists { key: key.to_string() }
    }

    pub fn not_found(key: &DocumentKey) -> Self {
        Self::NotFound { key: key.to_string() }
    }

    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }

    /// True for optimistic-concurrency rejections, the only errors worth retrying.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. } | Self::Aborted { .. } | Self::AlreadyExists { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }
}

/// Storage backend for JSON documents with conditional writes.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reads a document. A missing document is not an error.
    async fn get(&self, key: &DocumentKey) -> Result<DocumentSnapshot, DocumentStoreError>;

    /// Applies `updates` to an existing document when `precondition` holds.
    ///
    /// # Errors
    /// [`DocumentStoreError::PreconditionFailed`] when the revision moved and
    /// [`DocumentStoreError::NotFound`] when the document does not exist.
    async fn update(&self, key: &DocumentKey, updates: &FieldUpdates, precondition: Precondition) -> Result<Revision, DocumentStoreError>;

    /// Creates a document, failing with [`DocumentStoreError::AlreadyExists`] if present.
    async fn create(&self, key: &DocumentKey, document: Document) -> Result<Revision, DocumentStoreError>;
}

/// Documents held by the in-process backends, with per-document revisions.
#[derive(Debug, Default, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct DocumentTable {
    #[serde(default)]
    collections: indexmap::IndexMap<String, indexmap::IndexMap<String, StoredDocument>>,
    #[serde(default)]
    next_revision: u64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StoredDocument {
    revision: u64,
    fields: Document,
}

impl DocumentTable {
    pub(crate) fn get(&self, key: &DocumentKey) -> DocumentSnapshot {
        match self.collections.get(&key.collection).and_then(|docs| docs.get(&key.id)) {
            Some(stored) => DocumentSnapshot {
                key: key.clone(),
                data: Some(stored.fields.clone()),
                revision: Some(Revision(stored.revision)),
            },
            None => DocumentSnapshot::missing(key.clone()),
        }
    }

    pub(crate) fn update(&mut self, key: &DocumentKey, updates: &FieldUpdates, precondition: Precondition) -> Result<Revision, DocumentStoreError> {
        let revision = self.bump();
        let stored = self
            .collections
            .get_mut(&key.collection)
            .and_then(|docs| docs.get_mut(&key.id))
            .ok_or_else(|| DocumentStoreError::not_found(key))?;

        if let Precondition::Revision(expected) = precondition
            && expected.0 != stored.revision
        {
            return Err(DocumentStoreError::precondition_failed(key));
        }

        updates.apply_to(&mut stored.fields);
        stored.revision = revision;
        Ok(Revision(revision))
    }

    pub(crate) fn create(&mut self, key: &DocumentKey, fields: Document) -> Result<Revision, DocumentStoreError> {
        if self.get(key).exists() {
            return Err(DocumentStoreError::already_exists(key));
        }
        Ok(self.put(key, fields))
    }

    /// Unconditionally writes a whole document. Used for seeding only.
    pub(crate) fn put(&mut self, key: &DocumentKey, fields: Document) -> Revision {
        let revision = self.bump();
        self.collections
            .entry(key.collection.clone())
            .or_default()
            .insert(key.id.clone(), StoredDocument { revision, fields });
        Revision(revision)
    }

    fn bump(&mut self) -> u64 {
        self.next_revision += 1;
        self.next_revision
    }
}
