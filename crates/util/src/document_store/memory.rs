use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::{Document, DocumentKey, DocumentSnapshot, DocumentStore, DocumentStoreError, DocumentTable, Precondition, Revision};
use crate::field_paths::FieldUpdates;

/// In-memory document store used by tests and single-process runs.
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    table: Mutex<DocumentTable>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes a whole document, replacing any previous content. Seeding only.
    pub fn insert(&self, key: DocumentKey, document: Document) -> Revision {
        self.locked().put(&key, document)
    }

    /// Returns the current fields of a document, if present.
    pub fn snapshot(&self, key: &DocumentKey) -> Option<Document> {
        self.locked().get(key).data
    }

    fn locked(&self) -> MutexGuard<'_, DocumentTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, key: &DocumentKey) -> Result<DocumentSnapshot, DocumentStoreError> {
        Ok(self.locked().get(key))
    }

    async fn update(&self, key: &DocumentKey, updates: &FieldUpdates, precondition: Precondition) -> Result<Revision, DocumentStoreError> {
        self.locked().update(key, updates, precondition)
    }

    async fn create(&self, key: &DocumentKey, document: Document) -> Result<Revision, DocumentStoreError> {
        self.locked().create(key, document)
    }
}
