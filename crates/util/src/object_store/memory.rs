use std::{
    collections::HashSet,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use indexmap::IndexMap;

use super::{GcsBucket, ObjectStore, ObjectStoreError, validate_object_path};

/// Object captured by [`InMemoryObjectStore`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: IndexMap<String, StoredObject>,
    failing_suffixes: HashSet<String>,
}

/// Object store that keeps uploads in memory, for tests.
#[derive(Debug)]
pub struct InMemoryObjectStore {
    bucket: GcsBucket,
    state: Mutex<MemoryState>,
}

impl InMemoryObjectStore {
    pub fn new(bucket: GcsBucket) -> Self {
        Self {
            bucket,
            state: Mutex::new(MemoryState::default()),
        }
    }

    /// Makes every upload whose path ends with `suffix` fail.
    pub fn fail_uploads_ending_with(&self, suffix: impl Into<String>) {
        self.locked().failing_suffixes.insert(suffix.into());
    }

    pub fn object(&self, object_path: &str) -> Option<StoredObject> {
        self.locked().objects.get(object_path).cloned()
    }

    /// Paths of every stored object, in upload order.
    pub fn paths(&self) -> Vec<String> {
        self.locked().objects.keys().cloned().collect()
    }

    fn locked(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    fn bucket(&self) -> &GcsBucket {
        &self.bucket
    }

    async fn upload(&self, object_path: &str, bytes: &[u8], content_type: &str) -> Result<String, ObjectStoreError> {
        validate_object_path(object_path)?;
        let mut state = self.locked();
        if state.failing_suffixes.iter().any(|suffix| object_path.ends_with(suffix.as_str())) {
            return Err(ObjectStoreError::write(object_path, "injected upload failure"));
        }
        state.objects.insert(
            object_path.to_string(),
            StoredObject {
                bytes: bytes.to_vec(),
                content_type: content_type.to_string(),
            },
        );
        Ok(self.bucket.uri_for(object_path))
    }
}
