use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use super::{GcsBucket, ObjectStore, ObjectStoreError, validate_object_path};

/// Mirrors uploads into `<root>/<bucket>/<path>` on the local filesystem.
///
/// Returned URIs stay `gs://` so manifests written by local runs look exactly
/// like production ones.
#[derive(Debug, Clone)]
pub struct LocalDirectoryObjectStore {
    root: PathBuf,
    bucket: GcsBucket,
}

impl LocalDirectoryObjectStore {
    pub fn new(root: impl Into<PathBuf>, bucket: GcsBucket) -> Self {
        Self { root: root.into(), bucket }
    }

    /// Filesystem location backing `object_path`.
    pub fn local_path(&self, object_path: &str) -> PathBuf {
        self.root.join(self.bucket.name()).join(object_path)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ObjectStore for LocalDirectoryObjectStore {
    fn bucket(&self) -> &GcsBucket {
        &self.bucket
    }

    async fn upload(&self, object_path: &str, bytes: &[u8], content_type: &str) -> Result<String, ObjectStoreError> {
        validate_object_path(object_path)?;
        let target = self.local_path(object_path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, bytes).await?;
        debug!(path = %target.display(), content_type, size = bytes.len(), "object_written_locally");
        Ok(self.bucket.uri_for(object_path))
    }
}
