use std::{
    ffi::OsString,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::debug;

use super::{Document, DocumentKey, DocumentSnapshot, DocumentStore, DocumentStoreError, DocumentTable, Precondition, Revision};
use crate::field_paths::FieldUpdates;

/// Document store persisted as a single JSON file.
///
/// Every operation re-reads the file while holding an OS lock on a sibling
/// `<file>.lock`: shared for reads, exclusive for writes. Writers that share
/// the path, in this process or another, therefore see each other's revisions
/// and a stale precondition fails. Writes go to a temporary file that is
/// renamed over the store, so a crash mid-write leaves the previous content.
#[derive(Debug)]
pub struct JsonFileDocumentStore {
    path: PathBuf,
    lock_path: PathBuf,
    local: Mutex<()>,
}

enum LockMode {
    Shared,
    Exclusive,
}

/// Held for the duration of one operation; the OS lock is released on drop.
struct StoreLock<'a> {
    _file: File,
    _local: MutexGuard<'a, ()>,
}

impl JsonFileDocumentStore {
    /// Opens the store at `path`, starting empty when the file does not exist.
    ///
    /// # Errors
    /// Fails when the file exists but cannot be read or parsed.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DocumentStoreError> {
        let path = path.into();
        if let Some(parent) = parent_dir(&path) {
            fs::create_dir_all(parent)?;
        }
        let store = Self {
            lock_path: lock_path(&path),
            path,
            local: Mutex::new(()),
        };
        {
            let _lock = store.lock(LockMode::Shared)?;
            load_table(&store.path)?;
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes a whole document, replacing any previous content, and persists it.
    pub fn insert(&self, key: DocumentKey, document: Document) -> Result<Revision, DocumentStoreError> {
        self.modify(|table| Ok(table.put(&key, document)))
    }

    fn lock(&self, mode: LockMode) -> Result<StoreLock<'_>, DocumentStoreError> {
        let local = self.local.lock().unwrap_or_else(PoisonError::into_inner);
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)?;
        match mode {
            LockMode::Shared => file.lock_shared()?,
            LockMode::Exclusive => file.lock()?,
        }
        Ok(StoreLock {
            _file: file,
            _local: local,
        })
    }

    /// Loads the current table under the exclusive lock, applies `change`, and
    /// persists the result only when `change` succeeds.
    fn modify<T>(&self, change: impl FnOnce(&mut DocumentTable) -> Result<T, DocumentStoreError>) -> Result<T, DocumentStoreError> {
        let _lock = self.lock(LockMode::Exclusive)?;
        let mut table = load_table(&self.path)?;
        let output = change(&mut table)?;
        self.save(&table)?;
        Ok(output)
    }

    fn save(&self, table: &DocumentTable) -> Result<(), DocumentStoreError> {
        let dir = parent_dir(&self.path).unwrap_or_else(|| Path::new("."));
        let staged = NamedTempFile::new_in(dir)?;
        let mut writer = BufWriter::new(staged.as_file());
        serde_json::to_writer_pretty(&mut writer, table)?;
        writer.flush()?;
        drop(writer);
        staged.as_file().sync_all()?;
        staged.persist(&self.path).map_err(|error| DocumentStoreError::Io(error.error))?;
        debug!(path = %self.path.display(), "document_store_saved");
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for JsonFileDocumentStore {
    async fn get(&self, key: &DocumentKey) -> Result<DocumentSnapshot, DocumentStoreError> {
        let _lock = self.lock(LockMode::Shared)?;
        Ok(load_table(&self.path)?.get(key))
    }

    async fn update(&self, key: &DocumentKey, updates: &FieldUpdates, precondition: Precondition) -> Result<Revision, DocumentStoreError> {
        self.modify(|table| table.update(key, updates, precondition))
    }

    async fn create(&self, key: &DocumentKey, document: Document) -> Result<Revision, DocumentStoreError> {
        self.modify(|table| table.create(key, document))
    }
}

fn parent_dir(path: &Path) -> Option<&Path> {
    path.parent().filter(|parent| !parent.as_os_str().is_empty())
}

fn lock_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_else(|| OsString::from("documents"));
    name.push(".lock");
    path.with_file_name(name)
}

fn load_table(path: &Path) -> Result<DocumentTable, DocumentStoreError> {
    match fs::read_to_string(path) {
        Ok(content) if content.trim().is_empty() => Ok(DocumentTable::default()),
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(DocumentTable::default()),
        Err(error) => Err(DocumentStoreError::Io(error)),
    }
}
