use std::{
    collections::BTreeMap,
    fs,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};

/// Durable key to document persistence. `put` must replace a document atomically.
pub trait RegistryStore: Send + Sync {
    /// Writes or replaces the document for `id`.
    fn put(&self, id: &str, document: &[u8]) -> PipelineResult<()>;
    /// Reads the document for `id`.
    fn get(&self, id: &str) -> PipelineResult<Option<Vec<u8>>>;
    /// Removes the document; returns whether it existed.
    fn remove(&self, id: &str) -> PipelineResult<bool>;
    /// Stored identifiers, sorted.
    fn ids(&self) -> PipelineResult<Vec<String>>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RegistryStore for MemoryStore {
    fn put(&self, id: &str, document: &[u8]) -> PipelineResult<()> {
        self.documents.write().insert(id.to_string(), document.to_vec());
        Ok(())
    }

    fn get(&self, id: &str) -> PipelineResult<Option<Vec<u8>>> {
        Ok(self.documents.read().get(id).cloned())
    }

    fn remove(&self, id: &str) -> PipelineResult<bool> {
        Ok(self.documents.write().remove(id).is_some())
    }

    fn ids(&self) -> PipelineResult<Vec<String>> {
        Ok(self.documents.read().keys().cloned().collect())
    }
}

/// One JSON document per id under a directory. Writes go to a temp file that is renamed into place.
#[derive(Debug, Clone)]
pub struct FsStore {
    root: PathBuf,
}

impl FsStore {
    /// Opens (or creates) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> PipelineResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, id: &str) -> Option<PathBuf> {
        is_safe_id(id).then(|| self.root.join(format!("{id}.json")))
    }
}

fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}

fn write_synced(path: &Path, document: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(document)?;
    file.sync_all()
}

impl RegistryStore for FsStore {
    fn put(&self, id: &str, document: &[u8]) -> PipelineResult<()> {
        let path = self.document_path(id).ok_or_else(|| PipelineError::RegistryCorrupt {
            id: id.to_string(),
            reason: "identifier is not a safe file name".into(),
        })?;
        // unique per write so concurrent writers of one id never share a temp file
        let tmp = self.root.join(format!(".{id}.{}.json.tmp", Uuid::new_v4().simple()));
        let written = write_synced(&tmp, document).and_then(|()| fs::rename(&tmp, &path));
        if written.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        Ok(written?)
    }

    fn get(&self, id: &str) -> PipelineResult<Option<Vec<u8>>> {
        let Some(path) = self.document_path(id) else {
            return Ok(None);
        };
        match fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn remove(&self, id: &str) -> PipelineResult<bool> {
        let Some(path) = self.document_path(id) else {
            return Ok(false);
        };
        match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    fn ids(&self) -> PipelineResult<Vec<String>> {
        let mut ids: Vec<String> = fs::read_dir(&self.root)?
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if path.extension().map_or(false, |ext| ext == "json") {
                    path.file_stem()
                        .and_then(|stem| stem.to_str())
                        .filter(|stem| is_safe_id(stem))
                        .map(str::to_string)
                } else {
                    None
                }
            })
            .collect();
        ids.sort();
        Ok(ids)
    }
}
