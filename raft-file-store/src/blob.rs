//! Content storage for file versions.
//!
//! The state machine only tracks metadata; the bytes of each version are
//! handed to a [`BlobStore`] keyed by `(path, version)`. A version is never
//! rewritten with different content, so `put` may safely be repeated when
//! an apply is retried.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::error::Result;

pub trait BlobStore: Send + Sync + 'static {
    fn put(&self, path: &str, version: u64, content: &[u8]) -> Result<()>;

    fn get(&self, path: &str, version: u64) -> Result<Option<Vec<u8>>>;
}

/// Blobs held in memory. Clones share contents.
#[derive(Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<Mutex<HashMap<(String, u64), Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `put` fail, to exercise apply retries.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, path: &str, version: u64, content: &[u8]) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "blob writes disabled").into());
        }
        self.blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((path.to_string(), version), content.to_vec());
        Ok(())
    }

    fn get(&self, path: &str, version: u64) -> Result<Option<Vec<u8>>> {
        Ok(self
            .blobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(path.to_string(), version))
            .cloned())
    }
}

/// Blobs stored as files in one directory.
///
/// File names are the hex-encoded path followed by the version, so any path
/// maps to a flat, filesystem-safe name. Writes go to a temp file, are
/// fsynced and then renamed into place.
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn blob_path(&self, path: &str, version: u64) -> PathBuf {
        self.root
            .join(format!("{}.{version}", hex::encode(path.as_bytes())))
    }
}

impl BlobStore for DirBlobStore {
    fn put(&self, path: &str, version: u64, content: &[u8]) -> Result<()> {
        let final_path = self.blob_path(path, version);
        let tmp_path = final_path.with_extension("tmp");
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp_path, &final_path)?;
        debug!(path, version, bytes = content.len(), "stored blob");
        Ok(())
    }

    fn get(&self, path: &str, version: u64) -> Result<Option<Vec<u8>>> {
        match fs::read(self.blob_path(path, version)) {
            Ok(content) => Ok(Some(content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_store_keys_by_path_and_version() {
        let store = MemoryBlobStore::new();
        store.put("/a", 1, b"one").unwrap();
        store.put("/a", 2, b"two").unwrap();
        assert_eq!(store.get("/a", 1).unwrap().as_deref(), Some(&b"one"[..]));
        assert_eq!(store.get("/a", 3).unwrap(), None);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn memory_store_can_fail_writes() {
        let store = MemoryBlobStore::new();
        store.set_fail_writes(true);
        assert!(store.put("/a", 1, b"x").is_err());
        store.set_fail_writes(false);
        assert!(store.put("/a", 1, b"x").is_ok());
    }

    #[test]
    fn dir_store_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = DirBlobStore::open(dir.path()).unwrap();
            store.put("/docs/report.txt", 1, b"hello").unwrap();
        }
        let store = DirBlobStore::open(dir.path()).unwrap();
        assert_eq!(
            store.get("/docs/report.txt", 1).unwrap().as_deref(),
            Some(&b"hello"[..])
        );
        assert_eq!(store.get("/docs/report.txt", 2).unwrap(), None);
    }
}
