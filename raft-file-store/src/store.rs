//! Replicated file state machine.
//!
//! `FileStore` turns committed log entries into file and lease state. Apply
//! is deterministic: it depends only on the current state and the entry,
//! including the entry's leader-assigned timestamp, so every replica that
//! applies the same prefix of the log ends up with the same files, versions
//! and leases.
//!
//! File content goes to a [`BlobStore`]; this module keeps the metadata.
//! An operation is validated first, then its content is written, and only
//! then is the metadata changed. If the blob write fails the entry is left
//! unapplied and the caller retries it.

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::blob::BlobStore;
use crate::command::{ClientId, Operation};
use crate::config::LeasePolicy;
use crate::error::{FileError, Result};
use crate::lease::{Lease, LeaseTable};
use crate::log::{LogEntry, Timestamp};
use crate::message::{Index, Term};

/// One version of a file. Deletion is recorded as a version too.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileVersion {
    pub version: u64,
    pub size: u64,
    pub writer: ClientId,
    pub timestamp: Timestamp,
    pub log_index: Index,
    pub deleted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub path: String,
    pub versions: Vec<FileVersion>,
}

impl File {
    pub fn latest(&self) -> Option<&FileVersion> {
        self.versions.last()
    }

    pub fn is_deleted(&self) -> bool {
        self.latest().map_or(true, |v| v.deleted)
    }

    /// Highest version number ever assigned, tombstones included.
    pub fn current_version(&self) -> u64 {
        self.latest().map_or(0, |v| v.version)
    }
}

/// Successful result of applying an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpResult {
    Created { version: u64 },
    Written { version: u64 },
    Deleted { version: u64 },
    LeaseGranted(Lease),
    LeaseReleased,
    /// Leader barrier entry.
    Noop,
}

/// What applying the entry at `index` produced. Application errors are part
/// of the outcome, not failures of the apply itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub index: Index,
    pub term: Term,
    pub result: std::result::Result<OpResult, FileError>,
}

/// Content and metadata of the latest version of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub version: u64,
    pub content: Vec<u8>,
    pub writer: ClientId,
    pub timestamp: Timestamp,
}

type Outcome = std::result::Result<OpResult, FileError>;

pub struct FileStore {
    files: BTreeMap<String, File>,
    leases: LeaseTable,
    blobs: Arc<dyn BlobStore>,
    policy: LeasePolicy,
    applied_index: Index,
    applied_timestamp: Timestamp,
}

impl FileStore {
    pub fn new(blobs: Arc<dyn BlobStore>, policy: LeasePolicy) -> Self {
        Self {
            files: BTreeMap::new(),
            leases: LeaseTable::new(),
            blobs,
            policy,
            applied_index: 0,
            applied_timestamp: 0,
        }
    }

    pub fn applied_index(&self) -> Index {
        self.applied_index
    }

    /// Timestamp of the last applied entry.
    pub fn applied_timestamp(&self) -> Timestamp {
        self.applied_timestamp
    }

    pub fn files(&self) -> &BTreeMap<String, File> {
        &self.files
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    /// Paths that currently exist.
    pub fn list(&self) -> Vec<String> {
        self.files
            .values()
            .filter(|f| !f.is_deleted())
            .map(|f| f.path.clone())
            .collect()
    }

    /// Applies the next committed entry.
    ///
    /// Returns `Err` only when file content could not be stored; the entry
    /// is then not applied and must be retried.
    pub fn apply(&mut self, entry: &LogEntry) -> Result<ApplyOutcome> {
        assert_eq!(
            entry.index,
            self.applied_index + 1,
            "entries must be applied in log order"
        );
        let result = match &entry.command {
            None => Ok(OpResult::Noop),
            Some(op) => self.execute(op, entry)?,
        };
        self.applied_index = entry.index;
        self.applied_timestamp = self.applied_timestamp.max(entry.timestamp);

        match (&entry.command, &result) {
            (Some(op), Ok(r)) => debug!(
                index = entry.index,
                op = op.name(),
                path = op.path(),
                result = ?r,
                "applied"
            ),
            (Some(op), Err(err)) => info!(
                index = entry.index,
                op = op.name(),
                error = %err,
                "operation rejected"
            ),
            (None, _) => {}
        }
        Ok(ApplyOutcome {
            index: entry.index,
            term: entry.term,
            result,
        })
    }

    fn execute(&mut self, op: &Operation, entry: &LogEntry) -> Result<Outcome> {
        let now = entry.timestamp;
        match op {
            Operation::CreateFile {
                path,
                content,
                writer,
            } => {
                let version = match self.check_create(path, writer, now) {
                    Ok(version) => version,
                    Err(err) => return Ok(Err(err)),
                };
                self.store_version(path, version, content, writer, entry)?;
                Ok(Ok(OpResult::Created { version }))
            }
            Operation::WriteFile {
                path,
                content,
                expected_version,
                writer,
            } => {
                let version = match self.check_write(path, *expected_version, writer, now) {
                    Ok(version) => version,
                    Err(err) => return Ok(Err(err)),
                };
                self.store_version(path, version, content, writer, entry)?;
                Ok(Ok(OpResult::Written { version }))
            }
            Operation::DeleteFile { path, writer } => {
                let version = match self.check_delete(path, writer, now) {
                    Ok(version) => version,
                    Err(err) => return Ok(Err(err)),
                };
                self.push_version(
                    path,
                    FileVersion {
                        version,
                        size: 0,
                        writer: writer.clone(),
                        timestamp: now,
                        log_index: entry.index,
                        deleted: true,
                    },
                );
                Ok(Ok(OpResult::Deleted { version }))
            }
            Operation::AcquireLease {
                path,
                holder,
                duration,
            } => Ok(self
                .leases
                .acquire(path, holder, *duration, now, entry.index)
                .map(OpResult::LeaseGranted)),
            Operation::ReleaseLease { path, holder } => Ok(self
                .leases
                .release(path, holder, now)
                .map(|_| OpResult::LeaseReleased)),
        }
    }

    fn live_file(&self, path: &str) -> std::result::Result<&File, FileError> {
        self.files
            .get(path)
            .filter(|f| !f.is_deleted())
            .ok_or_else(|| FileError::NotFound {
                path: path.to_string(),
            })
    }

    fn check_create(
        &self,
        path: &str,
        writer: &str,
        now: Timestamp,
    ) -> std::result::Result<u64, FileError> {
        let existing = self.files.get(path);
        if existing.is_some_and(|f| !f.is_deleted()) {
            return Err(FileError::AlreadyExists {
                path: path.to_string(),
            });
        }
        self.leases.check_write(path, writer, now, self.policy)?;
        Ok(existing.map_or(0, File::current_version) + 1)
    }

    fn check_write(
        &self,
        path: &str,
        expected: u64,
        writer: &str,
        now: Timestamp,
    ) -> std::result::Result<u64, FileError> {
        let file = self.live_file(path)?;
        self.leases.check_write(path, writer, now, self.policy)?;
        let actual = file.current_version();
        if actual != expected {
            return Err(FileError::VersionConflict {
                path: path.to_string(),
                expected,
                actual,
            });
        }
        Ok(actual + 1)
    }

    fn check_delete(
        &self,
        path: &str,
        writer: &str,
        now: Timestamp,
    ) -> std::result::Result<u64, FileError> {
        let file = self.live_file(path)?;
        self.leases.check_write(path, writer, now, self.policy)?;
        Ok(file.current_version() + 1)
    }

    fn store_version(
        &mut self,
        path: &str,
        version: u64,
        content: &[u8],
        writer: &str,
        entry: &LogEntry,
    ) -> Result<()> {
        self.blobs.put(path, version, content)?;
        self.push_version(
            path,
            FileVersion {
                version,
                size: content.len() as u64,
                writer: writer.to_string(),
                timestamp: entry.timestamp,
                log_index: entry.index,
                deleted: false,
            },
        );
        Ok(())
    }

    fn push_version(&mut self, path: &str, version: FileVersion) {
        self.files
            .entry(path.to_string())
            .or_insert_with(|| File {
                path: path.to_string(),
                versions: Vec::new(),
            })
            .versions
            .push(version);
    }

    /// Latest content of a live file.
    pub fn read(&self, path: &str) -> Result<FileContent> {
        let file = self.live_file(path)?;
        let Some(latest) = file.latest() else {
            return Err(FileError::NotFound {
                path: path.to_string(),
            }
            .into());
        };
        let content = self.blobs.get(path, latest.version)?.ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("content of {path} version {} is missing", latest.version),
            )
        })?;
        Ok(FileContent {
            path: path.to_string(),
            version: latest.version,
            content,
            writer: latest.writer.clone(),
            timestamp: latest.timestamp,
        })
    }

    /// Every version of a path, including deletions.
    pub fn history(&self, path: &str) -> std::result::Result<&[FileVersion], FileError> {
        self.files
            .get(path)
            .map(|f| f.versions.as_slice())
            .ok_or_else(|| FileError::NotFound {
                path: path.to_string(),
            })
    }

    /// The lease on `path` as of `now`.
    pub fn lease(&self, path: &str, now: Timestamp) -> Option<&Lease> {
        self.leases.active(path, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;
    use crate::error::Error;
    use std::time::Duration;

    struct Harness {
        store: FileStore,
        blobs: MemoryBlobStore,
        next_index: Index,
    }

    impl Harness {
        fn new(policy: LeasePolicy) -> Self {
            let blobs = MemoryBlobStore::new();
            Self {
                store: FileStore::new(Arc::new(blobs.clone()), policy),
                blobs,
                next_index: 1,
            }
        }

        fn entry(&self, timestamp: Timestamp, op: Operation) -> LogEntry {
            LogEntry {
                index: self.next_index,
                term: 1,
                timestamp,
                command: Some(op),
            }
        }

        fn apply(&mut self, timestamp: Timestamp, op: Operation) -> Outcome {
            let entry = self.entry(timestamp, op);
            let outcome = self.store.apply(&entry).unwrap();
            self.next_index += 1;
            outcome.result
        }
    }

    fn create(path: &str, content: &str, writer: &str) -> Operation {
        Operation::CreateFile {
            path: path.into(),
            content: content.into(),
            writer: writer.into(),
        }
    }

    fn write(path: &str, content: &str, expected_version: u64, writer: &str) -> Operation {
        Operation::WriteFile {
            path: path.into(),
            content: content.into(),
            expected_version,
            writer: writer.into(),
        }
    }

    fn delete(path: &str, writer: &str) -> Operation {
        Operation::DeleteFile {
            path: path.into(),
            writer: writer.into(),
        }
    }

    fn lease(path: &str, holder: &str, secs: u64) -> Operation {
        Operation::AcquireLease {
            path: path.into(),
            holder: holder.into(),
            duration: Duration::from_secs(secs),
        }
    }

    #[test]
    fn create_then_read_returns_version_one() {
        let mut h = Harness::new(LeasePolicy::Optional);
        assert_eq!(
            h.apply(100, create("/a", "hello", "alice")),
            Ok(OpResult::Created { version: 1 })
        );
        let file = h.store.read("/a").unwrap();
        assert_eq!(file.content, b"hello");
        assert_eq!(file.version, 1);
        assert_eq!(file.writer, "alice");
        assert_eq!(file.timestamp, 100);
    }

    #[test]
    fn create_existing_path_fails() {
        let mut h = Harness::new(LeasePolicy::Optional);
        h.apply(1, create("/a", "x", "alice")).unwrap();
        assert_eq!(
            h.apply(2, create("/a", "y", "bob")),
            Err(FileError::AlreadyExists { path: "/a".into() })
        );
        assert_eq!(h.store.applied_index(), 2);
    }

    #[test]
    fn concurrent_writes_conflict_on_version() {
        let mut h = Harness::new(LeasePolicy::Optional);
        h.apply(1, create("/a", "v1", "alice")).unwrap();
        assert_eq!(
            h.apply(2, write("/a", "c1", 1, "alice")),
            Ok(OpResult::Written { version: 2 })
        );
        assert_eq!(
            h.apply(3, write("/a", "c2", 1, "bob")),
            Err(FileError::VersionConflict {
                path: "/a".into(),
                expected: 1,
                actual: 2
            })
        );
        assert_eq!(h.store.read("/a").unwrap().content, b"c1");
    }

    #[test]
    fn delete_keeps_history_and_recreate_continues_versions() {
        let mut h = Harness::new(LeasePolicy::Optional);
        h.apply(1, create("/a", "one", "alice")).unwrap();
        assert_eq!(h.apply(2, delete("/a", "alice")), Ok(OpResult::Deleted { version: 2 }));
        assert!(matches!(
            h.store.read("/a"),
            Err(Error::File(FileError::NotFound { .. }))
        ));
        assert_eq!(
            h.apply(3, delete("/a", "alice")),
            Err(FileError::NotFound { path: "/a".into() })
        );
        assert_eq!(
            h.apply(4, write("/a", "x", 2, "alice")),
            Err(FileError::NotFound { path: "/a".into() })
        );
        assert_eq!(h.apply(5, create("/a", "two", "bob")), Ok(OpResult::Created { version: 3 }));

        let history = h.store.history("/a").unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[1].deleted);
        assert_eq!(h.store.read("/a").unwrap().content, b"two");
        assert_eq!(h.store.list(), vec!["/a".to_string()]);
    }

    #[test]
    fn lease_blocks_other_writers_until_expiry() {
        let mut h = Harness::new(LeasePolicy::Optional);
        h.apply(0, create("/a", "v1", "node-a")).unwrap();
        assert!(matches!(
            h.apply(1_000, lease("/a", "node-a", 10)),
            Ok(OpResult::LeaseGranted(_))
        ));
        assert_eq!(
            h.apply(5_000, write("/a", "b", 1, "node-b")),
            Err(FileError::NotLeaseHolder {
                path: "/a".into(),
                holder: Some("node-a".into())
            })
        );
        assert_eq!(
            h.apply(11_000, write("/a", "b", 1, "node-b")),
            Ok(OpResult::Written { version: 2 })
        );
    }

    #[test]
    fn required_policy_demands_a_lease() {
        let mut h = Harness::new(LeasePolicy::Required);
        assert_eq!(
            h.apply(0, create("/a", "x", "alice")),
            Err(FileError::LeaseRequired { path: "/a".into() })
        );
        h.apply(0, lease("/a", "alice", 5)).unwrap();
        assert_eq!(h.apply(1, create("/a", "x", "alice")), Ok(OpResult::Created { version: 1 }));
        assert_eq!(
            h.apply(2, delete("/a", "bob")),
            Err(FileError::NotLeaseHolder {
                path: "/a".into(),
                holder: Some("alice".into())
            })
        );
    }

    #[test]
    fn release_requires_holder() {
        let mut h = Harness::new(LeasePolicy::Optional);
        h.apply(0, lease("/a", "alice", 5)).unwrap();
        let release = |holder: &str| Operation::ReleaseLease {
            path: "/a".into(),
            holder: holder.into(),
        };
        assert!(matches!(
            h.apply(1, release("bob")),
            Err(FileError::NotLeaseHolder { .. })
        ));
        assert_eq!(h.apply(2, release("alice")), Ok(OpResult::LeaseReleased));
        assert!(h.store.lease("/a", 3).is_none());
    }

    #[test]
    fn failed_blob_write_leaves_entry_unapplied() {
        let mut h = Harness::new(LeasePolicy::Optional);
        h.blobs.set_fail_writes(true);
        let entry = h.entry(1, create("/a", "x", "alice"));
        assert!(h.store.apply(&entry).is_err());
        assert_eq!(h.store.applied_index(), 0);
        assert!(h.store.files().is_empty());

        h.blobs.set_fail_writes(false);
        let outcome = h.store.apply(&entry).unwrap();
        assert_eq!(outcome.result, Ok(OpResult::Created { version: 1 }));
    }

    #[test]
    fn replicas_applying_the_same_log_agree() {
        let ops = vec![
            create("/a", "1", "alice"),
            lease("/a", "alice", 2),
            write("/a", "2", 1, "bob"),
            write("/a", "3", 1, "alice"),
            delete("/a", "alice"),
            create("/b", "x", "bob"),
            create("/a", "again", "bob"),
        ];
        let mut first = Harness::new(LeasePolicy::Optional);
        let mut second = Harness::new(LeasePolicy::Optional);
        for (i, op) in ops.into_iter().enumerate() {
            let ts = i as Timestamp * 700;
            assert_eq!(first.apply(ts, op.clone()), second.apply(ts, op));
        }
        assert_eq!(first.store.files(), second.store.files());
        assert_eq!(first.store.leases(), second.store.leases());
    }

    #[test]
    fn barrier_entries_only_advance_the_index() {
        let mut h = Harness::new(LeasePolicy::Optional);
        let outcome = h
            .store
            .apply(&LogEntry {
                index: 1,
                term: 3,
                timestamp: 9,
                command: None,
            })
            .unwrap();
        assert_eq!(outcome.result, Ok(OpResult::Noop));
        assert_eq!(h.store.applied_index(), 1);
        assert!(h.blobs.is_empty());
    }
}
