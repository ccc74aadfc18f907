//! Durable storage for a node's term, vote and log entries.
//!
//! Two implementations:
//!
//! - [`FileLogStore`]: a directory holding `meta.json` (term and vote,
//!   replaced atomically via write-fsync-rename) and `log.bin` (append-only
//!   length-prefixed bincode frames, fsynced after every write).
//! - [`MemoryLogStore`]: shared in-memory state for tests. Clones share the
//!   same state, so a "restarted" node can reopen what the old one wrote.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;
use crate::log::LogEntry;
use crate::message::{Index, NodeId, Term};

/// Durable storage for Raft state.
///
/// Every method must be durable when it returns `Ok`.
pub trait LogStore: Send + 'static {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()>;

    fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>)>;

    /// Appends entries after the current last entry.
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()>;

    fn load_log(&self) -> Result<Vec<LogEntry>>;

    /// Removes the entry at `from_index` and everything after it.
    fn truncate_log_from(&mut self, from_index: Index) -> Result<()>;

    /// Extension point for log compaction. Entries up to `index` have been
    /// applied and may be discarded once snapshots exist; until then every
    /// entry is retained.
    fn compact_up_to(&mut self, index: Index) -> Result<()> {
        debug!(index, "compaction requested, retaining all entries");
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Default)]
struct MetaData {
    term: Term,
    voted_for: Option<NodeId>,
}

/// File-backed log store.
pub struct FileLogStore {
    dir: PathBuf,
    log: File,
    /// Byte offset of each entry's frame; `offsets[i]` is index `i + 1`.
    offsets: Vec<u64>,
    len: u64,
}

impl FileLogStore {
    /// Opens or creates a store in `dir`. A torn frame at the end of the log
    /// (a crash mid-append) is cut off.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let path = dir.join("log.bin");
        let log = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        let (offsets, valid_len) = scan_frames(&path)?;
        let file_len = log.metadata()?.len();
        if valid_len < file_len {
            warn!(
                path = %path.display(),
                valid_len,
                file_len,
                "discarding torn entry at end of log"
            );
            log.set_len(valid_len)?;
            log.sync_all()?;
        }

        Ok(Self {
            dir,
            log,
            offsets,
            len: valid_len,
        })
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.bin")
    }
}

/// Reads frame boundaries, stopping at the first incomplete frame.
fn scan_frames(path: &Path) -> Result<(Vec<u64>, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut offsets = Vec::new();
    let mut pos = 0u64;
    loop {
        let mut len_buf = [0u8; 4];
        if !read_exact_or_eof(&mut reader, &mut len_buf)? {
            break;
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        if !read_exact_or_eof(&mut reader, &mut buf)? {
            break;
        }
        if bincode::deserialize::<LogEntry>(&buf).is_err() {
            break;
        }
        offsets.push(pos);
        pos += 4 + len as u64;
    }
    Ok((offsets, pos))
}

/// Like `read_exact`, but reports a clean or partial EOF as `false`.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err),
    }
}

impl LogStore for FileLogStore {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        let json = serde_json::to_vec_pretty(&MetaData { term, voted_for })?;

        let temp_path = self.dir.join("meta.tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&json)?;
        file.sync_all()?;
        fs::rename(&temp_path, self.meta_path())?;
        // Make the rename itself durable.
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }

    fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>)> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok((0, None));
        }
        let meta: MetaData = serde_json::from_slice(&fs::read(&path)?)?;
        Ok((meta.term, meta.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut frames = Vec::new();
        let mut offsets = Vec::with_capacity(entries.len());
        let mut pos = self.len;
        for entry in entries {
            let bytes = bincode::serialize(entry)?;
            offsets.push(pos);
            frames.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
            frames.extend_from_slice(&bytes);
            pos += 4 + bytes.len() as u64;
        }
        // Bytes past `len` are left over from a failed append; the file is
        // opened in append mode, so they must go before new frames land.
        if self.log.metadata()?.len() != self.len {
            self.log.set_len(self.len)?;
        }
        let written = self
            .log
            .write_all(&frames)
            .and_then(|()| self.log.sync_data());
        if let Err(err) = written {
            if let Err(rollback) = self.log.set_len(self.len).and_then(|()| self.log.sync_all()) {
                warn!(error = %rollback, "failed to roll back partial append");
            }
            return Err(err.into());
        }
        self.offsets.extend(offsets);
        self.len = pos;
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>> {
        let mut reader = BufReader::new(File::open(self.log_path())?);
        let mut entries = Vec::with_capacity(self.offsets.len());
        for _ in 0..self.offsets.len() {
            let mut len_buf = [0u8; 4];
            reader.read_exact(&mut len_buf)?;
            let mut buf = vec![0u8; u32::from_be_bytes(len_buf) as usize];
            reader.read_exact(&mut buf)?;
            entries.push(bincode::deserialize(&buf)?);
        }
        Ok(entries)
    }

    fn truncate_log_from(&mut self, from_index: Index) -> Result<()> {
        let keep = from_index.saturating_sub(1) as usize;
        if keep >= self.offsets.len() {
            return Ok(());
        }
        let len = self.offsets[keep];
        self.log.set_len(len)?;
        self.log.sync_all()?;
        self.offsets.truncate(keep);
        self.len = len;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    term: Term,
    voted_for: Option<NodeId>,
    log: Vec<LogEntry>,
}

/// In-memory log store. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryLogStore {
    state: Arc<Mutex<MemoryState>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent write fail, simulating a broken disk.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated write failure").into());
        }
        Ok(())
    }
}

impl LogStore for MemoryLogStore {
    fn save_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        self.check_writable()?;
        let mut state = self.state();
        state.term = term;
        state.voted_for = voted_for;
        Ok(())
    }

    fn load_term_and_vote(&self) -> Result<(Term, Option<NodeId>)> {
        let state = self.state();
        Ok((state.term, state.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.check_writable()?;
        self.state().log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>> {
        Ok(self.state().log.clone())
    }

    fn truncate_log_from(&mut self, from_index: Index) -> Result<()> {
        self.check_writable()?;
        self.state().log.retain(|e| e.index < from_index);
        Ok(())
    }
}
