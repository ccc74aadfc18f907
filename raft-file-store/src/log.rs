//! The replicated log as seen by one node.
//!
//! `Log` keeps every entry in memory and writes through to a [`LogStore`]
//! before changing anything in memory, so a crash can only lose state that
//! was never acknowledged. It also owns the node's durable term and vote,
//! which must be persisted together with the log before any reply is sent.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::command::Operation;
use crate::error::{Error, Result};
use crate::message::{Index, NodeId, Term};
use crate::storage::LogStore;

/// Milliseconds since the UNIX epoch.
pub type Timestamp = u64;

pub fn now_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as Timestamp)
        .unwrap_or(0)
}

/// A single entry in the replicated log.
///
/// `command` is `None` for the barrier entry a new leader appends to commit
/// entries from earlier terms. `timestamp` is assigned by the leader and is
/// the only clock the state machine ever consults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: Index,
    pub term: Term,
    pub timestamp: Timestamp,
    pub command: Option<Operation>,
}

pub struct Log<S: LogStore> {
    store: S,
    /// `entries[i]` holds index `i + 1`.
    entries: Vec<LogEntry>,
    term: Term,
    voted_for: Option<NodeId>,
}

impl<S: LogStore> Log<S> {
    /// Loads term, vote and entries from the store.
    pub fn open(store: S) -> Result<Self> {
        let (term, voted_for) = store.load_term_and_vote()?;
        let entries = store.load_log()?;
        for (i, entry) in entries.iter().enumerate() {
            if entry.index != i as Index + 1 {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("log entry {} found at position {}", entry.index, i + 1),
                )));
            }
        }
        if let Some(last) = entries.last() {
            if last.term > term {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("log term {} is ahead of stored term {term}", last.term),
                )));
            }
        }
        debug!(term, entries = entries.len(), "opened log");
        Ok(Self {
            store,
            entries,
            term,
            voted_for,
        })
    }

    pub fn term(&self) -> Term {
        self.term
    }

    pub fn voted_for(&self) -> Option<NodeId> {
        self.voted_for
    }

    /// Durably records the term and vote. Nothing changes in memory if the
    /// write fails.
    pub fn set_term_and_vote(&mut self, term: Term, voted_for: Option<NodeId>) -> Result<()> {
        assert!(term >= self.term, "term regression {} -> {term}", self.term);
        if term == self.term && voted_for == self.voted_for {
            return Ok(());
        }
        self.store.save_term_and_vote(term, voted_for)?;
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    pub fn last_index(&self) -> Index {
        self.entries.len() as Index
    }

    pub fn last_term(&self) -> Term {
        self.entries.last().map_or(0, |e| e.term)
    }

    pub fn last_timestamp(&self) -> Timestamp {
        self.entries.last().map_or(0, |e| e.timestamp)
    }

    /// Term of the entry at `index`; index 0 has term 0.
    pub fn term_at(&self, index: Index) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        self.get(index).map(|e| e.term)
    }

    pub fn get(&self, index: Index) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.entries.get(index as usize - 1)
    }

    /// Entries in `from..=to`, clamped to the log.
    pub fn range(&self, from: Index, to: Index) -> &[LogEntry] {
        let start = from.max(1) as usize - 1;
        let end = (to.min(self.last_index())) as usize;
        if start >= end {
            return &[];
        }
        &self.entries[start..end]
    }

    /// Up to `max` entries starting at `from`.
    pub fn entries_from(&self, from: Index, max: usize) -> Vec<LogEntry> {
        let to = from.saturating_add(max as Index).saturating_sub(1);
        self.range(from, to).to_vec()
    }

    /// Whether a candidate whose log ends at `(last_index, last_term)` is at
    /// least as up to date as this log.
    pub fn is_up_to_date(&self, last_index: Index, last_term: Term) -> bool {
        let (our_index, our_term) = (self.last_index(), self.last_term());
        last_term > our_term || (last_term == our_term && last_index >= our_index)
    }

    /// Appends a new entry in the current term. Used by the leader.
    pub fn append(&mut self, timestamp: Timestamp, command: Option<Operation>) -> Result<Index> {
        let entry = LogEntry {
            index: self.last_index() + 1,
            term: self.term,
            timestamp: timestamp.max(self.last_timestamp()),
            command,
        };
        self.store.append_entries(std::slice::from_ref(&entry))?;
        let index = entry.index;
        self.entries.push(entry);
        Ok(index)
    }

    /// Merges entries received from a leader. Entries already present with
    /// the same term are skipped; the first conflicting entry and everything
    /// after it is replaced. Returns the index of the first replaced entry,
    /// if any was.
    ///
    /// Callers must have checked that the entries directly follow a matching
    /// prefix, and that no committed entry is replaced.
    pub fn splice(&mut self, entries: Vec<LogEntry>) -> Result<Option<Index>> {
        let matching = entries
            .iter()
            .take_while(|e| self.term_at(e.index) == Some(e.term))
            .count();
        let rest: Vec<LogEntry> = entries.into_iter().skip(matching).collect();
        let Some(first) = rest.first().map(|e| e.index) else {
            return Ok(None);
        };
        assert!(first <= self.last_index() + 1, "gap in spliced entries at {first}");

        let mut truncated = None;
        if first <= self.last_index() {
            self.store.truncate_log_from(first)?;
            self.entries.truncate(first as usize - 1);
            truncated = Some(first);
        }
        self.store.append_entries(&rest)?;
        self.entries.extend(rest);
        Ok(truncated)
    }

    /// Hands the compaction hook to the store.
    pub fn compact_up_to(&mut self, index: Index) -> Result<()> {
        self.store.compact_up_to(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryLogStore;

    fn entry(index: Index, term: Term) -> LogEntry {
        LogEntry {
            index,
            term,
            timestamp: index * 10,
            command: None,
        }
    }

    fn log_with_terms(terms: &[Term]) -> Log<MemoryLogStore> {
        let mut log = Log::open(MemoryLogStore::new()).unwrap();
        let max = terms.iter().copied().max().unwrap_or(0);
        log.set_term_and_vote(max, None).unwrap();
        let entries = terms
            .iter()
            .enumerate()
            .map(|(i, t)| entry(i as Index + 1, *t))
            .collect();
        log.splice(entries).unwrap();
        log
    }

    #[test]
    fn empty_log_reports_zero_positions() {
        let log = Log::open(MemoryLogStore::new()).unwrap();
        assert_eq!(log.last_index(), 0);
        assert_eq!(log.last_term(), 0);
        assert_eq!(log.term_at(0), Some(0));
        assert_eq!(log.term_at(1), None);
        assert!(log.range(1, 5).is_empty());
    }

    #[test]
    fn append_uses_current_term_and_keeps_timestamps_monotonic() {
        let mut log = Log::open(MemoryLogStore::new()).unwrap();
        log.set_term_and_vote(3, Some(1)).unwrap();
        assert_eq!(log.append(500, None).unwrap(), 1);
        assert_eq!(log.append(100, None).unwrap(), 2);
        assert_eq!(log.get(2).unwrap().term, 3);
        assert_eq!(log.get(2).unwrap().timestamp, 500);
    }

    #[test]
    fn splice_skips_matching_entries() {
        let mut log = log_with_terms(&[1, 1, 2]);
        let truncated = log.splice(vec![entry(2, 1), entry(3, 2), entry(4, 2)]).unwrap();
        assert_eq!(truncated, None);
        assert_eq!(log.last_index(), 4);
    }

    #[test]
    fn splice_replaces_conflicting_suffix() {
        let mut log = log_with_terms(&[1, 1, 2, 2]);
        let truncated = log.splice(vec![entry(3, 3)]).unwrap();
        assert_eq!(truncated, Some(3));
        assert_eq!(log.last_index(), 3);
        assert_eq!(log.term_at(3), Some(3));
    }

    #[test]
    fn up_to_date_compares_term_then_index() {
        let log = log_with_terms(&[1, 2, 2]);
        assert!(log.is_up_to_date(3, 2));
        assert!(log.is_up_to_date(1, 3));
        assert!(!log.is_up_to_date(2, 2));
        assert!(!log.is_up_to_date(10, 1));
    }

    #[test]
    fn entries_from_respects_batch_size() {
        let log = log_with_terms(&[1, 1, 1, 1, 1]);
        let batch = log.entries_from(2, 2);
        assert_eq!(batch.iter().map(|e| e.index).collect::<Vec<_>>(), vec![2, 3]);
        assert!(log.entries_from(6, 10).is_empty());
    }

    #[test]
    fn reopen_restores_term_vote_and_entries() {
        let store = MemoryLogStore::new();
        {
            let mut log = Log::open(store.clone()).unwrap();
            log.set_term_and_vote(2, Some(3)).unwrap();
            log.append(1, None).unwrap();
        }
        let log = Log::open(store).unwrap();
        assert_eq!(log.term(), 2);
        assert_eq!(log.voted_for(), Some(3));
        assert_eq!(log.last_index(), 1);
    }

    #[test]
    fn failed_vote_write_leaves_memory_untouched() {
        let store = MemoryLogStore::new();
        let mut log = Log::open(store.clone()).unwrap();
        store.set_fail_writes(true);
        assert!(log.set_term_and_vote(5, Some(2)).is_err());
        assert_eq!(log.term(), 0);
        assert_eq!(log.voted_for(), None);
    }
}
