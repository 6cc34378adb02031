//! # log
//!
//! why: manage the replicated log of commands and hand committed commands to an output sink
//! relations: used by node.rs for replication, carried in message.rs payloads, sinks implemented by raft-storage
//! what: Term/LogIndex aliases, LogEntry, ApplySink trait, MemorySink

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Logical election epoch. Client-origin messages carry [`NO_TERM`].
pub type Term = i64;

/// Zero-based position in the log. [`NO_INDEX`] means "before the first entry".
pub type LogIndex = i64;

/// Sentinel term for messages where a term does not apply, and for "no entry".
pub const NO_TERM: Term = -1;

/// Sentinel index for an empty prefix.
pub const NO_INDEX: LogIndex = -1;

/// A single entry in the replicated log.
///
/// Entries are never mutated once created; followers receive copies inside
/// AppendEntries payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term in which the leader created this entry
    pub term: Term,
    /// The command to append to the output log once committed
    pub command: String,
}

impl LogEntry {
    pub fn new(term: Term, command: impl Into<String>) -> Self {
        Self {
            term,
            command: command.into(),
        }
    }
}

/// Term of the entry at `index`, or [`NO_TERM`] when there is none.
pub fn term_at(log: &[LogEntry], index: LogIndex) -> Term {
    entry_at(log, index).map_or(NO_TERM, |entry| entry.term)
}

pub fn entry_at(log: &[LogEntry], index: LogIndex) -> Option<&LogEntry> {
    usize::try_from(index).ok().and_then(|i| log.get(i))
}

/// Index of the last entry, [`NO_INDEX`] for an empty log.
pub fn last_index(log: &[LogEntry]) -> LogIndex {
    log.len() as LogIndex - 1
}

/// Destination for committed commands, written in commit order.
pub trait ApplySink {
    /// Record the entry applied at `index`.
    fn append(&mut self, index: LogIndex, entry: &LogEntry) -> Result<()>;
}

/// In-memory sink; clones share the same buffer so tests can inspect what a node applied.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ApplySink for MemorySink {
    fn append(&mut self, _index: LogIndex, entry: &LogEntry) -> Result<()> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry.command.clone());
        Ok(())
    }
}
