//! Core types shared across the consensus implementation

use serde::{Deserialize, Serialize};

use crate::command::Command;

/// Election term number.
///
/// Terms detect stale leaders. Every election attempt increments the
/// candidate's term; any message carrying a higher term forces the
/// receiver to step down.
pub type Term = u64;

/// Index into the replicated log. Indices are 1-based and contiguous;
/// 0 means "no entry".
pub type LogIndex = u64;

/// Logical identifier for a node in the shard, e.g. `events-2`.
pub type NodeId = String;

/// A single entry in the replicated log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: Term,

    /// The log index for this entry
    pub index: LogIndex,

    /// The scheduling command to apply to the state machine
    pub command: Command,
}

impl LogEntry {
    pub fn new(term: Term, index: LogIndex, command: Command) -> Self {
        Self {
            term,
            index,
            command,
        }
    }

    /// Identity used by reconciliation: two entries are the same logical
    /// write when they agree on term and command, regardless of the index
    /// they ended up at on a diverged replica.
    pub fn same_write(&self, other: &LogEntry) -> bool {
        self.term == other.term && self.command == other.command
    }
}
