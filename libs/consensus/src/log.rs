//! Replicated-log helpers
//!
//! The log itself lives inside [`crate::PersistentState`] so one file
//! write captures the whole durable image. These helpers implement the
//! consistency check, the conflict-truncating merge, and the identity
//! diff used by reconciliation. Indices are 1-based and contiguous.

use crate::types::{LogEntry, LogIndex, Term};

pub fn last_index(log: &[LogEntry]) -> LogIndex {
    log.last().map(|e| e.index).unwrap_or(0)
}

pub fn last_term(log: &[LogEntry]) -> Term {
    log.last().map(|e| e.term).unwrap_or(0)
}

pub fn entry_at(log: &[LogEntry], index: LogIndex) -> Option<&LogEntry> {
    if index == 0 {
        return None;
    }
    let entry = log.get((index - 1) as usize)?;
    debug_assert_eq!(entry.index, index);
    Some(entry)
}

pub fn term_at(log: &[LogEntry], index: LogIndex) -> Option<Term> {
    entry_at(log, index).map(|e| e.term)
}

/// Clone every entry at or after `from`.
pub fn entries_from(log: &[LogEntry], from: LogIndex) -> Vec<LogEntry> {
    if from == 0 {
        return log.to_vec();
    }
    let start = (from - 1) as usize;
    if start >= log.len() {
        return Vec::new();
    }
    log[start..].to_vec()
}

/// The AppendEntries consistency check: the receiver must hold the
/// leader's previous entry. Index 0 means "start of log" and always
/// matches.
pub fn matches(log: &[LogEntry], prev_index: LogIndex, prev_term: Term) -> bool {
    if prev_index == 0 {
        return true;
    }
    term_at(log, prev_index) == Some(prev_term)
}

/// True when `entries` continues directly from `prev_index` without
/// gaps. [`merge_entries`] requires this shape, so handlers validate
/// wire batches here before merging.
pub fn contiguous_after(prev_index: LogIndex, entries: &[LogEntry]) -> bool {
    entries
        .iter()
        .zip(prev_index + 1..)
        .all(|(entry, expected)| entry.index == expected)
}

/// Merge incoming entries, truncating any conflicting suffix first.
/// Returns the first truncated index if a conflicting suffix was
/// dropped, so the caller can rewind apply/commit watermarks that
/// already covered the replaced entries.
pub fn merge_entries(log: &mut Vec<LogEntry>, incoming: &[LogEntry]) -> Option<LogIndex> {
    let mut truncated_at = None;
    for entry in incoming {
        match entry_at(log, entry.index) {
            Some(existing) if existing.term == entry.term => {
                // Already have this entry
            }
            Some(_) => {
                // Conflict: drop this entry and everything after it
                log.truncate((entry.index - 1) as usize);
                log.push(entry.clone());
                truncated_at.get_or_insert(entry.index);
            }
            None => {
                debug_assert_eq!(entry.index, last_index(log) + 1);
                log.push(entry.clone());
            }
        }
    }
    truncated_at
}

/// Entries present on `theirs` but absent from `ours` by write identity
/// (term plus command), in donor order. Index positions are ignored so a
/// diverged replica's entries still count as present.
pub fn missing_writes(ours: &[LogEntry], theirs: &[LogEntry]) -> Vec<LogEntry> {
    theirs
        .iter()
        .filter(|candidate| !ours.iter().any(|held| held.same_write(candidate)))
        .cloned()
        .collect()
}
