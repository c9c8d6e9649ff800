//! State machine interface and the in-memory scheduling store
//!
//! The consensus layer never touches the materialized view directly; it
//! hands committed entries to a [`StateMachine`] in strict index order,
//! exactly once per index for the lifetime of the node. Implementations
//! must tolerate replay across restarts (the log is re-applied from the
//! persisted `last_applied` watermark), which in practice means
//! insert-or-ignore semantics keyed on natural ids.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::command::Command;
use crate::types::LogEntry;

/// Errors surfaced by a state machine apply.
///
/// An apply error is logged by the drain loop and the index still
/// advances; it never wedges replication.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("Referenced row does not exist: {0}")]
    MissingRow(String),
}

/// The materialized view updated from committed log entries.
pub trait StateMachine: Send + 'static {
    fn apply(&mut self, entry: &LogEntry) -> Result<(), ApplyError>;
}

/// A scheduled event row.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRow {
    pub group: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub cancelled: bool,
}

/// In-memory scheduling store used by tests and the example shard.
///
/// Mirrors the shard's relational view (users, groups, memberships,
/// events) with insert-or-ignore writes.
#[derive(Debug, Default)]
pub struct MemoryScheduleStore {
    users: BTreeSet<String>,
    groups: BTreeSet<String>,
    members: BTreeSet<(String, String)>,
    events: HashMap<Uuid, EventRow>,
    applied: u64,
}

impl MemoryScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_user(&self, username: &str) -> bool {
        self.users.contains(username)
    }

    pub fn has_group(&self, name: &str) -> bool {
        self.groups.contains(name)
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn members_of(&self, group: &str) -> Vec<String> {
        self.members
            .iter()
            .filter(|(g, _)| g == group)
            .map(|(_, u)| u.clone())
            .collect()
    }

    pub fn event(&self, id: &Uuid) -> Option<&EventRow> {
        self.events.get(id)
    }

    /// Number of apply calls accepted since construction.
    pub fn apply_count(&self) -> u64 {
        self.applied
    }
}

/// Cloneable handle over a [`MemoryScheduleStore`].
///
/// The node owns its state machine, so embedders that want to read the
/// materialized view (query endpoints, assertions in tests) hand the node
/// one clone of this handle and keep another.
#[derive(Debug, Clone, Default)]
pub struct SharedScheduleStore {
    inner: Arc<Mutex<MemoryScheduleStore>>,
}

impl SharedScheduleStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn view(&self) -> MutexGuard<'_, MemoryScheduleStore> {
        self.inner.lock()
    }
}

impl StateMachine for SharedScheduleStore {
    fn apply(&mut self, entry: &LogEntry) -> Result<(), ApplyError> {
        self.inner.lock().apply(entry)
    }
}

impl StateMachine for MemoryScheduleStore {
    fn apply(&mut self, entry: &LogEntry) -> Result<(), ApplyError> {
        self.applied += 1;
        match &entry.command {
            Command::CreateUser { username } => {
                self.users.insert(username.clone());
            }
            Command::CreateGroup { name } => {
                self.groups.insert(name.clone());
            }
            Command::AddMember { group, username } => {
                if !self.groups.contains(group) {
                    return Err(ApplyError::MissingRow(format!("group {group}")));
                }
                self.members.insert((group.clone(), username.clone()));
            }
            Command::CreateEvent {
                event_id,
                group,
                title,
                starts_at,
                ends_at,
            } => {
                if !self.groups.contains(group) {
                    return Err(ApplyError::MissingRow(format!("group {group}")));
                }
                self.events.entry(*event_id).or_insert_with(|| EventRow {
                    group: group.clone(),
                    title: title.clone(),
                    starts_at: *starts_at,
                    ends_at: *ends_at,
                    cancelled: false,
                });
            }
            Command::CancelEvent { event_id } => {
                match self.events.get_mut(event_id) {
                    Some(row) => row.cancelled = true,
                    None => {
                        return Err(ApplyError::MissingRow(format!("event {event_id}")));
                    }
                }
            }
        }
        Ok(())
    }
}
