//! Scheduling commands carried by the replicated log
//!
//! Every write to a shard is one of these operations. The enum is the
//! single schema for both the wire format and the persisted state file,
//! serialized as internally tagged JSON (`{"op": "create_group", ...}`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A single scheduling operation.
///
/// Commands must apply idempotently: replicas may replay an entry after a
/// restart or receive the same write again through reconciliation, so every
/// operation is keyed on a natural id and re-application is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    /// Register a user account.
    CreateUser { username: String },

    /// Create a scheduling group.
    CreateGroup { name: String },

    /// Add an existing user to an existing group.
    AddMember { group: String, username: String },

    /// Schedule an event for a group. The id is supplied by the caller so
    /// retries and replays collapse onto one event.
    CreateEvent {
        event_id: Uuid,
        group: String,
        title: String,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
    },

    /// Cancel a previously scheduled event.
    CancelEvent { event_id: Uuid },
}

impl Command {
    /// Short operation name, used in log lines.
    pub fn op_name(&self) -> &'static str {
        match self {
            Command::CreateUser { .. } => "create_user",
            Command::CreateGroup { .. } => "create_group",
            Command::AddMember { .. } => "add_member",
            Command::CreateEvent { .. } => "create_event",
            Command::CancelEvent { .. } => "cancel_event",
        }
    }
}
