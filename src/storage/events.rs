//! Audit event storage and retrieval.
//!
//! Every mutation records one row here, independent of the `change_log`
//! table the watcher subsystem reads — `events` is the full audit trail
//! (old/new values, actor, optional comment); `change_log` is a thin
//! watcher-facing feed over the same mutations.

use rusqlite::{Connection, Result};

/// Event types for audit logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    SessionCreated,
    SessionUpdated,
    SessionDeleted,

    ItemCreated,
    ItemUpdated,
    ItemDeleted,

    RelationshipCreated,
    RelationshipDeleted,

    CheckpointCreated,
    CheckpointRestored,
    CheckpointDeleted,
    BranchCreated,
    BranchMerged,

    JournalEntryAdded,

    CompressionRun,

    ToolEventRecorded,
}

impl EventType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::SessionCreated => "session_created",
            Self::SessionUpdated => "session_updated",
            Self::SessionDeleted => "session_deleted",
            Self::ItemCreated => "item_created",
            Self::ItemUpdated => "item_updated",
            Self::ItemDeleted => "item_deleted",
            Self::RelationshipCreated => "relationship_created",
            Self::RelationshipDeleted => "relationship_deleted",
            Self::CheckpointCreated => "checkpoint_created",
            Self::CheckpointRestored => "checkpoint_restored",
            Self::CheckpointDeleted => "checkpoint_deleted",
            Self::BranchCreated => "branch_created",
            Self::BranchMerged => "branch_merged",
            Self::JournalEntryAdded => "journal_entry_added",
            Self::CompressionRun => "compression_run",
            Self::ToolEventRecorded => "tool_event_recorded",
        }
    }
}

/// An audit event record.
#[derive(Debug, Clone)]
pub struct Event {
    pub id: i64,
    pub entity_type: String,
    pub entity_id: String,
    pub event_type: EventType,
    pub actor: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub comment: Option<String>,
    pub created_at: i64,
}

impl Event {
    #[must_use]
    pub fn new(entity_type: &str, entity_id: &str, event_type: EventType, actor: &str) -> Self {
        Self {
            id: 0,
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            event_type,
            actor: actor.to_string(),
            old_value: None,
            new_value: None,
            comment: None,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[must_use]
    pub fn with_values(mut self, old: Option<String>, new: Option<String>) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }

    #[must_use]
    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }
}

/// Insert an event into the database.
///
/// # Errors
///
/// Returns an error if the insert fails.
pub fn insert_event(conn: &Connection, event: &Event) -> Result<i64> {
    conn.execute(
        "INSERT INTO events (entity_type, entity_id, event_type, actor, old_value, new_value, comment, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        rusqlite::params![
            event.entity_type,
            event.entity_id,
            event.event_type.as_str(),
            event.actor,
            event.old_value,
            event.new_value,
            event.comment,
            event.created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Get events for an entity, most recent first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_events(
    conn: &Connection,
    entity_type: &str,
    entity_id: &str,
    limit: Option<u32>,
) -> Result<Vec<Event>> {
    let limit = limit.unwrap_or(100);
    let mut stmt = conn.prepare(
        "SELECT id, entity_type, entity_id, event_type, actor, old_value, new_value, comment, created_at
         FROM events
         WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY created_at DESC
         LIMIT ?3",
    )?;

    let rows = stmt.query_map(rusqlite::params![entity_type, entity_id, limit], |row| {
        Ok(Event {
            id: row.get(0)?,
            entity_type: row.get(1)?,
            entity_id: row.get(2)?,
            event_type: parse_event_type(row.get::<_, String>(3)?.as_str()),
            actor: row.get(4)?,
            old_value: row.get(5)?,
            new_value: row.get(6)?,
            comment: row.get(7)?,
            created_at: row.get(8)?,
        })
    })?;

    rows.collect()
}

fn parse_event_type(s: &str) -> EventType {
    match s {
        "session_created" => EventType::SessionCreated,
        "session_updated" => EventType::SessionUpdated,
        "session_deleted" => EventType::SessionDeleted,
        "item_created" => EventType::ItemCreated,
        "item_updated" => EventType::ItemUpdated,
        "item_deleted" => EventType::ItemDeleted,
        "relationship_created" => EventType::RelationshipCreated,
        "relationship_deleted" => EventType::RelationshipDeleted,
        "checkpoint_created" => EventType::CheckpointCreated,
        "checkpoint_restored" => EventType::CheckpointRestored,
        "checkpoint_deleted" => EventType::CheckpointDeleted,
        "branch_created" => EventType::BranchCreated,
        "branch_merged" => EventType::BranchMerged,
        "journal_entry_added" => EventType::JournalEntryAdded,
        "compression_run" => EventType::CompressionRun,
        "tool_event_recorded" => EventType::ToolEventRecorded,
        _ => EventType::SessionUpdated,
    }
}
