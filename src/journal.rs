//! Journal entries and the cross-entity timeline (SPEC_FULL §11 supplemented
//! feature): a per-session append-only log, plus a read-only merged view
//! over journal entries, item creation, and checkpoint creation.
//!
//! Grounded in the teacher's `events` audit trail: append-only rows with a
//! timestamp, queried by time range, never mutated after insert.

use crate::error::Result;
use crate::model::JournalEntry;
use crate::storage::events::EventType;
use crate::storage::Driver;
use rusqlite::params;
use uuid::Uuid;

/// Append a journal entry to a session.
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn add(
    driver: &mut Driver,
    actor: &str,
    session_id: &str,
    entry: &str,
    tags: Option<&str>,
) -> Result<JournalEntry> {
    let id = format!("journal_{}", Uuid::new_v4());
    let now = chrono::Utc::now().timestamp_millis();

    driver.mutate("add_journal_entry", actor, |tx, ctx| {
        tx.execute(
            "INSERT INTO journal_entries (id, session_id, entry, tags, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, session_id, entry, tags, now],
        )?;
        ctx.record_event("journal_entry", &id, EventType::JournalEntryAdded);
        Ok(())
    })?;

    Ok(JournalEntry {
        id,
        session_id: session_id.to_string(),
        entry: entry.to_string(),
        tags: tags.map(str::to_string),
        created_at: now,
    })
}

/// List journal entries for a session, oldest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list(driver: &Driver, session_id: &str) -> Result<Vec<JournalEntry>> {
    let mut stmt = driver.conn().prepare(
        "SELECT id, session_id, entry, tags, created_at
         FROM journal_entries WHERE session_id = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map([session_id], |row| {
        Ok(JournalEntry {
            id: row.get(0)?,
            session_id: row.get(1)?,
            entry: row.get(2)?,
            tags: row.get(3)?,
            created_at: row.get(4)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(crate::error::Error::from)
}

/// Append a `ToolEvent` recording that `tool_name` touched `session_id`,
/// distinct from the storage driver's own `events` mutation-audit table
/// (spec §3's "append-only record of which tool touched which session").
///
/// # Errors
///
/// Returns an error if the write fails.
pub fn record_tool_event(
    driver: &mut Driver,
    actor: &str,
    session_id: &str,
    tool_name: &str,
    payload: Option<&str>,
) -> Result<()> {
    let id = format!("toolevent_{}", Uuid::new_v4());
    let now = chrono::Utc::now().timestamp_millis();
    driver.mutate("record_tool_event", actor, |tx, ctx| {
        tx.execute(
            "INSERT INTO tool_events (id, session_id, tool_name, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, session_id, tool_name, payload, now],
        )?;
        ctx.record_event("tool_event", &id, EventType::ToolEventRecorded);
        Ok(())
    })
}

/// List `ToolEvent`s for a session, oldest first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list_tool_events(driver: &Driver, session_id: &str) -> Result<Vec<crate::model::ToolEvent>> {
    let mut stmt = driver.conn().prepare(
        "SELECT id, session_id, tool_name, payload, created_at
         FROM tool_events WHERE session_id = ?1 ORDER BY created_at ASC",
    )?;
    let rows = stmt.query_map([session_id], |row| {
        Ok(crate::model::ToolEvent {
            id: row.get(0)?,
            session_id: row.get(1)?,
            tool_name: row.get(2)?,
            payload: row.get(3)?,
            created_at: row.get(4)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(crate::error::Error::from)
}

/// One chronologically-ordered entry in a session's [`timeline`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct TimelineEntry {
    pub kind: TimelineKind,
    pub id: String,
    pub summary: String,
    pub created_at: i64,
}

/// Which table a [`TimelineEntry`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineKind {
    ItemCreated,
    JournalEntry,
    CheckpointCreated,
}

/// Merge item creation, journal entries, and checkpoint creation for a
/// session into one chronologically sorted feed.
///
/// # Errors
///
/// Returns an error if any underlying query fails.
pub fn timeline(driver: &Driver, session_id: &str) -> Result<Vec<TimelineEntry>> {
    let conn = driver.conn();
    let mut entries = Vec::new();

    let mut stmt = conn.prepare(
        "SELECT id, key, created_at FROM context_items WHERE session_id = ?1",
    )?;
    let items = stmt.query_map([session_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
    })?;
    for row in items {
        let (id, key, created_at) = row?;
        entries.push(TimelineEntry {
            kind: TimelineKind::ItemCreated,
            id,
            summary: format!("saved '{key}'"),
            created_at,
        });
    }
    drop(stmt);

    let mut stmt = conn.prepare(
        "SELECT id, entry, created_at FROM journal_entries WHERE session_id = ?1",
    )?;
    let journal_rows = stmt.query_map([session_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
    })?;
    for row in journal_rows {
        let (id, entry, created_at) = row?;
        entries.push(TimelineEntry { kind: TimelineKind::JournalEntry, id, summary: entry, created_at });
    }
    drop(stmt);

    let mut stmt = conn.prepare(
        "SELECT id, name, created_at FROM checkpoints WHERE session_id = ?1",
    )?;
    let checkpoint_rows = stmt.query_map([session_id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, i64>(2)?))
    })?;
    for row in checkpoint_rows {
        let (id, name, created_at) = row?;
        entries.push(TimelineEntry {
            kind: TimelineKind::CheckpointCreated,
            id,
            summary: format!("checkpoint '{name}'"),
            created_at,
        });
    }

    entries.sort_by_key(|e| e.created_at);
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint;
    use crate::repository::{self, SaveInput};
    use crate::session::{self, NewSession};

    #[test]
    fn timeline_merges_all_three_sources_in_order() {
        let mut driver = Driver::open_memory().unwrap();
        let s = session::create(&mut driver, "actor", NewSession::default()).unwrap().id;
        repository::save(&mut driver, "actor", &s, "general", SaveInput {
            key: "a".to_string(), value: "v".to_string(), ..Default::default()
        }).unwrap();
        add(&mut driver, "actor", &s, "started working on auth", None).unwrap();
        checkpoint::checkpoint(&mut driver, "actor", &s, "cp1", None, None, None).unwrap();

        let feed = timeline(&driver, &s).unwrap();
        assert_eq!(feed.len(), 3);
        for pair in feed.windows(2) {
            assert!(pair[0].created_at <= pair[1].created_at);
        }
    }

    #[test]
    fn tool_events_are_recorded_and_listed_in_order() {
        let mut driver = Driver::open_memory().unwrap();
        let s = session::create(&mut driver, "actor", NewSession::default()).unwrap().id;
        record_tool_event(&mut driver, "actor", &s, "save", Some("{\"key\":\"a\"}")).unwrap();
        record_tool_event(&mut driver, "actor", &s, "search", None).unwrap();
        let events = list_tool_events(&driver, &s).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].tool_name, "save");
        assert_eq!(events[1].tool_name, "search");
    }

    #[test]
    fn journal_entries_are_append_only_and_ordered() {
        let mut driver = Driver::open_memory().unwrap();
        let s = session::create(&mut driver, "actor", NewSession::default()).unwrap().id;
        add(&mut driver, "actor", &s, "first", None).unwrap();
        add(&mut driver, "actor", &s, "second", Some("tag1")).unwrap();
        let entries = list(&driver, &s).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].entry, "first");
        assert_eq!(entries[1].tags, Some("tag1".to_string()));
    }
}
