//! SQLite storage driver: connection lifetime, PRAGMAs, and the transaction
//! discipline every mutation goes through.
//!
//! Generalizes the teacher's `SqliteStorage`/`MutationContext`/`mutate()`
//! pattern: `MutationContext` becomes `ChangeContext` since it now also
//! accumulates watcher deltas (`change_log` rows) alongside audit events.
//! Every mutation — including the multi-table writes in checkpoint restore,
//! branch, and merge — runs inside the single outer `IMMEDIATE` transaction
//! `mutate()` opens; none of this crate's operations need a nested
//! savepoint, since a closure's own early `?` return already aborts the
//! whole transaction before anything commits.

use crate::error::Result;
use crate::storage::events::{insert_event, Event, EventType};
use crate::storage::schema::apply_schema;
use crate::watcher::WatcherHub;
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// One row destined for `change_log`, describing a single committed change.
#[derive(Debug, Clone)]
pub struct ChangeDelta {
    pub session_id: String,
    pub channel: String,
    pub entity_type: String,
    pub entity_id: String,
    pub change_type: String,
    pub key: Option<String>,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub is_private: bool,
}

/// Context threaded through a mutation closure: accumulates audit events and
/// watcher deltas, committed together at the end of `Driver::mutate`.
pub struct ChangeContext {
    pub op_name: String,
    pub actor: String,
    pub events: Vec<Event>,
    pub changes: Vec<ChangeDelta>,
}

impl ChangeContext {
    #[must_use]
    pub fn new(op_name: &str, actor: &str) -> Self {
        Self {
            op_name: op_name.to_string(),
            actor: actor.to_string(),
            events: Vec::new(),
            changes: Vec::new(),
        }
    }

    pub fn record_event(&mut self, entity_type: &str, entity_id: &str, event_type: EventType) {
        self.events
            .push(Event::new(entity_type, entity_id, event_type, &self.actor));
    }

    pub fn record_change(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        event_type: EventType,
        old_value: Option<String>,
        new_value: Option<String>,
    ) {
        self.events.push(
            Event::new(entity_type, entity_id, event_type, &self.actor)
                .with_values(old_value, new_value),
        );
    }

    /// Record a change destined for the watcher feed.
    pub fn notify(
        &mut self,
        session_id: &str,
        channel: &str,
        entity_type: &str,
        entity_id: &str,
        change_type: &str,
    ) {
        self.notify_item(
            session_id, channel, entity_type, entity_id, change_type, None, None, None, false,
        );
    }

    /// Record a change destined for the watcher feed, carrying the item
    /// attributes (`key`/`category`/`priority`/`is_private`) §4.9's filter
    /// needs evaluated against committed state at write time, not poll time.
    #[allow(clippy::too_many_arguments)]
    pub fn notify_item(
        &mut self,
        session_id: &str,
        channel: &str,
        entity_type: &str,
        entity_id: &str,
        change_type: &str,
        key: Option<&str>,
        category: Option<&str>,
        priority: Option<&str>,
        is_private: bool,
    ) {
        self.changes.push(ChangeDelta {
            session_id: session_id.to_string(),
            channel: channel.to_string(),
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
            change_type: change_type.to_string(),
            key: key.map(str::to_string),
            category: category.map(str::to_string),
            priority: priority.map(str::to_string),
            is_private,
        });
    }
}

/// Owns the single SQLite connection serializing all writes.
pub struct Driver {
    conn: Connection,
    watchers: Option<Arc<WatcherHub>>,
}

impl Driver {
    /// Open (or create) a database at `path` with a 5 second busy timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or the
    /// schema fails to apply.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_timeout(path, None)
    }

    /// Open with an explicit busy timeout in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or the
    /// schema fails to apply.
    pub fn open_with_timeout(path: &Path, timeout_ms: Option<u64>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_millis(timeout_ms.unwrap_or(5_000)))?;
        apply_schema(&conn)?;
        Ok(Self {
            conn,
            watchers: None,
        })
    }

    /// Open an in-memory database. Used by tests and ephemeral sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or the
    /// schema fails to apply.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        apply_schema(&conn)?;
        Ok(Self {
            conn,
            watchers: None,
        })
    }

    /// Attach a watcher hub so committed mutations wake up blocked pollers.
    pub fn set_watcher_hub(&mut self, hub: Arc<WatcherHub>) {
        self.watchers = Some(hub);
    }

    /// Borrow the underlying connection for read-only queries.
    #[must_use]
    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Run a mutation inside an `IMMEDIATE` transaction: the closure does
    /// its writes, then audit events and watcher deltas recorded on the
    /// `ChangeContext` are persisted, then everything commits together.
    ///
    /// # Errors
    ///
    /// Returns an error if the closure fails or any step of the commit
    /// fails; the transaction rolls back in either case.
    pub fn mutate<F, R>(&mut self, op: &str, actor: &str, f: F) -> Result<R>
    where
        F: FnOnce(&Transaction, &mut ChangeContext) -> Result<R>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(rusqlite::TransactionBehavior::Immediate)?;

        let mut ctx = ChangeContext::new(op, actor);
        let result = f(&tx, &mut ctx)?;

        for event in &ctx.events {
            insert_event(&tx, event)?;
        }

        for change in &ctx.changes {
            tx.execute(
                "INSERT INTO change_log
                    (session_id, channel, entity_type, entity_id, change_type,
                     key, category, priority, is_private, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    change.session_id,
                    change.channel,
                    change.entity_type,
                    change.entity_id,
                    change.change_type,
                    change.key,
                    change.category,
                    change.priority,
                    change.is_private,
                    chrono::Utc::now().timestamp_millis(),
                ],
            )?;
        }

        tx.commit()?;

        tracing::info!(op = %op, actor = %actor, "mutation committed");

        if let Some(hub) = &self.watchers {
            if !ctx.changes.is_empty() {
                hub.notify();
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_memory_applies_schema() {
        let driver = Driver::open_memory().unwrap();
        let count: i64 = driver
            .conn()
            .query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn mutate_commits_events_and_changes() {
        let mut driver = Driver::open_memory().unwrap();
        driver
            .mutate("create_session", "actor1", |tx, ctx| {
                tx.execute(
                    "INSERT INTO sessions (id, name, default_channel, created_at, updated_at)
                     VALUES ('s1', 'test', 'general', 1, 1)",
                    [],
                )?;
                ctx.record_event("session", "s1", EventType::SessionCreated);
                ctx.notify("s1", "general", "session", "s1", "created");
                Ok(())
            })
            .unwrap();

        let event_count: i64 = driver
            .conn()
            .query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))
            .unwrap();
        assert_eq!(event_count, 1);

        let change_count: i64 = driver
            .conn()
            .query_row("SELECT COUNT(*) FROM change_log", [], |r| r.get(0))
            .unwrap();
        assert_eq!(change_count, 1);
    }

    #[test]
    fn mutate_rolls_back_on_error() {
        let mut driver = Driver::open_memory().unwrap();
        let result: Result<()> = driver.mutate("noop", "actor1", |tx, _ctx| {
            tx.execute(
                "INSERT INTO sessions (id, name, default_channel, created_at, updated_at)
                 VALUES ('s1', 'test', 'general', 1, 1)",
                [],
            )?;
            Err(crate::error::Error::Internal("boom".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = driver
            .conn()
            .query_row("SELECT COUNT(*) FROM sessions", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
