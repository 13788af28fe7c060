//! The public library surface (spec §12): one `Engine` type grouping every
//! component behind a shared, mutex-guarded storage driver.
//!
//! Grounded in the teacher's top-level `SqliteStorage` handle — a single
//! connection wrapped so every caller goes through the same serialized
//! writer — generalized from "one owner, one thread" (the teacher's CLI is
//! single-threaded) to `Arc<Mutex<Driver>>` because this engine's watcher
//! long-poll (spec §5) genuinely runs concurrently with mutating calls.

use crate::checkpoint::{self, CopyDepth, MergeOutcome, MergeStrategy};
use crate::compression;
use crate::error::Result;
use crate::journal::{self, TimelineEntry};
use crate::model::{Checkpoint, CompressedBucket, ContextItem, JournalEntry, RelationshipType, Session};
use crate::relationships::{self, Direction, RelatedItem, RelationshipStats};
use crate::repository::{self, BatchOutcome, CopyOutcome, ItemPatch, KeySelector, QueryOptions, QueryResult, SaveInput};
use crate::session::{self, NewSession, SessionUpdate};
use crate::storage::Driver;
use crate::watcher::{ChangeRow, WatcherFilter, WatcherHub};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

type SharedDriver = Arc<Mutex<Driver>>;

/// Top-level handle to a running context repository. Clone cheaply (it's an
/// `Arc` of shared state); every accessor method below borrows the same
/// underlying connection.
#[derive(Clone)]
pub struct Engine {
    driver: SharedDriver,
    watcher_hub: Arc<WatcherHub>,
    actor: String,
}

impl Engine {
    /// Open (or create) a database file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or the
    /// schema fails to apply.
    pub fn open(path: &Path, actor: impl Into<String>) -> Result<Self> {
        let mut driver = Driver::open(path)?;
        let watcher_hub = Arc::new(WatcherHub::new());
        driver.set_watcher_hub(Arc::clone(&watcher_hub));
        Ok(Self {
            driver: Arc::new(Mutex::new(driver)),
            watcher_hub,
            actor: actor.into(),
        })
    }

    /// Open an in-memory database. Used by tests and ephemeral sessions.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established or the
    /// schema fails to apply.
    pub fn open_memory(actor: impl Into<String>) -> Result<Self> {
        let mut driver = Driver::open_memory()?;
        let watcher_hub = Arc::new(WatcherHub::new());
        driver.set_watcher_hub(Arc::clone(&watcher_hub));
        Ok(Self {
            driver: Arc::new(Mutex::new(driver)),
            watcher_hub,
            actor: actor.into(),
        })
    }

    #[must_use]
    pub fn sessions(&self) -> Sessions {
        Sessions { driver: Arc::clone(&self.driver), actor: self.actor.clone() }
    }

    #[must_use]
    pub fn items(&self) -> Items {
        Items { driver: Arc::clone(&self.driver), actor: self.actor.clone() }
    }

    #[must_use]
    pub fn links(&self) -> Links {
        Links { driver: Arc::clone(&self.driver), actor: self.actor.clone() }
    }

    #[must_use]
    pub fn checkpoints(&self) -> Checkpoints {
        Checkpoints { driver: Arc::clone(&self.driver), actor: self.actor.clone() }
    }

    #[must_use]
    pub fn compression(&self) -> Compression {
        Compression { driver: Arc::clone(&self.driver), actor: self.actor.clone() }
    }

    #[must_use]
    pub fn journal(&self) -> Journal {
        Journal { driver: Arc::clone(&self.driver), actor: self.actor.clone() }
    }

    #[must_use]
    pub fn watchers(&self) -> Watchers {
        Watchers { driver: Arc::clone(&self.driver), hub: Arc::clone(&self.watcher_hub) }
    }
}

/// Session lifecycle accessor (spec §4.4).
pub struct Sessions {
    driver: SharedDriver,
    actor: String,
}

impl Sessions {
    /// # Errors
    /// Returns an error if `args.parent_id` names a nonexistent session, or
    /// the write fails.
    pub fn create(&self, args: NewSession) -> Result<Session> {
        session::create(&mut self.driver.lock().unwrap(), &self.actor, args)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub fn get(&self, id: &str) -> Result<Option<Session>> {
        session::get(&self.driver.lock().unwrap(), id)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub fn list(&self, limit: Option<u32>) -> Result<Vec<Session>> {
        session::list(&self.driver.lock().unwrap(), limit)
    }

    /// # Errors
    /// Returns `Error::SessionNotFound` if `id` doesn't exist, or an error
    /// if the write fails.
    pub fn update(&self, id: &str, patch: SessionUpdate) -> Result<Session> {
        session::update(&mut self.driver.lock().unwrap(), &self.actor, id, patch)
    }
}

/// Context repository accessor (spec §4.5).
pub struct Items {
    driver: SharedDriver,
    actor: String,
}

impl Items {
    /// # Errors
    /// Returns an error if `input` fails validation, or the write fails.
    pub fn save(&self, session_id: &str, default_channel: &str, input: SaveInput) -> Result<ContextItem> {
        repository::save(&mut self.driver.lock().unwrap(), &self.actor, session_id, default_channel, input)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub fn get(&self, viewer_session_id: &str, key: &str) -> Result<Option<ContextItem>> {
        repository::get_by_key(&self.driver.lock().unwrap(), viewer_session_id, key)
    }

    /// # Errors
    /// Returns `Error::ItemNotFound` if no such item exists, or the write
    /// fails.
    pub fn delete(&self, session_id: &str, key: &str) -> Result<()> {
        repository::delete(&mut self.driver.lock().unwrap(), &self.actor, session_id, key)
    }

    /// # Errors
    /// Returns `Error::ResourceExhausted` over the batch limit, or
    /// propagates a catastrophic per-element error.
    pub fn batch_save(&self, session_id: &str, default_channel: &str, items: Vec<SaveInput>) -> Result<Vec<BatchOutcome>> {
        repository::batch_save(&mut self.driver.lock().unwrap(), &self.actor, session_id, default_channel, items)
    }

    /// # Errors
    /// Propagates a catastrophic per-element error.
    pub fn batch_update(&self, session_id: &str, selector: KeySelector, patch: ItemPatch) -> Result<Vec<BatchOutcome>> {
        repository::batch_update(&mut self.driver.lock().unwrap(), &self.actor, session_id, selector, patch)
    }

    /// # Errors
    /// Returns an error if the query or write fails.
    pub fn batch_delete(&self, session_id: &str, selector: KeySelector, dry_run: bool) -> Result<Vec<BatchOutcome>> {
        repository::batch_delete(&mut self.driver.lock().unwrap(), &self.actor, session_id, selector, dry_run)
    }

    /// # Errors
    /// Returns an error if the query text or key pattern fails validation.
    pub fn query(&self, opts: QueryOptions) -> Result<QueryResult> {
        repository::query(&self.driver.lock().unwrap(), opts)
    }

    /// # Errors
    /// Returns an error if the write fails.
    #[allow(clippy::too_many_arguments)]
    pub fn reassign_channel(
        &self,
        session_id: &str,
        selector: KeySelector,
        category: Option<&str>,
        priority: Option<&str>,
        new_channel: &str,
        dry_run: bool,
    ) -> Result<Vec<String>> {
        repository::reassign_channel(&mut self.driver.lock().unwrap(), &self.actor, session_id, selector, category, priority, new_channel, dry_run)
    }

    /// # Errors
    /// Returns an error if the read or write fails.
    pub fn copy_between_sessions(&self, source_session_id: &str, target_session_id: &str) -> Result<CopyOutcome> {
        repository::copy_between_sessions(&mut self.driver.lock().unwrap(), &self.actor, source_session_id, target_session_id)
    }
}

/// Relationship graph accessor (spec §4.6).
pub struct Links {
    driver: SharedDriver,
    actor: String,
}

impl Links {
    /// # Errors
    /// Returns `Error::ItemNotFound` if either endpoint doesn't exist, or
    /// `Error::AlreadyExists` if already linked.
    pub fn link(
        &self,
        session_id: &str,
        from_key: &str,
        to_key: &str,
        relationship_type: RelationshipType,
        metadata: Option<serde_json::Value>,
    ) -> Result<crate::model::Relationship> {
        relationships::link(&mut self.driver.lock().unwrap(), &self.actor, session_id, from_key, to_key, relationship_type, metadata)
    }

    /// # Errors
    /// Returns `Error::RelationshipNotFound` if `id` doesn't exist.
    pub fn unlink(&self, id: &str) -> Result<()> {
        relationships::unlink(&mut self.driver.lock().unwrap(), &self.actor, id)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub fn get_related(&self, session_id: &str, start_key: &str, max_depth: u32, direction: Direction) -> Result<Vec<RelatedItem>> {
        relationships::get_related(&self.driver.lock().unwrap(), session_id, start_key, max_depth, direction)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub fn detect_dependency_cycle(&self, session_id: &str) -> Result<Option<Vec<String>>> {
        relationships::detect_dependency_cycle(&self.driver.lock().unwrap(), session_id)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub fn statistics(&self, session_id: &str) -> Result<RelationshipStats> {
        relationships::statistics(&self.driver.lock().unwrap(), session_id)
    }
}

/// Checkpoint / branch / merge accessor (spec §4.7).
pub struct Checkpoints {
    driver: SharedDriver,
    actor: String,
}

impl Checkpoints {
    /// # Errors
    /// Returns `Error::SessionNotFound` if `session_id` doesn't exist.
    pub fn create(
        &self,
        session_id: &str,
        name: &str,
        description: Option<&str>,
        git_status: Option<&str>,
        git_branch: Option<&str>,
    ) -> Result<Checkpoint> {
        checkpoint::checkpoint(&mut self.driver.lock().unwrap(), &self.actor, session_id, name, description, git_status, git_branch)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub fn get(&self, id: &str) -> Result<Option<Checkpoint>> {
        checkpoint::get(&self.driver.lock().unwrap(), id)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub fn list(&self, session_id: &str) -> Result<Vec<Checkpoint>> {
        checkpoint::list(&self.driver.lock().unwrap(), session_id)
    }

    /// # Errors
    /// Returns `Error::CheckpointNotFound` if `checkpoint_id` doesn't exist.
    pub fn restore(&self, checkpoint_id: &str) -> Result<String> {
        checkpoint::restore(&mut self.driver.lock().unwrap(), &self.actor, checkpoint_id)
    }

    /// # Errors
    /// Returns `Error::SessionNotFound` if the source doesn't exist.
    pub fn branch(
        &self,
        source_session_id: &str,
        name: Option<String>,
        branch_name: Option<String>,
        depth: CopyDepth,
    ) -> Result<String> {
        checkpoint::branch(&mut self.driver.lock().unwrap(), &self.actor, source_session_id, name, branch_name, depth)
    }

    /// # Errors
    /// Returns an error if either session doesn't exist.
    pub fn merge(&self, source_session_id: &str, target_session_id: &str, strategy: MergeStrategy) -> Result<MergeOutcome> {
        checkpoint::merge(&mut self.driver.lock().unwrap(), &self.actor, source_session_id, target_session_id, strategy)
    }
}

/// Compression engine accessor (spec §4.8).
pub struct Compression {
    driver: SharedDriver,
    actor: String,
}

impl Compression {
    /// # Errors
    /// Returns an error if the query or write fails.
    pub fn compress(
        &self,
        session_id: &str,
        older_than_millis: i64,
        preserve_categories: &[String],
    ) -> Result<Vec<CompressedBucket>> {
        compression::compress(&mut self.driver.lock().unwrap(), &self.actor, session_id, older_than_millis, preserve_categories)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub fn list(&self, session_id: &str) -> Result<Vec<CompressedBucket>> {
        compression::list(&self.driver.lock().unwrap(), session_id)
    }
}

/// Journal / timeline accessor (SPEC_FULL §11).
pub struct Journal {
    driver: SharedDriver,
    actor: String,
}

impl Journal {
    /// # Errors
    /// Returns an error if the write fails.
    pub fn add(&self, session_id: &str, entry: &str, tags: Option<&str>) -> Result<JournalEntry> {
        journal::add(&mut self.driver.lock().unwrap(), &self.actor, session_id, entry, tags)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub fn list(&self, session_id: &str) -> Result<Vec<JournalEntry>> {
        journal::list(&self.driver.lock().unwrap(), session_id)
    }

    /// # Errors
    /// Returns an error if any underlying query fails.
    pub fn timeline(&self, session_id: &str) -> Result<Vec<TimelineEntry>> {
        journal::timeline(&self.driver.lock().unwrap(), session_id)
    }

    /// # Errors
    /// Returns an error if the write fails.
    pub fn record_tool_event(
        &self,
        session_id: &str,
        tool_name: &str,
        payload: Option<&str>,
    ) -> Result<()> {
        journal::record_tool_event(&mut self.driver.lock().unwrap(), &self.actor, session_id, tool_name, payload)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub fn tool_events(&self, session_id: &str) -> Result<Vec<crate::model::ToolEvent>> {
        journal::list_tool_events(&self.driver.lock().unwrap(), session_id)
    }
}

/// Change-watcher accessor (spec §4.9).
pub struct Watchers {
    driver: SharedDriver,
    hub: Arc<WatcherHub>,
}

impl Watchers {
    #[must_use]
    pub fn create(&self, filter: WatcherFilter, since_seq: i64) -> String {
        self.hub.create_watcher(filter, since_seq)
    }

    pub fn cancel(&self, id: &str) {
        self.hub.cancel_watcher(id);
    }

    /// # Errors
    /// Returns `Error::WatcherNotFound` if `id` is unknown or cancelled.
    ///
    /// Locks the shared driver only for the brief non-blocking check each
    /// iteration, then releases it before waiting on the hub's condvar —
    /// holding the lock across the whole blocking wait would starve every
    /// writer (`save`, `delete`, `checkpoint`, …) until the deadline, so a
    /// poll started before a concurrent write could never observe it.
    pub fn poll(&self, id: &str, timeout: Duration) -> Result<Vec<ChangeRow>> {
        let deadline = Instant::now() + timeout;

        loop {
            let generation = self.hub.generation();
            let rows = {
                let driver = self.driver.lock().unwrap();
                self.hub.try_poll(&driver, id)?
            };
            if !rows.is_empty() {
                return Ok(rows);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            self.hub.wait_for_change(generation, deadline - now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::SaveInput;

    #[test]
    fn engine_wires_save_through_to_query() {
        let engine = Engine::open_memory("actor").unwrap();
        let s = engine.sessions().create(NewSession::default()).unwrap();
        engine.items().save(&s.id, &s.default_channel, SaveInput {
            key: "k".to_string(), value: "v".to_string(), ..Default::default()
        }).unwrap();
        let result = engine.items().query(QueryOptions { viewer_session_id: s.id, ..Default::default() }).unwrap();
        assert_eq!(result.items.len(), 1);
    }

    #[test]
    fn engine_clone_shares_underlying_driver() {
        let engine = Engine::open_memory("actor").unwrap();
        let s = engine.sessions().create(NewSession::default()).unwrap();
        let cloned = engine.clone();
        cloned.items().save(&s.id, &s.default_channel, SaveInput {
            key: "k".to_string(), value: "v".to_string(), ..Default::default()
        }).unwrap();
        assert!(engine.items().get(&s.id, "k").unwrap().is_some());
    }

    #[test]
    fn watcher_observes_item_saved_through_engine() {
        let engine = Engine::open_memory("actor").unwrap();
        let s = engine.sessions().create(NewSession::default()).unwrap();
        let watcher_id = engine.watchers().create(
            WatcherFilter { owner_session_id: Some(s.id.clone()), ..Default::default() },
            0,
        );
        engine.items().save(&s.id, &s.default_channel, SaveInput {
            key: "k".to_string(), value: "v".to_string(), ..Default::default()
        }).unwrap();
        let rows = engine.watchers().poll(&watcher_id, Duration::from_millis(50)).unwrap();
        assert_eq!(rows.len(), 1);
    }
}
