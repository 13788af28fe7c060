//! Change-watcher subsystem: long-poll notifications over `change_log`.
//!
//! Grounded in the teacher's `storage::events` append-only audit idiom —
//! `change_log` rows get a monotonic `rowid` for free, the same way
//! `events` does. `WatcherHub` adds the suspension-point semantics spec §5
//! names ("a caller blocks until either a matching change arrives or its
//! deadline elapses") using a `Condvar`, since nothing else in the core
//! needs an async runtime (the teacher reserves `tokio` for its HTTP
//! embeddings client, never for storage).

use crate::storage::Driver;
use rusqlite::params;
use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use uuid::Uuid;

/// One registered watcher's filter and cursor.
///
/// `owner_session_id` is the watcher's *viewing* session — used only for
/// the privacy rule (spec §3), never as an equality filter on `session_id`.
/// The other fields are optional set-membership filters over §4.9's
/// `{keys, categories, channels, priorities}`.
#[derive(Debug, Clone, Default)]
pub struct WatcherFilter {
    pub owner_session_id: Option<String>,
    pub channels: Option<Vec<String>>,
    pub entity_type: Option<String>,
    pub keys: Option<Vec<String>>,
    pub categories: Option<Vec<String>>,
    pub priorities: Option<Vec<String>>,
}

impl WatcherFilter {
    fn matches(&self, row: &ChangeRow) -> bool {
        if let Some(channels) = &self.channels {
            if !channels.iter().any(|c| c == &row.channel) {
                return false;
            }
        }
        if let Some(entity_type) = &self.entity_type {
            if entity_type != &row.entity_type {
                return false;
            }
        }
        if let Some(keys) = &self.keys {
            match &row.key {
                Some(k) if keys.iter().any(|want| want == k) => {}
                _ => return false,
            }
        }
        if let Some(categories) = &self.categories {
            match &row.category {
                Some(c) if categories.iter().any(|want| want == c) => {}
                _ => return false,
            }
        }
        if let Some(priorities) = &self.priorities {
            match &row.priority {
                Some(p) if priorities.iter().any(|want| want == p) => {}
                _ => return false,
            }
        }

        // Privacy rule (spec §3): visible iff public, or owned by the
        // watcher's own session. Entity types with no privacy flag
        // (sessions, checkpoints, relationships) are always visible.
        if row.entity_type == "item" && row.is_private {
            match &self.owner_session_id {
                Some(owner) if owner == &row.session_id => {}
                _ => return false,
            }
        }

        true
    }
}

/// A single row read back from `change_log`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChangeRow {
    pub seq: i64,
    pub session_id: String,
    pub channel: String,
    pub entity_type: String,
    pub entity_id: String,
    pub change_type: String,
    pub key: Option<String>,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub is_private: bool,
    pub created_at: i64,
}

struct WatcherState {
    filter: WatcherFilter,
    last_seq: i64,
    cancelled: bool,
}

/// Watcher registry plus a generation counter bumped on every commit, so
/// waiters can tell a real notification from a spurious condvar wakeup.
struct Registry {
    watchers: HashMap<String, WatcherState>,
    generation: u64,
}

/// Registry of active watchers plus the condvar callers block on.
pub struct WatcherHub {
    state: Mutex<Registry>,
    condvar: Condvar,
}

impl Default for WatcherHub {
    fn default() -> Self {
        Self::new()
    }
}

impl WatcherHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Registry {
                watchers: HashMap::new(),
                generation: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Register a new watcher starting from `since_seq` (0 means "from now").
    #[must_use]
    pub fn create_watcher(&self, filter: WatcherFilter, since_seq: i64) -> String {
        let id = format!("watch_{}", Uuid::new_v4());
        self.state.lock().unwrap().watchers.insert(
            id.clone(),
            WatcherState {
                filter,
                last_seq: since_seq,
                cancelled: false,
            },
        );
        id
    }

    /// Cancel a watcher. Further polls on its id return `WatcherNotFound`.
    pub fn cancel_watcher(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(watcher) = state.watchers.get_mut(id) {
            watcher.cancelled = true;
        }
        state.generation += 1;
        drop(state);
        self.condvar.notify_all();
    }

    /// Wake every blocked poller to re-check `change_log`.
    pub fn notify(&self) {
        let mut state = self.state.lock().unwrap();
        state.generation += 1;
        drop(state);
        self.condvar.notify_all();
    }

    /// Current notification generation, sampled before a non-blocking check
    /// so a subsequent wait can detect whether a commit raced ahead of it.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.lock().unwrap().generation
    }

    /// Check once for matching changes since the watcher's last delivered
    /// sequence number, without blocking. Updates the watcher's cursor when
    /// rows are returned.
    ///
    /// # Errors
    ///
    /// Returns `Error::WatcherNotFound` if `id` is unknown or was cancelled,
    /// or a database error if reading `change_log` fails.
    pub fn try_poll(&self, driver: &Driver, id: &str) -> crate::error::Result<Vec<ChangeRow>> {
        let (filter, last_seq) = {
            let state = self.state.lock().unwrap();
            let watcher = state
                .watchers
                .get(id)
                .ok_or_else(|| crate::error::Error::WatcherNotFound { id: id.to_string() })?;
            if watcher.cancelled {
                return Err(crate::error::Error::WatcherNotFound { id: id.to_string() });
            }
            (watcher.filter.clone(), watcher.last_seq)
        };

        let rows = read_changes_since(driver, last_seq, &filter)?;
        if !rows.is_empty() {
            let max_seq = rows.iter().map(|r| r.seq).max().unwrap_or(last_seq);
            if let Some(watcher) = self.state.lock().unwrap().watchers.get_mut(id) {
                watcher.last_seq = max_seq;
            }
        }
        Ok(rows)
    }

    /// Block until a commit bumps the generation past `since_generation`,
    /// or `timeout` elapses, whichever comes first. Purely a suspension
    /// point — callers re-check `change_log` with `try_poll` after waking.
    pub fn wait_for_change(&self, since_generation: u64, timeout: Duration) {
        let guard = self.state.lock().unwrap();
        let _ = self
            .condvar
            .wait_timeout_while(guard, timeout, |s| s.generation == since_generation)
            .unwrap();
    }

    /// Poll a watcher for matching changes since its last delivered
    /// sequence number, blocking up to `timeout` if nothing is available
    /// yet. Delivery is at-least-once: a row is only considered delivered
    /// once this call returns it, so a crash between commit and poll
    /// cannot drop it.
    ///
    /// # Errors
    ///
    /// Returns `Error::WatcherNotFound` if `id` is unknown or was cancelled,
    /// or a database error if reading `change_log` fails.
    pub fn poll_watcher(
        &self,
        driver: &Driver,
        id: &str,
        timeout: Duration,
    ) -> crate::error::Result<Vec<ChangeRow>> {
        let deadline = Instant::now() + timeout;

        loop {
            let generation = self.generation();
            let rows = self.try_poll(driver, id)?;
            if !rows.is_empty() {
                return Ok(rows);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            self.wait_for_change(generation, deadline - now);
        }
    }
}

fn read_changes_since(
    driver: &Driver,
    since_seq: i64,
    filter: &WatcherFilter,
) -> crate::error::Result<Vec<ChangeRow>> {
    let mut stmt = driver.conn().prepare(
        "SELECT seq, session_id, channel, entity_type, entity_id, change_type,
                key, category, priority, is_private, created_at
         FROM change_log
         WHERE seq > ?1
         ORDER BY seq ASC
         LIMIT 500",
    )?;

    let rows = stmt.query_map(params![since_seq], |row| {
        Ok(ChangeRow {
            seq: row.get(0)?,
            session_id: row.get(1)?,
            channel: row.get(2)?,
            entity_type: row.get(3)?,
            entity_id: row.get(4)?,
            change_type: row.get(5)?,
            key: row.get(6)?,
            category: row.get(7)?,
            priority: row.get(8)?,
            is_private: row.get(9)?,
            created_at: row.get(10)?,
        })
    })?;

    let mut out = Vec::new();
    for row in rows {
        let row = row?;
        if filter.matches(&row) {
            out.push(row);
        }
    }
    Ok(out)
}
