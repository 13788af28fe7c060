//! Checkpoint / branch / merge lifecycle (spec §4.7).
//!
//! Grounded in the teacher's `create_checkpoint`/`add_checkpoint_item`/
//! `get_checkpoint_items`/`restore_checkpoint` quartet in `storage::sqlite`:
//! a checkpoint snapshots by inserting link rows into `checkpoint_items`
//! (never copying at snapshot time), and `restore_checkpoint` is the one
//! place that deep-copies with fresh identifiers. Branch and merge reuse
//! the same "new session, fresh-id item copy" shape with a different
//! source (a live session rather than a checkpoint) and different item
//! selection / conflict-resolution rules.

use crate::error::{Error, Result};
use crate::model::Checkpoint;
use crate::session::{self, NewSession};
use crate::storage::events::EventType;
use crate::storage::Driver;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

/// Snapshot every `ContextItem` of `session_id` into a new checkpoint by
/// inserting `checkpoint_items` link rows; the originals are never touched.
///
/// # Errors
///
/// Returns `Error::SessionNotFound` if `session_id` doesn't exist, or an
/// error if the write fails.
pub fn checkpoint(
    driver: &mut Driver,
    actor: &str,
    session_id: &str,
    name: &str,
    description: Option<&str>,
    git_status: Option<&str>,
    git_branch: Option<&str>,
) -> Result<Checkpoint> {
    if session::get(driver, session_id)?.is_none() {
        return Err(Error::SessionNotFound { id: session_id.to_string() });
    }

    let id = format!("ckpt_{}", Uuid::new_v4());
    let now = chrono::Utc::now().timestamp_millis();

    driver.mutate("create_checkpoint", actor, |tx, ctx| {
        let item_count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM context_items WHERE session_id = ?1",
            [session_id],
            |r| r.get(0),
        )?;

        tx.execute(
            "INSERT INTO checkpoints
                (id, session_id, name, description, git_status, git_branch, item_count, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![id, session_id, name, description, git_status, git_branch, item_count, now],
        )?;

        let mut stmt = tx.prepare(
            "SELECT key, value, category, priority, channel, metadata, is_private
             FROM context_items WHERE session_id = ?1",
        )?;
        let items = stmt
            .query_map([session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?, row.get::<_, String>(4)?, row.get::<_, Option<String>>(5)?,
                    row.get::<_, bool>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        for (key, value, category, priority, channel, metadata, is_private) in items {
            let item_id = format!("ckpti_{}", Uuid::new_v4());
            tx.execute(
                "INSERT INTO checkpoint_items
                    (id, checkpoint_id, key, value, category, priority, channel, metadata, is_private)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![item_id, id, key, value, category, priority, channel, metadata, is_private],
            )?;
        }

        ctx.record_event("checkpoint", &id, EventType::CheckpointCreated);
        Ok(())
    })?;

    get(driver, &id)?.ok_or_else(|| Error::Internal("checkpoint vanished after insert".to_string()))
}

/// Fetch a checkpoint by id.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get(driver: &Driver, id: &str) -> Result<Option<Checkpoint>> {
    driver
        .conn()
        .query_row(
            "SELECT id, session_id, name, description, git_status, git_branch, item_count, created_at
             FROM checkpoints WHERE id = ?1",
            [id],
            map_row,
        )
        .optional()
        .map_err(Error::from)
}

/// List checkpoints for a session, most recent first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list(driver: &Driver, session_id: &str) -> Result<Vec<Checkpoint>> {
    let mut stmt = driver.conn().prepare(
        "SELECT id, session_id, name, description, git_status, git_branch, item_count, created_at
         FROM checkpoints WHERE session_id = ?1 ORDER BY created_at DESC",
    )?;
    let rows = stmt.query_map([session_id], map_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
}

/// Restore a checkpoint into a brand-new session named
/// `"Restored from: <checkpoint-name>"`, deep-copying every linked item with
/// fresh identifiers. `is_private` is preserved verbatim (spec §13 Open
/// Question resolution).
///
/// # Errors
///
/// Returns `Error::CheckpointNotFound` if `checkpoint_id` doesn't exist, or
/// an error if the write fails.
pub fn restore(driver: &mut Driver, actor: &str, checkpoint_id: &str) -> Result<String> {
    let Some(cp) = get(driver, checkpoint_id)? else {
        return Err(Error::CheckpointNotFound { id: checkpoint_id.to_string() });
    };

    let new_session = session::create(
        driver,
        actor,
        NewSession {
            name: Some(format!("Restored from: {}", cp.name)),
            parent_id: Some(cp.session_id.clone()),
            ..Default::default()
        },
    )?;

    driver.mutate("restore_checkpoint", actor, |tx, ctx| {
        let mut stmt = tx.prepare(
            "SELECT key, value, category, priority, channel, metadata, is_private
             FROM checkpoint_items WHERE checkpoint_id = ?1",
        )?;
        let items = stmt
            .query_map([checkpoint_id], |row| {
                Ok((
                    row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?, row.get::<_, String>(4)?, row.get::<_, Option<String>>(5)?,
                    row.get::<_, bool>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let now = chrono::Utc::now().timestamp_millis();
        for (key, value, category, priority, channel, metadata, is_private) in items {
            let size = i64::try_from(value.len()).unwrap_or(i64::MAX);
            let item_id = format!("item_{}", Uuid::new_v4());
            tx.execute(
                "INSERT INTO context_items
                    (id, session_id, key, value, category, priority, channel, metadata, size, is_private, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![item_id, new_session.id, key, value, category, priority, channel, metadata, size, is_private, now],
            )?;
            ctx.record_event("context_item", &item_id, EventType::ItemCreated);
        }

        ctx.record_event("checkpoint", checkpoint_id, EventType::CheckpointRestored);
        Ok(())
    })?;

    Ok(new_session.id)
}

/// How much of the source session [`branch`] copies into the child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CopyDepth {
    /// Only high-priority items.
    Shallow,
    /// Every item.
    #[default]
    Deep,
}

/// Create a child session with `parent_id` set to `source_session_id`, and
/// copy items per `depth`.
///
/// # Errors
///
/// Returns `Error::SessionNotFound` if the source doesn't exist, or an
/// error if the write fails.
pub fn branch(
    driver: &mut Driver,
    actor: &str,
    source_session_id: &str,
    name: Option<String>,
    branch_name: Option<String>,
    depth: CopyDepth,
) -> Result<String> {
    let source = session::get(driver, source_session_id)?
        .ok_or_else(|| Error::SessionNotFound { id: source_session_id.to_string() })?;

    let child = session::create(
        driver,
        actor,
        NewSession {
            name,
            parent_id: Some(source_session_id.to_string()),
            branch: branch_name,
            working_dir: source.working_dir.clone(),
            ..Default::default()
        },
    )?;

    driver.mutate("branch_session", actor, |tx, ctx| {
        let sql = match depth {
            CopyDepth::Shallow => {
                "SELECT key, value, category, priority, channel, metadata, is_private
                 FROM context_items WHERE session_id = ?1 AND priority = 'high'"
            }
            CopyDepth::Deep => {
                "SELECT key, value, category, priority, channel, metadata, is_private
                 FROM context_items WHERE session_id = ?1"
            }
        };
        let mut stmt = tx.prepare(sql)?;
        let items = stmt
            .query_map([source_session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?, row.get::<_, String>(4)?, row.get::<_, Option<String>>(5)?,
                    row.get::<_, bool>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let now = chrono::Utc::now().timestamp_millis();
        for (key, value, category, priority, channel, metadata, is_private) in items {
            let size = i64::try_from(value.len()).unwrap_or(i64::MAX);
            let item_id = format!("item_{}", Uuid::new_v4());
            tx.execute(
                "INSERT INTO context_items
                    (id, session_id, key, value, category, priority, channel, metadata, size, is_private, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![item_id, child.id, key, value, category, priority, channel, metadata, size, is_private, now],
            )?;
            ctx.record_event("context_item", &item_id, EventType::ItemCreated);
        }

        ctx.record_event("session", &child.id, EventType::BranchCreated);
        Ok(())
    })?;

    Ok(child.id)
}

/// Conflict-resolution strategy for [`merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    KeepCurrent,
    KeepSource,
    KeepNewest,
}

/// Outcome of a merge: counts of items copied vs. left untouched.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MergeOutcome {
    pub merged: i64,
    pub skipped: i64,
}

/// Merge every item of `source_session_id` into `target_session_id`. For
/// each source item whose key already exists in the target, `strategy`
/// picks the winner; otherwise the source item is copied in.
///
/// # Errors
///
/// Returns an error if either session doesn't exist, or if the write fails.
pub fn merge(
    driver: &mut Driver,
    actor: &str,
    source_session_id: &str,
    target_session_id: &str,
    strategy: MergeStrategy,
) -> Result<MergeOutcome> {
    if session::get(driver, source_session_id)?.is_none() {
        return Err(Error::SessionNotFound { id: source_session_id.to_string() });
    }
    if session::get(driver, target_session_id)?.is_none() {
        return Err(Error::SessionNotFound { id: target_session_id.to_string() });
    }

    driver.mutate("merge_sessions", actor, |tx, ctx| {
        let mut stmt = tx.prepare(
            "SELECT key, value, category, priority, channel, metadata, is_private, updated_at
             FROM context_items WHERE session_id = ?1",
        )?;
        let source_items = stmt
            .query_map([source_session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?, row.get::<_, String>(4)?, row.get::<_, Option<String>>(5)?,
                    row.get::<_, bool>(6)?, row.get::<_, i64>(7)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let now = chrono::Utc::now().timestamp_millis();
        let mut merged = 0i64;
        let mut skipped = 0i64;

        for (key, value, category, priority, channel, metadata, is_private, source_updated_at) in source_items {
            let target_existing: Option<(String, i64)> = tx
                .query_row(
                    "SELECT id, updated_at FROM context_items WHERE session_id = ?1 AND key = ?2",
                    params![target_session_id, key],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                )
                .optional()?;

            let should_overwrite = match (&target_existing, strategy) {
                (None, _) => true,
                (Some(_), MergeStrategy::KeepCurrent) => false,
                (Some(_), MergeStrategy::KeepSource) => true,
                (Some((_, target_updated_at)), MergeStrategy::KeepNewest) => {
                    source_updated_at > *target_updated_at
                }
            };

            if !should_overwrite {
                skipped += 1;
                continue;
            }

            let size = i64::try_from(value.len()).unwrap_or(i64::MAX);
            if let Some((existing_id, _)) = target_existing {
                tx.execute(
                    "UPDATE context_items SET value = ?1, category = ?2, priority = ?3, channel = ?4,
                        metadata = ?5, size = ?6, is_private = ?7, updated_at = ?8
                     WHERE id = ?9",
                    params![value, category, priority, channel, metadata, size, is_private, now, existing_id],
                )?;
                ctx.record_event("context_item", &existing_id, EventType::ItemUpdated);
            } else {
                let item_id = format!("item_{}", Uuid::new_v4());
                tx.execute(
                    "INSERT INTO context_items
                        (id, session_id, key, value, category, priority, channel, metadata, size, is_private, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                    params![item_id, target_session_id, key, value, category, priority, channel, metadata, size, is_private, now],
                )?;
                ctx.record_event("context_item", &item_id, EventType::ItemCreated);
            }
            merged += 1;
        }

        ctx.record_event("session", target_session_id, EventType::BranchMerged);
        Ok(MergeOutcome { merged, skipped })
    })
}

fn map_row(row: &rusqlite::Row) -> rusqlite::Result<Checkpoint> {
    Ok(Checkpoint {
        id: row.get(0)?,
        session_id: row.get(1)?,
        name: row.get(2)?,
        description: row.get(3)?,
        git_status: row.get(4)?,
        git_branch: row.get(5)?,
        item_count: row.get(6)?,
        created_at: row.get(7)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{self, SaveInput};

    fn session_with_items(driver: &mut Driver, items: &[(&str, &str, &str)]) -> String {
        let s = session::create(driver, "actor", NewSession::default()).unwrap().id;
        for (key, value, priority) in items {
            repository::save(driver, "actor", &s, "general", SaveInput {
                key: (*key).to_string(), value: (*value).to_string(), priority: Some((*priority).to_string()),
                ..Default::default()
            }).unwrap();
        }
        s
    }

    #[test]
    fn checkpoint_snapshots_current_items() {
        let mut driver = Driver::open_memory().unwrap();
        let s = session_with_items(&mut driver, &[("a", "1", "normal"), ("b", "2", "high")]);
        let cp = checkpoint(&mut driver, "actor", &s, "cp1", None, None, None).unwrap();
        assert_eq!(cp.item_count, 2);
    }

    #[test]
    fn checkpoint_idempotent_with_no_intervening_writes() {
        let mut driver = Driver::open_memory().unwrap();
        let s = session_with_items(&mut driver, &[("a", "1", "normal")]);
        let cp1 = checkpoint(&mut driver, "actor", &s, "cp1", None, None, None).unwrap();
        let cp2 = checkpoint(&mut driver, "actor", &s, "cp2", None, None, None).unwrap();
        assert_eq!(cp1.item_count, cp2.item_count);
    }

    #[test]
    fn restore_creates_new_session_with_deep_copies() {
        let mut driver = Driver::open_memory().unwrap();
        let s = session_with_items(&mut driver, &[("a", "1", "normal")]);
        let cp = checkpoint(&mut driver, "actor", &s, "my-checkpoint", None, None, None).unwrap();
        let restored_id = restore(&mut driver, "actor", &cp.id).unwrap();
        assert_ne!(restored_id, s);
        let restored_session = session::get(&driver, &restored_id).unwrap().unwrap();
        assert_eq!(restored_session.name, "Restored from: my-checkpoint");
        let item = repository::get_by_key(&driver, &restored_id, "a").unwrap().unwrap();
        assert_eq!(item.value, "1");
    }

    #[test]
    fn restore_does_not_mutate_source_items() {
        let mut driver = Driver::open_memory().unwrap();
        let s = session_with_items(&mut driver, &[("a", "1", "normal")]);
        let cp = checkpoint(&mut driver, "actor", &s, "cp1", None, None, None).unwrap();
        let restored_id = restore(&mut driver, "actor", &cp.id).unwrap();
        repository::save(&mut driver, "actor", &restored_id, "general", SaveInput {
            key: "a".to_string(), value: "changed".to_string(), ..Default::default()
        }).unwrap();
        let original = repository::get_by_key(&driver, &s, "a").unwrap().unwrap();
        assert_eq!(original.value, "1");
    }

    #[test]
    fn branch_shallow_copies_only_high_priority() {
        let mut driver = Driver::open_memory().unwrap();
        let s = session_with_items(&mut driver, &[("a", "1", "high"), ("b", "2", "normal")]);
        let child = branch(&mut driver, "actor", &s, None, None, CopyDepth::Shallow).unwrap();
        assert!(repository::get_by_session_and_key(driver.conn(), &child, "a").unwrap().is_some());
        assert!(repository::get_by_session_and_key(driver.conn(), &child, "b").unwrap().is_none());
    }

    #[test]
    fn branch_deep_copies_everything() {
        let mut driver = Driver::open_memory().unwrap();
        let s = session_with_items(&mut driver, &[("a", "1", "high"), ("b", "2", "normal")]);
        let child = branch(&mut driver, "actor", &s, None, None, CopyDepth::Deep).unwrap();
        assert!(repository::get_by_session_and_key(driver.conn(), &child, "a").unwrap().is_some());
        assert!(repository::get_by_session_and_key(driver.conn(), &child, "b").unwrap().is_some());
    }

    #[test]
    fn branch_sets_parent_id() {
        let mut driver = Driver::open_memory().unwrap();
        let s = session_with_items(&mut driver, &[]);
        let child_id = branch(&mut driver, "actor", &s, None, None, CopyDepth::Deep).unwrap();
        let child = session::get(&driver, &child_id).unwrap().unwrap();
        assert_eq!(child.parent_id, Some(s));
    }

    #[test]
    fn merge_keep_current_does_not_overwrite() {
        let mut driver = Driver::open_memory().unwrap();
        let source = session_with_items(&mut driver, &[("k", "from-source", "normal")]);
        let target = session_with_items(&mut driver, &[("k", "from-target", "normal")]);
        let outcome = merge(&mut driver, "actor", &source, &target, MergeStrategy::KeepCurrent).unwrap();
        assert_eq!(outcome.skipped, 1);
        let item = repository::get_by_key(&driver, &target, "k").unwrap().unwrap();
        assert_eq!(item.value, "from-target");
    }

    #[test]
    fn merge_keep_source_overwrites() {
        let mut driver = Driver::open_memory().unwrap();
        let source = session_with_items(&mut driver, &[("k", "from-source", "normal")]);
        let target = session_with_items(&mut driver, &[("k", "from-target", "normal")]);
        let outcome = merge(&mut driver, "actor", &source, &target, MergeStrategy::KeepSource).unwrap();
        assert_eq!(outcome.merged, 1);
        let item = repository::get_by_key(&driver, &target, "k").unwrap().unwrap();
        assert_eq!(item.value, "from-source");
    }

    #[test]
    fn merge_inserts_nonconflicting_keys() {
        let mut driver = Driver::open_memory().unwrap();
        let source = session_with_items(&mut driver, &[("new_key", "v", "normal")]);
        let target = session_with_items(&mut driver, &[]);
        let outcome = merge(&mut driver, "actor", &source, &target, MergeStrategy::KeepCurrent).unwrap();
        assert_eq!(outcome.merged, 1);
        assert!(repository::get_by_key(&driver, &target, "new_key").unwrap().is_some());
    }
}
