//! Context repository (spec §4.5): the hardest subsystem. CRUD, the unified
//! search/query engine, batching, channel reassignment, and cross-session
//! copy — all privacy-aware per §3's central invariant.
//!
//! Grounded in the teacher's `save_context_item`/`get_context_items`/
//! `update_context_item`/`delete_context_item` quartet in
//! `storage::sqlite`, generalized from "one session's items, optionally
//! filtered by category/priority" into the full compound query shape
//! §4.5.3 names (search text, set-membership filters, time bounds, sort,
//! pagination) plus the privacy predicate that quartet never had to apply
//! (the teacher's CLI is single-session; this engine is not).

use crate::error::{Error, Result};
use crate::model::ContextItem;
use crate::storage::events::EventType;
use crate::storage::Driver;
use crate::{channel, validate};
use rusqlite::{params_from_iter, types::Value as SqlValue, OptionalExtension, Row, Transaction};
use uuid::Uuid;

/// Inputs accepted by [`save`]. Matches the `save` tool arguments (spec
/// §4.5.1) one-to-one.
#[derive(Debug, Clone, Default)]
pub struct SaveInput {
    pub key: String,
    pub value: String,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub channel: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub is_private: Option<bool>,
}

/// Save (insert-or-replace) a context item. Upserts on `(session_id, key)`.
///
/// # Errors
///
/// Returns `Error::InvalidArgument` if the key, value, category, priority,
/// or explicit channel fails validation, or an error if the write fails.
pub fn save(
    driver: &mut Driver,
    actor: &str,
    session_id: &str,
    default_channel: &str,
    input: SaveInput,
) -> Result<ContextItem> {
    validate::validate_key(&input.key)?;
    validate::validate_value(&input.value)?;
    if let Some(category) = &input.category {
        validate::validate_category(category)?;
    }
    let priority = input.priority.unwrap_or_else(|| "normal".to_string());
    validate::validate_priority(&priority)?;

    let resolved_channel = match input.channel {
        Some(c) if !c.is_empty() => {
            validate::validate_channel(&c)?;
            c
        }
        _ => channel::resolve(None, default_channel),
    };

    let metadata_text = input
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let is_private = input.is_private.unwrap_or(false);
    let size = i64::try_from(input.value.len()).unwrap_or(i64::MAX);
    let now = chrono::Utc::now().timestamp_millis();
    let new_id = format!("item_{}", Uuid::new_v4());
    let key = input.key.clone();
    let value = input.value.clone();
    let category = input.category.clone();

    driver.mutate("save_context_item", actor, |tx, ctx| {
        let existed: bool = tx
            .prepare("SELECT 1 FROM context_items WHERE session_id = ?1 AND key = ?2")?
            .exists(rusqlite::params![session_id, key])?;

        tx.execute(
            "INSERT INTO context_items
                (id, session_id, key, value, category, priority, channel, metadata, size, is_private, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
             ON CONFLICT(session_id, key) DO UPDATE SET
                value = excluded.value,
                category = excluded.category,
                priority = excluded.priority,
                channel = excluded.channel,
                metadata = excluded.metadata,
                size = excluded.size,
                is_private = excluded.is_private,
                updated_at = excluded.updated_at",
            rusqlite::params![
                new_id, session_id, key, value, category, priority, resolved_channel,
                metadata_text, size, is_private, now,
            ],
        )?;

        let item_id: String = tx.query_row(
            "SELECT id FROM context_items WHERE session_id = ?1 AND key = ?2",
            rusqlite::params![session_id, key],
            |r| r.get(0),
        )?;

        let event_type = if existed { EventType::ItemUpdated } else { EventType::ItemCreated };
        ctx.record_event("context_item", &item_id, event_type);
        ctx.notify_item(
            session_id,
            &resolved_channel,
            "item",
            &item_id,
            if existed { "updated" } else { "created" },
            Some(&key),
            category.as_deref(),
            Some(&priority),
            is_private,
        );
        Ok(())
    })?;

    get_by_session_and_key(driver.conn(), session_id, &input.key)?
        .ok_or_else(|| Error::Internal("item vanished after save".to_string()))
}

/// Get the caller's own item for `key`, preferring it over any public item
/// of the same key owned by a different session; falls back to the most
/// recent public item with that key if the caller has none (spec §4.5.4).
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_by_key(
    driver: &Driver,
    viewer_session_id: &str,
    key: &str,
) -> Result<Option<ContextItem>> {
    if let Some(own) = get_by_session_and_key(driver.conn(), viewer_session_id, key)? {
        return Ok(Some(own));
    }

    driver
        .conn()
        .query_row(
            "SELECT id, session_id, key, value, category, priority, channel, metadata, size, is_private, created_at, updated_at
             FROM context_items
             WHERE key = ?1 AND is_private = 0
             ORDER BY created_at DESC
             LIMIT 1",
            [key],
            map_row,
        )
        .optional()
        .map_err(Error::from)
}

pub(crate) fn get_by_session_and_key(
    conn: &rusqlite::Connection,
    session_id: &str,
    key: &str,
) -> Result<Option<ContextItem>> {
    conn.query_row(
        "SELECT id, session_id, key, value, category, priority, channel, metadata, size, is_private, created_at, updated_at
         FROM context_items WHERE session_id = ?1 AND key = ?2",
        rusqlite::params![session_id, key],
        map_row,
    )
    .optional()
    .map_err(Error::from)
}

/// Delete a single item by key, cascading relationship deletion (spec
/// §4.6): every relationship edge referencing the item by either endpoint
/// within the same session is removed in the same transaction.
///
/// # Errors
///
/// Returns `Error::ItemNotFound` if no such item exists in `session_id`, or
/// an error if the write fails.
pub fn delete(driver: &mut Driver, actor: &str, session_id: &str, key: &str) -> Result<()> {
    let existing = get_by_session_and_key(driver.conn(), session_id, key)?
        .ok_or_else(|| Error::ItemNotFound { session_id: session_id.to_string(), key: key.to_string() })?;

    driver.mutate("delete_context_item", actor, |tx, ctx| {
        tx.execute(
            "DELETE FROM context_relationships WHERE session_id = ?1 AND (from_key = ?2 OR to_key = ?2)",
            rusqlite::params![session_id, key],
        )?;
        tx.execute(
            "DELETE FROM context_items WHERE session_id = ?1 AND key = ?2",
            rusqlite::params![session_id, key],
        )?;
        ctx.record_event("context_item", &existing.id, EventType::ItemDeleted);
        ctx.notify_item(
            session_id, &existing.channel, "item", &existing.id, "deleted",
            Some(key), existing.category.as_deref(), Some(&existing.priority), existing.is_private,
        );
        Ok(())
    })
}

// ---------------------------------------------------------------------
// Batch operations (spec §4.5.2)
// ---------------------------------------------------------------------

/// Outcome of one element of a batch operation.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BatchOutcome {
    pub index: usize,
    pub key: String,
    pub success: bool,
    pub action: Option<&'static str>,
    pub error: Option<String>,
}

fn catastrophic(e: &Error) -> bool {
    matches!(e, Error::Database(_) | Error::Io(_) | Error::Json(_) | Error::Internal(_))
}

/// Batch-save: every element validated and applied independently inside one
/// transaction; per-element failures are reported, not rolled back, unless
/// the failure is catastrophic (I/O, serialization), which rolls back the
/// whole batch. Maximum batch size is [`validate::MAX_BATCH_SIZE`].
///
/// # Errors
///
/// Returns `Error::ResourceExhausted` if `items.len()` exceeds the maximum
/// batch size, or propagates a catastrophic per-element error.
pub fn batch_save(
    driver: &mut Driver,
    actor: &str,
    session_id: &str,
    default_channel: &str,
    items: Vec<SaveInput>,
) -> Result<Vec<BatchOutcome>> {
    if items.len() > validate::MAX_BATCH_SIZE {
        return Err(Error::ResourceExhausted(format!(
            "batch of {} exceeds the maximum of {}",
            items.len(),
            validate::MAX_BATCH_SIZE
        )));
    }

    let now = chrono::Utc::now().timestamp_millis();
    driver.mutate("batch_save", actor, |tx, ctx| {
        let mut results = Vec::with_capacity(items.len());
        for (index, item) in items.into_iter().enumerate() {
            let key = item.key.clone();
            match save_one(tx, ctx, session_id, default_channel, item, now) {
                Ok(action) => results.push(BatchOutcome { index, key, success: true, action: Some(action), error: None }),
                Err(e) if catastrophic(&e) => return Err(e),
                Err(e) => results.push(BatchOutcome { index, key, success: false, action: None, error: Some(e.to_string()) }),
            }
        }
        Ok(results)
    })
}

fn save_one(
    tx: &Transaction,
    ctx: &mut crate::storage::driver::ChangeContext,
    session_id: &str,
    default_channel: &str,
    input: SaveInput,
    now: i64,
) -> Result<&'static str> {
    validate::validate_key(&input.key)?;
    validate::validate_value(&input.value)?;
    if let Some(category) = &input.category {
        validate::validate_category(category)?;
    }
    let priority = input.priority.unwrap_or_else(|| "normal".to_string());
    validate::validate_priority(&priority)?;
    let resolved_channel = match input.channel {
        Some(c) if !c.is_empty() => {
            validate::validate_channel(&c)?;
            c
        }
        _ => channel::resolve(None, default_channel),
    };
    let metadata_text = input.metadata.as_ref().map(serde_json::to_string).transpose()?;
    let is_private = input.is_private.unwrap_or(false);
    let size = i64::try_from(input.value.len()).unwrap_or(i64::MAX);
    let new_id = format!("item_{}", Uuid::new_v4());

    let existed: bool = tx
        .prepare("SELECT 1 FROM context_items WHERE session_id = ?1 AND key = ?2")?
        .exists(rusqlite::params![session_id, input.key])?;

    tx.execute(
        "INSERT INTO context_items
            (id, session_id, key, value, category, priority, channel, metadata, size, is_private, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)
         ON CONFLICT(session_id, key) DO UPDATE SET
            value = excluded.value, category = excluded.category, priority = excluded.priority,
            channel = excluded.channel, metadata = excluded.metadata, size = excluded.size,
            is_private = excluded.is_private, updated_at = excluded.updated_at",
        rusqlite::params![
            new_id, session_id, input.key, input.value, input.category, priority,
            resolved_channel, metadata_text, size, is_private, now,
        ],
    )?;

    let item_id: String = tx.query_row(
        "SELECT id FROM context_items WHERE session_id = ?1 AND key = ?2",
        rusqlite::params![session_id, input.key],
        |r| r.get(0),
    )?;
    let event_type = if existed { EventType::ItemUpdated } else { EventType::ItemCreated };
    ctx.record_event("context_item", &item_id, event_type);
    ctx.notify_item(
        session_id, &resolved_channel, "item", &item_id,
        if existed { "updated" } else { "created" },
        Some(&input.key), input.category.as_deref(), Some(&priority), is_private,
    );
    Ok(if existed { "updated" } else { "created" })
}

/// How elements are selected for batch-update/delete/reassign (spec
/// §4.5.2, §4.5.5): an explicit key list, a glob pattern over keys, or (for
/// delete/reassign only) an entire channel.
#[derive(Debug, Clone)]
pub enum KeySelector {
    Keys(Vec<String>),
    Pattern(String),
    Channel(String),
}

fn resolve_selector(tx: &Transaction, session_id: &str, selector: &KeySelector) -> Result<Vec<String>> {
    match selector {
        KeySelector::Keys(keys) => Ok(keys.clone()),
        KeySelector::Pattern(pattern) => {
            validate::validate_glob_pattern(pattern)?;
            let mut stmt = tx.prepare(
                "SELECT key FROM context_items WHERE session_id = ?1 AND key GLOB ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![session_id, pattern], |r| r.get(0))?;
            rows.collect::<rusqlite::Result<Vec<String>>>().map_err(Error::from)
        }
        KeySelector::Channel(channel) => {
            let mut stmt = tx.prepare(
                "SELECT key FROM context_items WHERE session_id = ?1 AND channel = ?2",
            )?;
            let rows = stmt.query_map(rusqlite::params![session_id, channel], |r| r.get(0))?;
            rows.collect::<rusqlite::Result<Vec<String>>>().map_err(Error::from)
        }
    }
}

/// Partial field update applied by [`batch_update`]; only `Some` fields are
/// written, matching "only provided fields are set" (spec §4.5.2).
#[derive(Debug, Clone, Default)]
pub struct ItemPatch {
    pub value: Option<String>,
    pub category: Option<String>,
    pub priority: Option<String>,
    pub channel: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

/// Batch-update items matched by `selector`, applying `patch` to each.
/// Per-element validation failures (including "no such key") are reported
/// without aborting the batch.
///
/// # Errors
///
/// Propagates a catastrophic per-element error, rolling back the batch.
pub fn batch_update(
    driver: &mut Driver,
    actor: &str,
    session_id: &str,
    selector: KeySelector,
    patch: ItemPatch,
) -> Result<Vec<BatchOutcome>> {
    let now = chrono::Utc::now().timestamp_millis();
    driver.mutate("batch_update", actor, |tx, ctx| {
        let keys = resolve_selector(tx, session_id, &selector)?;
        if keys.len() > validate::MAX_BATCH_SIZE {
            return Err(Error::ResourceExhausted(format!(
                "batch of {} exceeds the maximum of {}",
                keys.len(),
                validate::MAX_BATCH_SIZE
            )));
        }
        let mut results = Vec::with_capacity(keys.len());
        for (index, key) in keys.into_iter().enumerate() {
            match update_one(tx, ctx, session_id, &key, &patch, now) {
                Ok(()) => results.push(BatchOutcome { index, key, success: true, action: Some("updated"), error: None }),
                Err(e) if catastrophic(&e) => return Err(e),
                Err(e) => results.push(BatchOutcome { index, key, success: false, action: None, error: Some(e.to_string()) }),
            }
        }
        Ok(results)
    })
}

fn update_one(
    tx: &Transaction,
    ctx: &mut crate::storage::driver::ChangeContext,
    session_id: &str,
    key: &str,
    patch: &ItemPatch,
    now: i64,
) -> Result<()> {
    if let Some(v) = &patch.value {
        validate::validate_value(v)?;
    }
    if let Some(c) = &patch.category {
        validate::validate_category(c)?;
    }
    if let Some(p) = &patch.priority {
        validate::validate_priority(p)?;
    }
    if let Some(c) = &patch.channel {
        validate::validate_channel(c)?;
    }

    let item_id: Option<String> = tx
        .query_row(
            "SELECT id FROM context_items WHERE session_id = ?1 AND key = ?2",
            rusqlite::params![session_id, key],
            |r| r.get(0),
        )
        .optional()?;
    let Some(item_id) = item_id else {
        return Err(Error::ItemNotFound { session_id: session_id.to_string(), key: key.to_string() });
    };

    let mut set_parts: Vec<&str> = vec!["updated_at"];
    let mut params: Vec<SqlValue> = vec![SqlValue::Integer(now)];
    if let Some(v) = &patch.value {
        set_parts.push("value");
        set_parts.push("size");
        params.push(SqlValue::Text(v.clone()));
        params.push(SqlValue::Integer(i64::try_from(v.len()).unwrap_or(i64::MAX)));
    }
    if let Some(c) = &patch.category {
        set_parts.push("category");
        params.push(SqlValue::Text(c.clone()));
    }
    if let Some(p) = &patch.priority {
        set_parts.push("priority");
        params.push(SqlValue::Text(p.clone()));
    }
    if let Some(c) = &patch.channel {
        set_parts.push("channel");
        params.push(SqlValue::Text(c.clone()));
    }
    if let Some(m) = &patch.metadata {
        set_parts.push("metadata");
        params.push(SqlValue::Text(serde_json::to_string(m)?));
    }

    let set_clause: String = set_parts.iter().enumerate()
        .map(|(i, f)| format!("{f} = ?{}", i + 1))
        .collect::<Vec<_>>().join(", ");
    let query = format!(
        "UPDATE context_items SET {set_clause} WHERE session_id = ?{} AND key = ?{}",
        params.len() + 1, params.len() + 2
    );
    params.push(SqlValue::Text(session_id.to_string()));
    params.push(SqlValue::Text(key.to_string()));
    tx.execute(&query, params_from_iter(params.iter()))?;

    ctx.record_event("context_item", &item_id, EventType::ItemUpdated);
    Ok(())
}

/// Batch-delete items matched by `selector`. `dry_run` returns the set that
/// would be deleted without mutating.
///
/// # Errors
///
/// Returns an error if the query or write fails.
pub fn batch_delete(
    driver: &mut Driver,
    actor: &str,
    session_id: &str,
    selector: KeySelector,
    dry_run: bool,
) -> Result<Vec<BatchOutcome>> {
    if dry_run {
        let conn_tx_keys = {
            let conn = driver.conn();
            match &selector {
                KeySelector::Keys(keys) => keys.clone(),
                KeySelector::Pattern(pattern) => {
                    validate::validate_glob_pattern(pattern)?;
                    let mut stmt = conn.prepare("SELECT key FROM context_items WHERE session_id = ?1 AND key GLOB ?2")?;
                    let rows = stmt.query_map(rusqlite::params![session_id, pattern], |r| r.get(0))?;
                    rows.collect::<rusqlite::Result<Vec<String>>>()?
                }
                KeySelector::Channel(channel) => {
                    let mut stmt = conn.prepare("SELECT key FROM context_items WHERE session_id = ?1 AND channel = ?2")?;
                    let rows = stmt.query_map(rusqlite::params![session_id, channel], |r| r.get(0))?;
                    rows.collect::<rusqlite::Result<Vec<String>>>()?
                }
            }
        };
        return Ok(conn_tx_keys
            .into_iter()
            .enumerate()
            .map(|(index, key)| BatchOutcome { index, key, success: true, action: Some("would_delete"), error: None })
            .collect());
    }

    driver.mutate("batch_delete", actor, |tx, ctx| {
        let keys = resolve_selector(tx, session_id, &selector)?;
        let mut results = Vec::with_capacity(keys.len());
        for (index, key) in keys.into_iter().enumerate() {
            let existing: Option<(String, String, Option<String>, String, bool)> = tx
                .query_row(
                    "SELECT id, channel, category, priority, is_private FROM context_items WHERE session_id = ?1 AND key = ?2",
                    rusqlite::params![session_id, key],
                    |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
                )
                .optional()?;
            let Some((item_id, item_channel, category, priority, is_private)) = existing else {
                results.push(BatchOutcome { index, key, success: false, action: None, error: Some("item not found".to_string()) });
                continue;
            };
            tx.execute("DELETE FROM context_relationships WHERE session_id = ?1 AND (from_key = ?2 OR to_key = ?2)", rusqlite::params![session_id, key])?;
            tx.execute("DELETE FROM context_items WHERE session_id = ?1 AND key = ?2", rusqlite::params![session_id, key])?;
            ctx.record_event("context_item", &item_id, EventType::ItemDeleted);
            ctx.notify_item(session_id, &item_channel, "item", &item_id, "deleted", Some(&key), category.as_deref(), Some(&priority), is_private);
            results.push(BatchOutcome { index, key, success: true, action: Some("deleted"), error: None });
        }
        Ok(results)
    })
}

// ---------------------------------------------------------------------
// Unified search/query engine (spec §4.5.3)
// ---------------------------------------------------------------------

/// Which fields `query` text matches against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SearchIn {
    Key,
    Value,
    #[default]
    Both,
}

/// Sort order for query results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Sort {
    #[default]
    CreatedDesc,
    CreatedAsc,
    UpdatedDesc,
    UpdatedAsc,
    KeyAsc,
    KeyDesc,
    Priority,
}

impl Sort {
    fn order_by(self) -> &'static str {
        match self {
            Self::CreatedDesc => "created_at DESC",
            Self::CreatedAsc => "created_at ASC",
            Self::UpdatedDesc => "updated_at DESC",
            Self::UpdatedAsc => "updated_at ASC",
            Self::KeyAsc => "key ASC",
            Self::KeyDesc => "key DESC",
            // High=0, Normal=1, Low=2 so ascending rank puts high first.
            Self::Priority => "CASE priority WHEN 'high' THEN 0 WHEN 'normal' THEN 1 WHEN 'low' THEN 2 ELSE 3 END ASC",
        }
    }
}

/// Raw caller-supplied query options, mirroring the `query`/`search` tool
/// arguments (spec §4.5.3) before limit/offset/sort defaults are applied.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub query: Option<String>,
    pub search_in: SearchIn,
    pub viewer_session_id: String,
    pub category: Option<String>,
    pub channels: Option<Vec<String>>,
    pub priorities: Option<Vec<String>>,
    pub key_pattern: Option<String>,
    pub created_after: Option<i64>,
    pub created_before: Option<i64>,
    pub sort: Option<Sort>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub include_metadata: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct DefaultsApplied {
    pub limit: bool,
    pub sort: bool,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total_pages: u32,
    pub has_next_page: bool,
    pub has_previous_page: bool,
    pub next_offset: Option<u32>,
    pub previous_offset: Option<u32>,
    pub defaults_applied: DefaultsApplied,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct QueryResult {
    pub items: Vec<ContextItem>,
    pub total_count: i64,
    pub pagination: Pagination,
}

/// Run the unified search/query engine. The privacy predicate
/// `(is_private = 0 OR session_id = :viewer)` is ALWAYS applied — this is
/// the one piece of SQL this engine must never drop (spec §4.5.3, §8
/// property 2/3).
///
/// # Errors
///
/// Returns an error if the query text or key pattern fails validation, or
/// if the underlying query fails.
pub fn query(driver: &Driver, opts: QueryOptions) -> Result<QueryResult> {
    let normalized_limit = validate::normalize_limit(opts.limit);
    let offset = validate::normalize_offset(opts.offset);
    let sort = opts.sort.unwrap_or_default();
    let defaults_applied = DefaultsApplied {
        limit: opts.limit.is_none(),
        sort: opts.sort.is_none(),
    };

    let mut predicates: Vec<String> = vec!["(is_private = 0 OR session_id = ?)".to_string()];
    let mut params: Vec<SqlValue> = vec![SqlValue::Text(opts.viewer_session_id.clone())];

    if let Some(raw) = &opts.query {
        if !raw.is_empty() {
            let sanitized = validate::sanitize_query(raw)?;
            if !sanitized.is_empty() {
                let like = format!("%{sanitized}%");
                match opts.search_in {
                    SearchIn::Key => {
                        predicates.push("key LIKE ? ESCAPE '\\'".to_string());
                        params.push(SqlValue::Text(like));
                    }
                    SearchIn::Value => {
                        predicates.push("value LIKE ? ESCAPE '\\'".to_string());
                        params.push(SqlValue::Text(like));
                    }
                    SearchIn::Both => {
                        predicates.push("(key LIKE ? ESCAPE '\\' OR value LIKE ? ESCAPE '\\')".to_string());
                        params.push(SqlValue::Text(like.clone()));
                        params.push(SqlValue::Text(like));
                    }
                }
            }
        }
    }

    if let Some(category) = &opts.category {
        predicates.push("category = ?".to_string());
        params.push(SqlValue::Text(category.clone()));
    }

    if let Some(channels) = &opts.channels {
        if !channels.is_empty() {
            let placeholders = vec!["?"; channels.len()].join(", ");
            predicates.push(format!("channel IN ({placeholders})"));
            for c in channels {
                params.push(SqlValue::Text(c.clone()));
            }
        }
    }

    if let Some(priorities) = &opts.priorities {
        if !priorities.is_empty() {
            let placeholders = vec!["?"; priorities.len()].join(", ");
            predicates.push(format!("priority IN ({placeholders})"));
            for p in priorities {
                params.push(SqlValue::Text(p.clone()));
            }
        }
    }

    if let Some(pattern) = &opts.key_pattern {
        validate::validate_glob_pattern(pattern)?;
        predicates.push("key GLOB ?".to_string());
        params.push(SqlValue::Text(pattern.clone()));
    }

    if let Some(after) = opts.created_after {
        predicates.push("created_at >= ?".to_string());
        params.push(SqlValue::Integer(after));
    }
    if let Some(before) = opts.created_before {
        predicates.push("created_at < ?".to_string());
        params.push(SqlValue::Integer(before));
    }

    let where_clause = predicates.join(" AND ");

    let count_sql = format!("SELECT COUNT(*) FROM context_items WHERE {where_clause}");
    let total_count: i64 = driver
        .conn()
        .query_row(&count_sql, params_from_iter(params.iter()), |r| r.get(0))?;

    let limit_value: i64 = normalized_limit.map_or(-1, i64::from);
    let select_sql = format!(
        "SELECT id, session_id, key, value, category, priority, channel, metadata, size, is_private, created_at, updated_at
         FROM context_items WHERE {where_clause}
         ORDER BY {}, created_at DESC, id ASC
         LIMIT ? OFFSET ?",
        sort.order_by(),
    );

    let mut select_params = params;
    select_params.push(SqlValue::Integer(limit_value));
    select_params.push(SqlValue::Integer(i64::from(offset)));

    let mut stmt = driver.conn().prepare(&select_sql)?;
    let rows = stmt.query_map(params_from_iter(select_params.iter()), map_row)?;
    let mut items = rows.collect::<rusqlite::Result<Vec<_>>>()?;

    if !opts.include_metadata {
        for item in &mut items {
            item.metadata = None;
        }
    }

    let page_size = normalized_limit.unwrap_or_else(|| u32::try_from(total_count.max(1)).unwrap_or(u32::MAX));
    let total_pages = if page_size == 0 {
        1
    } else {
        u32::try_from(total_count).unwrap_or(u32::MAX).div_ceil(page_size).max(1)
    };
    let page = if page_size == 0 { 1 } else { offset / page_size + 1 };
    let returned = u32::try_from(items.len()).unwrap_or(0);
    let has_next_page = i64::from(offset) + i64::from(returned) < total_count;
    let has_previous_page = offset > 0;

    Ok(QueryResult {
        items,
        total_count,
        pagination: Pagination {
            page,
            page_size,
            total_pages,
            has_next_page,
            has_previous_page,
            next_offset: has_next_page.then(|| offset + returned),
            previous_offset: has_previous_page.then(|| offset.saturating_sub(page_size)),
            defaults_applied,
        },
    })
}

// ---------------------------------------------------------------------
// Channel reassignment (spec §4.5.5)
// ---------------------------------------------------------------------

/// Move items between channels, matched by `selector` and optionally
/// filtered by category/priority. `dry_run` returns the would-be-moved set
/// without mutating.
///
/// # Errors
///
/// Returns an error if the query or write fails.
pub fn reassign_channel(
    driver: &mut Driver,
    actor: &str,
    session_id: &str,
    selector: KeySelector,
    category: Option<&str>,
    priority: Option<&str>,
    new_channel: &str,
    dry_run: bool,
) -> Result<Vec<String>> {
    validate::validate_channel(new_channel)?;

    driver.mutate("reassign_channel", actor, |tx, ctx| {
        let mut keys = resolve_selector(tx, session_id, &selector)?;
        if category.is_some() || priority.is_some() {
            let mut filtered = Vec::new();
            for key in keys {
                let row: Option<(Option<String>, String)> = tx
                    .query_row(
                        "SELECT category, priority FROM context_items WHERE session_id = ?1 AND key = ?2",
                        rusqlite::params![session_id, key],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;
                if let Some((cat, pri)) = row {
                    if category.is_some_and(|c| cat.as_deref() != Some(c)) {
                        continue;
                    }
                    if priority.is_some_and(|p| pri != p) {
                        continue;
                    }
                    filtered.push(key);
                }
            }
            keys = filtered;
        }

        if dry_run {
            return Ok(keys);
        }

        let now = chrono::Utc::now().timestamp_millis();
        for key in &keys {
            let item_id: Option<String> = tx
                .query_row(
                    "SELECT id FROM context_items WHERE session_id = ?1 AND key = ?2",
                    rusqlite::params![session_id, key],
                    |r| r.get(0),
                )
                .optional()?;
            tx.execute(
                "UPDATE context_items SET channel = ?1, updated_at = ?2 WHERE session_id = ?3 AND key = ?4",
                rusqlite::params![new_channel, now, session_id, key],
            )?;
            if let Some(id) = item_id {
                ctx.record_event("context_item", &id, EventType::ItemUpdated);
            }
        }
        Ok(keys)
    })
}

// ---------------------------------------------------------------------
// Cross-session copy (spec §4.5.6)
// ---------------------------------------------------------------------

/// Copy of `copyBetweenSessions`'s conflict resolution (spec §9, §13 Open
/// Question): conflicting keys are skipped, and `preserve_privacy` decides
/// whether `is_private` carries over from the source (current practice,
/// per §13) rather than being reset to public.
#[derive(Debug, Clone, serde::Serialize)]
pub struct CopyOutcome {
    pub copied: usize,
    pub skipped: Vec<String>,
}

/// Copy every item from `source_session_id` to `target_session_id`, skipping
/// rows that would collide with an existing `(target_session_id, key)`. The
/// `is_private` flag is preserved verbatim from the source item (spec §13
/// Open Question resolution).
///
/// # Errors
///
/// Returns an error if the read or write fails.
pub fn copy_between_sessions(
    driver: &mut Driver,
    actor: &str,
    source_session_id: &str,
    target_session_id: &str,
) -> Result<CopyOutcome> {
    driver.mutate("copy_between_sessions", actor, |tx, ctx| {
        let mut stmt = tx.prepare(
            "SELECT key, value, category, priority, channel, metadata, is_private
             FROM context_items WHERE session_id = ?1",
        )?;
        let source_items = stmt
            .query_map([source_session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, bool>(6)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let now = chrono::Utc::now().timestamp_millis();
        let mut copied = 0;
        let mut skipped = Vec::new();

        for (key, value, category, priority, channel, metadata, is_private) in source_items {
            let exists: bool = tx
                .prepare("SELECT 1 FROM context_items WHERE session_id = ?1 AND key = ?2")?
                .exists(rusqlite::params![target_session_id, key])?;
            if exists {
                skipped.push(key);
                continue;
            }

            let new_id = format!("item_{}", Uuid::new_v4());
            let size = i64::try_from(value.len()).unwrap_or(i64::MAX);
            tx.execute(
                "INSERT INTO context_items
                    (id, session_id, key, value, category, priority, channel, metadata, size, is_private, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                rusqlite::params![new_id, target_session_id, key, value, category, priority, channel, metadata, size, is_private, now],
            )?;
            ctx.record_event("context_item", &new_id, EventType::ItemCreated);
            copied += 1;
        }

        Ok(CopyOutcome { copied, skipped })
    })
}

fn map_row(row: &Row) -> rusqlite::Result<ContextItem> {
    Ok(ContextItem {
        id: row.get(0)?,
        session_id: row.get(1)?,
        key: row.get(2)?,
        value: row.get(3)?,
        category: row.get(4)?,
        priority: row.get(5)?,
        channel: row.get(6)?,
        metadata: row.get(7)?,
        size: row.get(8)?,
        is_private: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session;

    fn new_session(driver: &mut Driver, name: &str) -> String {
        session::create(driver, "actor", session::NewSession { name: Some(name.to_string()), ..Default::default() })
            .unwrap()
            .id
    }

    fn save_simple(driver: &mut Driver, session_id: &str, key: &str, value: &str) -> ContextItem {
        save(driver, "actor", session_id, "general", SaveInput {
            key: key.to_string(), value: value.to_string(), ..Default::default()
        }).unwrap()
    }

    #[test]
    fn save_then_get_round_trips_byte_for_byte() {
        let mut driver = Driver::open_memory().unwrap();
        let s = new_session(&mut driver, "s");
        save_simple(&mut driver, &s, "k", "hello world");
        let got = get_by_key(&driver, &s, "k").unwrap().unwrap();
        assert_eq!(got.value, "hello world");
    }

    #[test]
    fn save_empty_value_round_trips() {
        let mut driver = Driver::open_memory().unwrap();
        let s = new_session(&mut driver, "s");
        save_simple(&mut driver, &s, "k", "");
        let got = get_by_key(&driver, &s, "k").unwrap().unwrap();
        assert_eq!(got.value, "");
    }

    #[test]
    fn save_is_upsert_on_session_and_key() {
        let mut driver = Driver::open_memory().unwrap();
        let s = new_session(&mut driver, "s");
        let first = save_simple(&mut driver, &s, "k", "v1");
        let second = save_simple(&mut driver, &s, "k", "v2");
        assert_eq!(first.id, second.id);
        assert_eq!(second.value, "v2");
        let count: i64 = driver
            .conn()
            .query_row("SELECT COUNT(*) FROM context_items WHERE session_id = ?1 AND key = 'k'", [&s], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn save_rejects_invalid_key() {
        let mut driver = Driver::open_memory().unwrap();
        let s = new_session(&mut driver, "s");
        let result = save(&mut driver, "actor", &s, "general", SaveInput {
            key: "bad key".to_string(), value: "v".to_string(), ..Default::default()
        });
        assert!(result.is_err());
    }

    #[test]
    fn privacy_rule_scenario_a() {
        let mut driver = Driver::open_memory().unwrap();
        let s1 = new_session(&mut driver, "s1");
        let s2 = new_session(&mut driver, "s2");
        save(&mut driver, "actor", &s1, "general", SaveInput {
            key: "p".to_string(), value: "v1".to_string(), is_private: Some(false), ..Default::default()
        }).unwrap();
        save(&mut driver, "actor", &s1, "general", SaveInput {
            key: "s".to_string(), value: "secret".to_string(), is_private: Some(true), ..Default::default()
        }).unwrap();

        let from_s2 = query(&driver, QueryOptions { viewer_session_id: s2.clone(), ..Default::default() }).unwrap();
        let keys: Vec<&str> = from_s2.items.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, vec!["p"]);

        let from_s1 = query(&driver, QueryOptions { viewer_session_id: s1.clone(), ..Default::default() }).unwrap();
        let mut keys: Vec<&str> = from_s1.items.iter().map(|i| i.key.as_str()).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["p", "s"]);
    }

    #[test]
    fn filtered_search_scenario_b() {
        let mut driver = Driver::open_memory().unwrap();
        let s = new_session(&mut driver, "s");
        save(&mut driver, "actor", &s, "general", SaveInput { key: "auth_high_task".to_string(), value: "feature-auth".to_string(), category: Some("task".to_string()), priority: Some("high".to_string()), ..Default::default() }).unwrap();
        save(&mut driver, "actor", &s, "general", SaveInput { key: "auth_normal_task".to_string(), value: "feature-auth".to_string(), category: Some("task".to_string()), priority: Some("normal".to_string()), ..Default::default() }).unwrap();
        save(&mut driver, "actor", &s, "general", SaveInput { key: "auth_config_high".to_string(), value: "config".to_string(), category: Some("note".to_string()), priority: Some("high".to_string()), ..Default::default() }).unwrap();

        let result = query(&driver, QueryOptions {
            query: Some("auth".to_string()),
            category: Some("task".to_string()),
            priorities: Some(vec!["high".to_string()]),
            viewer_session_id: s,
            ..Default::default()
        }).unwrap();
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].key, "auth_high_task");
    }

    #[test]
    fn pagination_defaults_scenario_c() {
        let mut driver = Driver::open_memory().unwrap();
        let s = new_session(&mut driver, "s");
        for i in 0..150 {
            save_simple(&mut driver, &s, &format!("k{i}"), "v");
        }
        let result = query(&driver, QueryOptions { viewer_session_id: s, ..Default::default() }).unwrap();
        assert_eq!(result.items.len(), 100);
        assert_eq!(result.total_count, 150);
        assert!(result.pagination.defaults_applied.limit);
        assert!(result.pagination.defaults_applied.sort);
    }

    #[test]
    fn pagination_is_stable_across_pages() {
        let mut driver = Driver::open_memory().unwrap();
        let s = new_session(&mut driver, "s");
        for i in 0..25 {
            save_simple(&mut driver, &s, &format!("k{i:02}"), "v");
        }
        let mut seen = std::collections::HashSet::new();
        let mut offset = 0i64;
        loop {
            let page = query(&driver, QueryOptions {
                viewer_session_id: s.clone(), limit: Some(10), offset: Some(offset), sort: Some(Sort::KeyAsc), ..Default::default()
            }).unwrap();
            if page.items.is_empty() {
                break;
            }
            for item in &page.items {
                assert!(seen.insert(item.key.clone()), "duplicate across pages: {}", item.key);
            }
            offset += 10;
        }
        assert_eq!(seen.len(), 25);
    }

    #[test]
    fn batch_save_mix_scenario_d() {
        let mut driver = Driver::open_memory().unwrap();
        let s = new_session(&mut driver, "s");
        let items = vec![
            SaveInput { key: "valid_key_1".to_string(), value: "a".to_string(), ..Default::default() },
            SaveInput { key: String::new(), value: "b".to_string(), ..Default::default() },
            SaveInput { key: "valid_key_2".to_string(), value: "c".to_string(), ..Default::default() },
            SaveInput { key: "bad|key".to_string(), value: "d".to_string(), ..Default::default() },
            SaveInput { key: "valid_key_3".to_string(), value: "e".to_string(), ..Default::default() },
        ];
        let results = batch_save(&mut driver, "actor", &s, "general", items).unwrap();
        let succeeded = results.iter().filter(|r| r.success).count();
        let failed = results.iter().filter(|r| !r.success).count();
        assert_eq!(succeeded, 3);
        assert_eq!(failed, 2);
    }

    #[test]
    fn batch_save_exceeding_max_size_fails_whole_request() {
        let mut driver = Driver::open_memory().unwrap();
        let s = new_session(&mut driver, "s");
        let items: Vec<SaveInput> = (0..(validate::MAX_BATCH_SIZE + 1))
            .map(|i| SaveInput { key: format!("k{i}"), value: "v".to_string(), ..Default::default() })
            .collect();
        assert!(batch_save(&mut driver, "actor", &s, "general", items).is_err());
    }

    #[test]
    fn batch_delete_dry_run_does_not_mutate() {
        let mut driver = Driver::open_memory().unwrap();
        let s = new_session(&mut driver, "s");
        save_simple(&mut driver, &s, "k1", "v");
        save_simple(&mut driver, &s, "k2", "v");
        let result = batch_delete(&mut driver, "actor", &s, KeySelector::Pattern("k*".to_string()), true).unwrap();
        assert_eq!(result.len(), 2);
        assert!(get_by_key(&driver, &s, "k1").unwrap().is_some());
    }

    #[test]
    fn glob_pattern_matches_prefix_only() {
        let mut driver = Driver::open_memory().unwrap();
        let s = new_session(&mut driver, "s");
        save_simple(&mut driver, &s, "a.b.c", "v");
        save_simple(&mut driver, &s, "a.b.d", "v");
        save_simple(&mut driver, &s, "a.x.y", "v");
        let result = query(&driver, QueryOptions {
            key_pattern: Some("a.b.*".to_string()), viewer_session_id: s, ..Default::default()
        }).unwrap();
        assert_eq!(result.items.len(), 2);
    }

    #[test]
    fn relationship_cascade_on_delete() {
        let mut driver = Driver::open_memory().unwrap();
        let s = new_session(&mut driver, "s");
        save_simple(&mut driver, &s, "a", "v");
        save_simple(&mut driver, &s, "b", "v");
        crate::relationships::link(&mut driver, "actor", &s, "a", "b", crate::model::RelationshipType::References, None).unwrap();
        delete(&mut driver, "actor", &s, "a").unwrap();
        let count: i64 = driver.conn().query_row("SELECT COUNT(*) FROM context_relationships WHERE session_id = ?1", [&s], |r| r.get(0)).unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn copy_between_sessions_skips_conflicts() {
        let mut driver = Driver::open_memory().unwrap();
        let s1 = new_session(&mut driver, "s1");
        let s2 = new_session(&mut driver, "s2");
        save_simple(&mut driver, &s1, "a", "from-s1");
        save_simple(&mut driver, &s1, "b", "from-s1");
        save_simple(&mut driver, &s2, "a", "already-in-s2");

        let outcome = copy_between_sessions(&mut driver, "actor", &s1, &s2).unwrap();
        assert_eq!(outcome.copied, 1);
        assert_eq!(outcome.skipped, vec!["a".to_string()]);
        let a_in_s2 = get_by_session_and_key(driver.conn(), &s2, "a").unwrap().unwrap();
        assert_eq!(a_in_s2.value, "already-in-s2");
    }

    #[test]
    fn reassign_channel_moves_matched_items() {
        let mut driver = Driver::open_memory().unwrap();
        let s = new_session(&mut driver, "s");
        save_simple(&mut driver, &s, "a", "v");
        save_simple(&mut driver, &s, "b", "v");
        let moved = reassign_channel(&mut driver, "actor", &s, KeySelector::Keys(vec!["a".to_string()]), None, None, "feature-x", false).unwrap();
        assert_eq!(moved, vec!["a".to_string()]);
        let item = get_by_key(&driver, &s, "a").unwrap().unwrap();
        assert_eq!(item.channel, "feature-x");
    }
}
