//! Session lifecycle (spec §4.4): creation, lineage, default-channel
//! derivation. Generalizes the teacher's `create_session`/`get_session`/
//! `list_sessions`/`rename_session` quartet in `storage::sqlite` — same
//! upsert-free insert-then-read shape, narrowed to the fields §3 names for
//! `Session` (no `project_path`, no status: sessions here are never closed).

use crate::channel;
use crate::error::{Error, Result};
use crate::model::{Session, DEFAULT_CHANNEL};
use crate::storage::Driver;
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

/// Arguments accepted by [`create`]. All fields besides `name` are optional;
/// `default_channel` resolution follows the priority chain in spec §4.4:
/// explicit argument, then derived from `branch`, then derived from `name`,
/// then [`DEFAULT_CHANNEL`].
#[derive(Debug, Clone, Default)]
pub struct NewSession {
    pub name: Option<String>,
    pub description: Option<String>,
    pub parent_id: Option<String>,
    pub branch: Option<String>,
    pub working_dir: Option<String>,
    pub default_channel: Option<String>,
}

/// Create a new session, resolving its default channel per spec §4.4.
///
/// # Errors
///
/// Returns an error if `parent_id` is given but does not name an existing
/// session, or if the write fails.
pub fn create(driver: &mut Driver, actor: &str, args: NewSession) -> Result<Session> {
    if let Some(parent) = &args.parent_id {
        if get(driver, parent)?.is_none() {
            return Err(Error::SessionNotFound {
                id: parent.clone(),
            });
        }
    }

    let id = format!("sess_{}", Uuid::new_v4());
    let name = args
        .name
        .unwrap_or_else(|| format!("session-{}", &id[5..13]));

    let resolved_channel = args
        .default_channel
        .filter(|c| !c.is_empty())
        .or_else(|| args.branch.as_deref().and_then(channel::derive_from_branch))
        .or_else(|| channel::derive_from_session_name(&name))
        .unwrap_or_else(|| DEFAULT_CHANNEL.to_string());

    let now = chrono::Utc::now().timestamp_millis();

    driver.mutate("create_session", actor, |tx, ctx| {
        tx.execute(
            "INSERT INTO sessions
                (id, name, description, branch, working_dir, parent_id, default_channel, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            params![
                id,
                name,
                args.description,
                args.branch,
                args.working_dir,
                args.parent_id,
                resolved_channel,
                now,
            ],
        )?;
        ctx.record_event("session", &id, crate::storage::events::EventType::SessionCreated);
        Ok(())
    })?;

    get(driver, &id)?.ok_or_else(|| Error::Internal("session vanished after insert".to_string()))
}

/// Fetch a session by id, or `None` if it doesn't exist.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get(driver: &Driver, id: &str) -> Result<Option<Session>> {
    driver
        .conn()
        .query_row(
            "SELECT id, name, description, branch, working_dir, parent_id, default_channel, created_at, updated_at
             FROM sessions WHERE id = ?1",
            [id],
            map_row,
        )
        .optional()
        .map_err(Error::from)
}

/// List sessions, most recently updated first.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list(driver: &Driver, limit: Option<u32>) -> Result<Vec<Session>> {
    let limit = limit.unwrap_or(50);
    let mut stmt = driver.conn().prepare(
        "SELECT id, name, description, branch, working_dir, parent_id, default_channel, created_at, updated_at
         FROM sessions ORDER BY updated_at DESC LIMIT ?1",
    )?;
    let rows = stmt.query_map([limit], map_row)?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::from)
}

/// Fields that may be changed after creation (spec §3: "mutable only in
/// name/description/default_channel").
#[derive(Debug, Clone, Default)]
pub struct SessionUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub default_channel: Option<String>,
}

/// Update a session's name, description, or default channel.
///
/// # Errors
///
/// Returns `Error::SessionNotFound` if `id` doesn't exist, or an error if
/// `default_channel` fails validation, or if the write fails.
pub fn update(driver: &mut Driver, actor: &str, id: &str, patch: SessionUpdate) -> Result<Session> {
    if get(driver, id)?.is_none() {
        return Err(Error::SessionNotFound { id: id.to_string() });
    }
    if let Some(channel) = &patch.default_channel {
        crate::validate::validate_channel(channel)?;
    }

    let now = chrono::Utc::now().timestamp_millis();
    driver.mutate("update_session", actor, |tx, ctx| {
        let mut set_parts: Vec<&str> = vec!["updated_at"];
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(now)];

        if let Some(name) = &patch.name {
            set_parts.push("name");
            params.push(Box::new(name.clone()));
        }
        if let Some(description) = &patch.description {
            set_parts.push("description");
            params.push(Box::new(description.clone()));
        }
        if let Some(channel) = &patch.default_channel {
            set_parts.push("default_channel");
            params.push(Box::new(channel.clone()));
        }

        let set_clause: String = set_parts
            .iter()
            .enumerate()
            .map(|(i, field)| format!("{field} = ?{}", i + 1))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "UPDATE sessions SET {set_clause} WHERE id = ?{}",
            params.len() + 1
        );
        params.push(Box::new(id.to_string()));
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(AsRef::as_ref).collect();
        tx.execute(&query, param_refs.as_slice())?;

        ctx.record_event("session", id, crate::storage::events::EventType::SessionUpdated);
        Ok(())
    })?;

    get(driver, id)?.ok_or_else(|| Error::SessionNotFound { id: id.to_string() })
}

fn map_row(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        branch: row.get(3)?,
        working_dir: row.get(4)?,
        parent_id: row.get(5)?,
        default_channel: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}
