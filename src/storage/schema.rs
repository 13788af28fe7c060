//! Database schema: tables, indexes, triggers, and the one-shot `apply_schema`
//! entry point. Structure follows the teacher crate's `storage::schema` —
//! one big `SCHEMA_SQL` constant applied with `execute_batch`, PRAGMAs set
//! first, migrations run after.

use crate::error::Result;
use rusqlite::Connection;

pub const CURRENT_SCHEMA_VERSION: i32 = 1;

pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
    version INTEGER PRIMARY KEY
);

CREATE TABLE IF NOT EXISTS sessions (
    id              TEXT PRIMARY KEY,
    name            TEXT NOT NULL,
    description     TEXT,
    branch          TEXT,
    working_dir     TEXT,
    parent_id       TEXT REFERENCES sessions(id) ON DELETE SET NULL,
    default_channel TEXT NOT NULL DEFAULT 'general',
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_id);

CREATE TABLE IF NOT EXISTS context_items (
    id          TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    key         TEXT NOT NULL,
    value       TEXT NOT NULL,
    category    TEXT,
    priority    TEXT NOT NULL DEFAULT 'normal',
    channel     TEXT NOT NULL DEFAULT 'general',
    metadata    TEXT,
    size        INTEGER NOT NULL,
    is_private  INTEGER NOT NULL DEFAULT 0,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    UNIQUE(session_id, key)
);

CREATE INDEX IF NOT EXISTS idx_context_items_session_channel
    ON context_items(session_id, channel);
CREATE INDEX IF NOT EXISTS idx_context_items_session_category
    ON context_items(session_id, category);
CREATE INDEX IF NOT EXISTS idx_context_items_session_priority
    ON context_items(session_id, priority);
CREATE INDEX IF NOT EXISTS idx_context_items_session_created
    ON context_items(session_id, created_at);
CREATE INDEX IF NOT EXISTS idx_context_items_private
    ON context_items(session_id, is_private);

CREATE TABLE IF NOT EXISTS context_relationships (
    id                TEXT PRIMARY KEY,
    session_id        TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    from_key          TEXT NOT NULL,
    to_key            TEXT NOT NULL,
    relationship_type TEXT NOT NULL,
    metadata          TEXT,
    created_at        INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_relationships_from
    ON context_relationships(session_id, from_key);
CREATE INDEX IF NOT EXISTS idx_relationships_to
    ON context_relationships(session_id, to_key);

CREATE TABLE IF NOT EXISTS checkpoints (
    id          TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    name        TEXT NOT NULL,
    description TEXT,
    git_status  TEXT,
    git_branch  TEXT,
    item_count  INTEGER NOT NULL DEFAULT 0,
    created_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_session
    ON checkpoints(session_id, created_at);

CREATE TABLE IF NOT EXISTS checkpoint_items (
    id            TEXT PRIMARY KEY,
    checkpoint_id TEXT NOT NULL REFERENCES checkpoints(id) ON DELETE CASCADE,
    key           TEXT NOT NULL,
    value         TEXT NOT NULL,
    category      TEXT,
    priority      TEXT NOT NULL DEFAULT 'normal',
    channel       TEXT NOT NULL DEFAULT 'general',
    metadata      TEXT,
    is_private    INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_checkpoint_items_checkpoint
    ON checkpoint_items(checkpoint_id);

CREATE TABLE IF NOT EXISTS checkpoint_files (
    id            TEXT PRIMARY KEY,
    checkpoint_id TEXT NOT NULL REFERENCES checkpoints(id) ON DELETE CASCADE,
    file_path     TEXT NOT NULL,
    file_hash     TEXT
);

CREATE INDEX IF NOT EXISTS idx_checkpoint_files_checkpoint
    ON checkpoint_files(checkpoint_id);

CREATE TABLE IF NOT EXISTS journal_entries (
    id          TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    entry       TEXT NOT NULL,
    tags        TEXT,
    created_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_journal_entries_session
    ON journal_entries(session_id, created_at);

CREATE TABLE IF NOT EXISTS compressed_context (
    id                 TEXT PRIMARY KEY,
    session_id         TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    category           TEXT,
    original_count     INTEGER NOT NULL,
    compressed_size    INTEGER NOT NULL,
    compression_ratio  REAL NOT NULL,
    date_range_start   INTEGER NOT NULL,
    date_range_end     INTEGER NOT NULL,
    summary            TEXT NOT NULL,
    created_at         INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_compressed_context_session
    ON compressed_context(session_id, created_at);

CREATE TABLE IF NOT EXISTS tool_events (
    id          TEXT PRIMARY KEY,
    session_id  TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    tool_name   TEXT NOT NULL,
    payload     TEXT,
    created_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tool_events_session
    ON tool_events(session_id, created_at);

CREATE TABLE IF NOT EXISTS events (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    entity_type TEXT NOT NULL,
    entity_id   TEXT NOT NULL,
    event_type  TEXT NOT NULL,
    actor       TEXT NOT NULL,
    old_value   TEXT,
    new_value   TEXT,
    comment     TEXT,
    created_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_events_entity
    ON events(entity_type, entity_id, created_at);

CREATE TABLE IF NOT EXISTS change_log (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id  TEXT NOT NULL,
    channel     TEXT NOT NULL,
    entity_type TEXT NOT NULL,
    entity_id   TEXT NOT NULL,
    change_type TEXT NOT NULL,
    key         TEXT,
    category    TEXT,
    priority    TEXT,
    is_private  INTEGER NOT NULL DEFAULT 0,
    created_at  INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_change_log_session
    ON change_log(session_id, seq);

CREATE TABLE IF NOT EXISTS migrations_log (
    version        TEXT PRIMARY KEY,
    applied_at     INTEGER NOT NULL,
    success        INTEGER NOT NULL,
    execution_time_ms INTEGER NOT NULL
);

CREATE TRIGGER IF NOT EXISTS update_session_timestamp_on_item_insert
AFTER INSERT ON context_items
BEGIN
    UPDATE sessions SET updated_at = NEW.created_at WHERE id = NEW.session_id;
END;

CREATE TRIGGER IF NOT EXISTS update_session_timestamp_on_item_update
AFTER UPDATE ON context_items
BEGIN
    UPDATE sessions SET updated_at = NEW.updated_at WHERE id = NEW.session_id;
END;

CREATE VIEW IF NOT EXISTS session_summary AS
SELECT
    s.id,
    s.name,
    s.default_channel,
    COUNT(DISTINCT ci.id)  AS item_count,
    COUNT(DISTINCT cp.id)  AS checkpoint_count,
    s.updated_at
FROM sessions s
LEFT JOIN context_items ci ON ci.session_id = s.id
LEFT JOIN checkpoints cp ON cp.session_id = s.id
GROUP BY s.id;
";

/// Apply PRAGMAs, the schema, and pending migrations to a fresh or existing
/// connection. Idempotent — safe to call on every open.
pub fn apply_schema(conn: &Connection) -> Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "cache_size", -64_000_i64)?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;

    conn.execute_batch(SCHEMA_SQL)?;

    super::migrations::run_migrations(conn)?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations (version) VALUES (?1)",
        [CURRENT_SCHEMA_VERSION],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_conn() -> Connection {
        Connection::open_in_memory().unwrap()
    }

    #[test]
    fn apply_schema_succeeds() {
        let conn = memory_conn();
        apply_schema(&conn).unwrap();
    }

    #[test]
    fn apply_schema_is_idempotent() {
        let conn = memory_conn();
        apply_schema(&conn).unwrap();
        apply_schema(&conn).unwrap();
    }

    #[test]
    fn foreign_keys_enabled() {
        let conn = memory_conn();
        apply_schema(&conn).unwrap();
        let fk: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |r| r.get(0))
            .unwrap();
        assert_eq!(fk, 1);
    }

    #[test]
    fn context_item_unique_per_session_and_key() {
        let conn = memory_conn();
        apply_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO sessions (id, name, default_channel, created_at, updated_at)
             VALUES ('s1', 'session one', 'general', 1, 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO context_items
                (id, session_id, key, value, priority, channel, size, is_private, created_at, updated_at)
             VALUES ('i1', 's1', 'k', 'v', 'normal', 'general', 1, 0, 1, 1)",
            [],
        )
        .unwrap();
        let result = conn.execute(
            "INSERT INTO context_items
                (id, session_id, key, value, priority, channel, size, is_private, created_at, updated_at)
             VALUES ('i2', 's1', 'k', 'v2', 'normal', 'general', 2, 0, 2, 2)",
            [],
        );
        assert!(result.is_err());
    }

    #[test]
    fn session_timestamp_updates_on_item_insert() {
        let conn = memory_conn();
        apply_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO sessions (id, name, default_channel, created_at, updated_at)
             VALUES ('s1', 'session one', 'general', 1, 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO context_items
                (id, session_id, key, value, priority, channel, size, is_private, created_at, updated_at)
             VALUES ('i1', 's1', 'k', 'v', 'normal', 'general', 1, 0, 500, 500)",
            [],
        )
        .unwrap();
        let updated_at: i64 = conn
            .query_row("SELECT updated_at FROM sessions WHERE id = 's1'", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(updated_at, 500);
    }
}
