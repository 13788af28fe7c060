//! Schema migrations beyond the baseline created by `schema::apply_schema`.
//!
//! Each migration carries both directions (`apply_sql`/`rollback_sql`) and
//! an explicit dependency list, unlike the teacher's simpler apply-only,
//! `include_str!`-embedded migration list — the context engine's checkpoint/
//! branch/merge lifecycle needs a migration story that can be dry-run and
//! rolled back during development, not just applied once in production.

use crate::error::{Error, Result};
use rusqlite::Connection;
use std::time::Instant;

pub struct Migration {
    pub version: &'static str,
    pub name: &'static str,
    pub apply_sql: &'static str,
    pub rollback_sql: &'static str,
    pub dependencies: &'static [&'static str],
    pub requires_snapshot: bool,
}

/// Migrations that run after the baseline schema (`schema::CURRENT_SCHEMA_VERSION`).
/// Empty for the initial release — the baseline schema already covers every
/// table this version needs.
pub const MIGRATIONS: &[Migration] = &[];

/// Outcome of a single migration attempt, as recorded in `migrations_log`.
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub version: String,
    pub applied_at: i64,
    pub success: bool,
    pub execution_time_ms: i64,
}

/// Drives `MIGRATIONS` against a connection, recording outcomes in
/// `migrations_log`.
pub struct MigrationManager<'a> {
    conn: &'a Connection,
}

impl<'a> MigrationManager<'a> {
    #[must_use]
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }

    fn applied_versions(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT version FROM migrations_log WHERE success = 1")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn find(&self, version: &str) -> Result<&'static Migration> {
        MIGRATIONS
            .iter()
            .find(|m| m.version == version)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown migration version: {version}")))
    }

    fn record(&self, version: &str, success: bool, execution_time_ms: i64) -> Result<()> {
        self.conn.execute(
            "INSERT INTO migrations_log (version, applied_at, success, execution_time_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(version) DO UPDATE SET
                applied_at = excluded.applied_at,
                success = excluded.success,
                execution_time_ms = excluded.execution_time_ms",
            rusqlite::params![
                version,
                chrono::Utc::now().timestamp_millis(),
                success,
                execution_time_ms,
            ],
        )?;
        Ok(())
    }

    /// Apply a single migration by version, in its own transaction.
    pub fn apply_one(&self, version: &str) -> Result<MigrationRecord> {
        let migration = self.find(version)?;
        let applied = self.applied_versions()?;
        for dep in migration.dependencies {
            if !applied.iter().any(|v| v == dep) {
                return Err(Error::FailedPrecondition(format!(
                    "migration {version} depends on {dep}, which is not applied"
                )));
            }
        }

        let start = Instant::now();
        let tx = self.conn.unchecked_transaction()?;
        let result = tx.execute_batch(migration.apply_sql);
        let elapsed_ms = start.elapsed().as_millis() as i64;

        match result {
            Ok(()) => {
                tx.commit()?;
                self.record(version, true, elapsed_ms)?;
                Ok(MigrationRecord {
                    version: version.to_string(),
                    applied_at: chrono::Utc::now().timestamp_millis(),
                    success: true,
                    execution_time_ms: elapsed_ms,
                })
            }
            Err(e) => {
                drop(tx);
                self.record(version, false, elapsed_ms)?;
                Err(Error::Database(e))
            }
        }
    }

    /// Apply all pending migrations in declaration order, stopping at the
    /// first failure.
    pub fn apply_all(&self) -> Result<Vec<MigrationRecord>> {
        let applied = self.applied_versions()?;
        let mut records = Vec::new();
        for migration in MIGRATIONS {
            if applied.iter().any(|v| v == migration.version) {
                continue;
            }
            records.push(self.apply_one(migration.version)?);
        }
        Ok(records)
    }

    /// Roll back a previously applied migration.
    pub fn rollback_one(&self, version: &str) -> Result<()> {
        let migration = self.find(version)?;
        let tx = self.conn.unchecked_transaction()?;
        tx.execute_batch(migration.rollback_sql)?;
        tx.commit()?;
        self.conn.execute(
            "DELETE FROM migrations_log WHERE version = ?1",
            [version],
        )?;
        Ok(())
    }

    /// Report which migrations would run, without applying them.
    pub fn dry_run(&self) -> Result<Vec<&'static str>> {
        let applied = self.applied_versions()?;
        Ok(MIGRATIONS
            .iter()
            .filter(|m| !applied.iter().any(|v| v == m.version))
            .map(|m| m.version)
            .collect())
    }
}

/// Ensure `schema_migrations`/`migrations_log` exist and run any pending
/// migrations. Called from `schema::apply_schema` after the base schema is
/// in place.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations_log (
            version        TEXT PRIMARY KEY,
            applied_at     INTEGER NOT NULL,
            success        INTEGER NOT NULL,
            execution_time_ms INTEGER NOT NULL
        );",
    )?;

    let manager = MigrationManager::new(conn);
    for record in manager.apply_all()? {
        if record.success {
            tracing::info!(version = %record.version, "migration applied");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::schema::apply_schema;

    #[test]
    fn run_migrations_is_idempotent_on_fresh_db() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();
    }

    #[test]
    fn dry_run_reports_no_pending_migrations_when_empty() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        let manager = MigrationManager::new(&conn);
        assert!(manager.dry_run().unwrap().is_empty());
    }

    #[test]
    fn apply_one_rejects_unknown_version() {
        let conn = Connection::open_in_memory().unwrap();
        apply_schema(&conn).unwrap();
        let manager = MigrationManager::new(&conn);
        assert!(manager.apply_one("9999_nonexistent").is_err());
    }
}
