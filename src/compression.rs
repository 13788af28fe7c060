//! Compression engine (spec §4.8): age-based compaction into summarized
//! buckets.
//!
//! Grounded in the teacher's append-only archival idiom in
//! `storage::events` (insert a durable summary row, never mutate it
//! afterward) combined with its category-grouping pattern from
//! `get_context_items`'s `GROUP BY`-shaped aggregate queries. There is no
//! direct teacher analogue for "delete the originals after summarizing" —
//! this module is new composition of the two, not a copy of either.

use crate::error::Result;
use crate::model::CompressedBucket;
use crate::storage::events::EventType;
use crate::storage::Driver;
use rusqlite::params;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// One category's worth of items about to be compressed.
#[derive(Debug, Clone, Serialize)]
pub struct CategorySummary {
    pub category: Option<String>,
    pub count: i64,
    pub priority_histogram: HashMap<String, i64>,
    pub keys: Vec<String>,
    pub sample: Vec<String>,
}

/// Compress every item in `session_id` older than `older_than_millis`,
/// grouped by category. `preserve_categories` names categories to exclude
/// from compression entirely. Returns one [`CompressedBucket`] per group;
/// the original items are deleted in the same transaction.
///
/// # Errors
///
/// Returns an error if the query or write fails.
pub fn compress(
    driver: &mut Driver,
    actor: &str,
    session_id: &str,
    older_than_millis: i64,
    preserve_categories: &[String],
) -> Result<Vec<CompressedBucket>> {
    let now = chrono::Utc::now().timestamp_millis();

    driver.mutate("compress_context", actor, |tx, ctx| {
        let mut stmt = tx.prepare(
            "SELECT key, value, category, priority, size, created_at
             FROM context_items WHERE session_id = ?1 AND created_at < ?2",
        )?;
        let rows = stmt
            .query_map(params![session_id, older_than_millis], |row| {
                Ok((
                    row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?,
                    row.get::<_, String>(3)?, row.get::<_, i64>(4)?, row.get::<_, i64>(5)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        drop(stmt);

        let mut groups: HashMap<Option<String>, Vec<(String, String, String, i64, i64)>> = HashMap::new();
        for (key, value, category, priority, size, created_at) in rows {
            if let Some(category) = &category {
                if preserve_categories.iter().any(|c| c == category) {
                    continue;
                }
            }
            groups.entry(category).or_default().push((key, value, priority, size, created_at));
        }

        let mut buckets = Vec::new();
        for (category, items) in groups {
            if items.is_empty() {
                continue;
            }
            let original_count = i64::try_from(items.len()).unwrap_or(i64::MAX);
            let mut priority_histogram: HashMap<String, i64> = HashMap::new();
            let mut keys = Vec::new();
            let mut sample = Vec::new();
            let mut total_original_size = 0i64;
            let mut date_range_start = i64::MAX;
            let mut date_range_end = i64::MIN;

            for (key, value, priority, size, created_at) in &items {
                *priority_histogram.entry(priority.clone()).or_insert(0) += 1;
                keys.push(key.clone());
                if sample.len() < 3 {
                    sample.push(value.clone());
                }
                total_original_size += size;
                date_range_start = date_range_start.min(*created_at);
                date_range_end = date_range_end.max(*created_at);
            }

            let summary_obj = CategorySummary {
                category: category.clone(),
                count: original_count,
                priority_histogram: priority_histogram.clone(),
                keys: keys.clone(),
                sample,
            };
            let summary_text = serde_json::to_string(&summary_obj)?;
            let compressed_size = i64::try_from(summary_text.len()).unwrap_or(i64::MAX);
            #[allow(clippy::cast_precision_loss)]
            let ratio = if total_original_size > 0 {
                compressed_size as f64 / total_original_size as f64
            } else {
                0.0
            };

            let bucket_id = format!("bucket_{}", Uuid::new_v4());
            tx.execute(
                "INSERT INTO compressed_context
                    (id, session_id, category, original_count, compressed_size, compression_ratio,
                     date_range_start, date_range_end, summary, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![bucket_id, session_id, category, original_count, compressed_size, ratio,
                        date_range_start, date_range_end, summary_text, now],
            )?;

            for key in &keys {
                tx.execute(
                    "DELETE FROM context_items WHERE session_id = ?1 AND key = ?2",
                    params![session_id, key],
                )?;
            }

            ctx.record_event("compressed_context", &bucket_id, EventType::CompressionRun);
            buckets.push(CompressedBucket {
                id: bucket_id,
                session_id: session_id.to_string(),
                category,
                original_count,
                compressed_size,
                compression_ratio: ratio,
                date_range_start,
                date_range_end,
                summary: summary_text,
                created_at: now,
            });
        }

        Ok(buckets)
    })
}

/// List compressed buckets for a session, most recent first. Buckets are
/// retrievable but never editable once created.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn list(driver: &Driver, session_id: &str) -> Result<Vec<CompressedBucket>> {
    let mut stmt = driver.conn().prepare(
        "SELECT id, session_id, category, original_count, compressed_size, compression_ratio,
                date_range_start, date_range_end, summary, created_at
         FROM compressed_context WHERE session_id = ?1 ORDER BY created_at DESC",
    )?;
    let rows = stmt.query_map([session_id], |row| {
        Ok(CompressedBucket {
            id: row.get(0)?,
            session_id: row.get(1)?,
            category: row.get(2)?,
            original_count: row.get(3)?,
            compressed_size: row.get(4)?,
            compression_ratio: row.get(5)?,
            date_range_start: row.get(6)?,
            date_range_end: row.get(7)?,
            summary: row.get(8)?,
            created_at: row.get(9)?,
        })
    })?;
    rows.collect::<rusqlite::Result<Vec<_>>>().map_err(crate::error::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{self, SaveInput};
    use crate::session::{self, NewSession};

    #[test]
    fn compress_groups_by_category_and_deletes_originals() {
        let mut driver = Driver::open_memory().unwrap();
        let s = session::create(&mut driver, "actor", NewSession::default()).unwrap().id;
        repository::save(&mut driver, "actor", &s, "general", SaveInput {
            key: "t1".to_string(), value: "task one".to_string(), category: Some("task".to_string()), ..Default::default()
        }).unwrap();
        repository::save(&mut driver, "actor", &s, "general", SaveInput {
            key: "t2".to_string(), value: "task two".to_string(), category: Some("task".to_string()), ..Default::default()
        }).unwrap();
        repository::save(&mut driver, "actor", &s, "general", SaveInput {
            key: "n1".to_string(), value: "note one".to_string(), category: Some("note".to_string()), ..Default::default()
        }).unwrap();

        let future_cutoff = chrono::Utc::now().timestamp_millis() + 60_000;
        let buckets = compress(&mut driver, "actor", &s, future_cutoff, &[]).unwrap();
        assert_eq!(buckets.len(), 2);

        let remaining = repository::query(&driver, repository::QueryOptions {
            viewer_session_id: s, ..Default::default()
        }).unwrap();
        assert_eq!(remaining.total_count, 0);
    }

    #[test]
    fn compress_preserves_named_categories() {
        let mut driver = Driver::open_memory().unwrap();
        let s = session::create(&mut driver, "actor", NewSession::default()).unwrap().id;
        repository::save(&mut driver, "actor", &s, "general", SaveInput {
            key: "d1".to_string(), value: "decision".to_string(), category: Some("decision".to_string()), ..Default::default()
        }).unwrap();

        let future_cutoff = chrono::Utc::now().timestamp_millis() + 60_000;
        let buckets = compress(&mut driver, "actor", &s, future_cutoff, &["decision".to_string()]).unwrap();
        assert!(buckets.is_empty());
        assert!(repository::get_by_key(&driver, &s, "d1").unwrap().is_some());
    }

    #[test]
    fn compress_only_touches_items_older_than_cutoff() {
        let mut driver = Driver::open_memory().unwrap();
        let s = session::create(&mut driver, "actor", NewSession::default()).unwrap().id;
        repository::save(&mut driver, "actor", &s, "general", SaveInput {
            key: "fresh".to_string(), value: "recent".to_string(), category: Some("note".to_string()), ..Default::default()
        }).unwrap();

        let past_cutoff = 1;
        let buckets = compress(&mut driver, "actor", &s, past_cutoff, &[]).unwrap();
        assert!(buckets.is_empty());
        assert!(repository::get_by_key(&driver, &s, "fresh").unwrap().is_some());
    }
}
