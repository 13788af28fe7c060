//! Relationship graph over context items (spec §4.6).
//!
//! Grounded in the teacher's `add_issue_dependency`/`remove_issue_dependency`
//! (lookup-then-`INSERT OR IGNORE` linking) and `get_dependency_tree`
//! (BFS with an explicit `queue`/`visited` pair) in `storage::sqlite`,
//! generalized from a single fixed `depends_on` edge type to the closed
//! ten-member [`crate::model::RelationshipType`] enumeration, and extended
//! with cycle detection and graph statistics the teacher never needed
//! (issue dependency trees are a DAG by convention, never checked).

use crate::error::{Error, Result};
use crate::model::{Relationship, RelationshipType};
use crate::storage::events::EventType;
use crate::storage::Driver;
use rusqlite::{params, OptionalExtension};
use std::collections::{HashMap, HashSet, VecDeque};
use uuid::Uuid;

/// Create a typed edge `from_key -> to_key`. Both keys must already exist as
/// items in `session_id`; self-links are allowed (spec §4.6 edge case).
///
/// # Errors
///
/// Returns `Error::ItemNotFound` if either endpoint doesn't exist, or
/// `Error::AlreadyExists` if the exact `(from_key, to_key, type)` triple is
/// already linked.
pub fn link(
    driver: &mut Driver,
    actor: &str,
    session_id: &str,
    from_key: &str,
    to_key: &str,
    relationship_type: RelationshipType,
    metadata: Option<serde_json::Value>,
) -> Result<Relationship> {
    let metadata_text = metadata.as_ref().map(serde_json::to_string).transpose()?;
    let id = format!("rel_{}", Uuid::new_v4());
    let now = chrono::Utc::now().timestamp_millis();
    let rel_type = relationship_type.as_str();

    driver.mutate("link_context_items", actor, |tx, ctx| {
        for key in [from_key, to_key] {
            let exists: bool = tx
                .prepare("SELECT 1 FROM context_items WHERE session_id = ?1 AND key = ?2")?
                .exists(params![session_id, key])?;
            if !exists {
                return Err(Error::ItemNotFound {
                    session_id: session_id.to_string(),
                    key: key.to_string(),
                });
            }
        }

        let duplicate: bool = tx
            .prepare(
                "SELECT 1 FROM context_relationships
                 WHERE session_id = ?1 AND from_key = ?2 AND to_key = ?3 AND relationship_type = ?4",
            )?
            .exists(params![session_id, from_key, to_key, rel_type])?;
        if duplicate {
            return Err(Error::AlreadyExists(format!(
                "{from_key} -{rel_type}-> {to_key} already linked"
            )));
        }

        tx.execute(
            "INSERT INTO context_relationships
                (id, session_id, from_key, to_key, relationship_type, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![id, session_id, from_key, to_key, rel_type, metadata_text, now],
        )?;
        ctx.record_event("relationship", &id, EventType::RelationshipCreated);
        Ok(())
    })?;

    Ok(Relationship {
        id,
        session_id: session_id.to_string(),
        from_key: from_key.to_string(),
        to_key: to_key.to_string(),
        relationship_type: rel_type.to_string(),
        metadata: metadata_text,
        created_at: now,
    })
}

/// Remove a single edge by id.
///
/// # Errors
///
/// Returns `Error::RelationshipNotFound` if `id` doesn't exist.
pub fn unlink(driver: &mut Driver, actor: &str, id: &str) -> Result<()> {
    let session_id: Option<String> = driver
        .conn()
        .query_row(
            "SELECT session_id FROM context_relationships WHERE id = ?1",
            [id],
            |r| r.get(0),
        )
        .optional()?;
    let Some(session_id) = session_id else {
        return Err(Error::RelationshipNotFound { id: id.to_string() });
    };

    driver.mutate("unlink_context_items", actor, |tx, ctx| {
        tx.execute("DELETE FROM context_relationships WHERE id = ?1", [id])?;
        ctx.record_event("relationship", id, EventType::RelationshipDeleted);
        let _ = session_id;
        Ok(())
    })
}

/// Which edge direction [`get_related`] walks from the starting key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Direction {
    Outgoing,
    Incoming,
    #[default]
    Both,
}

/// One node reached while traversing the relationship graph.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RelatedItem {
    pub key: String,
    pub depth: u32,
    pub relationship_type: String,
    pub path: Vec<String>,
}

/// Breadth-first traversal of the relationship graph from `start_key`, up to
/// `max_depth` hops, tracking visited nodes so cycles can't loop forever
/// (grounded in the teacher's `get_dependency_tree` queue/visited pair,
/// generalized to all ten edge types and either direction).
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn get_related(
    driver: &Driver,
    session_id: &str,
    start_key: &str,
    max_depth: u32,
    direction: Direction,
) -> Result<Vec<RelatedItem>> {
    let conn = driver.conn();
    let mut visited: HashSet<String> = HashSet::new();
    visited.insert(start_key.to_string());
    let mut queue: VecDeque<(String, u32, Vec<String>)> = VecDeque::new();
    queue.push_back((start_key.to_string(), 0, vec![start_key.to_string()]));
    let mut out = Vec::new();

    while let Some((current, depth, path)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }

        let mut edges: Vec<(String, String)> = Vec::new();
        if matches!(direction, Direction::Outgoing | Direction::Both) {
            let mut stmt = conn.prepare(
                "SELECT to_key, relationship_type FROM context_relationships
                 WHERE session_id = ?1 AND from_key = ?2",
            )?;
            let rows = stmt.query_map(params![session_id, current], |r| Ok((r.get(0)?, r.get(1)?)))?;
            edges.extend(rows.collect::<rusqlite::Result<Vec<_>>>()?);
        }
        if matches!(direction, Direction::Incoming | Direction::Both) {
            let mut stmt = conn.prepare(
                "SELECT from_key, relationship_type FROM context_relationships
                 WHERE session_id = ?1 AND to_key = ?2",
            )?;
            let rows = stmt.query_map(params![session_id, current], |r| Ok((r.get(0)?, r.get(1)?)))?;
            edges.extend(rows.collect::<rusqlite::Result<Vec<_>>>()?);
        }

        for (neighbor, rel_type) in edges {
            if visited.contains(&neighbor) {
                continue;
            }
            visited.insert(neighbor.clone());
            let mut next_path = path.clone();
            next_path.push(neighbor.clone());
            out.push(RelatedItem {
                key: neighbor.clone(),
                depth: depth + 1,
                relationship_type: rel_type,
                path: next_path.clone(),
            });
            queue.push_back((neighbor, depth + 1, next_path));
        }
    }

    Ok(out)
}

/// Detect a cycle in the `depends_on` subgraph via DFS with an explicit
/// recursion stack, returning the cycle's key sequence if one exists.
///
/// # Errors
///
/// Returns an error if the query fails.
pub fn detect_dependency_cycle(driver: &Driver, session_id: &str) -> Result<Option<Vec<String>>> {
    let conn = driver.conn();
    let mut stmt = conn.prepare(
        "SELECT from_key, to_key FROM context_relationships
         WHERE session_id = ?1 AND relationship_type = 'depends_on'",
    )?;
    let edges: Vec<(String, String)> = stmt
        .query_map([session_id], |r| Ok((r.get(0)?, r.get(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    let mut adjacency: HashMap<String, Vec<String>> = HashMap::new();
    for (from, to) in &edges {
        adjacency.entry(from.clone()).or_default().push(to.clone());
    }

    let mut visited: HashSet<String> = HashSet::new();
    let mut on_stack: HashSet<String> = HashSet::new();
    let mut path: Vec<String> = Vec::new();

    let nodes: Vec<String> = adjacency.keys().cloned().collect();
    for node in nodes {
        if visited.contains(&node) {
            continue;
        }
        if let Some(cycle) = dfs_find_cycle(&node, &adjacency, &mut visited, &mut on_stack, &mut path) {
            return Ok(Some(cycle));
        }
    }
    Ok(None)
}

fn dfs_find_cycle(
    node: &str,
    adjacency: &HashMap<String, Vec<String>>,
    visited: &mut HashSet<String>,
    on_stack: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> Option<Vec<String>> {
    visited.insert(node.to_string());
    on_stack.insert(node.to_string());
    path.push(node.to_string());

    if let Some(neighbors) = adjacency.get(node) {
        for neighbor in neighbors {
            if on_stack.contains(neighbor) {
                let start = path.iter().position(|n| n == neighbor).unwrap_or(0);
                let mut cycle = path[start..].to_vec();
                cycle.push(neighbor.clone());
                return Some(cycle);
            }
            if !visited.contains(neighbor) {
                if let Some(cycle) = dfs_find_cycle(neighbor, adjacency, visited, on_stack, path) {
                    return Some(cycle);
                }
            }
        }
    }

    path.pop();
    on_stack.remove(node);
    None
}

/// Aggregate statistics over a session's relationship graph (spec §11
/// supplemented feature: `orphans` names items with no edges at all).
#[derive(Debug, Clone, serde::Serialize)]
pub struct RelationshipStats {
    pub total: i64,
    pub by_type: HashMap<String, i64>,
    pub most_connected: Vec<(String, i64)>,
    pub orphans: Vec<String>,
}

/// Compute graph statistics for `session_id`.
///
/// # Errors
///
/// Returns an error if any underlying query fails.
pub fn statistics(driver: &Driver, session_id: &str) -> Result<RelationshipStats> {
    let conn = driver.conn();

    let total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM context_relationships WHERE session_id = ?1",
        [session_id],
        |r| r.get(0),
    )?;

    let mut by_type = HashMap::new();
    let mut stmt = conn.prepare(
        "SELECT relationship_type, COUNT(*) FROM context_relationships
         WHERE session_id = ?1 GROUP BY relationship_type",
    )?;
    let rows = stmt.query_map([session_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?;
    for row in rows {
        let (t, c) = row?;
        by_type.insert(t, c);
    }
    drop(stmt);

    let mut stmt = conn.prepare(
        "SELECT k, COUNT(*) as degree FROM (
            SELECT from_key AS k FROM context_relationships WHERE session_id = ?1
            UNION ALL
            SELECT to_key AS k FROM context_relationships WHERE session_id = ?1
        ) GROUP BY k ORDER BY degree DESC, k ASC LIMIT 10",
    )?;
    let most_connected = stmt
        .query_map([session_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    let mut stmt = conn.prepare(
        "SELECT key FROM context_items
         WHERE session_id = ?1
           AND key NOT IN (SELECT from_key FROM context_relationships WHERE session_id = ?1)
           AND key NOT IN (SELECT to_key FROM context_relationships WHERE session_id = ?1)",
    )?;
    let orphans = stmt
        .query_map([session_id], |r| r.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;

    Ok(RelationshipStats { total, by_type, most_connected, orphans })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{self, SaveInput};
    use crate::session;

    fn setup() -> (Driver, String) {
        let mut driver = Driver::open_memory().unwrap();
        let s = session::create(&mut driver, "actor", session::NewSession::default()).unwrap().id;
        for key in ["a", "b", "c", "d"] {
            repository::save(&mut driver, "actor", &s, "general", SaveInput {
                key: key.to_string(), value: "v".to_string(), ..Default::default()
            }).unwrap();
        }
        (driver, s)
    }

    #[test]
    fn link_rejects_missing_endpoint() {
        let (mut driver, s) = setup();
        let result = link(&mut driver, "actor", &s, "a", "nonexistent", RelationshipType::References, None);
        assert!(result.is_err());
    }

    #[test]
    fn link_rejects_duplicate_triple() {
        let (mut driver, s) = setup();
        link(&mut driver, "actor", &s, "a", "b", RelationshipType::References, None).unwrap();
        let result = link(&mut driver, "actor", &s, "a", "b", RelationshipType::References, None);
        assert!(result.is_err());
    }

    #[test]
    fn link_allows_self_reference() {
        let (mut driver, s) = setup();
        let result = link(&mut driver, "actor", &s, "a", "a", RelationshipType::RelatedTo, None);
        assert!(result.is_ok());
    }

    #[test]
    fn get_related_respects_max_depth_scenario_e() {
        let (mut driver, s) = setup();
        link(&mut driver, "actor", &s, "a", "b", RelationshipType::DependsOn, None).unwrap();
        link(&mut driver, "actor", &s, "b", "c", RelationshipType::DependsOn, None).unwrap();
        link(&mut driver, "actor", &s, "c", "d", RelationshipType::DependsOn, None).unwrap();

        let depth_1 = get_related(&driver, &s, "a", 1, Direction::Outgoing).unwrap();
        assert_eq!(depth_1.len(), 1);
        assert_eq!(depth_1[0].key, "b");

        let depth_3 = get_related(&driver, &s, "a", 3, Direction::Outgoing).unwrap();
        let keys: HashSet<&str> = depth_3.iter().map(|i| i.key.as_str()).collect();
        assert_eq!(keys, HashSet::from(["b", "c", "d"]));
    }

    #[test]
    fn get_related_does_not_loop_on_cycle() {
        let (mut driver, s) = setup();
        link(&mut driver, "actor", &s, "a", "b", RelationshipType::References, None).unwrap();
        link(&mut driver, "actor", &s, "b", "a", RelationshipType::References, None).unwrap();
        let related = get_related(&driver, &s, "a", 10, Direction::Outgoing).unwrap();
        assert_eq!(related.len(), 1);
    }

    #[test]
    fn detect_dependency_cycle_finds_a_cycle() {
        let (mut driver, s) = setup();
        link(&mut driver, "actor", &s, "a", "b", RelationshipType::DependsOn, None).unwrap();
        link(&mut driver, "actor", &s, "b", "c", RelationshipType::DependsOn, None).unwrap();
        link(&mut driver, "actor", &s, "c", "a", RelationshipType::DependsOn, None).unwrap();
        let cycle = detect_dependency_cycle(&driver, &s).unwrap();
        assert!(cycle.is_some());
    }

    #[test]
    fn detect_dependency_cycle_none_for_dag() {
        let (mut driver, s) = setup();
        link(&mut driver, "actor", &s, "a", "b", RelationshipType::DependsOn, None).unwrap();
        link(&mut driver, "actor", &s, "b", "c", RelationshipType::DependsOn, None).unwrap();
        assert!(detect_dependency_cycle(&driver, &s).unwrap().is_none());
    }

    #[test]
    fn statistics_reports_orphans_and_totals() {
        let (mut driver, s) = setup();
        link(&mut driver, "actor", &s, "a", "b", RelationshipType::References, None).unwrap();
        let stats = statistics(&driver, &s).unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.by_type.get("references"), Some(&1));
        assert_eq!(stats.orphans, vec!["c".to_string(), "d".to_string()]);
    }

    #[test]
    fn unlink_removes_edge() {
        let (mut driver, s) = setup();
        let rel = link(&mut driver, "actor", &s, "a", "b", RelationshipType::References, None).unwrap();
        unlink(&mut driver, "actor", &rel.id).unwrap();
        let stats = statistics(&driver, &s).unwrap();
        assert_eq!(stats.total, 0);
    }
}
