//! Domain models for the context repository engine.
//!
//! This module contains all the semantic types described by the data
//! model: sessions, context items, relationships, checkpoints, journal
//! entries, compressed buckets, and tool events. These are plain data
//! carriers — the storage-shaped read/write logic lives in `storage` and
//! the component modules (`session`, `repository`, `relationships`,
//! `checkpoint`, `compression`, `watcher`).

use serde::{Deserialize, Serialize};

/// Fallback channel name used whenever no other channel can be derived.
pub const DEFAULT_CHANNEL: &str = "general";

/// Closed set of context item categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Task,
    Decision,
    Progress,
    Note,
    Error,
    Warning,
    Git,
    System,
}

impl Category {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Decision => "decision",
            Self::Progress => "progress",
            Self::Note => "note",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Git => "git",
            Self::System => "system",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "task" => Self::Task,
            "decision" => Self::Decision,
            "progress" => Self::Progress,
            "note" => Self::Note,
            "error" => Self::Error,
            "warning" => Self::Warning,
            "git" => Self::Git,
            "system" => Self::System,
            _ => return None,
        })
    }
}

/// Priority of a context item. Default is `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "high" => Self::High,
            "normal" => Self::Normal,
            "low" => Self::Low,
            _ => return None,
        })
    }

    /// Sort weight for the `priority` sort option — high first.
    #[must_use]
    pub const fn rank(self) -> i32 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }
}

/// Closed set of relationship types between two context items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    Contains,
    DependsOn,
    References,
    Implements,
    Extends,
    RelatedTo,
    Blocks,
    BlockedBy,
    ParentOf,
    ChildOf,
}

impl RelationshipType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Contains => "contains",
            Self::DependsOn => "depends_on",
            Self::References => "references",
            Self::Implements => "implements",
            Self::Extends => "extends",
            Self::RelatedTo => "related_to",
            Self::Blocks => "blocks",
            Self::BlockedBy => "blocked_by",
            Self::ParentOf => "parent_of",
            Self::ChildOf => "child_of",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "contains" => Self::Contains,
            "depends_on" => Self::DependsOn,
            "references" => Self::References,
            "implements" => Self::Implements,
            "extends" => Self::Extends,
            "related_to" => Self::RelatedTo,
            "blocks" => Self::Blocks,
            "blocked_by" => Self::BlockedBy,
            "parent_of" => Self::ParentOf,
            "child_of" => Self::ChildOf,
            _ => return None,
        })
    }
}

/// A named container for related context items and their derived artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub branch: Option<String>,
    pub working_dir: Option<String>,
    pub parent_id: Option<String>,
    pub default_channel: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A single keyed piece of memory, unique per `(session_id, key)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: String,
    pub session_id: String,
    pub key: String,
    pub value: String,
    pub category: Option<String>,
    pub priority: String,
    pub channel: String,
    pub metadata: Option<String>,
    pub size: i64,
    pub is_private: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// A typed edge between two context items, scoped to one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub session_id: String,
    pub from_key: String,
    pub to_key: String,
    pub relationship_type: String,
    pub metadata: Option<String>,
    pub created_at: i64,
}

/// An immutable snapshot of a session's items (and optionally cached files).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub description: Option<String>,
    pub git_status: Option<String>,
    pub git_branch: Option<String>,
    pub item_count: i64,
    pub created_at: i64,
}

/// An append-only journal entry for a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub session_id: String,
    pub entry: String,
    pub tags: Option<String>,
    pub created_at: i64,
}

/// A summary of items deleted by the compression engine, grouped by category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressedBucket {
    pub id: String,
    pub session_id: String,
    pub category: Option<String>,
    pub original_count: i64,
    pub compressed_size: i64,
    pub compression_ratio: f64,
    pub date_range_start: i64,
    pub date_range_end: i64,
    pub summary: String,
    pub created_at: i64,
}

/// An append-only record of which tool touched which session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolEvent {
    pub id: String,
    pub session_id: String,
    pub tool_name: String,
    pub payload: Option<String>,
    pub created_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_round_trips() {
        for cat in [
            Category::Task,
            Category::Decision,
            Category::Progress,
            Category::Note,
            Category::Error,
            Category::Warning,
            Category::Git,
            Category::System,
        ] {
            assert_eq!(Category::from_str(cat.as_str()), Some(cat));
        }
        assert_eq!(Category::from_str("bogus"), None);
    }

    #[test]
    fn priority_default_is_normal() {
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn priority_rank_orders_high_first() {
        assert!(Priority::High.rank() < Priority::Normal.rank());
        assert!(Priority::Normal.rank() < Priority::Low.rank());
    }

    #[test]
    fn relationship_type_round_trips() {
        for rt in [
            RelationshipType::Contains,
            RelationshipType::DependsOn,
            RelationshipType::References,
            RelationshipType::Implements,
            RelationshipType::Extends,
            RelationshipType::RelatedTo,
            RelationshipType::Blocks,
            RelationshipType::BlockedBy,
            RelationshipType::ParentOf,
            RelationshipType::ChildOf,
        ] {
            assert_eq!(RelationshipType::from_str(rt.as_str()), Some(rt));
        }
        assert_eq!(RelationshipType::from_str("nonsense"), None);
    }
}
