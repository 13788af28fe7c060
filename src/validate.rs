//! Input validation rules (spec §4.3).
//!
//! Keys, values, queries, and channel names are validated here before any
//! storage call — the same "normalize dynamically-typed arguments before
//! they touch SQL" discipline the teacher crate applies in its own
//! `validate.rs`, adapted from issue status/type/priority synonyms to
//! key/value/query/channel rules.

use crate::error::{Error, Result};
use std::sync::LazyLock;

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 255;
/// Maximum value size in bytes (1 MiB).
pub const MAX_VALUE_LEN: usize = 1024 * 1024;
/// Maximum search query length; longer queries are truncated, not rejected.
pub const MAX_QUERY_LEN: usize = 1000;
/// Maximum channel name length.
pub const MAX_CHANNEL_LEN: usize = 20;
/// Default and maximum batch size for batch operations.
pub const MAX_BATCH_SIZE: usize = 100;

static RESERVED_CHANNELS: LazyLock<[&str; 2]> = LazyLock::new(|| ["main", "master"]);

/// Validate a context item key.
///
/// Non-empty after trimming, ≤ 255 bytes, only letters/digits/`_-./:`,
/// no leading/trailing whitespace, no control bytes, no non-ASCII.
pub fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(Error::InvalidArgument("key is empty".to_string()));
    }
    if key != key.trim() {
        return Err(Error::InvalidArgument(
            "key has leading or trailing whitespace".to_string(),
        ));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(Error::InvalidArgument(format!(
            "key exceeds {MAX_KEY_LEN} characters"
        )));
    }
    if key.chars().any(|c| c == ' ' || c == '\t') {
        return Err(Error::InvalidArgument(
            "key contains spaces or tabs".to_string(),
        ));
    }
    if !key.is_ascii() {
        return Err(Error::InvalidArgument(
            "key contains non-ASCII characters".to_string(),
        ));
    }
    if key
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || "_-./:".contains(c)))
    {
        return Err(Error::InvalidArgument(
            "key contains special characters outside [A-Za-z0-9_-./:]".to_string(),
        ));
    }
    Ok(())
}

/// Validate a context item value. Any byte sequence up to 1 MiB, may be empty.
pub fn validate_value(value: &str) -> Result<()> {
    if value.len() > MAX_VALUE_LEN {
        return Err(Error::InvalidArgument(format!(
            "value exceeds {MAX_VALUE_LEN} bytes (1 MiB)"
        )));
    }
    Ok(())
}

/// Validate a category string against the closed enumeration.
pub fn validate_category(category: &str) -> Result<()> {
    if crate::model::Category::from_str(category).is_none() {
        return Err(Error::InvalidArgument(format!(
            "invalid category '{category}': expected one of task, decision, progress, note, error, warning, git, system"
        )));
    }
    Ok(())
}

/// Validate a priority string against the closed enumeration.
pub fn validate_priority(priority: &str) -> Result<()> {
    if crate::model::Priority::from_str(priority).is_none() {
        return Err(Error::InvalidArgument(format!(
            "invalid priority '{priority}': expected one of high, normal, low"
        )));
    }
    Ok(())
}

/// Validate a relationship type against the closed enumeration.
pub fn validate_relationship_type(rel_type: &str) -> Result<()> {
    if crate::model::RelationshipType::from_str(rel_type).is_none() {
        return Err(Error::InvalidArgument(format!(
            "invalid relationship type '{rel_type}'"
        )));
    }
    Ok(())
}

/// Validate a channel name: non-empty, ≤ 20 chars, lowercase alphanumeric
/// with hyphens, and not one of the reserved names "main"/"master".
pub fn validate_channel(channel: &str) -> Result<()> {
    if channel.is_empty() {
        return Err(Error::InvalidArgument("channel is empty".to_string()));
    }
    if channel.len() > MAX_CHANNEL_LEN {
        return Err(Error::InvalidArgument(format!(
            "channel exceeds {MAX_CHANNEL_LEN} characters"
        )));
    }
    if channel
        .chars()
        .any(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'))
    {
        return Err(Error::InvalidArgument(
            "channel must be lowercase alphanumeric with hyphens".to_string(),
        ));
    }
    if RESERVED_CHANNELS.contains(&channel) {
        return Err(Error::InvalidArgument(format!(
            "channel name '{channel}' is reserved"
        )));
    }
    Ok(())
}

/// Sanitize a raw search query: reject a null byte, strip quote/semicolon/
/// backslash and SQL comment markers, escape the two LIKE wildcards, and
/// truncate to 1000 characters.
pub fn sanitize_query(raw: &str) -> Result<String> {
    if raw.contains('\0') {
        return Err(Error::InvalidArgument(
            "query contains a null byte".to_string(),
        ));
    }

    let mut cleaned = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\'' | '"' | ';' | '\\' => continue,
            '-' if chars.peek() == Some(&'-') => {
                // SQL line-comment marker "--"; drop both dashes.
                chars.next();
            }
            '/' if chars.peek() == Some(&'*') => {
                // SQL block-comment opener "/*"; drop both characters.
                chars.next();
            }
            '%' => cleaned.push_str("\\%"),
            '_' => cleaned.push_str("\\_"),
            other => cleaned.push(other),
        }
    }

    cleaned.truncate(MAX_QUERY_LEN);
    Ok(cleaned)
}

/// Validate a file path for the external file-cache collaborator (spec §4.3,
/// §6). The core never reads these paths itself; it only forwards them, but
/// still rejects obviously hostile input before handing it off.
pub fn validate_file_path(path: &str) -> Result<()> {
    if path.contains('\0') {
        return Err(Error::InvalidArgument(
            "path contains a null byte".to_string(),
        ));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(Error::InvalidArgument(
            "path contains a '..' segment".to_string(),
        ));
    }
    const RESERVED_ROOTS: [&str; 3] = ["/etc", "/proc", "/sys"];
    if RESERVED_ROOTS
        .iter()
        .any(|root| path == *root || path.starts_with(&format!("{root}/")))
    {
        return Err(Error::InvalidArgument(
            "path targets a reserved system root".to_string(),
        ));
    }
    Ok(())
}

/// Normalize a glob pattern containing `*`/`?` into a SQL `GLOB` pattern.
///
/// SQLite's `GLOB` already uses `*`/`?` natively (unlike `LIKE`), so this is
/// mostly pass-through, but we still guard against an empty pattern.
pub fn validate_glob_pattern(pattern: &str) -> Result<()> {
    if pattern.is_empty() {
        return Err(Error::InvalidArgument(
            "glob pattern is empty".to_string(),
        ));
    }
    Ok(())
}

/// Clamp a caller-supplied limit to the engine's bounds.
///
/// `0` means "unlimited"; negative or non-numeric input already became
/// `None` by the time it reaches here (the transport boundary normalizes
/// dynamically-typed arguments), so this only clamps the numeric range.
#[must_use]
pub fn normalize_limit(limit: Option<i64>) -> Option<u32> {
    match limit {
        None => Some(100),
        Some(0) => None,
        Some(n) if n < 0 => Some(100),
        Some(n) if n > 100 => Some(100),
        Some(n) => Some(n as u32),
    }
}

/// Clamp a caller-supplied offset to a non-negative value.
#[must_use]
pub fn normalize_offset(offset: Option<i64>) -> u32 {
    match offset {
        Some(n) if n > 0 => n as u32,
        _ => 0,
    }
}
