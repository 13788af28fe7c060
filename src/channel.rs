//! Branch-name→channel derivation and normalization (spec §3, §4.4, testable
//! property 12).
//!
//! Channels are plain `TEXT` columns (§ SPEC_FULL 4), so this module is pure
//! string transformation with no storage dependency — it decides what name
//! to write, not where.

use crate::model::DEFAULT_CHANNEL;

const MAX_CHANNEL_LEN: usize = 20;

/// Derive a channel name from a git branch name.
///
/// `"main"`/`"master"` are reserved and never derived automatically — this
/// returns `None` for them so the caller falls through to the next source
/// (session name, then [`DEFAULT_CHANNEL`]). Non-ASCII and punctuation
/// collapse to hyphens; the result is truncated to 20 characters; an empty
/// result after normalization also yields `None`.
#[must_use]
pub fn derive_from_branch(branch: &str) -> Option<String> {
    let lower = branch.to_lowercase();
    if lower == "main" || lower == "master" {
        return None;
    }
    normalize(branch)
}

/// Derive a channel name from a session name, using the same normalization
/// rules as branch derivation.
#[must_use]
pub fn derive_from_session_name(name: &str) -> Option<String> {
    normalize(name)
}

/// Resolve the effective channel for a new context item or session:
/// explicit value wins, then `session_default`, then [`DEFAULT_CHANNEL`].
#[must_use]
pub fn resolve(explicit: Option<&str>, session_default: &str) -> String {
    match explicit {
        Some(channel) if !channel.is_empty() => channel.to_string(),
        _ => {
            if session_default.is_empty() {
                DEFAULT_CHANNEL.to_string()
            } else {
                session_default.to_string()
            }
        }
    }
}

/// Normalize an arbitrary string into a valid channel name: lowercase,
/// non-alphanumeric runs collapse to a single hyphen, leading/trailing
/// hyphens trimmed, truncated to 20 characters. Returns `None` if nothing
/// survives normalization.
fn normalize(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_hyphen = false;

    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_was_hyphen = false;
        } else if !last_was_hyphen && !out.is_empty() {
            out.push('-');
            last_was_hyphen = true;
        }
    }

    while out.ends_with('-') {
        out.pop();
    }

    out.truncate(MAX_CHANNEL_LEN);
    while out.ends_with('-') {
        out.pop();
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_and_master_are_skipped() {
        assert_eq!(derive_from_branch("main"), None);
        assert_eq!(derive_from_branch("master"), None);
        assert_eq!(derive_from_branch("Main"), None);
    }

    #[test]
    fn simple_branch_passes_through() {
        assert_eq!(derive_from_branch("feature-auth"), Some("feature-auth".to_string()));
    }

    #[test]
    fn long_branch_truncates_to_20_chars() {
        let branch = "feature/a-very-long-branch-name-indeed";
        let channel = derive_from_branch(branch).unwrap();
        assert!(channel.len() <= MAX_CHANNEL_LEN);
    }

    #[test]
    fn punctuation_and_slashes_collapse_to_hyphens() {
        assert_eq!(
            derive_from_branch("feature/auth_module.v2"),
            Some("feature-auth-module".to_string())
        );
    }

    #[test]
    fn non_ascii_collapses_to_hyphen() {
        let channel = derive_from_branch("featuré/aüth").unwrap();
        assert!(channel.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'));
    }

    #[test]
    fn empty_result_falls_back_to_none() {
        assert_eq!(derive_from_branch("___"), None);
        assert_eq!(derive_from_branch(""), None);
    }

    #[test]
    fn resolve_prefers_explicit_then_default_then_general() {
        assert_eq!(resolve(Some("feature-x"), "general"), "feature-x");
        assert_eq!(resolve(None, "team-default"), "team-default");
        assert_eq!(resolve(None, ""), "general");
        assert_eq!(resolve(Some(""), ""), "general");
    }
}
