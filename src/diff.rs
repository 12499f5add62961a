//! Unified diff rendering for change reports
//!
//! Output is deterministic for identical inputs and empty when nothing
//! changed.

use similar::{ChangeTag, TextDiff};

const CONTEXT_LINES: usize = 3;

/// Unified diff between `original` and `updated`, with generic headers.
pub fn diff(original: &str, updated: &str) -> String {
    diff_labeled("original", "updated", original, updated)
}

/// Unified diff with `a/<label>` / `b/<label>` headers.
pub fn diff_for_path(label: &str, original: &str, updated: &str) -> String {
    diff_labeled(&format!("a/{}", label), &format!("b/{}", label), original, updated)
}

pub fn diff_labeled(old_label: &str, new_label: &str, original: &str, updated: &str) -> String {
    if original == updated {
        return String::new();
    }
    TextDiff::from_lines(original, updated)
        .unified_diff()
        .context_radius(CONTEXT_LINES)
        .header(old_label, new_label)
        .to_string()
}

/// Added / removed line counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiffStats {
    pub added: usize,
    pub removed: usize,
}

impl DiffStats {
    pub fn between(original: &str, updated: &str) -> Self {
        let mut stats = DiffStats::default();
        for change in TextDiff::from_lines(original, updated).iter_all_changes() {
            match change.tag() {
                ChangeTag::Insert => stats.added += 1,
                ChangeTag::Delete => stats.removed += 1,
                ChangeTag::Equal => {}
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_content_has_empty_diff() {
        assert_eq!(diff("a\nb\n", "a\nb\n"), "");
        assert_eq!(DiffStats::between("a\n", "a\n"), DiffStats::default());
    }

    #[test]
    fn test_diff_is_stable_and_labelled() {
        let old = "def f():\n    return 1\n";
        let new = "def f():\n    return 2\n";
        let first = diff_for_path("src/f.py", old, new);
        let second = diff_for_path("src/f.py", old, new);
        assert_eq!(first, second);
        assert!(first.starts_with("--- a/src/f.py\n+++ b/src/f.py\n"));
        assert!(first.contains("-    return 1\n"));
        assert!(first.contains("+    return 2\n"));
    }

    #[test]
    fn test_stats_count_lines() {
        let stats = DiffStats::between("a\nb\nc\n", "a\nB\nc\nd\n");
        assert_eq!(stats, DiffStats { added: 2, removed: 1 });
    }
}
