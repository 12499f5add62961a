//! Reviewer response parsing

use crate::util::strip_markdown_fences;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewVerdict {
    Approved,
    Critique(String),
}

const APPROVED: &str = "APPROVED";
const CRITIQUE_PREFIX: &str = "CRITIQUE:";

/// Turn a reviewer reply into a verdict.
///
/// Anything that does not open with `APPROVED` is a critique; a leading
/// `CRITIQUE:` label is dropped so that repeated critiques compare equal.
pub fn parse_review(text: &str) -> ReviewVerdict {
    let cleaned = strip_markdown_fences(text).trim();
    let first_word: String = cleaned
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if first_word.eq_ignore_ascii_case(APPROVED) {
        return ReviewVerdict::Approved;
    }

    let body = match cleaned.get(..CRITIQUE_PREFIX.len()) {
        Some(head) if head.eq_ignore_ascii_case(CRITIQUE_PREFIX) => {
            cleaned[CRITIQUE_PREFIX.len()..].trim()
        }
        _ => cleaned,
    };
    if body.is_empty() {
        return ReviewVerdict::Critique("reviewer gave no verdict".to_string());
    }
    ReviewVerdict::Critique(body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_approved_variants() {
        assert_eq!(parse_review("APPROVED"), ReviewVerdict::Approved);
        assert_eq!(parse_review("  approved.\n"), ReviewVerdict::Approved);
        assert_eq!(parse_review("```\nAPPROVED\n```"), ReviewVerdict::Approved);
    }

    #[test]
    fn test_not_approved_is_a_critique() {
        assert_eq!(
            parse_review("NOT APPROVED: still crashes"),
            ReviewVerdict::Critique("NOT APPROVED: still crashes".to_string())
        );
    }

    #[test]
    fn test_critique_label_is_stripped() {
        assert_eq!(
            parse_review("CRITIQUE: missing null check"),
            parse_review("critique:   missing null check\n")
        );
        assert_eq!(
            parse_review("CRITIQUE: missing null check"),
            ReviewVerdict::Critique("missing null check".to_string())
        );
    }

    #[test]
    fn test_empty_reply_is_a_critique() {
        assert!(matches!(parse_review("   "), ReviewVerdict::Critique(_)));
    }
}
