//! Turning model completions into new file content
//!
//! A completion is classified strictly by its delimiters, then applied to the
//! current content as search/replace pairs or taken whole as a rewrite. The
//! result must pass syntax validation before anyone may write it.

use crate::error::RepairError;
use crate::syntax::{self, Validation};
use crate::util::{strip_markdown_fences, truncate};
use std::borrow::Cow;
use std::path::Path;
use tracing::{debug, warn};

pub const SEARCH_MARKER: &str = "<<<< SEARCH";
pub const DIVIDER_MARKER: &str = "==== REPLACE";
pub const END_MARKER: &str = ">>>>";

/// One exact-match edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchReplace {
    pub search: String,
    pub replace: String,
}

impl SearchReplace {
    pub fn new(search: impl Into<String>, replace: impl Into<String>) -> Self {
        Self {
            search: search.into(),
            replace: replace.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchInstruction {
    StructuredPatch(Vec<SearchReplace>),
    FullRewrite(String),
}

/// What the model was asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    Patch,
    Rewrite,
}

/// A completion, classified by format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelOutput {
    StructuredPatch(Vec<SearchReplace>),
    FullRewrite(String),
    Unparseable(String),
}

impl ModelOutput {
    /// Unparseable output counts as a patch failure.
    pub fn into_instruction(self) -> Result<PatchInstruction, RepairError> {
        match self {
            ModelOutput::StructuredPatch(pairs) => Ok(PatchInstruction::StructuredPatch(pairs)),
            ModelOutput::FullRewrite(content) => Ok(PatchInstruction::FullRewrite(content)),
            ModelOutput::Unparseable(reason) => Err(RepairError::PatchFailure { reason }),
        }
    }
}

/// Classify a completion.
///
/// Patch requests must answer with well-formed SEARCH/REPLACE blocks. Rewrite
/// requests yield the fence-stripped text, unless the model answered with
/// well-formed blocks anyway.
pub fn parse_completion(text: &str, mode: RequestMode) -> ModelOutput {
    let cleaned = strip_markdown_fences(text);
    let blocks = parse_blocks(cleaned);

    match (mode, blocks) {
        (_, Ok(pairs)) if !pairs.is_empty() => ModelOutput::StructuredPatch(pairs),
        (RequestMode::Patch, Ok(_)) => {
            ModelOutput::Unparseable("no SEARCH/REPLACE blocks in response".to_string())
        }
        (RequestMode::Patch, Err(reason)) => ModelOutput::Unparseable(reason),
        (RequestMode::Rewrite, _) => {
            if cleaned.trim().is_empty() {
                ModelOutput::Unparseable("empty rewrite response".to_string())
            } else {
                ModelOutput::FullRewrite(cleaned.to_string())
            }
        }
    }
}

fn marker_rest<'a>(line: &'a str, ch: char) -> Option<&'a str> {
    let trimmed = line.trim_end();
    let rest = trimmed.trim_start_matches(ch);
    (trimmed.len() - rest.len() >= 4).then(|| rest.trim())
}

fn is_search_marker(line: &str) -> bool {
    marker_rest(line, '<') == Some("SEARCH")
}

fn is_divider_marker(line: &str) -> bool {
    matches!(marker_rest(line, '='), Some("REPLACE"))
}

fn is_end_marker(line: &str) -> bool {
    matches!(marker_rest(line, '>'), Some("") | Some("REPLACE"))
}

enum BlockState {
    Outside,
    Search(Vec<String>),
    Replace(Vec<String>, Vec<String>),
}

/// Parse every SEARCH/REPLACE block. Text between blocks is ignored; a
/// marker out of sequence or an unterminated block is an error.
fn parse_blocks(text: &str) -> Result<Vec<SearchReplace>, String> {
    let mut pairs = Vec::new();
    let mut state = BlockState::Outside;

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        state = match state {
            BlockState::Outside => {
                if is_search_marker(line) {
                    BlockState::Search(Vec::new())
                } else if is_divider_marker(line) || is_end_marker(line) {
                    return Err(format!("line {}: marker outside of a block", line_no));
                } else {
                    BlockState::Outside
                }
            }
            BlockState::Search(mut search) => {
                if is_divider_marker(line) {
                    BlockState::Replace(search, Vec::new())
                } else if is_search_marker(line) || is_end_marker(line) {
                    return Err(format!("line {}: expected {}", line_no, DIVIDER_MARKER));
                } else {
                    search.push(line.to_string());
                    BlockState::Search(search)
                }
            }
            BlockState::Replace(search, mut replace) => {
                if is_end_marker(line) {
                    pairs.push(SearchReplace::new(search.join("\n"), replace.join("\n")));
                    BlockState::Outside
                } else if is_search_marker(line) || is_divider_marker(line) {
                    return Err(format!("line {}: expected {}", line_no, END_MARKER));
                } else {
                    replace.push(line.to_string());
                    BlockState::Replace(search, replace)
                }
            }
        };
    }

    match state {
        BlockState::Outside => Ok(pairs),
        _ => Err("unterminated SEARCH/REPLACE block".to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    Ambiguous(usize),
    EmptySearch,
}

/// A pair that could not be applied; the rest of the patch still counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedPair {
    /// 1-based position within the patch.
    pub index: usize,
    pub reason: SkipReason,
    pub search_preview: String,
}

impl SkippedPair {
    pub fn describe(&self) -> String {
        let why = match &self.reason {
            SkipReason::NotFound => "search text not found".to_string(),
            SkipReason::Ambiguous(n) => format!("search text matches {} times", n),
            SkipReason::EmptySearch => "empty search text on non-empty file".to_string(),
        };
        format!("pair {}: {} ({:?})", self.index, why, self.search_preview)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMode {
    Structured { applied: usize, skipped: Vec<SkippedPair> },
    FullRewrite,
}

/// Validated new content, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub content: String,
    pub mode: ApplyMode,
}

/// Apply search/replace pairs in order. Each search must match exactly once
/// in the content produced by the pairs before it.
pub fn apply_pairs(content: &str, pairs: &[SearchReplace]) -> (String, usize, Vec<SkippedPair>) {
    let mut working = content.to_string();
    let mut applied = 0;
    let mut skipped = Vec::new();
    // Blocks are parsed line by line, so they arrive with bare `\n`.
    let crlf = content.contains("\r\n");

    for (i, pair) in pairs.iter().enumerate() {
        let reason = if pair.search.is_empty() {
            if working.is_empty() {
                working = pair.replace.clone();
                applied += 1;
                continue;
            }
            SkipReason::EmptySearch
        } else {
            let search = line_endings_for(&pair.search, crlf);
            match working.matches(&*search).count() {
                1 => {
                    let replace = line_endings_for(&pair.replace, crlf);
                    working = working.replacen(&*search, &replace, 1);
                    applied += 1;
                    continue;
                }
                0 => SkipReason::NotFound,
                n => SkipReason::Ambiguous(n),
            }
        };
        let skip = SkippedPair {
            index: i + 1,
            reason,
            search_preview: truncate(&pair.search, 80),
        };
        warn!("skipping patch {}", skip.describe());
        skipped.push(skip);
    }

    (working, applied, skipped)
}

fn line_endings_for(text: &str, crlf: bool) -> Cow<'_, str> {
    if crlf && text.contains('\n') {
        Cow::Owned(text.replace("\r\n", "\n").replace('\n', "\r\n"))
    } else {
        Cow::Borrowed(text)
    }
}

/// Keep the original's line endings and trailing-newline convention.
pub fn normalize_generated_content(original: &str, content: String) -> String {
    if original.is_empty() {
        return content;
    }

    let mut normalized = line_endings_for(&content, original.contains("\r\n")).into_owned();
    if original.ends_with('\n') {
        if !normalized.ends_with('\n') {
            if original.ends_with("\r\n") {
                normalized.push_str("\r\n");
            } else {
                normalized.push('\n');
            }
        }
    } else {
        while normalized.ends_with('\n') {
            let cut = if normalized.ends_with("\r\n") { 2 } else { 1 };
            normalized.truncate(normalized.len() - cut);
        }
    }
    normalized
}

/// Produce validated new content for `path` from `instruction`.
pub fn apply(
    path: &Path,
    original: &str,
    instruction: &PatchInstruction,
) -> Result<Applied, RepairError> {
    let (content, mode) = match instruction {
        PatchInstruction::StructuredPatch(pairs) => {
            let (content, applied, skipped) = apply_pairs(original, pairs);
            if applied == 0 {
                let reasons: Vec<String> = skipped.iter().map(SkippedPair::describe).collect();
                return Err(RepairError::PatchFailure {
                    reason: if reasons.is_empty() {
                        "patch contained no pairs".to_string()
                    } else {
                        reasons.join("; ")
                    },
                });
            }
            (content, ApplyMode::Structured { applied, skipped })
        }
        PatchInstruction::FullRewrite(text) => (text.clone(), ApplyMode::FullRewrite),
    };

    let content = normalize_generated_content(original, content);
    if content.trim().is_empty() && !original.trim().is_empty() {
        return Err(RepairError::PatchFailure {
            reason: "generated content is empty".to_string(),
        });
    }

    match syntax::validate(path, &content) {
        Validation::Valid => {
            debug!(path = %path.display(), ?mode, "generated content validated");
            Ok(Applied { content, mode })
        }
        Validation::Invalid(reason) => Err(RepairError::ValidationFailure {
            path: path.to_path_buf(),
            reason,
        }),
    }
}

/// Parse and apply a raw completion in one step.
pub fn apply_completion(
    path: &Path,
    original: &str,
    completion: &str,
    mode: RequestMode,
) -> Result<Applied, RepairError> {
    let instruction = parse_completion(completion, mode).into_instruction()?;
    apply(path, original, &instruction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::diff;

    const LOGIN: &str = "def login(user):\n    name = user.name\n    return name.strip()\n";

    fn block(search: &str, replace: &str) -> String {
        format!("<<<< SEARCH\n{}\n==== REPLACE\n{}\n>>>>\n", search, replace)
    }

    #[test]
    fn test_parse_structured_patch() {
        let text = format!(
            "Here is the fix:\n{}{}",
            block("a = 1", "a = 2"),
            block("b = 1\nc = 1", "b = 2")
        );
        assert_eq!(
            parse_completion(&text, RequestMode::Patch),
            ModelOutput::StructuredPatch(vec![
                SearchReplace::new("a = 1", "a = 2"),
                SearchReplace::new("b = 1\nc = 1", "b = 2"),
            ])
        );
    }

    #[test]
    fn test_parse_accepts_fenced_and_long_markers() {
        let text = "```\n<<<<<<< SEARCH\nx\n======= REPLACE\ny\n>>>>>>> REPLACE\n```";
        assert_eq!(
            parse_completion(text, RequestMode::Patch),
            ModelOutput::StructuredPatch(vec![SearchReplace::new("x", "y")])
        );
    }

    #[test]
    fn test_patch_mode_without_blocks_is_unparseable() {
        let out = parse_completion("def login(user):\n    return True\n", RequestMode::Patch);
        assert!(matches!(out, ModelOutput::Unparseable(_)));
        assert!(matches!(
            out.into_instruction(),
            Err(RepairError::PatchFailure { .. })
        ));
    }

    #[test]
    fn test_unterminated_block_is_unparseable() {
        let out = parse_completion("<<<< SEARCH\na\n==== REPLACE\nb\n", RequestMode::Patch);
        assert_eq!(
            out,
            ModelOutput::Unparseable("unterminated SEARCH/REPLACE block".to_string())
        );
        let out = parse_completion("==== REPLACE\nb\n>>>>\n", RequestMode::Patch);
        assert!(matches!(out, ModelOutput::Unparseable(_)));
    }

    #[test]
    fn test_rewrite_mode_strips_fences() {
        let out = parse_completion("```python\nx = 1\n```", RequestMode::Rewrite);
        assert_eq!(out, ModelOutput::FullRewrite("x = 1".to_string()));
        let empty = parse_completion("```\n```", RequestMode::Rewrite);
        assert!(matches!(empty, ModelOutput::Unparseable(_)));
    }

    #[test]
    fn test_single_replacement_changes_only_that_span() {
        let pairs = vec![SearchReplace::new(
            "    name = user.name",
            "    name = user.name if user else \"\"",
        )];
        let applied = apply(
            Path::new("login.py"),
            LOGIN,
            &PatchInstruction::StructuredPatch(pairs),
        )
        .unwrap();

        let d = diff(LOGIN, &applied.content);
        let removed: Vec<&str> = d
            .lines()
            .filter(|l| l.starts_with('-') && !l.starts_with("---"))
            .collect();
        let added: Vec<&str> = d
            .lines()
            .filter(|l| l.starts_with('+') && !l.starts_with("+++"))
            .collect();
        assert_eq!(removed, vec!["-    name = user.name"]);
        assert_eq!(added, vec!["+    name = user.name if user else \"\""]);
        assert_eq!(
            applied.mode,
            ApplyMode::Structured {
                applied: 1,
                skipped: vec![]
            }
        );
    }

    #[test]
    fn test_pairs_apply_in_order_against_previous_result() {
        let pairs = vec![SearchReplace::new("a", "b"), SearchReplace::new("bb", "c")];
        let (out, applied, skipped) = apply_pairs("ab", &pairs);
        assert_eq!(out, "c");
        assert_eq!(applied, 2);
        assert!(skipped.is_empty());
    }

    #[test]
    fn test_bad_pairs_are_skipped_not_fatal() {
        let content = "x = 1\nx = 1\ny = 2\n";
        let pairs = vec![
            SearchReplace::new("x = 1", "x = 3"),
            SearchReplace::new("z = 9", "z = 0"),
            SearchReplace::new("y = 2", "y = 5"),
        ];
        let applied = apply(
            Path::new("m.py"),
            content,
            &PatchInstruction::StructuredPatch(pairs),
        )
        .unwrap();
        assert_eq!(applied.content, "x = 1\nx = 1\ny = 5\n");
        match applied.mode {
            ApplyMode::Structured { applied, skipped } => {
                assert_eq!(applied, 1);
                assert_eq!(skipped.len(), 2);
                assert_eq!(skipped[0].reason, SkipReason::Ambiguous(2));
                assert_eq!(skipped[1].reason, SkipReason::NotFound);
            }
            other => panic!("unexpected mode {:?}", other),
        }
    }

    #[test]
    fn test_absent_search_text_is_a_recoverable_patch_failure() {
        let completion = block("    return user.nickname", "    return user.alias");
        let err = apply_completion(Path::new("login.py"), LOGIN, &completion, RequestMode::Patch)
            .unwrap_err();
        assert!(matches!(err, RepairError::PatchFailure { .. }));
        assert!(err.wants_rewrite());
    }

    #[test]
    fn test_invalid_result_is_a_validation_failure() {
        let completion = block("def login(user):", "def login(user:");
        let err = apply_completion(Path::new("login.py"), LOGIN, &completion, RequestMode::Patch)
            .unwrap_err();
        assert!(matches!(err, RepairError::ValidationFailure { .. }));
    }

    #[test]
    fn test_full_rewrite_keeps_trailing_newline() {
        let applied = apply(
            Path::new("login.py"),
            LOGIN,
            &PatchInstruction::FullRewrite("def login(user):\n    return bool(user)".into()),
        )
        .unwrap();
        assert_eq!(applied.content, "def login(user):\n    return bool(user)\n");
        assert_eq!(applied.mode, ApplyMode::FullRewrite);
    }

    #[test]
    fn test_crlf_file_is_patched_and_keeps_crlf() {
        let content = LOGIN.replace('\n', "\r\n");
        let completion = block(
            "    name = user.name\n    return name.strip()",
            "    name = user.name or \"\"\n    return name.strip()",
        );
        let applied =
            apply_completion(Path::new("login.py"), &content, &completion, RequestMode::Patch)
                .unwrap();
        assert_eq!(
            applied.content,
            "def login(user):\r\n    name = user.name or \"\"\r\n    return name.strip()\r\n"
        );
    }

    #[test]
    fn test_rewrite_of_crlf_file_keeps_crlf() {
        let content = LOGIN.replace('\n', "\r\n");
        let applied = apply(
            Path::new("login.py"),
            &content,
            &PatchInstruction::FullRewrite("def login(user):\n    return bool(user)".into()),
        )
        .unwrap();
        assert_eq!(applied.content, "def login(user):\r\n    return bool(user)\r\n");
    }

    #[test]
    fn test_empty_search_creates_new_file_content() {
        let pairs = vec![SearchReplace::new("", "VERSION = \"1.0\"\n")];
        let applied = apply(
            Path::new("version.py"),
            "",
            &PatchInstruction::StructuredPatch(pairs),
        )
        .unwrap();
        assert_eq!(applied.content, "VERSION = \"1.0\"\n");
    }

    #[test]
    fn test_empty_rewrite_of_real_file_is_rejected() {
        let err = apply(
            Path::new("notes.txt"),
            "keep me\n",
            &PatchInstruction::FullRewrite("\n".into()),
        )
        .unwrap_err();
        assert!(matches!(err, RepairError::PatchFailure { .. }));
    }
}
