//! Prompt text for patch generation, review and file discovery

use crate::patch::{DIVIDER_MARKER, END_MARKER, SEARCH_MARKER};
use crate::syntax::FileKind;
use std::path::Path;

pub const PATCH_SYSTEM: &str = r#"You are an expert software engineer fixing a bug reported in an issue tracker.

You are given the codebase structure, one file, and the bug report. Fix the bug in THIS file only.

Return your changes using this STRICT block format:

<<<< SEARCH
[exact lines to be replaced from the original file]
==== REPLACE
[new lines to insert]
>>>>

RULES:
- You can provide multiple blocks; they are applied in order.
- The SEARCH text must match the current file content EXACTLY, including indentation.
- The SEARCH text must be UNIQUE in the file. Include surrounding lines if needed.
- For a new (empty) file, use an empty SEARCH section and put the whole file in REPLACE.
- Make the smallest change that fixes the bug. Do not reformat unrelated code.
- Do not return the entire file. Do not wrap the blocks in markdown backticks."#;

pub const REWRITE_SYSTEM: &str = r#"You are an expert software engineer fixing a bug reported in an issue tracker.

A previous attempt to patch this file could not be applied. Rewrite the ENTIRE file with the bug fixed.

RULES:
- Return ONLY the raw file content, nothing else.
- Keep everything unrelated to the bug exactly as it is.
- The result must be syntactically valid.
- Do not use markdown backticks."#;

pub const REVIEW_SYSTEM: &str = r#"You are a skeptical senior code reviewer. A bug fix was just applied for the issue below. Decide whether the change fixes the reported bug without breaking anything else.

Respond in exactly one of these forms:

APPROVED

or

CRITIQUE: <one short paragraph describing the single most important remaining problem and how to fix it>

Do not approve changes that leave the reported bug in place. Do not nitpick style."#;

pub const DISCOVERY_SYSTEM: &str = r#"You map bug reports to source files.

Given a bug report and the list of files in a repository, return the paths of the files that most likely need to change to fix the bug.

RULES:
- Return one path per line, exactly as written in the file list.
- Return at most 5 paths, most likely first.
- If a new file is clearly required, you may return a path that is not in the list.
- Return nothing else: no numbering, no commentary, no backticks."#;

/// Everything the patch and rewrite prompts need about one file.
pub struct FilePrompt<'a> {
    /// Path relative to the safe root, as shown to the model.
    pub label: &'a str,
    pub content: &'a str,
    pub is_new: bool,
    /// Ticket text plus accumulated review critiques.
    pub instruction: &'a str,
    /// Newline-separated file listing.
    pub codebase: &'a str,
}

fn file_section(file: &FilePrompt<'_>) -> String {
    if file.is_new {
        return format!("FILE BEING FIXED: {} (new file, currently empty)\n", file.label);
    }
    let fence = FileKind::from_path(Path::new(file.label)).fence_tag();
    format!(
        "FILE BEING FIXED: {}\n```{}\n{}\n```\n",
        file.label, fence, file.content
    )
}

pub fn patch_user_prompt(file: &FilePrompt<'_>) -> String {
    format!(
        "CODEBASE STRUCTURE:\n{}\n\n{}\nBUG REPORT:\n{}\n\nReturn {} / {} / {} blocks only.",
        file.codebase,
        file_section(file),
        file.instruction,
        SEARCH_MARKER,
        DIVIDER_MARKER,
        END_MARKER
    )
}

pub fn rewrite_user_prompt(file: &FilePrompt<'_>, failure: &str) -> String {
    format!(
        "CODEBASE STRUCTURE:\n{}\n\n{}\nBUG REPORT:\n{}\n\nTHE PREVIOUS PATCH FAILED: {}\n\nReturn the complete corrected file.",
        file.codebase,
        file_section(file),
        file.instruction,
        failure
    )
}

/// `files` holds (label, diff, current content) for every modified file.
pub fn review_user_prompt(instruction: &str, files: &[(String, String, String)]) -> String {
    let mut prompt = format!("ISSUE:\n{}\n\nCHANGES:\n", instruction);
    for (label, diff, content) in files {
        let fence = FileKind::from_path(Path::new(label)).fence_tag();
        prompt.push_str(&format!(
            "\n=== {} ===\nDiff:\n```diff\n{}```\nCurrent content:\n```{}\n{}\n```\n",
            label, diff, fence, content
        ));
    }
    prompt
}

pub fn discovery_user_prompt(ticket_text: &str, listing: &str) -> String {
    format!("BUG REPORT:\n{}\n\nFILES:\n{}\n", ticket_text, listing)
}
