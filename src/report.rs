//! Ticket comments summarizing a finished repair loop
//!
//! Rendered in Jira wiki markup. Every report starts with [`REPORT_MARKER`],
//! which is also how the agent recognizes its own comments.

use crate::controller::{FatalReason, LoopOutcome};
use crate::diff::DiffStats;
use std::path::PathBuf;

pub const REPORT_MARKER: &str = "[ticketfix]";

/// A file whose content differs from its pre-loop state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    /// Path relative to the safe root.
    pub label: String,
    pub diff: String,
    pub stats: DiffStats,
    pub backup: Option<PathBuf>,
    pub is_new: bool,
}

fn push_changes(out: &mut String, changes: &[FileChange]) {
    for change in changes {
        let what = if change.is_new { "Created" } else { "Changed" };
        out.push_str(&format!(
            "\n{} {{{{{}}}}} (+{} -{})",
            what, change.label, change.stats.added, change.stats.removed
        ));
        if let Some(backup) = &change.backup {
            let name = backup
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            out.push_str(&format!(", backup {{{{{}}}}}", name));
        }
        out.push_str(&format!(":\n{{code:diff}}\n{}{{code}}\n", change.diff));
    }
}

fn push_notes(out: &mut String, notes: &[String]) {
    if notes.is_empty() {
        return;
    }
    out.push_str("\nNotes:\n");
    for note in notes {
        out.push_str(&format!("* {}\n", note));
    }
}

/// The single consolidated comment for a terminal outcome.
pub fn render_report(
    outcome: &LoopOutcome,
    changes: &[FileChange],
    notes: &[String],
    attempts: u32,
    dry_run: bool,
) -> String {
    let mut out = String::new();
    match outcome {
        LoopOutcome::Approved => {
            out.push_str(&format!(
                "{} *Automated fix applied* after {} attempt{}.\n",
                REPORT_MARKER,
                attempts,
                if attempts == 1 { "" } else { "s" }
            ));
            push_changes(&mut out, changes);
        }
        LoopOutcome::Exhausted {
            reason,
            pending_critique,
        } => {
            out.push_str(&format!(
                "{} *Automated fix stopped* after {} attempt{}: {}.\n",
                REPORT_MARKER,
                attempts,
                if attempts == 1 { "" } else { "s" },
                reason
            ));
            if changes.is_empty() {
                out.push_str("\nNo modifications were applied.\n");
            } else {
                out.push_str("\nChanges so far (left in place for review):\n");
                push_changes(&mut out, changes);
            }
            if let Some(critique) = pending_critique {
                out.push_str(&format!(
                    "\nPending review critique:\n{{quote}}{}{{quote}}\n",
                    critique
                ));
            }
        }
        LoopOutcome::Fatal(reason) => {
            out.push_str(&format!(
                "{} *Automated fix failed*: {}.\n",
                REPORT_MARKER, reason
            ));
            if let FatalReason::NoResolvableTargets { rejected } = reason {
                if !rejected.is_empty() {
                    out.push_str("\nRejected references:\n");
                    for candidate in rejected {
                        out.push_str(&format!("* {{{{{}}}}}\n", candidate));
                    }
                }
            }
            out.push_str("\nThis ticket needs a human to take a look.\n");
        }
    }
    push_notes(&mut out, notes);
    if dry_run {
        out.push_str("\n_Dry run: no files were written._\n");
    }
    out
}
