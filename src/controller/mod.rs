//! Plan → execute → review loop for a single ticket
//!
//! ```text
//! Discovering ─▶ Generating ─▶ Validating ─▶ Applying ─▶ Reviewing
//!      │              ▲                                      │
//!      ▼              └──────────── critique ◀───────────────┤
//!    Fatal                                                   ▼
//!                                               Approved / Exhausted
//! ```
//!
//! The attempt counter and the last critique bound the loop: a repeated
//! critique or a spent budget ends it as `Exhausted`. Files are only written
//! after their new content validated, and every terminal outcome posts
//! exactly one report comment.


use crate::backup::BackupWriter;
use crate::config::AgentConfig;
use crate::diff::{diff_for_path, DiffStats};
use crate::discovery::{CandidateDiscovery, FileTree};
use crate::llm::prompts::{
    patch_user_prompt, review_user_prompt, rewrite_user_prompt, FilePrompt, PATCH_SYSTEM,
    REVIEW_SYSTEM, REWRITE_SYSTEM,
};
use crate::llm::review::{parse_review, ReviewVerdict};
use crate::llm::CompletionModel;
use crate::patch::{apply_completion, Applied, RequestMode};
use crate::paths::{PathResolver, Resolution};
use crate::report::{render_report, FileChange};
use crate::shutdown::Shutdown;
use crate::tracker::{Ticket, TicketStatus, TicketTracker};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Discovering,
    Generating,
    Validating,
    Applying,
    Reviewing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustReason {
    AttemptBudget,
    /// The reviewer repeated its previous critique word for word.
    CycleDetected,
    Shutdown,
    /// The budget ran out without any file ever changing.
    NoApplicableChanges,
}

impl fmt::Display for ExhaustReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExhaustReason::AttemptBudget => write!(f, "the retry budget is exhausted"),
            ExhaustReason::CycleDetected => write!(f, "the reviewer repeated the same critique"),
            ExhaustReason::Shutdown => write!(f, "the agent is shutting down"),
            ExhaustReason::NoApplicableChanges => {
                write!(f, "no applicable changes could be produced")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FatalReason {
    NoResolvableTargets { rejected: Vec<String> },
    Discovery(String),
    Model(String),
    Tracker(String),
}

impl fmt::Display for FatalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FatalReason::NoResolvableTargets { .. } => write!(f, "no resolvable target files"),
            FatalReason::Discovery(msg) => write!(f, "file discovery failed: {}", msg),
            FatalReason::Model(msg) => write!(f, "language model request failed: {}", msg),
            FatalReason::Tracker(msg) => write!(f, "ticket tracker request failed: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopOutcome {
    Approved,
    Exhausted {
        reason: ExhaustReason,
        pending_critique: Option<String>,
    },
    Fatal(FatalReason),
}

impl LoopOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            LoopOutcome::Approved => "approved",
            LoopOutcome::Exhausted { .. } => "exhausted",
            LoopOutcome::Fatal(_) => "fatal",
        }
    }
}

/// Pre-loop and current content of one target file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChangeRecord {
    pub path: PathBuf,
    /// Path relative to the safe root.
    pub label: String,
    /// Captured once, before any modification.
    pub original: String,
    pub current: String,
    pub backup: Option<PathBuf>,
    pub is_new: bool,
}

impl FileChangeRecord {
    pub fn is_modified(&self) -> bool {
        self.original != self.current
    }

    fn to_change(&self) -> FileChange {
        FileChange {
            label: self.label.clone(),
            diff: diff_for_path(&self.label, &self.original, &self.current),
            stats: DiffStats::between(&self.original, &self.current),
            backup: self.backup.clone(),
            is_new: self.is_new,
        }
    }
}

/// Mutable state of one ticket's loop.
#[derive(Debug, Clone)]
pub struct LoopState {
    pub phase: Phase,
    /// Ticket text followed by every critique received so far.
    pub instruction: String,
    /// Critiques accepted so far; bounded by the configured maximum.
    pub attempts: u32,
    pub last_critique: Option<String>,
    pub files: BTreeMap<PathBuf, FileChangeRecord>,
    /// Generation rounds started.
    pub generations: u32,
    /// Per-file problems worth mentioning in the report.
    pub notes: Vec<String>,
}

impl LoopState {
    pub fn new(instruction: String) -> Self {
        Self {
            phase: Phase::Discovering,
            instruction,
            attempts: 0,
            last_critique: None,
            files: BTreeMap::new(),
            generations: 0,
            notes: Vec::new(),
        }
    }

    fn enter(&mut self, ticket_id: &str, phase: Phase) {
        debug!(ticket = %ticket_id, from = ?self.phase, to = ?phase, "phase transition");
        self.phase = phase;
    }

    /// Fold a critique into the state. Returns the terminal outcome when the
    /// loop must stop, or `None` to generate again.
    pub fn record_critique(&mut self, critique: String, max_attempts: u32) -> Option<LoopOutcome> {
        if self.last_critique.as_deref() == Some(critique.as_str()) {
            return Some(LoopOutcome::Exhausted {
                reason: ExhaustReason::CycleDetected,
                pending_critique: Some(critique),
            });
        }

        self.attempts += 1;
        self.instruction.push_str(&format!(
            "\n\nREVIEW FEEDBACK (attempt {}):\n{}\n",
            self.attempts, critique
        ));
        self.last_critique = Some(critique);

        if self.attempts < max_attempts {
            return None;
        }
        let reason = if self.files.values().any(FileChangeRecord::is_modified) {
            ExhaustReason::AttemptBudget
        } else {
            ExhaustReason::NoApplicableChanges
        };
        Some(LoopOutcome::Exhausted {
            reason,
            pending_critique: self.last_critique.clone(),
        })
    }

    pub fn changes(&self) -> Vec<FileChange> {
        self.files
            .values()
            .filter(|r| r.is_modified())
            .map(FileChangeRecord::to_change)
            .collect()
    }
}

/// What happened to one ticket.
#[derive(Debug, Clone)]
pub struct TicketRun {
    pub ticket_id: String,
    pub outcome: LoopOutcome,
    pub attempts: u32,
    pub changes: Vec<FileChange>,
    pub report: String,
    /// Status the ticket was left in, as far as the agent's own transitions
    /// tell.
    pub status: TicketStatus,
}

pub struct ReviewLoopController {
    tracker: Arc<dyn TicketTracker>,
    model: Arc<dyn CompletionModel>,
    discovery: Arc<dyn CandidateDiscovery>,
    resolver: PathResolver,
    config: AgentConfig,
    shutdown: Shutdown,
}

impl ReviewLoopController {
    pub fn new(
        config: AgentConfig,
        tracker: Arc<dyn TicketTracker>,
        model: Arc<dyn CompletionModel>,
        discovery: Arc<dyn CandidateDiscovery>,
        shutdown: Shutdown,
    ) -> anyhow::Result<Self> {
        let resolver = PathResolver::new(&config.safe_root)?;
        Ok(Self {
            tracker,
            model,
            discovery,
            resolver,
            config,
            shutdown,
        })
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Run the loop for `ticket` to a terminal outcome, then post the report
    /// and, when approved, close the ticket.
    pub async fn run(&self, ticket: &Ticket) -> TicketRun {
        info!(ticket = %ticket.id, title = %ticket.title, "processing ticket");
        let mut state = LoopState::new(String::new());
        let mut status = ticket.status.clone();
        let outcome = self.drive(ticket, &mut state, &mut status).await;
        self.finalize(ticket, state, outcome, status).await
    }

    async fn drive(
        &self,
        ticket: &Ticket,
        state: &mut LoopState,
        status: &mut TicketStatus,
    ) -> LoopOutcome {
        let (ticket, tree) = match self.discover(ticket, state).await {
            Ok(found) => found,
            Err(reason) => return LoopOutcome::Fatal(reason),
        };

        if !self.config.dry_run {
            match self
                .tracker
                .transition(&ticket.id, &TicketStatus::InProgress)
                .await
            {
                Ok(true) => *status = TicketStatus::InProgress,
                Ok(false) => warn!(ticket = %ticket.id, "no in-progress transition available"),
                Err(err) => {
                    return LoopOutcome::Fatal(FatalReason::Tracker(format!("{:#}", err)));
                }
            }
        }

        // One writer per loop: backups hold the content from before this loop.
        let mut writer = BackupWriter::new(self.resolver.clone(), self.config.dry_run);
        let codebase = tree.listing();

        loop {
            if self.shutdown.is_triggered() {
                return self.shutdown_outcome(state);
            }
            state.enter(&ticket.id, Phase::Generating);
            state.generations += 1;
            info!(
                ticket = %ticket.id,
                attempt = state.generations,
                max = self.config.max_attempts,
                "generating fixes"
            );

            let mut changed = 0;
            let mut failures = Vec::new();
            let paths: Vec<PathBuf> = state.files.keys().cloned().collect();
            for path in paths {
                if self.shutdown.is_triggered() {
                    return self.shutdown_outcome(state);
                }
                match self.fix_file(&ticket, state, &path, &codebase, &mut writer).await {
                    Ok(FileStep::Changed) => changed += 1,
                    Ok(FileStep::Unchanged) => {}
                    Ok(FileStep::Failed(reason)) => failures.push(reason),
                    Err(reason) => return LoopOutcome::Fatal(reason),
                }
            }

            if self.shutdown.is_triggered() {
                return self.shutdown_outcome(state);
            }

            let critique = if changed == 0 {
                // Nothing to review: feed the failures back as the critique.
                let detail = if failures.is_empty() {
                    "the generated content was identical to the current files".to_string()
                } else {
                    failures.join("; ")
                };
                format!("No applicable changes were produced: {}", detail)
            } else if !self.config.self_review {
                return LoopOutcome::Approved;
            } else {
                state.enter(&ticket.id, Phase::Reviewing);
                match self.review(&ticket, state).await {
                    Ok(ReviewVerdict::Approved) => {
                        info!(ticket = %ticket.id, "reviewer approved the changes");
                        return LoopOutcome::Approved;
                    }
                    Ok(ReviewVerdict::Critique(text)) => text,
                    Err(reason) => return LoopOutcome::Fatal(reason),
                }
            };

            info!(ticket = %ticket.id, critique = %critique, "change needs another attempt");
            if let Some(outcome) = state.record_critique(critique, self.config.max_attempts) {
                return outcome;
            }
        }
    }

    fn shutdown_outcome(&self, state: &LoopState) -> LoopOutcome {
        info!("shutdown requested, stopping the current ticket");
        LoopOutcome::Exhausted {
            reason: ExhaustReason::Shutdown,
            pending_critique: state.last_critique.clone(),
        }
    }

    /// Gather instruction text and resolve candidate files into records.
    async fn discover(
        &self,
        ticket: &Ticket,
        state: &mut LoopState,
    ) -> Result<(Ticket, FileTree), FatalReason> {
        state.enter(&ticket.id, Phase::Discovering);
        let comments = self
            .tracker
            .get_comments(&ticket.id)
            .await
            .map_err(|e| FatalReason::Tracker(format!("{:#}", e)))?;
        let ticket = ticket.clone().with_comments(comments);
        state.instruction = ticket.instruction_text();

        let tree = FileTree::capture(self.resolver.root());
        let candidates = self
            .discovery
            .discover(&ticket, &tree)
            .await
            .map_err(|e| FatalReason::Discovery(format!("{:#}", e)))?;
        debug!(ticket = %ticket.id, ?candidates, "candidate files");

        let mut rejected = Vec::new();
        for candidate in candidates {
            let resolution = match self.resolver.resolve(&candidate) {
                Ok(resolution) => resolution,
                Err(err) => {
                    warn!(ticket = %ticket.id, "{}", err);
                    rejected.push(candidate);
                    continue;
                }
            };
            if let Some(record) = self.load_record(&candidate, &resolution, state) {
                state.files.entry(record.path.clone()).or_insert(record);
            }
        }

        if state.files.is_empty() {
            warn!(ticket = %ticket.id, "no resolvable target files");
            return Err(FatalReason::NoResolvableTargets { rejected });
        }
        info!(
            ticket = %ticket.id,
            files = ?state.files.values().map(|r| r.label.as_str()).collect::<Vec<_>>(),
            "target files resolved"
        );
        Ok((ticket, tree))
    }

    fn load_record(
        &self,
        candidate: &str,
        resolution: &Resolution,
        state: &mut LoopState,
    ) -> Option<FileChangeRecord> {
        let path = resolution.path();
        let label = relative_label(self.resolver.root(), path);
        let original = match resolution {
            Resolution::NewFile(_) => String::new(),
            Resolution::Existing(_) => match fs::read_to_string(path) {
                Ok(content) => content,
                Err(err) => {
                    warn!(path = %path.display(), "Skipping unreadable file: {}", err);
                    state.notes.push(format!("Skipped {}: {}", label, err));
                    return None;
                }
            },
        };
        if original.chars().count() > self.config.max_file_chars {
            warn!(path = %path.display(), "Skipping file over the size limit");
            state.notes.push(format!(
                "Skipped {}: larger than {} characters",
                label, self.config.max_file_chars
            ));
            return None;
        }
        debug!(candidate, label = %label, new = resolution.is_new(), "resolved candidate");
        Some(FileChangeRecord {
            path: path.to_path_buf(),
            label,
            current: original.clone(),
            original,
            backup: None,
            is_new: resolution.is_new(),
        })
    }

    /// Generate, validate and write one file. Model errors are fatal for the
    /// ticket; everything else only fails this file for this attempt.
    async fn fix_file(
        &self,
        ticket: &Ticket,
        state: &mut LoopState,
        path: &Path,
        codebase: &str,
        writer: &mut BackupWriter,
    ) -> Result<FileStep, FatalReason> {
        let Some(record) = state.files.get(path) else {
            return Ok(FileStep::Unchanged);
        };
        let label = record.label.clone();
        let current = record.current.clone();
        let instruction = state.instruction.clone();
        let prompt = FilePrompt {
            label: &label,
            content: &current,
            is_new: current.is_empty(),
            instruction: &instruction,
            codebase,
        };

        let completion = self
            .model
            .complete(PATCH_SYSTEM, &patch_user_prompt(&prompt))
            .await
            .map_err(|e| FatalReason::Model(format!("{:#}", e)))?;

        state.enter(&ticket.id, Phase::Validating);
        let applied = match apply_completion(path, &current, &completion, RequestMode::Patch) {
            Ok(applied) => applied,
            Err(err) if err.wants_rewrite() => {
                warn!(path = %path.display(), "{}; requesting a full rewrite", err);
                let completion = self
                    .model
                    .complete(REWRITE_SYSTEM, &rewrite_user_prompt(&prompt, &err.to_string()))
                    .await
                    .map_err(|e| FatalReason::Model(format!("{:#}", e)))?;
                match apply_completion(path, &current, &completion, RequestMode::Rewrite) {
                    Ok(applied) => applied,
                    Err(err) => {
                        warn!(path = %path.display(), "rewrite rejected: {}", err);
                        return Ok(FileStep::Failed(format!("{}: {}", label, err)));
                    }
                }
            }
            Err(err) => return Ok(FileStep::Failed(format!("{}: {}", label, err))),
        };

        self.write(ticket, state, path, applied, writer)
    }

    fn write(
        &self,
        ticket: &Ticket,
        state: &mut LoopState,
        path: &Path,
        applied: Applied,
        writer: &mut BackupWriter,
    ) -> Result<FileStep, FatalReason> {
        let Some(record) = state.files.get(path) else {
            return Ok(FileStep::Unchanged);
        };
        if applied.content == record.current {
            debug!(path = %path.display(), "generated content identical, nothing to write");
            return Ok(FileStep::Unchanged);
        }

        state.enter(&ticket.id, Phase::Applying);
        match writer.snapshot_and_write(path, &applied.content) {
            Ok(outcome) => {
                if let Some(record) = state.files.get_mut(path) {
                    record.current = outcome.content;
                    if record.backup.is_none() {
                        record.backup = outcome.backup;
                    }
                    info!(
                        ticket = %ticket.id,
                        path = %record.label,
                        mode = ?applied.mode,
                        dry_run = outcome.dry_run,
                        "applied change"
                    );
                }
                Ok(FileStep::Changed)
            }
            Err(err) => {
                error!(path = %path.display(), "{}", err);
                let note = format!("{}: {}", relative_label(self.resolver.root(), path), err);
                state.notes.push(note.clone());
                Ok(FileStep::Failed(note))
            }
        }
    }

    async fn review(
        &self,
        ticket: &Ticket,
        state: &LoopState,
    ) -> Result<ReviewVerdict, FatalReason> {
        let files: Vec<(String, String, String)> = state
            .files
            .values()
            .filter(|r| r.is_modified())
            .map(|r| {
                (
                    r.label.clone(),
                    diff_for_path(&r.label, &r.original, &r.current),
                    r.current.clone(),
                )
            })
            .collect();
        // The reviewer judges against the ticket itself, not the critique trail.
        let reply = self
            .model
            .complete(REVIEW_SYSTEM, &review_user_prompt(&ticket.instruction_text(), &files))
            .await
            .map_err(|e| FatalReason::Model(format!("{:#}", e)))?;
        Ok(parse_review(&reply))
    }

    async fn finalize(
        &self,
        ticket: &Ticket,
        state: LoopState,
        outcome: LoopOutcome,
        mut status: TicketStatus,
    ) -> TicketRun {
        let changes = match outcome {
            LoopOutcome::Fatal(_) => Vec::new(),
            _ => state.changes(),
        };
        let report = render_report(
            &outcome,
            &changes,
            &state.notes,
            state.generations,
            self.config.dry_run,
        );
        info!(
            ticket = %ticket.id,
            outcome = outcome.label(),
            files = changes.len(),
            attempts = state.generations,
            "ticket finished"
        );

        if self.config.dry_run {
            info!(ticket = %ticket.id, "dry run, report not posted:\n{}", report);
        } else {
            if let Err(err) = self.tracker.post_comment(&ticket.id, &report).await {
                error!(ticket = %ticket.id, "Failed to post report: {:#}", err);
            }
            if outcome == LoopOutcome::Approved {
                match self.tracker.transition(&ticket.id, &TicketStatus::Done).await {
                    Ok(true) => status = TicketStatus::Done,
                    Ok(false) => warn!(ticket = %ticket.id, "ticket left open: no done transition"),
                    Err(err) => error!(ticket = %ticket.id, "Failed to close ticket: {:#}", err),
                }
            }
        }

        TicketRun {
            ticket_id: ticket.id.clone(),
            outcome,
            attempts: state.generations,
            changes,
            report,
            status,
        }
    }
}

enum FileStep {
    Changed,
    Unchanged,
    Failed(String),
}

fn relative_label(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .to_string_lossy()
        .replace('\\', "/")
}
