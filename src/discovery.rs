//! Candidate file discovery
//!
//! Turns a ticket into filename candidates. Candidates are raw strings; the
//! path resolver decides what they point at.

use crate::llm::prompts::{discovery_user_prompt, DISCOVERY_SYSTEM};
use crate::llm::CompletionModel;
use crate::paths::is_ignored_dir;
use crate::state::DEFAULT_STATE_FILE;
use crate::tracker::Ticket;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Listing cap so prompts stay bounded on large trees.
const MAX_TREE_FILES: usize = 2000;
const MAX_MODEL_CANDIDATES: usize = 5;

const SOURCE_EXTENSIONS: &[&str] = &[
    "py", "pyi", "js", "jsx", "mjs", "cjs", "ts", "tsx", "rs", "go", "json", "html", "css", "md",
    "toml", "yaml", "yml",
];

const IGNORED_FILES: &[&str] = &[DEFAULT_STATE_FILE, "agent.log", "ticketfix.log"];

/// Snapshot of the relevant files under the safe root, relative and sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileTree {
    files: Vec<PathBuf>,
    truncated: bool,
}

impl FileTree {
    pub fn capture(root: &Path) -> Self {
        let mut files: Vec<PathBuf> = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !e.file_type().is_dir()
                    || !is_ignored_dir(&e.file_name().to_string_lossy())
            })
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| is_relevant_file(e.path()))
            .filter_map(|e| e.path().strip_prefix(root).ok().map(Path::to_path_buf))
            .collect();
        files.sort();

        let truncated = files.len() > MAX_TREE_FILES;
        files.truncate(MAX_TREE_FILES);
        debug!(files = files.len(), truncated, "captured file tree");
        Self { files, truncated }
    }

    pub fn from_paths<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut files: Vec<PathBuf> = paths.into_iter().map(Into::into).collect();
        files.sort();
        Self {
            files,
            truncated: false,
        }
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// One path per line, `/`-separated.
    pub fn listing(&self) -> String {
        let mut out: Vec<String> = self
            .files
            .iter()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .collect();
        if self.truncated {
            out.push(format!("... (listing capped at {} files)", MAX_TREE_FILES));
        }
        out.join("\n")
    }
}

fn is_relevant_file(path: &Path) -> bool {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy())
        .unwrap_or_default();
    if IGNORED_FILES.contains(&name.as_ref()) || name.ends_with(".bak") {
        return false;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| SOURCE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[async_trait]
pub trait CandidateDiscovery: Send + Sync {
    async fn discover(&self, ticket: &Ticket, tree: &FileTree) -> anyhow::Result<Vec<String>>;
}

fn filename_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        // Leading `/` and `../` are kept so the resolver can reject them.
        let pattern = format!(r"/?[\w\-.][\w\-./]*\.(?:{})\b", SOURCE_EXTENSIONS.join("|"));
        Regex::new(&pattern).ok()
    })
    .as_ref()
}

fn list_marker_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(?:\d+[.)]|[-*])\s+").ok()).as_ref()
}

/// Filenames mentioned in `text`, in order of first appearance.
pub fn find_filenames(text: &str) -> Vec<String> {
    let Some(re) = filename_regex() else {
        return Vec::new();
    };
    let mut seen = HashSet::new();
    re.find_iter(text)
        .map(|m| m.as_str().to_string())
        .filter(|name| seen.insert(name.clone()))
        .collect()
}

/// Filenames quoted in the ticket: description first, then title, then
/// human comments. The first source that mentions any file wins.
#[derive(Debug, Default, Clone, Copy)]
pub struct RegexDiscovery;

impl RegexDiscovery {
    pub fn candidates(&self, ticket: &Ticket) -> Vec<String> {
        let found = find_filenames(&ticket.description);
        if !found.is_empty() {
            return found;
        }
        let found = find_filenames(&ticket.title);
        if !found.is_empty() {
            return found;
        }
        let comments: Vec<&str> = ticket.comments.iter().map(|c| c.body.as_str()).collect();
        find_filenames(&comments.join("\n"))
    }
}

#[async_trait]
impl CandidateDiscovery for RegexDiscovery {
    async fn discover(&self, ticket: &Ticket, _tree: &FileTree) -> anyhow::Result<Vec<String>> {
        Ok(self.candidates(ticket))
    }
}

/// Ask the model which files in the tree the ticket is about.
pub struct ModelDiscovery {
    model: Arc<dyn CompletionModel>,
}

impl ModelDiscovery {
    pub fn new(model: Arc<dyn CompletionModel>) -> Self {
        Self { model }
    }
}

/// One path per line; tolerate bullets, numbering and backticks.
pub fn parse_candidate_lines(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    text.lines()
        .map(|line| {
            let line = line.trim();
            let line = match list_marker_regex() {
                Some(re) => re.replace(line, ""),
                None => line.into(),
            };
            line.trim_matches('`').trim().to_string()
        })
        .filter(|line| !line.is_empty() && !line.starts_with("```") && !line.contains(' '))
        .filter(|line| seen.insert(line.clone()))
        .take(MAX_MODEL_CANDIDATES)
        .collect()
}

#[async_trait]
impl CandidateDiscovery for ModelDiscovery {
    async fn discover(&self, ticket: &Ticket, tree: &FileTree) -> anyhow::Result<Vec<String>> {
        if tree.is_empty() {
            return Ok(Vec::new());
        }
        let user = discovery_user_prompt(&ticket.instruction_text(), &tree.listing());
        let reply = self.model.complete(DISCOVERY_SYSTEM, &user).await?;
        Ok(parse_candidate_lines(&reply))
    }
}

/// Regex first; the model only when the ticket names no file. A model
/// failure here yields no candidates rather than an error.
pub struct LayeredDiscovery {
    regex: RegexDiscovery,
    model: Option<ModelDiscovery>,
}

impl LayeredDiscovery {
    pub fn new(model: Option<Arc<dyn CompletionModel>>) -> Self {
        Self {
            regex: RegexDiscovery,
            model: model.map(ModelDiscovery::new),
        }
    }
}

#[async_trait]
impl CandidateDiscovery for LayeredDiscovery {
    async fn discover(&self, ticket: &Ticket, tree: &FileTree) -> anyhow::Result<Vec<String>> {
        let found = self.regex.candidates(ticket);
        if !found.is_empty() {
            debug!(ticket = %ticket.id, ?found, "filenames found in ticket text");
            return Ok(found);
        }
        let Some(model) = &self.model else {
            return Ok(Vec::new());
        };
        match model.discover(ticket, tree).await {
            Ok(found) => {
                debug!(ticket = %ticket.id, ?found, "filenames inferred by model");
                Ok(found)
            }
            Err(err) => {
                warn!(ticket = %ticket.id, "File inference failed: {:#}", err);
                Ok(Vec::new())
            }
        }
    }
}
