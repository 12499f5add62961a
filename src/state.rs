//! Persistent record of processed tickets
//!
//! Stores the monitoring start time and the set of ticket ids whose repair
//! loop has finished, so a restart neither reprocesses old tickets nor forgets
//! where it started. Every mutation is written through immediately.
//!
//! # Error Handling
//!
//! Unlike a cache, this file is load-bearing: a corrupt or unwritable state
//! file is returned as an error and is expected to stop the agent.

use anyhow::Context;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::tracker::TicketStatus;
use crate::util::write_atomic;

pub const DEFAULT_STATE_FILE: &str = ".ticketfix_state.json";

/// One processed ticket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct KnownIssue {
    processed_at: DateTime<Utc>,
    /// Tracker status name last seen for the ticket.
    status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct PersistedState {
    start_time: DateTime<Utc>,
    #[serde(default)]
    known_issues: BTreeMap<String, KnownIssue>,
}

/// Held for the lifetime of the store so two agents cannot share a state file.
struct StateLock {
    file: File,
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub struct TicketStateStore {
    path: PathBuf,
    state: PersistedState,
    _lock: StateLock,
}

impl TicketStateStore {
    /// Load the state at `path`, or start fresh (monitoring from now) when the
    /// file does not exist yet.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create state directory {}", parent.display()))?;
        }
        let lock = acquire_lock(path)?;

        let state = match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str::<PersistedState>(&content).with_context(|| {
                format!(
                    "State file {} is corrupt; fix or remove it before restarting",
                    path.display()
                )
            })?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let fresh = PersistedState {
                    start_time: Utc::now(),
                    known_issues: BTreeMap::new(),
                };
                info!(path = %path.display(), "no state file yet, monitoring from now");
                fresh
            }
            Err(err) => {
                return Err(err).with_context(|| format!("Failed to read {}", path.display()))
            }
        };

        let store = Self {
            path: path.to_path_buf(),
            state,
            _lock: lock,
        };
        store.save()?;
        debug!(
            known = store.state.known_issues.len(),
            start = %store.state.start_time,
            "ticket state loaded"
        );
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Tickets created before this instant are never considered.
    pub fn start_time(&self) -> DateTime<Utc> {
        self.state.start_time
    }

    pub fn contains(&self, ticket_id: &str) -> bool {
        self.state.known_issues.contains_key(ticket_id)
    }

    pub fn len(&self) -> usize {
        self.state.known_issues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.known_issues.is_empty()
    }

    /// Last status recorded for a known ticket.
    pub fn status_of(&self, ticket_id: &str) -> Option<TicketStatus> {
        self.state
            .known_issues
            .get(ticket_id)
            .map(|issue| TicketStatus::from_name(&issue.status))
    }

    /// Mark a ticket as processed, remembering the status it was left in,
    /// and persist.
    pub fn insert(&mut self, ticket_id: &str, status: &TicketStatus) -> anyhow::Result<()> {
        self.state.known_issues.insert(
            ticket_id.to_string(),
            KnownIssue {
                processed_at: Utc::now(),
                status: status.to_string(),
            },
        );
        self.save()
    }

    /// Record the status a known ticket is currently in. Returns whether
    /// anything changed; unknown tickets are ignored.
    pub fn observe(&mut self, ticket_id: &str, status: &TicketStatus) -> anyhow::Result<bool> {
        let name = status.to_string();
        match self.state.known_issues.get_mut(ticket_id) {
            Some(issue) if issue.status != name => {
                issue.status = name;
                self.save()?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Forget a ticket so it can be reprocessed. Idempotent; returns whether
    /// the ticket was known.
    pub fn remove(&mut self, ticket_id: &str) -> anyhow::Result<bool> {
        let removed = self.state.known_issues.remove(ticket_id).is_some();
        if removed {
            self.save()?;
        }
        Ok(removed)
    }

    fn save(&self) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(&self.state)?;
        write_atomic(&self.path, content.as_bytes())
            .with_context(|| format!("Failed to write state file {}", self.path.display()))
    }
}

fn acquire_lock(path: &Path) -> anyhow::Result<StateLock> {
    let mut lock_name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    lock_name.push(".lock");
    let lock_path = path.with_file_name(lock_name);

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;

    FileExt::try_lock_exclusive(&file).map_err(|_| {
        anyhow::anyhow!(
            "State file {} is in use by another ticketfix process",
            path.display()
        )
    })?;
    Ok(StateLock { file })
}
