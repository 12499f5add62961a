//! Ticket tracker abstraction
//!
//! The repair loop only ever reads ticket snapshots, posts comments and
//! moves status. Everything else about the tracker stays behind this trait.

pub mod jira;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;

/// Workflow status, as far as the agent cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TicketStatus {
    New,
    ToDo,
    Reopened,
    InProgress,
    Done,
    Resolved,
    Other(String),
}

impl TicketStatus {
    /// Map a tracker status name (case-insensitive, Korean workflow names
    /// included) to a status.
    pub fn from_name(name: &str) -> Self {
        let lower = name.trim().to_lowercase();
        match lower.as_str() {
            "new" | "open" | "backlog" | "신규" => TicketStatus::New,
            "to do" | "todo" | "to-do" | "할 일" => TicketStatus::ToDo,
            "reopened" | "다시 열림" => TicketStatus::Reopened,
            "in progress" | "진행 중" => TicketStatus::InProgress,
            "done" | "closed" | "완료" => TicketStatus::Done,
            "resolved" | "해결됨" => TicketStatus::Resolved,
            _ => TicketStatus::Other(name.trim().to_string()),
        }
    }

    /// A known ticket in this status asks to be processed again.
    pub fn is_reopen(&self) -> bool {
        matches!(self, TicketStatus::ToDo | TicketStatus::Reopened)
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TicketStatus::Done | TicketStatus::Resolved)
    }
}

impl fmt::Display for TicketStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TicketStatus::New => write!(f, "New"),
            TicketStatus::ToDo => write!(f, "To Do"),
            TicketStatus::Reopened => write!(f, "Reopened"),
            TicketStatus::InProgress => write!(f, "In Progress"),
            TicketStatus::Done => write!(f, "Done"),
            TicketStatus::Resolved => write!(f, "Resolved"),
            TicketStatus::Other(name) => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub author: String,
    pub body: String,
    pub created: DateTime<Utc>,
    /// Posted by this agent (or another bot); never fed back to the model.
    pub automated: bool,
}

/// Read-only snapshot of one ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub id: String,
    pub created: DateTime<Utc>,
    pub status: TicketStatus,
    pub title: String,
    pub description: String,
    /// Human comments in posting order. Empty until fetched.
    pub comments: Vec<Comment>,
}

impl Ticket {
    /// Attach comments, dropping automated ones and keeping posting order.
    pub fn with_comments(mut self, comments: Vec<Comment>) -> Self {
        let mut human: Vec<Comment> = comments.into_iter().filter(|c| !c.automated).collect();
        human.sort_by_key(|c| c.created);
        self.comments = human;
        self
    }

    /// Title, description and human comments as one block of text.
    pub fn instruction_text(&self) -> String {
        let mut text = format!("Title: {}\n\nDescription:\n{}\n", self.title, self.description);
        if !self.comments.is_empty() {
            text.push_str("\nComments:\n");
            for comment in &self.comments {
                text.push_str(&format!("- {}: {}\n", comment.author, comment.body.trim()));
            }
        }
        text
    }
}

/// Narrow tracker interface used by the poller and the repair loop.
#[async_trait]
pub trait TicketTracker: Send + Sync {
    /// Tickets created at or after `since`, oldest first.
    async fn list_tickets_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Ticket>>;

    /// All comments on a ticket, with automated ones flagged.
    async fn get_comments(&self, ticket_id: &str) -> anyhow::Result<Vec<Comment>>;

    async fn post_comment(&self, ticket_id: &str, body: &str) -> anyhow::Result<()>;

    /// Move the ticket to `target`. Returns false when the workflow offers no
    /// matching transition.
    async fn transition(&self, ticket_id: &str, target: &TicketStatus) -> anyhow::Result<bool>;
}
