//! In-memory tracker and scripted model for tests

use crate::llm::CompletionModel;
use crate::tracker::{Comment, Ticket, TicketStatus, TicketTracker};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

pub fn ticket(id: &str, title: &str, description: &str) -> Ticket {
    ticket_at(id, title, description, Utc::now())
}

pub fn ticket_at(id: &str, title: &str, description: &str, created: DateTime<Utc>) -> Ticket {
    Ticket {
        id: id.to_string(),
        created,
        status: TicketStatus::New,
        title: title.to_string(),
        description: description.to_string(),
        comments: Vec::new(),
    }
}

/// Replies in order; records every prompt it was given.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, String>>>,
    prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Result<String, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    /// (system, user) pairs in call order.
    pub fn prompts(&self) -> Vec<(String, String)> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionModel for ScriptedModel {
    async fn complete(&self, system: &str, user: &str) -> anyhow::Result<String> {
        self.prompts
            .lock()
            .unwrap()
            .push((system.to_string(), user.to_string()));
        match self.replies.lock().unwrap().pop_front() {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(err)) => Err(anyhow::anyhow!(err)),
            None => Err(anyhow::anyhow!("scripted model ran out of replies")),
        }
    }
}

#[derive(Default)]
struct TrackerState {
    tickets: Vec<Ticket>,
    comments: HashMap<String, Vec<Comment>>,
    posted: Vec<(String, String)>,
    transitions: Vec<(String, TicketStatus)>,
    listings: usize,
    fail_listing: bool,
}

/// Tracker that keeps everything in memory and applies transitions to its
/// own tickets.
#[derive(Default)]
pub struct FakeTracker {
    state: Mutex<TrackerState>,
}

impl FakeTracker {
    pub fn new(tickets: Vec<Ticket>) -> Self {
        let tracker = Self::default();
        tracker.state.lock().unwrap().tickets = tickets;
        tracker
    }

    pub fn add_ticket(&self, ticket: Ticket) {
        self.state.lock().unwrap().tickets.push(ticket);
    }

    pub fn add_comment(&self, ticket_id: &str, comment: Comment) {
        self.state
            .lock()
            .unwrap()
            .comments
            .entry(ticket_id.to_string())
            .or_default()
            .push(comment);
    }

    pub fn set_status(&self, ticket_id: &str, status: TicketStatus) {
        let mut state = self.state.lock().unwrap();
        if let Some(t) = state.tickets.iter_mut().find(|t| t.id == ticket_id) {
            t.status = status;
        }
    }

    pub fn status_of(&self, ticket_id: &str) -> Option<TicketStatus> {
        let state = self.state.lock().unwrap();
        state
            .tickets
            .iter()
            .find(|t| t.id == ticket_id)
            .map(|t| t.status.clone())
    }

    pub fn set_fail_listing(&self, fail: bool) {
        self.state.lock().unwrap().fail_listing = fail;
    }

    pub fn posted(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().posted.clone()
    }

    pub fn posted_for(&self, ticket_id: &str) -> Vec<String> {
        self.posted()
            .into_iter()
            .filter(|(id, _)| id == ticket_id)
            .map(|(_, body)| body)
            .collect()
    }

    pub fn transitions(&self) -> Vec<(String, TicketStatus)> {
        self.state.lock().unwrap().transitions.clone()
    }

    pub fn listings(&self) -> usize {
        self.state.lock().unwrap().listings
    }
}

#[async_trait]
impl TicketTracker for FakeTracker {
    async fn list_tickets_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<Ticket>> {
        let mut state = self.state.lock().unwrap();
        state.listings += 1;
        if state.fail_listing {
            return Err(anyhow::anyhow!("tracker unavailable"));
        }
        let mut found: Vec<Ticket> = state
            .tickets
            .iter()
            .filter(|t| t.created >= since)
            .cloned()
            .collect();
        found.sort_by_key(|t| t.created);
        Ok(found)
    }

    async fn get_comments(&self, ticket_id: &str) -> anyhow::Result<Vec<Comment>> {
        let state = self.state.lock().unwrap();
        Ok(state.comments.get(ticket_id).cloned().unwrap_or_default())
    }

    async fn post_comment(&self, ticket_id: &str, body: &str) -> anyhow::Result<()> {
        self.state
            .lock()
            .unwrap()
            .posted
            .push((ticket_id.to_string(), body.to_string()));
        Ok(())
    }

    async fn transition(&self, ticket_id: &str, target: &TicketStatus) -> anyhow::Result<bool> {
        let mut state = self.state.lock().unwrap();
        state
            .transitions
            .push((ticket_id.to_string(), target.clone()));
        if let Some(t) = state.tickets.iter_mut().find(|t| t.id == ticket_id) {
            t.status = target.clone();
        }
        Ok(true)
    }
}
