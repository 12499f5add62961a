//! Polling loop
//!
//! Lists tickets created since the monitoring start time, decides which of
//! them need a repair loop, and records finished tickets in the state store.
//! Tickets are processed one at a time, oldest first.
//!
//! A known ticket runs again only when it moves into To Do or Reopened from
//! some other status. Tickets whose loop was cut short by shutdown stay
//! unknown, so the next start picks them up.

use crate::config::AgentConfig;
use crate::controller::{ExhaustReason, LoopOutcome, ReviewLoopController, TicketRun};
use crate::discovery::CandidateDiscovery;
use crate::llm::CompletionModel;
use crate::shutdown::Shutdown;
use crate::state::TicketStateStore;
use crate::tracker::{Ticket, TicketTracker};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// What one poll did.
#[derive(Debug, Default)]
pub struct PollSummary {
    pub listed: usize,
    pub runs: Vec<TicketRun>,
    pub skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Process,
    /// Known ticket that came back; forget it first.
    Reprocess,
    Skip,
}

pub struct Agent {
    tracker: Arc<dyn TicketTracker>,
    controller: ReviewLoopController,
    store: TicketStateStore,
    interval: Duration,
    shutdown: Shutdown,
}

impl Agent {
    /// Build the controller and load (or create) the state file. A corrupt
    /// or locked state file is an error.
    pub fn new(
        config: AgentConfig,
        tracker: Arc<dyn TicketTracker>,
        model: Arc<dyn CompletionModel>,
        discovery: Arc<dyn CandidateDiscovery>,
        shutdown: Shutdown,
    ) -> anyhow::Result<Self> {
        let store = TicketStateStore::load(&config.state_file)?;
        let interval = config.interval;
        let controller =
            ReviewLoopController::new(config, tracker.clone(), model, discovery, shutdown.clone())?;
        info!(
            root = %controller.resolver().root().display(),
            since = %store.start_time(),
            known = store.len(),
            "agent ready"
        );
        Ok(Self {
            tracker,
            controller,
            store,
            interval,
            shutdown,
        })
    }

    pub fn store(&self) -> &TicketStateStore {
        &self.store
    }

    /// Poll until shutdown. Only state-store failures end the loop early.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        info!(interval_secs = self.interval.as_secs(), "watching for tickets");
        while !self.shutdown.is_triggered() {
            self.poll_once().await?;
            if self.shutdown.sleep(self.interval).await {
                break;
            }
        }
        info!("shutdown complete");
        Ok(())
    }

    /// One pass over the tracker. Listing failures are logged and left for
    /// the next poll.
    pub async fn poll_once(&mut self) -> anyhow::Result<PollSummary> {
        let mut summary = PollSummary::default();
        let tickets = match self
            .tracker
            .list_tickets_since(self.store.start_time())
            .await
        {
            Ok(tickets) => tickets,
            Err(err) => {
                warn!("Failed to list tickets, retrying next poll: {:#}", err);
                return Ok(summary);
            }
        };
        summary.listed = tickets.len();
        debug!(count = tickets.len(), "tickets listed");

        for ticket in tickets {
            if self.shutdown.is_triggered() {
                break;
            }
            match self.decide(&ticket)? {
                Decision::Skip => {
                    summary.skipped += 1;
                    continue;
                }
                Decision::Reprocess => {
                    info!(ticket = %ticket.id, status = %ticket.status, "ticket reopened");
                    self.store.remove(&ticket.id)?;
                }
                Decision::Process => {}
            }

            let run = self.controller.run(&ticket).await;
            if interrupted(&run.outcome) {
                info!(ticket = %ticket.id, "left unrecorded, resumes after restart");
            } else {
                self.store.insert(&ticket.id, &run.status)?;
            }
            summary.runs.push(run);
        }
        Ok(summary)
    }

    fn decide(&mut self, ticket: &Ticket) -> anyhow::Result<Decision> {
        let decision = match self.store.status_of(&ticket.id) {
            Some(last) if ticket.status.is_reopen() && ticket.status != last => {
                Decision::Reprocess
            }
            Some(_) => {
                // Track moves so a later return to To Do counts as a reopen.
                if self.store.observe(&ticket.id, &ticket.status)? {
                    debug!(ticket = %ticket.id, status = %ticket.status, "known ticket moved");
                }
                Decision::Skip
            }
            None if ticket.status.is_finished() => {
                debug!(ticket = %ticket.id, status = %ticket.status, "already finished, ignoring");
                Decision::Skip
            }
            None => Decision::Process,
        };
        Ok(decision)
    }
}

fn interrupted(outcome: &LoopOutcome) -> bool {
    matches!(
        outcome,
        LoopOutcome::Exhausted {
            reason: ExhaustReason::Shutdown,
            ..
        }
    )
}
