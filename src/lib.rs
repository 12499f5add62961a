//! ticketfix library crate
//!
//! Watches a ticket tracker for bug reports, locates the referenced source
//! files inside a sandboxed root, and repairs them through a
//! generate/validate/apply/review loop.

pub mod agent;
pub mod backup;
pub mod config;
pub mod controller;
pub mod diff;
pub mod discovery;
pub mod error;
pub mod llm;
pub mod patch;
pub mod paths;
pub mod report;
pub mod shutdown;
pub mod state;
pub mod syntax;
pub mod tracker;
pub mod util;

#[cfg(test)]
pub mod testing;
