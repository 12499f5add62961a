//! Language model access
//!
//! The repair loop only needs plain chat completions; prompts, the HTTP
//! client and reviewer-response parsing live in the submodules.

pub mod client;
pub mod prompts;
pub mod review;

use async_trait::async_trait;

#[async_trait]
pub trait CompletionModel: Send + Sync {
    /// One system + user exchange. Errors are returned only after the
    /// implementation's own retry policy gave up.
    async fn complete(&self, system: &str, user: &str) -> anyhow::Result<String>;
}
