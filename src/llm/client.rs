//! OpenRouter-compatible chat completions client

use super::CompletionModel;
use crate::util::truncate;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

/// OpenRouter chat completions endpoint
pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "google/gemini-2.5-flash";
const DEFAULT_MAX_TOKENS: u32 = 16384;
const REQUEST_TIMEOUT_SECS: u64 = 180;

/// Retry configuration for rate limits, server errors and transport failures
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000;
const BACKOFF_MULTIPLIER: u64 = 2;

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message<'a>>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: MessageContent,
}

#[derive(Deserialize)]
struct MessageContent {
    #[serde(default)]
    content: Option<String>,
}

/// Extract a retry-after hint (seconds) from an error body, if present.
fn parse_retry_after(text: &str) -> Option<u64> {
    let text_lower = text.to_lowercase();
    let pos = text_lower.find("retry")?;
    text_lower[pos..]
        .split_whitespace()
        .skip(1)
        .take(5)
        .filter_map(|word| {
            word.trim_matches(|c: char| !c.is_numeric())
                .parse::<u64>()
                .ok()
        })
        .find(|secs| *secs > 0 && *secs < 300)
}

fn backoff_secs(retry: u32) -> u64 {
    (INITIAL_BACKOFF_MS * BACKOFF_MULTIPLIER.pow(retry.saturating_sub(1))) / 1000
}

fn is_retryable(status: u16) -> bool {
    status == 429 || (500..=599).contains(&status)
}

fn error_message(status: reqwest::StatusCode, body: &str, retries: u32) -> String {
    match status.as_u16() {
        401 => "Invalid API key. Check OPENROUTER_API_KEY.".to_string(),
        429 => format!("Rate limited by the model provider after {} retries", retries),
        500..=599 => format!(
            "Model provider server error ({}) after {} retries",
            status, retries
        ),
        _ => format!("API error {}: {}", status, truncate(body, 200)),
    }
}

pub struct OpenRouterClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl OpenRouterClient {
    pub fn new(api_key: &str, model: &str, url: Option<&str>) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            url: url.unwrap_or(OPENROUTER_URL).to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl CompletionModel for OpenRouterClient {
    async fn complete(&self, system: &str, user: &str) -> anyhow::Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: system,
                },
                Message {
                    role: "user",
                    content: user,
                },
            ],
            max_tokens: self.max_tokens,
            stream: false,
        };

        let mut retry_count = 0;
        loop {
            let sent = self
                .http
                .post(&self.url)
                .header("Content-Type", "application/json")
                .header("X-Title", "ticketfix")
                .bearer_auth(&self.api_key)
                .json(&request)
                .send()
                .await;

            let response = match sent {
                Ok(response) => response,
                Err(err) if retry_count < MAX_RETRIES => {
                    retry_count += 1;
                    let wait = backoff_secs(retry_count);
                    warn!(
                        "Model request failed ({}). Retrying in {}s (attempt {}/{})",
                        err, wait, retry_count, MAX_RETRIES
                    );
                    tokio::time::sleep(Duration::from_secs(wait)).await;
                    continue;
                }
                Err(err) => {
                    return Err(err).context(format!(
                        "Model request failed after {} retries",
                        retry_count
                    ))
                }
            };

            let status = response.status();
            let text = response
                .text()
                .await
                .context("Failed to read model response")?;

            if status.is_success() {
                let parsed: ChatResponse = serde_json::from_str(&text).with_context(|| {
                    format!("Failed to parse model response: {}", truncate(&text, 200))
                })?;
                let content = parsed
                    .choices
                    .into_iter()
                    .next()
                    .and_then(|c| c.message.content)
                    .unwrap_or_default();
                if content.trim().is_empty() {
                    return Err(anyhow::anyhow!("Model returned an empty completion"));
                }
                debug!(model = %self.model, chars = content.len(), "completion received");
                return Ok(content);
            }

            if is_retryable(status.as_u16()) && retry_count < MAX_RETRIES {
                retry_count += 1;
                let wait = parse_retry_after(&text).unwrap_or_else(|| backoff_secs(retry_count));
                warn!(
                    "Model provider returned {}. Retrying in {}s (attempt {}/{})",
                    status, wait, retry_count, MAX_RETRIES
                );
                tokio::time::sleep(Duration::from_secs(wait)).await;
                continue;
            }

            return Err(anyhow::anyhow!("{}", error_message(status, &text, retry_count)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("Please retry after 12 seconds"), Some(12));
        assert_eq!(parse_retry_after("retry in 999 seconds"), None);
        assert_eq!(parse_retry_after("slow down"), None);
    }

    #[test]
    fn test_backoff_doubles() {
        assert_eq!(backoff_secs(1), 2);
        assert_eq!(backoff_secs(2), 4);
        assert_eq!(backoff_secs(3), 8);
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(429));
        assert!(is_retryable(503));
        assert!(!is_retryable(401));
        assert!(!is_retryable(400));
    }

    #[test]
    fn test_error_messages() {
        let msg = error_message(reqwest::StatusCode::UNAUTHORIZED, "", 0);
        assert!(msg.contains("Invalid API key"));
        let msg = error_message(reqwest::StatusCode::BAD_REQUEST, "bad model id", 0);
        assert_eq!(msg, "API error 400 Bad Request: bad model id");
    }

    #[test]
    fn test_response_without_content_is_empty() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }

    #[test]
    fn test_client_defaults_to_openrouter() {
        let client = OpenRouterClient::new("k", DEFAULT_MODEL, None).unwrap();
        assert_eq!(client.url, OPENROUTER_URL);
        assert_eq!(client.model(), DEFAULT_MODEL);
    }
}
