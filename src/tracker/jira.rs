//! Jira Cloud / Server REST v2 client
//!
//! Basic auth with an account email and API token. Search, comments and
//! transitions are the only endpoints used.

use super::{Comment, Ticket, TicketStatus, TicketTracker};
use crate::report::REPORT_MARKER;
use crate::util::truncate;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};
use url::Url;

const API_TIMEOUT_SECS: u64 = 30;
const SEARCH_PAGE_SIZE: usize = 50;
const MAX_ERROR_BODY_LEN: usize = 200;

/// Jira renders timestamps as `2024-03-01T10:15:30.123+0900`.
const JIRA_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%z";

/// Transition names tried, in order, for each target status.
fn transition_names(target: &TicketStatus) -> Vec<String> {
    let names: &[&str] = match target {
        TicketStatus::InProgress => &["In Progress", "진행 중", "시작", "Start Progress"],
        TicketStatus::Done | TicketStatus::Resolved => {
            &["Done", "Resolved", "완료", "해결됨", "Resolve Issue", "Close Issue"]
        }
        TicketStatus::ToDo => &["To Do", "할 일"],
        TicketStatus::Reopened => &["Reopen", "Reopened", "다시 열림"],
        TicketStatus::New => &["Open", "New"],
        TicketStatus::Other(name) => return vec![name.clone()],
    };
    names.iter().map(|s| s.to_string()).collect()
}

pub struct JiraClient {
    http: reqwest::Client,
    base: Url,
    email: String,
    token: String,
    account_id: OnceCell<Option<String>>,
}

impl JiraClient {
    pub fn new(server: &str, email: &str, token: &str) -> Result<Self> {
        let mut base = Url::parse(server.trim())
            .with_context(|| format!("Invalid Jira server URL: {}", server))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(API_TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            http,
            base,
            email: email.to_string(),
            token: token.to_string(),
            account_id: OnceCell::new(),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .with_context(|| format!("Failed to build Jira URL for {}", path))
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        self.http
            .get(url)
            .basic_auth(&self.email, Some(&self.token))
            .header("Accept", "application/json")
    }

    fn post(&self, url: Url) -> reqwest::RequestBuilder {
        self.http
            .post(url)
            .basic_auth(&self.email, Some(&self.token))
            .header("Accept", "application/json")
    }

    /// Our own account id, used to flag the agent's comments. Looked up once;
    /// a failed lookup falls back to marker-only detection.
    async fn own_account_id(&self) -> Option<&str> {
        self.account_id
            .get_or_init(|| async {
                match self.fetch_myself().await {
                    Ok(me) => me.account_id.or(me.name),
                    Err(err) => {
                        warn!("Could not look up Jira account: {:#}", err);
                        None
                    }
                }
            })
            .await
            .as_deref()
    }

    async fn fetch_myself(&self) -> Result<MyselfResponse> {
        let resp = self
            .get(self.endpoint("rest/api/2/myself")?)
            .send()
            .await
            .context("Failed to reach Jira")?;
        read_json(resp, "account lookup").await
    }

    async fn search_page(&self, jql: &str, start_at: usize) -> Result<SearchResponse> {
        let mut url = self.endpoint("rest/api/2/search")?;
        url.query_pairs_mut()
            .append_pair("jql", jql)
            .append_pair("startAt", &start_at.to_string())
            .append_pair("maxResults", &SEARCH_PAGE_SIZE.to_string())
            .append_pair("fields", "summary,description,status,created");
        let resp = self.get(url).send().await.context("Failed to reach Jira")?;
        read_json(resp, "search").await
    }
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response, what: &str) -> Result<T> {
    let status = resp.status();
    if status.is_success() {
        return resp
            .json()
            .await
            .with_context(|| format!("Failed to parse Jira {} response", what));
    }
    let body = resp.text().await.unwrap_or_default();
    Err(anyhow::anyhow!(
        "Jira {} failed ({}): {}",
        what,
        status,
        error_summary(&body)
    ))
}

async fn expect_success(resp: reqwest::Response, what: &str) -> Result<()> {
    let status = resp.status();
    if status.is_success() {
        return Ok(());
    }
    let body = resp.text().await.unwrap_or_default();
    Err(anyhow::anyhow!(
        "Jira {} failed ({}): {}",
        what,
        status,
        error_summary(&body)
    ))
}

/// Prefer Jira's structured error messages over the raw body.
fn error_summary(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ApiErrorResponse>(body) {
        let mut parts = parsed.error_messages;
        parts.extend(
            parsed
                .errors
                .into_iter()
                .map(|(field, msg)| format!("{}: {}", field, msg)),
        );
        if !parts.is_empty() {
            return parts.join("; ");
        }
    }
    truncate(body.trim(), MAX_ERROR_BODY_LEN)
}

pub fn parse_jira_time(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_str(raw, JIRA_TIME_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("Unrecognized Jira timestamp: {}", raw))
}

/// JQL dates are read in the API user's timezone, which we do not know.
/// Queries start this far early and results are filtered on exact UTC times.
const JQL_TIMEZONE_MARGIN_HOURS: i64 = 24;

/// JQL for tickets created since `since`, widened by a day so any user
/// timezone is covered. Results are filtered on exact times afterwards.
pub fn created_since_jql(since: DateTime<Utc>) -> String {
    let from = since - chrono::Duration::hours(JQL_TIMEZONE_MARGIN_HOURS);
    format!(
        "created >= \"{}\" ORDER BY created ASC",
        from.format("%Y-%m-%d %H:%M")
    )
}

/// Convert a search page, keeping only tickets created at or after `since`.
fn created_since(issues: Vec<IssueResponse>, since: DateTime<Utc>) -> Vec<Ticket> {
    issues
        .into_iter()
        .filter_map(|issue| {
            let key = issue.key.clone();
            match issue.into_ticket() {
                Ok(ticket) if ticket.created >= since => Some(ticket),
                Ok(_) => None,
                Err(err) => {
                    warn!(ticket = %key, "Skipping issue: {:#}", err);
                    None
                }
            }
        })
        .collect()
}

fn is_automated(body: &str, author_id: Option<&str>, own_id: Option<&str>) -> bool {
    body.contains(REPORT_MARKER) || matches!((author_id, own_id), (Some(a), Some(b)) if a == b)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SearchResponse {
    #[serde(default)]
    start_at: usize,
    #[serde(default)]
    total: usize,
    #[serde(default)]
    issues: Vec<IssueResponse>,
}

#[derive(Debug, Deserialize)]
struct IssueResponse {
    key: String,
    fields: IssueFields,
}

#[derive(Debug, Deserialize)]
struct IssueFields {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    description: Option<String>,
    status: NamedField,
    created: String,
}

#[derive(Debug, Deserialize)]
struct NamedField {
    name: String,
}

impl IssueResponse {
    fn into_ticket(self) -> Result<Ticket> {
        Ok(Ticket {
            created: parse_jira_time(&self.fields.created)?,
            status: TicketStatus::from_name(&self.fields.status.name),
            title: self.fields.summary,
            description: self.fields.description.unwrap_or_default(),
            comments: Vec::new(),
            id: self.key,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CommentsResponse {
    #[serde(default)]
    comments: Vec<CommentResponse>,
}

#[derive(Debug, Deserialize)]
struct CommentResponse {
    #[serde(default)]
    author: Option<UserResponse>,
    #[serde(default)]
    body: String,
    created: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserResponse {
    #[serde(default)]
    account_id: Option<String>,
    /// Jira Server has no account ids, only user names.
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

type MyselfResponse = UserResponse;

#[derive(Debug, Deserialize)]
struct TransitionsResponse {
    #[serde(default)]
    transitions: Vec<TransitionResponse>,
}

#[derive(Debug, Deserialize)]
struct TransitionResponse {
    id: String,
    name: String,
    #[serde(default)]
    to: Option<NamedField>,
}

#[derive(Serialize)]
struct CommentRequest<'a> {
    body: &'a str,
}

#[derive(Serialize)]
struct TransitionRequest<'a> {
    transition: TransitionId<'a>,
}

#[derive(Serialize)]
struct TransitionId<'a> {
    id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiErrorResponse {
    #[serde(default)]
    error_messages: Vec<String>,
    #[serde(default)]
    errors: std::collections::BTreeMap<String, String>,
}

/// Pick the first available transition whose name (or destination status
/// name) matches one of `wanted`, case-insensitively.
fn pick_transition<'a>(
    available: &'a [TransitionResponse],
    wanted: &[String],
) -> Option<&'a TransitionResponse> {
    let wanted: Vec<String> = wanted.iter().map(|w| w.to_lowercase()).collect();
    available.iter().find(|t| {
        let name = t.name.to_lowercase();
        let to = t.to.as_ref().map(|s| s.name.to_lowercase());
        wanted
            .iter()
            .any(|w| *w == name || to.as_deref() == Some(w.as_str()))
    })
}

#[async_trait]
impl TicketTracker for JiraClient {
    async fn list_tickets_since(&self, since: DateTime<Utc>) -> Result<Vec<Ticket>> {
        let jql = created_since_jql(since);
        let mut tickets = Vec::new();
        let mut start_at = 0;

        loop {
            let page = self.search_page(&jql, start_at).await?;
            let fetched = page.issues.len();
            tickets.extend(created_since(page.issues, since));
            start_at = page.start_at + fetched;
            if fetched == 0 || start_at >= page.total {
                break;
            }
        }

        tickets.sort_by(|a, b| a.created.cmp(&b.created).then_with(|| a.id.cmp(&b.id)));
        debug!(count = tickets.len(), %jql, "Jira search complete");
        Ok(tickets)
    }

    async fn get_comments(&self, ticket_id: &str) -> Result<Vec<Comment>> {
        let own_id = self.own_account_id().await.map(str::to_string);
        let url = self.endpoint(&format!("rest/api/2/issue/{}/comment", ticket_id))?;
        let resp = self.get(url).send().await.context("Failed to reach Jira")?;
        let parsed: CommentsResponse = read_json(resp, "comment listing").await?;

        parsed
            .comments
            .into_iter()
            .map(|c| {
                let author_id = c
                    .author
                    .as_ref()
                    .and_then(|a| a.account_id.clone().or_else(|| a.name.clone()));
                let author = c
                    .author
                    .as_ref()
                    .and_then(|a| a.display_name.clone())
                    .or_else(|| author_id.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                Ok(Comment {
                    automated: is_automated(&c.body, author_id.as_deref(), own_id.as_deref()),
                    created: parse_jira_time(&c.created)?,
                    body: c.body,
                    author,
                })
            })
            .collect()
    }

    async fn post_comment(&self, ticket_id: &str, body: &str) -> Result<()> {
        let url = self.endpoint(&format!("rest/api/2/issue/{}/comment", ticket_id))?;
        let resp = self
            .post(url)
            .json(&CommentRequest { body })
            .send()
            .await
            .context("Failed to reach Jira")?;
        expect_success(resp, "comment").await?;
        info!(ticket = %ticket_id, "Posted comment");
        Ok(())
    }

    async fn transition(&self, ticket_id: &str, target: &TicketStatus) -> Result<bool> {
        let url = self.endpoint(&format!("rest/api/2/issue/{}/transitions", ticket_id))?;
        let resp = self
            .get(url.clone())
            .send()
            .await
            .context("Failed to reach Jira")?;
        let available: TransitionsResponse = read_json(resp, "transition listing").await?;

        let wanted = transition_names(target);
        let Some(chosen) = pick_transition(&available.transitions, &wanted) else {
            warn!(
                ticket = %ticket_id,
                "No matching transition found among: {}",
                wanted.join(", ")
            );
            return Ok(false);
        };

        let resp = self
            .post(url)
            .json(&TransitionRequest {
                transition: TransitionId { id: &chosen.id },
            })
            .send()
            .await
            .context("Failed to reach Jira")?;
        expect_success(resp, "transition").await?;
        info!(ticket = %ticket_id, transition = %chosen.name, "Transitioned ticket");
        Ok(true)
    }
}
