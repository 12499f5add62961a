//! Configuration for the agent
//!
//! Runtime behavior comes from the command line ([`AgentConfig`]). Credentials
//! come from an optional TOML file at `~/.config/ticketfix/config.toml`,
//! overridden by environment variables.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::llm::client::DEFAULT_MODEL;
use crate::state::DEFAULT_STATE_FILE;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_INTERVAL_SECS: u64 = 10;
/// Files longer than this are never sent to the model.
pub const MAX_FILE_CHARS: usize = 60_000;

/// Everything the poller and the repair loop need to know.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub safe_root: PathBuf,
    pub dry_run: bool,
    pub self_review: bool,
    pub interval: Duration,
    /// Generation attempts per ticket, at least 1.
    pub max_attempts: u32,
    pub state_file: PathBuf,
    pub max_file_chars: usize,
}

impl AgentConfig {
    pub fn new(safe_root: impl Into<PathBuf>) -> Self {
        Self {
            safe_root: safe_root.into(),
            dry_run: false,
            self_review: false,
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            state_file: PathBuf::from(DEFAULT_STATE_FILE),
            max_file_chars: MAX_FILE_CHARS,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JiraSettings {
    pub server: Option<String>,
    pub email: Option<String>,
    pub api_token: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlmSettings {
    pub api_key: Option<String>,
    pub model: Option<String>,
    /// Chat completions endpoint; OpenRouter when unset.
    pub base_url: Option<String>,
}

/// Contents of the config file, after environment overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub jira: JiraSettings,
    #[serde(default)]
    pub llm: LlmSettings,
}

/// Fully resolved credentials; every required value present.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub jira_server: String,
    pub jira_email: String,
    pub jira_token: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub llm_base_url: Option<String>,
}

impl Settings {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ticketfix").join("config.toml"))
    }

    /// Load the file at `explicit` (which must exist), or the default location
    /// if present, then apply environment overrides.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let mut settings = match explicit {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.is_file() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };
        settings.apply_env(|key| std::env::var(key).ok());
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Environment variables win over the file. Empty values are ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("JIRA_SERVER") {
            self.jira.server = Some(v);
        }
        if let Some(v) = get("JIRA_EMAIL") {
            self.jira.email = Some(v);
        }
        if let Some(v) = get("JIRA_API_TOKEN") {
            self.jira.api_token = Some(v);
        }
        if let Some(v) = get("OPENROUTER_API_KEY").or_else(|| get("LLM_API_KEY")) {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("LLM_MODEL") {
            self.llm.model = Some(v);
        }
        if let Some(v) = get("LLM_BASE_URL") {
            self.llm.base_url = Some(v);
        }
    }

    /// Resolve credentials, naming every missing value at once.
    pub fn credentials(&self) -> anyhow::Result<Credentials> {
        let mut missing = Vec::new();
        let mut require = |value: &Option<String>, name: &'static str| match value {
            Some(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ => {
                missing.push(name);
                String::new()
            }
        };

        let jira_server = require(&self.jira.server, "JIRA_SERVER");
        let jira_email = require(&self.jira.email, "JIRA_EMAIL");
        let jira_token = require(&self.jira.api_token, "JIRA_API_TOKEN");
        let llm_api_key = require(&self.llm.api_key, "OPENROUTER_API_KEY");

        if !missing.is_empty() {
            return Err(anyhow::anyhow!(
                "Missing configuration: {}. Set them in the environment or in {}",
                missing.join(", "),
                Self::default_path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "the config file".to_string())
            ));
        }

        Ok(Credentials {
            jira_server,
            jira_email,
            jira_token,
            llm_api_key,
            llm_model: self
                .llm
                .model
                .clone()
                .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            llm_base_url: self.llm.base_url.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_agent_config_defaults() {
        let config = AgentConfig::new("/repo");
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.interval, Duration::from_secs(10));
        assert!(!config.dry_run);
        assert!(!config.self_review);
        assert_eq!(config.max_file_chars, 60_000);
    }

    #[test]
    fn test_settings_from_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[jira]\nserver = \"https://acme.atlassian.net\"\nemail = \"bot@acme.io\"\n\n[llm]\nmodel = \"openai/gpt-4o\"\n",
        )
        .unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.jira.server.as_deref(), Some("https://acme.atlassian.net"));
        assert_eq!(settings.llm.model.as_deref(), Some("openai/gpt-4o"));
        assert!(settings.jira.api_token.is_none());
    }

    #[test]
    fn test_invalid_or_missing_explicit_file_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(Settings::load(Some(&dir.path().join("nope.toml"))).is_err());
        let bad = dir.path().join("bad.toml");
        fs::write(&bad, "[jira\n").unwrap();
        assert!(Settings::from_file(&bad).is_err());
    }

    #[test]
    fn test_env_overrides_file_and_alias() {
        let mut settings = Settings {
            jira: JiraSettings {
                server: Some("https://file".into()),
                email: Some("file@x".into()),
                api_token: Some("file-token".into()),
            },
            llm: LlmSettings::default(),
        };
        settings.apply_env(env(&[
            ("JIRA_SERVER", "https://env"),
            ("JIRA_EMAIL", "  "),
            ("LLM_API_KEY", "alias-key"),
        ]));
        assert_eq!(settings.jira.server.as_deref(), Some("https://env"));
        assert_eq!(settings.jira.email.as_deref(), Some("file@x"));
        assert_eq!(settings.llm.api_key.as_deref(), Some("alias-key"));

        settings.apply_env(env(&[("OPENROUTER_API_KEY", "primary")]));
        assert_eq!(settings.llm.api_key.as_deref(), Some("primary"));

        let creds = settings.credentials().unwrap();
        assert_eq!(creds.llm_model, DEFAULT_MODEL);
        assert_eq!(creds.jira_token, "file-token");
    }

    #[test]
    fn test_missing_credentials_are_reported_together() {
        let mut settings = Settings::default();
        settings.apply_env(env(&[("JIRA_SERVER", "https://env")]));
        let err = settings.credentials().unwrap_err().to_string();
        assert!(err.contains("JIRA_EMAIL"));
        assert!(err.contains("JIRA_API_TOKEN"));
        assert!(err.contains("OPENROUTER_API_KEY"));
        assert!(!err.contains("JIRA_SERVER"));
    }
}
