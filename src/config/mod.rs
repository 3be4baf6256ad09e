use crate::{CoreError, Result};
use dotenvy::dotenv;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Configuration surface. Every field has a default; only
/// `store_url` has no sane default and must be provided.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub store_url: String,
    pub agent_id: String,
    pub agent_type: String,
    pub heartbeat_interval: Duration,
    pub task_timeout: Duration,
    pub dedup_ttl: Duration,
    pub starvation_threshold: Duration,
    pub max_attempts: u32,
    pub priority_rules_path: Option<String>,
}

impl Config {
    /// Loads configuration from the environment (optionally via a `.env`
    /// file), validating required fields the way every boot-time
    /// configuration loader in this codebase does.
    pub fn load() -> Result<Self> {
        match dotenv() {
            Ok(path) => tracing::info!("loaded .env file from: {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {}", e),
        }

        let store_url = env::var("STORE_URL").map_err(|_| {
            CoreError::Configuration("STORE_URL environment variable is required".to_string())
        })?;
        if store_url.trim().is_empty() {
            return Err(CoreError::Configuration(
                "STORE_URL cannot be empty".to_string(),
            ));
        }

        let agent_id = env::var("AGENT_ID").map_err(|_| {
            CoreError::Configuration("AGENT_ID environment variable is required".to_string())
        })?;

        let agent_type = env::var("AGENT_TYPE").map_err(|_| {
            CoreError::Configuration("AGENT_TYPE environment variable is required".to_string())
        })?;

        let heartbeat_interval = Duration::from_millis(parse_env_u64(
            "HEARTBEAT_INTERVAL_MS",
            crate::constants::HEARTBEAT_INTERVAL_SECS * 1000,
        ));
        if heartbeat_interval.is_zero() {
            return Err(CoreError::Configuration(
                "HEARTBEAT_INTERVAL_MS must be at least 1".to_string(),
            ));
        }

        let task_timeout = Duration::from_millis(parse_env_u64("TASK_TIMEOUT_MS", 5 * 60 * 1000));

        let dedup_ttl = Duration::from_secs(parse_env_u64(
            "DEDUP_TTL_SEC",
            crate::constants::DEDUP_TTL_SECS,
        ));

        let starvation_threshold = Duration::from_millis(parse_env_u64(
            "STARVATION_THRESHOLD_MS",
            crate::constants::STARVATION_THRESHOLD_SECS * 1000,
        ));

        let max_attempts =
            parse_env_u64("MAX_ATTEMPTS", crate::constants::DEFAULT_MAX_ATTEMPTS as u64) as u32;
        if max_attempts == 0 {
            return Err(CoreError::Configuration(
                "MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        let priority_rules_path = env::var("PRIORITY_RULES_PATH").ok();

        Ok(Config {
            store_url,
            agent_id,
            agent_type,
            heartbeat_interval,
            task_timeout,
            dedup_ttl,
            starvation_threshold,
            max_attempts,
            priority_rules_path,
        })
    }

    /// Lock TTL derived from the task timeout plus a fixed margin.
    pub fn lock_ttl(&self) -> Duration {
        self.task_timeout + Duration::from_secs(crate::constants::LOCK_TTL_MARGIN_SECS)
    }

    /// An agent is `unreachable` after this many missed heartbeats
    /// (fixed at `3 × heartbeat_interval`). Returned as `chrono::Duration`
    /// since its only consumer, `registry::is_unreachable`, compares it
    /// against a `chrono::DateTime` difference.
    pub fn unreachable_threshold(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.heartbeat_interval * crate::constants::MISSED_HEARTBEATS_THRESHOLD)
            .unwrap_or(chrono::Duration::MAX)
    }
}

fn parse_env_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Maps a task's `(task_type, file_prefix, prompt_keyword)` to a priority.
/// Loaded once at boot; reloadable on SIGHUP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriorityRules {
    pub rules: Vec<PriorityRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriorityRule {
    pub task_type: Option<String>,
    pub file_prefix: Option<String>,
    pub keyword: Option<String>,
    pub priority: crate::models::Priority,
}

impl PriorityRules {
    pub fn load_from_path(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Configuration(format!("reading {path}: {e}")))?;
        serde_json::from_str(&content).map_err(CoreError::from)
    }

    /// Returns the first matching rule's priority, or `None` if nothing
    /// matches (the caller falls back to `Priority::Normal`).
    pub fn resolve(&self, payload: &crate::models::TaskPayload) -> Option<crate::models::Priority> {
        self.rules.iter().find_map(|rule| {
            let type_matches = rule
                .task_type
                .as_deref()
                .map(|t| payload.task_type.as_deref() == Some(t))
                .unwrap_or(true);
            let prefix_matches = rule
                .file_prefix
                .as_deref()
                .map(|p| payload.file.starts_with(p))
                .unwrap_or(true);
            let keyword_matches = rule
                .keyword
                .as_deref()
                .map(|k| payload.prompt.to_ascii_lowercase().contains(&k.to_ascii_lowercase()))
                .unwrap_or(true);

            if type_matches && prefix_matches && keyword_matches {
                Some(rule.priority)
            } else {
                None
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TaskPayload;

    #[test]
    fn priority_rules_match_first_rule() {
        let rules = PriorityRules {
            rules: vec![
                PriorityRule {
                    task_type: Some("hotfix".to_string()),
                    file_prefix: None,
                    keyword: None,
                    priority: crate::models::Priority::Critical,
                },
                PriorityRule {
                    task_type: None,
                    file_prefix: Some("src/legacy/".to_string()),
                    keyword: None,
                    priority: crate::models::Priority::Low,
                },
            ],
        };

        let hotfix = TaskPayload {
            file: "src/legacy/x.rs".to_string(),
            prompt: "fix it".to_string(),
            task_type: Some("hotfix".to_string()),
        };
        assert_eq!(rules.resolve(&hotfix), Some(crate::models::Priority::Critical));

        let legacy = TaskPayload {
            file: "src/legacy/x.rs".to_string(),
            prompt: "tidy up".to_string(),
            task_type: Some("chore".to_string()),
        };
        assert_eq!(rules.resolve(&legacy), Some(crate::models::Priority::Low));

        let unmatched = TaskPayload {
            file: "src/main.rs".to_string(),
            prompt: "tidy up".to_string(),
            task_type: Some("chore".to_string()),
        };
        assert_eq!(rules.resolve(&unmatched), None);
    }
}
