use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default cadence for workflow status polling.
pub const WORKFLOW_INTERVAL_MS: u64 = 3000;
/// Bounds for the agent status stream cadence.
pub const AGENT_INTERVAL_MIN_MS: u64 = 2000;
pub const AGENT_INTERVAL_MAX_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Write engine events to `~/.wfsync/logs/<session>/events.jsonl`.
    #[serde(default)]
    pub event_log: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            api_token: None,
            request_timeout_ms: default_request_timeout_ms(),
            sync: SyncConfig::default(),
            event_log: false,
        }
    }
}

fn default_api_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

/// Polling cadence for the sync engines.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    #[serde(default = "default_workflow_interval_ms")]
    pub workflow_interval_ms: u64,
    /// Clamped to `AGENT_INTERVAL_MIN_MS..=AGENT_INTERVAL_MAX_MS` when used.
    #[serde(default = "default_agent_interval_ms")]
    pub agent_interval_ms: u64,
    /// A fetch outstanding for longer than `stall_factor` intervals is reported
    /// as stalled. Zero disables the detector.
    #[serde(default = "default_stall_factor")]
    pub stall_factor: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            workflow_interval_ms: default_workflow_interval_ms(),
            agent_interval_ms: default_agent_interval_ms(),
            stall_factor: default_stall_factor(),
        }
    }
}

fn default_workflow_interval_ms() -> u64 {
    WORKFLOW_INTERVAL_MS
}

fn default_agent_interval_ms() -> u64 {
    3000
}

fn default_stall_factor() -> u32 {
    3
}

impl SyncConfig {
    pub fn workflow_interval(&self) -> Duration {
        Duration::from_millis(self.workflow_interval_ms.max(1))
    }

    pub fn agent_interval(&self) -> Duration {
        Duration::from_millis(
            self.agent_interval_ms
                .clamp(AGENT_INTERVAL_MIN_MS, AGENT_INTERVAL_MAX_MS),
        )
    }

    /// Stall threshold for a given interval, or `None` when disabled.
    pub fn stall_after(&self, interval: Duration) -> Option<Duration> {
        if self.stall_factor == 0 {
            None
        } else {
            Some(interval.saturating_mul(self.stall_factor))
        }
    }
}

impl ClientConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `path` if given, else `~/.wfsync/config.yaml` if it exists, else
    /// defaults. Environment overrides are applied last.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => match crate::wfsync_paths::config_path() {
                Ok(default_path) if default_path.exists() => Self::load(&default_path)?,
                _ => Self::default(),
            },
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Applies `WFSYNC_API_URL` and `WFSYNC_API_TOKEN`.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("WFSYNC_API_URL") {
            if !url.trim().is_empty() {
                self.api_url = url.trim().to_string();
            }
        }
        if let Ok(token) = std::env::var("WFSYNC_API_TOKEN") {
            if !token.is_empty() {
                self.api_token = Some(token);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.api_url.trim().is_empty() {
            anyhow::bail!("api_url must not be empty");
        }
        if self.sync.workflow_interval_ms == 0 {
            anyhow::bail!("sync.workflow_interval_ms must be greater than zero");
        }
        if self.request_timeout_ms == 0 {
            anyhow::bail!("request_timeout_ms must be greater than zero");
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
