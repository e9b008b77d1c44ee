use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::relay::RELAY_PORT;
use crate::store::{self, FRESHNESS_THRESHOLD, GRACE_PERIOD};

pub const SESSION_KEY_ENV: &str = "CLAUDE_SESSION_KEY";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub port: u16,
    /// Defaults to `~/.claude-usage-data.json`.
    pub data_file: Option<PathBuf>,
    pub grace_secs: u64,
    pub freshness_secs: u64,
    pub poll_interval_secs: u64,
    /// claude.ai `sessionKey` cookie used by the poller.
    pub session_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: RELAY_PORT,
            data_file: None,
            grace_secs: GRACE_PERIOD.as_secs(),
            freshness_secs: FRESHNESS_THRESHOLD.as_secs(),
            poll_interval_secs: 60,
            session_key: None,
        }
    }
}

pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("claude-usage-relay").join("config.json"))
}

impl Config {
    /// Load `path`, or the default location when `None`. A missing file yields
    /// defaults; `CLAUDE_SESSION_KEY` overrides the configured session key.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).or_else(default_config_path);
        let mut config = match path {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };

        if let Ok(key) = std::env::var(SESSION_KEY_ENV) {
            if !key.trim().is_empty() {
                config.session_key = Some(key.trim().to_string());
            }
        }
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    pub fn data_file(&self) -> Result<PathBuf> {
        match &self.data_file {
            Some(path) => Ok(path.clone()),
            None => store::default_data_path().context("Could not determine home directory"),
        }
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}
