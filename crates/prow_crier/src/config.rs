//! Crier configuration with hot reload.
//!
//! Reconcilers never hold config beyond one tick: they go through a
//! getter closure, so a reload takes effect on the next reconcile
//! without a restart.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::reporters::slack::SlackOptions;
use crate::shutdown::ShutdownSignal;

/// Transient failures are retried this many times before the key is
/// forgotten.
pub const DEFAULT_RETRY_LIMIT: u32 = 5;
/// Deadline for each external sink call.
pub const DEFAULT_REPORT_TIMEOUT: Duration = Duration::from_secs(20);

/// Settings for the code-review sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GithubOptions {
    /// Only report jobs executed by this agent, when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct CrierConfig {
    /// Transient-error retry budget per key. 0 falls back to the default
    /// of 5.
    #[serde(default)]
    pub retry_limit: u32,
    #[serde(
        default,
        with = "prow_api::duration::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub report_timeout: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slack: Option<SlackOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github: Option<GithubOptions>,
}

impl CrierConfig {
    pub fn retry_limit(&self) -> u32 {
        if self.retry_limit == 0 {
            DEFAULT_RETRY_LIMIT
        } else {
            self.retry_limit
        }
    }

    pub fn report_timeout(&self) -> Duration {
        self.report_timeout.unwrap_or(DEFAULT_REPORT_TIMEOUT)
    }
}

/// A closure yielding the current config; cheap to call every tick.
pub type ConfigGetter = Arc<dyn Fn() -> Arc<CrierConfig> + Send + Sync>;

/// Holds the live config and reloads it from disk on request.
pub struct ConfigAgent {
    path: Option<PathBuf>,
    current: Arc<RwLock<Arc<CrierConfig>>>,
}

impl ConfigAgent {
    /// Wrap a fixed config (tests, embedders).
    pub fn with_config(config: CrierConfig) -> Self {
        Self {
            path: None,
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// Load the config file once; subsequent [`ConfigAgent::reload`]
    /// calls re-read the same path.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = load_config(&path)?;
        Ok(Self {
            path: Some(path),
            current: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    pub fn config(&self) -> Arc<CrierConfig> {
        Arc::clone(&self.current.read().expect("config lock poisoned"))
    }

    pub fn getter(&self) -> ConfigGetter {
        let current = Arc::clone(&self.current);
        Arc::new(move || Arc::clone(&current.read().expect("config lock poisoned")))
    }

    pub fn reload(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let config = load_config(path)?;
        *self.current.write().expect("config lock poisoned") = Arc::new(config);
        info!(path = %path.display(), "reloaded crier config");
        Ok(())
    }

    /// Re-read the config file periodically until shutdown. A failed
    /// reload keeps the previous config.
    pub fn start_reload_thread(
        self: &Arc<Self>,
        shutdown: ShutdownSignal,
        interval: Duration,
    ) -> std::thread::JoinHandle<()> {
        let agent = Arc::clone(self);
        std::thread::spawn(move || {
            while shutdown.sleep_unless_triggered(interval) {
                if let Err(err) = agent.reload() {
                    warn!(error = %err, "config reload failed, keeping previous config");
                }
            }
        })
    }
}

fn load_config(path: &PathBuf) -> Result<CrierConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CrierConfig::default();
        assert_eq!(config.retry_limit(), 5);
        assert_eq!(config.report_timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_from_file_and_reload() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r##"{{"retry_limit": 3, "report_timeout": "5s", "slack": {{"channel": "#ci"}}}}"##
        )
        .unwrap();

        let agent = Arc::new(ConfigAgent::from_file(file.path()).unwrap());
        let getter = agent.getter();
        assert_eq!(getter().retry_limit(), 3);
        assert_eq!(getter().report_timeout(), Duration::from_secs(5));
        assert_eq!(getter().slack.as_ref().unwrap().channel, "#ci");

        // Rewrite the file; the getter sees the new value after reload.
        std::fs::write(file.path(), r#"{"retry_limit": 7}"#).unwrap();
        agent.reload().unwrap();
        assert_eq!(getter().retry_limit(), 7);
        assert!(getter().slack.is_none());
    }

    #[test]
    fn test_reload_keeps_config_on_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"retry_limit": 3}}"#).unwrap();
        let agent = ConfigAgent::from_file(file.path()).unwrap();

        std::fs::write(file.path(), "not json").unwrap();
        assert!(agent.reload().is_err());
        assert_eq!(agent.config().retry_limit(), 3);
    }
}
