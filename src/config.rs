//! Coordinator configuration.

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a coordinator node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Path of the transaction log file.
    pub log_path: PathBuf,
    /// Node id stamped into every global id this node issues.
    pub node_id: u32,
    /// Timeout of transactions that do not set their own.
    pub default_timeout: Duration,
    /// How often the timeout scanner runs.
    pub timeout_scan_interval: Duration,
    /// How often the recovery engine runs.
    pub recovery_interval: Duration,
    /// Base of the exponential backoff between recovery attempts.
    pub recovery_base_delay: Duration,
    /// How often the log compactor runs.
    pub compaction_interval: Duration,
    /// Whether to sync the log to disk on every write.
    pub sync_on_write: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        CoordinatorConfig {
            log_path: PathBuf::from("xacoord.log"),
            node_id: 1,
            default_timeout: Duration::from_secs(60),
            timeout_scan_interval: Duration::from_secs(1),
            recovery_interval: Duration::from_secs(5),
            recovery_base_delay: Duration::from_secs(1),
            compaction_interval: Duration::from_secs(30),
            sync_on_write: true,
        }
    }
}

impl CoordinatorConfig {
    /// Config for a log at `log_path`, defaults otherwise.
    pub fn with_log_path(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            ..Self::default()
        }
    }

    /// Rejects settings the workers cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.log_path.as_os_str().is_empty() {
            bail!("log path must not be empty");
        }
        if self.default_timeout.is_zero() {
            bail!("default timeout must be positive");
        }
        for (name, interval) in [
            ("timeout scan interval", self.timeout_scan_interval),
            ("recovery interval", self.recovery_interval),
            ("compaction interval", self.compaction_interval),
        ] {
            if interval.is_zero() {
                bail!("{} must be positive", name);
            }
        }
        Ok(())
    }
}
