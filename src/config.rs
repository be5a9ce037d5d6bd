use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{DispatchError, Result};

/// Engine tuning shared by every role (worker, requeuer, janitor, server).
///
/// Loaded from an optional YAML file; anything left out takes its default.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Prefix for every key written to the shared store.
    pub namespace: String,
    /// Most jobs a single claim may gather into one batch.
    pub max_batch_size: usize,
    /// How long a failed job waits in the delay set before it's requeued.
    pub retry_delay_secs: u64,
    /// Requeuer sleep when no delayed job is due.
    pub sweep_interval_secs: u64,
    /// Pause after a store error or an unexpected failure in a loop.
    pub error_backoff_secs: u64,
    /// Longest an idle worker waits on the doorbell before re-checking the
    /// queues itself.
    pub claim_wait_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// A worker whose last heartbeat is older than this is presumed dead and
    /// its processing list is recovered by the janitor.
    pub stale_after_secs: u64,
    pub janitor_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            namespace: "batchq".to_string(),
            max_batch_size: 5,
            retry_delay_secs: 60,
            sweep_interval_secs: 5,
            error_backoff_secs: 5,
            claim_wait_secs: 5,
            heartbeat_interval_secs: 10,
            stale_after_secs: 60,
            janitor_interval_secs: 30,
        }
    }
}

impl Settings {
    /// Reads settings from a YAML file and validates them.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            DispatchError::Config(format!("reading {}: {e}", path.display()))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let settings: Settings = serde_yaml::from_str(raw)
            .map_err(|e| DispatchError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(DispatchError::Config(msg.to_string()));

        if self.namespace.is_empty() || self.namespace.contains(char::is_whitespace)
        {
            return fail("namespace must be non-empty and contain no whitespace");
        }
        if self.max_batch_size == 0 {
            return fail("max_batch_size must be at least 1");
        }
        if self.sweep_interval_secs == 0
            || self.claim_wait_secs == 0
            || self.heartbeat_interval_secs == 0
            || self.janitor_interval_secs == 0
        {
            return fail("intervals must be at least one second");
        }
        if self.stale_after_secs <= self.heartbeat_interval_secs {
            return fail("stale_after_secs must exceed heartbeat_interval_secs");
        }
        Ok(())
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_secs(self.error_backoff_secs)
    }

    pub fn claim_wait(&self) -> Duration {
        Duration::from_secs(self.claim_wait_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn janitor_interval(&self) -> Duration {
        Duration::from_secs(self.janitor_interval_secs)
    }
}
