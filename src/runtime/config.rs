//! Bridge configuration.
//!
//! This module defines how a bridge schedules interpreter work (threaded or
//! cooperative) and the knobs each model exposes.

use crate::runtime::error::BridgeError;
use serde::Deserialize;
use std::time::Duration;

/// Default interval between settle polls in the cooperative model.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// How interpreter work is scheduled relative to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingModel {
    /// A dedicated interpreter-owner thread blocks on condition variables.
    #[default]
    Threaded,
    /// Everything runs on the host thread; waits poll and yield to the host.
    Cooperative,
}

/// Configuration for a single bridge instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Scheduling model (default: threaded)
    pub model: SchedulingModel,

    /// Poll interval for cooperative settle waits, in milliseconds
    #[serde(rename = "poll_interval_ms", with = "duration_millis")]
    pub poll_interval: Duration,

    /// Name given to the interpreter-owner worker thread
    pub worker_thread_name: String,

    /// Name given to the host thread spawned by [`crate::HostHandle`]
    pub host_thread_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            model: SchedulingModel::Threaded,
            poll_interval: DEFAULT_POLL_INTERVAL,
            worker_thread_name: "promise-bridge-worker".to_string(),
            host_thread_name: "promise-bridge-host".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Create a new configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a cooperative configuration.
    pub fn cooperative() -> Self {
        Self::default().with_model(SchedulingModel::Cooperative)
    }

    pub fn with_model(mut self, model: SchedulingModel) -> Self {
        self.model = model;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_worker_thread_name(mut self, name: impl Into<String>) -> Self {
        self.worker_thread_name = name.into();
        self
    }

    pub fn with_host_thread_name(mut self, name: impl Into<String>) -> Self {
        self.host_thread_name = name.into();
        self
    }

    /// Parse a configuration from JSON; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, BridgeError> {
        let config: BridgeConfig =
            serde_json::from_str(text).map_err(|err| BridgeError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.poll_interval.is_zero() {
            return Err(BridgeError::Config(
                "poll_interval must be greater than zero".to_string(),
            ));
        }
        if self.worker_thread_name.trim().is_empty() {
            return Err(BridgeError::Config(
                "worker_thread_name cannot be empty".to_string(),
            ));
        }
        if self.host_thread_name.trim().is_empty() {
            return Err(BridgeError::Config(
                "host_thread_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
