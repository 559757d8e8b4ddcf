//! Configuration for the controller and reconciler.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the [`Controller`](crate::Controller).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Interval between reconcile ticks in seconds
    #[serde(default = "default_tick_interval")]
    pub tick_interval_secs: u64,
    /// Reconciler tuning
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
}

fn default_tick_interval() -> u64 {
    5
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval(),
            reconciler: ReconcilerConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?
            .try_deserialize()
    }

    /// Get the tick interval as a Duration.
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }
}

/// Tuning for the [`Reconciler`](crate::Reconciler).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Pending reconcile ticks tolerated without confirmation before the
    /// machine is marked failed
    #[serde(default = "default_max_pending_attempts")]
    pub max_pending_attempts: u32,
    /// Timeout for a single adapter status query in seconds
    #[serde(default = "default_query_timeout")]
    pub query_timeout_secs: u64,
}

fn default_max_pending_attempts() -> u32 {
    5
}

fn default_query_timeout() -> u64 {
    10
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_pending_attempts: default_max_pending_attempts(),
            query_timeout_secs: default_query_timeout(),
        }
    }
}

impl ReconcilerConfig {
    /// Get the query timeout as a Duration.
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}
