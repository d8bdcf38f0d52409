//! Timeouts and retry settings shared by all resource families.
//!
//! Host binaries flatten [`ReconcileConfig`] into their own clap `Args`;
//! the same struct deserializes from a config file section with every
//! field optional.

use std::time::Duration;

use clap::Args;
use serde::{Deserialize, Serialize};

use crate::retry::RetryConfig;

const DEFAULT_CREATE_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_UPDATE_TIMEOUT_SECS: u64 = 3600;
const DEFAULT_DELETE_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_INITIAL_DELAY_SECS: u64 = 10;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 10;
const DEFAULT_MUTATION_ATTEMPTS: u32 = 5;

/// Reconciliation timing.
#[derive(Args, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Seconds to wait for a created object to become ready
    #[arg(long, default_value_t = DEFAULT_CREATE_TIMEOUT_SECS)]
    pub create_timeout: u64,

    /// Seconds to wait for each phase of an update to settle
    #[arg(long, default_value_t = DEFAULT_UPDATE_TIMEOUT_SECS)]
    pub update_timeout: u64,

    /// Seconds to wait for a deleted object to disappear
    #[arg(long, default_value_t = DEFAULT_DELETE_TIMEOUT_SECS)]
    pub delete_timeout: u64,

    /// Seconds to wait after a mutation before the first poll
    #[arg(long, default_value_t = DEFAULT_INITIAL_DELAY_SECS)]
    pub initial_delay: u64,

    /// Seconds between polls
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    pub poll_interval: u64,

    /// Attempts for mutations hitting transient errors (1 = no retry)
    #[arg(long, default_value_t = DEFAULT_MUTATION_ATTEMPTS)]
    pub mutation_attempts: u32,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            create_timeout: DEFAULT_CREATE_TIMEOUT_SECS,
            update_timeout: DEFAULT_UPDATE_TIMEOUT_SECS,
            delete_timeout: DEFAULT_DELETE_TIMEOUT_SECS,
            initial_delay: DEFAULT_INITIAL_DELAY_SECS,
            poll_interval: DEFAULT_POLL_INTERVAL_SECS,
            mutation_attempts: DEFAULT_MUTATION_ATTEMPTS,
        }
    }
}

impl ReconcileConfig {
    pub fn create_timeout(&self) -> Duration {
        Duration::from_secs(self.create_timeout)
    }

    pub fn update_timeout(&self) -> Duration {
        Duration::from_secs(self.update_timeout)
    }

    pub fn delete_timeout(&self) -> Duration {
        Duration::from_secs(self.delete_timeout)
    }

    pub fn initial_delay(&self) -> Duration {
        Duration::from_secs(self.initial_delay)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }

    /// Backoff for retried mutations, starting at the poll interval.
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.mutation_attempts.max(1),
            initial_delay: self.poll_interval().max(Duration::from_secs(1)),
            ..RetryConfig::default()
        }
    }
}
