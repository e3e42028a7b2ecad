//! Engine configuration.
//!
//! Every struct deserializes with per-field defaults, so a partial TOML table
//! is enough. Durations are stored in milliseconds.

use crate::document::MAX_CONTENT_BYTES;
use crate::merge::MergeStrategy;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for per-document session coordinators.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a session with no attached clients stays resident.
    pub idle_grace_ms: u64,
    /// Delay before retrying retirement after a failed flush.
    pub retire_retry_ms: u64,
    /// Largest accepted content, in bytes.
    pub max_content_bytes: usize,
    /// Merge policy applied to submissions.
    pub merge: MergeStrategy,
    /// Client instances remembered per document for duplicate detection.
    pub ack_capacity: usize,
    /// How long an idle client instance stays in the ack ledger.
    pub ack_ttl_ms: u64,
}

impl SessionConfig {
    pub fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }

    pub fn retire_retry(&self) -> Duration {
        Duration::from_millis(self.retire_retry_ms)
    }

    pub fn ack_ttl(&self) -> Duration {
        Duration::from_millis(self.ack_ttl_ms)
    }

    /// Sets the idle grace period.
    pub fn with_idle_grace(mut self, grace: Duration) -> Self {
        self.idle_grace_ms = grace.as_millis() as u64;
        self
    }

    /// Sets the maximum content size.
    pub fn with_max_content_bytes(mut self, limit: usize) -> Self {
        self.max_content_bytes = limit;
        self
    }

    /// Sets the ack ledger bounds.
    pub fn with_ack_limits(mut self, capacity: usize, ttl: Duration) -> Self {
        self.ack_capacity = capacity;
        self.ack_ttl_ms = ttl.as_millis() as u64;
        self
    }

    /// Sets the merge policy.
    pub fn with_merge(mut self, merge: MergeStrategy) -> Self {
        self.merge = merge;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_grace_ms: 0,
            retire_retry_ms: 1000,
            max_content_bytes: MAX_CONTENT_BYTES,
            merge: MergeStrategy::default(),
            ack_capacity: 1024,
            ack_ttl_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// Configuration for the presence registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    /// Entries not seen for this long are removed.
    pub liveness_timeout_ms: u64,
    /// How often the expiry sweep runs.
    pub sweep_interval_ms: u64,
}

impl PresenceConfig {
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Interval at which clients are expected to heartbeat.
    pub fn heartbeat_interval(&self) -> Duration {
        self.liveness_timeout() / 2
    }

    /// Sets the liveness timeout.
    pub fn with_liveness_timeout(mut self, timeout: Duration) -> Self {
        self.liveness_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Sets the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            liveness_timeout_ms: 30_000,
            sweep_interval_ms: 5_000,
        }
    }
}

/// Configuration for the autosave coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    /// Quiescence required before a pending save fires.
    pub debounce_ms: u64,
    /// Upper bound on how stale storage may get under continuous editing.
    pub max_latency_ms: u64,
    /// First retry delay after a failed write.
    pub retry_base_ms: u64,
    /// Largest retry delay.
    pub retry_cap_ms: u64,
}

impl AutosaveConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_latency(&self) -> Duration {
        Duration::from_millis(self.max_latency_ms)
    }

    /// Delay before the retry following `failures` consecutive failures.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let shift = failures.saturating_sub(1).min(16);
        let delay = self.retry_base_ms.saturating_mul(1u64 << shift);
        Duration::from_millis(delay.min(self.retry_cap_ms))
    }

    /// Sets the debounce window.
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = debounce.as_millis() as u64;
        self
    }

    /// Sets the maximum save latency.
    pub fn with_max_latency(mut self, latency: Duration) -> Self {
        self.max_latency_ms = latency.as_millis() as u64;
        self
    }
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 2_000,
            max_latency_ms: 10_000,
            retry_base_ms: 500,
            retry_cap_ms: 30_000,
        }
    }
}

/// Everything the session manager needs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub session: SessionConfig,
    pub presence: PresenceConfig,
    pub autosave: AutosaveConfig,
}
