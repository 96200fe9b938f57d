//! Engine configuration.
//!
//! Every field has a default so a partial (or missing) `config.toml` is valid.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{CanvasError, Result};

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct EngineConfig {
    #[serde(default)]
    pub reconciler: ReconcilerConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub subscription: SubscriptionConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.reconciler.settlement_window_ms == 0 {
            return Err(CanvasError::config("reconciler.settlement_window_ms must be > 0"));
        }
        if self.reconciler.ledger_capacity == 0 || self.reconciler.aborted_capacity == 0 {
            return Err(CanvasError::config("reconciler capacities must be > 0"));
        }
        if self.reconciler.confirmation_timeout_ms == 0 {
            return Err(CanvasError::config("reconciler.confirmation_timeout_ms must be > 0"));
        }
        if self.stream.finalize_fetch_attempts == 0 {
            return Err(CanvasError::config("stream.finalize_fetch_attempts must be > 0"));
        }
        if self.subscription.max_delay_ms < self.subscription.base_delay_ms {
            return Err(CanvasError::config(
                "subscription.max_delay_ms must be >= subscription.base_delay_ms",
            ));
        }
        if self.subscription.channel_capacity == 0 {
            return Err(CanvasError::config("subscription.channel_capacity must be > 0"));
        }
        Ok(())
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// How long a settled (local id, durable id) pair suppresses echoes.
    pub settlement_window_ms: u64,
    /// Upper bound on remembered settlements, regardless of expiry.
    pub ledger_capacity: usize,
    /// Number of aborted stream sessions remembered for discarding late events.
    pub aborted_capacity: usize,
    /// A durable write not confirmed within this bound is rolled back.
    pub confirmation_timeout_ms: u64,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            settlement_window_ms: 5_000,
            ledger_capacity: 1_024,
            aborted_capacity: 256,
            confirmation_timeout_ms: 10_000,
        }
    }
}

impl ReconcilerConfig {
    pub fn settlement_window(&self) -> Duration {
        Duration::from_millis(self.settlement_window_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_millis(self.confirmation_timeout_ms)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct StreamConfig {
    /// Closed/aborted session ids kept around so they cannot be reopened.
    pub retained_terminal_sessions: usize,
    /// Producer silence after which a stream is aborted.
    pub idle_timeout_ms: u64,
    pub finalize_fetch_attempts: u32,
    pub finalize_retry_delay_ms: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            retained_terminal_sessions: 256,
            idle_timeout_ms: 60_000,
            finalize_fetch_attempts: 3,
            finalize_retry_delay_ms: 200,
        }
    }
}

impl StreamConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn finalize_retry_delay(&self) -> Duration {
        Duration::from_millis(self.finalize_retry_delay_ms)
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SubscriptionConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
    /// 0 retries forever.
    pub max_attempts: u32,
    pub channel_capacity: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 250,
            max_delay_ms: 8_000,
            jitter_ratio: 0.5,
            max_attempts: 0,
            channel_capacity: 256,
        }
    }
}

impl SubscriptionConfig {
    /// Backoff before retry `attempt` (1-based), with `jitter_unit` in `[0, 1]`.
    pub fn delay_for(&self, attempt: u32, jitter_unit: f64) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 1).min(16);
        let scaled = self
            .base_delay_ms
            .saturating_mul(1_u64 << exponent)
            .min(self.max_delay_ms);
        let jitter_max = (scaled as f64 * self.jitter_ratio.max(0.0)) as u64;
        let jitter = (jitter_max as f64 * jitter_unit.clamp(0.0, 1.0)) as u64;
        Duration::from_millis(scaled.saturating_add(jitter))
    }

    pub fn retries_exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt >= self.max_attempts
    }
}
