// packages/pool/src/pool/config.rs
//! Pool tunables
//!
//! All durations are stored as integer milliseconds so they map cleanly onto
//! config files and `SANDBOX_POOL__POOL__*` environment variables; accessor
//! methods return [`Duration`].

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest supported health window (bits in the history mask)
pub const MAX_HEALTH_WINDOW: u32 = 32;

/// Configuration for the environment pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Environments created at start-up (default: 3)
    pub initial_size: usize,

    /// Idle reclamation never shrinks the pool below this (default: 1)
    pub min_size: usize,

    /// Hard ceiling on live environments (default: 10)
    pub max_size: usize,

    /// Available environments unused for longer than this are reclaimed (default: 300s)
    pub idle_timeout_ms: u64,

    /// Period of the background health sweep (default: 30s)
    pub health_check_interval_ms: u64,

    /// Period of the idle reclamation loop (default: 60s)
    pub idle_sweep_interval_ms: u64,

    /// Timeout used by `acquire_default` (default: 30s)
    pub default_acquire_timeout_ms: u64,

    /// Round-trip budget of the quick check (default: 1s)
    pub quick_check_timeout_ms: u64,

    /// Per-probe budget of the deep check (default: 2s)
    pub deep_check_timeout_ms: u64,

    /// Budget of the reset script (default: 3s)
    pub reset_timeout_ms: u64,

    /// Grace period when stopping an environment (default: 5s)
    pub stop_timeout_ms: u64,

    /// Output kept from one execution (default: 10 000 bytes)
    pub max_output_bytes: usize,

    /// Largest accepted program source (default: 10 000 bytes)
    pub max_source_bytes: usize,

    /// Processes allowed to remain after a reset, counting the probe itself (default: 5)
    pub max_reset_processes: u32,

    /// Deep check fails above this many processes (default: 50)
    pub max_process_count: u32,

    /// Deep check fails above this memory usage, in percent of the limit (default: 90)
    pub max_memory_percent: f64,

    /// Failed quick checks before the sweep escalates to a deep check (default: 3)
    pub max_consecutive_quick_failures: u32,

    /// Quick-check results remembered per environment for escalation (default: 8)
    pub health_window: u32,

    /// How long shutdown waits for leases to come back (default: 30s)
    pub shutdown_drain_ms: u64,

    /// How long shutdown waits for each background loop to exit (default: 5s)
    pub background_join_grace_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 3,
            min_size: 1,
            max_size: 10,
            idle_timeout_ms: 300_000,
            health_check_interval_ms: 30_000,
            idle_sweep_interval_ms: 60_000,
            default_acquire_timeout_ms: 30_000,
            quick_check_timeout_ms: 1_000,
            deep_check_timeout_ms: 2_000,
            reset_timeout_ms: 3_000,
            stop_timeout_ms: 5_000,
            max_output_bytes: 10_000,
            max_source_bytes: 10_000,
            max_reset_processes: 5,
            max_process_count: 50,
            max_memory_percent: 90.0,
            max_consecutive_quick_failures: 3,
            health_window: 8,
            shutdown_drain_ms: 30_000,
            background_join_grace_ms: 5_000,
        }
    }
}

impl PoolConfig {
    /// Fixed-size pool: initial, min and max all equal to `size`
    pub fn fixed(size: usize) -> Self {
        Self {
            initial_size: size,
            min_size: size,
            max_size: size,
            ..Default::default()
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn idle_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.idle_sweep_interval_ms)
    }

    pub fn default_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.default_acquire_timeout_ms)
    }

    pub fn quick_check_timeout(&self) -> Duration {
        Duration::from_millis(self.quick_check_timeout_ms)
    }

    pub fn deep_check_timeout(&self) -> Duration {
        Duration::from_millis(self.deep_check_timeout_ms)
    }

    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn shutdown_drain(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_ms)
    }

    pub fn background_join_grace(&self) -> Duration {
        Duration::from_millis(self.background_join_grace_ms)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_size == 0 {
            return Err("max_size must be at least 1".to_string());
        }

        if self.min_size > self.max_size {
            return Err(format!(
                "min_size ({}) cannot exceed max_size ({})",
                self.min_size, self.max_size
            ));
        }

        if self.initial_size > self.max_size {
            return Err(format!(
                "initial_size ({}) cannot exceed max_size ({})",
                self.initial_size, self.max_size
            ));
        }

        let positive = [
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("idle_sweep_interval_ms", self.idle_sweep_interval_ms),
            ("default_acquire_timeout_ms", self.default_acquire_timeout_ms),
            ("quick_check_timeout_ms", self.quick_check_timeout_ms),
            ("deep_check_timeout_ms", self.deep_check_timeout_ms),
            ("reset_timeout_ms", self.reset_timeout_ms),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(format!("{} must be greater than zero", name));
            }
        }

        if !(self.max_memory_percent > 0.0 && self.max_memory_percent <= 100.0) {
            return Err(format!(
                "max_memory_percent must be in (0, 100], got {}",
                self.max_memory_percent
            ));
        }

        if self.max_consecutive_quick_failures == 0 {
            return Err("max_consecutive_quick_failures must be at least 1".to_string());
        }

        if self.health_window < self.max_consecutive_quick_failures
            || self.health_window > MAX_HEALTH_WINDOW
        {
            return Err(format!(
                "health_window must be between {} and {}, got {}",
                self.max_consecutive_quick_failures, MAX_HEALTH_WINDOW, self.health_window
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.initial_size, 3);
        assert_eq!(config.max_size, 10);
        assert_eq!(config.idle_timeout(), Duration::from_secs(300));
        assert_eq!(config.quick_check_timeout(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fixed_pool() {
        let config = PoolConfig::fixed(4);
        assert_eq!((config.initial_size, config.min_size, config.max_size), (4, 4, 4));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let config = PoolConfig {
            max_size: 0,
            min_size: 0,
            initial_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PoolConfig {
            min_size: 11,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PoolConfig {
            initial_size: 11,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_zero_timeouts() {
        let config = PoolConfig {
            reset_timeout_ms: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.contains("reset_timeout_ms"));
    }

    #[test]
    fn test_rejects_bad_thresholds() {
        let config = PoolConfig {
            max_memory_percent: 120.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PoolConfig {
            health_window: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = PoolConfig {
            health_window: 64,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
