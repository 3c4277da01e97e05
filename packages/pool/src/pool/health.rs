// packages/pool/src/pool/health.rs
//! Two-tier health checks
//!
//! - **Quick** (tens of ms): status is running, `echo ok` round-trips.
//!   Run on every acquire and every background sweep pass.
//! - **Deep** (hundreds of ms): quick plus memory, process count and a
//!   write probe that must fail on the read-only root filesystem. Run on
//!   every release and when the sweep escalates.
//!
//! A timed-out or errored probe is a failed probe.

use crate::pool::config::PoolConfig;
use crate::runtime::{shell, EnvironmentHandle, EnvironmentState};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Counts live processes without relying on `ps` being installed
pub const PROCESS_COUNT_SCRIPT: &str = "ls -d /proc/[0-9]* 2>/dev/null | wc -l";

/// Path on the root filesystem the write probe tries to create
pub const ROOTFS_PROBE_PATH: &str = "/.sandbox-pool-write-probe";

/// Why an environment failed a check
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Unhealthy {
    #[error("environment is {0}, not running")]
    NotRunning(EnvironmentState),

    #[error("liveness probe exited with status {0}")]
    Unresponsive(i32),

    #[error("memory usage {0:.1}% is over the limit")]
    HighMemory(f64),

    #[error("memory usage is unknown")]
    MemoryUnknown,

    #[error("{0} processes running")]
    TooManyProcesses(u32),

    #[error("unparseable process count {0:?}")]
    ProcessCountUnreadable(String),

    #[error("root filesystem is writable")]
    WritableRootfs,

    #[error("probe failed: {0}")]
    Probe(String),
}

/// Runs quick and deep checks against one environment
#[derive(Debug, Clone)]
pub struct HealthChecker {
    quick_timeout: Duration,
    deep_timeout: Duration,
    max_memory_percent: f64,
    max_process_count: u32,
}

impl HealthChecker {
    pub fn new(config: &PoolConfig) -> Self {
        Self {
            quick_timeout: config.quick_check_timeout(),
            deep_timeout: config.deep_check_timeout(),
            max_memory_percent: config.max_memory_percent,
            max_process_count: config.max_process_count,
        }
    }

    /// Configured budget of one quick check
    pub fn quick_timeout(&self) -> Duration {
        self.quick_timeout
    }

    /// Status plus an `echo` round-trip
    pub fn quick(&self, handle: &dyn EnvironmentHandle) -> Result<(), Unhealthy> {
        self.quick_within(handle, self.quick_timeout)
    }

    /// Quick check whose round-trip gets at most `limit`
    pub fn quick_within(&self, handle: &dyn EnvironmentHandle, limit: Duration) -> Result<(), Unhealthy> {
        let started = Instant::now();
        let result = self.liveness(handle, "ok", self.quick_timeout.min(limit));

        debug!(
            env_id = handle.id(),
            healthy = result.is_ok(),
            check_ms = started.elapsed().as_millis() as u64,
            "Quick health check completed"
        );
        result
    }

    /// Liveness, memory, process count and the read-only rootfs probe
    pub fn deep(&self, handle: &dyn EnvironmentHandle) -> Result<(), Unhealthy> {
        let started = Instant::now();
        let result = self.deep_inner(handle);

        debug!(
            env_id = handle.id(),
            healthy = result.is_ok(),
            check_ms = started.elapsed().as_millis() as u64,
            "Deep health check completed"
        );
        result
    }

    fn deep_inner(&self, handle: &dyn EnvironmentHandle) -> Result<(), Unhealthy> {
        self.liveness(handle, "health_check", self.deep_timeout)?;

        let stats = handle.stats().map_err(|e| Unhealthy::Probe(e.to_string()))?;
        let percent = stats.memory_percent().ok_or(Unhealthy::MemoryUnknown)?;
        if percent > self.max_memory_percent {
            return Err(Unhealthy::HighMemory(percent));
        }

        let output = handle
            .run(&shell(PROCESS_COUNT_SCRIPT), self.deep_timeout)
            .map_err(|e| Unhealthy::Probe(e.to_string()))?;
        if !output.success() {
            return Err(Unhealthy::Unresponsive(output.exit_code));
        }
        let count: u32 = output
            .stdout
            .trim()
            .parse()
            .map_err(|_| Unhealthy::ProcessCountUnreadable(output.stdout.trim().to_string()))?;
        if count > self.max_process_count {
            return Err(Unhealthy::TooManyProcesses(count));
        }

        let probe = vec!["touch".to_string(), ROOTFS_PROBE_PATH.to_string()];
        let output = handle
            .run(&probe, self.deep_timeout)
            .map_err(|e| Unhealthy::Probe(e.to_string()))?;
        if output.success() {
            return Err(Unhealthy::WritableRootfs);
        }

        Ok(())
    }

    fn liveness(
        &self,
        handle: &dyn EnvironmentHandle,
        token: &str,
        timeout: Duration,
    ) -> Result<(), Unhealthy> {
        let state = handle.status().map_err(|e| Unhealthy::Probe(e.to_string()))?;
        if state != EnvironmentState::Running {
            return Err(Unhealthy::NotRunning(state));
        }

        let output = handle
            .run(&["echo".to_string(), token.to_string()], timeout)
            .map_err(|e| Unhealthy::Probe(e.to_string()))?;
        if !output.success() {
            return Err(Unhealthy::Unresponsive(output.exit_code));
        }
        Ok(())
    }
}
