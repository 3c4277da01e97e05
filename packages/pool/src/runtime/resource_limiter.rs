// packages/pool/src/runtime/resource_limiter.rs
//! Resource limits forwarded to the container runtime
//!
//! Every pooled environment is created with the same ceilings:
//! - Memory (MB, swap disabled)
//! - CPU quota (percentage of one core)
//! - Process count (pids limit, fork-bomb protection)

use serde::{Deserialize, Serialize};

/// CFS scheduling period used to express the CPU quota (100ms)
const CPU_PERIOD_US: u64 = 100_000;

/// Resource limits for one environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Memory limit in megabytes
    /// Example: 128 = 128MB RAM limit, no swap
    pub memory_limit_mb: u64,

    /// CPU quota as percentage (1-400)
    /// Example: 50 = 50% of one CPU core
    pub cpu_quota: u32,

    /// Maximum number of processes inside the environment
    pub pids_limit: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit_mb: 128,
            cpu_quota: 50,
            pids_limit: 64,
        }
    }
}

impl ResourceLimits {
    /// Strict limits for anonymous or rate-limited tenants
    pub fn strict() -> Self {
        Self {
            memory_limit_mb: 64,
            cpu_quota: 25,
            pids_limit: 32,
        }
    }

    /// Relaxed limits (for development)
    pub fn relaxed() -> Self {
        Self {
            memory_limit_mb: 512,
            cpu_quota: 100,
            pids_limit: 256,
        }
    }

    /// Validate resource limits
    pub fn validate(&self) -> Result<(), String> {
        if self.memory_limit_mb < 16 {
            return Err("Memory limit cannot be less than 16MB".to_string());
        }
        if self.memory_limit_mb > 16384 {
            return Err("Memory limit cannot exceed 16GB".to_string());
        }

        if self.cpu_quota == 0 {
            return Err("CPU quota cannot be 0".to_string());
        }
        if self.cpu_quota > 400 {
            return Err("CPU quota cannot exceed 400% (4 cores)".to_string());
        }

        // The keep-alive process, the shell and the probes need a few pids
        if self.pids_limit < 8 {
            return Err("Pids limit cannot be less than 8".to_string());
        }

        Ok(())
    }

    /// Memory limit in bytes
    pub fn memory_limit_bytes(&self) -> u64 {
        self.memory_limit_mb * 1024 * 1024
    }

    /// Worst-case memory held by `environments` environments, in MB
    pub fn aggregate_memory_mb(&self, environments: usize) -> u64 {
        self.memory_limit_mb * environments as u64
    }

    /// Render as `docker run` flags
    pub fn docker_args(&self) -> Vec<String> {
        let memory = format!("{}m", self.memory_limit_mb);
        let quota = (self.cpu_quota as u64 * CPU_PERIOD_US) / 100;

        vec![
            "--memory".to_string(),
            memory.clone(),
            // Same value as --memory disables swap
            "--memory-swap".to_string(),
            memory,
            "--cpu-period".to_string(),
            CPU_PERIOD_US.to_string(),
            "--cpu-quota".to_string(),
            quota.to_string(),
            "--pids-limit".to_string(),
            self.pids_limit.to_string(),
        ]
    }
}
