// packages/pool/src/pool/stats.rs
//! Point-in-time pool statistics

use crate::pool::record::{EnvironmentRecord, RecordStatus};
use serde::Serialize;
use std::time::Instant;

/// Lifetime counters, only mutated under the pool lock
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolCounters {
    pub total_created: u64,
    pub total_destroyed: u64,
    pub total_leases: u64,
    pub total_resets: u64,
    pub health_check_failures: u64,
    pub reset_failures: u64,
    pub acquire_timeouts: u64,
}

/// Snapshot of one environment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvironmentSnapshot {
    pub id: String,
    pub status: RecordStatus,
    /// RFC 3339 creation time
    pub created_at: String,
    pub idle_ms: u64,
    pub execution_count: u64,
    pub reset_count: u64,
    pub consecutive_failures: u32,
    pub window_failures: u32,
}

impl EnvironmentSnapshot {
    pub fn from_record(record: &EnvironmentRecord, now: Instant) -> Self {
        Self {
            id: record.id.clone(),
            status: record.status,
            created_at: record.created_at.to_rfc3339(),
            idle_ms: record.idle_for(now).as_millis() as u64,
            execution_count: record.execution_count,
            reset_count: record.reset_count,
            consecutive_failures: record.health.consecutive_failures(),
            window_failures: record.health.window_failures(),
        }
    }
}

/// Snapshot of the whole pool
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStats {
    pub pool_id: String,
    pub min_size: usize,
    pub max_size: usize,
    pub available_count: usize,
    pub in_use_count: usize,
    pub total_count: usize,
    pub total_created: u64,
    pub total_destroyed: u64,
    pub total_leases: u64,
    pub total_resets: u64,
    pub health_check_failures: u64,
    pub reset_failures: u64,
    pub acquire_timeouts: u64,
    pub shut_down: bool,
    pub environments: Vec<EnvironmentSnapshot>,
}

impl PoolStats {
    /// Environments in `status`
    pub fn count(&self, status: RecordStatus) -> usize {
        self.environments
            .iter()
            .filter(|env| env.status == status)
            .count()
    }

    /// Fraction of live environments currently leased, in percent
    pub fn utilization(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        (self.in_use_count as f64 / self.total_count as f64) * 100.0
    }
}
