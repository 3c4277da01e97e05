// packages/pool/src/pool/record.rs
//! Per-environment bookkeeping
//!
//! One [`EnvironmentRecord`] wraps every live environment. Records are only
//! mutated under the pool lock; the handle they hold is what leases and
//! probes operate on.

use crate::runtime::EnvironmentHandle;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lifecycle status of one environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// Idle and queued for the next lease
    Available,
    /// Leased to a caller
    InUse,
    /// Returned by its lease, being reset and verified
    Resetting,
    /// Taken out of the queue by the background health sweep
    Checking,
    /// Failed a check and claimed for destruction
    Unhealthy,
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RecordStatus::Available => "available",
            RecordStatus::InUse => "in_use",
            RecordStatus::Resetting => "resetting",
            RecordStatus::Checking => "checking",
            RecordStatus::Unhealthy => "unhealthy",
        };
        f.write_str(s)
    }
}

/// Sliding window of recent quick-check results
///
/// Bit `i` of `failures` is set when the check `i` results ago failed.
/// Escalation triggers on either a run of consecutive failures or enough
/// failures inside the window, so an environment that alternates between
/// passing and failing still gets a deep check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthHistory {
    failures: u32,
    recorded: u32,
    window: u32,
    consecutive: u32,
}

impl HealthHistory {
    /// Empty history remembering the last `window` results (1..=32)
    pub fn new(window: u32) -> Self {
        Self {
            failures: 0,
            recorded: 0,
            window: window.clamp(1, 32),
            consecutive: 0,
        }
    }

    /// Record one check result
    pub fn record(&mut self, passed: bool) {
        let mask = if self.window == 32 {
            u32::MAX
        } else {
            (1u32 << self.window) - 1
        };
        self.failures = ((self.failures << 1) | u32::from(!passed)) & mask;
        self.recorded = (self.recorded + 1).min(self.window);

        if passed {
            self.consecutive = 0;
        } else {
            self.consecutive += 1;
        }
    }

    /// Failures in a row since the last pass
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    /// Failures among the remembered results
    pub fn window_failures(&self) -> u32 {
        self.failures.count_ones()
    }

    /// Results currently remembered
    pub fn len(&self) -> u32 {
        self.recorded
    }

    pub fn is_empty(&self) -> bool {
        self.recorded == 0
    }

    /// Whether `threshold` failures call for a deep check
    pub fn should_escalate(&self, threshold: u32) -> bool {
        self.consecutive >= threshold || self.window_failures() >= threshold
    }

    /// Forget everything, after a passing deep check
    pub fn clear(&mut self) {
        self.failures = 0;
        self.recorded = 0;
        self.consecutive = 0;
    }
}

/// Metadata wrapper around one live environment
#[derive(Debug)]
pub struct EnvironmentRecord {
    /// Runtime-assigned identity
    pub id: String,

    /// Handle owned by this record; a lease borrows a clone of the `Arc`
    pub handle: Arc<dyn EnvironmentHandle>,

    /// Wall-clock creation time
    pub created_at: DateTime<Utc>,

    /// Last time the environment was leased or came back from a lease
    pub last_used: Instant,

    /// Leases granted
    pub execution_count: u64,

    /// Successful resets
    pub reset_count: u64,

    pub status: RecordStatus,

    /// Recent quick-check results
    pub health: HealthHistory,
}

impl EnvironmentRecord {
    /// Wrap a freshly created handle
    pub fn new(handle: Arc<dyn EnvironmentHandle>, status: RecordStatus, health_window: u32) -> Self {
        Self {
            id: handle.id().to_string(),
            handle,
            created_at: Utc::now(),
            last_used: Instant::now(),
            execution_count: 0,
            reset_count: 0,
            status,
            health: HealthHistory::new(health_window),
        }
    }

    /// Time since the environment was last leased or returned
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }

    /// Mark the record leased
    pub fn lease(&mut self) {
        self.status = RecordStatus::InUse;
        self.last_used = Instant::now();
    }

    /// Mark the record available after a verified reset
    pub fn make_available(&mut self) {
        self.status = RecordStatus::Available;
        self.reset_count += 1;
        self.last_used = Instant::now();
        self.health.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerRuntime, CreateSpec, MemoryRuntime};

    #[test]
    fn test_consecutive_escalation() {
        let mut history = HealthHistory::new(8);
        history.record(false);
        history.record(false);
        assert!(!history.should_escalate(3));

        history.record(false);
        assert_eq!(history.consecutive_failures(), 3);
        assert!(history.should_escalate(3));
    }

    #[test]
    fn test_pass_resets_consecutive_but_not_window() {
        let mut history = HealthHistory::new(8);
        history.record(false);
        history.record(false);
        history.record(true);

        assert_eq!(history.consecutive_failures(), 0);
        assert_eq!(history.window_failures(), 2);
    }

    #[test]
    fn test_flapping_escalates_through_window() {
        let mut history = HealthHistory::new(8);
        for _ in 0..2 {
            history.record(false);
            history.record(true);
        }
        assert!(!history.should_escalate(3));

        history.record(false);
        assert_eq!(history.consecutive_failures(), 1);
        assert!(history.should_escalate(3));
    }

    #[test]
    fn test_old_failures_slide_out() {
        let mut history = HealthHistory::new(4);
        history.record(false);
        history.record(false);
        for _ in 0..4 {
            history.record(true);
        }
        assert_eq!(history.window_failures(), 0);
        assert_eq!(history.len(), 4);
    }

    #[test]
    fn test_full_width_window() {
        let mut history = HealthHistory::new(32);
        for _ in 0..40 {
            history.record(false);
        }
        assert_eq!(history.window_failures(), 32);
        history.clear();
        assert!(history.is_empty());
        assert_eq!(history.window_failures(), 0);
    }

    #[test]
    fn test_record_lifecycle() {
        let runtime = MemoryRuntime::new();
        let handle = runtime.create(&CreateSpec::default()).unwrap();
        let mut record = EnvironmentRecord::new(handle, RecordStatus::Available, 8);

        assert_eq!(record.id, record.handle.id());
        record.lease();
        assert_eq!(record.status, RecordStatus::InUse);

        record.health.record(false);
        record.make_available();
        assert_eq!(record.status, RecordStatus::Available);
        assert_eq!(record.reset_count, 1);
        assert_eq!(record.health.consecutive_failures(), 0);
    }
}
