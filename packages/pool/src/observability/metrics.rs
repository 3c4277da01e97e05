// packages/pool/src/observability/metrics.rs
//! Metric names and recording helpers for the pool

use ::metrics::{counter, gauge, histogram};
use std::time::Duration;

pub const ACQUISITIONS_TOTAL: &str = "sandbox_pool_acquisitions_total";
pub const ACQUIRE_TIMEOUTS_TOTAL: &str = "sandbox_pool_acquire_timeouts_total";
pub const ENVIRONMENTS_CREATED_TOTAL: &str = "sandbox_pool_environments_created_total";
pub const ENVIRONMENTS_DESTROYED_TOTAL: &str = "sandbox_pool_environments_destroyed_total";
pub const RESETS_TOTAL: &str = "sandbox_pool_resets_total";
pub const RESET_FAILURES_TOTAL: &str = "sandbox_pool_reset_failures_total";
pub const HEALTH_CHECK_FAILURES_TOTAL: &str = "sandbox_pool_health_check_failures_total";
pub const AVAILABLE: &str = "sandbox_pool_available";
pub const IN_USE: &str = "sandbox_pool_in_use";
pub const ACQUIRE_SECONDS: &str = "sandbox_pool_acquire_seconds";

/// Which check tier failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckTier {
    Quick,
    Deep,
}

impl CheckTier {
    fn as_str(self) -> &'static str {
        match self {
            CheckTier::Quick => "quick",
            CheckTier::Deep => "deep",
        }
    }
}

pub fn record_acquisition(pool_id: &str, waited: Duration) {
    counter!(ACQUISITIONS_TOTAL, "pool_id" => pool_id.to_string()).increment(1);
    histogram!(ACQUIRE_SECONDS, "pool_id" => pool_id.to_string()).record(waited.as_secs_f64());
}

pub fn record_acquire_timeout(pool_id: &str) {
    counter!(ACQUIRE_TIMEOUTS_TOTAL, "pool_id" => pool_id.to_string()).increment(1);
}

pub fn record_created(pool_id: &str) {
    counter!(ENVIRONMENTS_CREATED_TOTAL, "pool_id" => pool_id.to_string()).increment(1);
}

pub fn record_destroyed(pool_id: &str) {
    counter!(ENVIRONMENTS_DESTROYED_TOTAL, "pool_id" => pool_id.to_string()).increment(1);
}

pub fn record_reset(pool_id: &str, success: bool) {
    if success {
        counter!(RESETS_TOTAL, "pool_id" => pool_id.to_string()).increment(1);
    } else {
        counter!(RESET_FAILURES_TOTAL, "pool_id" => pool_id.to_string()).increment(1);
    }
}

pub fn record_health_failure(pool_id: &str, tier: CheckTier) {
    counter!(
        HEALTH_CHECK_FAILURES_TOTAL,
        "pool_id" => pool_id.to_string(),
        "tier" => tier.as_str()
    )
    .increment(1);
}

/// Publish the current occupancy
pub fn record_occupancy(pool_id: &str, available: usize, in_use: usize) {
    gauge!(AVAILABLE, "pool_id" => pool_id.to_string()).set(available as f64);
    gauge!(IN_USE, "pool_id" => pool_id.to_string()).set(in_use as f64);
}
