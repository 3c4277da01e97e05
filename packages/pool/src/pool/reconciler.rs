// packages/pool/src/pool/reconciler.rs
//! Background reconciliation
//!
//! Two independent loops, each on its own named thread:
//!
//! - **health sweep** (every `health_check_interval`): quick-checks every
//!   available environment, escalates repeat offenders to a deep check and
//!   replaces the ones that fail it
//! - **idle reaper** (every `idle_sweep_interval`): destroys environments
//!   idle for longer than `idle_timeout`, never going below `min_size`
//!
//! Leased environments are never touched. A panicking iteration is logged
//! and the loop keeps running.

use crate::observability::metrics::{self as pool_metrics, CheckTier};
use crate::pool::manager::{PoolInner, PoolState};
use crate::pool::record::RecordStatus;
use crossbeam_channel::{select, tick, unbounded, Receiver, RecvTimeoutError};
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Outcome of one health sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Environments quick-checked
    pub checked: usize,

    /// Leased or resetting environments left alone
    pub skipped: usize,

    /// Quick checks that failed
    pub failed: usize,

    /// Deep checks run as tie-breaker
    pub escalated: usize,

    /// Escalations whose deep check passed
    pub false_positives: usize,

    /// Environments destroyed (and replaced when possible)
    pub destroyed: usize,
}

impl PoolInner {
    /// Put a checked record back into circulation, or mark it for destruction
    pub(crate) fn return_to_queue(&self, state: &mut PoolState, id: &str) -> bool {
        let Some(record) = state.records.get_mut(id) else {
            return false;
        };
        match self.queue.push(id.to_string()) {
            Ok(()) => {
                record.status = RecordStatus::Available;
                true
            }
            Err(_) => {
                record.status = RecordStatus::Unhealthy;
                false
            }
        }
    }

    /// Quick-check every available environment once
    pub(crate) fn health_sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        if self.is_closed() {
            return report;
        }

        let started = Instant::now();
        let threshold = self.config.max_consecutive_quick_failures;
        let ids: Vec<String> = {
            let state = self.state.lock();
            report.skipped = state.outstanding();
            state
                .records
                .values()
                .filter(|r| r.status == RecordStatus::Available)
                .map(|r| r.id.clone())
                .collect()
        };

        let mut doomed = Vec::new();

        for id in ids {
            if self.is_closed() {
                break;
            }

            // Claim: out of the queue and away from acquirers for the check
            let handle = {
                let mut state = self.state.lock();
                match state.records.get_mut(&id) {
                    Some(record)
                        if record.status == RecordStatus::Available && self.queue.remove(&id) =>
                    {
                        record.status = RecordStatus::Checking;
                        Arc::clone(&record.handle)
                    }
                    _ => continue,
                }
            };
            report.checked += 1;

            let quick = self.checker.quick(handle.as_ref());
            let passed = quick.is_ok();

            let (escalate, consecutive, window) = {
                let mut state = self.state.lock();
                if !passed {
                    state.counters.health_check_failures += 1;
                }
                let Some(record) = state.records.get_mut(&id) else {
                    continue;
                };
                record.health.record(passed);
                let escalate = !passed && record.health.should_escalate(threshold);
                let consecutive = record.health.consecutive_failures();
                let window = record.health.window_failures();

                if !escalate && !self.return_to_queue(&mut state, &id) {
                    doomed.push(id.clone());
                }
                (escalate, consecutive, window)
            };

            if let Err(reason) = quick {
                report.failed += 1;
                pool_metrics::record_health_failure(&self.pool_id, CheckTier::Quick);
                warn!(
                    pool_id = %self.pool_id,
                    env_id = %id,
                    reason = %reason,
                    consecutive,
                    window,
                    "Background quick check failed"
                );
            }

            if !escalate {
                continue;
            }
            report.escalated += 1;

            match self.checker.deep(handle.as_ref()) {
                Ok(()) => {
                    let mut state = self.state.lock();
                    if let Some(record) = state.records.get_mut(&id) {
                        record.health.clear();
                    }
                    if !self.return_to_queue(&mut state, &id) {
                        doomed.push(id.clone());
                    }
                    drop(state);

                    report.false_positives += 1;
                    info!(
                        pool_id = %self.pool_id,
                        env_id = %id,
                        "Deep check passed, treating quick failures as false positive"
                    );
                }
                Err(reason) => {
                    {
                        let mut state = self.state.lock();
                        state.counters.health_check_failures += 1;
                        if let Some(record) = state.records.get_mut(&id) {
                            record.status = RecordStatus::Unhealthy;
                        }
                    }
                    pool_metrics::record_health_failure(&self.pool_id, CheckTier::Deep);
                    warn!(
                        pool_id = %self.pool_id,
                        env_id = %id,
                        reason = %reason,
                        "Escalated deep check failed"
                    );
                    doomed.push(id);
                }
            }
        }

        for id in &doomed {
            self.destroy_and_replace(id);
        }
        report.destroyed = doomed.len();

        debug!(
            pool_id = %self.pool_id,
            checked = report.checked,
            failed = report.failed,
            destroyed = report.destroyed,
            sweep_ms = started.elapsed().as_millis() as u64,
            "Health sweep completed"
        );
        report
    }

    /// Destroy environments idle past the timeout, keeping at least `min_size`
    pub(crate) fn reclaim_idle(&self) -> usize {
        if self.is_closed() {
            return 0;
        }

        let idle_timeout = self.config.idle_timeout();
        let mut candidates: Vec<(String, Duration)> = {
            let state = self.state.lock();
            let now = Instant::now();
            state
                .records
                .values()
                .filter(|r| r.status == RecordStatus::Available)
                .map(|r| (r.id.clone(), r.idle_for(now)))
                .filter(|(_, idle)| *idle > idle_timeout)
                .collect()
        };
        // Longest idle first
        candidates.sort_by(|a, b| b.1.cmp(&a.1));

        let mut reclaimed = 0;
        for (id, idle) in candidates {
            let record = {
                let mut state = self.state.lock();
                if state.records.len() <= self.config.min_size {
                    break;
                }
                let claimable = match state.records.get(&id) {
                    Some(record) => {
                        record.status == RecordStatus::Available
                            && record.idle_for(Instant::now()) > idle_timeout
                    }
                    None => false,
                };
                if !claimable || !self.queue.remove(&id) {
                    continue;
                }
                let record = state.detach(&id);
                self.publish_occupancy(&state);
                record
            };

            if let Some(record) = record {
                self.cleanup(record.handle.as_ref());
                pool_metrics::record_destroyed(&self.pool_id);
                reclaimed += 1;
                info!(
                    pool_id = %self.pool_id,
                    env_id = %id,
                    idle_ms = idle.as_millis() as u64,
                    "Reclaimed idle environment"
                );
            }
        }

        reclaimed
    }
}

struct Worker {
    name: String,
    handle: JoinHandle<()>,
    /// Disconnects when the thread exits
    done: Receiver<()>,
}

/// Handles to the two background loops of one pool
pub(crate) struct Reconciler {
    workers: Vec<Worker>,
}

impl Reconciler {
    /// Spawn the health sweep and idle reaper threads
    pub(crate) fn start(pool: Arc<PoolInner>) -> std::io::Result<Self> {
        let sweep = spawn_loop(
            format!("health-sweep-{}", pool.pool_id),
            pool.config.health_check_interval(),
            Arc::clone(&pool),
            |pool| {
                pool.health_sweep();
            },
        )?;

        let reaper = spawn_loop(
            format!("idle-reaper-{}", pool.pool_id),
            pool.config.idle_sweep_interval(),
            pool,
            |pool| {
                pool.reclaim_idle();
            },
        )?;

        Ok(Self {
            workers: vec![sweep, reaper],
        })
    }

    /// Wait up to `grace` per loop for it to exit; loops still busy are detached
    ///
    /// The loops stop on their own once the pool's shutdown channel disconnects.
    pub(crate) fn stop(self, grace: Duration) {
        for worker in self.workers {
            match worker.done.recv_timeout(grace) {
                Err(RecvTimeoutError::Timeout) => {
                    warn!(thread = %worker.name, "Background loop did not stop in time, detaching");
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    if worker.handle.join().is_err() {
                        error!(thread = %worker.name, "Background loop panicked");
                    }
                }
            }
        }
    }
}

fn spawn_loop<F>(
    name: String,
    period: Duration,
    pool: Arc<PoolInner>,
    iteration: F,
) -> std::io::Result<Worker>
where
    F: Fn(&PoolInner) + Send + 'static,
{
    let (done_tx, done) = unbounded::<()>();
    let shutdown = pool.shutdown_rx.clone();
    let thread_name = name.clone();

    let handle = thread::Builder::new().name(name.clone()).spawn(move || {
        let _done = done_tx;
        let ticker = tick(period);
        debug!(thread = %thread_name, "Background loop started");

        loop {
            select! {
                recv(ticker) -> _ => {
                    if pool.is_closed() {
                        break;
                    }
                    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| iteration(&pool))) {
                        let message = panic
                            .downcast_ref::<&str>()
                            .map(|s| s.to_string())
                            .or_else(|| panic.downcast_ref::<String>().cloned())
                            .unwrap_or_else(|| "unknown panic".to_string());
                        error!(thread = %thread_name, panic = %message, "Background iteration panicked");
                    }
                }
                recv(shutdown) -> _ => break,
            }
        }

        debug!(thread = %thread_name, "Background loop stopped");
    })?;

    Ok(Worker { name, handle, done })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::config::PoolConfig;
    use crate::pool::manager::PoolManager;
    use crate::runtime::{CreateSpec, MemoryRuntime};

    fn start(config: PoolConfig) -> (MemoryRuntime, PoolManager) {
        let runtime = MemoryRuntime::new();
        let pool = PoolManager::start(config, Arc::new(runtime.clone()), CreateSpec::default())
            .unwrap();
        (runtime, pool)
    }

    #[test]
    fn test_sweep_of_healthy_pool() {
        let (_runtime, pool) = start(PoolConfig {
            shutdown_drain_ms: 100,
            ..PoolConfig::fixed(2)
        });

        let report = pool.run_health_sweep();
        assert_eq!(report.checked, 2);
        assert_eq!(report.failed, 0);
        assert_eq!(pool.stats().available_count, 2);
        assert!(pool.verify_invariants().is_ok());
    }

    #[test]
    fn test_single_failure_does_not_escalate() {
        let (runtime, pool) = start(PoolConfig::fixed(1));
        let id = pool.stats().environments[0].id.clone();
        runtime.container(&id).unwrap().fail_probes(1);

        let report = pool.run_health_sweep();
        assert_eq!((report.failed, report.escalated), (1, 0));

        let stats = pool.stats();
        assert_eq!(stats.environments[0].consecutive_failures, 1);
        assert_eq!(stats.available_count, 1);
    }

    #[test]
    fn test_background_loops_stop_on_shutdown() {
        let (_runtime, pool) = start(PoolConfig {
            health_check_interval_ms: 10,
            idle_sweep_interval_ms: 10,
            background_join_grace_ms: 1_000,
            ..PoolConfig::fixed(1)
        });
        thread::sleep(Duration::from_millis(50));

        let started = Instant::now();
        pool.shutdown();
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
