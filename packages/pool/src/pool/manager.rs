// packages/pool/src/pool/manager.rs
//! Pool manager: acquire, release, destroy-and-replace, shutdown
//!
//! # Architecture
//!
//! ```text
//! PoolManager
//! ├─ state: Mutex<PoolState>        (records, pending creates, counters)
//! ├─ queue: AvailableQueue           (ids of Available records)
//! ├─ checker / resetter              (probes, run outside the lock)
//! └─ reconciler                      (health sweep + idle reaper threads)
//! ```
//!
//! # Locking
//!
//! Every record mutation happens under `state`. The lock is never held
//! across a runtime call; queue operations taken under it never block.
//! While the lock is held, an id is in the queue if and only if its record
//! is `Available` (a consumer may have popped it and not yet checked it out).
//!
//! A record is claimed (status changed away from `Available`) under the
//! lock before any probe or destroy touches it, so two threads never work on
//! the same environment.

use crate::observability::metrics::{self as pool_metrics, CheckTier};
use crate::pool::config::PoolConfig;
use crate::pool::health::HealthChecker;
use crate::pool::queue::{AvailableQueue, PopOutcome};
use crate::pool::reconciler::{Reconciler, SweepReport};
use crate::pool::record::{EnvironmentRecord, RecordStatus};
use crate::pool::reset::Resetter;
use crate::pool::stats::{EnvironmentSnapshot, PoolCounters, PoolStats};
use crate::runtime::{CommandOutput, ContainerRuntime, CreateSpec, EnvironmentHandle};
use crate::utils::errors::{PoolError, Result};
use chrono::Utc;
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Label carrying the owning pool id on every environment
pub const POOL_ID_LABEL: &str = "sandbox-pool.pool_id";

/// Label carrying the creation time on every environment
pub const CREATED_AT_LABEL: &str = "sandbox-pool.created_at";

/// Poll period while shutdown waits for leases to come back
const DRAIN_POLL: Duration = Duration::from_millis(50);

/// Shared mutable pool state, guarded by one mutex
#[derive(Default)]
pub(crate) struct PoolState {
    pub(crate) records: HashMap<String, EnvironmentRecord>,

    /// Creates in flight; `records.len() + pending <= max_size`
    pub(crate) pending: usize,

    pub(crate) counters: PoolCounters,
}

impl PoolState {
    fn count(&self, statuses: &[RecordStatus]) -> usize {
        self.records
            .values()
            .filter(|r| statuses.contains(&r.status))
            .count()
    }

    /// Environments leased or coming back from a lease
    pub(crate) fn outstanding(&self) -> usize {
        self.count(&[RecordStatus::InUse, RecordStatus::Resetting])
    }

    pub(crate) fn available(&self) -> usize {
        self.count(&[RecordStatus::Available, RecordStatus::Checking])
    }

    /// Remove a record from the books; runtime cleanup happens separately
    pub(crate) fn detach(&mut self, id: &str) -> Option<EnvironmentRecord> {
        let record = self.records.remove(id)?;
        self.counters.total_destroyed += 1;
        Some(record)
    }
}

/// State shared between the manager, its leases and the background loops
pub(crate) struct PoolInner {
    pub(crate) pool_id: String,
    pub(crate) config: PoolConfig,
    runtime: Arc<dyn ContainerRuntime>,
    spec: CreateSpec,
    pub(crate) state: Mutex<PoolState>,
    pub(crate) queue: AvailableQueue,
    pub(crate) checker: HealthChecker,
    resetter: Resetter,
    closed: AtomicBool,

    /// Disconnected at shutdown; wakes blocked acquirers and background loops
    pub(crate) shutdown_rx: Receiver<()>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
}

impl PoolInner {
    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn publish_occupancy(&self, state: &PoolState) {
        pool_metrics::record_occupancy(&self.pool_id, state.available(), state.outstanding());
    }

    /// Create one environment and register it with `status`
    ///
    /// Returns `None` when the pool is full, closed, or the runtime failed.
    /// `Available` records are enqueued before the lock is released; `InUse`
    /// records are claimed for the caller, who still has to grant the lease.
    pub(crate) fn spawn_environment(
        &self,
        status: RecordStatus,
    ) -> Option<Arc<dyn EnvironmentHandle>> {
        {
            let mut state = self.state.lock();
            if self.is_closed() || state.records.len() + state.pending >= self.config.max_size {
                return None;
            }
            state.pending += 1;
        }

        let started = Instant::now();
        let spec = self
            .spec
            .clone()
            .with_label(CREATED_AT_LABEL, Utc::now().to_rfc3339());
        let created = self.runtime.create(&spec);

        let mut state = self.state.lock();
        state.pending -= 1;

        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                drop(state);
                error!(pool_id = %self.pool_id, error = %e, "Failed to create environment");
                return None;
            }
        };

        if self.is_closed() {
            drop(state);
            debug!(pool_id = %self.pool_id, env_id = handle.id(), "Pool closed during create");
            self.cleanup(handle.as_ref());
            return None;
        }

        let id = handle.id().to_string();
        let record = EnvironmentRecord::new(
            Arc::clone(&handle),
            status,
            self.config.health_window,
        );
        state.records.insert(id.clone(), record);
        state.counters.total_created += 1;

        if status == RecordStatus::Available {
            if let Err(id) = self.queue.push(id) {
                warn!(pool_id = %self.pool_id, env_id = %id, "Available queue full, discarding new environment");
                let record = state.detach(&id);
                drop(state);
                if let Some(record) = record {
                    self.cleanup(record.handle.as_ref());
                }
                return None;
            }
        }
        self.publish_occupancy(&state);
        drop(state);

        pool_metrics::record_created(&self.pool_id);
        info!(
            pool_id = %self.pool_id,
            env_id = %handle.id(),
            status = %status,
            create_ms = started.elapsed().as_millis() as u64,
            "Environment created"
        );
        Some(handle)
    }

    /// Stop and force-remove an environment, logging failures
    pub(crate) fn cleanup(&self, handle: &dyn EnvironmentHandle) {
        if let Err(e) = handle.stop(self.config.stop_timeout()) {
            debug!(pool_id = %self.pool_id, env_id = handle.id(), error = %e, "Stop failed");
        }
        if let Err(e) = handle.remove(true) {
            warn!(pool_id = %self.pool_id, env_id = handle.id(), error = %e, "Remove failed");
        }
    }

    /// Drop a record and its environment; no replacement
    pub(crate) fn destroy(&self, id: &str) -> bool {
        let record = {
            let mut state = self.state.lock();
            let record = state.detach(id);
            self.publish_occupancy(&state);
            record
        };

        match record {
            Some(record) => {
                self.cleanup(record.handle.as_ref());
                pool_metrics::record_destroyed(&self.pool_id);
                info!(
                    pool_id = %self.pool_id,
                    env_id = %id,
                    executions = record.execution_count,
                    "Environment destroyed"
                );
                true
            }
            None => false,
        }
    }

    /// Destroy a record and create one fresh available environment
    pub(crate) fn destroy_and_replace(&self, id: &str) {
        if !self.destroy(id) {
            return;
        }
        if self.is_closed() {
            return;
        }
        match self.spawn_environment(RecordStatus::Available) {
            Some(handle) => info!(
                pool_id = %self.pool_id,
                replaced = %id,
                env_id = handle.id(),
                "Environment replaced"
            ),
            None => warn!(pool_id = %self.pool_id, replaced = %id, "Could not replace environment"),
        }
    }

    /// Claim a dequeued id, quick-check it and lease it out
    ///
    /// `Ok(None)` means the id was stale or the environment was unhealthy
    /// and has been destroyed. The quick check never runs past `deadline`.
    fn checkout(
        self: &Arc<Self>,
        id: &str,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<Option<Lease>> {
        let handle = {
            let mut state = self.state.lock();
            match state.records.get_mut(id) {
                Some(record) if record.status == RecordStatus::Available => {
                    record.status = RecordStatus::InUse;
                    Arc::clone(&record.handle)
                }
                _ => {
                    debug!(pool_id = %self.pool_id, env_id = %id, "Dropping stale queue entry");
                    return Ok(None);
                }
            }
        };

        let budget = self.checker.quick_timeout();
        let limit = remaining(deadline).map_or(budget, |left| left.min(budget));

        if let Err(reason) = self.checker.quick_within(handle.as_ref(), limit) {
            if limit < budget && expired(deadline) {
                // Cut short by the caller's deadline, not a verdict on the environment
                debug!(
                    pool_id = %self.pool_id,
                    env_id = %id,
                    reason = %reason,
                    "Quick check ran out of acquire time"
                );
                self.give_back(id);
                return Err(self.exhausted(started));
            }

            {
                let mut state = self.state.lock();
                state.counters.health_check_failures += 1;
            }
            pool_metrics::record_health_failure(&self.pool_id, CheckTier::Quick);
            warn!(
                pool_id = %self.pool_id,
                env_id = %id,
                reason = %reason,
                "Dequeued environment failed quick check"
            );
            self.destroy(id);
            return Ok(None);
        }

        self.grant(id, handle, started, deadline)
    }

    /// Lease out a claimed `InUse` record, unless `deadline` has passed
    ///
    /// A record claimed too late goes back to the queue untouched and the
    /// caller gets [`PoolError::PoolExhausted`].
    fn grant(
        self: &Arc<Self>,
        id: &str,
        handle: Arc<dyn EnvironmentHandle>,
        started: Instant,
        deadline: Option<Instant>,
    ) -> Result<Option<Lease>> {
        if expired(deadline) {
            self.give_back(id);
            return Err(self.exhausted(started));
        }

        let mut state = self.state.lock();
        match state.records.get_mut(id) {
            Some(record) if record.status == RecordStatus::InUse => {
                record.lease();
                record.execution_count += 1;
            }
            _ => {
                return if self.is_closed() {
                    Err(PoolError::ShutDown)
                } else {
                    Ok(None)
                };
            }
        }
        state.counters.total_leases += 1;
        self.publish_occupancy(&state);
        drop(state);

        Ok(Some(self.lease(handle, started)))
    }

    /// Return a claimed, never-leased record to the queue
    fn give_back(&self, id: &str) {
        let requeued = {
            let mut state = self.state.lock();
            let requeued = match state.records.get(id) {
                Some(record) if record.status == RecordStatus::InUse => {
                    self.return_to_queue(&mut state, id)
                }
                _ => true,
            };
            self.publish_occupancy(&state);
            requeued
        };
        if !requeued {
            self.destroy(id);
        }
    }

    fn lease(self: &Arc<Self>, handle: Arc<dyn EnvironmentHandle>, started: Instant) -> Lease {
        let waited = started.elapsed();
        pool_metrics::record_acquisition(&self.pool_id, waited);
        info!(
            pool_id = %self.pool_id,
            env_id = handle.id(),
            wait_ms = waited.as_millis() as u64,
            "Environment acquired"
        );

        Lease {
            id: handle.id().to_string(),
            handle,
            pool_id: self.pool_id.clone(),
            acquired_at: Instant::now(),
            pool: Arc::downgrade(self),
            released: false,
        }
    }

    fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<Lease> {
        if timeout.is_zero() {
            return Err(PoolError::InvalidArgument(
                "acquire timeout must be greater than zero".to_string(),
            ));
        }

        let started = Instant::now();
        // Too far out to represent: wait without a deadline
        let deadline = started.checked_add(timeout);

        loop {
            if self.is_closed() {
                return Err(PoolError::ShutDown);
            }
            if expired(deadline) {
                return Err(self.exhausted(started));
            }

            while let Some(id) = self.queue.try_pop() {
                if let Some(lease) = self.checkout(&id, started, deadline)? {
                    return Ok(lease);
                }
                if expired(deadline) {
                    return Err(self.exhausted(started));
                }
            }

            if let Some(handle) = self.spawn_environment(RecordStatus::InUse) {
                let id = handle.id().to_string();
                if let Some(lease) = self.grant(&id, handle, started, deadline)? {
                    return Ok(lease);
                }
                continue;
            }

            match self.queue.pop_until(deadline, &self.shutdown_rx) {
                PopOutcome::Item(id) => {
                    if let Some(lease) = self.checkout(&id, started, deadline)? {
                        return Ok(lease);
                    }
                }
                PopOutcome::TimedOut => return Err(self.exhausted(started)),
                PopOutcome::Cancelled => return Err(PoolError::ShutDown),
            }
        }
    }

    fn exhausted(&self, started: Instant) -> PoolError {
        let waited = started.elapsed();
        {
            let mut state = self.state.lock();
            state.counters.acquire_timeouts += 1;
        }
        pool_metrics::record_acquire_timeout(&self.pool_id);
        warn!(
            pool_id = %self.pool_id,
            wait_ms = waited.as_millis() as u64,
            "No environment available before the deadline"
        );
        PoolError::PoolExhausted { waited }
    }

    /// Take an environment back from a lease: reset, deep check, requeue
    pub(crate) fn release(&self, id: &str) {
        let handle = {
            let mut state = self.state.lock();
            match state.records.get_mut(id) {
                Some(record) if record.status == RecordStatus::InUse => {
                    record.status = RecordStatus::Resetting;
                    record.last_used = Instant::now();
                    Arc::clone(&record.handle)
                }
                Some(record) => {
                    warn!(
                        pool_id = %self.pool_id,
                        env_id = %id,
                        status = %record.status,
                        "Ignoring release of an environment that is not leased"
                    );
                    return;
                }
                None => {
                    debug!(pool_id = %self.pool_id, env_id = %id, "Ignoring release of unknown environment");
                    return;
                }
            }
        };

        let started = Instant::now();

        if let Err(failure) = self.resetter.reset(handle.as_ref()) {
            {
                let mut state = self.state.lock();
                state.counters.reset_failures += 1;
            }
            pool_metrics::record_reset(&self.pool_id, false);
            warn!(pool_id = %self.pool_id, env_id = %id, reason = %failure, "Reset failed");
            self.destroy_and_replace(id);
            return;
        }

        if let Err(reason) = self.checker.deep(handle.as_ref()) {
            {
                let mut state = self.state.lock();
                state.counters.health_check_failures += 1;
            }
            pool_metrics::record_health_failure(&self.pool_id, CheckTier::Deep);
            warn!(pool_id = %self.pool_id, env_id = %id, reason = %reason, "Deep check after reset failed");
            self.destroy_and_replace(id);
            return;
        }

        let mut state = self.state.lock();
        match state.records.get_mut(id) {
            Some(record) if record.status == RecordStatus::Resetting => record.make_available(),
            _ => return,
        }
        state.counters.total_resets += 1;

        if let Err(id) = self.queue.push(id.to_string()) {
            warn!(pool_id = %self.pool_id, env_id = %id, "Available queue full, destroying returned environment");
            let record = state.detach(&id);
            drop(state);
            if let Some(record) = record {
                self.cleanup(record.handle.as_ref());
                pool_metrics::record_destroyed(&self.pool_id);
            }
            return;
        }
        self.publish_occupancy(&state);
        drop(state);

        pool_metrics::record_reset(&self.pool_id, true);
        info!(
            pool_id = %self.pool_id,
            env_id = %id,
            reset_ms = started.elapsed().as_millis() as u64,
            "Environment released"
        );
    }

    fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let state = self.state.lock();

        let mut environments: Vec<EnvironmentSnapshot> = state
            .records
            .values()
            .map(|record| EnvironmentSnapshot::from_record(record, now))
            .collect();
        environments.sort_by(|a, b| a.id.cmp(&b.id));

        let counters = state.counters;
        PoolStats {
            pool_id: self.pool_id.clone(),
            min_size: self.config.min_size,
            max_size: self.config.max_size,
            available_count: state.available(),
            in_use_count: state.outstanding(),
            total_count: state.records.len(),
            total_created: counters.total_created,
            total_destroyed: counters.total_destroyed,
            total_leases: counters.total_leases,
            total_resets: counters.total_resets,
            health_check_failures: counters.health_check_failures,
            reset_failures: counters.reset_failures,
            acquire_timeouts: counters.acquire_timeouts,
            shut_down: self.is_closed(),
            environments,
        }
    }

    /// Wait for outstanding leases, up to the drain deadline
    fn drain(&self) {
        let deadline = Instant::now() + self.config.shutdown_drain();
        loop {
            let outstanding = self.state.lock().outstanding();
            if outstanding == 0 {
                return;
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    pool_id = %self.pool_id,
                    outstanding,
                    "Drain deadline passed, destroying leased environments"
                );
                return;
            }

            debug!(pool_id = %self.pool_id, outstanding, "Waiting for leases to drain");
            thread::sleep(DRAIN_POLL.min(deadline - now));
        }
    }

    /// Destroy every remaining environment
    fn destroy_all(&self) -> usize {
        let records: Vec<EnvironmentRecord> = {
            let mut state = self.state.lock();
            self.queue.drain();
            let ids: Vec<String> = state.records.keys().cloned().collect();
            let records = ids.iter().filter_map(|id| state.detach(id)).collect();
            self.publish_occupancy(&state);
            records
        };

        let count = records.len();
        thread::scope(|scope| {
            for record in &records {
                scope.spawn(move || {
                    self.cleanup(record.handle.as_ref());
                    pool_metrics::record_destroyed(&self.pool_id);
                });
            }
        });
        count
    }
}

/// Manager of a pool of pre-warmed isolated environments
pub struct PoolManager {
    inner: Arc<PoolInner>,
    reconciler: Mutex<Option<Reconciler>>,
}

impl PoolManager {
    /// Validate the config, warm up `initial_size` environments in parallel
    /// and start the background reconciler
    pub fn start(
        config: PoolConfig,
        runtime: Arc<dyn ContainerRuntime>,
        spec: CreateSpec,
    ) -> Result<Self> {
        config.validate().map_err(PoolError::Config)?;
        spec.limits.validate().map_err(PoolError::Config)?;
        spec.security.validate().map_err(PoolError::Config)?;

        let pool_id = short_pool_id();
        let (shutdown_tx, shutdown_rx) = unbounded();

        let inner = Arc::new(PoolInner {
            checker: HealthChecker::new(&config),
            resetter: Resetter::new(&config, &spec.security.scratch_path),
            queue: AvailableQueue::new(config.max_size),
            spec: spec.with_label(POOL_ID_LABEL, pool_id.clone()),
            pool_id,
            config,
            runtime,
            state: Mutex::new(PoolState::default()),
            closed: AtomicBool::new(false),
            shutdown_rx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
        });

        let started = Instant::now();
        let warmed = thread::scope(|scope| {
            let workers: Vec<_> = (0..inner.config.initial_size)
                .map(|_| scope.spawn(|| inner.spawn_environment(RecordStatus::Available)))
                .collect();
            workers
                .into_iter()
                .map(|worker| worker.join())
                .filter(|created| matches!(created, Ok(Some(_))))
                .count()
        });

        if warmed < inner.config.initial_size {
            warn!(
                pool_id = %inner.pool_id,
                warmed,
                requested = inner.config.initial_size,
                "Pool warm-up created fewer environments than requested"
            );
        }
        info!(
            pool_id = %inner.pool_id,
            warmed,
            max_size = inner.config.max_size,
            warmup_ms = started.elapsed().as_millis() as u64,
            "Pool started"
        );

        let reconciler = Reconciler::start(Arc::clone(&inner)).map_err(|e| {
            PoolError::Config(format!("failed to spawn background threads: {}", e))
        })?;

        Ok(Self {
            inner,
            reconciler: Mutex::new(Some(reconciler)),
        })
    }

    pub fn pool_id(&self) -> &str {
        &self.inner.pool_id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.is_closed()
    }

    /// Lease a healthy environment, waiting at most `timeout`
    ///
    /// A zero timeout is rejected with [`PoolError::InvalidArgument`] before
    /// the pool or the runtime is touched.
    pub fn acquire(&self, timeout: Duration) -> Result<Lease> {
        self.inner.acquire(timeout)
    }

    /// Lease with the configured default timeout
    pub fn acquire_default(&self) -> Result<Lease> {
        self.inner.acquire(self.inner.config.default_acquire_timeout())
    }

    /// Return a lease; the environment is reset and verified before reuse
    ///
    /// Leases of another pool are handed back to their own pool instead.
    pub fn release(&self, mut lease: Lease) {
        if lease.pool_id != self.inner.pool_id {
            warn!(
                pool_id = %self.inner.pool_id,
                lease_pool = %lease.pool_id,
                env_id = %lease.id,
                "Lease belongs to another pool"
            );
            return;
        }
        lease.released = true;
        self.inner.release(&lease.id);
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> PoolStats {
        self.inner.stats()
    }

    /// Run one health sweep now
    pub fn run_health_sweep(&self) -> SweepReport {
        self.inner.health_sweep()
    }

    /// Run one idle reclamation pass now; returns the number reclaimed
    pub fn run_idle_reclamation(&self) -> usize {
        self.inner.reclaim_idle()
    }

    /// Check the pool's structural invariants
    ///
    /// Holds the pool lock and briefly empties the available queue, so
    /// concurrent acquirers may see it empty and wait or create on demand.
    /// Meant for tests and debugging, not for a serving pool.
    pub fn verify_invariants(&self) -> std::result::Result<(), String> {
        let state = self.inner.state.lock();

        if state.records.len() > self.inner.config.max_size {
            return Err(format!(
                "{} records exceed max_size {}",
                state.records.len(),
                self.inner.config.max_size
            ));
        }

        let counters = state.counters;
        if counters.total_created - counters.total_destroyed != state.records.len() as u64 {
            return Err(format!(
                "created {} - destroyed {} != {} records",
                counters.total_created,
                counters.total_destroyed,
                state.records.len()
            ));
        }

        let queued = self.inner.queue.drain();
        let mut result = Ok(());
        for (i, id) in queued.iter().enumerate() {
            if queued[..i].contains(id) {
                result = Err(format!("{} queued twice", id));
            }
            match state.records.get(id) {
                Some(record) if record.status == RecordStatus::Available => {}
                Some(record) => result = Err(format!("{} queued while {}", id, record.status)),
                None => result = Err(format!("{} queued without a record", id)),
            }
        }
        for id in queued {
            if let Err(id) = self.inner.queue.push(id) {
                error!(pool_id = %self.inner.pool_id, env_id = %id, "Could not requeue environment after inspection");
                result = Err(format!("{} lost while inspecting the queue", id));
            }
        }
        result
    }

    /// Stop background loops, drain leases, destroy everything and close the runtime
    ///
    /// Safe to call more than once; later calls return immediately.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let started = Instant::now();
        info!(pool_id = %self.inner.pool_id, "Shutting down pool");

        self.inner.shutdown_tx.lock().take();

        if let Some(reconciler) = self.reconciler.lock().take() {
            reconciler.stop(self.inner.config.background_join_grace());
        }

        self.inner.drain();
        let destroyed = self.inner.destroy_all();

        if let Err(e) = self.inner.runtime.close() {
            warn!(pool_id = %self.inner.pool_id, error = %e, "Failed to close runtime");
        }

        info!(
            pool_id = %self.inner.pool_id,
            destroyed,
            shutdown_ms = started.elapsed().as_millis() as u64,
            "Pool shut down"
        );
    }
}

impl Drop for PoolManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Exclusive use of one environment until released
///
/// Dropping a lease without [`PoolManager::release`] returns it to its pool.
pub struct Lease {
    id: String,
    handle: Arc<dyn EnvironmentHandle>,
    pool_id: String,
    acquired_at: Instant,
    pool: Weak<PoolInner>,
    released: bool,
}

impl Lease {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    pub fn handle(&self) -> &dyn EnvironmentHandle {
        self.handle.as_ref()
    }

    /// Time since the lease was granted
    pub fn held_for(&self) -> Duration {
        self.acquired_at.elapsed()
    }

    /// Run a command in the leased environment
    ///
    /// Runtime failures become [`PoolError::ExecutionFailure`]; a command
    /// that runs and exits non-zero is a successful call.
    pub fn run(&self, command: &[String], timeout: Duration) -> Result<CommandOutput> {
        self.handle
            .run(command, timeout)
            .map_err(|e| PoolError::execution(command, e))
    }
}

impl std::fmt::Debug for Lease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("id", &self.id)
            .field("pool_id", &self.pool_id)
            .field("held_for", &self.held_for())
            .finish()
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Some(pool) = self.pool.upgrade() {
            debug!(pool_id = %self.pool_id, env_id = %self.id, "Lease dropped, returning environment");
            pool.release(&self.id);
        }
    }
}

fn expired(deadline: Option<Instant>) -> bool {
    deadline.map_or(false, |deadline| Instant::now() >= deadline)
}

/// Time left before `deadline`; `None` when there is no deadline
fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}

/// Random suffix of a ULID, short enough for log lines and labels
fn short_pool_id() -> String {
    let ulid = Ulid::new().to_string().to_ascii_lowercase();
    ulid[ulid.len() - 10..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{MemoryRuntime, ResetFault};

    fn test_config(initial: usize, min: usize, max: usize) -> PoolConfig {
        PoolConfig {
            initial_size: initial,
            min_size: min,
            max_size: max,
            shutdown_drain_ms: 200,
            background_join_grace_ms: 500,
            ..Default::default()
        }
    }

    fn start(config: PoolConfig) -> (MemoryRuntime, PoolManager) {
        let runtime = MemoryRuntime::new();
        let pool = PoolManager::start(config, Arc::new(runtime.clone()), CreateSpec::default())
            .unwrap();
        (runtime, pool)
    }

    #[test]
    fn test_warm_up_fills_initial_size() {
        let (runtime, pool) = start(test_config(3, 1, 5));
        let stats = pool.stats();

        assert_eq!(stats.total_count, 3);
        assert_eq!(stats.available_count, 3);
        assert_eq!(stats.total_created, 3);
        assert_eq!(runtime.live_containers(), 3);
        assert!(pool.verify_invariants().is_ok());
    }

    #[test]
    fn test_environments_are_labelled() {
        let (_runtime, pool) = start(test_config(1, 1, 1));
        assert_eq!(pool.inner.spec.labels.get(POOL_ID_LABEL).map(String::as_str), Some(pool.pool_id()));
    }

    #[test]
    fn test_zero_timeout_is_invalid() {
        let (runtime, pool) = start(test_config(1, 1, 1));
        let calls = runtime.calls();

        let result = pool.acquire(Duration::ZERO);
        assert!(matches!(result, Err(PoolError::InvalidArgument(_))));
        assert_eq!(runtime.calls(), calls);
        assert_eq!(pool.stats().total_leases, 0);
    }

    #[test]
    fn test_acquire_release_cycle() {
        let (_runtime, pool) = start(test_config(1, 1, 1));

        let lease = pool.acquire(Duration::from_secs(1)).unwrap();
        let id = lease.id().to_string();
        let stats = pool.stats();
        assert_eq!(stats.in_use_count, 1);
        assert_eq!(stats.environments[0].execution_count, 1);

        pool.release(lease);
        let stats = pool.stats();
        assert_eq!(stats.available_count, 1);
        assert_eq!(stats.total_resets, 1);
        assert_eq!(stats.total_leases, 1);
        assert_eq!(stats.environments[0].id, id);
        assert_eq!(stats.environments[0].execution_count, 1);
    }

    #[test]
    fn test_creates_on_demand_up_to_max() {
        let (_runtime, pool) = start(test_config(0, 0, 2));

        let a = pool.acquire(Duration::from_millis(100)).unwrap();
        let b = pool.acquire(Duration::from_millis(100)).unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.stats().total_created, 2);

        let third = pool.acquire(Duration::from_millis(50));
        assert!(matches!(third, Err(PoolError::PoolExhausted { .. })));
        assert_eq!(pool.stats().acquire_timeouts, 1);

        pool.release(a);
        pool.release(b);
    }

    #[test]
    fn test_unhealthy_dequeue_is_destroyed_without_replacement() {
        let (runtime, pool) = start(test_config(1, 0, 1));
        let id = pool.stats().environments[0].id.clone();
        runtime.container(&id).unwrap().crash();

        // The crashed one is discarded, a fresh one is created on demand
        let lease = pool.acquire(Duration::from_secs(1)).unwrap();
        assert_ne!(lease.id(), id);

        let stats = pool.stats();
        assert_eq!(stats.total_destroyed, 1);
        assert_eq!(stats.total_created, 2);
        assert_eq!(stats.health_check_failures, 1);
        pool.release(lease);
    }

    #[test]
    fn test_reset_failure_replaces_environment() {
        let (runtime, pool) = start(test_config(1, 1, 1));
        let lease = pool.acquire(Duration::from_secs(1)).unwrap();
        let id = lease.id().to_string();
        runtime
            .container(&id)
            .unwrap()
            .set_reset_fault(Some(ResetFault::MissingSentinel));

        pool.release(lease);

        let stats = pool.stats();
        assert_eq!(stats.total_count, 1);
        assert_eq!(stats.available_count, 1);
        assert_eq!(stats.reset_failures, 1);
        assert_ne!(stats.environments[0].id, id);
        assert!(runtime.container(&id).is_none());
        assert!(pool.verify_invariants().is_ok());
    }

    #[test]
    fn test_dropped_lease_returns_to_pool() {
        let (_runtime, pool) = start(test_config(1, 1, 1));
        {
            let _lease = pool.acquire(Duration::from_secs(1)).unwrap();
            assert_eq!(pool.stats().in_use_count, 1);
        }
        let stats = pool.stats();
        assert_eq!(stats.in_use_count, 0);
        assert_eq!(stats.total_resets, 1);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (runtime, pool) = start(test_config(2, 1, 2));
        pool.shutdown();
        pool.shutdown();

        assert!(pool.is_shut_down());
        assert_eq!(pool.stats().total_count, 0);
        assert!(runtime.is_closed());
        assert_eq!(runtime.live_containers(), 0);
        assert!(matches!(
            pool.acquire(Duration::from_millis(10)),
            Err(PoolError::ShutDown)
        ));
    }

    #[test]
    fn test_unbounded_timeout_acquires() {
        let (_runtime, pool) = start(test_config(1, 1, 1));

        let lease = pool.acquire(Duration::MAX).unwrap();
        assert_eq!(pool.stats().in_use_count, 1);
        pool.release(lease);

        let lease = pool.acquire(Duration::from_secs(u64::MAX)).unwrap();
        pool.release(lease);
        assert_eq!(pool.stats().total_leases, 2);
    }

    #[test]
    fn test_verify_invariants_keeps_queue_intact() {
        let (_runtime, pool) = start(test_config(3, 1, 3));
        let before: Vec<String> = pool.stats().environments.into_iter().map(|e| e.id).collect();

        assert!(pool.verify_invariants().is_ok());
        assert!(pool.verify_invariants().is_ok());

        assert_eq!(pool.inner.queue.len(), 3);
        for id in &before {
            assert!(pool.inner.queue.contains(id));
        }
        let leases: Vec<Lease> = (0..3)
            .map(|_| pool.acquire(Duration::from_millis(100)).unwrap())
            .collect();
        assert_eq!(pool.stats().in_use_count, 3);
        for lease in leases {
            pool.release(lease);
        }
    }

    #[test]
    fn test_short_pool_id() {
        let a = short_pool_id();
        assert_eq!(a.len(), 10);
        assert_ne!(a, short_pool_id());
    }
}
