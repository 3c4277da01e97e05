// packages/pool/src/runtime/memory.rs
//! In-process container runtime
//!
//! A fake runtime that keeps every "container" in memory and understands the
//! pool's own probe commands (echo, reset script, process count, rootfs
//! write probe). Faults can be injected per container or runtime-wide, so
//! the pool's self-healing paths can be exercised without a container engine.

use crate::pool::health::{PROCESS_COUNT_SCRIPT, ROOTFS_PROBE_PATH};
use crate::pool::reset::RESET_SENTINEL;
use crate::runtime::{
    CommandOutput, ContainerRuntime, CreateSpec, EnvironmentHandle, EnvironmentState,
    ResourceStats,
};
use crate::utils::errors::RuntimeError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Processes visible in a freshly reset environment (keep-alive, shell, probe)
pub const IDLE_PROCESS_COUNT: u32 = 3;

/// Memory reported by an idle environment
const IDLE_MEMORY_BYTES: u64 = 16 * 1024 * 1024;

/// Handler for commands that are not pool probes
pub type ProgramHandler = Arc<dyn Fn(&[String]) -> CommandOutput + Send + Sync>;

/// Ways a reset script can misbehave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetFault {
    /// Script exits non-zero
    ExitNonZero,
    /// Script output lacks the sentinel
    MissingSentinel,
    /// Numeric fields are not numbers
    Garbled,
    /// Script never finishes within its timeout
    Hang,
}

struct Shared {
    next_id: AtomicU64,
    calls: AtomicU64,
    created: AtomicU64,
    removed: AtomicU64,
    closed: AtomicBool,
    fail_creates: AtomicBool,
    latency: Mutex<Duration>,
    handler: Mutex<Option<ProgramHandler>>,
    containers: Mutex<HashMap<String, Arc<MemoryContainer>>>,
}

impl Shared {
    /// Account for one runtime call and apply the simulated latency
    fn enter(&self, timeout: Option<Duration>) -> Result<(), RuntimeError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        if self.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::Closed);
        }

        let latency = *self.latency.lock();
        match timeout {
            Some(timeout) if latency > timeout => {
                thread::sleep(timeout);
                Err(RuntimeError::Timeout(timeout))
            }
            _ => {
                if !latency.is_zero() {
                    thread::sleep(latency);
                }
                Ok(())
            }
        }
    }
}

/// In-memory container runtime with fault injection
#[derive(Clone)]
pub struct MemoryRuntime {
    shared: Arc<Shared>,
}

impl MemoryRuntime {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                next_id: AtomicU64::new(1),
                calls: AtomicU64::new(0),
                created: AtomicU64::new(0),
                removed: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                fail_creates: AtomicBool::new(false),
                latency: Mutex::new(Duration::ZERO),
                handler: Mutex::new(None),
                containers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Route non-probe commands to `handler` instead of echoing the last argument
    pub fn with_handler<F>(self, handler: F) -> Self
    where
        F: Fn(&[String]) -> CommandOutput + Send + Sync + 'static,
    {
        *self.shared.handler.lock() = Some(Arc::new(handler));
        self
    }

    /// Make every subsequent `create` fail
    pub fn fail_creates(&self, fail: bool) {
        self.shared.fail_creates.store(fail, Ordering::Release);
    }

    /// Delay every runtime call by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.shared.latency.lock() = latency;
    }

    /// Look up a live container by id
    pub fn container(&self, id: &str) -> Option<Arc<MemoryContainer>> {
        self.shared.containers.lock().get(id).cloned()
    }

    /// Ids of every container that has not been removed
    pub fn container_ids(&self) -> Vec<String> {
        self.shared.containers.lock().keys().cloned().collect()
    }

    /// Number of containers that have not been removed
    pub fn live_containers(&self) -> usize {
        self.shared.containers.lock().len()
    }

    /// Total runtime calls, including creates and handle calls
    pub fn calls(&self) -> u64 {
        self.shared.calls.load(Ordering::Relaxed)
    }

    pub fn created(&self) -> u64 {
        self.shared.created.load(Ordering::Relaxed)
    }

    pub fn removed(&self) -> u64 {
        self.shared.removed.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl Default for MemoryRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerRuntime for MemoryRuntime {
    fn create(&self, spec: &CreateSpec) -> Result<Arc<dyn EnvironmentHandle>, RuntimeError> {
        self.shared.enter(None)?;

        if self.shared.fail_creates.load(Ordering::Acquire) {
            return Err(RuntimeError::CommandFailed {
                status: 125,
                stderr: "simulated create failure".to_string(),
            });
        }

        let n = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let container = Arc::new(MemoryContainer {
            id: format!("mem-{:06}", n),
            memory_limit_bytes: spec.limits.memory_limit_bytes(),
            shared: Arc::clone(&self.shared),
            state: Mutex::new(ContainerState::new()),
        });

        self.shared
            .containers
            .lock()
            .insert(container.id.clone(), Arc::clone(&container));
        self.shared.created.fetch_add(1, Ordering::Relaxed);

        Ok(container)
    }

    fn close(&self) -> Result<(), RuntimeError> {
        self.shared.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[derive(Debug)]
struct ContainerState {
    state: EnvironmentState,
    removed: bool,
    scratch_files: u32,
    stray_processes: u32,
    stuck_files: u32,
    stuck_processes: u32,
    memory_used_bytes: u64,
    writable_rootfs: bool,
    failing_probes: u32,
    flapping: bool,
    flap_next_fails: bool,
    reset_fault: Option<ResetFault>,
    runs: u64,
}

impl ContainerState {
    fn new() -> Self {
        Self {
            state: EnvironmentState::Running,
            removed: false,
            scratch_files: 0,
            stray_processes: 0,
            stuck_files: 0,
            stuck_processes: 0,
            memory_used_bytes: IDLE_MEMORY_BYTES,
            writable_rootfs: false,
            failing_probes: 0,
            flapping: false,
            flap_next_fails: true,
            reset_fault: None,
            runs: 0,
        }
    }

    fn process_count(&self) -> u32 {
        IDLE_PROCESS_COUNT + self.stray_processes + self.stuck_processes
    }

    /// Whether the next liveness probe should fail
    fn probe_fails(&mut self) -> bool {
        if self.failing_probes > 0 {
            self.failing_probes -= 1;
            return true;
        }
        if self.flapping {
            let fails = self.flap_next_fails;
            self.flap_next_fails = !fails;
            return fails;
        }
        false
    }
}

enum Probe {
    Echo(String),
    Reset,
    ProcessCount,
    RootfsWrite,
    Program,
}

fn classify(command: &[String]) -> Probe {
    match command {
        [first, rest @ ..] if first == "echo" => Probe::Echo(rest.join(" ")),
        [sh, flag, script] if sh == "sh" && flag == "-c" => {
            if script.contains(RESET_SENTINEL) {
                Probe::Reset
            } else if script == PROCESS_COUNT_SCRIPT {
                Probe::ProcessCount
            } else {
                Probe::Program
            }
        }
        [first, path] if first == "touch" && path == ROOTFS_PROBE_PATH => Probe::RootfsWrite,
        _ => Probe::Program,
    }
}

fn ok(stdout: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.into(),
        stderr: String::new(),
    }
}

fn failed(exit_code: i32, stderr: impl Into<String>) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: String::new(),
        stderr: stderr.into(),
    }
}

/// One in-memory environment
pub struct MemoryContainer {
    id: String,
    memory_limit_bytes: u64,
    shared: Arc<Shared>,
    state: Mutex<ContainerState>,
}

impl std::fmt::Debug for MemoryContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryContainer").field("id", &self.id).finish()
    }
}

impl MemoryContainer {
    /// Stop the keep-alive process as if the environment crashed
    pub fn crash(&self) {
        self.state.lock().state = EnvironmentState::Exited;
    }

    /// Leave files in scratch and background processes behind, as a tenant would
    pub fn leave_residue(&self, files: u32, processes: u32) {
        let mut state = self.state.lock();
        state.scratch_files += files;
        state.stray_processes += processes;
    }

    /// Residue that survives the reset script (undeletable files, unkillable processes)
    pub fn stick(&self, files: u32, processes: u32) {
        let mut state = self.state.lock();
        state.stuck_files = files;
        state.stuck_processes = processes;
    }

    pub fn set_reset_fault(&self, fault: Option<ResetFault>) {
        self.state.lock().reset_fault = fault;
    }

    pub fn set_writable_rootfs(&self, writable: bool) {
        self.state.lock().writable_rootfs = writable;
    }

    pub fn set_memory_used(&self, bytes: u64) {
        self.state.lock().memory_used_bytes = bytes;
    }

    /// Fail the next `count` liveness probes
    pub fn fail_probes(&self, count: u32) {
        self.state.lock().failing_probes = count;
    }

    /// Alternate failing and passing liveness probes, starting with a failure
    pub fn set_flapping(&self, flapping: bool) {
        let mut state = self.state.lock();
        state.flapping = flapping;
        state.flap_next_fails = true;
    }

    /// Commands run inside this container so far
    pub fn runs(&self) -> u64 {
        self.state.lock().runs
    }

    pub fn scratch_files(&self) -> u32 {
        self.state.lock().scratch_files
    }

    fn reset(&self, state: &mut ContainerState, timeout: Duration) -> Result<CommandOutput, RuntimeError> {
        match state.reset_fault {
            Some(ResetFault::ExitNonZero) => return Ok(failed(137, "killed")),
            Some(ResetFault::MissingSentinel) => {
                return Ok(ok("sh: can't fork\nfiles:0\nprocesses:3\n"))
            }
            Some(ResetFault::Garbled) => return Ok(ok(format!("{}\nfiles:zero\nprocesses:?\n", RESET_SENTINEL))),
            Some(ResetFault::Hang) => {
                thread::sleep(timeout);
                return Err(RuntimeError::Timeout(timeout));
            }
            None => {}
        }

        state.scratch_files = state.stuck_files;
        state.stray_processes = 0;

        Ok(ok(format!(
            "{}\nfiles:{}\nprocesses:{}\n",
            RESET_SENTINEL,
            state.scratch_files,
            state.process_count()
        )))
    }
}

impl EnvironmentHandle for MemoryContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&self, command: &[String], timeout: Duration) -> Result<CommandOutput, RuntimeError> {
        self.shared.enter(Some(timeout))?;

        let mut state = self.state.lock();
        if state.removed {
            return Err(RuntimeError::NotFound(self.id.clone()));
        }
        if state.state != EnvironmentState::Running {
            return Err(RuntimeError::CommandFailed {
                status: 1,
                stderr: format!("container {} is not running", self.id),
            });
        }
        state.runs += 1;

        match classify(command) {
            Probe::Echo(text) => {
                if state.probe_fails() {
                    Ok(failed(1, "probe failed"))
                } else {
                    Ok(ok(format!("{}\n", text)))
                }
            }
            Probe::Reset => self.reset(&mut state, timeout),
            Probe::ProcessCount => Ok(ok(format!("{}\n", state.process_count()))),
            Probe::RootfsWrite => {
                if state.writable_rootfs {
                    Ok(ok(""))
                } else {
                    Ok(failed(1, "touch: cannot touch: Read-only file system"))
                }
            }
            Probe::Program => {
                drop(state);
                let handler = self.shared.handler.lock().clone();
                Ok(match handler {
                    Some(handler) => handler(command),
                    None => ok(command.last().cloned().unwrap_or_default()),
                })
            }
        }
    }

    fn stats(&self) -> Result<ResourceStats, RuntimeError> {
        self.shared.enter(None)?;
        let state = self.state.lock();
        if state.removed {
            return Err(RuntimeError::NotFound(self.id.clone()));
        }
        Ok(ResourceStats {
            memory_used_bytes: state.memory_used_bytes,
            memory_limit_bytes: self.memory_limit_bytes,
            pids: Some(state.process_count() as u64),
        })
    }

    fn status(&self) -> Result<EnvironmentState, RuntimeError> {
        self.shared.enter(None)?;
        let state = self.state.lock();
        if state.removed {
            return Err(RuntimeError::NotFound(self.id.clone()));
        }
        Ok(state.state)
    }

    fn stop(&self, timeout: Duration) -> Result<(), RuntimeError> {
        self.shared.enter(Some(timeout))?;
        let mut state = self.state.lock();
        if state.removed {
            return Err(RuntimeError::NotFound(self.id.clone()));
        }
        state.state = EnvironmentState::Exited;
        Ok(())
    }

    fn remove(&self, force: bool) -> Result<(), RuntimeError> {
        self.shared.enter(None)?;
        {
            let mut state = self.state.lock();
            if state.removed {
                return Err(RuntimeError::NotFound(self.id.clone()));
            }
            if state.state == EnvironmentState::Running && !force {
                return Err(RuntimeError::CommandFailed {
                    status: 1,
                    stderr: "cannot remove a running container without force".to_string(),
                });
            }
            state.removed = true;
        }

        self.shared.containers.lock().remove(&self.id);
        self.shared.removed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::shell;

    fn cmd(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_create_and_remove() {
        let runtime = MemoryRuntime::new();
        let handle = runtime.create(&CreateSpec::default()).unwrap();

        assert_eq!(runtime.live_containers(), 1);
        assert_eq!(handle.status().unwrap(), EnvironmentState::Running);

        handle.stop(Duration::from_secs(1)).unwrap();
        handle.remove(true).unwrap();

        assert_eq!(runtime.live_containers(), 0);
        assert_eq!(runtime.removed(), 1);
        assert!(matches!(handle.status(), Err(RuntimeError::NotFound(_))));
    }

    #[test]
    fn test_echo_probe_and_failures() {
        let runtime = MemoryRuntime::new();
        let handle = runtime.create(&CreateSpec::default()).unwrap();
        let container = runtime.container(handle.id()).unwrap();

        let echo = cmd(&["echo", "ok"]);
        assert_eq!(handle.run(&echo, Duration::from_secs(1)).unwrap().stdout, "ok\n");

        container.fail_probes(1);
        assert!(!handle.run(&echo, Duration::from_secs(1)).unwrap().success());
        assert!(handle.run(&echo, Duration::from_secs(1)).unwrap().success());
    }

    #[test]
    fn test_reset_clears_residue() {
        let runtime = MemoryRuntime::new();
        let handle = runtime.create(&CreateSpec::default()).unwrap();
        let container = runtime.container(handle.id()).unwrap();

        container.leave_residue(4, 2);
        let script = shell(format!("echo {}", RESET_SENTINEL));
        let output = handle.run(&script, Duration::from_secs(1)).unwrap();

        assert!(output.stdout.starts_with(RESET_SENTINEL));
        assert!(output.stdout.contains("files:0"));
        assert_eq!(container.scratch_files(), 0);
    }

    #[test]
    fn test_latency_beyond_timeout() {
        let runtime = MemoryRuntime::new();
        let handle = runtime.create(&CreateSpec::default()).unwrap();
        runtime.set_latency(Duration::from_millis(200));

        let result = handle.run(&cmd(&["echo", "ok"]), Duration::from_millis(20));
        assert!(matches!(result, Err(RuntimeError::Timeout(_))));
    }

    #[test]
    fn test_closed_runtime_rejects_calls() {
        let runtime = MemoryRuntime::new();
        runtime.close().unwrap();
        assert!(matches!(
            runtime.create(&CreateSpec::default()),
            Err(RuntimeError::Closed)
        ));
    }

    #[test]
    fn test_custom_program_handler() {
        let runtime = MemoryRuntime::new().with_handler(|_| CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "Traceback".to_string(),
        });
        let handle = runtime.create(&CreateSpec::default()).unwrap();

        let output = handle
            .run(&cmd(&["python3", "-c", "raise SystemExit(1)"]), Duration::from_secs(1))
            .unwrap();
        assert_eq!(output.exit_code, 1);
        assert_eq!(output.stderr, "Traceback");
    }
}
