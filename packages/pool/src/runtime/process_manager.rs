// packages/pool/src/runtime/process_manager.rs
//! Blocking process execution with hard timeouts
//!
//! Used by the Docker adapter to drive the runtime CLI. Every call is
//! bounded: when the deadline passes the child is killed and reaped and the
//! call reports [`RuntimeError::Timeout`].

use crate::runtime::CommandOutput;
use crate::utils::errors::RuntimeError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

/// Upper bound on bytes kept from a single stdout/stderr stream
const MAX_CAPTURE_BYTES: usize = 1024 * 1024;

/// Process manager for running runtime CLI commands
pub struct ProcessManager {
    /// Paths to executables (cached)
    executable_paths: Mutex<HashMap<String, PathBuf>>,

    /// Bytes kept per stream
    capture_limit: usize,
}

impl ProcessManager {
    /// Create a new process manager
    pub fn new() -> Self {
        Self {
            executable_paths: Mutex::new(HashMap::new()),
            capture_limit: MAX_CAPTURE_BYTES,
        }
    }

    /// Find an executable, either an explicit path or a name on `PATH`
    pub fn find_executable(&self, program: &str) -> Result<PathBuf, RuntimeError> {
        if let Some(path) = self.executable_paths.lock().get(program) {
            return Ok(path.clone());
        }

        let candidate = Path::new(program);
        let path = if candidate.is_absolute() {
            if !candidate.exists() {
                return Err(RuntimeError::ExecutableNotFound(program.to_string()));
            }
            candidate.to_path_buf()
        } else {
            which::which(program).map_err(|e| {
                RuntimeError::ExecutableNotFound(format!("'{}' not found in PATH: {}", program, e))
            })?
        };

        info!("Found {} at {:?}", program, path);
        self.executable_paths
            .lock()
            .insert(program.to_string(), path.clone());
        Ok(path)
    }

    /// Run `program args...` to completion, killing it after `timeout`
    pub fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
    ) -> Result<CommandOutput, RuntimeError> {
        debug!("Running {:?} {}", program, args.join(" "));

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| RuntimeError::Spawn {
                program: program.display().to_string(),
                source: e,
            })?;

        // Drain both pipes concurrently so a chatty child never blocks on a full pipe
        let stdout = spawn_pipe_reader(child.stdout.take(), self.capture_limit);
        let stderr = spawn_pipe_reader(child.stderr.take(), self.capture_limit);

        let status = match child.wait_timeout(timeout)? {
            Some(status) => status,
            None => {
                warn!("{:?} exceeded {:?}, killing it", program, timeout);
                if let Err(e) = child.kill() {
                    warn!("Failed to kill timed out child: {}", e);
                }
                let _ = child.wait();
                // Grandchildren may still hold the pipes open; detach the readers
                drop(stdout);
                drop(stderr);
                return Err(RuntimeError::Timeout(timeout));
            }
        };

        let stdout = collect_pipe(stdout)?;
        let stderr = collect_pipe(stderr)?;

        Ok(CommandOutput {
            // Killed by a signal: report the shell convention 128 + n when known
            exit_code: status.code().unwrap_or_else(|| signal_exit_code(&status)),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_pipe_reader<R>(pipe: Option<R>, limit: usize) -> Option<JoinHandle<std::io::Result<Vec<u8>>>>
where
    R: Read + Send + 'static,
{
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut kept = Vec::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = pipe.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                let room = limit.saturating_sub(kept.len());
                kept.extend_from_slice(&buf[..n.min(room)]);
            }
            Ok(kept)
        })
    })
}

fn collect_pipe(
    handle: Option<JoinHandle<std::io::Result<Vec<u8>>>>,
) -> Result<Vec<u8>, RuntimeError> {
    match handle {
        Some(handle) => match handle.join() {
            Ok(result) => Ok(result?),
            Err(_) => Err(RuntimeError::Parse("pipe reader thread panicked".to_string())),
        },
        None => Ok(Vec::new()),
    }
}

#[cfg(unix)]
fn signal_exit_code(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|sig| 128 + sig).unwrap_or(-1)
}

#[cfg(not(unix))]
fn signal_exit_code(_status: &std::process::ExitStatus) -> i32 {
    -1
}
