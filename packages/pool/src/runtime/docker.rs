// packages/pool/src/runtime/docker.rs
//! Docker CLI adapter
//!
//! Implements the runtime capability traits by shelling out to the `docker`
//! binary. Every call is bounded by a timeout enforced on the CLI process.
//!
//! A timed-out `docker exec` only kills the CLI client; the process inside
//! the container keeps running until the next reset kills it.

use crate::runtime::process_manager::ProcessManager;
use crate::runtime::{
    CommandOutput, ContainerRuntime, CreateSpec, EnvironmentHandle, EnvironmentState,
    ResourceStats,
};
use crate::utils::errors::RuntimeError;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Shared state between the runtime and the handles it created
struct DockerClient {
    binary: PathBuf,
    processes: ProcessManager,
    call_timeout: Duration,
    closed: AtomicBool,
}

impl DockerClient {
    fn invoke(&self, args: &[String], timeout: Duration) -> Result<CommandOutput, RuntimeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RuntimeError::Closed);
        }
        self.processes.run(&self.binary, args, timeout)
    }

    /// Invoke and require a zero exit status
    fn invoke_ok(&self, args: &[String], timeout: Duration) -> Result<CommandOutput, RuntimeError> {
        let output = self.invoke(args, timeout)?;
        if output.success() {
            Ok(output)
        } else {
            Err(RuntimeError::CommandFailed {
                status: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Container runtime backed by the docker CLI
pub struct DockerRuntime {
    client: Arc<DockerClient>,
    create_timeout: Duration,
}

impl DockerRuntime {
    /// Locate the docker binary and build a runtime
    pub fn new(
        binary: &str,
        create_timeout: Duration,
        call_timeout: Duration,
    ) -> Result<Self, RuntimeError> {
        let processes = ProcessManager::new();
        let binary = processes.find_executable(binary)?;

        info!("Using container runtime at {:?}", binary);

        Ok(Self {
            client: Arc::new(DockerClient {
                binary,
                processes,
                call_timeout,
                closed: AtomicBool::new(false),
            }),
            create_timeout,
        })
    }

    /// Full argument list for `docker run`
    pub fn run_args(spec: &CreateSpec) -> Vec<String> {
        let mut args = vec!["run".to_string(), "-d".to_string()];

        for (key, value) in &spec.labels {
            args.push("--label".to_string());
            args.push(format!("{}={}", key, value));
        }

        args.extend(spec.limits.docker_args());
        args.extend(spec.security.docker_args());
        args.push(spec.image.clone());
        args.extend(spec.keep_alive.iter().cloned());
        args
    }
}

impl ContainerRuntime for DockerRuntime {
    fn create(&self, spec: &CreateSpec) -> Result<Arc<dyn EnvironmentHandle>, RuntimeError> {
        let output = self
            .client
            .invoke_ok(&Self::run_args(spec), self.create_timeout)?;

        let id = output.stdout.trim().to_string();
        if id.is_empty() {
            return Err(RuntimeError::Parse(
                "docker run printed no container id".to_string(),
            ));
        }

        debug!("Started container {}", short_id(&id));

        Ok(Arc::new(DockerContainer {
            id,
            client: Arc::clone(&self.client),
        }))
    }

    fn close(&self) -> Result<(), RuntimeError> {
        self.client.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// One container started by [`DockerRuntime`]
pub struct DockerContainer {
    id: String,
    client: Arc<DockerClient>,
}

impl std::fmt::Debug for DockerContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerContainer")
            .field("id", &short_id(&self.id))
            .finish()
    }
}

impl DockerContainer {
    fn args(&self, parts: &[&str]) -> Vec<String> {
        let mut args: Vec<String> = parts.iter().map(|s| s.to_string()).collect();
        args.push(self.id.clone());
        args
    }

    fn not_found_or(&self, err: RuntimeError) -> RuntimeError {
        match err {
            RuntimeError::CommandFailed { ref stderr, .. } if stderr.contains("No such") => {
                RuntimeError::NotFound(self.id.clone())
            }
            other => other,
        }
    }
}

impl EnvironmentHandle for DockerContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn run(&self, command: &[String], timeout: Duration) -> Result<CommandOutput, RuntimeError> {
        let mut args = vec!["exec".to_string(), self.id.clone()];
        args.extend(command.iter().cloned());
        let output = self.client.invoke(&args, timeout)?;
        exec_output(output).map_err(|e| self.not_found_or(e))
    }

    fn stats(&self) -> Result<ResourceStats, RuntimeError> {
        let output = self
            .client
            .invoke_ok(
                &self.args(&["stats", "--no-stream", "--format", "{{json .}}"]),
                self.client.call_timeout,
            )
            .map_err(|e| self.not_found_or(e))?;

        parse_stats_line(output.stdout.trim())
    }

    fn status(&self) -> Result<EnvironmentState, RuntimeError> {
        let output = self
            .client
            .invoke_ok(
                &self.args(&["inspect", "-f", "{{.State.Status}}"]),
                self.client.call_timeout,
            )
            .map_err(|e| self.not_found_or(e))?;

        Ok(EnvironmentState::parse(&output.stdout))
    }

    fn stop(&self, timeout: Duration) -> Result<(), RuntimeError> {
        let grace = timeout.as_secs().max(1).to_string();
        self.client
            .invoke_ok(
                &self.args(&["stop", "-t", grace.as_str()]),
                timeout + self.client.call_timeout,
            )
            .map_err(|e| self.not_found_or(e))?;
        Ok(())
    }

    fn remove(&self, force: bool) -> Result<(), RuntimeError> {
        let args = if force {
            self.args(&["rm", "-f"])
        } else {
            self.args(&["rm"])
        };
        self.client
            .invoke_ok(&args, self.client.call_timeout)
            .map_err(|e| self.not_found_or(e))?;
        Ok(())
    }
}

/// Exit statuses `docker exec` reserves for its own failures
const EXEC_CLI_FAILURE: i32 = 125;
const EXEC_NOT_EXECUTABLE: i32 = 126;
const EXEC_NOT_FOUND: i32 = 127;

const DAEMON_ERROR_PREFIX: &str = "Error response from daemon";

/// Separate failures of `docker exec` itself from the command's own exit status
///
/// A dead container, a missing interpreter or a daemon error is a runtime
/// failure; anything else is the command's result, however it exited.
fn exec_output(output: CommandOutput) -> Result<CommandOutput, RuntimeError> {
    let reserved = matches!(
        output.exit_code,
        EXEC_CLI_FAILURE | EXEC_NOT_EXECUTABLE | EXEC_NOT_FOUND
    );
    if reserved || output.stderr.trim_start().starts_with(DAEMON_ERROR_PREFIX) {
        return Err(RuntimeError::CommandFailed {
            status: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(output)
}

/// One line of `docker stats --format '{{json .}}'`
#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "MemUsage")]
    mem_usage: String,

    #[serde(rename = "PIDs", default)]
    pids: Option<String>,
}

fn parse_stats_line(line: &str) -> Result<ResourceStats, RuntimeError> {
    let parsed: StatsLine = serde_json::from_str(line)
        .map_err(|e| RuntimeError::Parse(format!("docker stats: {}", e)))?;

    // "12.5MiB / 128MiB"
    let (used, limit) = parsed
        .mem_usage
        .split_once('/')
        .ok_or_else(|| RuntimeError::Parse(format!("MemUsage '{}'", parsed.mem_usage)))?;

    Ok(ResourceStats {
        memory_used_bytes: parse_size(used)?,
        memory_limit_bytes: parse_size(limit)?,
        pids: parsed.pids.and_then(|p| p.trim().parse().ok()),
    })
}

/// Parse a docker human-readable size such as `12.5MiB` or `3kB`
fn parse_size(raw: &str) -> Result<u64, RuntimeError> {
    let raw = raw.trim();
    let split = raw
        .find(|c: char| c.is_ascii_alphabetic())
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);

    let value: f64 = number
        .trim()
        .parse()
        .map_err(|_| RuntimeError::Parse(format!("size '{}'", raw)))?;

    let multiplier: f64 = match unit {
        "" | "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        _ => return Err(RuntimeError::Parse(format!("size unit '{}'", unit))),
    };

    Ok((value * multiplier).round() as u64)
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("0B").unwrap(), 0);
        assert_eq!(parse_size("1KiB").unwrap(), 1024);
        assert_eq!(parse_size("1.5MiB").unwrap(), 1_572_864);
        assert_eq!(parse_size(" 128MiB ").unwrap(), 134_217_728);
        assert_eq!(parse_size("3kB").unwrap(), 3000);
        assert!(parse_size("lots").is_err());
        assert!(parse_size("12XB").is_err());
    }

    #[test]
    fn test_parse_stats_line() {
        let line = r#"{"BlockIO":"0B / 0B","MemUsage":"12MiB / 128MiB","PIDs":"3"}"#;
        let stats = parse_stats_line(line).unwrap();
        assert_eq!(stats.memory_used_bytes, 12 * 1024 * 1024);
        assert_eq!(stats.memory_limit_bytes, 128 * 1024 * 1024);
        assert_eq!(stats.pids, Some(3));
    }

    fn output(exit_code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_exec_output_keeps_program_failures() {
        let ok = exec_output(output(0, "")).unwrap();
        assert!(ok.success());

        let failed = exec_output(output(1, "Traceback (most recent call last):")).unwrap();
        assert_eq!(failed.exit_code, 1);
    }

    #[test]
    fn test_exec_output_maps_docker_failures() {
        let stopped = exec_output(output(
            1,
            "Error response from daemon: container 3f2a is not running\n",
        ));
        assert!(matches!(
            stopped,
            Err(RuntimeError::CommandFailed { status: 1, ref stderr }) if stderr.ends_with("is not running")
        ));

        for status in [125, 126, 127] {
            assert!(matches!(
                exec_output(output(status, "OCI runtime exec failed")),
                Err(RuntimeError::CommandFailed { status: s, .. }) if s == status
            ));
        }
    }

    #[test]
    fn test_exec_output_missing_container_is_not_found() {
        let container = DockerContainer {
            id: "gone".to_string(),
            client: Arc::new(DockerClient {
                binary: PathBuf::from("docker"),
                processes: ProcessManager::new(),
                call_timeout: Duration::from_secs(1),
                closed: AtomicBool::new(false),
            }),
        };
        let err = exec_output(output(1, "Error response from daemon: No such container: gone"))
            .map_err(|e| container.not_found_or(e));
        assert!(matches!(err, Err(RuntimeError::NotFound(id)) if id == "gone"));
    }

    #[test]
    fn test_parse_stats_line_rejects_garbage() {
        assert!(parse_stats_line("not json").is_err());
        assert!(parse_stats_line(r#"{"MemUsage":"12MiB"}"#).is_err());
    }

    #[test]
    fn test_run_args() {
        let mut labels = BTreeMap::new();
        labels.insert("sandbox-pool.pool_id".to_string(), "p1".to_string());
        let spec = CreateSpec {
            labels,
            ..Default::default()
        };

        let args = DockerRuntime::run_args(&spec);
        assert_eq!(&args[..2], &["run", "-d"]);
        assert!(args.contains(&"sandbox-pool.pool_id=p1".to_string()));
        assert!(args.contains(&"--read-only".to_string()));

        // Image comes right before the keep-alive command
        let tail: Vec<&str> = args.iter().rev().take(3).map(String::as_str).collect();
        assert_eq!(tail, vec!["infinity", "sleep", "python:3.11-slim"]);
    }

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }
}
