// packages/pool/src/runtime/mod.rs
//! Container runtime boundary
//!
//! The pool never talks to a container engine directly. It depends on two
//! narrow capability traits:
//!
//! - **ContainerRuntime**: creates environments and owns the connection
//! - **EnvironmentHandle**: run / stats / status / stop / remove on one environment
//!
//! Two implementations ship with the crate:
//!
//! - **docker**: drives the `docker` CLI with per-call timeouts
//! - **memory**: in-process fake with fault injection, used by tests and benches
//!
//! # Architecture
//!
//! ```text
//! PoolManager ──create()──▶ ContainerRuntime ──▶ Arc<dyn EnvironmentHandle>
//!      │                                                │
//!      └── health / reset / lease ── run(cmd, timeout) ─┘
//! ```

pub mod docker;
pub mod memory;
pub mod process_manager;
pub mod resource_limiter;
pub mod sandbox;

use crate::utils::errors::RuntimeError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

// Re-export commonly used types
pub use docker::DockerRuntime;
pub use memory::{MemoryContainer, MemoryRuntime, ResetFault};
pub use process_manager::ProcessManager;
pub use resource_limiter::ResourceLimits;
pub use sandbox::SecurityOptions;

/// Lifecycle state reported by the runtime for one environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    Running,
    Exited,
    Other,
}

impl EnvironmentState {
    /// Parse the runtime's textual status
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" => EnvironmentState::Running,
            "exited" | "dead" => EnvironmentState::Exited,
            _ => EnvironmentState::Other,
        }
    }
}

impl fmt::Display for EnvironmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvironmentState::Running => write!(f, "running"),
            EnvironmentState::Exited => write!(f, "exited"),
            EnvironmentState::Other => write!(f, "other"),
        }
    }
}

/// Result of one command run inside an environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Point-in-time resource usage of one environment
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceStats {
    pub memory_used_bytes: u64,
    pub memory_limit_bytes: u64,
    pub pids: Option<u64>,
}

impl ResourceStats {
    /// Memory usage as a percentage of the limit, `None` when the limit is unknown
    pub fn memory_percent(&self) -> Option<f64> {
        if self.memory_limit_bytes == 0 {
            return None;
        }
        Some(self.memory_used_bytes as f64 / self.memory_limit_bytes as f64 * 100.0)
    }
}

/// Everything the runtime needs to create one environment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSpec {
    /// Image identifier
    pub image: String,

    /// Resource ceilings
    pub limits: ResourceLimits,

    /// Isolation options
    pub security: SecurityOptions,

    /// Command that keeps the environment alive between leases
    pub keep_alive: Vec<String>,

    /// Labels attached to the environment for tracking
    pub labels: BTreeMap<String, String>,
}

impl Default for CreateSpec {
    fn default() -> Self {
        Self {
            image: "python:3.11-slim".to_string(),
            limits: ResourceLimits::default(),
            security: SecurityOptions::default(),
            keep_alive: vec!["sleep".to_string(), "infinity".to_string()],
            labels: BTreeMap::new(),
        }
    }
}

impl CreateSpec {
    /// Copy of this spec with an additional label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

/// Capability set of one isolated environment
///
/// All calls block; implementations must honour the given timeouts and
/// report an expired call as [`RuntimeError::Timeout`].
pub trait EnvironmentHandle: Send + Sync + fmt::Debug {
    /// Runtime-assigned identity, unique for the lifetime of the environment
    fn id(&self) -> &str;

    /// Run `command` inside the environment and capture its output
    fn run(&self, command: &[String], timeout: Duration) -> Result<CommandOutput, RuntimeError>;

    /// Current resource usage
    fn stats(&self) -> Result<ResourceStats, RuntimeError>;

    /// Current lifecycle state
    fn status(&self) -> Result<EnvironmentState, RuntimeError>;

    /// Stop the keep-alive process, waiting at most `timeout`
    fn stop(&self, timeout: Duration) -> Result<(), RuntimeError>;

    /// Delete the environment
    fn remove(&self, force: bool) -> Result<(), RuntimeError>;
}

/// Factory and connection owner for environments
pub trait ContainerRuntime: Send + Sync {
    /// Create and start one environment
    fn create(&self, spec: &CreateSpec) -> Result<Arc<dyn EnvironmentHandle>, RuntimeError>;

    /// Release the runtime connection; later calls fail with [`RuntimeError::Closed`]
    fn close(&self) -> Result<(), RuntimeError>;
}

/// Build a `sh -c <script>` command
pub fn shell(script: impl Into<String>) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.into()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_parsing() {
        assert_eq!(EnvironmentState::parse("running\n"), EnvironmentState::Running);
        assert_eq!(EnvironmentState::parse("Exited"), EnvironmentState::Exited);
        assert_eq!(EnvironmentState::parse("paused"), EnvironmentState::Other);
    }

    #[test]
    fn test_memory_percent() {
        let stats = ResourceStats {
            memory_used_bytes: 64,
            memory_limit_bytes: 128,
            pids: None,
        };
        assert_eq!(stats.memory_percent(), Some(50.0));
        assert_eq!(ResourceStats::default().memory_percent(), None);
    }

    #[test]
    fn test_create_spec_labels() {
        let spec = CreateSpec::default().with_label("sandbox-pool.pool_id", "abc");
        assert_eq!(spec.labels.get("sandbox-pool.pool_id").map(String::as_str), Some("abc"));
        assert_eq!(spec.keep_alive, vec!["sleep", "infinity"]);
    }

    #[test]
    fn test_shell_helper() {
        assert_eq!(shell("echo hi"), vec!["sh", "-c", "echo hi"]);
    }
}
