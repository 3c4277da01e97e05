// packages/pool/src/executor/mod.rs
//! Program execution on top of the pool
//!
//! One execution is one lease: acquire, run the interpreter with the source
//! as its last argument, cap the output, release. A program that exits
//! non-zero is still a successful execution; only runtime failures and pool
//! exhaustion are errors.

use crate::pool::PoolManager;
use crate::utils::config::ExecutorConfig;
use crate::utils::errors::{PoolError, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Result of running one program
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionOutcome {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,

    /// Whether stdout or stderr was cut to the output limit
    pub truncated: bool,

    pub duration_ms: u64,
}

impl ExecutionOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs user programs in pooled environments
pub struct SandboxExecutor {
    pool: Arc<PoolManager>,
    config: ExecutorConfig,
}

impl SandboxExecutor {
    pub fn new(pool: Arc<PoolManager>, config: ExecutorConfig) -> Self {
        Self { pool, config }
    }

    pub fn pool(&self) -> &PoolManager {
        &self.pool
    }

    /// Run `source` with the configured execution timeout
    pub fn execute(&self, source: &str) -> Result<ExecutionOutcome> {
        self.execute_with_timeout(source, self.config.execution_timeout())
    }

    /// Run `source`, killing it after `timeout`
    pub fn execute_with_timeout(&self, source: &str, timeout: Duration) -> Result<ExecutionOutcome> {
        let limit = self.pool.config().max_source_bytes;
        if source.len() > limit {
            return Err(PoolError::SourceTooLarge {
                size: source.len(),
                limit,
            });
        }
        if timeout.is_zero() {
            return Err(PoolError::InvalidArgument(
                "execution timeout must be greater than zero".to_string(),
            ));
        }

        let lease = self.pool.acquire_default()?;

        let mut command = self.config.interpreter.clone();
        command.push(source.to_string());

        let started = Instant::now();
        let result = lease.run(&command, timeout);
        let elapsed = started.elapsed();

        let env_id = lease.id().to_string();
        self.pool.release(lease);
        let output = result?;

        let max_output = self.pool.config().max_output_bytes;
        let (stdout, stdout_cut) = truncate_output(output.stdout, max_output);
        let (stderr, stderr_cut) = truncate_output(output.stderr, max_output);

        let outcome = ExecutionOutcome {
            exit_code: output.exit_code,
            stdout,
            stderr,
            truncated: stdout_cut || stderr_cut,
            duration_ms: elapsed.as_millis() as u64,
        };

        info!(
            pool_id = %self.pool.pool_id(),
            env_id = %env_id,
            exit_code = outcome.exit_code,
            duration_ms = outcome.duration_ms,
            truncated = outcome.truncated,
            "Program executed"
        );
        Ok(outcome)
    }
}

/// Cut `text` to at most `max_bytes` on a char boundary and append a note
pub fn truncate_output(text: String, max_bytes: usize) -> (String, bool) {
    if text.len() <= max_bytes {
        return (text, false);
    }

    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    debug!(total = text.len(), kept = cut, "Truncating program output");

    let mut kept = text[..cut].to_string();
    kept.push_str(&format!(
        "\n\n... (output truncated, {} bytes total)",
        text.len()
    ));
    (kept, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::runtime::{CommandOutput, CreateSpec, MemoryRuntime};

    fn executor_with(runtime: MemoryRuntime, config: PoolConfig) -> SandboxExecutor {
        let pool = PoolManager::start(config, Arc::new(runtime), CreateSpec::default()).unwrap();
        SandboxExecutor::new(Arc::new(pool), ExecutorConfig::default())
    }

    #[test]
    fn test_truncate_output() {
        let (text, cut) = truncate_output("short".to_string(), 10);
        assert_eq!(text, "short");
        assert!(!cut);

        let (text, cut) = truncate_output("x".repeat(20), 10);
        assert!(cut);
        assert!(text.starts_with(&"x".repeat(10)));
        assert!(text.ends_with("(output truncated, 20 bytes total)"));
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        // Each 'é' is two bytes; a cut at 3 must back off to 2
        let (text, cut) = truncate_output("éééé".to_string(), 3);
        assert!(cut);
        assert!(text.starts_with("é\n\n..."));
    }

    #[test]
    fn test_execute_runs_interpreter_with_source() {
        let runtime = MemoryRuntime::new().with_handler(|command: &[String]| CommandOutput {
            exit_code: 0,
            stdout: format!("{} ran {}", command[0], command[2]),
            stderr: String::new(),
        });
        let executor = executor_with(runtime, PoolConfig::fixed(1));

        let outcome = executor.execute("print('hi')").unwrap();
        assert!(outcome.success());
        assert_eq!(outcome.stdout, "python3 ran print('hi')");
        assert_eq!(executor.pool().stats().total_resets, 1);
    }

    #[test]
    fn test_failing_program_is_not_an_error() {
        let runtime = MemoryRuntime::new().with_handler(|_: &[String]| CommandOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "ZeroDivisionError: division by zero".to_string(),
        });
        let executor = executor_with(runtime, PoolConfig::fixed(1));

        let outcome = executor.execute("1/0").unwrap();
        assert!(!outcome.success());
        assert!(outcome.stderr.contains("ZeroDivisionError"));
    }

    #[test]
    fn test_runtime_timeout_is_execution_failure() {
        let runtime = MemoryRuntime::new();
        let executor = executor_with(runtime.clone(), PoolConfig::fixed(1));
        runtime.set_latency(Duration::from_millis(100));

        let source = format!("import time; time.sleep(60)  # {}", "x".repeat(300));
        let result = executor.execute_with_timeout(&source, Duration::from_millis(20));

        match result {
            Err(PoolError::ExecutionFailure { snippet, source }) => {
                assert!(snippet.starts_with("python3 -c import time"));
                assert!(snippet.ends_with("..."));
                assert_eq!(snippet.chars().count(), crate::utils::errors::SNIPPET_CHARS + 3);
                assert!(matches!(source, crate::utils::errors::RuntimeError::Timeout(_)));
            }
            other => panic!("expected an execution failure, got {:?}", other),
        }

        // The lease went back through reset and verification
        let stats = executor.pool().stats();
        assert_eq!(stats.in_use_count, 0);
        assert_eq!(stats.total_resets, 1);
        assert_eq!(stats.available_count, 1);
    }

    #[test]
    fn test_oversized_source_is_rejected() {
        let runtime = MemoryRuntime::new();
        let executor = executor_with(runtime.clone(), PoolConfig::fixed(1));
        let calls = runtime.calls();

        let result = executor.execute(&"x".repeat(10_001));
        assert!(matches!(
            result,
            Err(PoolError::SourceTooLarge { size: 10_001, limit: 10_000 })
        ));
        assert_eq!(runtime.calls(), calls);
    }

    #[test]
    fn test_large_output_is_truncated() {
        let runtime = MemoryRuntime::new().with_handler(|_: &[String]| CommandOutput {
            exit_code: 0,
            stdout: "y".repeat(50_000),
            stderr: String::new(),
        });
        let executor = executor_with(runtime, PoolConfig::fixed(1));

        let outcome = executor.execute("print('y' * 50000)").unwrap();
        assert!(outcome.truncated);
        assert!(outcome.stdout.len() < 10_100);
    }
}
