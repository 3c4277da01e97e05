// packages/pool/src/pool/reset.rs
//! Environment reset protocol
//!
//! One combined script, sent as a single runtime call, that:
//!
//! 1. kills every process except PID 1 (the keep-alive) and itself
//! 2. empties the scratch directory
//! 3. prints a sentinel proving the environment still responds
//! 4. prints the remaining scratch file count
//! 5. prints the remaining process count
//!
//! The output is parsed into a [`ResetProbe`] right away; validation then
//! works on typed values only.

use crate::pool::config::PoolConfig;
use crate::runtime::{shell, EnvironmentHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// First line of a successful reset
pub const RESET_SENTINEL: &str = "reset_ok";

const FILES_KEY: &str = "files:";
const PROCESSES_KEY: &str = "processes:";

/// Build the reset script for a scratch directory
pub fn reset_script(scratch: &str) -> String {
    format!(
        r#"for p in /proc/[0-9]*; do pid=${{p#/proc/}}; [ "$pid" = 1 ] || [ "$pid" = $$ ] || kill -9 "$pid" 2>/dev/null; done
rm -rf {scratch}/* {scratch}/.[!.]* {scratch}/..?* 2>/dev/null
echo {sentinel}
echo {files}$(ls -A {scratch} 2>/dev/null | wc -l)
echo {processes}$(ls -d /proc/[0-9]* 2>/dev/null | wc -l)
"#,
        scratch = scratch.trim_end_matches('/'),
        sentinel = RESET_SENTINEL,
        files = FILES_KEY,
        processes = PROCESSES_KEY,
    )
}

/// Why a reset did not verify
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResetFailure {
    #[error("reset call failed: {0}")]
    Call(String),

    #[error("reset script exited with status {0}")]
    ExitStatus(i32),

    #[error("sentinel missing from reset output {0:?}")]
    MissingSentinel(String),

    #[error("malformed reset output: {0}")]
    Malformed(String),

    #[error("{0} files left in scratch")]
    LeftoverFiles(u64),

    #[error("{0} processes left after reset")]
    LeftoverProcesses(u64),
}

/// Parsed result of the reset script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetProbe {
    pub leftover_files: u64,
    pub process_count: u64,
}

impl ResetProbe {
    /// Parse script stdout; a missing or non-numeric field is an error, never zero
    pub fn parse(stdout: &str) -> Result<Self, ResetFailure> {
        let mut lines = stdout.trim().lines();

        let first = lines.next().unwrap_or_default();
        if !first.contains(RESET_SENTINEL) {
            return Err(ResetFailure::MissingSentinel(
                stdout.chars().take(100).collect(),
            ));
        }

        let mut files = None;
        let mut processes = None;
        for line in lines {
            let line = line.trim();
            if let Some(value) = line.strip_prefix(FILES_KEY) {
                files = Some(parse_count(FILES_KEY, value)?);
            } else if let Some(value) = line.strip_prefix(PROCESSES_KEY) {
                processes = Some(parse_count(PROCESSES_KEY, value)?);
            }
        }

        match (files, processes) {
            (Some(leftover_files), Some(process_count)) => Ok(Self {
                leftover_files,
                process_count,
            }),
            _ => Err(ResetFailure::Malformed("missing counters".to_string())),
        }
    }
}

fn parse_count(key: &str, value: &str) -> Result<u64, ResetFailure> {
    value
        .trim()
        .parse()
        .map_err(|_| ResetFailure::Malformed(format!("{}{}", key, value.trim())))
}

/// Restores a returned environment and verifies the result
#[derive(Debug, Clone)]
pub struct Resetter {
    script: String,
    timeout: Duration,
    max_processes: u64,
}

impl Resetter {
    pub fn new(config: &PoolConfig, scratch_path: &str) -> Self {
        Self {
            script: reset_script(scratch_path),
            timeout: config.reset_timeout(),
            max_processes: u64::from(config.max_reset_processes),
        }
    }

    /// Run the reset script and validate its report
    pub fn reset(&self, handle: &dyn EnvironmentHandle) -> Result<ResetProbe, ResetFailure> {
        let started = Instant::now();

        let output = handle
            .run(&shell(self.script.as_str()), self.timeout)
            .map_err(|e| ResetFailure::Call(e.to_string()))?;

        if !output.success() {
            return Err(ResetFailure::ExitStatus(output.exit_code));
        }

        let probe = ResetProbe::parse(&output.stdout)?;
        if probe.leftover_files > 0 {
            return Err(ResetFailure::LeftoverFiles(probe.leftover_files));
        }
        if probe.process_count > self.max_processes {
            return Err(ResetFailure::LeftoverProcesses(probe.process_count));
        }

        debug!(
            env_id = handle.id(),
            reset_ms = started.elapsed().as_millis() as u64,
            process_count = probe.process_count,
            "Environment reset verified"
        );
        Ok(probe)
    }
}
