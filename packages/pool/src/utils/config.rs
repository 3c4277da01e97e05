// packages/pool/src/utils/config.rs
//! Layered configuration loading
//!
//! Sources, lowest precedence first:
//!
//! 1. Built-in defaults
//! 2. `sandbox-pool.{toml,yaml,json}` in the working directory, or the file
//!    named by `SANDBOX_POOL_CONFIG`
//! 3. Environment variables, e.g. `SANDBOX_POOL__POOL__MAX_SIZE=8`

use crate::pool::config::PoolConfig;
use crate::runtime::{CreateSpec, ResourceLimits, SecurityOptions};
use crate::utils::errors::{PoolError, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Environment variable naming an explicit config file
pub const CONFIG_PATH_ENV: &str = "SANDBOX_POOL_CONFIG";

/// Prefix for environment variable overrides
pub const ENV_PREFIX: &str = "SANDBOX_POOL";

/// Base name of the optional config file
const DEFAULT_CONFIG_FILE: &str = "sandbox-pool";

/// Top-level configuration for the pool service
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub pool: PoolConfig,
    pub runtime: RuntimeConfig,
    pub executor: ExecutorConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load defaults, the optional config file and environment overrides
    pub fn load() -> Result<Self> {
        let mut builder = Config::builder();

        builder = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => {
                debug!("Loading configuration from {}", path);
                builder.add_source(File::with_name(&path))
            }
            Err(_) => builder.add_source(File::with_name(DEFAULT_CONFIG_FILE).required(false)),
        };

        Self::finish(builder)
    }

    /// Load a specific file plus environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading configuration from {:?}", path);
        Self::finish(Config::builder().add_source(File::from(path)))
    }

    fn finish(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("runtime.keep_alive")
                    .with_list_parse_key("executor.interpreter"),
            )
            .build()?;

        let config: EngineConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate every section
    pub fn validate(&self) -> Result<()> {
        self.pool.validate().map_err(PoolError::Config)?;
        self.runtime.validate().map_err(PoolError::Config)?;
        self.executor.validate().map_err(PoolError::Config)?;
        Ok(())
    }
}

/// Container runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Docker CLI binary, absolute or looked up on `PATH`
    pub docker_binary: String,

    /// Image every environment is created from
    pub image: String,

    /// Command that keeps an idle environment alive
    pub keep_alive: Vec<String>,

    pub limits: ResourceLimits,

    pub security: SecurityOptions,

    /// Extra labels attached to every environment
    pub labels: BTreeMap<String, String>,

    /// Budget for creating one environment (default: 60s)
    pub create_timeout_ms: u64,

    /// Budget for status/stats/remove calls (default: 10s)
    pub call_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        let spec = CreateSpec::default();
        Self {
            docker_binary: "docker".to_string(),
            image: spec.image,
            keep_alive: spec.keep_alive,
            limits: spec.limits,
            security: spec.security,
            labels: BTreeMap::new(),
            create_timeout_ms: 60_000,
            call_timeout_ms: 10_000,
        }
    }
}

impl RuntimeConfig {
    pub fn create_timeout(&self) -> Duration {
        Duration::from_millis(self.create_timeout_ms)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Creation request for one pooled environment
    pub fn create_spec(&self) -> CreateSpec {
        CreateSpec {
            image: self.image.clone(),
            limits: self.limits.clone(),
            security: self.security.clone(),
            keep_alive: self.keep_alive.clone(),
            labels: self.labels.clone(),
        }
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.docker_binary.trim().is_empty() {
            return Err("runtime.docker_binary cannot be empty".to_string());
        }
        if self.image.trim().is_empty() {
            return Err("runtime.image cannot be empty".to_string());
        }
        if self.keep_alive.is_empty() {
            return Err("runtime.keep_alive cannot be empty".to_string());
        }
        if self.create_timeout_ms == 0 || self.call_timeout_ms == 0 {
            return Err("runtime timeouts must be greater than zero".to_string());
        }
        self.limits.validate()?;
        self.security.validate()?;
        Ok(())
    }
}

/// Settings for running user programs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Command prefix; the program source is appended as the last argument
    pub interpreter: Vec<String>,

    /// Wall-clock budget for one program (default: 30s)
    pub execution_timeout_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            interpreter: vec!["python3".to_string(), "-c".to_string()],
            execution_timeout_ms: 30_000,
        }
    }
}

impl ExecutorConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.interpreter.is_empty() {
            return Err("executor.interpreter cannot be empty".to_string());
        }
        if self.execution_timeout_ms == 0 {
            return Err("executor.execution_timeout_ms must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Log output settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.runtime.image, "python:3.11-slim");
        assert_eq!(config.executor.interpreter, vec!["python3", "-c"]);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[pool]
initial_size = 2
max_size = 4
idle_timeout_ms = 1000

[runtime]
image = "alpine:3.19"

[runtime.limits]
memory_limit_mb = 256

[logging]
json = true
"#
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.pool.initial_size, 2);
        assert_eq!(config.pool.max_size, 4);
        assert_eq!(config.pool.idle_timeout(), Duration::from_secs(1));
        // Untouched fields keep their defaults
        assert_eq!(config.pool.min_size, 1);
        assert_eq!(config.runtime.image, "alpine:3.19");
        assert_eq!(config.runtime.limits.memory_limit_mb, 256);
        assert_eq!(config.runtime.limits.cpu_quota, 50);
        assert!(config.logging.json);
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[pool]\nmin_size = 5\nmax_size = 2").unwrap();

        let result = EngineConfig::from_file(file.path());
        assert!(matches!(result, Err(PoolError::Config(_))));
    }

    #[test]
    fn test_create_spec_uses_runtime_settings() {
        let mut runtime = RuntimeConfig {
            image: "alpine:3.19".to_string(),
            ..Default::default()
        };
        runtime.labels.insert("team".to_string(), "edu".to_string());

        let spec = runtime.create_spec();
        assert_eq!(spec.image, "alpine:3.19");
        assert_eq!(spec.labels.get("team").map(String::as_str), Some("edu"));
        assert_eq!(spec.keep_alive, vec!["sleep", "infinity"]);
    }

    #[test]
    fn test_runtime_validation() {
        let runtime = RuntimeConfig {
            keep_alive: Vec::new(),
            ..Default::default()
        };
        assert!(runtime.validate().is_err());
    }
}
