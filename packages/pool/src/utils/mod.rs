// packages/pool/src/utils/mod.rs
//! Shared utilities: configuration loading and error types

pub mod config;
pub mod errors;

pub use config::{EngineConfig, ExecutorConfig, LoggingConfig, RuntimeConfig};
pub use errors::{PoolError, Result, RuntimeError};
