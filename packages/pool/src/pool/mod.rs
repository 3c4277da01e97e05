// packages/pool/src/pool/mod.rs
//! Environment pool
//!
//! Keeps a bounded set of pre-warmed, isolated environments and hands them
//! out one lease at a time:
//!
//! - **manager**: acquire / release / stats / shutdown
//! - **health**: quick and deep checks
//! - **reset**: cleanup-and-verify between leases
//! - **reconciler**: background health sweep and idle reclamation
//!
//! # Lifecycle of one environment
//!
//! ```text
//!            create                acquire (quick check)
//!   ─────────────────▶ Available ──────────────────────▶ InUse
//!                        ▲   │ sweep                       │ release
//!                        │   ▼                             ▼
//!                       Checking                       Resetting
//!                        │   (deep check failed)           │ reset + deep check
//!                        ▼                                 │
//!                    Unhealthy ──▶ destroyed ◀── failed ───┘
//! ```

pub mod config;
pub mod health;
pub mod manager;
pub mod queue;
pub mod reconciler;
pub mod record;
pub mod reset;
pub mod stats;

// Re-export commonly used types
pub use config::PoolConfig;
pub use health::{HealthChecker, Unhealthy};
pub use manager::{Lease, PoolManager};
pub use queue::AvailableQueue;
pub use reconciler::SweepReport;
pub use record::{EnvironmentRecord, HealthHistory, RecordStatus};
pub use reset::{ResetFailure, ResetProbe, Resetter};
pub use stats::{EnvironmentSnapshot, PoolStats};
