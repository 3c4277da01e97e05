// packages/pool/src/runtime/sandbox.rs
//! Isolation options applied to every pooled environment
//!
//! Provides:
//! - Network isolation
//! - Read-only root filesystem with a small writable scratch tmpfs
//! - Capability dropping and no-new-privileges

use serde::{Deserialize, Serialize};

/// Security options forwarded to the runtime at creation time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityOptions {
    /// Run without any network interface
    pub disable_network: bool,

    /// Mount the root filesystem read-only
    pub read_only_rootfs: bool,

    /// Writable scratch directory (tmpfs)
    pub scratch_path: String,

    /// Size of the scratch tmpfs (runtime syntax, e.g. "10m")
    pub scratch_size: String,

    /// Drop every Linux capability
    pub drop_all_capabilities: bool,

    /// Forbid privilege escalation through setuid binaries
    pub no_new_privileges: bool,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            disable_network: true,
            read_only_rootfs: true,
            scratch_path: "/tmp".to_string(),
            scratch_size: "10m".to_string(),
            drop_all_capabilities: true,
            no_new_privileges: true,
        }
    }
}

impl SecurityOptions {
    /// Validate security options
    pub fn validate(&self) -> Result<(), String> {
        if !self.scratch_path.starts_with('/') {
            return Err(format!(
                "Scratch path must be absolute, got '{}'",
                self.scratch_path
            ));
        }
        if self.scratch_path == "/" {
            return Err("Scratch path cannot be the root directory".to_string());
        }
        if self.scratch_size.trim().is_empty() {
            return Err("Scratch size cannot be empty".to_string());
        }
        Ok(())
    }

    /// Render as `docker run` flags
    pub fn docker_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.disable_network {
            args.push("--network".to_string());
            args.push("none".to_string());
        }

        if self.read_only_rootfs {
            args.push("--read-only".to_string());
        }

        args.push("--tmpfs".to_string());
        args.push(format!(
            "{}:size={},mode=1777",
            self.scratch_path, self.scratch_size
        ));

        if self.drop_all_capabilities {
            args.push("--cap-drop".to_string());
            args.push("ALL".to_string());
        }

        if self.no_new_privileges {
            args.push("--security-opt".to_string());
            args.push("no-new-privileges".to_string());
        }

        args
    }
}
