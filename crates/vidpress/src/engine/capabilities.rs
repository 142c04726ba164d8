//! Host capability precheck
//!
//! The multi-threaded engine core needs shared memory between workers and an
//! isolated execution context. Natively these map to more than one hardware
//! thread and a private, writable working directory.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A host capability required by the multi-threaded engine core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    SharedMemory,
    CrossOriginIsolation,
}

impl Capability {
    /// What the user can do about it
    pub fn remediation(&self) -> &'static str {
        match self {
            Capability::SharedMemory => {
                "run on a host with more than one hardware thread, or set \
                 engine.missing_capabilities = \"degrade\" to use the single-threaded core"
            }
            Capability::CrossOriginIsolation => {
                "make the system temp directory writable (or point TMPDIR at one) so the \
                 engine can get a private working directory"
            }
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::SharedMemory => write!(f, "shared memory"),
            Capability::CrossOriginIsolation => write!(f, "isolated execution context"),
        }
    }
}

/// Snapshot of what the host provides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostCapabilities {
    pub shared_memory: bool,
    pub cross_origin_isolated: bool,
}

impl HostCapabilities {
    pub fn all() -> Self {
        Self {
            shared_memory: true,
            cross_origin_isolated: true,
        }
    }

    /// Capabilities required for the multi-threaded core that are absent
    pub fn missing(&self) -> Vec<Capability> {
        let mut missing = Vec::new();
        if !self.shared_memory {
            missing.push(Capability::SharedMemory);
        }
        if !self.cross_origin_isolated {
            missing.push(Capability::CrossOriginIsolation);
        }
        missing
    }

    pub fn supports_multi_thread(&self) -> bool {
        self.missing().is_empty()
    }
}

/// Source of a [`HostCapabilities`] snapshot
pub trait CapabilityProbe: Send + Sync {
    fn capabilities(&self) -> HostCapabilities;
}

/// Capability probe for the machine we run on
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeHost;

impl CapabilityProbe for NativeHost {
    fn capabilities(&self) -> HostCapabilities {
        let tmp = std::env::temp_dir();
        let isolated = std::fs::metadata(&tmp)
            .map(|m| m.is_dir() && !m.permissions().readonly())
            .unwrap_or(false);

        HostCapabilities {
            shared_memory: num_cpus::get() > 1,
            cross_origin_isolated: isolated,
        }
    }
}

/// Fixed snapshot, for hosts that are known in advance
impl CapabilityProbe for HostCapabilities {
    fn capabilities(&self) -> HostCapabilities {
        *self
    }
}
