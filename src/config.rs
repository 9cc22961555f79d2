//! Runtime configuration.
//!
//! A [`RuntimeConfig`] is plain data: it names the local node and sets the
//! defaults the runtime hands to memories it creates. Values are
//! serde-friendly so deployments can load them from files.

use serde::{Deserialize, Serialize};

/// Configuration for a runtime instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// The local node id within the cluster.
    pub address_space: u32,
    /// Default byte capacity for memories created without an explicit size.
    pub default_memory_capacity: usize,
    /// Whether shutdown sweeps warn about still-live instances.
    pub leak_check: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            address_space: 0,
            default_memory_capacity: 1 << 30,
            leak_check: true,
        }
    }
}

impl RuntimeConfig {
    /// Sets the local node id.
    #[must_use]
    pub const fn with_address_space(mut self, space: u32) -> Self {
        self.address_space = space;
        self
    }

    /// Sets the default memory capacity in bytes.
    #[must_use]
    pub const fn with_default_memory_capacity(mut self, bytes: usize) -> Self {
        self.default_memory_capacity = bytes;
        self
    }

    /// Enables or disables the shutdown leak sweep.
    #[must_use]
    pub const fn with_leak_check(mut self, enabled: bool) -> Self {
        self.leak_check = enabled;
        self
    }
}
