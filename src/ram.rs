//! Host memory reporting
//!
//! The switcher asks how much host RAM is free before putting a backend to
//! sleep: level 1 sleep parks the weights in host RAM, so it only fits when
//! there is room for them.

use parking_lot::Mutex;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::warn;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Source of the currently available host memory
pub trait RamOracle: Send + Sync {
    /// Available host RAM in GB
    fn available_ram_gb(&self) -> f64;
}

/// Reads available memory from the operating system
pub struct SystemRam {
    system: Mutex<System>,
}

impl SystemRam {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new_with_specifics(
                RefreshKind::new().with_memory(MemoryRefreshKind::new().with_ram()),
            )),
        }
    }
}

impl Default for SystemRam {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SystemRam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SystemRam").finish_non_exhaustive()
    }
}

impl RamOracle for SystemRam {
    fn available_ram_gb(&self) -> f64 {
        let mut system = self.system.lock();
        system.refresh_memory_specifics(MemoryRefreshKind::new().with_ram());
        let available = system.available_memory();
        if available == 0 {
            // Treated as "no room", which pushes sleeps to level 2
            warn!("Could not determine available host memory, assuming 0 GB");
        }
        available as f64 / BYTES_PER_GB
    }
}

/// Reports a fixed amount of memory. Useful in tests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedRam(pub f64);

impl RamOracle for FixedRam {
    fn available_ram_gb(&self) -> f64 {
        self.0
    }
}
