//! Runtime configuration for a [`crate::system::System`].
//!
//! Field names follow Rust `snake_case` rather than camelCase. `vad_mode`
//! is advisory: it governs only what a caller (such as the harness CLI)
//! defaults to when a user doesn't name a mode explicitly. It has no
//! effect on `VadList::create`, which always takes an explicit
//! `is_commit` flag per call.

/// Whether a freshly created VAD demo range commits up front or reserves
/// and commits lazily, and whether callers may do either.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadMode {
    Commit,
    Reserve,
    Mixed,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Frames requested from the host allocator at startup.
    pub physical_frames: usize,
    /// Capacity of the pagefile's slot bitmap.
    pub pagefile_slots: usize,
    /// The managed virtual address space is `physical_frames * vm_multiplier`
    /// pages, oversubscribing physical memory the way AWE-backed managers do.
    pub vm_multiplier: usize,
    /// Number of zeroer and modified-writer threads each (the ager/trimmer
    /// always runs as a single thread).
    pub num_threads: usize,
    /// Contiguous PTEs sharing one stripe lock.
    pub pages_per_lock: usize,
    /// Low-water mark on `{zero, free, standby}` below which the
    /// ager/trimmer forces unconditional trims.
    pub min_available: usize,
    pub vad_mode: VadMode,
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            physical_frames: 1024,
            pagefile_slots: 4096,
            vm_multiplier: 4,
            num_threads: 2,
            pages_per_lock: 64,
            min_available: 64,
            vad_mode: VadMode::Mixed,
            verbose: false,
        }
    }
}

impl Config {
    pub fn address_space_pages(&self) -> usize {
        self.physical_frames * self.vm_multiplier
    }

    /// A scratch pool sized so no plausible set of concurrently running
    /// workers and fault handlers can starve each other waiting on a VA.
    pub fn scratch_pool_capacity(&self) -> usize {
        self.num_threads * 2 + 4
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_space_scales_with_multiplier() {
        let config = Config {
            physical_frames: 256,
            vm_multiplier: 8,
            ..Default::default()
        };
        assert_eq!(config.address_space_pages(), 2048);
    }
}
