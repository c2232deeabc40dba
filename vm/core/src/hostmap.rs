//! The host AWE-equivalent collaborator boundary.
//!
//! Everything above this trait talks in frame numbers and virtual page
//! numbers; only an implementation of [`HostMapper`] is allowed to know how
//! those are actually backed. [`SimulatedHostMapper`] stands in for the
//! real `MapUserPhysicalPages` primitive in tests and the CLI demo.

use std::sync::Mutex;

use crate::err::{Error, Result};
use crate::types::{FrameNumber, VirtPageNum, PAGE_SIZE};

/// The external primitive that binds physical frame numbers to virtual
/// addresses. Implementations must make `map`/`unmap` safe to call from any
/// thread while other threads operate on unrelated pages.
pub trait HostMapper: Send + Sync {
    /// Maps `frames` starting at `va`, one frame per page, replacing
    /// whatever was previously mapped there.
    fn map(&self, va: VirtPageNum, frames: &[FrameNumber]) -> Result<()>;

    /// Unmaps `page_count` pages starting at `va`.
    fn unmap(&self, va: VirtPageNum, page_count: usize) -> Result<()>;

    /// Requests `count` physical frames from the host, analogous to
    /// `AllocateUserPhysicalPages`.
    fn allocate_frames(&self, count: usize) -> Result<Vec<FrameNumber>>;

    /// Writes `PAGE_SIZE` bytes into the frame currently mapped at `va`.
    /// Used by the zeroer, the pagefile writer/reader and the trader; `va`
    /// must already be mapped to exactly one frame.
    fn write_through(&self, va: VirtPageNum, data: &[u8; PAGE_SIZE]) -> Result<()>;

    /// Reads `PAGE_SIZE` bytes out of the frame currently mapped at `va`.
    fn read_through(&self, va: VirtPageNum) -> Result<[u8; PAGE_SIZE]>;
}

struct Arena {
    frames: Vec<[u8; PAGE_SIZE]>,
    mappings: std::collections::HashMap<VirtPageNum, FrameNumber>,
    next_frame: usize,
}

/// An in-process stand-in for AWE: a `Vec` of page-sized byte arrays plays
/// physical RAM, and a map from virtual page to frame number plays the
/// host's page tables. Writes made through a mapped VA are visible to a
/// later fault that remaps the same frame, matching the aliasing behavior
/// real AWE provides. No code outside this module may reach into the
/// arena directly.
pub struct SimulatedHostMapper {
    arena: Mutex<Arena>,
    total_frames: usize,
}

impl SimulatedHostMapper {
    pub fn new(total_frames: usize) -> Self {
        Self {
            arena: Mutex::new(Arena {
                frames: vec![[0u8; PAGE_SIZE]; total_frames],
                mappings: std::collections::HashMap::new(),
                next_frame: 0,
            }),
            total_frames,
        }
    }

    pub fn total_frames(&self) -> usize {
        self.total_frames
    }
}

impl HostMapper for SimulatedHostMapper {
    fn map(&self, va: VirtPageNum, frames: &[FrameNumber]) -> Result<()> {
        let mut arena = self.arena.lock().unwrap();
        for (offset, frame) in frames.iter().enumerate() {
            if frame.as_usize() >= arena.frames.len() {
                return Err(Error::Fatal("host map requested an out-of-range frame"));
            }
            arena.mappings.insert(va.offset(offset), *frame);
        }
        Ok(())
    }

    fn unmap(&self, va: VirtPageNum, page_count: usize) -> Result<()> {
        let mut arena = self.arena.lock().unwrap();
        for offset in 0..page_count {
            arena.mappings.remove(&va.offset(offset));
        }
        Ok(())
    }

    fn allocate_frames(&self, count: usize) -> Result<Vec<FrameNumber>> {
        let mut arena = self.arena.lock().unwrap();
        if arena.next_frame + count > arena.frames.len() {
            return Err(Error::Fatal("host has no remaining physical frames"));
        }
        let start = arena.next_frame;
        arena.next_frame += count;
        Ok((start..start + count)
            .map(|n| FrameNumber::new(n as u32))
            .collect())
    }

    fn write_through(&self, va: VirtPageNum, data: &[u8; PAGE_SIZE]) -> Result<()> {
        let mut arena = self.arena.lock().unwrap();
        let frame = *arena
            .mappings
            .get(&va)
            .ok_or(Error::Fatal("write_through to an unmapped scratch VA"))?;
        arena.frames[frame.as_usize()].copy_from_slice(data);
        Ok(())
    }

    fn read_through(&self, va: VirtPageNum) -> Result<[u8; PAGE_SIZE]> {
        let arena = self.arena.lock().unwrap();
        let frame = *arena
            .mappings
            .get(&va)
            .ok_or(Error::Fatal("read_through from an unmapped scratch VA"))?;
        Ok(arena.frames[frame.as_usize()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_remap_is_observable() {
        let host = SimulatedHostMapper::new(4);
        let frames = host.allocate_frames(1).unwrap();
        let scratch = VirtPageNum::new(1000);
        host.map(scratch, &frames).unwrap();
        host.write_through(scratch, &[7u8; PAGE_SIZE]).unwrap();
        host.unmap(scratch, 1).unwrap();

        let other_va = VirtPageNum::new(2000);
        host.map(other_va, &frames).unwrap();
        let read_back = host.read_through(other_va).unwrap();
        assert_eq!(read_back, [7u8; PAGE_SIZE]);
    }

    #[test]
    fn allocate_frames_exhausts_capacity() {
        let host = SimulatedHostMapper::new(2);
        host.allocate_frames(2).unwrap();
        assert!(host.allocate_frames(1).is_err());
    }
}
