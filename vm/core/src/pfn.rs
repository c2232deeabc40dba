//! Per-frame metadata: the PFN database.

use std::sync::Arc;

use vm_sync::{ManualResetEvent, SpinLock};

use crate::types::FrameNumber;

/// Which list, if any, a frame currently belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    Zero,
    Free,
    Standby,
    Modified,
    Quarantine,
    /// On no list: in flight towards becoming free or quarantined, or
    /// otherwise not independently addressable by any page list.
    None,
    /// Host-unmapped but a writer or outstanding reader still holds it;
    /// the writer releases it to Free on completion.
    AwaitingFree,
    /// Host-unmapped while in flight to quarantine.
    AwaitingQuarantine,
    /// Mapped into a virtual address space via a valid PTE.
    Active,
}

impl FrameState {
    pub fn is_listed(self) -> bool {
        matches!(
            self,
            FrameState::Zero
                | FrameState::Free
                | FrameState::Standby
                | FrameState::Modified
                | FrameState::Quarantine
        )
    }
}

/// A handle used to park readers behind an in-flight pagefile read.
///
/// Replaces the source's ad hoc event-node detach/attach: the last thread
/// to decrement `waiters` below a prior-held count is responsible for
/// nothing further, since the `Arc` itself drops the node once no
/// frame or waiter references it.
pub struct ReadCompletion {
    pub event: ManualResetEvent,
}

impl ReadCompletion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            event: ManualResetEvent::new(false),
        })
    }
}

/// Mutable per-frame fields, guarded by the frame's own spin lock.
pub struct FrameInner {
    pub state: FrameState,
    pub pagefile_slot: Option<u32>,
    pub reverse_pte_index: Option<usize>,
    /// Set by the modified writer or zeroer while the page's contents are
    /// being written out or zeroed.
    pub write_in_progress: bool,
    /// Set while pagefile-backed contents are being materialized by the
    /// fault handler. Kept as its own field rather than overloaded onto
    /// `ref_count`, per the concurrency open question.
    pub read_in_progress: bool,
    /// Outstanding read-completion waiters plus other transient holds.
    pub ref_count: u32,
    /// Set when a write fault observes `write_in_progress` already held,
    /// so the writer knows to re-queue the page as modified instead of
    /// promoting it to standby.
    pub remodified: bool,
    pub read_event: Option<Arc<ReadCompletion>>,
}

impl Default for FrameInner {
    fn default() -> Self {
        Self {
            state: FrameState::Free,
            pagefile_slot: None,
            reverse_pte_index: None,
            write_in_progress: false,
            read_in_progress: false,
            ref_count: 0,
            remodified: false,
            read_event: None,
        }
    }
}

/// One entry in the PFN database.
pub struct Frame {
    pub number: FrameNumber,
    inner: SpinLock<FrameInner>,
}

impl Frame {
    fn new(number: FrameNumber) -> Self {
        Self {
            number,
            inner: SpinLock::new(FrameInner::default()),
        }
    }

    pub fn lock(&self) -> vm_sync::SpinGuard<'_, FrameInner> {
        self.inner.lock()
    }

    pub fn try_lock(&self) -> Option<vm_sync::SpinGuard<'_, FrameInner>> {
        self.inner.try_lock()
    }
}

/// The fixed-size array of per-frame metadata, indexed by frame number.
///
/// Sized once at startup to `physical_frames` and never reallocated, so
/// that [`crate::pagelist::PageList`] can hold stable frame indices.
pub struct PfnDatabase {
    frames: Box<[Frame]>,
}

impl PfnDatabase {
    pub fn new(physical_frames: usize) -> Self {
        let frames = (0..physical_frames)
            .map(|n| Frame::new(FrameNumber::new(n as u32)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { frames }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn frame(&self, index: u32) -> &Frame {
        &self.frames[index as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = &Frame> {
        self.frames.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_start_free_with_no_links() {
        let db = PfnDatabase::new(4);
        assert_eq!(db.len(), 4);
        let frame = db.frame(2);
        let inner = frame.lock();
        assert_eq!(inner.state, FrameState::Free);
        assert_eq!(inner.ref_count, 0);
    }
}
