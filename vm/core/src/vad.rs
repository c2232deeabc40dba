//! The VAD (Virtual Address Descriptor) list.
//!
//! Two locks guard a VAD, matching the source's two-lock discipline: an
//! outer lock over the list's *shape* (held for the whole duration of a
//! range walk so concurrent create/delete cannot shift what a walker is
//! iterating over) and, per node, an inner lock over the *fields* that
//! change during a walk (`commit_count`, `delete_bit`). Acquiring shape
//! before fields matches the PTE-before-VAD-read-before-VAD-write ordering
//! of the lock order.

use std::sync::{Arc, Mutex, RwLock};

use vm_bitmap::RunAllocator;

use crate::commit::CommitCounter;
use crate::err::{Error, Result};
use crate::types::{Permissions, VirtPageNum};

struct VadFields {
    commit_count: u64,
    delete_bit: bool,
}

/// One non-overlapping virtual address range.
pub struct Vad {
    pub start: VirtPageNum,
    pub page_count: usize,
    pub permissions: Permissions,
    pub is_commit: bool,
    fields: Mutex<VadFields>,
}

impl Vad {
    pub fn end(&self) -> VirtPageNum {
        self.start.offset(self.page_count)
    }

    pub fn contains(&self, vpn: VirtPageNum) -> bool {
        vpn >= self.start && vpn < self.end()
    }

    fn overlaps(&self, start: VirtPageNum, page_count: usize) -> bool {
        let end = start.offset(page_count);
        start < self.end() && self.start < end
    }

    pub fn commit_count(&self) -> u64 {
        self.fields.lock().unwrap().commit_count
    }

    pub fn is_deleting(&self) -> bool {
        self.fields.lock().unwrap().delete_bit
    }

    /// Adjusts `commit_count` by `delta`, which may be negative. The result
    /// must stay within `0..=page_count`; violating that is a structural
    /// bug in a caller, not a recoverable error.
    pub fn adjust_commit_count(&self, delta: i64) {
        let mut fields = self.fields.lock().unwrap();
        let updated = fields.commit_count as i64 + delta;
        debug_assert!(
            (0..=self.page_count as i64).contains(&updated),
            "commit_count out of range for VAD at {:?}",
            self.start
        );
        fields.commit_count = updated.clamp(0, self.page_count as i64) as u64;
    }

    fn mark_deleting(&self) -> bool {
        let mut fields = self.fields.lock().unwrap();
        if fields.delete_bit {
            return false;
        }
        fields.delete_bit = true;
        true
    }
}

/// The process-wide VAD list plus the bitmap used to find free address
/// ranges for `create(None, ...)` calls.
pub struct VadList {
    bitmap: Mutex<RunAllocator>,
    entries: RwLock<Vec<Arc<Vad>>>,
}

impl VadList {
    pub fn new(address_space_pages: usize) -> Self {
        Self {
            bitmap: Mutex::new(RunAllocator::new(address_space_pages)),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Finds the VAD containing `vpn`, if any. Acquires only the shape lock;
    /// callers that need to read fields afterwards are reading a value that
    /// can concurrently change underneath them unless they also hold the
    /// range-walk discipline described on [`VadList`].
    pub fn find(&self, vpn: VirtPageNum) -> Option<Arc<Vad>> {
        self.entries
            .read()
            .unwrap()
            .iter()
            .find(|vad| vad.contains(vpn))
            .cloned()
    }

    /// Returns the VAD fully containing `[start, start + page_count)`, or
    /// an `InvalidRange` error if the range is not covered by exactly one
    /// VAD.
    pub fn find_range(&self, start: VirtPageNum, page_count: usize) -> Result<Arc<Vad>> {
        let entries = self.entries.read().unwrap();
        let vad = entries
            .iter()
            .find(|vad| vad.contains(start))
            .ok_or(Error::InvalidRange("start address outside any VAD"))?;
        if start.offset(page_count) > vad.end() {
            return Err(Error::InvalidRange("range straddles a VAD boundary"));
        }
        Ok(Arc::clone(vad))
    }

    /// Acquires the list's shape lock for the duration of a range walk,
    /// then looks up the VAD covering the range, rejecting a VAD mid-delete.
    /// The returned guard must be held until the walk completes.
    pub fn begin_walk(
        &self,
        start: VirtPageNum,
        page_count: usize,
    ) -> Result<(std::sync::RwLockReadGuard<'_, Vec<Arc<Vad>>>, Arc<Vad>)> {
        let guard = self.entries.read().unwrap();
        let vad = guard
            .iter()
            .find(|vad| vad.contains(start))
            .ok_or(Error::InvalidRange("start address outside any VAD"))?;
        if start.offset(page_count) > vad.end() {
            return Err(Error::InvalidRange("range straddles a VAD boundary"));
        }
        if vad.is_deleting() {
            return Err(Error::AccessViolation(start));
        }
        let vad = Arc::clone(vad);
        Ok((guard, vad))
    }

    /// Creates a new VAD. If `start` is `None`, a free range is located in
    /// the address-space bitmap; otherwise the requested range is checked
    /// against every existing VAD for overlap.
    pub fn create(
        &self,
        start: Option<VirtPageNum>,
        page_count: usize,
        permissions: Permissions,
        is_commit: bool,
        commit: &CommitCounter,
    ) -> Result<Arc<Vad>> {
        if page_count == 0 {
            return Err(Error::InvalidRange("zero-length VAD"));
        }
        if is_commit {
            commit.charge(page_count as u64)?;
        }

        let mut entries = self.entries.write().unwrap();
        let mut bitmap = self.bitmap.lock().unwrap();

        let start = match start {
            Some(start) => {
                if entries.iter().any(|vad| vad.overlaps(start, page_count)) {
                    if is_commit {
                        commit.release(page_count as u64);
                    }
                    return Err(Error::InvalidRange("requested range overlaps an existing VAD"));
                }
                if !bitmap.reserve_at(start.as_usize(), page_count) {
                    if is_commit {
                        commit.release(page_count as u64);
                    }
                    return Err(Error::InvalidRange("requested range outside the address space or already reserved"));
                }
                start
            }
            None => match bitmap.reserve(page_count) {
                Some(bit) => VirtPageNum::new(bit),
                None => {
                    if is_commit {
                        commit.release(page_count as u64);
                    }
                    return Err(Error::InvalidRange("no free address-space range of requested size"));
                }
            },
        };

        let vad = Arc::new(Vad {
            start,
            page_count,
            permissions,
            is_commit,
            fields: Mutex::new(VadFields {
                commit_count: if is_commit { page_count as u64 } else { 0 },
                delete_bit: false,
            }),
        });

        let insert_at = entries
            .binary_search_by_key(&start, |vad| vad.start)
            .unwrap_or_else(|pos| pos);
        entries.insert(insert_at, Arc::clone(&vad));

        log::debug!(
            "created VAD at {:?}, {} pages, commit={}",
            start,
            page_count,
            is_commit
        );
        Ok(vad)
    }

    /// Marks `start`'s VAD as deleting and unlinks it from the list. The
    /// caller is responsible for decommitting the range (releasing its
    /// frames and commit charge) before or after this call; this function
    /// only owns list membership and the bitmap range, not page state.
    pub fn delete(&self, start: VirtPageNum) -> Result<Arc<Vad>> {
        let mut entries = self.entries.write().unwrap();
        let index = entries
            .iter()
            .position(|vad| vad.start == start)
            .ok_or(Error::InvalidRange("no VAD at that start address"))?;

        if !entries[index].mark_deleting() {
            return Err(Error::InvalidRange("VAD is already deleting"));
        }

        let vad = entries.remove(index);
        self.bitmap
            .lock()
            .unwrap()
            .release(vad.start.as_usize(), vad.page_count);
        log::debug!("deleted VAD at {:?}", start);
        Ok(vad)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_find_round_trips() {
        let counter = CommitCounter::new(1000);
        let list = VadList::new(1 << 20);
        let vad = list
            .create(None, 16, Permissions::RW, true, &counter)
            .unwrap();
        assert_eq!(counter.committed(), 16);

        let found = list.find(vad.start.offset(4)).unwrap();
        assert_eq!(found.start, vad.start);
    }

    #[test]
    fn overlapping_explicit_range_rejected() {
        let counter = CommitCounter::new(1000);
        let list = VadList::new(1 << 20);
        let vad = list
            .create(None, 16, Permissions::RW, false, &counter)
            .unwrap();

        let overlap = list.create(
            Some(vad.start.offset(8)),
            16,
            Permissions::R,
            false,
            &counter,
        );
        assert!(overlap.is_err());
    }

    #[test]
    fn delete_marks_and_unlinks() {
        let counter = CommitCounter::new(1000);
        let list = VadList::new(1 << 20);
        let vad = list
            .create(None, 4, Permissions::R, false, &counter)
            .unwrap();
        let start = vad.start;
        drop(vad);

        let deleted = list.delete(start).unwrap();
        assert!(deleted.is_deleting());
        assert!(list.find(start).is_none());
    }

    #[test]
    fn reserve_charges_commit_up_front_and_releases_on_failure() {
        let counter = CommitCounter::new(10);
        let list = VadList::new(1 << 20);
        let err = list.create(None, 20, Permissions::RW, true, &counter);
        assert!(err.is_err());
        assert_eq!(counter.committed(), 0);
    }
}
