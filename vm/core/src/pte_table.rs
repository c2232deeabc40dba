//! The PTE array and its striped locks.
//!
//! PTEs are never mutated except through [`PteTable::write`], which performs
//! a single atomic store; callers are required to already hold the stripe
//! lock covering the destination page. One [`std::sync::Mutex`] protects
//! every `pages_per_lock` contiguous PTEs, trading a little false sharing
//! for a PTE array that does not need one lock per page.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::pte::RawPte;
use crate::types::VirtPageNum;

/// A change-log entry, useful when debugging racy PTE transitions.
#[derive(Debug, Clone, Copy)]
pub struct PteChange {
    pub vpn: VirtPageNum,
    pub old: RawPte,
    pub new: RawPte,
}

/// An owned handle on the stripe lock covering one virtual page, obtained
/// from [`PteTable::lock`].
pub struct StripeGuard<'a> {
    table: &'a PteTable,
    stripe: usize,
    _guard: MutexGuard<'a, ()>,
}

impl<'a> StripeGuard<'a> {
    pub fn stripe(&self) -> usize {
        self.stripe
    }

    /// Reads the current value of `vpn`'s PTE. `vpn` must fall within the
    /// stripe this guard covers.
    pub fn read(&self, vpn: VirtPageNum) -> RawPte {
        self.table.read(vpn)
    }

    /// Publishes `value` as `vpn`'s new PTE with a single atomic store.
    /// `vpn` must fall within the stripe this guard covers.
    pub fn write(&self, vpn: VirtPageNum, value: RawPte) {
        self.table.write_locked(vpn, value);
    }
}

pub struct PteTable {
    entries: Vec<AtomicU64>,
    stripe_locks: Vec<Mutex<()>>,
    pages_per_lock: usize,
    change_log: Mutex<Vec<PteChange>>,
    log_changes: bool,
}

impl PteTable {
    pub fn new(num_pages: usize, pages_per_lock: usize, log_changes: bool) -> Self {
        assert!(pages_per_lock > 0);
        let num_stripes = vm_num_utils::div_ceil(num_pages, pages_per_lock);
        let mut entries = Vec::with_capacity(num_pages);
        entries.resize_with(num_pages, || AtomicU64::new(0));
        let mut stripe_locks = Vec::with_capacity(num_stripes);
        stripe_locks.resize_with(num_stripes, || Mutex::new(()));

        Self {
            entries,
            stripe_locks,
            pages_per_lock,
            change_log: Mutex::new(Vec::new()),
            log_changes,
        }
    }

    pub fn num_pages(&self) -> usize {
        self.entries.len()
    }

    fn stripe_of(&self, vpn: VirtPageNum) -> usize {
        vpn.as_usize() / self.pages_per_lock
    }

    /// Acquires the stripe lock covering `vpn`, blocking until available.
    pub fn lock(&self, vpn: VirtPageNum) -> StripeGuard<'_> {
        let stripe = self.stripe_of(vpn);
        let guard = self.stripe_locks[stripe].lock().unwrap();
        StripeGuard {
            table: self,
            stripe,
            _guard: guard,
        }
    }

    /// Keeps `prev`'s stripe lock held if `cur` hashes to the same stripe,
    /// otherwise releases it and acquires `cur`'s. Range walkers use this to
    /// minimize lock traffic while sweeping a contiguous run of pages.
    pub fn acquire_or_hold<'a>(
        &'a self,
        cur: VirtPageNum,
        prev: Option<StripeGuard<'a>>,
    ) -> StripeGuard<'a> {
        if let Some(prev) = prev {
            if prev.stripe() == self.stripe_of(cur) {
                return prev;
            }
        }
        self.lock(cur)
    }

    fn read(&self, vpn: VirtPageNum) -> RawPte {
        RawPte::from_bits(self.entries[vpn.as_usize()].load(Ordering::Acquire))
    }

    fn write_locked(&self, vpn: VirtPageNum, value: RawPte) {
        let slot = &self.entries[vpn.as_usize()];
        if self.log_changes {
            let old = RawPte::from_bits(slot.load(Ordering::Relaxed));
            self.change_log.lock().unwrap().push(PteChange {
                vpn,
                old,
                new: value,
            });
        }
        slot.store(value.to_bits(), Ordering::Release);
    }

    /// Reads a PTE outside of any lock, for use by code (the fault handler's
    /// initial dispatch) that is about to acquire the stripe lock itself and
    /// only needs an un-synchronized snapshot to decide how to proceed.
    pub fn snapshot(&self, vpn: VirtPageNum) -> RawPte {
        self.read(vpn)
    }

    pub fn recent_changes(&self, limit: usize) -> Vec<PteChange> {
        let log = self.change_log.lock().unwrap();
        let start = log.len().saturating_sub(limit);
        log[start..].to_vec()
    }
}
