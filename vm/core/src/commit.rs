//! The global committed-page counter.
//!
//! A single `AtomicU64` updated with compare-exchange loops rather than a
//! mutex, since every caller only ever wants to add or subtract a bounded
//! amount and check it against `memory_limit` — no caller needs to observe
//! any other field alongside the counter.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::err::{Error, Result};

pub struct CommitCounter {
    committed: AtomicU64,
    limit: u64,
}

impl CommitCounter {
    pub fn new(limit: u64) -> Self {
        Self {
            committed: AtomicU64::new(0),
            limit,
        }
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn available(&self) -> u64 {
        self.limit.saturating_sub(self.committed())
    }

    /// Charges `n` pages against the limit, failing without side effects if
    /// doing so would exceed it.
    pub fn charge(&self, n: u64) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let mut current = self.committed.load(Ordering::Acquire);
        loop {
            let next = current.checked_add(n).ok_or(Error::InsufficientCommit {
                requested: n,
                available: self.limit.saturating_sub(current),
            })?;
            if next > self.limit {
                return Err(Error::InsufficientCommit {
                    requested: n,
                    available: self.limit - current,
                });
            }
            match self.committed.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }

    pub fn release(&self, n: u64) {
        if n == 0 {
            return;
        }
        let mut current = self.committed.load(Ordering::Acquire);
        loop {
            let next = current.checked_sub(n).unwrap_or_else(|| {
                debug_assert!(false, "released more pages than were committed");
                0
            });
            match self.committed.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_and_release_round_trip() {
        let counter = CommitCounter::new(100);
        counter.charge(40).unwrap();
        assert_eq!(counter.committed(), 40);
        counter.release(10);
        assert_eq!(counter.committed(), 30);
    }

    #[test]
    fn charge_rejects_overcommit() {
        let counter = CommitCounter::new(10);
        counter.charge(10).unwrap();
        assert!(counter.charge(1).is_err());
    }

}
