//! The scratch VA pool: a fixed set of mapping windows shared by every
//! worker and fault path that needs to zero, write, read or trade a
//! frame's contents.
//!
//! Grounded on the source's `pageTradeVAListHead` (a dedicated queue of
//! `VANode`s, dequeued before use and re-enqueued after) generalized to
//! cover every scratch use (zero, pagefile write, pagefile read, trade)
//! from one pool rather than one queue per purpose, since all four uses
//! are mutually exclusive in time and none is hotter than the others.

use std::collections::VecDeque;
use std::sync::Mutex;

use vm_sync::ManualResetEvent;

use crate::err::Result;
use crate::hostmap::HostMapper;
use crate::types::{FrameNumber, VirtPageNum};

/// One borrowed scratch virtual address. Returned to the pool when dropped.
pub struct ScratchVa<'a> {
    pool: &'a ScratchPool,
    va: VirtPageNum,
}

impl ScratchVa<'_> {
    pub fn addr(&self) -> VirtPageNum {
        self.va
    }
}

impl Drop for ScratchVa<'_> {
    fn drop(&mut self) {
        self.pool.release(self.va);
    }
}

/// A fixed pool of `capacity` scratch virtual pages, reserved outside the
/// address space that VADs hand out. Sized to at least
/// `num_threads + small constant` so that no set of concurrently-running
/// threads can starve each other waiting for a scratch VA.
pub struct ScratchPool {
    free: Mutex<VecDeque<VirtPageNum>>,
    available: ManualResetEvent,
}

impl ScratchPool {
    pub fn new(base: VirtPageNum, capacity: usize) -> Self {
        let free = (0..capacity).map(|i| base.offset(i)).collect();
        Self {
            free: Mutex::new(free),
            available: ManualResetEvent::new(capacity > 0),
        }
    }

    /// Dequeues a scratch VA, blocking until one is available.
    pub fn acquire(&self) -> ScratchVa<'_> {
        loop {
            {
                let mut free = self.free.lock().unwrap();
                if let Some(va) = free.pop_front() {
                    if free.is_empty() {
                        self.available.reset();
                    }
                    return ScratchVa { pool: self, va };
                }
            }
            self.available.wait_timeout();
        }
    }

    fn release(&self, va: VirtPageNum) {
        let mut free = self.free.lock().unwrap();
        free.push_back(va);
        self.available.set();
    }

    /// Copies `src`'s contents into `dst` through a scratch VA, without an
    /// intermediate pagefile round-trip. Exposed for a modified writer that
    /// wants to consolidate dirty frames before a batched write-back;
    /// nothing in this crate calls it automatically.
    pub fn trade(&self, host: &dyn HostMapper, src: FrameNumber, dst: FrameNumber) -> Result<()> {
        let src_va = self.acquire();
        host.map(src_va.addr(), &[src])?;
        let data = host.read_through(src_va.addr())?;
        host.unmap(src_va.addr(), 1)?;
        drop(src_va);

        let dst_va = self.acquire();
        host.map(dst_va.addr(), &[dst])?;
        host.write_through(dst_va.addr(), &data)?;
        host.unmap(dst_va.addr(), 1)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostmap::SimulatedHostMapper;

    #[test]
    fn trade_copies_frame_contents_without_touching_the_source() {
        let pool = ScratchPool::new(VirtPageNum::new(1000), 2);
        let host = SimulatedHostMapper::new(4);
        let frames = host.allocate_frames(2).unwrap();

        let src_va = VirtPageNum::new(2000);
        host.map(src_va, &[frames[0]]).unwrap();
        host.write_through(src_va, &[9u8; crate::types::PAGE_SIZE])
            .unwrap();
        host.unmap(src_va, 1).unwrap();

        pool.trade(&host, frames[0], frames[1]).unwrap();

        host.map(src_va, &[frames[1]]).unwrap();
        assert_eq!(
            host.read_through(src_va).unwrap(),
            [9u8; crate::types::PAGE_SIZE]
        );
    }

    #[test]
    fn acquire_then_drop_returns_to_pool() {
        let pool = ScratchPool::new(VirtPageNum::new(0), 2);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(a.addr(), b.addr());
        drop(a);
        let c = pool.acquire();
        assert!(c.addr() == VirtPageNum::new(0) || c.addr() == VirtPageNum::new(1));
    }

    #[test]
    fn empty_pool_blocks_until_release() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let pool = Arc::new(ScratchPool::new(VirtPageNum::new(0), 1));
        let held = pool.acquire();
        let pool2 = pool.clone();
        let handle = thread::spawn(move || {
            let _second = pool2.acquire();
        });
        thread::sleep(Duration::from_millis(20));
        drop(held);
        handle.join().unwrap();
    }
}
