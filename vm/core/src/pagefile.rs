//! The pagefile: a bitmap-managed backing store of fixed-size slots.
//!
//! Grounded on `setPFBitIndex`/`clearPFBitIndex`/`writePage` in
//! `pageFile.c`: a slot is a bit in a bitmap, and reading or writing a
//! slot's contents goes through a scratch VA rather than direct memory
//! access, since the pagefile here is itself only an in-process byte
//! array standing in for a real file.

use std::sync::Mutex;

use vm_bitmap::RunAllocator;

use crate::err::{Error, Result};
use crate::hostmap::HostMapper;
use crate::scratch::ScratchPool;
use crate::types::{FrameNumber, PAGE_SIZE};

/// Sentinel returned in place of a real page's first machine word when no
/// signature check is requested.
pub const NO_SIGNATURE: u64 = 0;

pub struct Pagefile {
    slots: Mutex<RunAllocator>,
    store: Mutex<Vec<[u8; PAGE_SIZE]>>,
}

impl Pagefile {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: Mutex::new(RunAllocator::new(slot_count)),
            store: Mutex::new(vec![[0u8; PAGE_SIZE]; slot_count]),
        }
    }

    pub fn slot_count(&self) -> usize {
        self.store.lock().unwrap().len()
    }

    pub fn slots_in_use(&self) -> usize {
        let slots = self.slots.lock().unwrap();
        (0..slots.capacity()).filter(|&i| slots.get(i)).count()
    }

    /// Writes `frame`'s contents to a newly allocated slot, mapping `frame`
    /// through `scratch` and `host` to read it. Returns the slot index.
    pub fn write(
        &self,
        frame: FrameNumber,
        host: &dyn HostMapper,
        scratch: &ScratchPool,
    ) -> Result<u32> {
        let slot = self
            .slots
            .lock()
            .unwrap()
            .reserve(1)
            .ok_or(Error::Fatal("pagefile exhausted"))? as u32;

        let va = scratch.acquire();
        host.map(va.addr(), std::slice::from_ref(&frame))?;
        let contents = host.read_through(va.addr());
        host.unmap(va.addr(), 1)?;

        let contents = match contents {
            Ok(contents) => contents,
            Err(e) => {
                self.slots.lock().unwrap().release(slot as usize, 1);
                return Err(e);
            }
        };

        self.store.lock().unwrap()[slot as usize] = contents;
        Ok(slot)
    }

    /// Reads `slot`'s contents into `frame`, mapping `frame` through
    /// `scratch` and `host`. If `signature` is `Some`, the first machine
    /// word of the restored page is checked against it when non-zero (a
    /// test-only aliasing invariant, not enforced in production use).
    pub fn read(
        &self,
        slot: u32,
        frame: FrameNumber,
        host: &dyn HostMapper,
        scratch: &ScratchPool,
        signature: Option<u64>,
    ) -> Result<()> {
        let contents = self
            .store
            .lock()
            .unwrap()
            .get(slot as usize)
            .copied()
            .ok_or(Error::Fatal("pagefile read of an unallocated slot"))?;

        if let Some(expected) = signature {
            let first_word = u64::from_ne_bytes(contents[..8].try_into().unwrap());
            if first_word != 0 && first_word != expected {
                return Err(Error::Fatal("pagefile signature mismatch"));
            }
        }

        let va = scratch.acquire();
        host.map(va.addr(), std::slice::from_ref(&frame))?;
        let result = host.write_through(va.addr(), &contents);
        host.unmap(va.addr(), 1)?;
        result
    }

    /// Releases `slot` back to the free bitmap without touching its stored
    /// contents (the next writer will overwrite them before anyone reads).
    pub fn free_slot(&self, slot: u32) {
        self.slots.lock().unwrap().release(slot as usize, 1);
    }
}
