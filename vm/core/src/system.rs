//! The top-level `System`: owns every process-global structure and wires
//! them into the `FaultContext`/`WalkContext`/`WorkerContext` each
//! collaborator expects.
//!
//! Grounded on `usermodeMemoryManager.c`'s `initVM`/`initVADNodes`/
//! `terminate` sequence (startup allocates frames, lists, PTE array, PTE
//! lock stripe, VAD bitmap, pagefile, scratch pools, then spawns worker
//! threads; shutdown signals termination, joins workers, and deletes
//! remaining VADs).

use std::sync::Arc;
use std::thread;

use vm_sync::ManualResetEvent;

use crate::commit::CommitCounter;
use crate::config::Config;
use crate::err::Result;
use crate::fault::{self, FaultContext};
use crate::hostmap::HostMapper;
use crate::pagefile::Pagefile;
use crate::pagelist::PageLists;
use crate::pfn::PfnDatabase;
use crate::pte_table::PteTable;
use crate::scratch::ScratchPool;
use crate::types::{AccessRequest, Permissions, VirtPageNum};
use crate::vad::{Vad, VadList};
use crate::walk::{self, WalkContext};
use crate::workers::{self, WorkerContext, WorkerStats};

/// A page of the managed address space reserved as the base of the
/// scratch VA pool, kept outside the range `VadList` hands out so a
/// scratch mapping can never alias a caller's own VAD.
fn scratch_base(config: &Config) -> VirtPageNum {
    VirtPageNum::new(config.address_space_pages())
}

pub struct System {
    config: Config,
    pte_table: PteTable,
    pfn_db: PfnDatabase,
    lists: PageLists,
    vads: VadList,
    pagefile: Pagefile,
    commit: CommitCounter,
    scratch: ScratchPool,
    host: Box<dyn HostMapper>,
    stats: WorkerStats,
    terminate: ManualResetEvent,
    modified_wake: ManualResetEvent,
}

impl System {
    /// Allocates `config.physical_frames` from `host` and builds every
    /// process-global structure. The host is expected to hand back frame
    /// numbers `0..physical_frames`, matching the PFN database's own
    /// indexing; a host that cannot satisfy the request surfaces its
    /// error here rather than panicking.
    pub fn new(config: Config, host: Box<dyn HostMapper>) -> Result<Self> {
        let frames = host.allocate_frames(config.physical_frames)?;
        log::info!(
            "allocated {} physical frames from the host",
            frames.len()
        );

        let address_space_pages = config.address_space_pages();
        let pte_table = PteTable::new(address_space_pages, config.pages_per_lock, config.verbose);
        let pfn_db = PfnDatabase::new(config.physical_frames);
        let lists = PageLists::new(config.physical_frames);
        let vads = VadList::new(address_space_pages);
        let pagefile = Pagefile::new(config.pagefile_slots);
        let commit = CommitCounter::new(config.physical_frames as u64 + config.pagefile_slots as u64);
        let scratch = ScratchPool::new(scratch_base(&config), config.scratch_pool_capacity());

        for index in 0..config.physical_frames {
            lists.free.enqueue(&pfn_db, index as u32);
        }

        Ok(Self {
            config,
            pte_table,
            pfn_db,
            lists,
            vads,
            pagefile,
            commit,
            scratch,
            host,
            stats: WorkerStats::default(),
            terminate: ManualResetEvent::new(false),
            modified_wake: ManualResetEvent::new(false),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn stats(&self) -> &WorkerStats {
        &self.stats
    }

    pub fn available_pages(&self) -> usize {
        self.lists.available()
    }

    pub fn committed_pages(&self) -> u64 {
        self.commit.committed()
    }

    fn fault_ctx(&self) -> FaultContext<'_> {
        FaultContext {
            pte_table: &self.pte_table,
            pfn_db: &self.pfn_db,
            lists: &self.lists,
            vads: &self.vads,
            pagefile: &self.pagefile,
            scratch: &self.scratch,
            host: self.host.as_ref(),
            min_available: self.config.min_available,
        }
    }

    fn walk_ctx(&self) -> WalkContext<'_> {
        WalkContext {
            pte_table: &self.pte_table,
            pfn_db: &self.pfn_db,
            lists: &self.lists,
            vads: &self.vads,
            pagefile: &self.pagefile,
            commit: &self.commit,
            host: self.host.as_ref(),
        }
    }

    fn worker_ctx(&self) -> WorkerContext<'_> {
        WorkerContext {
            pte_table: &self.pte_table,
            pfn_db: &self.pfn_db,
            lists: &self.lists,
            vads: &self.vads,
            pagefile: &self.pagefile,
            commit: &self.commit,
            scratch: &self.scratch,
            host: self.host.as_ref(),
            min_available: self.config.min_available,
            modified_wake: &self.modified_wake,
            terminate: &self.terminate,
        }
    }

    /// Resolves a fault at `vpn` for `request`, retrying transient errors
    /// internally.
    pub fn fault(&self, vpn: VirtPageNum, request: AccessRequest) -> Result<()> {
        fault::handle(&self.fault_ctx(), vpn, request)
    }

    pub fn commit_va(&self, start: VirtPageNum, perms: Permissions, page_count: usize) -> Result<()> {
        walk::commit_va(&self.walk_ctx(), start, perms, page_count)
    }

    pub fn protect_va(&self, start: VirtPageNum, perms: Permissions, page_count: usize) -> Result<()> {
        walk::protect_va(&self.walk_ctx(), start, perms, page_count)
    }

    pub fn decommit_va(&self, start: VirtPageNum, page_count: usize) -> Result<()> {
        walk::decommit_va(&self.walk_ctx(), start, page_count)
    }

    pub fn trim_va(&self, vpn: VirtPageNum) -> Result<()> {
        walk::trim_va(&self.walk_ctx(), vpn, &self.modified_wake)
    }

    /// Creates a VAD, optionally at an explicit start address, charging
    /// commit up front when `is_commit` is set.
    pub fn create_vad(
        &self,
        start: Option<VirtPageNum>,
        page_count: usize,
        permissions: Permissions,
        is_commit: bool,
    ) -> Result<Arc<Vad>> {
        self.vads.create(start, page_count, permissions, is_commit, &self.commit)
    }

    /// Decommits a VAD's entire range and removes it from the list,
    /// releasing its frames, pagefile slots and commit charge.
    pub fn delete_vad(&self, start: VirtPageNum) -> Result<()> {
        let vad = self.vads.find(start).ok_or(crate::err::Error::InvalidRange(
            "no VAD at that start address",
        ))?;
        if vad.start != start {
            return Err(crate::err::Error::InvalidRange(
                "start address is not a VAD's base",
            ));
        }
        let page_count = vad.page_count;
        walk::decommit_va(&self.walk_ctx(), start, page_count)?;
        self.vads.delete(start)?;
        Ok(())
    }

    /// Spawns every worker thread onto `scope`, borrowing `self` for the
    /// scope's lifetime. Callers drive their own command loop after this
    /// returns and call [`System::request_shutdown`] before the scope
    /// exits (which then joins every handle automatically).
    pub fn spawn_workers<'scope, 'env>(
        &'env self,
        scope: &'scope thread::Scope<'scope, 'env>,
    ) -> Vec<thread::ScopedJoinHandle<'scope, ()>> {
        workers::spawn_all(scope, self.worker_ctx(), &self.stats, self.config.num_threads)
    }

    pub fn request_shutdown(&self) {
        self.terminate.set();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.terminate.is_signaled()
    }

    #[cfg(feature = "debug-scans")]
    pub fn debug_dump(&self) {
        log::info!(
            "zero={} free={} standby={} modified={} quarantine={} committed={}/{}",
            self.lists.zero.len(),
            self.lists.free.len(),
            self.lists.standby.len(),
            self.lists.modified.len(),
            self.lists.quarantine.len(),
            self.commit.committed(),
            self.commit.limit(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hostmap::SimulatedHostMapper;

    fn small_system() -> System {
        let config = Config {
            physical_frames: 8,
            pagefile_slots: 8,
            vm_multiplier: 4,
            num_threads: 1,
            pages_per_lock: 8,
            min_available: 2,
            ..Default::default()
        };
        let host = Box::new(SimulatedHostMapper::new(config.physical_frames + 16));
        System::new(config, host).unwrap()
    }

    #[test]
    fn new_system_starts_with_all_frames_free() {
        let system = small_system();
        assert_eq!(system.available_pages(), 8);
        assert_eq!(system.committed_pages(), 0);
    }

    #[test]
    fn create_fault_and_delete_a_vad_round_trips_commit() {
        let system = small_system();
        let vad = system
            .create_vad(Some(VirtPageNum::new(0)), 4, Permissions::RW, true)
            .unwrap();
        assert_eq!(system.committed_pages(), 4);

        system.fault(vad.start, AccessRequest::WRITE).unwrap();
        assert_eq!(system.available_pages(), 7);

        system.delete_vad(vad.start).unwrap();
        assert_eq!(system.committed_pages(), 0);
        assert_eq!(system.available_pages(), 8);
    }
}
