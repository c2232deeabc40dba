//! The three background worker roles: zeroer, modified writer and
//! ager/trimmer. Each runs as a named OS thread polling a termination
//! event between units of work, per the teacher's convention of naming
//! long-lived service threads.
//!
//! Grounded on `usermodeMemoryManager.c`'s `zeroPageWriter`/`zeroPageThread`,
//! `modifiedPageWriter`/`modifiedPageThread` and `trimValidPTEs`/
//! `trimValidPTEThread`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use vm_sync::ManualResetEvent;

use crate::commit::CommitCounter;
use crate::err::Error;
use crate::hostmap::HostMapper;
use crate::pagefile::Pagefile;
use crate::pagelist::PageLists;
use crate::pfn::FrameState;
use crate::pte::{PteView, RawPte};
use crate::pte_table::PteTable;
use crate::scratch::ScratchPool;
use crate::types::{VirtPageNum, PAGE_SIZE};
use crate::vad::VadList;
use crate::walk::{self, WalkContext};

/// Everything a worker thread needs. Bundled the same way [`crate::fault::FaultContext`]
/// and [`WalkContext`] are, since a worker is really a driver loop around
/// the same set of collaborators. Every field is a shared reference, so
/// the context itself is freely `Copy` into each spawned thread's closure.
#[derive(Clone, Copy)]
pub struct WorkerContext<'a> {
    pub pte_table: &'a PteTable,
    pub pfn_db: &'a crate::pfn::PfnDatabase,
    pub lists: &'a PageLists,
    pub vads: &'a VadList,
    pub pagefile: &'a Pagefile,
    pub commit: &'a CommitCounter,
    pub scratch: &'a ScratchPool,
    pub host: &'a dyn HostMapper,
    pub min_available: usize,
    pub modified_wake: &'a ManualResetEvent,
    pub terminate: &'a ManualResetEvent,
}

impl<'a> WorkerContext<'a> {
    fn walk_ctx(&self) -> WalkContext<'a> {
        WalkContext {
            pte_table: self.pte_table,
            pfn_db: self.pfn_db,
            lists: self.lists,
            vads: self.vads,
            pagefile: self.pagefile,
            commit: self.commit,
            host: self.host,
        }
    }
}

/// Counters surfaced for the CLI's debug dumps and the stress harness.
#[derive(Default)]
pub struct WorkerStats {
    pub zeroed: AtomicU64,
    pub written: AtomicU64,
    pub trimmed: AtomicU64,
}

/// Dequeues one frame from Free, zeros it through a scratch VA, and
/// enqueues it to Zero (or Quarantine, if a concurrent page-trade marked
/// it `AwaitingQuarantine` while the lock was released). Returns `false`
/// when Free was empty, signaling the caller to wait on a new-page event.
fn zero_one_page(ctx: WorkerContext<'_>) -> bool {
    let (idx, mut inner) = match ctx.lists.free.dequeue_head(ctx.pfn_db) {
        Some(got) => got,
        None => return false,
    };
    inner.write_in_progress = true;
    drop(inner);

    let va = ctx.scratch.acquire();
    let zeroed = (|| -> crate::err::Result<()> {
        ctx.host.map(va.addr(), &[crate::types::FrameNumber::new(idx)])?;
        ctx.host.write_through(va.addr(), &[0u8; PAGE_SIZE])?;
        ctx.host.unmap(va.addr(), 1)?;
        Ok(())
    })();
    drop(va);

    let mut inner = ctx.pfn_db.frame(idx).lock();
    inner.write_in_progress = false;
    let drifted_to_quarantine = inner.state == FrameState::AwaitingQuarantine;
    drop(inner);

    if let Err(e) = zeroed {
        log::warn!(target: "zeroer", "failed to zero frame {idx}: {e}");
        ctx.lists.free.enqueue(ctx.pfn_db, idx);
        return true;
    }

    if drifted_to_quarantine {
        ctx.lists.quarantine.enqueue(ctx.pfn_db, idx);
    } else {
        ctx.lists.zero.enqueue(ctx.pfn_db, idx);
    }
    true
}

/// Runs the zeroer loop until `ctx.terminate` is signaled.
pub fn run_zeroer(ctx: WorkerContext<'_>, stats: &WorkerStats) {
    loop {
        if ctx.terminate.is_signaled() {
            return;
        }
        if zero_one_page(ctx) {
            stats.zeroed.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        vm_sync::wait_any(&[ctx.terminate, &ctx.lists.free.new_pages]);
    }
}

/// Dequeues one frame from Modified, writes its contents to a newly
/// allocated pagefile slot, and parks it on Standby — unless the page
/// drifted to `AwaitingFree` or was re-dirtied while the frame lock was
/// released, either of which take the corresponding alternate path.
/// Returns `false` when Modified was empty.
fn write_one_page(ctx: WorkerContext<'_>) -> bool {
    let (idx, mut inner) = match ctx.lists.modified.dequeue_head(ctx.pfn_db) {
        Some(got) => got,
        None => return false,
    };
    debug_assert!(inner.pagefile_slot.is_none());
    inner.write_in_progress = true;
    inner.remodified = false;
    drop(inner);

    let frame = crate::types::FrameNumber::new(idx);
    let write_result = ctx.pagefile.write(frame, ctx.host, ctx.scratch);

    let mut inner = ctx.pfn_db.frame(idx).lock();
    inner.write_in_progress = false;

    if inner.state == FrameState::AwaitingFree {
        drop(inner);
        ctx.lists.free.enqueue(ctx.pfn_db, idx);
        return true;
    }

    let slot = match write_result {
        Ok(slot) => slot,
        Err(e) => {
            log::warn!(target: "modified-writer", "pagefile write failed for frame {idx}: {e}");
            let requeue = inner.state != FrameState::Active;
            inner.remodified = !requeue;
            drop(inner);
            if requeue {
                ctx.lists.modified.enqueue(ctx.pfn_db, idx);
                ctx.modified_wake.pulse();
            }
            return true;
        }
    };

    if inner.remodified {
        inner.remodified = false;
        let requeue = inner.state != FrameState::Active;
        drop(inner);
        ctx.pagefile.free_slot(slot);
        if requeue {
            ctx.lists.modified.enqueue(ctx.pfn_db, idx);
            ctx.modified_wake.pulse();
        }
        return true;
    }

    if inner.state != FrameState::Active {
        inner.pagefile_slot = Some(slot);
        drop(inner);
        ctx.lists.standby.enqueue(ctx.pfn_db, idx);
    } else {
        inner.pagefile_slot = Some(slot);
    }
    true
}

/// Runs the modified writer loop until `ctx.terminate` is signaled.
pub fn run_modified_writer(ctx: WorkerContext<'_>, stats: &WorkerStats) {
    loop {
        if ctx.terminate.is_signaled() {
            return;
        }
        if write_one_page(ctx) {
            stats.written.fetch_add(1, Ordering::Relaxed);
            continue;
        }
        vm_sync::wait_any(&[ctx.terminate, ctx.modified_wake, &ctx.lists.modified.new_pages]);
    }
}

/// One sweep across the whole PTE array: for each hardware-valid PTE,
/// trim it if its aging bit is already set (or unconditionally once
/// `available()` falls below `min_available`), otherwise set the aging
/// bit so the next sweep will trim it. Returns the number of pages
/// trimmed this sweep.
fn sweep_once(ctx: WorkerContext<'_>) -> u64 {
    let walk_ctx = ctx.walk_ctx();
    let mut trimmed = 0u64;

    for index in 0..ctx.pte_table.num_pages() {
        if ctx.terminate.is_signaled() {
            break;
        }
        let vpn = VirtPageNum::new(index);
        let force = ctx.lists.available() < ctx.min_available;

        let stripe = ctx.pte_table.lock(vpn);
        let (perms, dirty, aging, pfn) = match stripe.read(vpn).decode() {
            PteView::Hardware {
                perms,
                dirty,
                aging,
                pfn,
            } => (perms, dirty, aging, pfn),
            _ => continue,
        };

        if aging || force {
            drop(stripe);
            match walk::trim_va(&walk_ctx, vpn, ctx.modified_wake) {
                Ok(()) => trimmed += 1,
                Err(Error::PageStateChange) => {}
                Err(e) => log::warn!(target: "ager-trimmer", "trim of {vpn:?} failed: {e}"),
            }
        } else {
            stripe.write(
                vpn,
                RawPte::encode(PteView::Hardware {
                    perms,
                    dirty,
                    aging: true,
                    pfn,
                }),
            );
        }
    }
    trimmed
}

/// Runs the ager/trimmer loop until `ctx.terminate` is signaled, woken by
/// the low-water event and by its own bounded wait timeout so a sweep
/// always eventually happens even with no explicit wake.
pub fn run_ager_trimmer(ctx: WorkerContext<'_>, stats: &WorkerStats) {
    loop {
        if ctx.terminate.is_signaled() {
            return;
        }
        let trimmed = sweep_once(ctx);
        stats.trimmed.fetch_add(trimmed, Ordering::Relaxed);
        vm_sync::wait_any(&[ctx.terminate, &ctx.lists.trim_wake]);
    }
}

/// Spawns `num_threads` zeroers, `num_threads` modified writers and one
/// ager/trimmer onto `scope`, each a named thread holding its own copy of
/// `ctx` (cheap: every field is a shared reference). The caller joins
/// (implicitly, at the end of the enclosing `thread::scope` block, or
/// explicitly via the returned handles) before `ctx`'s borrowed state is
/// dropped.
pub fn spawn_all<'scope, 'env>(
    scope: &'scope thread::Scope<'scope, 'env>,
    ctx: WorkerContext<'env>,
    stats: &'env WorkerStats,
    num_threads: usize,
) -> Vec<thread::ScopedJoinHandle<'scope, ()>> {
    let mut handles = Vec::with_capacity(num_threads * 2 + 1);
    for i in 0..num_threads {
        handles.push(
            thread::Builder::new()
                .name(format!("zeroer-{i}"))
                .spawn_scoped(scope, move || run_zeroer(ctx, stats))
                .expect("failed to spawn zeroer thread"),
        );
    }
    for i in 0..num_threads {
        handles.push(
            thread::Builder::new()
                .name(format!("modified-writer-{i}"))
                .spawn_scoped(scope, move || run_modified_writer(ctx, stats))
                .expect("failed to spawn modified-writer thread"),
        );
    }
    handles.push(
        thread::Builder::new()
            .name("ager-trimmer".to_string())
            .spawn_scoped(scope, move || run_ager_trimmer(ctx, stats))
            .expect("failed to spawn ager-trimmer thread"),
    );
    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitCounter;
    use crate::hostmap::SimulatedHostMapper;
    use crate::pfn::PfnDatabase;
    use crate::types::Permissions;

    fn setup() -> (
        PteTable,
        PfnDatabase,
        PageLists,
        VadList,
        Pagefile,
        ScratchPool,
        SimulatedHostMapper,
        CommitCounter,
        ManualResetEvent,
        ManualResetEvent,
    ) {
        (
            PteTable::new(32, 32, false),
            PfnDatabase::new(4),
            PageLists::new(4),
            VadList::new(32),
            Pagefile::new(4),
            ScratchPool::new(VirtPageNum::new(1000), 2),
            SimulatedHostMapper::new(4),
            CommitCounter::new(16),
            ManualResetEvent::new(false),
            ManualResetEvent::new(false),
        )
    }

    #[test]
    fn zeroer_moves_a_free_page_to_zero_list() {
        let (pte_table, pfn_db, lists, vads, pagefile, scratch, host, commit, wake, term) =
            setup();
        lists.free.enqueue(&pfn_db, 0);

        let ctx = WorkerContext {
            pte_table: &pte_table,
            pfn_db: &pfn_db,
            lists: &lists,
            vads: &vads,
            pagefile: &pagefile,
            commit: &commit,
            scratch: &scratch,
            host: &host,
            min_available: 1,
            modified_wake: &wake,
            terminate: &term,
        };

        assert!(zero_one_page(ctx));
        assert_eq!(lists.zero.len(), 1);
        assert_eq!(lists.free.len(), 0);
    }

    #[test]
    fn modified_writer_parks_a_written_page_on_standby() {
        let (pte_table, pfn_db, lists, vads, pagefile, scratch, host, commit, wake, term) =
            setup();
        let frames = host.allocate_frames(1).unwrap();
        let va = VirtPageNum::new(5);
        host.map(va, &frames).unwrap();
        lists.modified.enqueue(&pfn_db, frames[0].as_u32());

        let ctx = WorkerContext {
            pte_table: &pte_table,
            pfn_db: &pfn_db,
            lists: &lists,
            vads: &vads,
            pagefile: &pagefile,
            commit: &commit,
            scratch: &scratch,
            host: &host,
            min_available: 1,
            modified_wake: &wake,
            terminate: &term,
        };

        assert!(write_one_page(ctx));
        assert_eq!(lists.standby.len(), 1);
        assert_eq!(pagefile.slots_in_use(), 1);
    }

    #[test]
    fn ager_sweep_sets_aging_then_trims_on_next_pass() {
        let (pte_table, pfn_db, lists, vads, pagefile, scratch, host, commit, wake, term) =
            setup();
        lists.free.enqueue(&pfn_db, 0);
        vads.create(Some(VirtPageNum::new(0)), 8, Permissions::RW, true, &commit)
            .unwrap();

        let fault_ctx = crate::fault::FaultContext {
            pte_table: &pte_table,
            pfn_db: &pfn_db,
            lists: &lists,
            vads: &vads,
            pagefile: &pagefile,
            scratch: &scratch,
            host: &host,
            min_available: 4,
        };
        crate::fault::handle(&fault_ctx, VirtPageNum::new(2), crate::types::AccessRequest::READ)
            .unwrap();

        let ctx = WorkerContext {
            pte_table: &pte_table,
            pfn_db: &pfn_db,
            lists: &lists,
            vads: &vads,
            pagefile: &pagefile,
            commit: &commit,
            scratch: &scratch,
            host: &host,
            min_available: 100,
            modified_wake: &wake,
            terminate: &term,
        };

        assert_eq!(sweep_once(ctx), 0);
        match pte_table.snapshot(VirtPageNum::new(2)).decode() {
            PteView::Hardware { aging, .. } => assert!(aging),
            other => panic!("expected hardware PTE, got {other:?}"),
        }

        assert_eq!(sweep_once(ctx), 1);
        match pte_table.snapshot(VirtPageNum::new(2)).decode() {
            PteView::Transition { .. } => {}
            other => panic!("expected transition PTE after trim, got {other:?}"),
        }
    }
}
