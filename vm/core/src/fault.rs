//! The fault handler: dispatches on a PTE's decoded state and materializes
//! a valid mapping for it.
//!
//! Grounded on `pageFault.c`'s `pageFault`/`validPageFault`/`transPageFault`/
//! `pageFilePageFault`/`demandZeroPageFault` family, restructured as one
//! dispatch function per [`PteView`] variant instead of per named C
//! function, since the variant tag already encodes which case applies.

use std::sync::Arc;

use vm_sync::SpinGuard;

use crate::err::{Error, Result};
use crate::hostmap::HostMapper;
use crate::pagefile::Pagefile;
use crate::pagelist::PageLists;
use crate::pfn::{FrameInner, FrameState, PfnDatabase, ReadCompletion};
use crate::pte::{PteView, RawPte};
use crate::pte_table::{PteTable, StripeGuard};
use crate::scratch::ScratchPool;
use crate::types::{AccessRequest, FrameNumber, Permissions, VirtPageNum, PAGE_SIZE};
use crate::vad::VadList;

/// Everything the fault handler needs, bundled so call sites don't thread
/// eight parameters through every helper.
pub struct FaultContext<'a> {
    pub pte_table: &'a PteTable,
    pub pfn_db: &'a PfnDatabase,
    pub lists: &'a PageLists,
    pub vads: &'a VadList,
    pub pagefile: &'a Pagefile,
    pub scratch: &'a ScratchPool,
    pub host: &'a dyn HostMapper,
    /// Low-water mark on `{zero, free, standby}`; crossing it below pulses
    /// the ager/trimmer awake instead of waiting for its bounded timeout.
    pub min_available: usize,
}

/// Resolves a fault at `vpn` for `request`, retrying internally on the two
/// transient error kinds until the access either succeeds or fails with a
/// structural error.
pub fn handle(ctx: &FaultContext<'_>, vpn: VirtPageNum, request: AccessRequest) -> Result<()> {
    loop {
        match try_once(ctx, vpn, request) {
            Ok(()) => return Ok(()),
            Err(Error::PageStateChange) => continue,
            Err(Error::NoAvailablePages) => {
                vm_sync::wait_any(&ctx.lists.new_page_events());
                continue;
            }
            Err(e) => return Err(e),
        }
    }
}

fn try_once(ctx: &FaultContext<'_>, vpn: VirtPageNum, request: AccessRequest) -> Result<()> {
    let stripe = ctx.pte_table.lock(vpn);
    let snapshot = stripe.read(vpn);

    match snapshot.decode() {
        PteView::Hardware {
            perms,
            dirty,
            aging: _,
            pfn,
        } => valid_fault(ctx, vpn, perms, dirty, pfn, request, &stripe),
        PteView::Transition { perms, pfn } => {
            transition_fault(ctx, vpn, perms, pfn, request, stripe)
        }
        PteView::Pagefile { perms, slot } => {
            pagefile_fault(ctx, vpn, perms, slot, request, stripe)
        }
        PteView::DemandZero { perms, decommit } => {
            if decommit {
                return Err(Error::AccessViolation(vpn));
            }
            demand_zero_fault(ctx, vpn, perms, request, stripe)
        }
        PteView::Zero => {
            let vad = ctx.vads.find(vpn).ok_or(Error::AccessViolation(vpn))?;
            if !vad.is_commit || vad.is_deleting() {
                return Err(Error::AccessViolation(vpn));
            }
            demand_zero_fault(ctx, vpn, vad.permissions, request, stripe)
        }
    }
}

fn valid_fault(
    ctx: &FaultContext<'_>,
    vpn: VirtPageNum,
    perms: Permissions,
    dirty: bool,
    pfn: u32,
    request: AccessRequest,
    stripe: &StripeGuard<'_>,
) -> Result<()> {
    if !perms.covers(request) {
        return Err(Error::AccessViolation(vpn));
    }

    let mut dirty = dirty;
    if request.write {
        dirty = true;
        let mut inner = ctx.pfn_db.frame(pfn).lock();
        if !inner.write_in_progress {
            if let Some(slot) = inner.pagefile_slot.take() {
                ctx.pagefile.free_slot(slot);
            }
        } else {
            inner.remodified = true;
        }
    }

    stripe.write(
        vpn,
        RawPte::encode(PteView::Hardware {
            perms,
            dirty,
            aging: false,
            pfn,
        }),
    );
    Ok(())
}

fn transition_fault(
    ctx: &FaultContext<'_>,
    vpn: VirtPageNum,
    perms: Permissions,
    pfn: u32,
    request: AccessRequest,
    stripe: StripeGuard<'_>,
) -> Result<()> {
    if !perms.covers(request) {
        return Err(Error::AccessViolation(vpn));
    }

    let frame = ctx.pfn_db.frame(pfn);
    let mut inner = frame.lock();

    if inner.read_in_progress {
        let event = inner
            .read_event
            .clone()
            .expect("read_in_progress set without a read_event");
        inner.ref_count += 1;
        drop(inner);
        drop(stripe);

        while !event.event.is_signaled() {
            event.event.wait_timeout();
        }

        let mut inner = frame.lock();
        inner.ref_count -= 1;
        if inner.ref_count == 0 {
            inner.read_event = None;
        }
        return Err(Error::PageStateChange);
    }

    let mut new_dirty = false;
    if request.write {
        new_dirty = true;
        if !inner.write_in_progress {
            if let Some(slot) = inner.pagefile_slot.take() {
                ctx.pagefile.free_slot(slot);
            }
        } else {
            inner.remodified = true;
        }
    } else if inner.state == FrameState::Modified {
        new_dirty = true;
    }

    if !inner.write_in_progress {
        match inner.state {
            FrameState::Standby => ctx.lists.standby.remove(ctx.pfn_db, pfn),
            FrameState::Modified => ctx.lists.modified.remove(ctx.pfn_db, pfn),
            _ => {}
        }
    }

    inner.reverse_pte_index = Some(vpn.as_usize());
    inner.state = FrameState::Active;
    drop(inner);

    stripe.write(
        vpn,
        RawPte::encode(PteView::Hardware {
            perms,
            dirty: new_dirty,
            aging: false,
            pfn,
        }),
    );
    ctx.host.map(vpn, &[FrameNumber::new(pfn)])?;
    Ok(())
}

fn pagefile_fault(
    ctx: &FaultContext<'_>,
    vpn: VirtPageNum,
    perms: Permissions,
    slot: u32,
    request: AccessRequest,
    stripe: StripeGuard<'_>,
) -> Result<()> {
    if !perms.covers(request) {
        return Err(Error::AccessViolation(vpn));
    }

    let expected = RawPte::encode(PteView::Pagefile { perms, slot });
    drop(stripe);

    let (frame_idx, mut inner) = obtain_frame(ctx)?;

    let stripe = ctx.pte_table.lock(vpn);
    if stripe.read(vpn) != expected {
        drop(inner);
        retire_to_free(ctx, frame_idx);
        return Err(Error::PageStateChange);
    }

    let event = ReadCompletion::new();
    inner.state = FrameState::Standby;
    inner.read_in_progress = true;
    inner.read_event = Some(Arc::clone(&event));
    inner.ref_count = 1;
    inner.reverse_pte_index = Some(vpn.as_usize());
    drop(inner);

    let transition = RawPte::encode(PteView::Transition {
        perms,
        pfn: frame_idx,
    });
    stripe.write(vpn, transition);
    drop(stripe);

    let frame_number = FrameNumber::new(frame_idx);
    let signature = vpn.addr() as u64;
    let read_result = ctx
        .pagefile
        .read(slot, frame_number, ctx.host, ctx.scratch, Some(signature));

    let stripe = ctx.pte_table.lock(vpn);

    if let Err(e) = read_result {
        finish_read(ctx.pfn_db, frame_idx, &event);
        retire_to_free(ctx, frame_idx);
        return Err(e);
    }

    if stripe.read(vpn) != transition {
        finish_read(ctx.pfn_db, frame_idx, &event);
        retire_to_free(ctx, frame_idx);
        return Err(Error::PageStateChange);
    }

    let dirty = request.write;
    {
        let mut inner = ctx.pfn_db.frame(frame_idx).lock();
        if request.write {
            ctx.pagefile.free_slot(slot);
        } else {
            inner.pagefile_slot = Some(slot);
        }
        inner.state = FrameState::Active;
        inner.read_in_progress = false;
        inner.ref_count -= 1;
        if inner.ref_count == 0 {
            inner.read_event = None;
        }
    }
    event.event.set();

    stripe.write(
        vpn,
        RawPte::encode(PteView::Hardware {
            perms,
            dirty,
            aging: false,
            pfn: frame_idx,
        }),
    );
    ctx.host.map(vpn, &[frame_number])?;
    Ok(())
}

fn finish_read(pfn_db: &PfnDatabase, frame_idx: u32, event: &Arc<ReadCompletion>) {
    let mut inner = pfn_db.frame(frame_idx).lock();
    inner.read_in_progress = false;
    inner.ref_count -= 1;
    if inner.ref_count == 0 {
        inner.read_event = None;
    }
    drop(inner);
    event.event.set();
}

fn retire_to_free(ctx: &FaultContext<'_>, frame_idx: u32) {
    ctx.lists.free.enqueue(ctx.pfn_db, frame_idx);
}

fn demand_zero_fault(
    ctx: &FaultContext<'_>,
    vpn: VirtPageNum,
    perms: Permissions,
    request: AccessRequest,
    stripe: StripeGuard<'_>,
) -> Result<()> {
    if !perms.covers(request) {
        return Err(Error::AccessViolation(vpn));
    }

    let snapshot = stripe.read(vpn);
    drop(stripe);

    let (frame_idx, mut inner) = obtain_frame(ctx)?;

    let stripe = ctx.pte_table.lock(vpn);
    if stripe.read(vpn) != snapshot {
        drop(inner);
        retire_to_free(ctx, frame_idx);
        return Err(Error::PageStateChange);
    }

    inner.state = FrameState::Active;
    inner.reverse_pte_index = Some(vpn.as_usize());
    drop(inner);

    let dirty = request.write;
    stripe.write(
        vpn,
        RawPte::encode(PteView::Hardware {
            perms,
            dirty,
            aging: false,
            pfn: frame_idx,
        }),
    );
    ctx.host.map(vpn, &[FrameNumber::new(frame_idx)])?;
    Ok(())
}

/// Obtains a frame ready for immediate use: zeroed contents, no pagefile
/// slot, no outstanding list membership. Tries zero, then free (zeroing it
/// first), then standby's tail (demoting its transition PTE and zeroing).
fn obtain_frame<'a>(ctx: &FaultContext<'a>) -> Result<(u32, SpinGuard<'a, FrameInner>)> {
    let result = obtain_frame_inner(ctx);
    if result.is_ok() {
        ctx.lists.check_low_water(ctx.min_available);
    }
    result
}

fn obtain_frame_inner<'a>(ctx: &FaultContext<'a>) -> Result<(u32, SpinGuard<'a, FrameInner>)> {
    if let Some(got) = ctx.lists.zero.dequeue_head(ctx.pfn_db) {
        return Ok(got);
    }
    if let Some((idx, guard)) = ctx.lists.free.dequeue_head(ctx.pfn_db) {
        zero_frame(ctx, idx)?;
        return Ok((idx, guard));
    }
    if let Some((idx, mut guard)) = ctx.lists.standby.dequeue_tail(ctx.pfn_db) {
        demote_standby_frame(ctx, idx, &mut guard)?;
        zero_frame(ctx, idx)?;
        return Ok((idx, guard));
    }
    Err(Error::NoAvailablePages)
}

fn zero_frame(ctx: &FaultContext<'_>, idx: u32) -> Result<()> {
    let va = ctx.scratch.acquire();
    ctx.host.map(va.addr(), &[FrameNumber::new(idx)])?;
    ctx.host.write_through(va.addr(), &[0u8; PAGE_SIZE])?;
    ctx.host.unmap(va.addr(), 1)?;
    Ok(())
}

/// Rewrites the PTE a reclaimed standby frame used to back, turning its
/// transition entry into a demand-zero or pagefile-backed entry so the
/// next fault on that VA resolves correctly.
fn demote_standby_frame(
    ctx: &FaultContext<'_>,
    _idx: u32,
    guard: &mut SpinGuard<'_, FrameInner>,
) -> Result<()> {
    let vpn_index = guard
        .reverse_pte_index
        .ok_or(Error::Fatal("standby frame missing its reverse PTE index"))?;
    let vpn = VirtPageNum::new(vpn_index);

    let stripe = ctx.pte_table.lock(vpn);
    let perms = match stripe.read(vpn).decode() {
        PteView::Transition { perms, .. } => perms,
        _ => return Err(Error::Fatal("standby frame's PTE was not in transition state")),
    };

    let new_pte = match guard.pagefile_slot.take() {
        Some(slot) => RawPte::encode(PteView::Pagefile { perms, slot }),
        None => RawPte::encode(PteView::DemandZero {
            perms,
            decommit: false,
        }),
    };
    stripe.write(vpn, new_pte);
    guard.reverse_pte_index = None;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit::CommitCounter;
    use crate::hostmap::SimulatedHostMapper;

    fn harness(
        num_frames: usize,
        num_pages: usize,
    ) -> (
        PteTable,
        PfnDatabase,
        PageLists,
        VadList,
        Pagefile,
        ScratchPool,
        SimulatedHostMapper,
        CommitCounter,
    ) {
        (
            PteTable::new(num_pages, 64, false),
            PfnDatabase::new(num_frames),
            PageLists::new(num_frames),
            VadList::new(num_pages),
            Pagefile::new(4),
            ScratchPool::new(VirtPageNum::new(num_pages + 1000), 4),
            SimulatedHostMapper::new(num_frames),
            CommitCounter::new((num_frames + 4) as u64),
        )
    }

    fn seed_free_list(pfn_db: &PfnDatabase, lists: &PageLists, count: usize) {
        for i in 0..count {
            lists.free.enqueue(pfn_db, i as u32);
        }
    }

    #[test]
    fn demand_zero_fault_materializes_a_mapping() {
        let (pte_table, pfn_db, lists, vads, pagefile, scratch, host, commit) = harness(4, 16);
        seed_free_list(&pfn_db, &lists, 4);
        let vad = vads
            .create(
                Some(VirtPageNum::new(0)),
                16,
                Permissions::RW,
                true,
                &commit,
            )
            .unwrap();
        assert_eq!(vad.commit_count(), 16);

        let ctx = FaultContext {
            pte_table: &pte_table,
            pfn_db: &pfn_db,
            lists: &lists,
            vads: &vads,
            pagefile: &pagefile,
            scratch: &scratch,
            host: &host,
            min_available: 4,
        };

        handle(&ctx, VirtPageNum::new(3), AccessRequest::WRITE).unwrap();

        let pte = pte_table.snapshot(VirtPageNum::new(3));
        match pte.decode() {
            PteView::Hardware { perms, dirty, .. } => {
                assert_eq!(perms, Permissions::RW);
                assert!(dirty);
            }
            other => panic!("expected a hardware PTE, got {other:?}"),
        }
    }

    #[test]
    fn fault_outside_any_vad_is_an_access_violation() {
        let (pte_table, pfn_db, lists, vads, pagefile, scratch, host, _commit) = harness(4, 16);
        let ctx = FaultContext {
            pte_table: &pte_table,
            pfn_db: &pfn_db,
            lists: &lists,
            vads: &vads,
            pagefile: &pagefile,
            scratch: &scratch,
            host: &host,
            min_available: 4,
        };

        let err = handle(&ctx, VirtPageNum::new(5), AccessRequest::READ).unwrap_err();
        assert!(matches!(err, Error::AccessViolation(_)));
    }

    #[test]
    fn revisiting_a_valid_page_for_write_sets_dirty() {
        let (pte_table, pfn_db, lists, vads, pagefile, scratch, host, commit) = harness(4, 16);
        seed_free_list(&pfn_db, &lists, 4);
        vads.create(Some(VirtPageNum::new(0)), 16, Permissions::RW, true, &commit)
            .unwrap();

        let ctx = FaultContext {
            pte_table: &pte_table,
            pfn_db: &pfn_db,
            lists: &lists,
            vads: &vads,
            pagefile: &pagefile,
            scratch: &scratch,
            host: &host,
            min_available: 4,
        };

        handle(&ctx, VirtPageNum::new(1), AccessRequest::READ).unwrap();
        handle(&ctx, VirtPageNum::new(1), AccessRequest::WRITE).unwrap();

        match pte_table.snapshot(VirtPageNum::new(1)).decode() {
            PteView::Hardware { dirty, .. } => assert!(dirty),
            other => panic!("expected hardware PTE, got {other:?}"),
        }
    }
}
