//! Range walkers: commit, protect, decommit and trim operate over PTE
//! ranges while holding the owning VAD's shape lock for the duration of
//! the walk, taking each page's stripe lock (and PFN lock, when the page
//! is resident) only for the duration of that single page's transition.
//!
//! Grounded on `VApermissions.c`'s `commitVA`/`protectVA`/`decommitVA` and
//! `pageFault.c`'s trim path, restructured around [`PteView`] matches
//! rather than the original's bitfield tests.

use crate::commit::CommitCounter;
use crate::err::{Error, Result};
use crate::hostmap::HostMapper;
use crate::pagefile::Pagefile;
use crate::pagelist::PageLists;
use crate::pfn::{FrameState, PfnDatabase};
use crate::pte::{PteView, RawPte};
use crate::pte_table::PteTable;
use crate::types::{Permissions, VirtPageNum};
use crate::vad::VadList;

pub struct WalkContext<'a> {
    pub pte_table: &'a PteTable,
    pub pfn_db: &'a PfnDatabase,
    pub lists: &'a PageLists,
    pub vads: &'a VadList,
    pub pagefile: &'a Pagefile,
    pub commit: &'a CommitCounter,
    pub host: &'a dyn HostMapper,
}

/// Commits `page_count` pages starting at `start` with `perms`, charging
/// the commit counter only for pages that are actually uncommitted: a
/// `Zero` PTE in a reserve VAD, or a decommit-marked PTE in either VAD
/// kind. A `Zero` PTE in a commit VAD was already charged in full when
/// the VAD was created, so it is materialized without charging again.
/// Pages already committed just have their permissions updated. Stops
/// and returns the error on the first page that cannot be charged;
/// pages already processed earlier in the walk keep their new state.
pub fn commit_va(
    ctx: &WalkContext<'_>,
    start: VirtPageNum,
    perms: Permissions,
    page_count: usize,
) -> Result<()> {
    let (_guard, vad) = ctx.vads.begin_walk(start, page_count)?;

    for i in 0..page_count {
        let vpn = start.offset(i);
        let stripe = ctx.pte_table.lock(vpn);
        let view = stripe.read(vpn).decode();

        let needs_charge = match view {
            PteView::Zero => !vad.is_commit,
            PteView::DemandZero { decommit: true, .. } => true,
            _ => false,
        };

        if needs_charge {
            ctx.commit.charge(1)?;
            vad.adjust_commit_count(1);
        }

        if needs_charge || matches!(view, PteView::Zero) {
            stripe.write(
                vpn,
                RawPte::encode(PteView::DemandZero {
                    perms,
                    decommit: false,
                }),
            );
            continue;
        }

        retarget_permissions(ctx, vpn, &stripe, view, perms)?;
    }
    Ok(())
}

/// Replaces permissions on every committed PTE in the range; uncommitted
/// PTEs are left untouched.
pub fn protect_va(
    ctx: &WalkContext<'_>,
    start: VirtPageNum,
    perms: Permissions,
    page_count: usize,
) -> Result<()> {
    let (_guard, _vad) = ctx.vads.begin_walk(start, page_count)?;

    for i in 0..page_count {
        let vpn = start.offset(i);
        let stripe = ctx.pte_table.lock(vpn);
        let view = stripe.read(vpn).decode();
        if matches!(
            view,
            PteView::Zero | PteView::DemandZero { decommit: true, .. }
        ) {
            continue;
        }
        retarget_permissions(ctx, vpn, &stripe, view, perms)?;
    }
    Ok(())
}

fn retarget_permissions(
    ctx: &WalkContext<'_>,
    vpn: VirtPageNum,
    stripe: &crate::pte_table::StripeGuard<'_>,
    view: PteView,
    perms: Permissions,
) -> Result<()> {
    match view {
        PteView::Hardware {
            pfn, dirty, aging, ..
        } => {
            stripe.write(
                vpn,
                RawPte::encode(PteView::Hardware {
                    perms,
                    dirty,
                    aging,
                    pfn,
                }),
            );
        }
        PteView::Transition { pfn, .. } => {
            let _frame = ctx.pfn_db.frame(pfn).lock();
            if stripe.read(vpn).decode() != view {
                return Err(Error::PageStateChange);
            }
            stripe.write(vpn, RawPte::encode(PteView::Transition { perms, pfn }));
        }
        PteView::Pagefile { slot, .. } => {
            stripe.write(vpn, RawPte::encode(PteView::Pagefile { perms, slot }));
        }
        PteView::DemandZero { decommit: false, .. } => {
            stripe.write(
                vpn,
                RawPte::encode(PteView::DemandZero {
                    perms,
                    decommit: false,
                }),
            );
        }
        PteView::DemandZero { decommit: true, .. } | PteView::Zero => {}
    }
    Ok(())
}

/// Decommits `page_count` pages starting at `start`, releasing their
/// frames and replacing their PTEs with decommit-marked (commit VAD) or
/// fully zero (reserve VAD) entries.
pub fn decommit_va(ctx: &WalkContext<'_>, start: VirtPageNum, page_count: usize) -> Result<()> {
    let (_guard, vad) = ctx.vads.begin_walk(start, page_count)?;
    let deleting = vad.is_deleting();

    for i in 0..page_count {
        let vpn = start.offset(i);
        let stripe = ctx.pte_table.lock(vpn);
        let view = stripe.read(vpn).decode();

        let was_committed = match view {
            PteView::Hardware { pfn, .. } => {
                decommit_active(ctx, vpn, &stripe, pfn)?;
                true
            }
            PteView::Transition { pfn, .. } => {
                decommit_transition(ctx, vpn, &stripe, view, pfn)?;
                true
            }
            PteView::Pagefile { slot, .. } => {
                ctx.pagefile.free_slot(slot);
                stripe.write(vpn, RawPte::ZERO);
                true
            }
            PteView::DemandZero { decommit: false, .. } => {
                stripe.write(vpn, RawPte::ZERO);
                true
            }
            PteView::DemandZero { decommit: true, .. } => false,
            // A commit VAD charges its whole range at creation, before any
            // page is faulted in; an untouched page here is still
            // committed even though no frame or pagefile slot backs it
            // yet. A reserve VAD's Zero PTEs were never charged.
            PteView::Zero => vad.is_commit,
        };

        if was_committed && !deleting {
            if vad.is_commit {
                stripe.write(
                    vpn,
                    RawPte::encode(PteView::DemandZero {
                        perms: Permissions::NoAccess,
                        decommit: true,
                    }),
                );
            }
            vad.adjust_commit_count(-1);
            ctx.commit.release(1);
        } else if was_committed {
            ctx.commit.release(1);
        }
    }
    Ok(())
}

fn decommit_active(
    ctx: &WalkContext<'_>,
    vpn: VirtPageNum,
    stripe: &crate::pte_table::StripeGuard<'_>,
    pfn: u32,
) -> Result<()> {
    ctx.host.unmap(vpn, 1)?;
    let mut inner = ctx.pfn_db.frame(pfn).lock();
    if inner.write_in_progress || inner.ref_count > 0 {
        inner.state = FrameState::AwaitingFree;
    } else {
        if let Some(slot) = inner.pagefile_slot.take() {
            ctx.pagefile.free_slot(slot);
        }
        inner.remodified = false;
        inner.reverse_pte_index = None;
        drop(inner);
        ctx.lists.free.enqueue(ctx.pfn_db, pfn);
    }
    stripe.write(vpn, RawPte::ZERO);
    Ok(())
}

fn decommit_transition(
    ctx: &WalkContext<'_>,
    vpn: VirtPageNum,
    stripe: &crate::pte_table::StripeGuard<'_>,
    snapshot: PteView,
    pfn: u32,
) -> Result<()> {
    let mut inner = ctx.pfn_db.frame(pfn).lock();
    if stripe.read(vpn).decode() != snapshot {
        return Err(Error::PageStateChange);
    }

    if inner.write_in_progress || inner.ref_count > 0 {
        inner.state = FrameState::AwaitingFree;
    } else {
        if let Some(slot) = inner.pagefile_slot.take() {
            ctx.pagefile.free_slot(slot);
        }
        inner.reverse_pte_index = None;
        match inner.state {
            FrameState::Standby => ctx.lists.standby.remove(ctx.pfn_db, pfn),
            FrameState::Modified => ctx.lists.modified.remove(ctx.pfn_db, pfn),
            _ => {}
        }
        drop(inner);
        ctx.lists.free.enqueue(ctx.pfn_db, pfn);
    }
    stripe.write(vpn, RawPte::ZERO);
    Ok(())
}

/// Trims a single `Valid` PTE at `vpn` back to a transition PTE, parking
/// its frame on standby (clean) or modified (dirty), waking the modified
/// writer when a page is freshly enqueued there.
pub fn trim_va(ctx: &WalkContext<'_>, vpn: VirtPageNum, modified_wake: &vm_sync::ManualResetEvent) -> Result<()> {
    let stripe = ctx.pte_table.lock(vpn);
    let view = stripe.read(vpn).decode();

    let (perms, dirty, pfn) = match view {
        PteView::Hardware { perms, dirty, pfn, .. } => (perms, dirty, pfn),
        _ => return Err(Error::InvalidRange("trimVA requires a valid PTE")),
    };

    ctx.host.unmap(vpn, 1)?;

    let mut inner = ctx.pfn_db.frame(pfn).lock();
    if inner.write_in_progress || inner.ref_count > 0 {
        if dirty {
            inner.remodified = true;
        }
        inner.state = if dirty {
            FrameState::Modified
        } else {
            FrameState::Standby
        };
    } else if dirty || inner.remodified {
        if let Some(slot) = inner.pagefile_slot.take() {
            ctx.pagefile.free_slot(slot);
        }
        inner.remodified = false;
        drop(inner);
        ctx.lists.modified.enqueue(ctx.pfn_db, pfn);
        modified_wake.pulse();
        stripe.write(vpn, RawPte::encode(PteView::Transition { perms, pfn }));
        return Ok(());
    } else {
        drop(inner);
        ctx.lists.standby.enqueue(ctx.pfn_db, pfn);
        stripe.write(vpn, RawPte::encode(PteView::Transition { perms, pfn }));
        return Ok(());
    }

    stripe.write(vpn, RawPte::encode(PteView::Transition { perms, pfn }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{self, FaultContext};
    use crate::hostmap::SimulatedHostMapper;
    use crate::scratch::ScratchPool;
    use crate::types::AccessRequest;

    fn setup() -> (
        PteTable,
        PfnDatabase,
        PageLists,
        VadList,
        Pagefile,
        ScratchPool,
        SimulatedHostMapper,
        CommitCounter,
    ) {
        let pte_table = PteTable::new(64, 64, false);
        let pfn_db = PfnDatabase::new(8);
        let lists = PageLists::new(8);
        for i in 0..8 {
            lists.free.enqueue(&pfn_db, i);
        }
        let vads = VadList::new(64);
        let pagefile = Pagefile::new(4);
        let scratch = ScratchPool::new(VirtPageNum::new(1000), 4);
        let host = SimulatedHostMapper::new(8);
        let commit = CommitCounter::new(12);
        (pte_table, pfn_db, lists, vads, pagefile, scratch, host, commit)
    }

    #[test]
    fn commit_then_decommit_round_trips_commit_count() {
        let (pte_table, pfn_db, lists, vads, pagefile, _scratch, host, commit) = setup();
        let vad = vads
            .create(Some(VirtPageNum::new(0)), 8, Permissions::RW, false, &commit)
            .unwrap();

        let walk_ctx = WalkContext {
            pte_table: &pte_table,
            pfn_db: &pfn_db,
            lists: &lists,
            vads: &vads,
            pagefile: &pagefile,
            commit: &commit,
            host: &host,
        };

        commit_va(&walk_ctx, VirtPageNum::new(0), Permissions::RW, 4).unwrap();
        assert_eq!(vad.commit_count(), 4);
        assert_eq!(commit.committed(), 4);

        decommit_va(&walk_ctx, VirtPageNum::new(0), 4).unwrap();
        assert_eq!(vad.commit_count(), 0);
        assert_eq!(commit.committed(), 0);
    }

    #[test]
    fn trim_va_parks_dirty_page_on_modified() {
        let (pte_table, pfn_db, lists, vads, pagefile, scratch, host, commit) = setup();
        vads.create(Some(VirtPageNum::new(0)), 8, Permissions::RW, true, &commit)
            .unwrap();

        let fault_ctx = FaultContext {
            pte_table: &pte_table,
            pfn_db: &pfn_db,
            lists: &lists,
            vads: &vads,
            pagefile: &pagefile,
            scratch: &scratch,
            host: &host,
            min_available: 4,
        };
        fault::handle(&fault_ctx, VirtPageNum::new(2), AccessRequest::WRITE).unwrap();

        let walk_ctx = WalkContext {
            pte_table: &pte_table,
            pfn_db: &pfn_db,
            lists: &lists,
            vads: &vads,
            pagefile: &pagefile,
            commit: &commit,
            host: &host,
        };
        let wake = vm_sync::ManualResetEvent::new(false);
        trim_va(&walk_ctx, VirtPageNum::new(2), &wake).unwrap();

        assert_eq!(lists.modified.len(), 1);
        match pte_table.snapshot(VirtPageNum::new(2)).decode() {
            PteView::Transition { .. } => {}
            other => panic!("expected transition PTE, got {other:?}"),
        }
    }
}
