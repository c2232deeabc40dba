//! Demand-paged virtual memory core: PTE state machine, PFN database,
//! page lists, VAD tracking, fault handler, range walkers, background
//! workers and the pagefile, wired together by [`System`].
//!
//! Grounded on `usermodeMemoryManager.c`'s module layout, generalized
//! into separately testable Rust modules along the same seams the
//! original keeps as logical sections (PTE/PFN/lists/VADs/fault/
//! trim/pagefile/threads).

mod commit;
mod config;
mod err;
mod fault;
mod hostmap;
mod pagefile;
mod pagelist;
mod pfn;
mod pte;
mod pte_table;
mod scratch;
mod system;
mod types;
mod vad;
mod walk;
mod workers;

pub use commit::CommitCounter;
pub use config::{Config, VadMode};
pub use err::{Error, Result};
pub use fault::{handle as handle_fault, FaultContext};
pub use hostmap::{HostMapper, SimulatedHostMapper};
pub use pagefile::Pagefile;
pub use pagelist::{PageList, PageLists};
pub use pfn::{Frame, FrameInner, FrameState, PfnDatabase, ReadCompletion};
pub use pte::{PteView, RawPte};
pub use pte_table::{PteChange, PteTable, StripeGuard};
pub use scratch::{ScratchPool, ScratchVa};
pub use system::System;
pub use types::{AccessMask, AccessRequest, FrameNumber, Permissions, VirtPageNum, PAGE_SIZE};
pub use vad::{Vad, VadList};
pub use walk::{commit_va, decommit_va, protect_va, trim_va, WalkContext};
pub use workers::{spawn_all as spawn_workers, WorkerContext, WorkerStats};
