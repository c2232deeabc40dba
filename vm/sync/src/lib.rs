//! Synchronization primitives shared by the VM core: a CAS spin lock for
//! per-frame state and a condvar-backed manual-reset event for the various
//! wake conditions described in the concurrency model.

mod event;
mod spinlock;

pub use event::{wait_any, ManualResetEvent, DEFAULT_WAIT_TIMEOUT};
pub use spinlock::{SpinGuard, SpinLock};
