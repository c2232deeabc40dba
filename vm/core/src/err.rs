use crate::types::VirtPageNum;

/// Error kinds surfaced by the core, matching the taxonomy of transient
/// vs. structural vs. fatal failures described by the fault handler and
/// the range walkers.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// VA outside any VAD, inside a deleting/deleted VAD, insufficient
    /// permissions, or a decommitted PTE.
    #[error("access violation at {0:?}")]
    AccessViolation(VirtPageNum),

    /// Transient: no frame was available on any list. The caller waits on
    /// the new-page events and retries.
    #[error("no available pages")]
    NoAvailablePages,

    /// Transient: the PTE snapshot no longer matches reality (a racing
    /// modifier won). The caller re-snapshots and retries.
    #[error("page state changed, retry")]
    PageStateChange,

    /// Committing would exceed `memory_limit`.
    #[error("insufficient commit: requested {requested} pages, {available} available")]
    InsufficientCommit { requested: u64, available: u64 },

    /// Size zero, a range straddling a VAD boundary, or a malformed address.
    #[error("invalid range: {0}")]
    InvalidRange(&'static str),

    /// An invariant the core relies on was violated. Unrecoverable.
    #[error("fatal invariant violation: {0}")]
    Fatal(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True for the two error kinds that a driver loop is expected to
    /// retry rather than propagate to its own caller.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::NoAvailablePages | Error::PageStateChange)
    }
}
