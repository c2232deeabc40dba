//! The packed 64-bit PTE union.
//!
//! A PTE is kept as a plain `u64` value with explicit accessors per logical
//! layout rather than a tagged enum with payload, so that a whole PTE can be
//! published with a single atomic store (see [`crate::pte_table`]). The
//! four layouts share the low two bits (`valid`, `transition`); everything
//! above that is reinterpreted depending on which layout is tagged.
//!
//! Bit assignment (low to high), stable across build configurations so the
//! optional change log stays interpretable:
//!
//! | bits | hardware (valid=1)   | transition (valid=0,trans=1) | pagefile/demand-zero (valid=0,trans=0) |
//! |------|----------------------|-------------------------------|-----------------------------------------|
//! | 0    | valid=1              | valid=0                       | valid=0                                 |
//! | 1    | transition=0         | transition=1                  | transition=0                            |
//! | 2    | write bit            | permissions\[0\]              | permissions\[0\]                        |
//! | 3    | execute bit          | permissions\[1\]              | permissions\[1\]                        |
//! | 4    | dirty bit            | permissions\[2\]              | permissions\[2\]                        |
//! | 5    | aging bit            | —                              | decommit bit                            |
//! | 6    | —                    | —                              | slot valid (pagefile vs. demand-zero)   |
//! | 8..40| pfn (32 bits)        | pfn (32 bits)                  | pagefile slot (32 bits)                 |

use crate::types::Permissions;

const VALID_BIT: u64 = 1 << 0;
const TRANSITION_BIT: u64 = 1 << 1;
const WRITE_BIT: u64 = 1 << 2;
const EXECUTE_BIT: u64 = 1 << 3;
const DIRTY_BIT: u64 = 1 << 4;
const AGING_BIT: u64 = 1 << 5;
const DECOMMIT_BIT: u64 = 1 << 5;
const SLOT_VALID_BIT: u64 = 1 << 6;
const PERMS_SHIFT: u32 = 2;
const PERMS_MASK: u64 = 0b111;
const PFN_SHIFT: u32 = 8;
const PFN_MASK: u64 = 0xFFFF_FFFF;

/// A decoded view over a raw packed PTE value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PteView {
    /// Uncommitted (in a reserve VAD) or committed-but-decommitted zero PTE.
    Zero,
    /// A hardware-valid mapping, host-mapped to `pfn`.
    Hardware {
        perms: Permissions,
        dirty: bool,
        aging: bool,
        pfn: u32,
    },
    /// Evicted but the frame still exists on standby/modified.
    Transition { perms: Permissions, pfn: u32 },
    /// Backed by a pagefile slot, not currently resident.
    Pagefile { perms: Permissions, slot: u32 },
    /// Committed, never faulted in (or decommit-marked if `perms` is
    /// `NoAccess` and `decommit` is set).
    DemandZero { perms: Permissions, decommit: bool },
}

/// A raw packed PTE value, freely copyable and safe to publish with one
/// atomic store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct RawPte(u64);

impl RawPte {
    pub const ZERO: RawPte = RawPte(0);

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn to_bits(self) -> u64 {
        self.0
    }

    pub fn decode(self) -> PteView {
        let bits = self.0;
        if bits == 0 {
            return PteView::Zero;
        }
        if bits & VALID_BIT != 0 {
            return PteView::Hardware {
                perms: hardware_perms(bits),
                dirty: bits & DIRTY_BIT != 0,
                aging: bits & AGING_BIT != 0,
                pfn: pfn_field(bits),
            };
        }
        if bits & TRANSITION_BIT != 0 {
            return PteView::Transition {
                perms: perms_field(bits),
                pfn: pfn_field(bits),
            };
        }
        if bits & SLOT_VALID_BIT != 0 {
            return PteView::Pagefile {
                perms: perms_field(bits),
                slot: pfn_field(bits),
            };
        }
        PteView::DemandZero {
            perms: perms_field(bits),
            decommit: bits & DECOMMIT_BIT != 0,
        }
    }

    pub fn encode(view: PteView) -> Self {
        let bits = match view {
            PteView::Zero => 0,
            PteView::Hardware {
                perms,
                dirty,
                aging,
                pfn,
            } => {
                let mask = perms.mask();
                VALID_BIT
                    | if mask.write { WRITE_BIT } else { 0 }
                    | if mask.execute { EXECUTE_BIT } else { 0 }
                    | if dirty { DIRTY_BIT } else { 0 }
                    | if aging { AGING_BIT } else { 0 }
                    | pfn_bits(pfn)
            }
            PteView::Transition { perms, pfn } => {
                TRANSITION_BIT | perms_bits(perms) | pfn_bits(pfn)
            }
            PteView::Pagefile { perms, slot } => {
                SLOT_VALID_BIT | perms_bits(perms) | pfn_bits(slot)
            }
            PteView::DemandZero { perms, decommit } => {
                perms_bits(perms) | if decommit { DECOMMIT_BIT } else { 0 }
            }
        };
        Self(bits)
    }
}

fn perms_bits(perms: Permissions) -> u64 {
    (perms.as_raw() as u64 & PERMS_MASK) << PERMS_SHIFT
}

fn perms_field(bits: u64) -> Permissions {
    Permissions::from_raw(((bits >> PERMS_SHIFT) & PERMS_MASK) as u8)
}

fn hardware_perms(bits: u64) -> Permissions {
    let write = bits & WRITE_BIT != 0;
    let execute = bits & EXECUTE_BIT != 0;
    match (write, execute) {
        (false, false) => Permissions::R,
        (true, false) => Permissions::RW,
        (false, true) => Permissions::RX,
        (true, true) => Permissions::RWX,
    }
}

fn pfn_bits(pfn: u32) -> u64 {
    ((pfn as u64) & PFN_MASK) << PFN_SHIFT
}

fn pfn_field(bits: u64) -> u32 {
    ((bits >> PFN_SHIFT) & PFN_MASK) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_pte_round_trips() {
        assert_eq!(RawPte::ZERO.decode(), PteView::Zero);
        assert_eq!(RawPte::encode(PteView::Zero), RawPte::ZERO);
    }

    #[test]
    fn hardware_pte_round_trips() {
        let view = PteView::Hardware {
            perms: Permissions::RWX,
            dirty: true,
            aging: false,
            pfn: 0x1234,
        };
        let raw = RawPte::encode(view);
        assert_eq!(raw.decode(), view);
    }

    #[test]
    fn transition_pte_round_trips() {
        let view = PteView::Transition {
            perms: Permissions::RW,
            pfn: 77,
        };
        assert_eq!(RawPte::encode(view).decode(), view);
    }

    #[test]
    fn pagefile_pte_round_trips() {
        let view = PteView::Pagefile {
            perms: Permissions::R,
            slot: 909,
        };
        assert_eq!(RawPte::encode(view).decode(), view);
    }

    #[test]
    fn demand_zero_and_decommit_marked_round_trip() {
        let dz = PteView::DemandZero {
            perms: Permissions::RW,
            decommit: false,
        };
        assert_eq!(RawPte::encode(dz).decode(), dz);

        let decommit_marked = PteView::DemandZero {
            perms: Permissions::NoAccess,
            decommit: true,
        };
        assert_eq!(RawPte::encode(decommit_marked).decode(), decommit_marked);
        assert_ne!(RawPte::encode(decommit_marked), RawPte::ZERO);
    }
}
