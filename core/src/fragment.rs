use crate::GuestAddr;

/// Instruction set a fragment was translated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Isa {
    A32,
    T32,
    A64,
}

/// ARM condition codes, shared by all three ISAs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    Cs = 2,
    Cc = 3,
    Mi = 4,
    Pl = 5,
    Vs = 6,
    Vc = 7,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
    Al = 14,
}

impl Cond {
    pub fn from_bits(bits: u32) -> Cond {
        match bits & 0xf {
            0 => Cond::Eq,
            1 => Cond::Ne,
            2 => Cond::Cs,
            3 => Cond::Cc,
            4 => Cond::Mi,
            5 => Cond::Pl,
            6 => Cond::Vs,
            7 => Cond::Vc,
            8 => Cond::Hi,
            9 => Cond::Ls,
            10 => Cond::Ge,
            11 => Cond::Lt,
            12 => Cond::Gt,
            13 => Cond::Le,
            _ => Cond::Al,
        }
    }

    /// The inverse condition. `Al` has no inverse and maps to itself.
    pub fn invert(self) -> Cond {
        match self {
            Cond::Eq => Cond::Ne,
            Cond::Ne => Cond::Eq,
            Cond::Cs => Cond::Cc,
            Cond::Cc => Cond::Cs,
            Cond::Mi => Cond::Pl,
            Cond::Pl => Cond::Mi,
            Cond::Vs => Cond::Vc,
            Cond::Vc => Cond::Vs,
            Cond::Hi => Cond::Ls,
            Cond::Ls => Cond::Hi,
            Cond::Ge => Cond::Lt,
            Cond::Lt => Cond::Ge,
            Cond::Gt => Cond::Le,
            Cond::Le => Cond::Gt,
            Cond::Al => Cond::Al,
        }
    }
}

/// Shape of a fragment's translated exit. Selects the dispatcher's
/// patching strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchType {
    Unknown,
    /// Direct unconditional branch; a single rewritable slot.
    UncondImm,
    /// Direct conditional branch; independently patchable taken/skipped
    /// arms tracked by `branch_cache_status`.
    CondImm,
    /// Indirect branch resolved through the inline hash lookup or the
    /// dispatcher; nothing to patch at the exit.
    UncondReg,
    /// T32 BLX immediate (mode change); patched through a literal load.
    UncondBlxi,
    /// Compare-and-branch-on-zero; like `CondImm` with a CBZ/CBNZ head.
    Cbz,
    /// T32 byte table branch with a per-fragment jump table.
    Tbb,
    /// T32 halfword table branch with a per-fragment jump table.
    Tbh,
    /// Table branch lowered straight to the indirect path.
    TbIndirect,
    /// Direct back-edge that hit the inlining limit and was closed with
    /// an already-linked branch.
    TraceInlineMax,
}

/// Number of directly-linked slots in a table-branch fragment's jump
/// table. Further indices fall back to the indirect lookup.
pub const TB_CACHE_SIZE: usize = 5;

/// Sentinel for `FragmentMeta::rn` meaning "entered through the
/// indirect stub, no linking required".
pub const RN_NO_LINK: u32 = u32::MAX;

/// Per-fragment metadata recorded by the scanner and consumed by the
/// dispatcher when linking.
///
/// `exit_branch_type` plus `exit_branch_addr` uniquely determine how
/// many bytes of the fragment are patchable and by what encoding.
#[derive(Debug, Clone)]
pub struct FragmentMeta {
    pub exit_branch_type: BranchType,
    pub isa: Isa,
    /// Host address of the rewritable exit inside the code cache.
    pub exit_branch_addr: usize,
    /// Guest PC reached when a conditional exit is taken.
    pub branch_taken_addr: GuestAddr,
    /// Guest PC reached when a conditional exit falls through.
    pub branch_skipped_addr: GuestAddr,
    pub branch_condition: Cond,
    /// Bit 1: taken arm linked. Bit 0: skipped arm linked. Monotonically
    /// non-decreasing until flush.
    pub branch_cache_status: u8,
    /// For conditional exits: the register compared against zero.
    /// For table branches: the table index observed by the run that
    /// entered the dispatcher, or `RN_NO_LINK`.
    pub rn: u32,
    /// Next free slot in the per-fragment jump table.
    pub free_b: u32,
}

impl FragmentMeta {
    pub fn new(isa: Isa) -> Self {
        Self {
            exit_branch_type: BranchType::Unknown,
            isa,
            exit_branch_addr: 0,
            branch_taken_addr: 0,
            branch_skipped_addr: 0,
            branch_condition: Cond::Al,
            branch_cache_status: 0,
            rn: RN_NO_LINK,
            free_b: 0,
        }
    }

    pub fn reset(&mut self, isa: Isa) {
        *self = FragmentMeta::new(isa);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cond_invert_roundtrip() {
        for bits in 0..14u32 {
            let c = Cond::from_bits(bits);
            assert_eq!(c.invert().invert(), c);
            assert_ne!(c.invert(), c);
        }
        assert_eq!(Cond::Al.invert(), Cond::Al);
    }

    #[test]
    fn meta_reset_clears_link_state() {
        let mut m = FragmentMeta::new(Isa::T32);
        m.exit_branch_type = BranchType::CondImm;
        m.branch_cache_status = 3;
        m.free_b = 2;
        m.reset(Isa::T32);
        assert_eq!(m.exit_branch_type, BranchType::Unknown);
        assert_eq!(m.branch_cache_status, 0);
        assert_eq!(m.free_b, 0);
        assert_eq!(m.rn, RN_NO_LINK);
    }
}
