use crate::{GuestAddr, Isa};

/// Record of one direct cross-fragment patch.
///
/// Appended every time the dispatcher or scanner writes a branch that
/// jumps straight at another fragment. Walked by the cache flush to
/// invalidate patches whose targets disappear.
#[derive(Debug, Clone, Copy)]
pub struct LinkRecord {
    /// Host address of the patched branch or literal word.
    pub patch_addr: usize,
    /// Whether the patch site holds a literal word rather than a branch
    /// instruction.
    pub is_literal: bool,
    /// Guest PC the patch resolves to.
    pub target: GuestAddr,
    pub isa: Isa,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_fields() {
        let r = LinkRecord {
            patch_addr: 0x1000,
            is_literal: false,
            target: 0x8001,
            isa: Isa::T32,
        };
        assert_eq!(r.patch_addr, 0x1000);
        assert_eq!(r.target & 1, 1);
    }
}
