//! Full code-cache flush.
//!
//! Fragments are never freed individually: their cost is amortised
//! against full flushes triggered by `munmap`, the 32-bit cacheflush
//! syscall, hash-table saturation or arena exhaustion. A thread may
//! only flush its own cache, between fragments.

use dbm_core::ThreadData;

/// Reset the fragment arena and hash table and retire every link
/// record. Patch sites inside the resident trampoline prefix would be
/// rewritten back to their dispatcher-stub form here; everything else
/// dies with the arena.
pub fn flush_code_cache(thread: &mut ThreadData) {
    thread.stats.flushes += 1;
    let links = std::mem::take(&mut thread.cc_links);
    log::warn!(
        "flushing code cache: {} fragments, {} hash entries, {} links",
        thread.free_block,
        thread.entry_address.len(),
        links.len()
    );

    let retained_end = thread
        .code_cache
        .base()
        .saturating_add(thread.reserved_blocks * dbm_core::BASIC_BLOCK_BYTES);
    for link in links {
        // The trampoline prefix holds no patchable exits, so every
        // record must point into the discarded region.
        debug_assert!(
            link.patch_addr >= retained_end,
            "patched branch survived a flush"
        );
    }

    thread.free_block = thread.reserved_blocks;
    thread.entry_address.clear();
    let isa = match thread.arch {
        dbm_core::Arch::Aarch32 => dbm_core::Isa::A32,
        dbm_core::Arch::Aarch64 => dbm_core::Isa::A64,
    };
    for meta in thread.code_cache_meta.iter_mut().skip(thread.reserved_blocks) {
        meta.reset(isa);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbm_core::code_cache::CodeCache;
    use dbm_core::thread::Arch;
    use dbm_core::BranchType;

    use crate::dispatcher::{dispatch, lookup_or_scan};

    #[test]
    fn flush_resets_and_retranslation_works() {
        let cache = CodeCache::with_slots(64).unwrap();
        let mut td = ThreadData::with_cache(Arch::Aarch64, 0, cache).unwrap();
        td.dispatcher_addr = td.code_cache.base() + td.code_cache.size() - 8;
        td.syscall_wrapper_addr = td.dispatcher_addr;

        // A -> B via BL; link it, then flush, then run again.
        let block_b: Vec<u32> = vec![0xD65F_03C0];
        let b_pc = block_b.as_ptr() as usize;
        let mut block_a: Vec<u32> = vec![0, 0xD65F_03C0];
        let a_pc = block_a.as_mut_ptr() as usize;
        let off = ((b_pc as i64 - a_pc as i64) >> 2) as u32 & 0x03FF_FFFF;
        block_a[0] = 0x9400_0000 | off; // bl B

        lookup_or_scan(&mut td, a_pc);
        dispatch(&mut td, b_pc, 0);
        assert!(!td.cc_links.is_empty());
        let translations_before = td.stats.translations;

        flush_code_cache(&mut td);
        assert_eq!(td.free_block, 0);
        assert!(td.entry_address.is_empty());
        assert!(td.cc_links.is_empty());
        assert_eq!(
            td.code_cache_meta[0].exit_branch_type,
            BranchType::Unknown
        );

        // Every guest PC reaches a fresh, correct translation.
        let a2 = lookup_or_scan(&mut td, a_pc);
        assert_eq!(td.entry_address.lookup(a_pc), Some(a2));
        assert!(td.stats.translations > translations_before);
        assert_eq!(td.stats.flushes, 1);
    }
}
