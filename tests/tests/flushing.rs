//! Cache-flush soundness and resource-pressure recovery.

use dbm_core::code_cache::CodeCache;
use dbm_core::thread::Arch;
use dbm_core::{BranchType, ThreadData};
use dbm_exec::{dispatch, flush_code_cache, lookup_or_scan};
use dbm_tests::{make_thread, t32_program};

/// After a flush, every guest PC reaches a correct fresh translation
/// and no patched branch survives into the new generation.
#[test]
fn flush_is_sound_for_retranslation() {
    let mut td = make_thread(Arch::Aarch32);

    let b_pc = t32_program(&[0x4770]);
    let a_pc = t32_program(&[0, 0, 0x4770]);
    {
        // SAFETY: patching the leaked program buffer.
        let mut w = unsafe { dbm_codec::CodeWriter::new(a_pc & !1) };
        let off = (b_pc & !1) as i64 - ((a_pc & !1) as i64 + 4);
        dbm_codec::t32::b32(&mut w, off as i32);
    }

    lookup_or_scan(&mut td, a_pc);
    dispatch(&mut td, b_pc, 0);
    assert!(!td.cc_links.is_empty());

    flush_code_cache(&mut td);
    assert!(td.entry_address.is_empty());
    assert!(td.cc_links.is_empty());
    assert_eq!(td.free_block, td.reserved_blocks);
    assert_eq!(td.code_cache_meta[0].exit_branch_type, BranchType::Unknown);

    // Retranslate both blocks and re-link.
    let a2 = lookup_or_scan(&mut td, a_pc);
    assert_eq!(td.entry_address.lookup(a_pc), Some(a2));
    let a2_index = td.code_cache.index_of(a2 & !1);
    let b2 = dispatch(&mut td, b_pc, a2_index);
    assert_eq!(td.entry_address.lookup(b_pc), Some(b2));
    assert_eq!(td.stats.flushes, 1);
}

/// Arena exhaustion surfaces as pressure, the dispatcher flushes and
/// the translation retries transparently.
#[test]
fn exhaustion_flushes_and_retries() {
    let cache = CodeCache::with_slots(2).unwrap();
    let mut td = ThreadData::with_cache(Arch::Aarch32, 0, cache).unwrap();
    td.dispatcher_addr = td.code_cache.base() + td.code_cache.size() - 8;
    td.dispatcher_arm_addr = td.dispatcher_addr;
    td.syscall_wrapper_addr = td.dispatcher_addr;

    let a = t32_program(&[0x4770]);
    let b = t32_program(&[0x4770]);
    let c = t32_program(&[0x4770]);

    lookup_or_scan(&mut td, a);
    lookup_or_scan(&mut td, b);
    assert_eq!(td.free_block, 2);

    // No free slot left: the next translation must flush and retry.
    let entry = lookup_or_scan(&mut td, c);
    assert_eq!(td.stats.flushes, 1);
    assert_eq!(td.entry_address.lookup(c), Some(entry));
    // The earlier bindings died with the flush.
    assert_eq!(td.entry_address.lookup(a), None);
}

/// Hash-table invariant: every binding points at the translation of
/// its key.
#[test]
fn hash_bindings_point_at_prologues() {
    let mut td = make_thread(Arch::Aarch32);
    let blocks: Vec<usize> =
        (0..8).map(|_| t32_program(&[0x3001, 0x4770])).collect();
    for &pc in &blocks {
        let entry = lookup_or_scan(&mut td, pc);
        // The prologue is the translation of the ADDS at the key.
        assert_eq!(td.code_cache.read_u16(entry & !1), 0x3001);
    }
    for &pc in &blocks {
        assert!(td.entry_address.lookup(pc).is_some());
    }
}
