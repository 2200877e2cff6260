//! Thread isolation: caches, hash tables and dispatch counters are
//! strictly per-thread.

use dbm_core::thread::Arch;
use dbm_exec::{dispatch, lookup_or_scan};
use dbm_tests::{make_thread, t32_program};

#[test]
fn thread_caches_are_private() {
    let mut parent = make_thread(Arch::Aarch32);
    let mut child = make_thread(Arch::Aarch32);
    assert_ne!(parent.code_cache.base(), child.code_cache.base());
    assert_ne!(parent.scratch_regs_addr(), child.scratch_regs_addr());

    let shared_pc = t32_program(&[0x3001, 0x4770]);

    // Both threads translate the same guest block into their own
    // caches.
    let p_entry = lookup_or_scan(&mut parent, shared_pc);
    let c_entry = lookup_or_scan(&mut child, shared_pc);
    assert_ne!(p_entry, c_entry);
    assert!(parent.code_cache.contains(p_entry & !1));
    assert!(child.code_cache.contains(c_entry & !1));

    // Dispatch activity in one thread is invisible to the other.
    let loop_pc = t32_program(&[0x3801, 0xD1FD, 0x4770]);
    lookup_or_scan(&mut child, loop_pc);
    let frag = child.code_cache.index_of(
        child.entry_address.lookup(loop_pc).unwrap() & !1,
    );
    dispatch(&mut child, loop_pc, frag);
    assert_eq!(child.stats.dispatch_calls, 1);
    assert_eq!(parent.stats.dispatch_calls, 0);
    assert_eq!(parent.entry_address.lookup(loop_pc), None);
}

#[test]
fn same_thread_reuses_translations_across_blocks() {
    let mut td = make_thread(Arch::Aarch32);
    let pc = t32_program(&[0x3001, 0x4770]);
    let first = lookup_or_scan(&mut td, pc);
    let again = lookup_or_scan(&mut td, pc);
    assert_eq!(first, again);
    assert_eq!(td.stats.translations, 1);
    assert_eq!(td.stats.hash_hits, 1);
}
