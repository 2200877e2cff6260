//! Shared harness for the end-to-end scenarios.
//!
//! The suites never jump into generated code: they drive the
//! scan → dispatch → link pipeline through its Rust entry points and
//! follow control flow by decoding the patched exit bytes, so they
//! run on any host architecture.

use dbm_codec::t32;
use dbm_core::code_cache::CodeCache;
use dbm_core::thread::Arch;
use dbm_core::{GuestAddr, ThreadData};
use dbm_exec::dispatch;

/// A thread with dispatcher/wrapper targets inside the mapping so
/// every emitted branch is encodable.
pub fn make_thread(arch: Arch) -> ThreadData {
    let cache = CodeCache::with_slots(256).unwrap();
    let mut td = ThreadData::with_cache(arch, 0, cache).unwrap();
    td.dispatcher_addr = td.code_cache.base() + td.code_cache.size() - 8;
    td.dispatcher_arm_addr = td.dispatcher_addr;
    td.syscall_wrapper_addr = td.code_cache.base() + td.code_cache.size() - 16;
    td
}

pub fn make_thread_with_plugins(arch: Arch, nr_plugins: usize) -> ThreadData {
    let cache = CodeCache::with_slots(256).unwrap();
    let mut td = ThreadData::with_cache(arch, nr_plugins, cache).unwrap();
    td.dispatcher_addr = td.code_cache.base() + td.code_cache.size() - 8;
    td.dispatcher_arm_addr = td.dispatcher_addr;
    td.syscall_wrapper_addr = td.code_cache.base() + td.code_cache.size() - 16;
    td
}

/// If the T32 exit at `exit_addr` has been linked, return the cache
/// address it branches to.
pub fn t32_linked_dest(exit_addr: usize) -> Option<usize> {
    // SAFETY: the exit lies inside the thread's live code cache.
    match unsafe { t32::decode(exit_addr) } {
        (t32::T32Inst::B32 { offset }, _) => {
            Some((exit_addr as i64 + offset as i64) as usize)
        }
        _ => None,
    }
}

/// Execute one traversal of an unconditional T32 edge the way the
/// cache would: follow the patched branch if the exit is linked,
/// otherwise take the dispatcher path. Returns the resolved cache
/// address.
pub fn run_uncond_edge(
    td: &mut ThreadData,
    source_index: usize,
    target: GuestAddr,
) -> usize {
    let exit = td.code_cache_meta[source_index].exit_branch_addr;
    if let Some(dest) = t32_linked_dest(exit) {
        // Linked: the branch reaches the target fragment without
        // the dispatcher.
        return dest | (target & 1);
    }
    dispatch(td, target, source_index)
}

/// One traversal of a conditional T32 edge: consult the linked-arm
/// state the way the patched CBZ/IT head would, falling back to the
/// dispatcher for unlinked arms.
pub fn run_cond_edge(td: &mut ThreadData, source_index: usize, taken: bool) -> usize {
    let meta = &td.code_cache_meta[source_index];
    let bit = if taken { 2 } else { 1 };
    let target = if taken {
        meta.branch_taken_addr
    } else {
        meta.branch_skipped_addr
    };
    if meta.branch_cache_status & bit != 0 {
        // Linked: resolved in cache.
        return td.entry_address.lookup(target).expect("linked arm not cached");
    }
    dispatch(td, target, source_index)
}

/// Write a T32 instruction stream into a leaked buffer and return its
/// guest address (mode bit set).
pub fn t32_program(halfwords: &[u16]) -> GuestAddr {
    let buf: Box<[u16]> = halfwords.into();
    (Box::leak(buf).as_ptr() as usize) | 1
}

/// Write an A64 instruction stream into a leaked buffer and return
/// its guest address.
pub fn a64_program(words: &[u32]) -> GuestAddr {
    let buf: Box<[u32]> = words.into();
    Box::leak(buf).as_ptr() as usize
}
