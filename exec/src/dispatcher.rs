//! The dispatcher: resolves a guest target to a code-cache address and
//! back-patches the source fragment's exit so the branch that just
//! trapped runs direct next time.

use dbm_codec::{t32, CodeWriter};
use dbm_core::fragment::{BranchType, Isa, RN_NO_LINK, TB_CACHE_SIZE};
use dbm_core::icache::flush_icache_range;
use dbm_core::regs::PC;
use dbm_core::{fatal_translation, GuestAddr, ThreadData, THUMB_FLAG};
use dbm_scanner::common::{
    cc_branch, encode_cbz_t32, encode_cond_imm_t32, patch_cond_a64,
    patch_cond_imm_a32, tb_read_key, tb_write_pair, TB_KEY_EMPTY,
};
use dbm_scanner::scan;

use crate::flush::flush_code_cache;

/// Resolve `target`, translating on a miss. Resource pressure flushes
/// the cache and retries; a second failure is a runtime bug.
pub fn lookup_or_scan(thread: &mut ThreadData, target: GuestAddr) -> usize {
    if let Some(addr) = thread.entry_address.lookup(target) {
        thread.stats.hash_hits += 1;
        return addr;
    }
    match scan(thread, target) {
        Ok(addr) => addr,
        Err(pressure) => {
            log::warn!("{pressure:?} while translating {target:#x}, flushing");
            flush_code_cache(thread);
            scan(thread, target).unwrap_or_else(|_| {
                fatal_translation(target, "translation failed after a cache flush")
            })
        }
    }
}

/// Dispatch contract: resolve `target`, patch the exit of
/// `source_index` so the same exit next reaches the target without
/// re-entering here, and return the cache address to run.
pub fn dispatch(thread: &mut ThreadData, target: GuestAddr, source_index: usize) -> usize {
    thread.stats.dispatch_calls += 1;

    // Indexes past the basic-block arena would belong to the trace
    // tier, which this runtime does not carry.
    if source_index >= thread.code_cache.slots() {
        fatal_translation(target, "dispatch from a trace-tier fragment index");
    }

    // Copy the exit description before scanning: translating a stub
    // block can overwrite the source's trailing metadata when the
    // fragments are adjacent.
    let source_meta = thread.code_cache_meta[source_index].clone();
    let source_branch_type = source_meta.exit_branch_type;
    log::debug!(
        "dispatch target {target:#x} from fragment {source_index} \
         ({source_branch_type:?})"
    );

    let block_address = lookup_or_scan(thread, target);

    match source_branch_type {
        BranchType::UncondImm => {
            patch_uncond_imm(thread, &source_meta, target, block_address)
        }
        BranchType::UncondBlxi => {
            patch_blxi(thread, &source_meta, target, block_address)
        }
        BranchType::CondImm | BranchType::Cbz => {
            patch_cond(thread, source_index, &source_meta, target, block_address)
        }
        BranchType::Tbb | BranchType::Tbh => {
            patch_table_branch(thread, source_index, &source_meta, block_address)
        }
        // Indirect exits resolve through the inline lookup or this
        // call every time; there is nothing to patch.
        BranchType::UncondReg | BranchType::TbIndirect | BranchType::TraceInlineMax => {}
        BranchType::Unknown => {
            fatal_translation(target, "dispatch from a fragment with no exit")
        }
    }

    block_address
}

/// C-ABI entry point the dispatcher trampolines call.
///
/// # Safety
/// `thread` must point at the calling thread's `ThreadData`; the
/// caller is its exit stub, running with the guest's scratch registers
/// spilled.
pub unsafe extern "C" fn dispatcher_entry(
    target: usize,
    source_index: usize,
    thread: *mut ThreadData,
) -> usize {
    dispatch(&mut *thread, target, source_index)
}

fn patch_uncond_imm(
    thread: &mut ThreadData,
    meta: &dbm_core::FragmentMeta,
    target: GuestAddr,
    block_address: usize,
) {
    let exit = meta.exit_branch_addr;
    match meta.isa {
        Isa::T32 => {
            if block_address & THUMB_FLAG != 0 {
                // SAFETY: rewriting the reserved exit bytes.
                let mut w = unsafe { CodeWriter::new(exit) };
                cc_branch(thread, &mut w, block_address, target, Isa::T32);
                flush_icache_range(exit, exit + 4);
            } else {
                // Mode change: install a literal load of the A32
                // address at the word-aligned slot after the load.
                let lit = patch_t32_ldr_pc_literal(exit, block_address);
                thread.record_cc_link(lit, true, target, Isa::T32);
                thread.stats.links_patched += 1;
                flush_icache_range(exit, lit + 4);
            }
        }
        Isa::A32 => {
            // SAFETY: rewriting the reserved exit bytes.
            let mut w = unsafe { CodeWriter::new(exit) };
            cc_branch(thread, &mut w, block_address, target, Isa::A32);
            flush_icache_range(exit, exit + 4);
        }
        Isa::A64 => {
            // SAFETY: rewriting the reserved exit bytes.
            let mut w = unsafe { CodeWriter::new(exit) };
            cc_branch(thread, &mut w, block_address, target, Isa::A64);
            flush_icache_range(exit, exit + 4);
        }
    }
}

/// Overwrite a T32 exit with `LDR PC, [PC, #imm]` plus its literal;
/// returns the literal address.
fn patch_t32_ldr_pc_literal(exit: usize, block_address: usize) -> usize {
    // SAFETY: rewriting the reserved exit bytes.
    let mut w = unsafe { CodeWriter::new(exit) };
    let lit = if exit & 2 != 0 {
        t32::ldr_lit(&mut w, PC, 4);
        exit + 6
    } else {
        t32::ldr_lit(&mut w, PC, 0);
        exit + 4
    };
    // SAFETY: the literal slot is inside the same reserved exit area.
    unsafe { (lit as *mut u32).write_unaligned(block_address as u32) };
    lit
}

fn patch_blxi(
    thread: &mut ThreadData,
    meta: &dbm_core::FragmentMeta,
    target: GuestAddr,
    block_address: usize,
) {
    let exit = meta.exit_branch_addr;
    match meta.isa {
        Isa::T32 => {
            let lit = patch_t32_ldr_pc_literal(exit, block_address);
            thread.record_cc_link(lit, true, target, Isa::T32);
            thread.stats.links_patched += 1;
            flush_icache_range(exit, lit + 4);
        }
        Isa::A32 => {
            // LDR PC, [PC, #-4]: the literal sits right after the
            // load, at exit + 4 (the A32 PC reads as exit + 8).
            // SAFETY: rewriting the reserved exit bytes.
            let mut w = unsafe { CodeWriter::new(exit) };
            dbm_codec::a32::ldr_lit(&mut w, dbm_core::Cond::Al, PC, -4);
            let lit = exit + 4;
            // SAFETY: the literal slot is inside the reserved exit.
            unsafe { (lit as *mut u32).write_unaligned(block_address as u32) };
            thread.record_cc_link(lit, true, target, Isa::A32);
            thread.stats.links_patched += 1;
            flush_icache_range(exit, lit + 4);
        }
        Isa::A64 => fatal_translation(target, "BLX exit on an A64 fragment"),
    }
}

fn patch_cond(
    thread: &mut ThreadData,
    source_index: usize,
    meta: &dbm_core::FragmentMeta,
    target: GuestAddr,
    block_address: usize,
) {
    let is_taken = target == meta.branch_taken_addr;
    if !is_taken && target != meta.branch_skipped_addr {
        fatal_translation(target, "conditional exit reached with a foreign target");
    }
    let other_guest = if is_taken {
        meta.branch_skipped_addr
    } else {
        meta.branch_taken_addr
    };
    let other_cached = thread.entry_address.lookup(other_guest);

    match meta.isa {
        Isa::T32 => {
            if block_address & THUMB_FLAG == 0 {
                fatal_translation(target, "conditional branch into A32 code");
            }
            let exit = meta.exit_branch_addr;
            let (taken_addr, skipped_addr, taken_in, skipped_in) = if is_taken {
                (
                    block_address,
                    other_cached.unwrap_or(meta.branch_skipped_addr),
                    true,
                    other_cached.is_some(),
                )
            } else {
                (
                    other_cached.unwrap_or(meta.branch_taken_addr),
                    block_address,
                    other_cached.is_some(),
                    true,
                )
            };
            let mut write = exit;
            if meta.exit_branch_type == BranchType::Cbz {
                encode_cbz_t32(
                    thread,
                    &mut write,
                    source_index,
                    meta.rn as u8,
                    taken_addr,
                    skipped_addr,
                    taken_in,
                    skipped_in,
                    true,
                );
            } else {
                encode_cond_imm_t32(
                    thread,
                    &mut write,
                    source_index,
                    taken_addr,
                    skipped_addr,
                    meta.branch_condition,
                    taken_in,
                    skipped_in,
                    true,
                );
            }
            flush_icache_range(exit, write.max(exit + 12));
        }
        Isa::A32 => {
            let (start, end) = patch_cond_imm_a32(
                thread,
                source_index,
                block_address,
                is_taken,
                other_cached,
            );
            flush_icache_range(start, end);
        }
        Isa::A64 => {
            let (start, end) =
                patch_cond_a64(thread, source_index, block_address, is_taken);
            flush_icache_range(start, end);
            if let Some(other_addr) = other_cached {
                let (s2, e2) =
                    patch_cond_a64(thread, source_index, other_addr, !is_taken);
                flush_icache_range(s2, e2);
            }
        }
    }
}

fn patch_table_branch(
    thread: &mut ThreadData,
    source_index: usize,
    meta: &dbm_core::FragmentMeta,
    block_address: usize,
) {
    // The sentinel marks entries that came through the fallback path;
    // no linking is required for those.
    let observed = thread.code_cache_meta[source_index].rn;
    if observed == RN_NO_LINK {
        return;
    }
    let table = meta.exit_branch_addr;
    let free_b = thread.code_cache_meta[source_index].free_b as usize;
    if free_b < TB_CACHE_SIZE {
        debug_assert_eq!(tb_read_key(table, free_b), TB_KEY_EMPTY);
        tb_write_pair(table, free_b, observed, block_address as u32);
        thread.code_cache_meta[source_index].free_b += 1;
        thread.stats.links_patched += 1;
    }
    // Table full: the index keeps resolving through the fallback.
    thread.code_cache_meta[source_index].rn = RN_NO_LINK;
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbm_core::code_cache::CodeCache;
    use dbm_core::thread::Arch;

    fn thread(arch: Arch) -> ThreadData {
        let cache = CodeCache::with_slots(128).unwrap();
        let mut td = ThreadData::with_cache(arch, 0, cache).unwrap();
        td.dispatcher_addr = td.code_cache.base() + td.code_cache.size() - 8;
        td.dispatcher_arm_addr = td.dispatcher_addr;
        td.syscall_wrapper_addr = td.code_cache.base() + td.code_cache.size() - 16;
        td
    }

    /// Two T32 blocks joined by B.W: after one dispatch the source
    /// exit is a direct branch to the target fragment.
    #[test]
    fn direct_branch_links_after_one_dispatch() {
        let mut td = thread(Arch::Aarch32);
        // Block B: bx lr. Block A: b.w B.
        let block_b: Vec<u16> = vec![0x4770];
        let b_pc = (block_b.as_ptr() as usize) | 1;
        let mut block_a: Vec<u16> = vec![0, 0];
        let a_pc = (block_a.as_mut_ptr() as usize) | 1;
        {
            let mut w = unsafe { CodeWriter::new(a_pc & !1) };
            let off = (b_pc & !1) as i64 - ((a_pc & !1) as i64 + 4);
            t32::b32(&mut w, off as i32);
        }

        let a_entry = lookup_or_scan(&mut td, a_pc);
        assert_eq!(td.stats.translations, 1);
        let a_meta = td.code_cache_meta[0].clone();
        assert_eq!(a_meta.exit_branch_type, BranchType::UncondImm);

        // First execution of the exit enters the dispatcher.
        let next = dispatch(&mut td, b_pc, 0);
        assert_eq!(td.stats.dispatch_calls, 1);
        let b_entry = td.entry_address.lookup(b_pc).unwrap();
        assert_eq!(next, b_entry);

        // The exit now decodes as a direct B.W to B's fragment.
        let exit = a_meta.exit_branch_addr;
        let (inst, _) = unsafe { t32::decode(exit) };
        match inst {
            t32::T32Inst::B32 { offset } => {
                assert_eq!(
                    (exit as i64 + offset as i64) as usize,
                    b_entry & !1
                );
            }
            other => panic!("exit not linked: {other:?}"),
        }
        // A link record was appended for the patch.
        assert!(td
            .cc_links
            .iter()
            .any(|l| l.patch_addr == exit && l.target == b_pc));
        let _ = a_entry;
    }

    /// Conditional linking: each arm is patched once and
    /// `branch_cache_status` reaches 3 and stays there.
    #[test]
    fn conditional_exit_links_both_arms() {
        let mut td = thread(Arch::Aarch32);
        // beq +2 ; fallthrough: bx lr ; taken: bx lr
        let code: Vec<u16> = vec![0xD000, 0x4770, 0x4770];
        let pc = (code.as_ptr() as usize) | 1;
        lookup_or_scan(&mut td, pc);
        let taken = td.code_cache_meta[0].branch_taken_addr;
        let skipped = td.code_cache_meta[0].branch_skipped_addr;
        assert_eq!(td.code_cache_meta[0].branch_cache_status, 0);

        dispatch(&mut td, taken, 0);
        assert_eq!(td.code_cache_meta[0].branch_cache_status, 2);
        dispatch(&mut td, skipped, 0);
        assert_eq!(td.code_cache_meta[0].branch_cache_status, 3);

        // Re-dispatching an already-linked arm is monotone.
        dispatch(&mut td, taken, 0);
        assert_eq!(td.code_cache_meta[0].branch_cache_status, 3);
        assert_eq!(td.stats.dispatch_calls, 3);
    }

    /// The second arm is linked opportunistically when its target is
    /// already cached at first-dispatch time.
    #[test]
    fn conditional_exit_links_other_arm_opportunistically() {
        let mut td = thread(Arch::Aarch32);
        let code: Vec<u16> = vec![0xD000, 0x4770, 0x4770];
        let pc = (code.as_ptr() as usize) | 1;
        lookup_or_scan(&mut td, pc);
        let taken = td.code_cache_meta[0].branch_taken_addr;
        let skipped = td.code_cache_meta[0].branch_skipped_addr;

        // Pre-translate the skipped arm so it is cached.
        lookup_or_scan(&mut td, skipped);
        dispatch(&mut td, taken, 0);
        assert_eq!(td.code_cache_meta[0].branch_cache_status, 3);
    }

    /// Table-branch linking fills the pair table first-come
    /// first-served and resets the observed index to the sentinel.
    #[test]
    fn table_branch_fills_pair_table() {
        let mut td = thread(Arch::Aarch32);
        // tbb [pc, r1] with a guest table right after, then padding
        // so targets land on real instructions.
        let mut code: Vec<u16> = vec![0, 0, 2, 2, 0x4770, 0x4770];
        let pc = code.as_mut_ptr() as usize | 1;
        {
            let mut w = unsafe { CodeWriter::new(pc & !1) };
            w.write16(0xE8DF); // tbb [pc, r1]
            w.write16(0xF001);
        }
        // Guest table bytes at pc+4: indices 0 and 1 both point at
        // the BX LR at +8.
        unsafe {
            ((pc & !1) as *mut u8).add(4).write(2);
            ((pc & !1) as *mut u8).add(5).write(2);
        }
        lookup_or_scan(&mut td, pc);
        let meta = td.code_cache_meta[0].clone();
        assert!(matches!(meta.exit_branch_type, BranchType::Tbb));
        assert_eq!(meta.rn, RN_NO_LINK);

        // Simulate the emitted sequence observing index 1.
        td.code_cache_meta[0].rn = 1;
        let target = (pc & !1) + 4 + 4 | 1;
        dispatch(&mut td, target, 0);
        assert_eq!(td.code_cache_meta[0].free_b, 1);
        assert_eq!(td.code_cache_meta[0].rn, RN_NO_LINK);
        assert_eq!(tb_read_key(meta.exit_branch_addr, 0), 1);

        // An entry through the fallback path must not link.
        dispatch(&mut td, target, 0);
        assert_eq!(td.code_cache_meta[0].free_b, 1);
        let _ = code.as_mut_ptr();
    }

    /// A64 conditional exits link through the reserved head words.
    #[test]
    fn a64_cond_exit_links() {
        let mut td = thread(Arch::Aarch64);
        // b.ne +8 ; ret ; ret
        let code: Vec<u32> = vec![0x5400_0041, 0xD65F_03C0, 0xD65F_03C0];
        let pc = code.as_ptr() as usize;
        lookup_or_scan(&mut td, pc);
        let meta = td.code_cache_meta[0].clone();
        assert_eq!(meta.exit_branch_type, BranchType::CondImm);

        dispatch(&mut td, meta.branch_taken_addr, 0);
        assert_eq!(td.code_cache_meta[0].branch_cache_status, 2);
        // Head word now decodes as B.NE +8.
        let head = dbm_codec::a64::decode_word(
            td.code_cache.read_u32(meta.exit_branch_addr),
        );
        assert!(
            matches!(
                head,
                dbm_codec::a64::A64Inst::BCond {
                    cond: dbm_core::Cond::Ne,
                    offset: 8
                }
            ),
            "{head:?}"
        );
    }
}
