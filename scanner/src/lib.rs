//! Basic-block scanner: translates guest code into code-cache
//! fragments, one block at a time.
//!
//! `scan` is the dispatcher's translation entry point: it allocates a
//! fragment, runs the per-ISA scan loop, installs the guest-PC →
//! cache-address binding and returns the entry address. Resource
//! pressure (cache or hash-table exhaustion) is reported to the
//! caller, which flushes and retries.

pub mod a32;
pub mod a64;
pub mod callbacks;
pub mod common;
pub mod it_state;
pub mod t32;

use dbm_codec::CodeWriter;
use dbm_core::fragment::{BranchType, Isa};
use dbm_core::thread::Arch;
use dbm_core::{CachePressure, GuestAddr, ThreadData, THUMB_FLAG};

use common::{
    branch_jump, branch_save_context, ScanCursors, INSERT_BRANCH,
    REPLACE_TARGET, SETUP,
};

/// ISA a guest address executes in.
pub fn isa_for(arch: Arch, target: GuestAddr) -> Isa {
    match arch {
        Arch::Aarch64 => Isa::A64,
        Arch::Aarch32 => {
            if target & THUMB_FLAG != 0 {
                Isa::T32
            } else {
                Isa::A32
            }
        }
    }
}

/// Translate the basic block at `target` into a fresh fragment and
/// install its hash-table binding. Returns the cache entry address
/// (mode bit preserved).
pub fn scan(thread: &mut ThreadData, target: GuestAddr) -> Result<usize, CachePressure> {
    let basic_block = thread.allocate_bb().ok_or(CachePressure::CacheFull)?;
    thread.stats.translations += 1;
    log::debug!(
        "scanning guest {target:#x} into fragment {basic_block}"
    );
    let entry = match isa_for(thread.arch, target) {
        Isa::T32 => t32::scan_t32(thread, target & !THUMB_FLAG, basic_block)?,
        Isa::A32 => a32::scan_a32(thread, target, basic_block)?,
        Isa::A64 => a64::scan_a64(thread, target, basic_block)?,
    };
    if !thread.entry_address.insert(target, entry) {
        return Err(CachePressure::HashFull);
    }
    Ok(entry)
}

/// Resolve `target` to a cache address without forcing a full
/// translation: a hash hit is returned directly, a miss builds a stub
/// fragment that enters the dispatcher for `target` on first
/// execution. Used for scan-time linking of the not-yet-translated
/// side of an exit.
pub fn lookup_or_stub(
    thread: &mut ThreadData,
    target: GuestAddr,
) -> Result<usize, CachePressure> {
    if let Some(addr) = thread.entry_address.lookup(target) {
        return Ok(addr);
    }
    stub_bb(thread, target)
}

/// Build a stub fragment: a dispatcher call for `target` that the
/// dispatcher later overwrites with a direct branch (its exit type is
/// `UncondImm` with the rewritable slot at the fragment start).
fn stub_bb(thread: &mut ThreadData, target: GuestAddr) -> Result<usize, CachePressure> {
    let basic_block = thread.allocate_bb().ok_or(CachePressure::CacheFull)?;
    let isa = isa_for(thread.arch, target);
    let cursors = ScanCursors::for_slot(thread, basic_block);
    let entry = cursors.write;

    let meta = &mut thread.code_cache_meta[basic_block];
    meta.isa = isa;
    meta.exit_branch_type = BranchType::UncondImm;
    meta.exit_branch_addr = entry;

    // SAFETY: a stub fits comfortably inside one fresh slot.
    let mut w = unsafe { CodeWriter::new(entry) };
    branch_save_context(&mut w, thread.scratch_regs_addr(), isa);
    branch_jump(
        thread,
        &mut w,
        basic_block,
        target,
        SETUP | REPLACE_TARGET | INSERT_BRANCH,
        isa,
    );
    dbm_core::icache::flush_icache_range(entry, w.addr());

    let mode = if isa == Isa::T32 { THUMB_FLAG } else { 0 };
    Ok(entry | mode)
}

pub(crate) fn sext9(v: u32) -> i32 {
    ((v << 23) as i32) >> 23
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbm_core::code_cache::CodeCache;
    use dbm_core::fragment::BranchType;

    fn thread(arch: Arch) -> ThreadData {
        let cache = CodeCache::with_slots(64).unwrap();
        let mut td = ThreadData::with_cache(arch, 0, cache).unwrap();
        // Dispatcher / wrapper targets inside the mapping so emitted
        // branches are encodable.
        td.dispatcher_addr = td.code_cache.base() + td.code_cache.size() - 8;
        td.syscall_wrapper_addr = td.code_cache.base() + td.code_cache.size() - 16;
        td
    }

    #[test]
    fn isa_selection_follows_mode_bit() {
        assert_eq!(isa_for(Arch::Aarch32, 0x8000), Isa::A32);
        assert_eq!(isa_for(Arch::Aarch32, 0x8001), Isa::T32);
        assert_eq!(isa_for(Arch::Aarch64, 0x8000), Isa::A64);
    }

    #[test]
    fn scan_installs_hash_binding() {
        let mut td = thread(Arch::Aarch64);
        // Guest block: one ADD (copied) then an indirect RET.
        let code: Vec<u32> = vec![0x8B01_0000, 0xD65F_03C0];
        let pc = code.as_ptr() as usize;
        let entry = scan(&mut td, pc).unwrap();
        assert_eq!(td.entry_address.lookup(pc), Some(entry));
        assert_eq!(
            td.code_cache_meta[0].exit_branch_type,
            BranchType::UncondReg
        );
        // The copied ADD is the first emitted word.
        assert_eq!(td.code_cache.read_u32(entry), 0x8B01_0000);
    }

    #[test]
    fn stub_is_not_hashed() {
        let mut td = thread(Arch::Aarch64);
        let target = 0x40_0000usize;
        let stub = lookup_or_stub(&mut td, target).unwrap();
        assert_eq!(td.entry_address.lookup(target), None);
        assert_eq!(
            td.code_cache_meta[0].exit_branch_type,
            BranchType::UncondImm
        );
        assert_eq!(td.code_cache_meta[0].exit_branch_addr, stub);
        // A second request builds a second stub.
        let stub2 = lookup_or_stub(&mut td, target).unwrap();
        assert_ne!(stub, stub2);
    }

    #[test]
    fn t32_single_block_copies_body() {
        let mut td = thread(Arch::Aarch32);
        // adds r0, #1; adds r0, #2; adds r0, #3; bx lr
        let code: Vec<u16> = vec![0x3001, 0x3002, 0x3003, 0x4770];
        let pc = (code.as_ptr() as usize) | 1;
        let entry = scan(&mut td, pc).unwrap();
        assert_eq!(entry & 1, 1);
        assert_eq!(td.entry_address.lookup(pc), Some(entry));
        let base = entry & !1;
        assert_eq!(td.code_cache.read_u16(base), 0x3001);
        assert_eq!(td.code_cache.read_u16(base + 2), 0x3002);
        assert_eq!(td.code_cache.read_u16(base + 4), 0x3003);
        assert_eq!(
            td.code_cache_meta[0].exit_branch_type,
            BranchType::UncondReg
        );
    }

    #[test]
    fn t32_cond_branch_records_both_arms() {
        let mut td = thread(Arch::Aarch32);
        // cmp r0, #0; beq +4
        let code: Vec<u16> = vec![0x2800, 0xD001, 0xBF00, 0xBF00, 0xBF00];
        let pc = (code.as_ptr() as usize) | 1;
        scan(&mut td, pc).unwrap();
        let meta = &td.code_cache_meta[0];
        assert_eq!(meta.exit_branch_type, BranchType::CondImm);
        let beq_addr = (pc & !1) + 2;
        // B.cond target: beq address + 4 + 2*imm8.
        assert_eq!(meta.branch_taken_addr, (beq_addr + 4 + 2) | 1);
        assert_eq!(meta.branch_skipped_addr, (beq_addr + 2) | 1);
        assert_eq!(meta.branch_cache_status, 0);
    }

    #[test]
    fn t32_uncond_b16_inlines_forward_target() {
        let mut td = thread(Arch::Aarch32);
        // b .+4 (skips one nop), nop (skipped), adds r0,#1, bx lr
        let code: Vec<u16> = vec![0xE000, 0xBF00, 0x3001, 0x4770];
        let pc = (code.as_ptr() as usize) | 1;
        let entry = scan(&mut td, pc).unwrap();
        // The skipped nop is not in the fragment: the first emitted
        // instruction is the ADDS from the branch target.
        assert_eq!(td.code_cache.read_u16(entry & !1), 0x3001);
    }

    #[test]
    fn t32_backward_branch_respects_inline_limit() {
        let mut td = thread(Arch::Aarch32);
        // A one-instruction infinite loop: b . (offset -4 => imm -2)
        let code: Vec<u16> = vec![0xE7FE];
        let pc = (code.as_ptr() as usize) | 1;
        scan(&mut td, pc).unwrap();
        assert_eq!(
            td.code_cache_meta[0].exit_branch_type,
            BranchType::TraceInlineMax
        );
        // The loop was unrolled MAX_BACK_INLINE times, then closed
        // with a branch to a stub fragment.
        assert!(td.free_block >= 2);
    }

    #[test]
    fn a64_cbz_normalises_taken_to_zero_path() {
        let mut td = thread(Arch::Aarch64);
        // cbnz x3, +8; nop
        let code: Vec<u32> = vec![0xB500_0043, 0xD503_201F];
        let pc = code.as_ptr() as usize;
        scan(&mut td, pc).unwrap();
        let meta = &td.code_cache_meta[0];
        assert_eq!(meta.exit_branch_type, BranchType::Cbz);
        // CBNZ: the zero path is the fall-through.
        assert_eq!(meta.branch_taken_addr, pc + 4);
        assert_eq!(meta.branch_skipped_addr, pc + 8);
    }

    #[test]
    fn a64_adr_materialises_address() {
        let mut td = thread(Arch::Aarch64);
        // adr x1, #+12 ; ret
        let code: Vec<u32> = vec![0x1000_0061, 0xD65F_03C0];
        let pc = code.as_ptr() as usize;
        let entry = scan(&mut td, pc).unwrap();
        // MOVZ x1, (pc + 12) & 0xFFFF
        let w0 = td.code_cache.read_u32(entry);
        let expect = ((pc + 12) & 0xFFFF) as u32;
        assert_eq!(w0, 0xD280_0000 | (expect << 5) | 1);
    }

    #[test]
    fn cache_pressure_is_reported_not_fatal() {
        let cache = CodeCache::with_slots(1).unwrap();
        let mut td = ThreadData::with_cache(Arch::Aarch64, 0, cache).unwrap();
        td.dispatcher_addr = td.code_cache.base();
        td.allocate_bb().unwrap();
        let code: Vec<u32> = vec![0xD65F_03C0];
        assert_eq!(
            scan(&mut td, code.as_ptr() as usize),
            Err(CachePressure::CacheFull)
        );
    }
}
