//! Resident trampolines.
//!
//! The dispatcher and syscall-wrapper trampolines are emitted into
//! reserved fragment slots at thread init, so every exit stub reaches
//! them with a short branch regardless of where the Rust runtime was
//! loaded. The host→guest entry stub is hand-assembled per target
//! architecture.

use dbm_codec::{a32, a64, t32, CodeWriter};
use dbm_core::fragment::Cond;
use dbm_core::icache::flush_icache_range;
use dbm_core::regs::{LR, R0, R1, R2, R3, SP};
use dbm_core::thread::Arch;
use dbm_core::ThreadData;

use crate::dispatcher::dispatcher_entry;

/// Emit the resident trampolines into reserved slots and record
/// their addresses in the thread state. Must run before the first
/// translation; a cache flush keeps the reserved prefix.
pub fn install_trampolines(thread: &mut ThreadData) {
    let thread_ptr = thread as *mut ThreadData as usize;
    match thread.arch {
        Arch::Aarch64 => {
            thread.dispatcher_addr = emit_dispatcher_a64(thread, thread_ptr);
            thread.syscall_wrapper_addr = emit_syscall_wrapper_a64(thread, thread_ptr);
        }
        Arch::Aarch32 => {
            thread.dispatcher_addr = emit_dispatcher_t32(thread, thread_ptr);
            thread.dispatcher_arm_addr = emit_dispatcher_a32(thread, thread_ptr);
            thread.syscall_wrapper_addr = emit_syscall_wrapper_a32(thread, thread_ptr);
        }
    }
    thread.reserved_blocks = thread.free_block;
    flush_icache_range(
        thread.code_cache.base(),
        thread.code_cache.base()
            + thread.reserved_blocks * dbm_core::BASIC_BLOCK_BYTES,
    );
}

fn reserve_slot(thread: &mut ThreadData) -> usize {
    let slot = thread
        .allocate_bb()
        .expect("code cache exhausted before trampoline install");
    thread.code_cache.slot_addr(slot)
}

/// T32 dispatcher trampoline. On entry r0 = target guest PC and
/// r1 = source index (the stub set them after spilling r0-r2 to the
/// scratch area).
fn emit_dispatcher_t32(thread: &mut ThreadData, thread_ptr: usize) -> usize {
    let addr = reserve_slot(thread);
    let scratch = thread.scratch_regs_addr();
    // SAFETY: emitting into a freshly reserved slot.
    let mut w = unsafe { CodeWriter::new(addr) };
    // One spare word for the resolved cache address.
    t32::sub_sp16(&mut w, 1);
    t32::push_regs(&mut w, (1 << R3) | (1 << LR));
    t32::copy_to_reg(&mut w, R2, thread_ptr as u32);
    t32::copy_to_reg(&mut w, R3, dispatcher_entry as usize as u32);
    t32::blx_reg(&mut w, R3);
    // r0 = next cache address; stash it in the spare word.
    t32::str_sp16(&mut w, R0, 2);
    // Restore the guest context and leave through the spare word.
    t32::copy_to_reg(&mut w, R3, scratch as u32);
    t32::ldmia(&mut w, R3, (1 << R0) | (1 << R1) | (1 << R2), false);
    t32::pop_regs(&mut w, (1 << R3) | (1 << LR));
    t32::ldr_imm8(&mut w, 15, SP, 4, false, true);
    addr | 1
}

/// A32 flavour of the dispatcher trampoline.
fn emit_dispatcher_a32(thread: &mut ThreadData, thread_ptr: usize) -> usize {
    let addr = reserve_slot(thread);
    let scratch = thread.scratch_regs_addr();
    // SAFETY: emitting into a freshly reserved slot.
    let mut w = unsafe { CodeWriter::new(addr) };
    a32::sub_imm(&mut w, Cond::Al, SP, SP, 4);
    a32::push(&mut w, Cond::Al, (1 << R3) | (1 << LR));
    a32::copy_to_reg(&mut w, Cond::Al, R2, thread_ptr as u32);
    a32::copy_to_reg(&mut w, Cond::Al, R3, dispatcher_entry as usize as u32);
    a32::blx_reg(&mut w, Cond::Al, R3);
    a32::str_imm(&mut w, Cond::Al, R0, SP, 8);
    a32::copy_to_reg(&mut w, Cond::Al, R3, scratch as u32);
    a32::ldmia(&mut w, Cond::Al, R3, (1 << R0) | (1 << R1) | (1 << R2), false);
    a32::pop(&mut w, Cond::Al, (1 << R3) | (1 << LR));
    a32::ldr_imm(&mut w, Cond::Al, 15, SP, 4, false, true);
    addr
}

/// A64 dispatcher trampoline. The stub pushed x0/x1 and set
/// x0 = target, x1 = source index. x16/x17 are clobberable here.
fn emit_dispatcher_a64(thread: &mut ThreadData, thread_ptr: usize) -> usize {
    let addr = reserve_slot(thread);
    // SAFETY: emitting into a freshly reserved slot.
    let mut w = unsafe { CodeWriter::new(addr) };
    // Save the caller-saved file the callee may clobber (x16/x17
    // excepted by convention).
    for pair in (2u8..16).step_by(2) {
        a64::stp_pre(&mut w, pair, pair + 1, 31, -16);
    }
    a64::stp_pre(&mut w, 18, 30, 31, -16);
    a64::copy_to_reg(&mut w, 2, thread_ptr as u64);
    a64::copy_to_reg(&mut w, 16, dispatcher_entry as usize as u64);
    a64::blr(&mut w, 16);
    a64::mov_reg(&mut w, true, 16, 0);
    a64::ldp_post(&mut w, 18, 30, 31, 16);
    for i in (1u8..8).rev() {
        let pair = i * 2;
        a64::ldp_post(&mut w, pair, pair + 1, 31, 16);
    }
    // The stub frame holds the guest x0/x1.
    a64::ldp_post(&mut w, 0, 1, 31, 16);
    a64::br(&mut w, 16);
    addr
}

/// A32 syscall wrapper. The translated SVC sequence pushed one spare
/// word plus {r0-r12, lr} and set r8 = post-syscall guest PC; the
/// wrapper hands the saved register file to the runtime handler and
/// returns into the fragment.
fn emit_syscall_wrapper_a32(thread: &mut ThreadData, thread_ptr: usize) -> usize {
    let addr = reserve_slot(thread);
    let handler = thread.syscall_handler_fn;
    // SAFETY: emitting into a freshly reserved slot.
    let mut w = unsafe { CodeWriter::new(addr) };
    // Keep the fragment return address in the spare word above the
    // saved register file.
    a32::str_imm(&mut w, Cond::Al, LR, SP, 14 * 4);
    a32::mov_reg(&mut w, Cond::Al, R0, SP);
    a32::mov_reg(&mut w, Cond::Al, R1, 8);
    a32::copy_to_reg(&mut w, Cond::Al, R2, thread_ptr as u32);
    a32::copy_to_reg(&mut w, Cond::Al, R3, handler as u32);
    a32::blx_reg(&mut w, Cond::Al, R3);
    // The handler mutated the saved file in place (result in the r0
    // slot). Restore and return through the spare word.
    a32::pop(&mut w, Cond::Al, 0x5FFF);
    a32::ldr_imm(&mut w, Cond::Al, 15, SP, 4, false, true);
    addr
}

/// A64 syscall wrapper. The translated SVC sequence pushed
/// x0..x18,x30 (ascending from SP) and set x9 = post-syscall PC.
fn emit_syscall_wrapper_a64(thread: &mut ThreadData, thread_ptr: usize) -> usize {
    let addr = reserve_slot(thread);
    let handler = thread.syscall_handler_fn;
    // SAFETY: emitting into a freshly reserved slot.
    let mut w = unsafe { CodeWriter::new(addr) };
    // mov x0, sp (ADD immediate alias; ORR would read XZR).
    a64::add_imm(&mut w, true, 0, 31, 0);
    a64::mov_reg(&mut w, true, 1, 9);
    a64::copy_to_reg(&mut w, 2, thread_ptr as u64);
    a64::copy_to_reg(&mut w, 16, handler as u64);
    a64::str_pre(&mut w, 30, 31, -16);
    a64::blr(&mut w, 16);
    a64::ldr_post(&mut w, 30, 31, 16);
    // Restore x0..x17 pairs, then swap the fragment return out of the
    // way while reloading the guest x30.
    for pair in (0u8..18).step_by(2) {
        a64::ldp_post(&mut w, pair, pair + 1, 31, 16);
    }
    a64::mov_reg(&mut w, true, 16, 30);
    a64::ldp_post(&mut w, 18, 30, 31, 16);
    a64::br(&mut w, 16);
    addr
}

// ---------------------------------------------------------------
// Host → guest entry
// ---------------------------------------------------------------

/// Transfer control into the code cache with the guest register file
/// installed. Never returns; the guest leaves through `exit` /
/// `exit_group`, which the syscall interposer turns into thread
/// teardown.
///
/// # Safety
/// `regs` must point at a full guest register file laid out for the
/// target architecture and `cache_addr` at a valid fragment entry.
#[cfg(target_arch = "aarch64")]
pub unsafe fn enter_cache(regs: *const usize, cache_addr: usize) -> ! {
    core::arch::asm!(
        "ldr x9, [x16, #248]",
        "mov sp, x9",
        "ldp x0, x1, [x16]",
        "ldp x2, x3, [x16, #16]",
        "ldp x4, x5, [x16, #32]",
        "ldp x6, x7, [x16, #48]",
        "ldp x8, x9, [x16, #64]",
        "ldp x10, x11, [x16, #80]",
        "ldp x12, x13, [x16, #96]",
        "ldp x14, x15, [x16, #112]",
        "ldp x18, x19, [x16, #144]",
        "ldp x20, x21, [x16, #160]",
        "ldp x22, x23, [x16, #176]",
        "ldp x24, x25, [x16, #192]",
        "ldp x26, x27, [x16, #208]",
        "ldp x28, x29, [x16, #224]",
        "ldr x30, [x16, #240]",
        "br x17",
        in("x16") regs,
        in("x17") cache_addr,
        options(noreturn),
    )
}

/// 32-bit ARM flavour: loads r0-r12, SP, LR and jumps (the low bit of
/// `cache_addr` selects the mode).
#[cfg(target_arch = "arm")]
pub unsafe fn enter_cache(regs: *const usize, cache_addr: usize) -> ! {
    core::arch::asm!(
        "ldr sp, [r12, #52]",
        "ldr lr, [r12, #56]",
        "push {{r4}}",
        "ldm r12, {{r0-r11}}",
        "ldr r12, [r12, #48]",
        "pop {{pc}}",
        in("r12") regs,
        in("r4") cache_addr,
        options(noreturn),
    )
}

/// Hosts of other architectures never execute the cache; entry is a
/// runtime bug there.
#[cfg(not(any(target_arch = "aarch64", target_arch = "arm")))]
pub unsafe fn enter_cache(_regs: *const usize, _cache_addr: usize) -> ! {
    unreachable!("guest entry on a non-ARM host")
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbm_core::code_cache::CodeCache;

    #[test]
    fn trampolines_reserve_prefix_slots() {
        let cache = CodeCache::with_slots(32).unwrap();
        let mut td = ThreadData::with_cache(Arch::Aarch64, 0, cache).unwrap();
        install_trampolines(&mut td);
        assert_eq!(td.reserved_blocks, 2);
        assert!(td.dispatcher_addr >= td.code_cache.base());
        assert!(td.syscall_wrapper_addr > td.dispatcher_addr);

        // A flush keeps the trampolines resident.
        crate::flush::flush_code_cache(&mut td);
        assert_eq!(td.free_block, td.reserved_blocks);
    }

    #[test]
    fn aarch32_gets_both_dispatcher_flavours() {
        let cache = CodeCache::with_slots(32).unwrap();
        let mut td = ThreadData::with_cache(Arch::Aarch32, 0, cache).unwrap();
        install_trampolines(&mut td);
        assert_eq!(td.reserved_blocks, 3);
        assert_eq!(td.dispatcher_addr & 1, 1);
        assert_eq!(td.dispatcher_arm_addr & 1, 0);
        assert_ne!(td.dispatcher_addr & !1, td.dispatcher_arm_addr);
    }
}
