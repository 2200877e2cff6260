//! Machinery shared by the per-ISA scanners: fragment cursors, the
//! free-space guard, exit stubs, conditional-exit encoders and the
//! inline hash lookup.
//!
//! Exit layouts are a contract with the dispatcher: the patch
//! functions here rewrite exactly the bytes the scan-time encoders
//! reserved.

use dbm_codec::{a32, a64, t32, CodeWriter};
use dbm_core::fragment::{Cond, Isa};
use dbm_core::regs::{LR, PC, R0, R1, R2, R3, X30};
use dbm_core::{fatal_translation, CachePressure, GuestAddr, ThreadData};

use crate::it_state::ItState;

/// Back-edge inlining limit for direct unconditional branches.
pub const MAX_BACK_INLINE: usize = 4;

/// Free space guaranteed to a plugin callback between re-checks.
pub const PLUGIN_HEADROOM: usize = 96;

// Worst-case sizes of the emitted constructs, per ISA.
pub const DISP_CALL_SIZE_T32: usize = 40;
pub const IMM_SIZE_T32: usize = 64;
pub const CBZ_SIZE_T32: usize = 76;
pub const IHL_SIZE_T32: usize = 120;
pub const TB_SIZE_T32: usize = 280;
pub const DISP_CALL_SIZE_A32: usize = 44;
pub const IMM_SIZE_A32: usize = 72;
pub const DISP_CALL_SIZE_A64: usize = 48;
pub const IMM_SIZE_A64: usize = 88;
pub const IHL_SIZE_A64: usize = 104;

/// Exit-stub emission flags.
pub const SETUP: u32 = 1 << 0;
pub const REPLACE_TARGET: u32 = 1 << 1;
pub const INSERT_BRANCH: u32 = 1 << 2;

/// Write and literal-data cursors of the fragment being scanned. The
/// body grows up from `write`; literals grow down from `data`.
pub struct ScanCursors {
    pub write: usize,
    pub data: usize,
}

impl ScanCursors {
    pub fn for_slot(thread: &ThreadData, index: usize) -> Self {
        Self {
            write: thread.code_cache.slot_addr(index),
            data: thread.code_cache.slot_end(index),
        }
    }

    /// Allocate `bytes` of literal data, returning its address.
    pub fn alloc_data(&mut self, bytes: usize) -> usize {
        debug_assert!(bytes % 4 == 0);
        self.data -= bytes;
        self.data
    }

    /// Run an emitter at the write cursor and advance it.
    pub fn emit(&mut self, f: impl FnOnce(&mut CodeWriter)) {
        // SAFETY: the free-space guard keeps `write` inside the
        // fragment's writable span.
        let mut w = unsafe { CodeWriter::new(self.write) };
        f(&mut w);
        self.write = w.addr();
    }
}

/// Ensure at least `size` bytes remain between the cursors, spanning
/// the fragment into fresh slots when needed. An in-flight IT block is
/// clipped before the seam branch and reopened on the far side.
pub fn check_free_space(
    thread: &mut ThreadData,
    cursors: &mut ScanCursors,
    it: Option<&mut ItState>,
    isa: Isa,
    size: usize,
) -> Result<(), CachePressure> {
    if cursors.write > cursors.data {
        fatal_translation(cursors.write, "fragment overflowed its literal area");
    }
    if cursors.write + size < cursors.data {
        return Ok(());
    }
    let mut it = it;
    while cursors.write + size >= cursors.data {
        let new_block = thread.allocate_bb().ok_or(CachePressure::CacheFull)?;
        let new_addr = thread.code_cache.slot_addr(new_block);
        if new_addr == cursors.data {
            // Adjacent slot with an empty literal area: extend in
            // place.
            cursors.data = new_addr + dbm_core::BASIC_BLOCK_BYTES;
            continue;
        }
        let gapped = it
            .as_deref_mut()
            .map(|st| st.create_gap(&mut cursors.write))
            .unwrap_or(false);
        match isa {
            Isa::T32 => cursors.emit(|w| t32_b32_abs(w, new_addr)),
            Isa::A32 => cursors.emit(|w| a32_b_abs(w, Cond::Al, new_addr)),
            Isa::A64 => cursors.emit(|w| a64_b_abs(w, new_addr)),
        }
        cursors.write = new_addr;
        cursors.data = new_addr + dbm_core::BASIC_BLOCK_BYTES;
        if gapped {
            if let Some(st) = it.as_deref_mut() {
                st.close_gap(&mut cursors.write);
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------
// Branch helpers (absolute targets, range-checked)
// ---------------------------------------------------------------

pub fn t32_b32_abs(w: &mut CodeWriter, dest: usize) {
    let offset = (dest & !1) as i64 - (w.addr() as i64 + 4);
    if !(-(1 << 24)..1 << 24).contains(&offset) {
        fatal_translation(dest, "branch out of range");
    }
    t32::b32(w, offset as i32);
}

pub fn a32_b_abs(w: &mut CodeWriter, cond: Cond, dest: usize) {
    let offset = dest as i64 - (w.addr() as i64 + 8);
    if !(-(1 << 25)..1 << 25).contains(&offset) {
        fatal_translation(dest, "branch out of range");
    }
    a32::b(w, cond, offset as i32);
}

pub fn a64_b_abs(w: &mut CodeWriter, dest: usize) {
    let offset = dest as i64 - w.addr() as i64;
    if !(-(1 << 27)..1 << 27).contains(&offset) {
        fatal_translation(dest, "branch out of range");
    }
    a64::b(w, offset as i32);
}

/// T32 BLX immediate to an A32 destination (mode change).
pub fn t32_blx32_abs(w: &mut CodeWriter, dest: usize) {
    let offset = dest as i64 - ((w.addr() as i64 + 4) & !3);
    if !(-(1 << 24)..1 << 24).contains(&offset) {
        fatal_translation(dest, "call out of range");
    }
    t32::blx32(w, offset as i32);
}

pub fn a32_bl_abs(w: &mut CodeWriter, cond: Cond, dest: usize) {
    let offset = dest as i64 - (w.addr() as i64 + 8);
    if !(-(1 << 25)..1 << 25).contains(&offset) {
        fatal_translation(dest, "call out of range");
    }
    a32::bl(w, cond, offset as i32);
}

pub fn a64_bl_abs(w: &mut CodeWriter, dest: usize) {
    let offset = dest as i64 - w.addr() as i64;
    if !(-(1 << 27)..1 << 27).contains(&offset) {
        fatal_translation(dest, "call out of range");
    }
    a64::bl(w, offset as i32);
}

/// Direct branch to a cache address, recording a link so the flush can
/// account for it.
pub fn cc_branch(
    thread: &mut ThreadData,
    w: &mut CodeWriter,
    dest_cache: usize,
    target_guest: GuestAddr,
    isa: Isa,
) {
    let at = w.addr();
    match isa {
        Isa::T32 => t32_b32_abs(w, dest_cache & !1),
        Isa::A32 => a32_b_abs(w, Cond::Al, dest_cache),
        Isa::A64 => a64_b_abs(w, dest_cache),
    }
    thread.record_cc_link(at, false, target_guest, isa);
    thread.stats.links_patched += 1;
}

// ---------------------------------------------------------------
// Exit stubs
// ---------------------------------------------------------------

/// Spill the registers the dispatcher trampoline consumes.
///
/// T32/A32 store r0-r2 to the per-thread scratch area (via r3, which
/// is preserved). A64 pushes x0/x1 onto the guest stack; the
/// trampoline unwinds the frame.
pub fn branch_save_context(w: &mut CodeWriter, scratch_addr: usize, isa: Isa) {
    match isa {
        Isa::T32 => {
            t32::push16(w, 1 << R3);
            t32::copy_to_reg(w, R3, scratch_addr as u32);
            t32::stmia(w, R3, (1 << R0) | (1 << R1) | (1 << R2), false);
            t32::pop16(w, 1 << R3);
        }
        Isa::A32 => {
            a32::push(w, Cond::Al, 1 << R3);
            a32::copy_to_reg(w, Cond::Al, R3, scratch_addr as u32);
            a32::stmia(w, Cond::Al, R3, (1 << R0) | (1 << R1) | (1 << R2));
            a32::pop(w, Cond::Al, 1 << R3);
        }
        Isa::A64 => {
            a64::stp_pre(w, 0, 1, 31, -16);
        }
    }
}

/// Emit the argument setup and branch of a dispatcher stub:
/// r0/x0 = target guest PC, r1/x1 = source fragment index.
pub fn branch_jump(
    thread: &ThreadData,
    w: &mut CodeWriter,
    basic_block: usize,
    target: GuestAddr,
    flags: u32,
    isa: Isa,
) {
    match isa {
        Isa::T32 => {
            if flags & SETUP != 0 {
                t32::copy_to_reg(w, R1, basic_block as u32);
            }
            if flags & REPLACE_TARGET != 0 {
                t32::copy_to_reg(w, R0, target as u32);
            }
            if flags & INSERT_BRANCH != 0 {
                t32_b32_abs(w, thread.dispatcher_addr);
            }
        }
        Isa::A32 => {
            if flags & SETUP != 0 {
                a32::copy_to_reg(w, Cond::Al, R1, basic_block as u32);
            }
            if flags & REPLACE_TARGET != 0 {
                a32::copy_to_reg(w, Cond::Al, R0, target as u32);
            }
            if flags & INSERT_BRANCH != 0 {
                a32_b_abs(w, Cond::Al, thread.dispatcher_arm_addr);
            }
        }
        Isa::A64 => {
            if flags & SETUP != 0 {
                a64::copy_to_reg(w, 1, basic_block as u64);
            }
            if flags & REPLACE_TARGET != 0 {
                a64::copy_to_reg(w, 0, target as u64);
            }
            if flags & INSERT_BRANCH != 0 {
                a64_b_abs(w, thread.dispatcher_addr);
            }
        }
    }
}

// ---------------------------------------------------------------
// T32 conditional exits
// ---------------------------------------------------------------

/// Encode (scan time) or re-encode (dispatcher patch) the exit of a
/// T32 conditional immediate branch.
///
/// `address_taken` / `address_skipped` are cache addresses when the
/// corresponding `*_in_cache` flag is set and guest addresses
/// otherwise. Layout at `exit_branch_addr`:
/// three reserved halfwords (IT + B32 once both arms link), the
/// context save, the source-index setup and the two dispatcher
/// trampolines.
#[allow(clippy::too_many_arguments)]
pub fn encode_cond_imm_t32(
    thread: &mut ThreadData,
    write: &mut usize,
    basic_block: usize,
    address_taken: usize,
    address_skipped: usize,
    condition: Cond,
    taken_in_cache: bool,
    skipped_in_cache: bool,
    update: bool,
) {
    // SAFETY: scan-time calls come through the free-space guard;
    // patch-time calls rewrite the reserved exit bytes.
    let mut w = unsafe { CodeWriter::new(*write) };
    let taken_guest = thread.code_cache_meta[basic_block].branch_taken_addr;
    let skipped_guest = thread.code_cache_meta[basic_block].branch_skipped_addr;
    let status = thread.code_cache_meta[basic_block].branch_cache_status;

    if taken_in_cache && skipped_in_cache {
        if update && status & 1 != 0 {
            // The skipped arm was linked first and owns the near slot.
            t32::it(&mut w, condition.invert(), 0x8);
            cc_branch(thread, &mut w, address_skipped, skipped_guest, Isa::T32);
            cc_branch(thread, &mut w, address_taken, taken_guest, Isa::T32);
        } else {
            t32::it(&mut w, condition, 0x8);
            cc_branch(thread, &mut w, address_taken, taken_guest, Isa::T32);
            cc_branch(thread, &mut w, address_skipped, skipped_guest, Isa::T32);
        }
        thread.code_cache_meta[basic_block].branch_cache_status = 3;
    } else {
        if taken_in_cache {
            t32::it(&mut w, condition, 0x8);
            cc_branch(thread, &mut w, address_taken, taken_guest, Isa::T32);
            thread.code_cache_meta[basic_block].branch_cache_status |= 2;
        }
        if skipped_in_cache {
            t32::it(&mut w, condition.invert(), 0x8);
            cc_branch(thread, &mut w, address_skipped, skipped_guest, Isa::T32);
            thread.code_cache_meta[basic_block].branch_cache_status |= 1;
        }
        if !update {
            if !taken_in_cache && !skipped_in_cache {
                // Reserve the linked-branch slots.
                t32::nop(&mut w);
                t32::nop(&mut w);
                t32::nop(&mut w);
            }
            branch_save_context(&mut w, thread.scratch_regs_addr(), Isa::T32);
            branch_jump(thread, &mut w, basic_block, 0, SETUP, Isa::T32);
            if !taken_in_cache && !skipped_in_cache {
                // Over the skipped trampoline (12 bytes) to the taken
                // one.
                t32::b_cond16(&mut w, condition, 10);
            }
            if !skipped_in_cache {
                branch_jump(
                    thread,
                    &mut w,
                    basic_block,
                    address_skipped,
                    REPLACE_TARGET | INSERT_BRANCH,
                    Isa::T32,
                );
            }
            if !taken_in_cache {
                branch_jump(
                    thread,
                    &mut w,
                    basic_block,
                    address_taken,
                    REPLACE_TARGET | INSERT_BRANCH,
                    Isa::T32,
                );
            }
        }
    }
    *write = w.addr();
}

/// Encode or re-encode a T32 CBZ/CBNZ exit. The scanner normalises
/// `branch_taken_addr` to the rn == 0 path, so polarity here only
/// depends on which arms are linked.
#[allow(clippy::too_many_arguments)]
pub fn encode_cbz_t32(
    thread: &mut ThreadData,
    write: &mut usize,
    basic_block: usize,
    rn: u8,
    address_taken: usize,
    address_skipped: usize,
    taken_in_cache: bool,
    skipped_in_cache: bool,
    update: bool,
) {
    // SAFETY: as in `encode_cond_imm_t32`.
    let mut w = unsafe { CodeWriter::new(*write) };
    let taken_guest = thread.code_cache_meta[basic_block].branch_taken_addr;
    let skipped_guest = thread.code_cache_meta[basic_block].branch_skipped_addr;
    let status = thread.code_cache_meta[basic_block].branch_cache_status;

    if taken_in_cache && skipped_in_cache {
        if update && status & 1 != 0 {
            t32::cbz(&mut w, false, rn, 2);
            cc_branch(thread, &mut w, address_skipped, skipped_guest, Isa::T32);
            cc_branch(thread, &mut w, address_taken, taken_guest, Isa::T32);
        } else {
            t32::cbz(&mut w, true, rn, 2);
            cc_branch(thread, &mut w, address_taken, taken_guest, Isa::T32);
            cc_branch(thread, &mut w, address_skipped, skipped_guest, Isa::T32);
        }
        thread.code_cache_meta[basic_block].branch_cache_status = 3;
    } else {
        if taken_in_cache {
            t32::cbz(&mut w, true, rn, 6);
            cc_branch(thread, &mut w, address_taken, taken_guest, Isa::T32);
            t32::nop(&mut w);
            t32::nop(&mut w);
            thread.code_cache_meta[basic_block].branch_cache_status |= 2;
        }
        if skipped_in_cache {
            t32::cbz(&mut w, false, rn, 6);
            cc_branch(thread, &mut w, address_skipped, skipped_guest, Isa::T32);
            t32::nop(&mut w);
            t32::nop(&mut w);
            thread.code_cache_meta[basic_block].branch_cache_status |= 1;
        }
        if !update {
            if !taken_in_cache && !skipped_in_cache {
                for _ in 0..5 {
                    t32::nop(&mut w);
                }
            }
            branch_save_context(&mut w, thread.scratch_regs_addr(), Isa::T32);
            if !taken_in_cache && !skipped_in_cache {
                // Over the skipped trampoline (20 bytes) to the taken
                // one.
                t32::cbz(&mut w, false, rn, 18);
            }
            if !skipped_in_cache {
                branch_jump(
                    thread,
                    &mut w,
                    basic_block,
                    address_skipped,
                    SETUP | REPLACE_TARGET | INSERT_BRANCH,
                    Isa::T32,
                );
            }
            if !taken_in_cache {
                branch_jump(
                    thread,
                    &mut w,
                    basic_block,
                    address_taken,
                    SETUP | REPLACE_TARGET | INSERT_BRANCH,
                    Isa::T32,
                );
            }
        }
    }
    *write = w.addr();
}

// ---------------------------------------------------------------
// A32 conditional exit
// ---------------------------------------------------------------

/// Scan-time encoding of an A32 conditional exit: two reserved words
/// for the linked branches, then the dispatcher trampolines. The
/// dispatcher patches the reserved words through
/// `patch_cond_imm_a32`.
#[allow(clippy::too_many_arguments)]
pub fn encode_cond_imm_a32(
    thread: &mut ThreadData,
    write: &mut usize,
    basic_block: usize,
    address_taken: usize,
    address_skipped: usize,
    condition: Cond,
    taken_in_cache: bool,
    skipped_in_cache: bool,
) {
    // SAFETY: the caller's free-space guard covers IMM_SIZE_A32.
    let mut w = unsafe { CodeWriter::new(*write) };
    let taken_guest = thread.code_cache_meta[basic_block].branch_taken_addr;
    let skipped_guest = thread.code_cache_meta[basic_block].branch_skipped_addr;

    let mut slots = 0;
    if taken_in_cache {
        a32_cc_branch_cond(thread, &mut w, address_taken, taken_guest, condition);
        slots += 1;
        thread.code_cache_meta[basic_block].branch_cache_status |= 2;
    }
    if skipped_in_cache {
        a32_cc_branch_cond(
            thread,
            &mut w,
            address_skipped,
            skipped_guest,
            condition.invert(),
        );
        slots += 1;
        thread.code_cache_meta[basic_block].branch_cache_status |= 1;
    }
    for _ in slots..2 {
        a32::nop(&mut w);
    }

    branch_save_context(&mut w, thread.scratch_regs_addr(), Isa::A32);
    branch_jump(thread, &mut w, basic_block, 0, SETUP, Isa::A32);
    match (taken_in_cache, skipped_in_cache) {
        (false, false) => {
            // Over the skipped trampoline (12 bytes) to the taken one.
            a32::b(&mut w, condition, 8);
            branch_jump(
                thread,
                &mut w,
                basic_block,
                address_skipped,
                REPLACE_TARGET | INSERT_BRANCH,
                Isa::A32,
            );
            branch_jump(
                thread,
                &mut w,
                basic_block,
                address_taken,
                REPLACE_TARGET | INSERT_BRANCH,
                Isa::A32,
            );
        }
        (true, false) => {
            branch_jump(
                thread,
                &mut w,
                basic_block,
                address_skipped,
                REPLACE_TARGET | INSERT_BRANCH,
                Isa::A32,
            );
        }
        (false, true) => {
            branch_jump(
                thread,
                &mut w,
                basic_block,
                address_taken,
                REPLACE_TARGET | INSERT_BRANCH,
                Isa::A32,
            );
        }
        (true, true) => {}
    }
    *write = w.addr();
}

fn a32_cc_branch_cond(
    thread: &mut ThreadData,
    w: &mut CodeWriter,
    dest_cache: usize,
    target_guest: GuestAddr,
    cond: Cond,
) {
    let at = w.addr();
    let offset = dest_cache as i64 - (at as i64 + 8);
    if !(-(1 << 25)..1 << 25).contains(&offset) {
        fatal_translation(target_guest, "branch out of range");
    }
    a32::b(w, cond, offset as i32);
    thread.record_cc_link(at, false, target_guest, Isa::A32);
    thread.stats.links_patched += 1;
}

/// Dispatcher-side patch of an A32 conditional exit. Returns the
/// patched range.
pub fn patch_cond_imm_a32(
    thread: &mut ThreadData,
    source_index: usize,
    block_address: usize,
    is_taken: bool,
    other_cached: Option<usize>,
) -> (usize, usize) {
    let meta = &thread.code_cache_meta[source_index];
    let exit = meta.exit_branch_addr;
    let cond = meta.branch_condition;
    let status = meta.branch_cache_status;
    let (this_bit, other_bit) = if is_taken { (2u8, 1u8) } else { (1u8, 2u8) };
    let (this_guest, other_guest) = if is_taken {
        (meta.branch_taken_addr, meta.branch_skipped_addr)
    } else {
        (meta.branch_skipped_addr, meta.branch_taken_addr)
    };

    if status & this_bit != 0 {
        return (exit, exit);
    }
    let mut at = exit;
    if status & other_bit != 0 {
        at += 4;
    }
    let branch_cond = if is_taken { cond } else { cond.invert() };
    // SAFETY: rewriting the reserved exit words.
    let mut w = unsafe { CodeWriter::new(at) };
    a32_cc_branch_cond(thread, &mut w, block_address, this_guest, branch_cond);
    thread.code_cache_meta[source_index].branch_cache_status |= this_bit;

    let mut end = at + 4;
    if thread.code_cache_meta[source_index].branch_cache_status & other_bit == 0 {
        if let Some(other_addr) = other_cached {
            let mut w = unsafe { CodeWriter::new(end) };
            a32_cc_branch_cond(thread, &mut w, other_addr, other_guest, Cond::Al);
            thread.code_cache_meta[source_index].branch_cache_status |= other_bit;
            end += 4;
        }
    }
    (exit, end)
}

// ---------------------------------------------------------------
// A64 conditional exits
// ---------------------------------------------------------------

/// Head shape of an A64 conditional exit, packed into the fragment's
/// `rn` metadata field for CBZ/TBZ forms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum A64CondKind {
    BCond(Cond),
    Cbz { rt: u8, sf: bool },
    Tbz { rt: u8, bit: u8 },
}

pub fn pack_a64_cond(kind: A64CondKind) -> u32 {
    match kind {
        A64CondKind::BCond(_) => 0,
        A64CondKind::Cbz { rt, sf } => 0x8000_0000 | ((sf as u32) << 5) | rt as u32,
        A64CondKind::Tbz { rt, bit } => {
            0xC000_0000 | ((bit as u32) << 8) | rt as u32
        }
    }
}

pub fn unpack_a64_cond(rn: u32, cond: Cond) -> A64CondKind {
    if rn & 0xC000_0000 == 0xC000_0000 {
        A64CondKind::Tbz {
            rt: (rn & 0x1F) as u8,
            bit: ((rn >> 8) & 0x3F) as u8,
        }
    } else if rn & 0x8000_0000 != 0 {
        A64CondKind::Cbz {
            rt: (rn & 0x1F) as u8,
            sf: rn & 0x20 != 0,
        }
    } else {
        A64CondKind::BCond(cond)
    }
}

/// Emit the head jump of an A64 conditional exit: branch `offset`
/// bytes ahead when the *taken* (zero / bit-clear / condition-true)
/// path is chosen, or the inverse when `inverted`.
fn a64_cond_head(w: &mut CodeWriter, kind: A64CondKind, inverted: bool, offset: i32) {
    match kind {
        A64CondKind::BCond(cond) => {
            let c = if inverted { cond.invert() } else { cond };
            a64::b_cond(w, c, offset);
        }
        A64CondKind::Cbz { rt, sf } => a64::cbz(w, sf, inverted, rt, offset),
        A64CondKind::Tbz { rt, bit } => a64::tbz(w, inverted, rt, bit, offset),
    }
}

/// Scan-time encoding of an A64 conditional exit: three reserved
/// words (head + two linked branches), context save, source-index
/// setup, head jump and the two dispatcher trampolines.
pub fn encode_cond_a64(
    thread: &mut ThreadData,
    write: &mut usize,
    basic_block: usize,
    kind: A64CondKind,
    address_taken: GuestAddr,
    address_skipped: GuestAddr,
) {
    // SAFETY: the caller's free-space guard covers IMM_SIZE_A64.
    let mut w = unsafe { CodeWriter::new(*write) };
    a64::nop(&mut w);
    a64::nop(&mut w);
    a64::nop(&mut w);
    branch_save_context(&mut w, thread.scratch_regs_addr(), Isa::A64);
    branch_jump(thread, &mut w, basic_block, 0, SETUP, Isa::A64);
    // Over the skipped trampoline (20 bytes) to the taken one.
    a64_cond_head(&mut w, kind, false, 24);
    branch_jump(
        thread,
        &mut w,
        basic_block,
        address_skipped,
        REPLACE_TARGET | INSERT_BRANCH,
        Isa::A64,
    );
    branch_jump(
        thread,
        &mut w,
        basic_block,
        address_taken,
        REPLACE_TARGET | INSERT_BRANCH,
        Isa::A64,
    );
    *write = w.addr();
}

/// Dispatcher-side patch of an A64 conditional exit. The first linked
/// arm takes the far word and the head; the second takes the middle
/// word. Returns the patched range.
pub fn patch_cond_a64(
    thread: &mut ThreadData,
    source_index: usize,
    block_address: usize,
    is_taken: bool,
) -> (usize, usize) {
    let meta = &thread.code_cache_meta[source_index];
    let exit = meta.exit_branch_addr;
    let kind = unpack_a64_cond(meta.rn, meta.branch_condition);
    let status = meta.branch_cache_status;
    let this_bit = if is_taken { 2u8 } else { 1u8 };
    let this_guest = if is_taken {
        meta.branch_taken_addr
    } else {
        meta.branch_skipped_addr
    };

    if status & this_bit != 0 {
        return (exit, exit);
    }
    if status == 0 {
        // First link: far branch plus the head jumping over the
        // middle word.
        let mut w = unsafe { CodeWriter::new(exit + 8) };
        cc_branch(thread, &mut w, block_address, this_guest, Isa::A64);
        let mut w = unsafe { CodeWriter::new(exit) };
        a64_cond_head(&mut w, kind, !is_taken, 8);
    } else {
        let mut w = unsafe { CodeWriter::new(exit + 4) };
        cc_branch(thread, &mut w, block_address, this_guest, Isa::A64);
    }
    thread.code_cache_meta[source_index].branch_cache_status |= this_bit;
    (exit, exit + 12)
}

// ---------------------------------------------------------------
// Inline hash lookup
// ---------------------------------------------------------------

/// Emit the T32 inline hash lookup for an indirect branch whose
/// target is in `rm`. On a hit the sequence branches straight to the
/// cached fragment; on a miss it falls through to the dispatcher with
/// the target in r0. `link_ret` is the guest return address to load
/// into LR for indirect calls.
pub fn inline_hash_lookup_t32(
    thread: &mut ThreadData,
    cursors: &mut ScanCursors,
    basic_block: usize,
    rm: u8,
    link_ret: Option<GuestAddr>,
    force_thumb: bool,
) {
    let table = thread.entry_address.slots_ptr();
    let mask = thread.entry_address.mask();
    let scratch = thread.scratch_regs_addr();
    let dispatcher = thread.dispatcher_addr;
    let lit = cursors.alloc_data(4);
    let half = usize::BITS as u8 / 2;

    cursors.emit(|w| {
        // Working set: r4 = key, r5 = probe pointer, r6 = scratch.
        t32::push16(w, (1 << 4) | (1 << 5) | (1 << 6));
        t32::mov_hi(w, 4, rm);
        if force_thumb {
            // MOV PC stays in T32 whatever bit 0 holds.
            t32::orr_imm8(w, 4, 4, 1);
        }
        if let Some(ret) = link_ret {
            t32::copy_to_reg(w, LR, ret as u32);
        }
        t32::eor_reg_lsr(w, 6, 4, 4, half);
        t32::movw(w, 5, mask as u16);
        t32::and_reg(w, 6, 6, 5);
        t32::copy_to_reg(w, 5, table as u32);
        t32::add_reg(w, 5, 5, 6, 3); // slot pairs are 8 bytes

        // probe loop
        t32::ldr_imm8(w, 6, 5, 8, false, true); // key, post-increment
        t32::cmp_reg(w, 6, 4);
        t32::b_cond16(w, Cond::Eq, 32); // -> hit
        t32::cmp_imm_w(w, 6, 0);
        t32::b_cond16(w, Cond::Ne, -14); // -> probe loop

        // miss: spill the context, argue, dispatch
        t32::copy_to_reg(w, 6, scratch as u32);
        t32::stmia(w, 6, (1 << R0) | (1 << R1) | (1 << R2), false);
        t32::mov_hi(w, R0, 4);
        t32::copy_to_reg(w, R1, basic_block as u32);
        t32::pop16(w, (1 << 4) | (1 << 5) | (1 << 6));
        t32_b32_abs(w, dispatcher);

        // hit: stash the cache address and branch through the literal
        t32::ldr_imm8(w, 6, 5, -4, true, false);
        t32::copy_to_reg(w, 5, lit as u32);
        t32::str_imm12(w, 6, 5, 0);
        t32::pop16(w, (1 << 4) | (1 << 5) | (1 << 6));
        let off = lit as i64 - ((w.addr() as i64 + 4) & !3);
        t32::ldr_lit(w, PC, off as i32);
    });
}

/// Emit the A64 inline hash lookup. x16/x17 are the veneer-scratch
/// registers and may be clobbered across an indirect branch; x0/x1
/// are spilled in the dispatcher frame format.
pub fn inline_hash_lookup_a64(
    thread: &mut ThreadData,
    cursors: &mut ScanCursors,
    basic_block: usize,
    rn: u8,
    link_ret: Option<GuestAddr>,
) {
    let table = thread.entry_address.slots_ptr();
    let mask_ones = (thread.entry_address.mask().count_ones()) as u8;
    let dispatcher = thread.dispatcher_addr;

    cursors.emit(|w| {
        a64::stp_pre(w, 0, 1, 31, -16);
        a64::mov_reg(w, true, 16, rn);
        if let Some(ret) = link_ret {
            a64::copy_to_reg(w, X30, ret as u64);
        }
        a64::eor_lsr(w, 17, 16, 16, 32);
        a64::and_pow2_mask(w, 17, 17, mask_ones);
        a64::copy_to_reg(w, 0, table as u64);
        a64::add_reg(w, true, 0, 0, 17, 4); // slot pairs are 16 bytes

        // probe loop
        a64::ldr_post(w, 17, 0, 16);
        a64::cmp_reg(w, true, 17, 16);
        a64::b_cond(w, Cond::Eq, 32); // -> hit
        a64::cbz(w, true, true, 17, -12); // CBNZ back to the probe

        // miss
        a64::mov_reg(w, true, 0, 16);
        a64::copy_to_reg(w, 1, basic_block as u64);
        a64_b_abs(w, dispatcher);

        // hit
        a64::ldur(w, 17, 0, -8);
        a64::ldp_post(w, 0, 1, 31, 16);
        a64::br(w, 17);
    });
}

// ---------------------------------------------------------------
// Table-branch pair table
// ---------------------------------------------------------------

/// Unlinked key sentinel in a table-branch pair table.
pub const TB_KEY_EMPTY: u32 = u32::MAX;

/// Address of pair `i` in a table-branch jump table rooted at
/// `table` (the fragment's `exit_branch_addr`).
pub fn tb_pair_addr(table: usize, i: usize) -> usize {
    table + i * 8
}

pub fn tb_read_key(table: usize, i: usize) -> u32 {
    // SAFETY: inside the fragment's literal area.
    unsafe { (tb_pair_addr(table, i) as *const u32).read_unaligned() }
}

pub fn tb_write_pair(table: usize, i: usize, key: u32, value: u32) {
    // SAFETY: inside the fragment's literal area.
    unsafe {
        (tb_pair_addr(table, i) as *mut u32).write_unaligned(key);
        ((tb_pair_addr(table, i) + 4) as *mut u32).write_unaligned(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbm_core::code_cache::CodeCache;
    use dbm_core::thread::Arch;

    fn thread32() -> ThreadData {
        let cache = CodeCache::with_slots(16).unwrap();
        ThreadData::with_cache(Arch::Aarch32, 0, cache).unwrap()
    }

    #[test]
    fn cursors_allocate_literals_downward() {
        let mut td = thread32();
        let bb = td.allocate_bb().unwrap();
        let mut c = ScanCursors::for_slot(&td, bb);
        let end = td.code_cache.slot_end(bb);
        assert_eq!(c.alloc_data(4), end - 4);
        assert_eq!(c.alloc_data(8), end - 12);
    }

    #[test]
    fn free_space_spans_into_adjacent_slot() {
        let mut td = thread32();
        let bb = td.allocate_bb().unwrap();
        let mut c = ScanCursors::for_slot(&td, bb);
        // Fill most of the slot.
        c.write += dbm_core::BASIC_BLOCK_BYTES - 8;
        check_free_space(&mut td, &mut c, None, Isa::T32, 64).unwrap();
        // The adjacent slot was claimed and the fragment extended in
        // place: no seam branch, data cursor at the new slot's end.
        assert_eq!(td.free_block, 2);
        assert_eq!(c.data, td.code_cache.slot_end(1));
        assert_eq!(c.write, td.code_cache.slot_addr(1) - 8);
    }

    #[test]
    fn free_space_branches_over_literals() {
        let mut td = thread32();
        let bb = td.allocate_bb().unwrap();
        let mut c = ScanCursors::for_slot(&td, bb);
        c.alloc_data(4); // literal blocks in-place extension
        c.write += dbm_core::BASIC_BLOCK_BYTES - 16;
        let old_write = c.write;
        check_free_space(&mut td, &mut c, None, Isa::T32, 64).unwrap();
        assert_eq!(c.write, td.code_cache.slot_addr(1));
        assert_eq!(c.data, td.code_cache.slot_end(1));
        // A seam branch was emitted at the old cursor.
        let hw1 = td.code_cache.read_u16(old_write);
        assert_eq!(hw1 & 0xF800, 0xF000);
    }

    #[test]
    fn free_space_exhaustion_reports_pressure() {
        let cache = CodeCache::with_slots(1).unwrap();
        let mut td = ThreadData::with_cache(Arch::Aarch32, 0, cache).unwrap();
        let bb = td.allocate_bb().unwrap();
        let mut c = ScanCursors::for_slot(&td, bb);
        c.write += dbm_core::BASIC_BLOCK_BYTES - 8;
        assert_eq!(
            check_free_space(&mut td, &mut c, None, Isa::T32, 64),
            Err(CachePressure::CacheFull)
        );
    }

    #[test]
    fn tb_pair_table_io() {
        let mut buf = [0u8; 8 * 4];
        let table = buf.as_mut_ptr() as usize;
        tb_write_pair(table, 0, 3, 0x1000);
        tb_write_pair(table, 2, 7, 0x2000);
        assert_eq!(tb_read_key(table, 0), 3);
        assert_eq!(tb_read_key(table, 2), 7);
        assert_eq!(tb_read_key(table, 1), 0);
        let _ = buf;
    }
}
