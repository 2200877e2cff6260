//! A32 basic-block scanner.
//!
//! Simpler than the T32 scanner: no IT blocks and fixed-width
//! instructions, but every instruction carries a condition, so a
//! conditional block-ending instruction becomes a two-arm exit with
//! the not-taken arm resolved through a stub.

use dbm_api::context::LdStOperands;
use dbm_api::{inst_class, installed_plugins, CbEvent};
use dbm_codec::a32::{self, A32Inst};
use dbm_codec::CodeWriter;
use dbm_core::fragment::{BranchType, Cond, Isa};
use dbm_core::regs::{LR, R0, R1, R2, SP};
use dbm_core::{fatal_translation, CachePressure, GuestAddr, ThreadData, THUMB_FLAG};

use crate::common::{
    a32_bl_abs, branch_jump, branch_save_context, cc_branch, check_free_space,
    encode_cond_imm_a32, ScanCursors, DISP_CALL_SIZE_A32, IMM_SIZE_A32,
    INSERT_BRANCH, REPLACE_TARGET, SETUP,
};
use crate::{callbacks, lookup_or_stub};

fn classify(inst: &A32Inst) -> (u32, Option<LdStOperands>) {
    use inst_class::*;
    match *inst {
        A32Inst::BranchImm { cond, link, .. } => {
            let mut c = BRANCH_DIRECT;
            if link {
                c |= BRANCH_CALL;
            }
            if cond != Cond::Al {
                c |= BRANCH_COND;
            }
            (c, None)
        }
        A32Inst::BlxImm { .. } => (BRANCH_DIRECT | BRANCH_CALL, None),
        A32Inst::BxReg { rm, link, .. } => {
            let mut c = BRANCH_INDIRECT;
            if link {
                c |= BRANCH_CALL;
            } else if rm == LR {
                c |= BRANCH_RETURN;
            }
            (c, None)
        }
        A32Inst::MovPcReg { rm, .. } => {
            let mut c = BRANCH_INDIRECT;
            if rm == LR {
                c |= BRANCH_RETURN;
            }
            (c, None)
        }
        A32Inst::AddPcReg { .. } => (BRANCH_INDIRECT, None),
        A32Inst::LdmPc { rn, .. } => {
            if rn == SP {
                (BRANCH_INDIRECT | BRANCH_RETURN, None)
            } else {
                (BRANCH_INDIRECT, None)
            }
        }
        A32Inst::LdrLitPc { imm, .. } => (
            BRANCH_INDIRECT | LOAD_STORE,
            Some(LdStOperands {
                rn: 15,
                imm: imm - 8,
                reg_offset: None,
            }),
        ),
        A32Inst::LdrPcImm { rn, imm, index, .. } => (
            BRANCH_INDIRECT | LOAD_STORE,
            Some(LdStOperands {
                rn,
                imm: if index { imm } else { 0 },
                reg_offset: None,
            }),
        ),
        A32Inst::LdrLit { imm, .. } => (
            LOAD_STORE,
            Some(LdStOperands {
                rn: 15,
                imm: imm - 8,
                reg_offset: None,
            }),
        ),
        A32Inst::Svc { .. } => (SYSCALL, None),
        A32Inst::Other(w) => classify_other(w),
        _ => (0, None),
    }
}

fn classify_other(w: u32) -> (u32, Option<LdStOperands>) {
    if (w >> 25) & 7 == 0b010 {
        let rn = ((w >> 16) & 0xF) as u8;
        let up = w & 0x0080_0000 != 0;
        let index = w & 0x0100_0000 != 0;
        let imm = (w & 0xFFF) as i32;
        return (
            inst_class::LOAD_STORE,
            Some(LdStOperands {
                rn,
                imm: if index {
                    if up {
                        imm
                    } else {
                        -imm
                    }
                } else {
                    0
                },
                reg_offset: None,
            }),
        );
    }
    if (w >> 25) & 7 == 0b011 && w & 0x10 == 0 {
        let rn = ((w >> 16) & 0xF) as u8;
        let rm = (w & 0xF) as u8;
        let shift = ((w >> 7) & 0x1F) as u8;
        let lsl = if (w >> 5) & 3 == 0 { shift } else { 0 };
        return (
            inst_class::LOAD_STORE,
            Some(LdStOperands {
                rn,
                imm: 0,
                reg_offset: Some((rm, lsl)),
            }),
        );
    }
    (0, None)
}

/// For a conditional block-ending instruction, branch to a stub for
/// the fall-through address when the condition does not hold. Returns
/// the condition to apply to the exit itself (`Al` afterwards, the
/// guard handles the polarity).
fn cond_exit_guard(
    thread: &mut ThreadData,
    cursors: &mut ScanCursors,
    cond: Cond,
    fallthrough: GuestAddr,
) -> Result<(), CachePressure> {
    if cond == Cond::Al {
        return Ok(());
    }
    check_free_space(thread, cursors, None, Isa::A32, 12)?;
    let dest = lookup_or_stub(thread, fallthrough)?;
    // SAFETY: covered by the free-space check above.
    let mut w = unsafe { CodeWriter::new(cursors.write) };
    let at = w.addr();
    let offset = dest as i64 - (at as i64 + 8);
    a32::b(&mut w, cond.invert(), offset as i32);
    thread.record_cc_link(at, false, fallthrough, Isa::A32);
    cursors.write = w.addr();
    Ok(())
}

/// Translate one A32 basic block starting at `start` into fragment
/// `basic_block`. Returns the cache entry address.
pub fn scan_a32(
    thread: &mut ThreadData,
    start: GuestAddr,
    basic_block: usize,
) -> Result<usize, CachePressure> {
    let plugins = installed_plugins();
    let mut cursors = ScanCursors::for_slot(thread, basic_block);
    let entry = cursors.write;
    thread.code_cache_meta[basic_block].isa = Isa::A32;

    let mut read = start;
    let mut stop = false;

    while !stop {
        // SAFETY: guest code pages are kept readable by the syscall
        // interposer.
        let inst = unsafe { a32::decode(read) };
        let (class, ld_st) = classify(&inst);

        let replaced = callbacks::deliver_inst_cbs(
            thread,
            plugins,
            CbEvent::PreInst,
            &mut cursors,
            None,
            Isa::A32,
            basic_block,
            read,
            class,
            ld_st,
        )?;

        let mut next_read = read + 4;

        if replaced {
            if class & (inst_class::BRANCH_DIRECT | inst_class::BRANCH_INDIRECT) != 0
            {
                check_free_space(
                    thread,
                    &mut cursors,
                    None,
                    Isa::A32,
                    DISP_CALL_SIZE_A32,
                )?;
                let meta = &mut thread.code_cache_meta[basic_block];
                meta.exit_branch_type = BranchType::UncondImm;
                meta.exit_branch_addr = cursors.write;
                // SAFETY: covered by the free-space check above.
                let mut w = unsafe { CodeWriter::new(cursors.write) };
                branch_save_context(&mut w, thread.scratch_regs_addr(), Isa::A32);
                branch_jump(
                    thread,
                    &mut w,
                    basic_block,
                    next_read,
                    SETUP | REPLACE_TARGET | INSERT_BRANCH,
                    Isa::A32,
                );
                cursors.write = w.addr();
                stop = true;
            }
        } else {
            scan_one(
                thread,
                &mut cursors,
                basic_block,
                inst,
                start,
                read,
                &mut next_read,
                &mut stop,
            )?;
        }

        callbacks::deliver_inst_cbs(
            thread,
            plugins,
            CbEvent::PostInst,
            &mut cursors,
            None,
            Isa::A32,
            basic_block,
            read,
            class,
            ld_st,
        )?;

        read = next_read;
    }

    let scanned_end = thread.code_cache.slot_end(thread.free_block - 1);
    dbm_core::icache::flush_icache_range(entry, scanned_end);
    Ok(entry)
}

#[allow(clippy::too_many_arguments)]
fn scan_one(
    thread: &mut ThreadData,
    cursors: &mut ScanCursors,
    basic_block: usize,
    inst: A32Inst,
    start: GuestAddr,
    read: GuestAddr,
    next_read: &mut GuestAddr,
    stop: &mut bool,
) -> Result<(), CachePressure> {
    let scratch = thread.scratch_regs_addr();
    match inst {
        A32Inst::Other(word) => {
            check_free_space(thread, cursors, None, Isa::A32, 8)?;
            cursors.emit(|w| w.write32(word));
        }

        // -- PC-relative data accesses -------------------------------
        A32Inst::LdrLit { cond, rt, imm, byte } => {
            check_free_space(thread, cursors, None, Isa::A32, 16)?;
            let lit = (read as i64 + imm as i64) as usize;
            cursors.emit(|w| {
                a32::copy_to_reg(w, cond, rt, lit as u32);
                if byte {
                    a32::ldrb_imm(w, cond, rt, rt, 0);
                } else {
                    a32::ldr_imm(w, cond, rt, rt, 0, true, false);
                }
            });
        }
        A32Inst::Adr { cond, rd, imm } => {
            check_free_space(thread, cursors, None, Isa::A32, 12)?;
            let value = (read as i64 + imm as i64) as usize;
            cursors.emit(|w| a32::copy_to_reg(w, cond, rd, value as u32));
        }
        A32Inst::MovRegPc { cond, rd } => {
            check_free_space(thread, cursors, None, Isa::A32, 12)?;
            let value = read + 8;
            cursors.emit(|w| a32::copy_to_reg(w, cond, rd, value as u32));
        }

        // -- Direct branches -----------------------------------------
        A32Inst::BranchImm { cond, link, offset } => {
            let target = (read as i64 + offset as i64) as usize;
            if link {
                check_free_space(thread, cursors, None, Isa::A32, 12)?;
                let ret = read + 4;
                cursors.emit(|w| a32::copy_to_reg(w, cond, LR, ret as u32));
            }
            if cond == Cond::Al {
                uncond_imm_exit(thread, cursors, basic_block, target)?;
            } else {
                cond_imm_exit(
                    thread,
                    cursors,
                    basic_block,
                    target,
                    read + 4,
                    cond,
                )?;
            }
            *stop = true;
        }
        A32Inst::BlxImm { offset } => {
            check_free_space(
                thread,
                cursors,
                None,
                Isa::A32,
                DISP_CALL_SIZE_A32 + 12,
            )?;
            let target = ((read as i64 + offset as i64) as usize) | THUMB_FLAG;
            let ret = read + 4;
            cursors.emit(|w| a32::copy_to_reg(w, Cond::Al, LR, ret as u32));
            let meta = &mut thread.code_cache_meta[basic_block];
            meta.exit_branch_type = BranchType::UncondBlxi;
            meta.exit_branch_addr = cursors.write;
            // SAFETY: covered by the free-space check above.
            let mut w = unsafe { CodeWriter::new(cursors.write) };
            branch_save_context(&mut w, scratch, Isa::A32);
            branch_jump(
                thread,
                &mut w,
                basic_block,
                target,
                SETUP | REPLACE_TARGET | INSERT_BRANCH,
                Isa::A32,
            );
            cursors.write = w.addr();
            *stop = true;
        }

        // -- Indirect branches ---------------------------------------
        A32Inst::BxReg { cond, rm, link } => {
            if rm == 15 && !link {
                // BX PC: a direct branch to the next word, still A32.
                let target = read + 8;
                check_free_space(thread, cursors, None, Isa::A32, 16)?;
                cond_exit_guard(thread, cursors, cond, read + 4)?;
                let dest = lookup_or_stub(thread, target)?;
                // SAFETY: covered by the free-space check above.
                let mut w = unsafe { CodeWriter::new(cursors.write) };
                cc_branch(thread, &mut w, dest, target, Isa::A32);
                cursors.write = w.addr();
                thread.code_cache_meta[basic_block].exit_branch_type =
                    BranchType::TraceInlineMax;
                *stop = true;
                return Ok(());
            }
            check_free_space(
                thread,
                cursors,
                None,
                Isa::A32,
                DISP_CALL_SIZE_A32 + 24,
            )?;
            cond_exit_guard(thread, cursors, cond, read + 4)?;
            if link {
                let ret = read + 4;
                cursors.emit(|w| a32::copy_to_reg(w, Cond::Al, LR, ret as u32));
            }
            indirect_exit(thread, cursors, basic_block, |w| {
                a32::mov_reg(w, Cond::Al, R0, rm);
            })?;
            *stop = true;
        }
        A32Inst::MovPcReg { cond, rm } => {
            check_free_space(
                thread,
                cursors,
                None,
                Isa::A32,
                DISP_CALL_SIZE_A32 + 16,
            )?;
            cond_exit_guard(thread, cursors, cond, read + 4)?;
            indirect_exit(thread, cursors, basic_block, |w| {
                a32::mov_reg(w, Cond::Al, R0, rm);
            })?;
            *stop = true;
        }
        A32Inst::AddPcReg { cond, rn, rm } => {
            check_free_space(
                thread,
                cursors,
                None,
                Isa::A32,
                DISP_CALL_SIZE_A32 + 24,
            )?;
            cond_exit_guard(thread, cursors, cond, read + 4)?;
            if rn != 15 {
                fatal_translation(read, "ADD PC with a non-PC base");
            }
            let pc_val = (read + 8) as u32;
            indirect_exit(thread, cursors, basic_block, |w| {
                a32::mov_reg(w, Cond::Al, R1, rm);
                a32::copy_to_reg(w, Cond::Al, R0, pc_val);
                a32::add_reg(w, Cond::Al, R0, R0, R1);
            })?;
            *stop = true;
        }
        A32Inst::LdrLitPc { cond, imm } => {
            check_free_space(
                thread,
                cursors,
                None,
                Isa::A32,
                DISP_CALL_SIZE_A32 + 20,
            )?;
            cond_exit_guard(thread, cursors, cond, read + 4)?;
            let lit = (read as i64 + imm as i64) as usize;
            indirect_exit(thread, cursors, basic_block, |w| {
                a32::copy_to_reg(w, Cond::Al, R0, lit as u32);
                a32::ldr_imm(w, Cond::Al, R0, R0, 0, true, false);
            })?;
            *stop = true;
        }
        A32Inst::LdrPcImm {
            cond,
            rn,
            imm,
            index,
            wback,
        } => {
            check_free_space(
                thread,
                cursors,
                None,
                Isa::A32,
                DISP_CALL_SIZE_A32 + 24,
            )?;
            cond_exit_guard(thread, cursors, cond, read + 4)?;
            if wback && (rn <= R2 || imm.unsigned_abs() > 255) {
                fatal_translation(read, "unsupported LDR PC writeback shape");
            }
            indirect_exit(thread, cursors, basic_block, |w| {
                let load_off = if index { imm } else { 0 };
                a32::ldr_imm(w, Cond::Al, R0, rn, load_off, true, false);
                if wback {
                    if imm >= 0 {
                        a32::add_imm(w, Cond::Al, rn, rn, imm as u8);
                    } else {
                        a32::sub_imm(w, Cond::Al, rn, rn, imm.unsigned_abs() as u8);
                    }
                }
            })?;
            *stop = true;
        }
        A32Inst::LdmPc {
            cond,
            rn,
            reglist,
            wback,
            inc,
            before,
        } => {
            if !inc || before {
                fatal_translation(read, "decrementing LDM with PC in the list");
            }
            check_free_space(
                thread,
                cursors,
                None,
                Isa::A32,
                DISP_CALL_SIZE_A32 + 28,
            )?;
            cond_exit_guard(thread, cursors, cond, read + 4)?;
            let lo = reglist & 0x7FFF;
            let pc_slot = 4 * lo.count_ones() as i32;
            if wback && (rn <= R2 || lo & (1 << rn) != 0) {
                fatal_translation(read, "LDM writeback base clashes with the loaded set");
            }
            if rn == SP && wback {
                if lo != 0 {
                    cursors.emit(|w| a32::pop(w, Cond::Al, lo));
                }
                indirect_exit(thread, cursors, basic_block, |w| {
                    a32::ldr_imm(w, Cond::Al, R0, SP, 4, false, true);
                })?;
            } else {
                if lo != 0 {
                    cursors.emit(|w| a32::ldmia(w, Cond::Al, rn, lo, false));
                }
                indirect_exit(thread, cursors, basic_block, |w| {
                    a32::ldr_imm(w, Cond::Al, R0, rn, pc_slot, true, false);
                    if wback {
                        a32::add_imm(w, Cond::Al, rn, rn, (pc_slot + 4) as u8);
                    }
                })?;
            }
            *stop = true;
        }

        // -- System calls --------------------------------------------
        A32Inst::Svc { cond, .. } => {
            check_free_space(thread, cursors, None, Isa::A32, 28)?;
            if cond != Cond::Al {
                // Over the wrapper call when the condition fails.
                cursors.emit(|w| a32::b(w, cond.invert(), 16));
            }
            let ret = read + 4;
            let wrapper = thread.syscall_wrapper_addr;
            cursors.emit(|w| {
                // Spare word for the wrapper's return slot.
                a32::sub_imm(w, Cond::Al, SP, SP, 4);
                a32::push(w, Cond::Al, 0x5FFF);
                a32::copy_to_reg(w, Cond::Al, 8, ret as u32);
                a32_bl_abs(w, Cond::Al, wrapper);
            });
        }

        A32Inst::Invalid => {
            if read == start {
                fatal_translation(read, "undecodable instruction at block start");
            }
            check_free_space(thread, cursors, None, Isa::A32, DISP_CALL_SIZE_A32)?;
            let meta = &mut thread.code_cache_meta[basic_block];
            meta.exit_branch_type = BranchType::UncondImm;
            meta.exit_branch_addr = cursors.write;
            // SAFETY: covered by the free-space check above.
            let mut w = unsafe { CodeWriter::new(cursors.write) };
            branch_save_context(&mut w, scratch, Isa::A32);
            branch_jump(
                thread,
                &mut w,
                basic_block,
                read,
                SETUP | REPLACE_TARGET | INSERT_BRANCH,
                Isa::A32,
            );
            cursors.write = w.addr();
            *stop = true;
        }
    }
    Ok(())
}

fn uncond_imm_exit(
    thread: &mut ThreadData,
    cursors: &mut ScanCursors,
    basic_block: usize,
    target: GuestAddr,
) -> Result<(), CachePressure> {
    check_free_space(thread, cursors, None, Isa::A32, DISP_CALL_SIZE_A32)?;
    let meta = &mut thread.code_cache_meta[basic_block];
    meta.exit_branch_type = BranchType::UncondImm;
    meta.exit_branch_addr = cursors.write;
    let cached = thread.entry_address.lookup(target);
    // SAFETY: covered by the free-space check above.
    let mut w = unsafe { CodeWriter::new(cursors.write) };
    match cached {
        Some(dest) if target & 1 == 0 => {
            cc_branch(thread, &mut w, dest, target, Isa::A32);
        }
        _ => {
            branch_save_context(&mut w, thread.scratch_regs_addr(), Isa::A32);
            branch_jump(
                thread,
                &mut w,
                basic_block,
                target,
                SETUP | REPLACE_TARGET | INSERT_BRANCH,
                Isa::A32,
            );
        }
    }
    cursors.write = w.addr();
    Ok(())
}

fn cond_imm_exit(
    thread: &mut ThreadData,
    cursors: &mut ScanCursors,
    basic_block: usize,
    taken: GuestAddr,
    skipped: GuestAddr,
    cond: Cond,
) -> Result<(), CachePressure> {
    check_free_space(thread, cursors, None, Isa::A32, IMM_SIZE_A32)?;
    let meta = &mut thread.code_cache_meta[basic_block];
    meta.exit_branch_type = BranchType::CondImm;
    meta.exit_branch_addr = cursors.write;
    meta.branch_taken_addr = taken;
    meta.branch_skipped_addr = skipped;
    meta.branch_condition = cond;
    let taken_cached = thread.entry_address.lookup(taken);
    let skipped_cached = thread.entry_address.lookup(skipped);
    let mut write = cursors.write;
    encode_cond_imm_a32(
        thread,
        &mut write,
        basic_block,
        taken_cached.unwrap_or(taken),
        skipped_cached.unwrap_or(skipped),
        cond,
        taken_cached.is_some(),
        skipped_cached.is_some(),
    );
    cursors.write = write;
    Ok(())
}

fn indirect_exit(
    thread: &mut ThreadData,
    cursors: &mut ScanCursors,
    basic_block: usize,
    load_target: impl FnOnce(&mut CodeWriter),
) -> Result<(), CachePressure> {
    let meta = &mut thread.code_cache_meta[basic_block];
    if meta.exit_branch_type == BranchType::Unknown {
        meta.exit_branch_type = BranchType::UncondReg;
        meta.exit_branch_addr = cursors.write;
    }
    // SAFETY: the caller checked free space for the stub.
    let mut w = unsafe { CodeWriter::new(cursors.write) };
    branch_save_context(&mut w, thread.scratch_regs_addr(), Isa::A32);
    load_target(&mut w);
    branch_jump(
        thread,
        &mut w,
        basic_block,
        0,
        SETUP | INSERT_BRANCH,
        Isa::A32,
    );
    cursors.write = w.addr();
    Ok(())
}
