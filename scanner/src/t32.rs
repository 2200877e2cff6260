//! T32 basic-block scanner.
//!
//! Decodes guest instructions one at a time and emits the translated
//! fragment: verbatim copies for PC-free instructions, materialised
//! guest-PC sequences for PC-relative ones, and dispatcher exits for
//! control flow. IT blocks are tracked as a state machine and split
//! whenever translated code has to be inserted mid-run.

use dbm_api::context::LdStOperands;
use dbm_api::{inst_class, installed_plugins, CbEvent};
use dbm_codec::t32::{self, LoadOp, T32Inst};
use dbm_codec::CodeWriter;
use dbm_core::fragment::{BranchType, Cond, Isa};
use dbm_core::regs::{LR, R0, R1, R2, SP};
use dbm_core::{fatal_translation, CachePressure, GuestAddr, ThreadData, THUMB_FLAG};

use crate::common::{
    branch_jump, branch_save_context, cc_branch, check_free_space,
    encode_cbz_t32, encode_cond_imm_t32, inline_hash_lookup_t32, t32_blx32_abs,
    tb_write_pair, ScanCursors, CBZ_SIZE_T32, DISP_CALL_SIZE_T32, IHL_SIZE_T32,
    IMM_SIZE_T32, INSERT_BRANCH, MAX_BACK_INLINE, REPLACE_TARGET, SETUP,
    TB_KEY_EMPTY, TB_SIZE_T32,
};
use crate::it_state::ItState;
use crate::{callbacks, lookup_or_stub};

/// T32 IT mask for `n` all-then instructions under `cond`.
fn it_mask_then(cond: Cond, n: usize) -> u8 {
    let c = cond as u8 & 1;
    match n {
        1 => 0x8,
        2 => (c << 3) | 0x4,
        3 => (c << 3) | (c << 2) | 0x2,
        4 => (c << 3) | (c << 2) | (c << 1) | 0x1,
        _ => unreachable!("IT covers at most four instructions"),
    }
}

/// Split an in-flight IT block around a translated replacement
/// sequence. `f` receives the condition the replaced instruction runs
/// under (`Al` outside an IT block) and is responsible for wrapping
/// the condition-sensitive part in its own IT via `it_mask_then`. The
/// replaced instruction's condition slot is consumed.
fn with_it_split(
    cursors: &mut ScanCursors,
    it: &mut ItState,
    f: impl FnOnce(&mut ScanCursors, Cond),
) {
    if !it.active() {
        f(cursors, Cond::Al);
        return;
    }
    let cond = it.cur_cond();
    it.create_gap(&mut cursors.write);
    f(cursors, cond);
    // The replacement sequence consumed this instruction's condition
    // slot; the scan loop's advance must not consume another.
    it.advance();
    it.skip_next_advance = true;
    if it.active() {
        it.close_gap(&mut cursors.write);
    }
}

/// Conditional-exit prologue for a block-ending instruction inside an
/// IT block: branch over the exit sequence to a stub for the
/// fall-through address when the condition does not hold. The IT
/// state is consumed.
fn it_conditional_exit(
    thread: &mut ThreadData,
    cursors: &mut ScanCursors,
    it: &mut ItState,
    fallthrough: GuestAddr,
) -> Result<(), CachePressure> {
    if !it.active() {
        return Ok(());
    }
    if it.cond_inst_after_it != 1 {
        fatal_translation(fallthrough, "block-ending instruction mid-IT");
    }
    check_free_space(thread, cursors, Some(it), Isa::T32, 16)?;
    // The in-flight IT makes the short branch conditional; it jumps
    // over the not-taken branch into the exit sequence.
    cursors.emit(|w| t32::b16(w, 2));
    let dest = lookup_or_stub(thread, fallthrough)?;
    // SAFETY: covered by the free-space check above.
    let mut w = unsafe { CodeWriter::new(cursors.write) };
    cc_branch(thread, &mut w, dest, fallthrough, Isa::T32);
    cursors.write = w.addr();
    it.cond_inst_after_it = 0;
    Ok(())
}

/// Classify an instruction for plugin callbacks.
fn classify(inst: &T32Inst) -> (u32, Option<LdStOperands>) {
    use inst_class::*;
    match *inst {
        T32Inst::B16 { .. } | T32Inst::B32 { .. } => (BRANCH_DIRECT, None),
        T32Inst::Bl { .. } | T32Inst::BlxImm { .. } => {
            (BRANCH_DIRECT | BRANCH_CALL, None)
        }
        T32Inst::BCond16 { .. } | T32Inst::BCond32 { .. } | T32Inst::Cbz { .. } => {
            (BRANCH_DIRECT | BRANCH_COND, None)
        }
        T32Inst::Tb { rn, rm, half } => (
            BRANCH_INDIRECT,
            Some(LdStOperands {
                rn,
                imm: 0,
                reg_offset: Some((rm, half as u8)),
            }),
        ),
        T32Inst::BxReg { rm, link } => {
            let mut c = BRANCH_INDIRECT;
            if link {
                c |= BRANCH_CALL;
            } else if rm == LR {
                c |= BRANCH_RETURN;
            }
            (c, None)
        }
        T32Inst::AddHi { rdn: 15, .. } | T32Inst::MovHi { rd: 15, .. } => {
            (BRANCH_INDIRECT, None)
        }
        T32Inst::Pop { .. } => (BRANCH_INDIRECT | BRANCH_RETURN, None),
        T32Inst::LdmPc { rn, .. } => {
            if rn == SP {
                (BRANCH_INDIRECT | BRANCH_RETURN, None)
            } else {
                (BRANCH_INDIRECT, None)
            }
        }
        T32Inst::LdrLitPc { imm } => (
            BRANCH_INDIRECT | LOAD_STORE,
            Some(LdStOperands {
                rn: 15,
                imm,
                reg_offset: None,
            }),
        ),
        T32Inst::LdrPcImm { rn, imm, index, .. } => (
            BRANCH_INDIRECT | LOAD_STORE,
            Some(LdStOperands {
                rn,
                imm: if index { imm } else { 0 },
                reg_offset: None,
            }),
        ),
        T32Inst::LdrPcReg { rn, rm, shift } => (
            BRANCH_INDIRECT | LOAD_STORE,
            Some(LdStOperands {
                rn,
                imm: 0,
                reg_offset: Some((rm, shift)),
            }),
        ),
        T32Inst::LdrLit16 { imm, .. } => (
            LOAD_STORE,
            Some(LdStOperands {
                rn: 15,
                imm: imm as i32,
                reg_offset: None,
            }),
        ),
        T32Inst::PcRelLoad { imm, .. } => (
            LOAD_STORE,
            Some(LdStOperands {
                rn: 15,
                imm,
                reg_offset: None,
            }),
        ),
        T32Inst::Svc { .. } => (SYSCALL, None),
        T32Inst::Other16(hw) => classify_other16(hw),
        T32Inst::Other32(raw) => classify_other32(raw),
        _ => (0, None),
    }
}

fn classify_other16(hw: u16) -> (u32, Option<LdStOperands>) {
    // Narrow immediate- and register-offset loads and stores.
    match hw >> 12 {
        0x5 => (
            inst_class::LOAD_STORE,
            Some(LdStOperands {
                rn: ((hw >> 3) & 7) as u8,
                imm: 0,
                reg_offset: Some((((hw >> 6) & 7) as u8, 0)),
            }),
        ),
        0x6 | 0x7 | 0x8 => {
            let scale = match hw >> 12 {
                0x6 => 2,
                0x7 => 0,
                _ => 1,
            };
            (
                inst_class::LOAD_STORE,
                Some(LdStOperands {
                    rn: ((hw >> 3) & 7) as u8,
                    imm: (((hw >> 6) & 0x1F) as i32) << scale,
                    reg_offset: None,
                }),
            )
        }
        0x9 => (
            inst_class::LOAD_STORE,
            Some(LdStOperands {
                rn: SP,
                imm: ((hw & 0xFF) as i32) << 2,
                reg_offset: None,
            }),
        ),
        _ => (0, None),
    }
}

fn classify_other32(raw: u32) -> (u32, Option<LdStOperands>) {
    let hw1 = (raw >> 16) as u16;
    let hw2 = raw as u16;
    if hw1 & 0xFE00 != 0xF800 {
        return (0, None);
    }
    let rn = (hw1 & 0xF) as u8;
    if hw1 & 0x0080 != 0 {
        return (
            inst_class::LOAD_STORE,
            Some(LdStOperands {
                rn,
                imm: (hw2 & 0xFFF) as i32,
                reg_offset: None,
            }),
        );
    }
    if hw2 & 0x0800 != 0 {
        let imm = (hw2 & 0xFF) as i32;
        let imm = if hw2 & 0x0200 != 0 { imm } else { -imm };
        let indexed = hw2 & 0x0400 != 0;
        return (
            inst_class::LOAD_STORE,
            Some(LdStOperands {
                rn,
                imm: if indexed { imm } else { 0 },
                reg_offset: None,
            }),
        );
    }
    if hw2 & 0x0FC0 == 0 {
        return (
            inst_class::LOAD_STORE,
            Some(LdStOperands {
                rn,
                imm: 0,
                reg_offset: Some(((hw2 & 0xF) as u8, ((hw2 >> 4) & 3) as u8)),
            }),
        );
    }
    (0, None)
}

/// Translate one T32 basic block starting at `start` (mode bit
/// cleared) into fragment `basic_block`. Returns the cache entry
/// address with the mode bit set.
pub fn scan_t32(
    thread: &mut ThreadData,
    start: GuestAddr,
    basic_block: usize,
) -> Result<usize, CachePressure> {
    let plugins = installed_plugins();
    let mut cursors = ScanCursors::for_slot(thread, basic_block);
    let entry = cursors.write;
    thread.code_cache_meta[basic_block].isa = Isa::T32;

    let mut it = ItState::new();
    let mut read = start;
    let mut inline_back_count = 0usize;
    let mut stop = false;

    while !stop {
        // SAFETY: guest code pages are kept readable by the syscall
        // interposer; an unmapped PC faults before translation starts.
        let (inst, width) = unsafe { t32::decode(read) };
        let (class, ld_st) = classify(&inst);

        let replaced = callbacks::deliver_inst_cbs(
            thread,
            plugins,
            CbEvent::PreInst,
            &mut cursors,
            Some(&mut it),
            Isa::T32,
            basic_block,
            read | THUMB_FLAG,
            class,
            ld_st,
        )?;

        let mut next_read = read + width;

        if replaced {
            if class & (inst_class::BRANCH_DIRECT | inst_class::BRANCH_INDIRECT) != 0
            {
                // A replaced branch still terminates the fragment; the
                // exit glue resolves the fall-through address.
                check_free_space(
                    thread,
                    &mut cursors,
                    Some(&mut it),
                    Isa::T32,
                    DISP_CALL_SIZE_T32,
                )?;
                let meta = &mut thread.code_cache_meta[basic_block];
                meta.exit_branch_type = BranchType::UncondImm;
                meta.exit_branch_addr = cursors.write;
                // SAFETY: covered by the free-space check above.
                let mut w = unsafe { CodeWriter::new(cursors.write) };
                branch_save_context(&mut w, thread.scratch_regs_addr(), Isa::T32);
                branch_jump(
                    thread,
                    &mut w,
                    basic_block,
                    next_read | THUMB_FLAG,
                    SETUP | REPLACE_TARGET | INSERT_BRANCH,
                    Isa::T32,
                );
                cursors.write = w.addr();
                stop = true;
            }
        } else {
            scan_one(
                thread,
                &mut cursors,
                &mut it,
                basic_block,
                inst,
                start,
                read,
                width,
                &mut next_read,
                &mut inline_back_count,
                &mut stop,
            )?;
        }

        callbacks::deliver_inst_cbs(
            thread,
            plugins,
            CbEvent::PostInst,
            &mut cursors,
            Some(&mut it),
            Isa::T32,
            basic_block,
            read | THUMB_FLAG,
            class,
            ld_st,
        )?;

        if !replaced {
            it.advance();
        }
        read = next_read;
    }

    let scanned_end = thread.code_cache.slot_end(thread.free_block - 1);
    dbm_core::icache::flush_icache_range(entry, scanned_end);
    Ok(entry | THUMB_FLAG)
}

#[allow(clippy::too_many_arguments)]
fn scan_one(
    thread: &mut ThreadData,
    cursors: &mut ScanCursors,
    it: &mut ItState,
    basic_block: usize,
    inst: T32Inst,
    start: GuestAddr,
    read: GuestAddr,
    width: usize,
    next_read: &mut GuestAddr,
    inline_back_count: &mut usize,
    stop: &mut bool,
) -> Result<(), CachePressure> {
    let scratch = thread.scratch_regs_addr();
    match inst {
        T32Inst::Other16(hw) => {
            check_free_space(thread, cursors, Some(it), Isa::T32, 4)?;
            cursors.emit(|w| w.write16(hw));
        }
        T32Inst::Other32(raw) => {
            check_free_space(thread, cursors, Some(it), Isa::T32, 8)?;
            cursors.emit(|w| {
                w.write16((raw >> 16) as u16);
                w.write16(raw as u16);
            });
        }
        T32Inst::It { firstcond, mask } => {
            if it.active() {
                fatal_translation(read | THUMB_FLAG, "nested IT block");
            }
            check_free_space(thread, cursors, None, Isa::T32, 4)?;
            let at = cursors.write;
            cursors.emit(|w| t32::it(w, Cond::from_bits(firstcond as u32), mask));
            it.start(Cond::from_bits(firstcond as u32), mask as u32, at);
        }

        // -- PC-relative data accesses -------------------------------
        T32Inst::LdrLit16 { rt, imm } => {
            check_free_space(thread, cursors, Some(it), Isa::T32, 20)?;
            let lit = ((read + 4) & !3) + imm as usize;
            with_it_split(cursors, it, |c, cond| {
                c.emit(|w| {
                    if cond != Cond::Al {
                        t32::it(w, cond, it_mask_then(cond, 3));
                    }
                    t32::copy_to_reg(w, rt, lit as u32);
                    t32::ldr_imm12(w, rt, rt, 0);
                });
            });
        }
        T32Inst::PcRelLoad { op, rt, imm } => {
            check_free_space(thread, cursors, Some(it), Isa::T32, 20)?;
            let lit = (((read + 4) & !3) as i64 + imm as i64) as usize;
            with_it_split(cursors, it, |c, cond| {
                c.emit(|w| {
                    if cond != Cond::Al {
                        t32::it(w, cond, it_mask_then(cond, 3));
                    }
                    t32::copy_to_reg(w, rt, lit as u32);
                    match op {
                        LoadOp::Word => t32::ldr_imm12(w, rt, rt, 0),
                        LoadOp::Byte => t32::ldrb_imm12(w, rt, rt, 0),
                        LoadOp::Half => t32::ldrh_imm12(w, rt, rt, 0),
                        LoadOp::SignedByte => t32::ldrsb_imm12(w, rt, rt, 0),
                        LoadOp::SignedHalf => t32::ldrsh_imm12(w, rt, rt, 0),
                    }
                });
            });
        }
        T32Inst::Adr16 { rd, imm } => {
            check_free_space(thread, cursors, Some(it), Isa::T32, 16)?;
            let value = ((read + 4) & !3) + imm as usize;
            emit_materialise(cursors, it, rd, value as u32);
        }
        T32Inst::Adr32 { rd, imm } => {
            check_free_space(thread, cursors, Some(it), Isa::T32, 16)?;
            let value = (((read + 4) & !3) as i64 + imm as i64) as usize;
            emit_materialise(cursors, it, rd, value as u32);
        }
        T32Inst::MovHi { rd, rm } if rd != 15 && rm == 15 => {
            check_free_space(thread, cursors, Some(it), Isa::T32, 16)?;
            emit_materialise(cursors, it, rd, (read + 4) as u32);
        }
        T32Inst::AddHi { rdn, rm } if rdn != 15 && rm == 15 => {
            check_free_space(thread, cursors, Some(it), Isa::T32, 24)?;
            let value = (read + 4) as u32;
            let tmp = if rdn == R0 { R1 } else { R0 };
            with_it_split(cursors, it, |c, cond| {
                c.emit(|w| {
                    // The spill stays balanced whether or not the
                    // condition holds; only the ADD is conditional.
                    t32::push16(w, 1 << tmp);
                    t32::copy_to_reg(w, tmp, value);
                    if cond != Cond::Al {
                        t32::it(w, cond, it_mask_then(cond, 1));
                    }
                    t32::add_hi(w, rdn, tmp);
                    t32::pop16(w, 1 << tmp);
                });
            });
        }
        T32Inst::CmpHi { rn, rm } => {
            if rm != 15 {
                fatal_translation(
                    read | THUMB_FLAG,
                    "unexpected high-register compare shape",
                );
            }
            check_free_space(thread, cursors, Some(it), Isa::T32, 24)?;
            let value = (read + 4) as u32;
            let tmp = if rn == R0 { R1 } else { R0 };
            with_it_split(cursors, it, |c, cond| {
                c.emit(|w| {
                    t32::push16(w, 1 << tmp);
                    t32::copy_to_reg(w, tmp, value);
                    if cond != Cond::Al {
                        t32::it(w, cond, it_mask_then(cond, 1));
                    }
                    t32::cmp_reg(w, rn, tmp);
                    t32::pop16(w, 1 << tmp);
                });
            });
        }

        // -- Direct branches -----------------------------------------
        T32Inst::B16 { offset } => {
            let target = ((read as i64 + offset as i64) as usize) | THUMB_FLAG;
            if it.active() {
                // A branch as the final IT instruction is a
                // conditional exit.
                let cond = it.cur_cond();
                cond_imm_exit(
                    thread,
                    cursors,
                    it,
                    basic_block,
                    target,
                    (read + width) | THUMB_FLAG,
                    cond,
                )?;
                *stop = true;
                return Ok(());
            }
            if target & !1 <= read {
                if *inline_back_count >= MAX_BACK_INLINE {
                    check_free_space(thread, cursors, None, Isa::T32, 8)?;
                    let dest = lookup_or_stub(thread, target)?;
                    // SAFETY: covered by the free-space check above.
                    let mut w = unsafe { CodeWriter::new(cursors.write) };
                    cc_branch(thread, &mut w, dest, target, Isa::T32);
                    cursors.write = w.addr();
                    thread.code_cache_meta[basic_block].exit_branch_type =
                        BranchType::TraceInlineMax;
                    *stop = true;
                    return Ok(());
                }
                *inline_back_count += 1;
            }
            // Fold the target block into this fragment.
            *next_read = target & !1;
        }
        T32Inst::B32 { offset } => {
            let target = ((read as i64 + offset as i64) as usize) | THUMB_FLAG;
            if it.active() {
                let cond = it.cur_cond();
                cond_imm_exit(
                    thread,
                    cursors,
                    it,
                    basic_block,
                    target,
                    (read + width) | THUMB_FLAG,
                    cond,
                )?;
                *stop = true;
                return Ok(());
            }
            uncond_imm_exit(thread, cursors, basic_block, target)?;
            *stop = true;
        }
        T32Inst::Bl { offset } => {
            let target = ((read as i64 + offset as i64) as usize) | THUMB_FLAG;
            let ret = (read + 4) | THUMB_FLAG;
            it_conditional_exit(thread, cursors, it, ret)?;
            check_free_space(thread, cursors, None, Isa::T32, 12)?;
            cursors.emit(|w| t32::copy_to_reg(w, LR, ret as u32));
            uncond_imm_exit(thread, cursors, basic_block, target)?;
            *stop = true;
        }
        T32Inst::BlxImm { offset } => {
            let target = (((read + 4) & !3) as i64 + offset as i64) as usize;
            let ret = (read + 4) | THUMB_FLAG;
            it_conditional_exit(thread, cursors, it, ret)?;
            check_free_space(
                thread,
                cursors,
                None,
                Isa::T32,
                DISP_CALL_SIZE_T32 + 12,
            )?;
            cursors.emit(|w| t32::copy_to_reg(w, LR, ret as u32));
            let meta = &mut thread.code_cache_meta[basic_block];
            meta.exit_branch_type = BranchType::UncondBlxi;
            meta.exit_branch_addr = cursors.write;
            // SAFETY: covered by the free-space check above.
            let mut w = unsafe { CodeWriter::new(cursors.write) };
            branch_save_context(&mut w, scratch, Isa::T32);
            branch_jump(
                thread,
                &mut w,
                basic_block,
                target,
                SETUP | REPLACE_TARGET | INSERT_BRANCH,
                Isa::T32,
            );
            cursors.write = w.addr();
            *stop = true;
        }
        T32Inst::BCond16 { cond, offset } | T32Inst::BCond32 { cond, offset } => {
            let target = ((read as i64 + offset as i64) as usize) | THUMB_FLAG;
            cond_imm_exit(
                thread,
                cursors,
                it,
                basic_block,
                target,
                (read + width) | THUMB_FLAG,
                cond,
            )?;
            *stop = true;
        }
        T32Inst::Cbz { nz, rn, offset } => {
            let target = (read as i64 + offset as i64) as usize | THUMB_FLAG;
            let fallthrough = (read + width) | THUMB_FLAG;
            // Normalise: the taken arm is the rn == 0 path.
            let (taken, skipped) = if nz {
                (fallthrough, target)
            } else {
                (target, fallthrough)
            };
            check_free_space(thread, cursors, Some(it), Isa::T32, CBZ_SIZE_T32)?;
            let meta = &mut thread.code_cache_meta[basic_block];
            meta.exit_branch_type = BranchType::Cbz;
            meta.exit_branch_addr = cursors.write;
            meta.branch_taken_addr = taken;
            meta.branch_skipped_addr = skipped;
            meta.rn = rn as u32;
            let taken_cached = thread.entry_address.lookup(taken);
            let skipped_cached = thread.entry_address.lookup(skipped);
            let mut write = cursors.write;
            encode_cbz_t32(
                thread,
                &mut write,
                basic_block,
                rn,
                taken_cached.unwrap_or(taken),
                skipped_cached.unwrap_or(skipped),
                taken_cached.is_some(),
                skipped_cached.is_some(),
                false,
            );
            cursors.write = write;
            *stop = true;
        }

        // -- Indirect branches ---------------------------------------
        T32Inst::BxReg { rm, link } => {
            if rm == 15 && !link {
                // BX PC: a direct mode change to A32.
                let target = (read + 4) & !3;
                check_free_space(thread, cursors, Some(it), Isa::T32, 12)?;
                let dest = lookup_or_stub(thread, target)?;
                let lit = cursors.alloc_data(4);
                // SAFETY: literal slot inside the fragment.
                unsafe { (lit as *mut u32).write_unaligned(dest as u32) };
                cursors.emit(|w| {
                    let off = lit as i64 - ((w.addr() as i64 + 4) & !3);
                    t32::ldr_lit(w, 15, off as i32);
                });
                thread.record_cc_link(lit, true, target, Isa::T32);
                thread.code_cache_meta[basic_block].exit_branch_type =
                    BranchType::TraceInlineMax;
                *stop = true;
                return Ok(());
            }
            let ret = (read + width) | THUMB_FLAG;
            it_conditional_exit(thread, cursors, it, ret)?;
            check_free_space(thread, cursors, None, Isa::T32, IHL_SIZE_T32)?;
            let meta = &mut thread.code_cache_meta[basic_block];
            meta.exit_branch_type = BranchType::UncondReg;
            meta.exit_branch_addr = cursors.write;
            meta.rn = rm as u32;
            inline_hash_lookup_t32(
                thread,
                cursors,
                basic_block,
                rm,
                link.then_some(ret),
                false,
            );
            *stop = true;
        }
        T32Inst::MovHi { rd: 15, rm } => {
            // MOV PC, rm stays in T32 regardless of bit 0.
            let ret = (read + width) | THUMB_FLAG;
            it_conditional_exit(thread, cursors, it, ret)?;
            check_free_space(thread, cursors, None, Isa::T32, IHL_SIZE_T32)?;
            let meta = &mut thread.code_cache_meta[basic_block];
            meta.exit_branch_type = BranchType::UncondReg;
            meta.exit_branch_addr = cursors.write;
            meta.rn = rm as u32;
            inline_hash_lookup_t32(thread, cursors, basic_block, rm, None, true);
            *stop = true;
        }
        T32Inst::AddHi { rdn: 15, rm } => {
            let ret = (read + width) | THUMB_FLAG;
            it_conditional_exit(thread, cursors, it, ret)?;
            check_free_space(
                thread,
                cursors,
                None,
                Isa::T32,
                DISP_CALL_SIZE_T32 + 20,
            )?;
            let pc_val = (read + 4) as u32;
            indirect_exit(thread, cursors, basic_block, |w| {
                t32::mov_hi(w, R1, rm);
                t32::copy_to_reg(w, R0, pc_val);
                t32::add_reg(w, R0, R0, R1, 0);
                t32::orr_imm8(w, R0, R0, 1);
            })?;
            *stop = true;
        }
        T32Inst::LdrLitPc { imm } => {
            let ret = (read + width) | THUMB_FLAG;
            it_conditional_exit(thread, cursors, it, ret)?;
            check_free_space(
                thread,
                cursors,
                None,
                Isa::T32,
                DISP_CALL_SIZE_T32 + 16,
            )?;
            let lit = (((read + 4) & !3) as i64 + imm as i64) as usize;
            indirect_exit(thread, cursors, basic_block, |w| {
                t32::copy_to_reg(w, R0, lit as u32);
                t32::ldr_imm12(w, R0, R0, 0);
            })?;
            *stop = true;
        }
        T32Inst::LdrPcImm {
            rn,
            imm,
            index,
            wback,
        } => {
            let ret = (read + width) | THUMB_FLAG;
            it_conditional_exit(thread, cursors, it, ret)?;
            check_free_space(
                thread,
                cursors,
                None,
                Isa::T32,
                DISP_CALL_SIZE_T32 + 20,
            )?;
            if wback && rn <= R2 {
                fatal_translation(
                    read | THUMB_FLAG,
                    "LDR PC writeback base clashes with the scratch set",
                );
            }
            indirect_exit(thread, cursors, basic_block, |w| {
                let load_off = if index { imm } else { 0 };
                t32::ldr_imm8(w, R0, rn, load_off, true, false);
                if wback {
                    if imm >= 0 {
                        if rn == SP && imm % 4 == 0 && imm < 512 {
                            t32::add_sp16(w, (imm / 4) as u8);
                        } else {
                            t32::add_imm12(w, rn, rn, imm as u32);
                        }
                    } else {
                        t32::sub_imm12(w, rn, rn, imm.unsigned_abs());
                    }
                }
            })?;
            *stop = true;
        }
        T32Inst::LdrPcReg { rn, rm, shift } => {
            let ret = (read + width) | THUMB_FLAG;
            it_conditional_exit(thread, cursors, it, ret)?;
            check_free_space(
                thread,
                cursors,
                None,
                Isa::T32,
                DISP_CALL_SIZE_T32 + 12,
            )?;
            indirect_exit(thread, cursors, basic_block, |w| {
                t32::ldr_reg(w, R0, rn, rm, shift);
            })?;
            *stop = true;
        }
        T32Inst::Pop { reglist } => {
            let ret = (read + width) | THUMB_FLAG;
            it_conditional_exit(thread, cursors, it, ret)?;
            check_free_space(
                thread,
                cursors,
                None,
                Isa::T32,
                DISP_CALL_SIZE_T32 + 16,
            )?;
            let lo = reglist & 0xFF;
            if lo != 0 {
                cursors.emit(|w| t32::pop16(w, lo));
            }
            indirect_exit(thread, cursors, basic_block, |w| {
                t32::ldr_imm8(w, R0, SP, 0, true, false);
                t32::add_sp16(w, 1);
            })?;
            *stop = true;
        }
        T32Inst::LdmPc {
            rn,
            reglist,
            wback,
            dec,
        } => {
            if dec {
                fatal_translation(read | THUMB_FLAG, "LDMDB with PC in the list");
            }
            let ret = (read + width) | THUMB_FLAG;
            it_conditional_exit(thread, cursors, it, ret)?;
            check_free_space(
                thread,
                cursors,
                None,
                Isa::T32,
                DISP_CALL_SIZE_T32 + 24,
            )?;
            let lo = reglist & 0x7FFF;
            let pc_slot = 4 * lo.count_ones() as i32;
            if wback && (rn <= R2 || lo & (1 << rn) != 0) {
                fatal_translation(
                    read | THUMB_FLAG,
                    "LDM writeback base clashes with the loaded set",
                );
            }
            if rn == SP && wback {
                if lo != 0 {
                    cursors.emit(|w| t32::pop_regs(w, lo));
                }
                indirect_exit(thread, cursors, basic_block, |w| {
                    t32::ldr_imm8(w, R0, SP, 0, true, false);
                    t32::add_sp16(w, 1);
                })?;
            } else {
                if lo != 0 {
                    cursors.emit(|w| t32::ldmia(w, rn, lo, false));
                }
                indirect_exit(thread, cursors, basic_block, |w| {
                    t32::ldr_imm8(w, R0, rn, pc_slot, true, false);
                    if wback {
                        t32::add_imm12(w, rn, rn, (pc_slot + 4) as u32);
                    }
                })?;
            }
            *stop = true;
        }

        // -- Table branches ------------------------------------------
        T32Inst::Tb { rn, rm, half } => {
            check_free_space(thread, cursors, Some(it), Isa::T32, TB_SIZE_T32)?;
            table_branch_exit(thread, cursors, basic_block, rn, rm, half, read)?;
            *stop = true;
        }

        // -- System calls --------------------------------------------
        T32Inst::Svc { .. } => {
            check_free_space(thread, cursors, Some(it), Isa::T32, 24)?;
            let ret = (read + width) | THUMB_FLAG;
            let wrapper = thread.syscall_wrapper_addr;
            cursors.emit(|w| {
                t32::sub_sp16(w, 1);
                t32::push_regs(w, 0x5FFF);
                t32::copy_to_reg(w, 8, ret as u32);
                t32_blx32_abs(w, wrapper);
            });
        }

        T32Inst::Invalid => {
            if read == start {
                fatal_translation(
                    read | THUMB_FLAG,
                    "undecodable instruction at block start",
                );
            }
            // Defer the failure until the offending address is
            // actually reached.
            check_free_space(thread, cursors, None, Isa::T32, DISP_CALL_SIZE_T32)?;
            let meta = &mut thread.code_cache_meta[basic_block];
            meta.exit_branch_type = BranchType::UncondImm;
            meta.exit_branch_addr = cursors.write;
            // SAFETY: covered by the free-space check above.
            let mut w = unsafe { CodeWriter::new(cursors.write) };
            branch_save_context(&mut w, scratch, Isa::T32);
            branch_jump(
                thread,
                &mut w,
                basic_block,
                read | THUMB_FLAG,
                SETUP | REPLACE_TARGET | INSERT_BRANCH,
                Isa::T32,
            );
            cursors.write = w.addr();
            *stop = true;
        }

        other => {
            fatal_translation(
                read | THUMB_FLAG,
                &format!("unhandled instruction shape {other:?}"),
            );
        }
    }
    Ok(())
}

/// Materialise a 32-bit constant into `rd`, conditional under an IT
/// block if one is in flight.
fn emit_materialise(cursors: &mut ScanCursors, it: &mut ItState, rd: u8, value: u32) {
    with_it_split(cursors, it, |c, cond| {
        c.emit(|w| {
            if cond != Cond::Al {
                t32::it(w, cond, it_mask_then(cond, 2));
            }
            t32::copy_to_reg(w, rd, value);
        });
    });
}

/// Direct unconditional exit: link straight to a cached target or
/// emit a dispatcher stub.
fn uncond_imm_exit(
    thread: &mut ThreadData,
    cursors: &mut ScanCursors,
    basic_block: usize,
    target: GuestAddr,
) -> Result<(), CachePressure> {
    check_free_space(thread, cursors, None, Isa::T32, DISP_CALL_SIZE_T32)?;
    let meta = &mut thread.code_cache_meta[basic_block];
    meta.exit_branch_type = BranchType::UncondImm;
    meta.exit_branch_addr = cursors.write;
    let cached = thread.entry_address.lookup(target);
    // SAFETY: covered by the free-space check above.
    let mut w = unsafe { CodeWriter::new(cursors.write) };
    match cached {
        Some(dest) if target & 1 != 0 => {
            cc_branch(thread, &mut w, dest, target, Isa::T32);
        }
        _ => {
            branch_save_context(&mut w, thread.scratch_regs_addr(), Isa::T32);
            branch_jump(
                thread,
                &mut w,
                basic_block,
                target,
                SETUP | REPLACE_TARGET | INSERT_BRANCH,
                Isa::T32,
            );
        }
    }
    cursors.write = w.addr();
    Ok(())
}

/// Conditional direct exit through the shared encoder.
#[allow(clippy::too_many_arguments)]
fn cond_imm_exit(
    thread: &mut ThreadData,
    cursors: &mut ScanCursors,
    it: &mut ItState,
    basic_block: usize,
    taken: GuestAddr,
    skipped: GuestAddr,
    cond: Cond,
) -> Result<(), CachePressure> {
    if it.active() {
        // The exit encoder emits its own IT wrappers.
        it.create_gap(&mut cursors.write);
        it.cond_inst_after_it = 0;
    }
    check_free_space(thread, cursors, None, Isa::T32, IMM_SIZE_T32)?;
    let meta = &mut thread.code_cache_meta[basic_block];
    meta.exit_branch_type = BranchType::CondImm;
    meta.exit_branch_addr = cursors.write;
    meta.branch_taken_addr = taken;
    meta.branch_skipped_addr = skipped;
    meta.branch_condition = cond;
    let taken_cached = thread.entry_address.lookup(taken);
    let skipped_cached = thread.entry_address.lookup(skipped);
    let mut write = cursors.write;
    encode_cond_imm_t32(
        thread,
        &mut write,
        basic_block,
        taken_cached.unwrap_or(taken),
        skipped_cached.unwrap_or(skipped),
        cond,
        taken_cached.is_some(),
        skipped_cached.is_some(),
        false,
    );
    cursors.write = write;
    Ok(())
}

/// Indirect exit through a dispatcher stub: spill the context, run
/// `load_target` (which must leave the guest target in r0), then
/// branch to the dispatcher.
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
    branch_save_context(&mut w, thread.scratch_regs_addr(), Isa::T32);
    load_target(&mut w);
    branch_jump(
        thread,
        &mut w,
        basic_block,
        0,
        SETUP | INSERT_BRANCH,
        Isa::T32,
    );
    cursors.write = w.addr();
    Ok(())
}

/// Emit the inline table-branch dispatch: compute the guest target,
/// record the observed index in the fragment metadata, probe the
/// per-fragment pair table and fall through to the dispatcher on a
/// miss. The pair table address becomes `exit_branch_addr`.
fn table_branch_exit(
    thread: &mut ThreadData,
    cursors: &mut ScanCursors,
    basic_block: usize,
    rn: u8,
    rm: u8,
    half: bool,
    read: GuestAddr,
) -> Result<(), CachePressure> {
    use dbm_core::fragment::TB_CACHE_SIZE;

    let table = cursors.alloc_data(TB_CACHE_SIZE * 8);
    for i in 0..TB_CACHE_SIZE {
        tb_write_pair(table, i, TB_KEY_EMPTY, 0);
    }
    let meta = &mut thread.code_cache_meta[basic_block];
    meta.exit_branch_type = if half {
        BranchType::Tbh
    } else {
        BranchType::Tbb
    };
    meta.exit_branch_addr = table;
    meta.free_b = 0;

    let rn_slot = thread.meta_rn_addr(basic_block);
    let scratch = thread.scratch_regs_addr();
    let pc_val = (read + 4) as u32;

    cursors.emit(|w| {
        // Stack: one spare word for the resolved target, then r0-r2.
        t32::sub_sp16(w, 1);
        t32::push16(w, 0x7);

        // r2 := table base, r1 := index register value, r0 free.
        if rn == 15 {
            t32::mov_hi(w, R1, rm);
            t32::copy_to_reg(w, R2, pc_val);
        } else if rm == R2 {
            if rn == R1 {
                t32::mov_hi(w, R0, R1);
                t32::mov_hi(w, R1, R2);
                t32::mov_hi(w, R2, R0);
            } else {
                t32::mov_hi(w, R1, rm);
                t32::mov_hi(w, R2, rn);
            }
        } else {
            t32::mov_hi(w, R2, rn);
            t32::mov_hi(w, R1, rm);
        }
        // r0 := guest table entry (a halfword count).
        if half {
            t32::ldrh_reg(w, R0, R2, R1, 1);
        } else {
            t32::ldrb_reg(w, R0, R2, R1, 0);
        }
        // Record the observed index for the dispatcher.
        t32::copy_to_reg(w, R2, rn_slot as u32);
        t32::str_imm12(w, R1, R2, 0);
        // r0 := guest target (Thumb).
        t32::copy_to_reg(w, R2, pc_val + 1);
        t32::add_reg(w, R0, R2, R0, 1);
    });

    // Unrolled pair-table probe.
    for i in 0..TB_CACHE_SIZE {
        let key_addr = table + i * 8;
        cursors.emit(|w| {
            let base = (w.addr() + 4) & !3;
            t32::ldr_lit(w, R2, (key_addr as i64 - base as i64) as i32);
            t32::cmp_reg(w, R2, R0);
            // Over the hit block (12 bytes) when this key mismatches.
            t32::b_cond16(w, Cond::Ne, 10);
            let base = (w.addr() + 4) & !3;
            t32::ldr_lit(w, R2, (key_addr as i64 + 4 - base as i64) as i32);
            t32::str_sp16(w, R2, 3);
            t32::pop16(w, 0x7);
            t32::ldr_imm8(w, 15, SP, 4, false, true);
        });
    }

    // Miss: hand the target to the dispatcher.
    cursors.emit(|w| {
        t32::str_sp16(w, R0, 3);
        t32::pop16(w, 0x7);
        branch_save_context(w, scratch, Isa::T32);
        t32::ldr_imm8(w, R0, SP, 4, false, true);
    });
    // SAFETY: within the span covered by the caller's guard.
    let mut w = unsafe { CodeWriter::new(cursors.write) };
    branch_jump(
        thread,
        &mut w,
        basic_block,
        0,
        SETUP | INSERT_BRANCH,
        Isa::T32,
    );
    cursors.write = w.addr();
    Ok(())
}
