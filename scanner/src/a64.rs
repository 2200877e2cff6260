//! A64 basic-block scanner.
//!
//! A64 keeps the PC out of the register file, so only branches,
//! ADR/ADRP and literal loads need rewriting; everything else is
//! copied verbatim. Conditional exits (B.cond, CBZ, TBZ) share the
//! three-word reserved head the dispatcher patches.

use dbm_api::context::LdStOperands;
use dbm_api::{inst_class, installed_plugins, CbEvent};
use dbm_codec::a64::{self, A64Inst};
use dbm_codec::CodeWriter;
use dbm_core::fragment::{BranchType, Cond, Isa};
use dbm_core::regs::X30;
use dbm_core::{fatal_translation, CachePressure, GuestAddr, ThreadData};

use crate::common::{
    a64_bl_abs, branch_jump, branch_save_context, cc_branch, check_free_space,
    encode_cond_a64, inline_hash_lookup_a64, pack_a64_cond, A64CondKind,
    ScanCursors, DISP_CALL_SIZE_A64, IHL_SIZE_A64, IMM_SIZE_A64, INSERT_BRANCH,
    MAX_BACK_INLINE, REPLACE_TARGET, SETUP,
};
use crate::{callbacks, lookup_or_stub};

fn classify(inst: &A64Inst) -> (u32, Option<LdStOperands>) {
    use inst_class::*;
    match *inst {
        A64Inst::B { .. } => (BRANCH_DIRECT, None),
        A64Inst::Bl { .. } => (BRANCH_DIRECT | BRANCH_CALL, None),
        A64Inst::BCond { .. } | A64Inst::Cbz { .. } | A64Inst::Tbz { .. } => {
            (BRANCH_DIRECT | BRANCH_COND, None)
        }
        A64Inst::Br { .. } => (BRANCH_INDIRECT, None),
        A64Inst::Blr { .. } => (BRANCH_INDIRECT | BRANCH_CALL, None),
        A64Inst::Ret { .. } => (BRANCH_INDIRECT | BRANCH_RETURN, None),
        A64Inst::LdrLit { offset, .. } | A64Inst::LdrswLit { offset, .. } => (
            LOAD_STORE,
            Some(LdStOperands {
                rn: 15,
                imm: offset,
                reg_offset: None,
            }),
        ),
        A64Inst::Svc { .. } => (SYSCALL, None),
        A64Inst::Other(w) => classify_other(w),
        _ => (0, None),
    }
}

fn classify_other(w: u32) -> (u32, Option<LdStOperands>) {
    // Unsigned scaled-offset loads and stores.
    if w & 0x3B00_0000 == 0x3900_0000 {
        let size = (w >> 30) & 3;
        return (
            inst_class::LOAD_STORE,
            Some(LdStOperands {
                rn: ((w >> 5) & 0x1F) as u8,
                imm: (((w >> 10) & 0xFFF) << size) as i32,
                reg_offset: None,
            }),
        );
    }
    // Unscaled / pre / post immediate forms.
    if w & 0x3B20_0400 == 0x3800_0400 || w & 0x3B20_0C00 == 0x3800_0000 {
        let imm9 = crate::sext9((w >> 12) & 0x1FF);
        return (
            inst_class::LOAD_STORE,
            Some(LdStOperands {
                rn: ((w >> 5) & 0x1F) as u8,
                imm: imm9,
                reg_offset: None,
            }),
        );
    }
    (0, None)
}

/// Translate one A64 basic block starting at `start` into fragment
/// `basic_block`. Returns the cache entry address.
pub fn scan_a64(
    thread: &mut ThreadData,
    start: GuestAddr,
    basic_block: usize,
) -> Result<usize, CachePressure> {
    let plugins = installed_plugins();
    let mut cursors = ScanCursors::for_slot(thread, basic_block);
    let entry = cursors.write;
    thread.code_cache_meta[basic_block].isa = Isa::A64;

    let mut read = start;
    let mut inline_back_count = 0usize;
    let mut stop = false;

    while !stop {
        // SAFETY: guest code pages are kept readable by the syscall
        // interposer.
        let inst = unsafe { a64::decode(read) };
        let (class, ld_st) = classify(&inst);

        let replaced = callbacks::deliver_inst_cbs(
            thread,
            plugins,
            CbEvent::PreInst,
            &mut cursors,
            None,
            Isa::A64,
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
                    Isa::A64,
                    DISP_CALL_SIZE_A64,
                )?;
                let meta = &mut thread.code_cache_meta[basic_block];
                meta.exit_branch_type = BranchType::UncondImm;
                meta.exit_branch_addr = cursors.write;
                // SAFETY: covered by the free-space check above.
                let mut w = unsafe { CodeWriter::new(cursors.write) };
                branch_save_context(&mut w, thread.scratch_regs_addr(), Isa::A64);
                branch_jump(
                    thread,
                    &mut w,
                    basic_block,
                    next_read,
                    SETUP | REPLACE_TARGET | INSERT_BRANCH,
                    Isa::A64,
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
                &mut inline_back_count,
                &mut stop,
            )?;
        }

        callbacks::deliver_inst_cbs(
            thread,
            plugins,
            CbEvent::PostInst,
            &mut cursors,
            None,
            Isa::A64,
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
    inst: A64Inst,
    start: GuestAddr,
    read: GuestAddr,
    next_read: &mut GuestAddr,
    inline_back_count: &mut usize,
    stop: &mut bool,
) -> Result<(), CachePressure> {
    let scratch = thread.scratch_regs_addr();
    match inst {
        A64Inst::Other(word) => {
            check_free_space(thread, cursors, None, Isa::A64, 8)?;
            cursors.emit(|w| w.write32(word));
        }

        // -- PC-relative data accesses -------------------------------
        A64Inst::LdrLit { sf, rt, offset } => {
            check_free_space(thread, cursors, None, Isa::A64, 24)?;
            if rt == 31 {
                // Literal prefetch into XZR: nothing to do.
                return Ok(());
            }
            let lit = (read as i64 + offset as i64) as usize;
            cursors.emit(|w| {
                a64::copy_to_reg(w, rt, lit as u64);
                a64::ldr_imm(w, sf, rt, rt, 0);
            });
        }
        A64Inst::LdrswLit { rt, offset } => {
            check_free_space(thread, cursors, None, Isa::A64, 24)?;
            if rt == 31 {
                return Ok(());
            }
            let lit = (read as i64 + offset as i64) as usize;
            cursors.emit(|w| {
                a64::copy_to_reg(w, rt, lit as u64);
                a64::ldrsw_imm(w, rt, rt, 0);
            });
        }
        A64Inst::Adr { rd, imm } => {
            check_free_space(thread, cursors, None, Isa::A64, 20)?;
            let value = (read as i64 + imm) as u64;
            cursors.emit(|w| a64::copy_to_reg(w, rd, value));
        }
        A64Inst::Adrp { rd, imm } => {
            check_free_space(thread, cursors, None, Isa::A64, 20)?;
            let value = ((read & !0xFFF) as i64 + imm) as u64;
            cursors.emit(|w| a64::copy_to_reg(w, rd, value));
        }

        // -- Direct branches -----------------------------------------
        A64Inst::B { offset } => {
            let target = (read as i64 + offset as i64) as usize;
            if target <= read {
                if *inline_back_count >= MAX_BACK_INLINE {
                    check_free_space(thread, cursors, None, Isa::A64, 8)?;
                    let dest = lookup_or_stub(thread, target)?;
                    // SAFETY: covered by the free-space check above.
                    let mut w = unsafe { CodeWriter::new(cursors.write) };
                    cc_branch(thread, &mut w, dest, target, Isa::A64);
                    cursors.write = w.addr();
                    thread.code_cache_meta[basic_block].exit_branch_type =
                        BranchType::TraceInlineMax;
                    *stop = true;
                    return Ok(());
                }
                *inline_back_count += 1;
            }
            // Fold the target block into this fragment.
            *next_read = target;
        }
        A64Inst::Bl { offset } => {
            let target = (read as i64 + offset as i64) as usize;
            check_free_space(thread, cursors, None, Isa::A64, 20)?;
            let ret = (read + 4) as u64;
            cursors.emit(|w| a64::copy_to_reg(w, X30, ret));
            uncond_imm_exit(thread, cursors, basic_block, target)?;
            *stop = true;
        }
        A64Inst::BCond { cond, offset } => {
            let target = (read as i64 + offset as i64) as usize;
            cond_exit(
                thread,
                cursors,
                basic_block,
                A64CondKind::BCond(cond),
                cond,
                target,
                read + 4,
            )?;
            *stop = true;
        }
        A64Inst::Cbz { nz, sf, rt, offset } => {
            let target = (read as i64 + offset as i64) as usize;
            let fallthrough = read + 4;
            // Normalise: the taken arm is the rt == 0 path.
            let (taken, skipped) = if nz {
                (fallthrough, target)
            } else {
                (target, fallthrough)
            };
            cond_exit(
                thread,
                cursors,
                basic_block,
                A64CondKind::Cbz { rt, sf },
                Cond::Al,
                taken,
                skipped,
            )?;
            *stop = true;
        }
        A64Inst::Tbz { nz, rt, bit, offset } => {
            let target = (read as i64 + offset as i64) as usize;
            let fallthrough = read + 4;
            // Normalise: the taken arm is the bit-clear path.
            let (taken, skipped) = if nz {
                (fallthrough, target)
            } else {
                (target, fallthrough)
            };
            cond_exit(
                thread,
                cursors,
                basic_block,
                A64CondKind::Tbz { rt, bit },
                Cond::Al,
                taken,
                skipped,
            )?;
            *stop = true;
        }

        // -- Indirect branches ---------------------------------------
        A64Inst::Br { rn } => {
            check_free_space(thread, cursors, None, Isa::A64, IHL_SIZE_A64)?;
            let meta = &mut thread.code_cache_meta[basic_block];
            meta.exit_branch_type = BranchType::UncondReg;
            meta.exit_branch_addr = cursors.write;
            inline_hash_lookup_a64(thread, cursors, basic_block, rn, None);
            *stop = true;
        }
        A64Inst::Blr { rn } => {
            check_free_space(thread, cursors, None, Isa::A64, IHL_SIZE_A64 + 16)?;
            let meta = &mut thread.code_cache_meta[basic_block];
            meta.exit_branch_type = BranchType::UncondReg;
            meta.exit_branch_addr = cursors.write;
            inline_hash_lookup_a64(
                thread,
                cursors,
                basic_block,
                rn,
                Some(read + 4),
            );
            *stop = true;
        }
        A64Inst::Ret { rn } => {
            check_free_space(thread, cursors, None, Isa::A64, IHL_SIZE_A64)?;
            let meta = &mut thread.code_cache_meta[basic_block];
            meta.exit_branch_type = BranchType::UncondReg;
            meta.exit_branch_addr = cursors.write;
            inline_hash_lookup_a64(thread, cursors, basic_block, rn, None);
            *stop = true;
        }

        // -- System calls --------------------------------------------
        A64Inst::Svc { .. } => {
            check_free_space(thread, cursors, None, Isa::A64, 72)?;
            let ret = (read + 4) as u64;
            let wrapper = thread.syscall_wrapper_addr;
            cursors.emit(|w| {
                // Spill the caller-saved file the wrapper consumes,
                // highest pair first so memory holds x0..x18,x30
                // ascending from SP.
                a64::stp_pre(w, 18, X30, 31, -16);
                for i in (0u8..9).rev() {
                    let pair = i * 2;
                    a64::stp_pre(w, pair, pair + 1, 31, -16);
                }
                // x9 carries the post-syscall guest PC.
                a64::copy_to_reg(w, 9, ret);
                a64_bl_abs(w, wrapper);
            });
        }

        A64Inst::Invalid => {
            if read == start {
                fatal_translation(read, "undecodable instruction at block start");
            }
            check_free_space(thread, cursors, None, Isa::A64, DISP_CALL_SIZE_A64)?;
            let meta = &mut thread.code_cache_meta[basic_block];
            meta.exit_branch_type = BranchType::UncondImm;
            meta.exit_branch_addr = cursors.write;
            // SAFETY: covered by the free-space check above.
            let mut w = unsafe { CodeWriter::new(cursors.write) };
            branch_save_context(&mut w, scratch, Isa::A64);
            branch_jump(
                thread,
                &mut w,
                basic_block,
                read,
                SETUP | REPLACE_TARGET | INSERT_BRANCH,
                Isa::A64,
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
    check_free_space(thread, cursors, None, Isa::A64, DISP_CALL_SIZE_A64)?;
    let meta = &mut thread.code_cache_meta[basic_block];
    meta.exit_branch_type = BranchType::UncondImm;
    meta.exit_branch_addr = cursors.write;
    let cached = thread.entry_address.lookup(target);
    // SAFETY: covered by the free-space check above.
    let mut w = unsafe { CodeWriter::new(cursors.write) };
    match cached {
        Some(dest) => cc_branch(thread, &mut w, dest, target, Isa::A64),
        None => {
            branch_save_context(&mut w, thread.scratch_regs_addr(), Isa::A64);
            branch_jump(
                thread,
                &mut w,
                basic_block,
                target,
                SETUP | REPLACE_TARGET | INSERT_BRANCH,
                Isa::A64,
            );
        }
    }
    cursors.write = w.addr();
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn cond_exit(
    thread: &mut ThreadData,
    cursors: &mut ScanCursors,
    basic_block: usize,
    kind: A64CondKind,
    cond: Cond,
    taken: GuestAddr,
    skipped: GuestAddr,
) -> Result<(), CachePressure> {
    check_free_space(thread, cursors, None, Isa::A64, IMM_SIZE_A64)?;
    let meta = &mut thread.code_cache_meta[basic_block];
    meta.exit_branch_type = match kind {
        A64CondKind::BCond(_) => BranchType::CondImm,
        _ => BranchType::Cbz,
    };
    meta.exit_branch_addr = cursors.write;
    meta.branch_taken_addr = taken;
    meta.branch_skipped_addr = skipped;
    meta.branch_condition = cond;
    meta.rn = pack_a64_cond(kind);
    let mut write = cursors.write;
    encode_cond_a64(thread, &mut write, basic_block, kind, taken, skipped);
    cursors.write = write;
    Ok(())
}
