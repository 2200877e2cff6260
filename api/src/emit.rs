//! Emit API: code-generation helpers for plugin callbacks.
//!
//! Every helper writes at the context's cache cursor and advances it.
//! Clobbered registers are the plugin's responsibility: wrap emitted
//! calls in `emit_push` / `emit_pop` of the caller-saved set.

use dbm_codec::{a32, a64, t32, CodeWriter};
use dbm_core::fragment::{Cond, Isa};
use dbm_core::regs::{Reg, LR, PC, X30};

use crate::context::PluginCtx;

fn writer(ctx: &PluginCtx) -> CodeWriter {
    // SAFETY: the scanner guarantees headroom at the write cursor and
    // re-checks free space after each callback.
    unsafe { CodeWriter::new(ctx.write_addr) }
}

fn finish(ctx: &mut PluginCtx, w: CodeWriter) {
    ctx.write_addr = w.addr();
}

/// Push a register set (bit N = register N).
pub fn emit_push(ctx: &mut PluginCtx, regs: u32) {
    let mut w = writer(ctx);
    match ctx.isa {
        Isa::T32 => t32::push_regs(&mut w, regs as u16),
        Isa::A32 => a32::push(&mut w, Cond::Al, regs as u16),
        Isa::A64 => a64_push(&mut w, regs),
    }
    finish(ctx, w);
}

/// Pop a register set previously pushed with `emit_push`.
pub fn emit_pop(ctx: &mut PluginCtx, regs: u32) {
    let mut w = writer(ctx);
    match ctx.isa {
        Isa::T32 => t32::pop_regs(&mut w, regs as u16),
        Isa::A32 => a32::pop(&mut w, Cond::Al, regs as u16),
        Isa::A64 => a64_pop(&mut w, regs),
    }
    finish(ctx, w);
}

fn a64_push(w: &mut CodeWriter, regs: u32) {
    let set: Vec<Reg> = (0u8..31).filter(|r| regs & (1 << r) != 0).collect();
    let mut i = 0;
    while i + 1 < set.len() {
        a64::stp_pre(w, set[i], set[i + 1], 31, -16);
        i += 2;
    }
    if i < set.len() {
        a64::str_pre(w, set[i], 31, -16);
    }
}

fn a64_pop(w: &mut CodeWriter, regs: u32) {
    let set: Vec<Reg> = (0u8..31).filter(|r| regs & (1 << r) != 0).collect();
    let odd = set.len() % 2 == 1;
    if odd {
        a64::ldr_post(w, set[set.len() - 1], 31, 16);
    }
    let mut i = set.len() - (odd as usize);
    while i >= 2 {
        a64::ldp_post(w, set[i - 2], set[i - 1], 31, 16);
        i -= 2;
    }
}

/// Set a register to an immediate value.
pub fn emit_set_reg(ctx: &mut PluginCtx, reg: Reg, value: usize) {
    let mut w = writer(ctx);
    match ctx.isa {
        Isa::T32 => t32::copy_to_reg(&mut w, reg, value as u32),
        Isa::A32 => a32::copy_to_reg(&mut w, Cond::Al, reg, value as u32),
        Isa::A64 => a64::copy_to_reg(&mut w, reg, value as u64),
    }
    finish(ctx, w);
}

/// Set a register to a pointer.
pub fn emit_set_reg_ptr<T>(ctx: &mut PluginCtx, reg: Reg, ptr: *const T) {
    emit_set_reg(ctx, reg, ptr as usize);
}

/// Call a runtime function. Clobbers the link register; arguments go
/// in r0../x0.. per the native calling convention.
pub fn emit_fcall(ctx: &mut PluginCtx, func: usize) {
    let mut w = writer(ctx);
    match ctx.isa {
        Isa::T32 => {
            t32::copy_to_reg(&mut w, LR, func as u32);
            t32::blx_reg(&mut w, LR);
        }
        Isa::A32 => {
            a32::copy_to_reg(&mut w, Cond::Al, LR, func as u32);
            a32::blx_reg(&mut w, Cond::Al, LR);
        }
        Isa::A64 => {
            a64::copy_to_reg(&mut w, X30, func as u64);
            a64::blr(&mut w, X30);
        }
    }
    finish(ctx, w);
}

/// Register move.
pub fn emit_mov(ctx: &mut PluginCtx, rd: Reg, rm: Reg) {
    let mut w = writer(ctx);
    match ctx.isa {
        Isa::T32 => t32::mov_hi(&mut w, rd, rm),
        Isa::A32 => a32::mov_reg(&mut w, Cond::Al, rd, rm),
        Isa::A64 => a64::mov_reg(&mut w, true, rd, rm),
    }
    finish(ctx, w);
}

/// rd = rn + offset (offset may be negative).
pub fn emit_add_sub_i(ctx: &mut PluginCtx, rd: Reg, rn: Reg, offset: i32) {
    let mut w = writer(ctx);
    let mag = offset.unsigned_abs();
    match ctx.isa {
        Isa::T32 => {
            if offset >= 0 {
                t32::add_imm12(&mut w, rd, rn, mag);
            } else {
                t32::sub_imm12(&mut w, rd, rn, mag);
            }
        }
        Isa::A32 => {
            debug_assert!(mag < 256);
            if offset >= 0 {
                a32::add_imm(&mut w, Cond::Al, rd, rn, mag as u8);
            } else {
                a32::sub_imm(&mut w, Cond::Al, rd, rn, mag as u8);
            }
        }
        Isa::A64 => {
            if offset >= 0 {
                a64::add_imm(&mut w, true, rd, rn, mag);
            } else {
                a64::sub_imm(&mut w, true, rd, rn, mag);
            }
        }
    }
    finish(ctx, w);
}

/// rd = rn + rm, with an optional left shift of rm.
pub fn emit_add_shift(ctx: &mut PluginCtx, rd: Reg, rn: Reg, rm: Reg, lsl: u8) {
    let mut w = writer(ctx);
    match ctx.isa {
        Isa::T32 => t32::add_reg(&mut w, rd, rn, rm, lsl),
        Isa::A32 => {
            debug_assert!(lsl == 0);
            a32::add_reg(&mut w, Cond::Al, rd, rn, rm);
        }
        Isa::A64 => a64::add_reg(&mut w, true, rd, rn, rm, lsl),
    }
    finish(ctx, w);
}

/// rd = rn + rm.
pub fn emit_add_sub(ctx: &mut PluginCtx, rd: Reg, rn: Reg, rm: Reg) {
    emit_add_shift(ctx, rd, rn, rm, 0);
}

/// Materialise the effective address of the load/store currently being
/// translated into `reg`. Fails when the instruction is not a
/// load/store the codec exposes operands for.
pub fn calc_ld_st_addr(ctx: &mut PluginCtx, reg: Reg) -> Result<(), ()> {
    let ld_st = ctx.ld_st.ok_or(())?;
    if ld_st.rn == PC {
        // Literal access: the pool address is a constant.
        let base = match ctx.isa {
            Isa::T32 => ((ctx.read_addr & !1) + 4) & !3,
            Isa::A32 => ctx.read_addr + 8,
            Isa::A64 => ctx.read_addr,
        };
        emit_set_reg(ctx, reg, (base as i64 + ld_st.imm as i64) as usize);
        return Ok(());
    }
    if let Some((rm, lsl)) = ld_st.reg_offset {
        emit_add_shift(ctx, reg, ld_st.rn, rm, lsl);
        if ld_st.imm != 0 {
            emit_add_sub_i(ctx, reg, reg, ld_st.imm);
        }
    } else if ld_st.imm != 0 {
        emit_add_sub_i(ctx, reg, ld_st.rn, ld_st.imm);
    } else {
        emit_mov(ctx, reg, ld_st.rn);
    }
    Ok(())
}

/// Emit a 64-bit in-memory counter increment. Self-contained: spills
/// and restores the registers it uses.
pub fn emit_counter64_incr(ctx: &mut PluginCtx, counter: usize, incr: u8) {
    let mut w = writer(ctx);
    match ctx.isa {
        Isa::T32 => {
            // r3 shelters the guest's flags across the ADDS/ADC pair.
            t32::push16(&mut w, 0xF); // r0-r3
            t32::mrs_apsr(&mut w, 3);
            t32::copy_to_reg(&mut w, 2, counter as u32);
            t32::ldr_imm12(&mut w, 0, 2, 0);
            t32::ldr_imm12(&mut w, 1, 2, 4);
            t32::adds_imm16(&mut w, 0, incr);
            t32::adc_imm8(&mut w, 1, 1, 0);
            t32::str_imm12(&mut w, 0, 2, 0);
            t32::str_imm12(&mut w, 1, 2, 4);
            t32::msr_apsr(&mut w, 3);
            t32::pop16(&mut w, 0xF);
        }
        Isa::A32 => {
            a32::push(&mut w, Cond::Al, 0xF);
            a32::mrs(&mut w, Cond::Al, 3);
            a32::copy_to_reg(&mut w, Cond::Al, 2, counter as u32);
            a32::ldr_imm(&mut w, Cond::Al, 0, 2, 0, true, false);
            a32::ldr_imm(&mut w, Cond::Al, 1, 2, 4, true, false);
            a32::adds_imm(&mut w, Cond::Al, 0, 0, incr);
            a32::adc_imm(&mut w, Cond::Al, 1, 1, 0);
            a32::str_imm(&mut w, Cond::Al, 0, 2, 0);
            a32::str_imm(&mut w, Cond::Al, 1, 2, 4);
            a32::msr_flags(&mut w, Cond::Al, 3);
            a32::pop(&mut w, Cond::Al, 0xF);
        }
        Isa::A64 => {
            a64::stp_pre(&mut w, 0, 1, 31, -16);
            a64::copy_to_reg(&mut w, 0, counter as u64);
            a64::ldr_imm(&mut w, true, 1, 0, 0);
            a64::add_imm(&mut w, true, 1, 1, incr as u32);
            a64::str_imm(&mut w, true, 1, 0, 0);
            a64::ldp_post(&mut w, 0, 1, 31, 16);
        }
    }
    finish(ctx, w);
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbm_core::code_cache::CodeCache;
    use dbm_core::thread::{Arch, ThreadData};

    fn ctx_at<'a>(
        thread: &'a mut ThreadData,
        isa: Isa,
        buf: &mut [u8],
    ) -> PluginCtx<'a> {
        let mut ctx = PluginCtx::for_event(thread, isa);
        ctx.write_addr = buf.as_mut_ptr() as usize;
        ctx
    }

    #[test]
    fn counter_incr_is_self_contained_t32() {
        let cache = CodeCache::with_slots(4).unwrap();
        let mut td = ThreadData::with_cache(Arch::Aarch32, 0, cache).unwrap();
        let mut buf = [0u8; 64];
        let mut ctx = ctx_at(&mut td, Isa::T32, &mut buf);
        let start = ctx.write_addr;
        emit_counter64_incr(&mut ctx, 0x1000_0000, 1);
        let len = ctx.write_addr - start;
        assert!(len > 0 && len % 2 == 0);
        // First emitted instruction is the spill, last is the reload.
        assert_eq!(u16::from_le_bytes([buf[0], buf[1]]), 0xB40F);
        assert_eq!(
            u16::from_le_bytes([buf[len - 2], buf[len - 1]]),
            0xBC0F
        );
    }

    #[test]
    fn fcall_sets_lr_then_branches() {
        let cache = CodeCache::with_slots(4).unwrap();
        let mut td = ThreadData::with_cache(Arch::Aarch64, 0, cache).unwrap();
        let mut buf = [0u8; 64];
        let mut ctx = ctx_at(&mut td, Isa::A64, &mut buf);
        let start = ctx.write_addr;
        emit_fcall(&mut ctx, 0xdead_beef);
        let len = ctx.write_addr - start;
        // 4 moves + BLR
        assert_eq!(len, 20);
        let last = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        assert_eq!(last, 0xD63F_0000 | (30 << 5));
    }

    #[test]
    fn a64_push_pop_pairs() {
        let cache = CodeCache::with_slots(4).unwrap();
        let mut td = ThreadData::with_cache(Arch::Aarch64, 0, cache).unwrap();
        let mut buf = [0u8; 64];
        let mut ctx = ctx_at(&mut td, Isa::A64, &mut buf);
        let start = ctx.write_addr;
        emit_push(&mut ctx, 0b111); // x0, x1, x2
        let pushed = ctx.write_addr - start;
        assert_eq!(pushed, 8); // one STP + one STR
        emit_pop(&mut ctx, 0b111);
        assert_eq!(ctx.write_addr - start, 16);
    }

    #[test]
    fn calc_ld_st_addr_forms() {
        use crate::context::LdStOperands;
        let cache = CodeCache::with_slots(4).unwrap();
        let mut td = ThreadData::with_cache(Arch::Aarch32, 0, cache).unwrap();
        let mut buf = [0u8; 64];
        let mut ctx = ctx_at(&mut td, Isa::T32, &mut buf);
        assert!(calc_ld_st_addr(&mut ctx, 0).is_err());

        ctx.inst_class = crate::inst_class::LOAD_STORE;
        ctx.ld_st = Some(LdStOperands {
            rn: 3,
            imm: 8,
            reg_offset: None,
        });
        let start = ctx.write_addr;
        assert!(calc_ld_st_addr(&mut ctx, 0).is_ok());
        assert_eq!(ctx.write_addr - start, 4); // one ADDW
    }
}
