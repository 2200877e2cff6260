//! Memory tracer: logs the effective address of every load and store
//! through a per-thread buffer flushed by an emitted call.

use dbm_api::emit::{
    calc_ld_st_addr, emit_fcall, emit_pop, emit_push, emit_set_reg,
};
use dbm_api::{CbEvent, Plugin, PluginCtx, RegistryBuilder};
use dbm_core::fragment::Isa;
use dbm_core::regs::{LR, X30};

const BUFLEN: usize = 4096;

struct MtraceBuf {
    len: usize,
    entries: Box<[usize; BUFLEN]>,
}

fn print_buf(buf: &mut MtraceBuf) {
    // Writing text per entry is slow; real consumers should process
    // the buffer in memory or emit raw binary.
    for addr in &buf.entries[..buf.len] {
        eprintln!("{addr:#x}");
    }
    buf.len = 0;
}

/// Called from translated code with the traced address.
extern "C" fn mtrace_buf_write(value: usize, buf: *mut MtraceBuf) {
    // SAFETY: the emitted call passes the address of this thread's
    // live buffer.
    let buf = unsafe { &mut *buf };
    buf.entries[buf.len] = value;
    buf.len += 1;
    if buf.len == BUFLEN {
        print_buf(buf);
    }
}

fn pre_thread(ctx: &mut PluginCtx) {
    ctx.set_plugin_data(MtraceBuf {
        len: 0,
        entries: Box::new([0; BUFLEN]),
    });
}

fn post_thread(ctx: &mut PluginCtx) {
    if let Some(mut buf) = ctx.take_plugin_data::<MtraceBuf>() {
        print_buf(&mut buf);
    }
}

fn pre_inst(ctx: &mut PluginCtx) {
    if !ctx.is_load_or_store() {
        return;
    }
    let buf_ptr = match ctx.plugin_data::<MtraceBuf>() {
        Some(buf) => buf as *const MtraceBuf as usize,
        None => return,
    };
    let lr = if ctx.isa == Isa::A64 { X30 } else { LR };
    let saved = 0b111 | (1u32 << lr);

    emit_push(ctx, saved);
    if calc_ld_st_addr(ctx, 0).is_ok() {
        emit_set_reg(ctx, 1, buf_ptr);
        emit_fcall(ctx, mtrace_buf_write as usize);
    }
    emit_pop(ctx, saved);
}

/// Register the memory tracer; returns its plugin id.
pub fn register(builder: &mut RegistryBuilder) -> usize {
    builder.add(
        Plugin::new("mtrace")
            .on(CbEvent::PreThread, pre_thread)
            .on(CbEvent::PostThread, post_thread)
            .on(CbEvent::PreInst, pre_inst),
    )
}
