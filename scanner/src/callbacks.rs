//! Plugin callback delivery from the scan loop.

use dbm_api::context::{LdStOperands, PluginCtx};
use dbm_api::{CbEvent, Plugin};
use dbm_core::fragment::{Cond, Isa};
use dbm_core::{CachePressure, GuestAddr, ThreadData};

use crate::common::{check_free_space, ScanCursors, PLUGIN_HEADROOM};
use crate::it_state::ItState;

/// Deliver `PRE_INST` / `POST_INST` callbacks around one guest
/// instruction. Returns whether a `PRE_INST` callback replaced the
/// instruction.
///
/// Inserted code splits an in-flight IT block: the wrapper is clipped
/// to the already-emitted instructions and reopened after the
/// insertion; a replaced instruction additionally drops its condition
/// slot from the reopened wrapper.
#[allow(clippy::too_many_arguments)]
pub fn deliver_inst_cbs(
    thread: &mut ThreadData,
    plugins: &'static [Plugin],
    event: CbEvent,
    cursors: &mut ScanCursors,
    it: Option<&mut ItState>,
    isa: Isa,
    basic_block: usize,
    read_addr: GuestAddr,
    inst_class: u32,
    ld_st: Option<LdStOperands>,
) -> Result<bool, CachePressure> {
    if plugins.is_empty() {
        return Ok(false);
    }
    let mut it = it;
    let mut replaced = false;

    let cond = it
        .as_deref()
        .map(|st| st.cur_cond())
        .unwrap_or(Cond::Al);

    // If the previous emitted instruction was the IT itself, let the
    // inserted code overwrite it; it is re-emitted by `close_gap`.
    if let Some(st) = it.as_deref_mut() {
        if st.active() && st.it_inst_addr == cursors.write - 2 && !st.overwritten {
            cursors.write = st.it_inst_addr;
            st.overwritten = true;
        }
    }
    let write_before = cursors.write;

    for (id, plugin) in plugins.iter().enumerate() {
        let Some(cb) = plugin.cbs[event as usize] else {
            continue;
        };
        let mut ctx = PluginCtx::for_event(thread, isa);
        ctx.plugin_id = id;
        ctx.fragment = basic_block;
        ctx.cond = cond;
        ctx.inst_class = inst_class;
        ctx.read_addr = read_addr;
        ctx.write_addr = cursors.write;
        ctx.ld_st = ld_st;
        let prev_write = ctx.write_addr;
        cb(&mut ctx);

        if ctx.replace {
            if event == CbEvent::PreInst {
                if replaced && ctx.write_addr != prev_write {
                    log::warn!(
                        "plugin '{}' added code for an instruction already \
                         replaced at {read_addr:#x}",
                        plugin.name
                    );
                }
                replaced = true;
            } else {
                log::warn!(
                    "plugin '{}' set replace outside PRE_INST at {read_addr:#x}",
                    plugin.name
                );
            }
        }
        cursors.write = ctx.write_addr;
        check_free_space(thread, cursors, None, isa, PLUGIN_HEADROOM)?;
    }

    if let Some(st) = it.as_deref_mut() {
        if st.active() {
            if cursors.write != write_before || replaced {
                // Code was inserted (or the guest instruction and its
                // condition slot vanished): split the wrapper.
                st.create_gap(&mut cursors.write);
                if replaced {
                    // The replaced instruction's condition slot is
                    // consumed by the plugin code.
                    st.advance();
                }
                if st.active() {
                    st.close_gap(&mut cursors.write);
                }
            } else if st.overwritten {
                // Nothing inserted: keep the original IT.
                cursors.write += 2;
                st.overwritten = false;
            }
        }
    }

    Ok(replaced)
}

/// Deliver a thread lifecycle event (`PRE_THREAD` / `POST_THREAD`).
pub fn deliver_thread_cbs(
    thread: &mut ThreadData,
    plugins: &'static [Plugin],
    event: CbEvent,
    isa: Isa,
) {
    for (id, plugin) in plugins.iter().enumerate() {
        let Some(cb) = plugin.cbs[event as usize] else {
            continue;
        };
        let mut ctx = PluginCtx::for_event(thread, isa);
        ctx.plugin_id = id;
        cb(&mut ctx);
    }
}
