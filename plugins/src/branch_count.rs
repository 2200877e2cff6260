//! Branch counter: inlines a 64-bit increment in front of every
//! branch, split by direct / indirect / return.

use dbm_api::emit::emit_counter64_incr;
use dbm_api::{inst_class, CbEvent, Plugin, PluginCtx, RegistryBuilder};

#[derive(Default)]
struct BranchCounters {
    direct: u64,
    indirect: u64,
    returns: u64,
}

fn pre_thread(ctx: &mut PluginCtx) {
    ctx.set_plugin_data(BranchCounters::default());
}

fn post_thread(ctx: &mut PluginCtx) {
    if let Some(c) = ctx.take_plugin_data::<BranchCounters>() {
        eprintln!("direct branches:   {}", c.direct);
        eprintln!("indirect branches: {}", c.indirect);
        eprintln!("returns:           {}", c.returns);
    }
}

fn pre_inst(ctx: &mut PluginCtx) {
    let class = ctx.branch_class();
    let counter = match ctx.plugin_data::<BranchCounters>() {
        Some(c) => {
            if class & inst_class::BRANCH_RETURN != 0 {
                &c.returns as *const u64
            } else if class & inst_class::BRANCH_DIRECT != 0 {
                &c.direct as *const u64
            } else if class & inst_class::BRANCH_INDIRECT != 0 {
                &c.indirect as *const u64
            } else {
                return;
            }
        }
        None => return,
    };
    emit_counter64_incr(ctx, counter as usize, 1);
}

/// Register the branch counter; returns its plugin id.
pub fn register(builder: &mut RegistryBuilder) -> usize {
    builder.add(
        Plugin::new("branch_count")
            .on(CbEvent::PreThread, pre_thread)
            .on(CbEvent::PostThread, post_thread)
            .on(CbEvent::PreInst, pre_inst),
    )
}
