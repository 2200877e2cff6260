//! Plugin instrumentation properties. This binary installs its own
//! process-global registry, so these scenarios live apart from the
//! plain linking suites.

use std::sync::atomic::{AtomicU64, Ordering};

use dbm_api::emit::{emit_counter64_incr, emit_set_reg};
use dbm_api::{CbEvent, Plugin, PluginCtx, RegistryBuilder};
use dbm_core::thread::Arch;
use dbm_exec::lookup_or_scan;
use dbm_tests::{make_thread_with_plugins, t32_program};

static PRE_CALLS: AtomicU64 = AtomicU64::new(0);
static POST_CALLS: AtomicU64 = AtomicU64::new(0);

fn counting_pre(ctx: &mut PluginCtx) {
    PRE_CALLS.fetch_add(1, Ordering::Relaxed);
    // Inline a counter bump in front of every instruction.
    emit_counter64_incr(ctx, 0x4000_0000, 1);
}

fn counting_post(_ctx: &mut PluginCtx) {
    POST_CALLS.fetch_add(1, Ordering::Relaxed);
}

fn replacing_pre(ctx: &mut PluginCtx) {
    // Replace every instruction with a single materialised constant.
    emit_set_reg(ctx, 0, 0x1234_5678);
    ctx.replace = true;
}

fn install() -> (usize, usize) {
    static INSTALLED: std::sync::OnceLock<(usize, usize)> = std::sync::OnceLock::new();
    *INSTALLED.get_or_init(|| {
        let mut builder = RegistryBuilder::new();
        let counting = builder.add(
            Plugin::new("counting")
                .on(CbEvent::PreInst, counting_pre)
                .on(CbEvent::PostInst, counting_post),
        );
        let replacing =
            builder.add(Plugin::new("replacing").on(CbEvent::PreInst, replacing_pre));
        builder.install();
        (counting, replacing)
    })
}

/// With a replacing plugin registered, the fragment contains only
/// plugin-emitted code plus the exit glue.
#[test]
fn replace_suppresses_scanner_emission() {
    install();
    let mut td = make_thread_with_plugins(Arch::Aarch32, 2);

    // adds r0, #2 ; bx lr
    let pc = t32_program(&[0x3002, 0x4770]);
    let entry = lookup_or_scan(&mut td, pc) & !1;

    // Both instructions hit PRE_INST on both plugins.
    assert!(PRE_CALLS.load(Ordering::Relaxed) >= 2);
    assert!(POST_CALLS.load(Ordering::Relaxed) >= 2);

    // The ADDS (0x3002) must not appear in the fragment: the
    // replacing plugin suppressed the copy. Walk the emitted stream
    // at instruction granularity.
    let mut found_adds = false;
    let mut addr = entry;
    while addr < entry + 160 {
        // SAFETY: reading inside the live code cache.
        let (inst, width) = unsafe { dbm_codec::t32::decode(addr) };
        if inst == dbm_codec::t32::T32Inst::Other16(0x3002) {
            found_adds = true;
        }
        addr += width;
    }
    assert!(!found_adds, "scanner emitted a replaced instruction");

    // The replaced branch still produced exit glue: the fragment has
    // a recorded exit resolving the fall-through.
    assert_ne!(
        td.code_cache_meta[0].exit_branch_type,
        dbm_core::BranchType::Unknown
    );
}

/// Plugin-emitted counter increments are self-contained spill/reload
/// sequences in the fragment.
#[test]
fn counter_sequences_present_in_fragment() {
    install();
    let mut td = make_thread_with_plugins(Arch::Aarch32, 2);
    let pc = t32_program(&[0x3002, 0x4770]);
    let entry = lookup_or_scan(&mut td, pc) & !1;

    // The counting plugin runs before the replacing one, so its
    // PUSH {r0-r3} spill must be present in the stream.
    let mut found_spill = false;
    let mut addr = entry;
    while addr < entry + 160 {
        // SAFETY: reading inside the live code cache.
        let (inst, width) = unsafe { dbm_codec::t32::decode(addr) };
        if inst == dbm_codec::t32::T32Inst::Other16(0xB40F) {
            found_spill = true;
            break;
        }
        addr += width;
    }
    assert!(found_spill, "counter spill missing from fragment");
}
