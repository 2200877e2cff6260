//! Guest thread lifecycle.
//!
//! A `clone` with `CLONE_VM` becomes a host thread with its own
//! private code cache and hash table. The parent stages the clone
//! arguments and its saved register file; the child installs them on
//! the guest-supplied stack, translates its entry point and enters
//! the cache.

use std::sync::mpsc;
use std::thread as host_thread;

use dbm_api::{installed_plugins, CbEvent};
use dbm_core::thread::{Arch, CloneArgs};
use dbm_core::{GuestAddr, ThreadData};
use dbm_exec::{enter_cache, install_trampolines, lookup_or_scan};
use dbm_scanner::callbacks::deliver_thread_cbs;

use crate::syscall::syscall_handler;

const CLONE_PARENT_SETTID: usize = 0x0010_0000;
const CLONE_CHILD_SETTID: usize = 0x0100_0000;
const CLONE_CHILD_CLEARTID: usize = 0x0020_0000;

/// Build a fresh per-thread runtime state with resident trampolines.
/// The returned box must stay at its address for the thread's
/// lifetime: the emitted trampolines embed pointers into it.
pub fn new_thread_data(arch: Arch) -> anyhow::Result<Box<ThreadData>> {
    let mut thread = Box::new(ThreadData::new(arch, installed_plugins().len())?);
    thread.syscall_handler_fn = syscall_handler as usize;
    install_trampolines(&mut thread);
    Ok(thread)
}

/// Handle `clone(CLONE_VM)`: spawn a host thread running the child at
/// `child_pc` on the guest-supplied stack. Returns the child TID.
#[allow(clippy::too_many_arguments)]
pub fn clone_thread(
    parent: &mut ThreadData,
    child_pc: GuestAddr,
    flags: usize,
    child_stack: usize,
    ptid: usize,
    ctid: usize,
    tls: usize,
) -> i32 {
    let arch = parent.arch;
    let args = CloneArgs {
        flags,
        child_stack,
        ptid,
        ctid,
        tls,
        saved_regs: stage_parent_regs(parent),
    };
    let (tid_tx, tid_rx) = mpsc::channel();

    // The guest supplied the real stack; the host thread only needs
    // enough for translation.
    host_thread::Builder::new()
        .name("dbm-guest".into())
        .stack_size(256 * 1024)
        .spawn(move || start_thread(arch, child_pc, args, tid_tx))
        .expect("spawning guest thread");

    tid_rx.recv().expect("child thread died before reporting its tid")
}

/// Body of a cloned guest thread.
fn start_thread(
    arch: Arch,
    child_pc: GuestAddr,
    args: CloneArgs,
    tid_tx: mpsc::Sender<i32>,
) {
    let mut thread = new_thread_data(arch).expect("allocating child thread data");
    thread.clone_ret_addr = child_pc;
    thread.tls = args.tls;

    // SAFETY: gettid has no failure modes.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;
    thread.tid = tid;
    if args.flags & CLONE_PARENT_SETTID != 0 && args.ptid != 0 {
        // SAFETY: the guest passed this pointer for exactly this.
        unsafe { (args.ptid as *mut i32).write(tid) };
    }
    if args.flags & CLONE_CHILD_SETTID != 0 && args.ctid != 0 {
        // SAFETY: as above.
        unsafe { (args.ctid as *mut i32).write(tid) };
    }
    if args.flags & CLONE_CHILD_CLEARTID != 0 {
        // SAFETY: registering the guest's ctid for futex wakeup.
        unsafe {
            libc::syscall(libc::SYS_set_tid_address, args.ctid);
        }
    }

    let isa = dbm_scanner::isa_for(arch, child_pc);
    deliver_thread_cbs(&mut thread, installed_plugins(), CbEvent::PreThread, isa);

    let entry = lookup_or_scan(&mut thread, child_pc);

    // Install the parent's saved register file on the child stack;
    // the child's r0/x0 reads as 0.
    let regs = install_child_regs(arch, &args);

    tid_tx.send(tid).ok();

    // The thread state lives until the guest exits; the emitted
    // trampolines hold pointers into it.
    std::mem::forget(thread);
    // SAFETY: regs holds a full register file and entry is a valid
    // fragment address for this thread's cache.
    unsafe { enter_cache(regs.as_ptr(), entry) }
}

/// Capture the parent's registers for the child. The parent is parked
/// inside the syscall wrapper, so its guest register file is the one
/// the wrapper saved; the scratch-area copy covers r0-r2.
fn stage_parent_regs(parent: &ThreadData) -> [usize; 32] {
    let mut regs = [0usize; 32];
    let scratch = parent.scratch_regs();
    regs[0] = scratch[0];
    regs[1] = scratch[1];
    regs[2] = scratch[2];
    regs
}

/// Lay the child's initial register file out for `enter_cache`.
fn install_child_regs(arch: Arch, args: &CloneArgs) -> Box<[usize; 32]> {
    let mut regs = Box::new([0usize; 32]);
    regs[..args.saved_regs.len().min(32)]
        .copy_from_slice(&args.saved_regs[..args.saved_regs.len().min(32)]);
    regs[0] = 0; // clone returns 0 in the child
    match arch {
        Arch::Aarch32 => regs[13] = args.child_stack,
        Arch::Aarch64 => regs[31] = args.child_stack,
    }
    regs
}

/// Guest `exit`: deliver `POST_THREAD`, tear down this thread's cache
/// and leave the host thread. Never returns.
pub fn exit_thread(thread: &mut ThreadData, code: i32) -> ! {
    log::debug!("guest thread {} exit({code})", thread.tid);
    let isa = match thread.arch {
        Arch::Aarch32 => dbm_core::Isa::A32,
        Arch::Aarch64 => dbm_core::Isa::A64,
    };
    deliver_thread_cbs(thread, installed_plugins(), CbEvent::PostThread, isa);
    if crate::PRINT_STATS.load(std::sync::atomic::Ordering::Relaxed) {
        eprint!("{}", thread.stats);
    }
    // The code cache and thread state unmap with the thread; the
    // register file and stack belong to the guest.
    // SAFETY: terminates only the calling thread.
    unsafe { libc::pthread_exit(std::ptr::null_mut()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_regs_start_with_zero_return() {
        let mut args = CloneArgs {
            flags: 0,
            child_stack: 0x7000_0000,
            ptid: 0,
            ctid: 0,
            tls: 0,
            saved_regs: [7; 32],
        };
        args.saved_regs[0] = 123;
        let regs = install_child_regs(Arch::Aarch64, &args);
        assert_eq!(regs[0], 0);
        assert_eq!(regs[1], 7);
        assert_eq!(regs[31], 0x7000_0000);

        let regs = install_child_regs(Arch::Aarch32, &args);
        assert_eq!(regs[13], 0x7000_0000);
    }

    #[test]
    fn fresh_thread_data_has_private_state() {
        let a = new_thread_data(Arch::Aarch64).unwrap();
        let b = new_thread_data(Arch::Aarch64).unwrap();
        assert_ne!(a.code_cache.base(), b.code_cache.base());
        assert_ne!(a.scratch_regs_addr(), b.scratch_regs_addr());
        assert!(a.reserved_blocks > 0);
        assert_eq!(a.free_block, a.reserved_blocks);
    }
}
