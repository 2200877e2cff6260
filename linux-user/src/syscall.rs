//! Syscall interposer.
//!
//! The translated SVC sequence spills the caller-saved file and calls
//! the wrapper trampoline, which lands here with a pointer to the
//! saved registers. The interposer rewrites the calls the runtime
//! must observe (thread creation, teardown, signal handlers, mapping
//! permissions, cache flushes), forwards everything else to the host
//! kernel unchanged, and delivers the syscall plugin events around
//! the decision.

use dbm_api::context::{PluginCtx, SyscallArgs};
use dbm_api::{installed_plugins, CbEvent};
use dbm_core::thread::Arch;
use dbm_core::{GuestAddr, ThreadData};
use dbm_exec::{flush_code_cache, lookup_or_scan};

use crate::thread::{clone_thread, exit_thread};

// AArch64 syscall numbers.
mod nr64 {
    pub const CLONE: usize = 220;
    pub const EXIT: usize = 93;
    pub const EXIT_GROUP: usize = 94;
    pub const RT_SIGACTION: usize = 134;
    pub const MPROTECT: usize = 226;
    pub const MUNMAP: usize = 215;
    pub const MMAP: usize = 222;
    pub const CLOSE: usize = 57;
}

// 32-bit ARM (EABI) syscall numbers.
mod nr32 {
    pub const CLONE: usize = 120;
    pub const EXIT: usize = 1;
    pub const EXIT_GROUP: usize = 248;
    pub const RT_SIGACTION: usize = 174;
    pub const MPROTECT: usize = 125;
    pub const MUNMAP: usize = 91;
    pub const MMAP2: usize = 192;
    pub const CLOSE: usize = 6;
    pub const VFORK: usize = 190;
    pub const CACHEFLUSH: usize = 0x0f0002;
    pub const SET_TLS: usize = 0x0f0005;
}

const CLONE_VM: usize = 0x100;
const CLONE_VFORK: usize = 0x4000;
const CLONE_SETTLS: usize = 0x0008_0000;

/// Outcome of the pre-syscall pass.
pub enum PreOutcome {
    /// Execute the syscall, then run the post pass.
    Execute,
    /// Skip the syscall; the return value is already in `args[0]`.
    Skip,
}

/// Rewrite or intercept one guest syscall before it reaches the
/// kernel. `args[0]` doubles as the return slot when skipping.
pub fn syscall_pre(
    thread: &mut ThreadData,
    no: usize,
    args: &mut [usize; 6],
    next_pc: GuestAddr,
) -> PreOutcome {
    let plugins = installed_plugins();
    let isa = dbm_scanner::isa_for(thread.arch, next_pc);
    for (id, plugin) in plugins.iter().enumerate() {
        let Some(cb) = plugin.cbs[CbEvent::PreSyscall as usize] else {
            continue;
        };
        let mut ctx = PluginCtx::for_event(thread, isa);
        ctx.plugin_id = id;
        ctx.syscall = Some(SyscallArgs {
            no,
            args: &mut *args,
        });
        cb(&mut ctx);
        if ctx.skip_syscall {
            return PreOutcome::Skip;
        }
    }

    let is64 = thread.arch == Arch::Aarch64;
    match (no, is64) {
        (nr64::CLONE, true) | (nr32::CLONE, false) => {
            clone_pre(thread, args, next_pc)
        }
        (nr64::EXIT, true) | (nr32::EXIT, false) => exit_thread(thread, args[0] as i32),
        (nr64::EXIT_GROUP, true) | (nr32::EXIT_GROUP, false) => {
            log::debug!("exit_group({})", args[0]);
            if crate::PRINT_STATS.load(std::sync::atomic::Ordering::Relaxed) {
                eprint!("{}", thread.stats);
            }
            std::process::exit(args[0] as i32);
        }
        (nr64::RT_SIGACTION, true) | (nr32::RT_SIGACTION, false) => {
            sigaction_pre(thread, args);
            PreOutcome::Execute
        }
        (nr64::MPROTECT, true)
        | (nr32::MPROTECT, false)
        | (nr64::MMAP, true)
        | (nr32::MMAP2, false) => {
            // Strip execute permission from guest mappings so stray
            // branches to untranslated code fault deterministically.
            // Page permissions are the third argument for both calls.
            if args[2] & libc::PROT_EXEC as usize != 0 {
                assert!(
                    args[2] & libc::PROT_READ as usize != 0,
                    "executable guest mapping without read permission"
                );
                args[2] &= !(libc::PROT_EXEC as usize);
            }
            PreOutcome::Execute
        }
        (nr64::MUNMAP, true) | (nr32::MUNMAP, false) => {
            // The unmapped range may hold translated code.
            flush_code_cache(thread);
            PreOutcome::Execute
        }
        (nr64::CLOSE, true) | (nr32::CLOSE, false) => {
            if args[0] <= 2 {
                // Keep the runtime's stdio alive.
                args[0] = 0;
                PreOutcome::Skip
            } else {
                PreOutcome::Execute
            }
        }
        (nr32::VFORK, false) => {
            assert!(!thread.is_vfork_child);
            thread.is_vfork_child = true;
            // Parent and child share the scratch area until the child
            // execs or exits.
            thread.parent_scratch_regs = *thread.scratch_regs();
            PreOutcome::Execute
        }
        (nr32::CACHEFLUSH, false) => {
            // Returning into the calling fragment would be unsafe:
            // its contents or its links may be stale.
            flush_code_cache(thread);
            args[0] = 0;
            PreOutcome::Skip
        }
        (nr32::SET_TLS, false) => {
            thread.tls = args[0];
            args[0] = 0;
            PreOutcome::Skip
        }
        _ => PreOutcome::Execute,
    }
}

/// Observe a completed syscall.
pub fn syscall_post(
    thread: &mut ThreadData,
    no: usize,
    args: &mut [usize; 6],
    next_pc: GuestAddr,
) {
    let is64 = thread.arch == Arch::Aarch64;
    match (no, is64) {
        (nr64::CLONE, true) | (nr32::CLONE, false) => {
            if args[0] == 0 {
                // Child of a non-CLONE_VM clone: a separate address
                // space, no synchronisation needed.
                assert!(!thread.clone_vm);
                thread.tls = thread.child_tls;
            }
        }
        (nr32::VFORK, false) => {
            if args[0] != 0 {
                // Back in the parent: reclaim the shared scratch area.
                *thread.scratch_regs_mut() = thread.parent_scratch_regs;
                thread.is_vfork_child = false;
            }
        }
        _ => {}
    }

    let plugins = installed_plugins();
    let isa = dbm_scanner::isa_for(thread.arch, next_pc);
    for (id, plugin) in plugins.iter().enumerate() {
        let Some(cb) = plugin.cbs[CbEvent::PostSyscall as usize] else {
            continue;
        };
        let mut ctx = PluginCtx::for_event(thread, isa);
        ctx.plugin_id = id;
        ctx.syscall = Some(SyscallArgs {
            no,
            args: &mut *args,
        });
        cb(&mut ctx);
    }
}

fn clone_pre(
    thread: &mut ThreadData,
    args: &mut [usize; 6],
    next_pc: GuestAddr,
) -> PreOutcome {
    // clone(flags, child_stack, ptid, tls, ctid) on both guest ABIs.
    let mut flags = args[0];
    let child_stack = args[1];

    if flags & CLONE_VFORK != 0 {
        flags &= !CLONE_VM;
        args[0] = flags;
    }
    if flags & CLONE_VM != 0 {
        let tls = if flags & CLONE_SETTLS != 0 {
            args[3]
        } else {
            thread.tls
        };
        thread.clone_vm = true;
        let child_tid = clone_thread(thread, next_pc, flags, child_stack, args[2], args[4], tls);
        args[0] = child_tid as usize;
        return PreOutcome::Skip;
    }
    // Fork semantics: the child inherits a copy of the cache.
    thread.child_tls = if flags & CLONE_SETTLS != 0 {
        args[3]
    } else {
        thread.tls
    };
    args[0] = flags & !CLONE_SETTLS;
    thread.clone_vm = false;
    PreOutcome::Execute
}

/// Translate a registered signal handler through the cache so signals
/// arrive at translated code.
fn sigaction_pre(thread: &mut ThreadData, args: &mut [usize; 6]) {
    let act = args[1] as *mut usize;
    if act.is_null() {
        return;
    }
    // SAFETY: the guest passed this pointer to the kernel; the
    // handler field is the first word of struct sigaction.
    unsafe {
        let handler = act.read();
        let sig_dfl = libc::SIG_DFL as usize;
        let sig_ign = libc::SIG_IGN as usize;
        if handler != sig_dfl && handler != sig_ign {
            let translated = lookup_or_scan(&mut *thread, handler);
            act.write(translated);
        }
    }
}

/// C-ABI handler the syscall-wrapper trampoline calls. `regs` points
/// at the spilled caller-saved file; `regs[0]` receives the result.
///
/// # Safety
/// Called only from the wrapper trampoline with this thread's state.
pub unsafe extern "C" fn syscall_handler(
    regs: *mut usize,
    next_pc: usize,
    thread: *mut ThreadData,
) {
    let thread = &mut *thread;
    let (no, mut args) = match thread.arch {
        Arch::Aarch64 => {
            let no = regs.add(8).read();
            let mut a = [0usize; 6];
            for (i, slot) in a.iter_mut().enumerate() {
                *slot = regs.add(i).read();
            }
            (no, a)
        }
        Arch::Aarch32 => {
            let no = regs.add(7).read();
            let mut a = [0usize; 6];
            for (i, slot) in a.iter_mut().enumerate() {
                *slot = regs.add(i).read();
            }
            (no, a)
        }
    };

    match syscall_pre(thread, no, &mut args, next_pc) {
        PreOutcome::Skip => {
            regs.write(args[0]);
        }
        PreOutcome::Execute => {
            // Arguments may have been rewritten; issue the call.
            let ret = libc::syscall(
                no as libc::c_long,
                args[0],
                args[1],
                args[2],
                args[3],
                args[4],
                args[5],
            );
            args[0] = ret as usize;
            syscall_post(thread, no, &mut args, next_pc);
            regs.write(args[0]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbm_core::code_cache::CodeCache;

    fn thread64() -> ThreadData {
        let cache = CodeCache::with_slots(32).unwrap();
        ThreadData::with_cache(Arch::Aarch64, 0, cache).unwrap()
    }

    fn thread32() -> ThreadData {
        let cache = CodeCache::with_slots(32).unwrap();
        ThreadData::with_cache(Arch::Aarch32, 0, cache).unwrap()
    }

    #[test]
    fn mprotect_strips_exec() {
        let mut td = thread64();
        let mut args = [0x1_0000, 0x1000, (libc::PROT_READ | libc::PROT_EXEC) as usize, 0, 0, 0];
        assert!(matches!(
            syscall_pre(&mut td, nr64::MPROTECT, &mut args, 0x1000),
            PreOutcome::Execute
        ));
        assert_eq!(args[2], libc::PROT_READ as usize);
    }

    #[test]
    fn mmap2_strips_exec_on_arm() {
        let mut td = thread32();
        let mut args = [0, 0x1000, (libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC) as usize, 0, 0, 0];
        assert!(matches!(
            syscall_pre(&mut td, nr32::MMAP2, &mut args, 0x1000),
            PreOutcome::Execute
        ));
        assert_eq!(
            args[2],
            (libc::PROT_READ | libc::PROT_WRITE) as usize
        );
    }

    #[test]
    fn stdio_close_is_skipped() {
        let mut td = thread64();
        for fd in 0..=2usize {
            let mut args = [fd, 0, 0, 0, 0, 0];
            assert!(matches!(
                syscall_pre(&mut td, nr64::CLOSE, &mut args, 0x1000),
                PreOutcome::Skip
            ));
            assert_eq!(args[0], 0);
        }
        let mut args = [3, 0, 0, 0, 0, 0];
        assert!(matches!(
            syscall_pre(&mut td, nr64::CLOSE, &mut args, 0x1000),
            PreOutcome::Execute
        ));
    }

    #[test]
    fn set_tls_updates_shadow() {
        let mut td = thread32();
        let mut args = [0xDEAD_0000, 0, 0, 0, 0, 0];
        assert!(matches!(
            syscall_pre(&mut td, nr32::SET_TLS, &mut args, 0x1001),
            PreOutcome::Skip
        ));
        assert_eq!(td.tls, 0xDEAD_0000);
        assert_eq!(args[0], 0);
    }

    #[test]
    fn cacheflush_triggers_full_flush() {
        let mut td = thread32();
        td.free_block = 5;
        assert!(td.entry_address.insert(0x1001, 0x2000));
        let mut args = [0, 0, 0, 0, 0, 0];
        assert!(matches!(
            syscall_pre(&mut td, nr32::CACHEFLUSH, &mut args, 0x1001),
            PreOutcome::Skip
        ));
        assert_eq!(td.free_block, 0);
        assert!(td.entry_address.is_empty());
        assert_eq!(td.stats.flushes, 1);
    }

    #[test]
    fn vfork_stages_scratch_registers() {
        let mut td = thread32();
        td.scratch_regs_mut().copy_from_slice(&[1, 2, 3]);
        let mut args = [0; 6];
        assert!(matches!(
            syscall_pre(&mut td, nr32::VFORK, &mut args, 0x1001),
            PreOutcome::Execute
        ));
        assert!(td.is_vfork_child);
        assert_eq!(td.parent_scratch_regs, [1, 2, 3]);

        // The child ran and trashed the shared scratch area.
        td.scratch_regs_mut().copy_from_slice(&[9, 9, 9]);
        let mut args = [42, 0, 0, 0, 0, 0]; // parent sees the child pid
        syscall_post(&mut td, nr32::VFORK, &mut args, 0x1001);
        assert!(!td.is_vfork_child);
        assert_eq!(*td.scratch_regs(), [1, 2, 3]);
    }
}
