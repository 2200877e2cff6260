//! Linux user-mode layer: ELF loading, the syscall interposer and
//! guest thread lifecycle.

pub mod elf;
pub mod loader;
pub mod syscall;
pub mod thread;

use std::sync::atomic::AtomicBool;

/// Print per-thread dispatch statistics on guest exit.
pub static PRINT_STATS: AtomicBool = AtomicBool::new(false);
