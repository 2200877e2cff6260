use std::path::PathBuf;
use std::process;

use anyhow::{bail, Result};
use clap::Parser;

use dbm_api::{installed_plugins, CbEvent, RegistryBuilder};
use dbm_core::thread::Arch;
use dbm_exec::{enter_cache, lookup_or_scan};
use dbm_linux_user::loader;
use dbm_linux_user::thread::new_thread_data;
use dbm_scanner::callbacks::deliver_thread_cbs;

/// Dynamic binary modification runtime for ARM and AArch64 Linux
/// programs.
#[derive(Parser)]
#[command(name = "dbm", version, about)]
struct Cli {
    /// Static guest executable to run.
    program: PathBuf,

    /// Arguments passed through to the guest.
    #[arg(trailing_var_arg = true)]
    args: Vec<String>,

    /// Count executed branches by kind.
    #[arg(long)]
    count_branches: bool,

    /// Trace the address of every guest load and store.
    #[arg(long)]
    mtrace: bool,

    /// Print dispatch statistics on exit.
    #[arg(long)]
    stats: bool,
}

fn main() {
    env_logger::init();
    if let Err(err) = run(Cli::parse()) {
        eprintln!("dbm: {err:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut registry = RegistryBuilder::new();
    if cli.count_branches {
        dbm_plugins::branch_count::register(&mut registry);
    }
    if cli.mtrace {
        dbm_plugins::mtrace::register(&mut registry);
    }
    registry.install();

    let program = cli.program.to_string_lossy().into_owned();
    let mut argv: Vec<&str> = vec![&program];
    argv.extend(cli.args.iter().map(String::as_str));
    let envp: Vec<String> = std::env::vars()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    let envp: Vec<&str> = envp.iter().map(String::as_str).collect();

    let info = loader::load(&cli.program, &argv, &envp)?;
    let arch = if info.is_aarch64 {
        Arch::Aarch64
    } else {
        Arch::Aarch32
    };
    if cfg!(target_arch = "aarch64") != info.is_aarch64 {
        bail!(
            "host and guest architectures differ; this runtime rewrites \
             same-ISA code in place"
        );
    }

    let mut thread = new_thread_data(arch)?;
    thread.tls = 0;
    // SAFETY: gettid has no failure modes.
    thread.tid = unsafe { libc::syscall(libc::SYS_gettid) } as i32;

    let isa = dbm_scanner::isa_for(arch, info.entry);
    deliver_thread_cbs(&mut thread, installed_plugins(), CbEvent::PreThread, isa);

    dbm_linux_user::PRINT_STATS.store(cli.stats, std::sync::atomic::Ordering::Relaxed);

    let entry = lookup_or_scan(&mut thread, info.entry);
    log::debug!(
        "entering cache at {entry:#x} for guest entry {:#x}",
        info.entry
    );

    let mut regs = Box::new([0usize; 32]);
    match arch {
        Arch::Aarch32 => regs[13] = info.sp,
        Arch::Aarch64 => regs[31] = info.sp,
    }

    // The thread state and register file live for the process
    // lifetime; the guest leaves through exit_group.
    let regs = Box::leak(regs);
    std::mem::forget(thread);
    // SAFETY: regs is a fully initialised register file and entry a
    // valid fragment address.
    unsafe { enter_cache(regs.as_ptr(), entry) }
}
