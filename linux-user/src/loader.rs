//! Process bootstrap: map a static executable in place, build the
//! initial guest stack and derive the entry state.
//!
//! The runtime shares the guest's address space, so PT_LOAD segments
//! are mapped at their link addresses with `MAP_FIXED`. `PROT_EXEC`
//! is stripped from every guest mapping: stray branches into
//! untranslated code must fault deterministically.

use std::fs;
use std::path::Path;
use std::ptr;

use anyhow::{bail, Context, Result};

use crate::elf::{self, ElfImage, AT_ENTRY, AT_NULL, AT_PAGESZ, AT_PHDR, AT_PHENT, AT_PHNUM, AT_RANDOM, PF_W};

/// Default guest stack size: 8 MiB.
const GUEST_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Loaded-image summary handed to the runtime.
#[derive(Debug)]
pub struct LoadInfo {
    /// Entry guest PC; bit 0 set for a Thumb entry point.
    pub entry: usize,
    /// Initial guest stack pointer.
    pub sp: usize,
    /// Program break after the highest segment.
    pub brk: usize,
    pub is_aarch64: bool,
}

fn page_size() -> usize {
    // SAFETY: sysconf is always safe to call.
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz <= 0 {
        4096
    } else {
        sz as usize
    }
}

pub fn page_align_up(addr: usize) -> usize {
    let ps = page_size();
    (addr + ps - 1) & !(ps - 1)
}

pub fn page_align_down(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

/// Map one segment at its link address, without execute permission.
fn map_segment(data: &[u8], seg: &elf::Segment) -> Result<()> {
    let start = page_align_down(seg.vaddr);
    let end = page_align_up(seg.vaddr + seg.memsz);
    // Writable while we copy; final protection applied below.
    // SAFETY: fixed anonymous mapping at the executable's link
    // address, which the kernel keeps clear of runtime mappings for
    // well-formed static binaries.
    let ptr = unsafe {
        libc::mmap(
            start as *mut libc::c_void,
            end - start,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("mapping segment at {start:#x}"));
    }
    // SAFETY: the region was just mapped writable.
    unsafe {
        ptr::copy_nonoverlapping(
            data[seg.offset..].as_ptr(),
            seg.vaddr as *mut u8,
            seg.filesz,
        );
    }
    let mut prot = libc::PROT_READ;
    if seg.flags & PF_W != 0 {
        prot |= libc::PROT_WRITE;
    }
    // PROT_EXEC deliberately omitted.
    // SAFETY: protecting the region mapped above.
    let ret = unsafe { libc::mprotect(start as *mut libc::c_void, end - start, prot) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error()).context("segment mprotect");
    }
    Ok(())
}

/// Build the initial stack: argv strings, envp strings, auxv, then
/// the argc/argv/envp vectors, descending. Returns the final SP.
fn build_stack(
    image: &ElfImage,
    stack_top: usize,
    argv: &[&str],
    envp: &[&str],
    load_base_phdr: usize,
) -> usize {
    let word = if image.is_aarch64() { 8 } else { 4 };
    let mut sp = stack_top;

    let write_word = |at: usize, val: usize| {
        // SAFETY: inside the freshly mapped stack region.
        unsafe {
            if word == 8 {
                (at as *mut u64).write_unaligned(val as u64);
            } else {
                (at as *mut u32).write_unaligned(val as u32);
            }
        }
    };

    let push_bytes = |sp: &mut usize, bytes: &[u8]| -> usize {
        *sp -= bytes.len() + 1;
        // SAFETY: inside the stack region.
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), *sp as *mut u8, bytes.len());
            (*sp as *mut u8).add(bytes.len()).write(0);
        }
        *sp
    };

    let arg_ptrs: Vec<usize> =
        argv.iter().map(|a| push_bytes(&mut sp, a.as_bytes())).collect();
    let env_ptrs: Vec<usize> =
        envp.iter().map(|e| push_bytes(&mut sp, e.as_bytes())).collect();

    // AT_RANDOM needs 16 bytes the guest may read.
    sp -= 16;
    let random = sp;

    sp &= !15;

    let auxv: [(usize, usize); 7] = [
        (AT_PHDR, load_base_phdr),
        (AT_PHENT, image.phentsize),
        (AT_PHNUM, image.phnum),
        (AT_PAGESZ, page_size()),
        (AT_ENTRY, image.entry),
        (AT_RANDOM, random),
        (AT_NULL, 0),
    ];

    // Vector sizes: argc + argv + NULL + envp + NULL + auxv pairs.
    let vec_words = 1 + arg_ptrs.len() + 1 + env_ptrs.len() + 1 + auxv.len() * 2;
    sp -= vec_words * word;
    sp &= !15;

    let mut at = sp;
    write_word(at, argv.len());
    at += word;
    for p in &arg_ptrs {
        write_word(at, *p);
        at += word;
    }
    write_word(at, 0);
    at += word;
    for p in &env_ptrs {
        write_word(at, *p);
        at += word;
    }
    write_word(at, 0);
    at += word;
    for (key, val) in auxv {
        write_word(at, key);
        at += word;
        write_word(at, val);
        at += word;
    }
    sp
}

/// Load a static executable and prepare its entry state.
pub fn load(path: &Path, argv: &[&str], envp: &[&str]) -> Result<LoadInfo> {
    let data = fs::read(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let image = elf::parse(&data).context("parsing executable")?;
    if image.segments.is_empty() {
        bail!("no loadable segments in {}", path.display());
    }

    let mut brk = 0usize;
    let mut phdr_vaddr = 0usize;
    for seg in &image.segments {
        map_segment(&data, seg)?;
        brk = brk.max(page_align_up(seg.vaddr + seg.memsz));
        // The program headers live inside the first segment that
        // covers their file offset.
        if image.phoff >= seg.offset && image.phoff < seg.offset + seg.filesz {
            phdr_vaddr = seg.vaddr + (image.phoff - seg.offset);
        }
    }

    // Guest stack, mapped well above the image.
    // SAFETY: anonymous private mapping, kernel-chosen placement.
    let stack = unsafe {
        libc::mmap(
            ptr::null_mut(),
            GUEST_STACK_SIZE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
            -1,
            0,
        )
    };
    if stack == libc::MAP_FAILED {
        return Err(std::io::Error::last_os_error()).context("mapping guest stack");
    }
    let stack_top = stack as usize + GUEST_STACK_SIZE;
    let sp = build_stack(&image, stack_top, argv, envp, phdr_vaddr);

    // 32-bit entry points carry the mode in bit 0 already; AArch64
    // entries are plain addresses.
    log::debug!(
        "loaded {}: entry {:#x}, sp {sp:#x}, brk {brk:#x}",
        path.display(),
        image.entry
    );
    Ok(LoadInfo {
        entry: image.entry,
        sp,
        brk,
        is_aarch64: image.is_aarch64(),
    })
}
