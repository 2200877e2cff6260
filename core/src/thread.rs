use std::any::Any;
use std::io;

use crate::code_cache::CodeCache;
use crate::fragment::{FragmentMeta, Isa};
use crate::hash_table::HashTable;
use crate::links::LinkRecord;
use crate::stats::DispatchStats;
use crate::GuestAddr;

/// Guest architecture of the whole process. Selects the scanner used
/// for guest addresses with a clear low bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    Aarch32,
    Aarch64,
}

/// Register state staged across a `clone` with `CLONE_VM`.
///
/// The parent fills this in from the syscall arguments and its saved
/// register file; the child thread installs `saved_regs` on the
/// guest-supplied stack before entering the cache.
#[derive(Debug, Clone)]
pub struct CloneArgs {
    pub flags: usize,
    pub child_stack: usize,
    pub ptid: usize,
    pub ctid: usize,
    pub tls: usize,
    pub saved_regs: [usize; 32],
}

/// Per-thread runtime state.
///
/// One code cache and one hash table per thread; nothing here is shared
/// across threads. The scratch save area is only valid between a
/// fragment's exit stub and the dispatcher prologue and must never be
/// observable by guest code.
pub struct ThreadData {
    pub arch: Arch,
    pub code_cache: CodeCache,
    pub entry_address: HashTable,
    pub code_cache_meta: Vec<FragmentMeta>,
    /// Next free fragment slot.
    pub free_block: usize,
    pub cc_links: Vec<LinkRecord>,

    /// Spill slots for the registers saved around indirect dispatch.
    /// Boxed so emitted code can embed a stable address.
    scratch_regs: Box<[usize; 3]>,
    pub parent_scratch_regs: [usize; 3],
    pub is_vfork_child: bool,

    /// Shadow of the guest's virtualised TLS register.
    pub tls: usize,
    pub child_tls: usize,

    pub clone_vm: bool,
    pub clone_ret_addr: GuestAddr,
    pub clone_args: Option<CloneArgs>,
    pub tid: i32,

    /// Host address the exit stubs branch to (T32 or A64 flavour,
    /// matching the thread's architecture).
    pub dispatcher_addr: usize,
    /// A32 flavour of the dispatcher trampoline (32-bit guests only).
    pub dispatcher_arm_addr: usize,
    /// Host address the translated SVC sequence calls.
    pub syscall_wrapper_addr: usize,
    /// Runtime syscall handler the wrapper trampoline calls into.
    pub syscall_handler_fn: usize,
    /// Fragment slots holding the resident trampolines; a cache flush
    /// never reclaims them.
    pub reserved_blocks: usize,

    /// One data slot per registered plugin.
    pub plugin_data: Vec<Option<Box<dyn Any + Send>>>,

    pub stats: DispatchStats,
}

impl ThreadData {
    pub fn new(arch: Arch, nr_plugins: usize) -> io::Result<Self> {
        let code_cache = CodeCache::new()?;
        Self::with_cache(arch, nr_plugins, code_cache)
    }

    pub fn with_cache(
        arch: Arch,
        nr_plugins: usize,
        code_cache: CodeCache,
    ) -> io::Result<Self> {
        let slots = code_cache.slots();
        let default_isa = match arch {
            Arch::Aarch32 => Isa::A32,
            Arch::Aarch64 => Isa::A64,
        };
        let mut plugin_data = Vec::with_capacity(nr_plugins);
        plugin_data.resize_with(nr_plugins, || None);
        Ok(Self {
            arch,
            code_cache,
            entry_address: HashTable::new(),
            code_cache_meta: vec![FragmentMeta::new(default_isa); slots],
            free_block: 0,
            cc_links: Vec::new(),
            scratch_regs: Box::new([0; 3]),
            parent_scratch_regs: [0; 3],
            is_vfork_child: false,
            tls: 0,
            child_tls: 0,
            clone_vm: false,
            clone_ret_addr: 0,
            clone_args: None,
            tid: 0,
            dispatcher_addr: 0,
            dispatcher_arm_addr: 0,
            syscall_wrapper_addr: 0,
            syscall_handler_fn: 0,
            reserved_blocks: 0,
            plugin_data,
            stats: DispatchStats::default(),
        })
    }

    /// Hand out the next fragment slot, or `None` when the arena is
    /// exhausted and a flush is required.
    pub fn allocate_bb(&mut self) -> Option<usize> {
        if self.free_block >= self.code_cache.slots() {
            return None;
        }
        let index = self.free_block;
        self.free_block += 1;
        let isa = match self.arch {
            Arch::Aarch32 => Isa::A32,
            Arch::Aarch64 => Isa::A64,
        };
        self.code_cache_meta[index].reset(isa);
        Some(index)
    }

    /// Stable host address of the scratch save area.
    pub fn scratch_regs_addr(&self) -> usize {
        self.scratch_regs.as_ptr() as usize
    }

    pub fn scratch_regs(&self) -> &[usize; 3] {
        &self.scratch_regs
    }

    pub fn scratch_regs_mut(&mut self) -> &mut [usize; 3] {
        &mut self.scratch_regs
    }

    /// Stable host address of `code_cache_meta[index].rn`, embedded by
    /// the emitted table-branch sequence.
    pub fn meta_rn_addr(&self, index: usize) -> usize {
        &self.code_cache_meta[index].rn as *const u32 as usize
    }

    pub fn record_cc_link(
        &mut self,
        patch_addr: usize,
        is_literal: bool,
        target: GuestAddr,
        isa: Isa,
    ) {
        self.cc_links.push(LinkRecord {
            patch_addr,
            is_literal,
            target,
            isa,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_bb_hands_out_sequential_slots() {
        let cache = CodeCache::with_slots(4).unwrap();
        let mut td = ThreadData::with_cache(Arch::Aarch32, 0, cache).unwrap();
        assert_eq!(td.allocate_bb(), Some(0));
        assert_eq!(td.allocate_bb(), Some(1));
        assert_eq!(td.allocate_bb(), Some(2));
        assert_eq!(td.allocate_bb(), Some(3));
        assert_eq!(td.allocate_bb(), None);
    }

    #[test]
    fn scratch_area_address_is_stable() {
        let cache = CodeCache::with_slots(4).unwrap();
        let mut td = ThreadData::with_cache(Arch::Aarch32, 0, cache).unwrap();
        let before = td.scratch_regs_addr();
        td.scratch_regs_mut()[0] = 0x1234;
        let td = td; // move
        assert_eq!(td.scratch_regs_addr(), before);
        assert_eq!(td.scratch_regs()[0], 0x1234);
    }
}
