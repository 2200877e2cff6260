use std::any::Any;

use dbm_core::fragment::{Cond, Isa};
use dbm_core::{GuestAddr, ThreadData};

/// Guest syscall number and argument registers, mutable from
/// `PRE_SYSCALL` callbacks.
pub struct SyscallArgs<'a> {
    pub no: usize,
    pub args: &'a mut [usize; 6],
}

/// Operand summary of the load/store the scanner is currently
/// translating, for `calc_ld_st_addr`.
#[derive(Debug, Clone, Copy)]
pub struct LdStOperands {
    pub rn: u8,
    pub imm: i32,
    /// Register offset, shifted left by `1` element: (rm, lsl).
    pub reg_offset: Option<(u8, u8)>,
}

/// Context handed to every plugin callback.
///
/// For `PRE_INST` / `POST_INST` the cursors are live: `read_addr` is
/// the guest instruction being translated and `write_addr` the cache
/// position instrumentation is emitted at. The emit API advances
/// `write_addr`; the scanner re-checks free space after each callback.
pub struct PluginCtx<'a> {
    pub thread: &'a mut ThreadData,
    pub plugin_id: usize,
    pub isa: Isa,
    /// Fragment index, or `usize::MAX` for thread/syscall events.
    pub fragment: usize,
    /// Condition the current instruction executes under (IT blocks);
    /// `Al` outside one.
    pub cond: Cond,
    /// `inst_class` bits describing the decoded instruction.
    pub inst_class: u32,
    pub read_addr: GuestAddr,
    pub write_addr: usize,
    /// Set by a `PRE_INST` callback to suppress the scanner's own
    /// emission for this instruction.
    pub replace: bool,
    /// Load/store operands when `inst_class` has `LOAD_STORE`.
    pub ld_st: Option<LdStOperands>,
    pub syscall: Option<SyscallArgs<'a>>,
    /// Set by a `PRE_SYSCALL` callback to skip the syscall.
    pub skip_syscall: bool,
}

impl<'a> PluginCtx<'a> {
    /// A context for events with no live cursors (thread and syscall
    /// events).
    pub fn for_event(thread: &'a mut ThreadData, isa: Isa) -> Self {
        Self {
            thread,
            plugin_id: 0,
            isa,
            fragment: usize::MAX,
            cond: Cond::Al,
            inst_class: 0,
            read_addr: 0,
            write_addr: 0,
            replace: false,
            ld_st: None,
            syscall: None,
            skip_syscall: false,
        }
    }

    pub fn is_load_or_store(&self) -> bool {
        self.inst_class & crate::inst_class::LOAD_STORE != 0
    }

    pub fn branch_class(&self) -> u32 {
        self.inst_class
            & (crate::inst_class::BRANCH_DIRECT
                | crate::inst_class::BRANCH_INDIRECT
                | crate::inst_class::BRANCH_RETURN
                | crate::inst_class::BRANCH_CALL
                | crate::inst_class::BRANCH_COND)
    }

    /// Store per-thread plugin state in this plugin's slot.
    pub fn set_plugin_data<T: Any + Send>(&mut self, data: T) {
        self.thread.plugin_data[self.plugin_id] = Some(Box::new(data));
    }

    pub fn plugin_data<T: Any + Send>(&self) -> Option<&T> {
        self.thread.plugin_data[self.plugin_id]
            .as_ref()
            .and_then(|b| b.downcast_ref())
    }

    pub fn plugin_data_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.thread.plugin_data[self.plugin_id]
            .as_mut()
            .and_then(|b| b.downcast_mut())
    }

    pub fn take_plugin_data<T: Any + Send>(&mut self) -> Option<Box<T>> {
        self.thread.plugin_data[self.plugin_id]
            .take()
            .and_then(|b| b.downcast().ok())
    }
}
