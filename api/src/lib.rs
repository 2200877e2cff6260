//! Plugin interface: registration, callback context and the emit API
//! instrumentation clients use to inline code around guest
//! instructions.
//!
//! Registration is a one-shot builder consumed at runtime startup into
//! an immutable process-global plugin vector; the translator iterates
//! it on every instruction without synchronisation.

pub mod context;
pub mod emit;

pub use context::{PluginCtx, SyscallArgs};

use std::sync::OnceLock;

/// Callback slots per plugin.
pub const NUM_EVENTS: usize = 6;

/// Plugin callback events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum CbEvent {
    /// New thread, before its first guest instruction.
    PreThread = 0,
    /// Thread exit, after its last guest instruction.
    PostThread = 1,
    /// Scanner, before emitting each guest instruction. May set
    /// `replace` to suppress the scanner's own emission.
    PreInst = 2,
    /// Scanner, after emitting each guest instruction.
    PostInst = 3,
    /// Before a guest syscall executes. May set `skip_syscall`.
    PreSyscall = 4,
    /// After a guest syscall returns.
    PostSyscall = 5,
}

/// Instruction classification bits exposed to `PRE_INST` /
/// `POST_INST` callbacks.
pub mod inst_class {
    pub const BRANCH_DIRECT: u32 = 1 << 0;
    pub const BRANCH_INDIRECT: u32 = 1 << 1;
    pub const BRANCH_RETURN: u32 = 1 << 2;
    pub const BRANCH_CALL: u32 = 1 << 3;
    pub const BRANCH_COND: u32 = 1 << 4;
    pub const LOAD_STORE: u32 = 1 << 5;
    pub const SYSCALL: u32 = 1 << 6;
}

pub type PluginCallback = fn(&mut PluginCtx);

/// One registered instrumentation client.
pub struct Plugin {
    pub name: &'static str,
    pub cbs: [Option<PluginCallback>; NUM_EVENTS],
}

impl Plugin {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            cbs: [None; NUM_EVENTS],
        }
    }

    pub fn on(mut self, event: CbEvent, cb: PluginCallback) -> Self {
        self.cbs[event as usize] = Some(cb);
        self
    }
}

static PLUGINS: OnceLock<Vec<Plugin>> = OnceLock::new();

/// One-shot plugin registration, consumed at startup.
pub struct RegistryBuilder {
    plugins: Vec<Plugin>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            plugins: Vec::new(),
        }
    }

    /// Register a plugin; returns its id (the index of its per-thread
    /// data slot).
    pub fn add(&mut self, plugin: Plugin) -> usize {
        let id = self.plugins.len();
        log::debug!("registered plugin '{}' as id {id}", plugin.name);
        self.plugins.push(plugin);
        id
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Install the registry. Panics if called twice: registration is
    /// append-only before startup and immutable after.
    pub fn install(self) -> &'static [Plugin] {
        if PLUGINS.set(self.plugins).is_err() {
            panic!("plugin registry installed twice");
        }
        installed_plugins()
    }
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The installed plugin vector; empty before `install`.
pub fn installed_plugins() -> &'static [Plugin] {
    PLUGINS.get().map(Vec::as_slice).unwrap_or(&[])
}
