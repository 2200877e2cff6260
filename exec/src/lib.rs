//! Dispatch engine: guest-target resolution, exit back-patching,
//! cache flushing and the resident trampolines.
//!
//! Data flow: an exit stub transfers to the dispatcher trampoline,
//! which calls `dispatcher_entry(target, source_index, thread)`. The
//! dispatcher looks the target up (scanning on a miss), patches the
//! source fragment's exit so the branch that just trapped now jumps
//! straight to the resolved fragment, and returns the cache address
//! to resume at.

pub mod dispatcher;
pub mod flush;
pub mod trampolines;

pub use dispatcher::{dispatch, dispatcher_entry, lookup_or_scan};
pub use flush::flush_code_cache;
pub use trampolines::{enter_cache, install_trampolines};
