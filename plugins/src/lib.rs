//! Example instrumentation clients exercising the plugin ABI.

pub mod branch_count;
pub mod mtrace;
