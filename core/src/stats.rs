use std::fmt;

/// Counters for the translate/dispatch/link pipeline of one thread.
#[derive(Default)]
pub struct DispatchStats {
    /// Dispatcher entries (every unlinked exit taken).
    pub dispatch_calls: u64,
    /// Hash-table hits inside `lookup_or_scan`.
    pub hash_hits: u64,
    /// Fragments translated.
    pub translations: u64,
    /// Exit branches patched to a direct target.
    pub links_patched: u64,
    /// Full cache flushes.
    pub flushes: u64,
}

impl fmt::Display for DispatchStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== DBM dispatch stats ===")?;
        writeln!(f, "dispatcher calls: {}", self.dispatch_calls)?;
        writeln!(f, "hash hits:        {}", self.hash_hits)?;
        writeln!(f, "translations:     {}", self.translations)?;
        writeln!(f, "links patched:    {}", self.links_patched)?;
        writeln!(f, "cache flushes:    {}", self.flushes)?;
        Ok(())
    }
}
