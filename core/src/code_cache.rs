use std::io;
use std::ptr;

/// Number of fragment slots in a thread's code cache.
pub const CODE_CACHE_SIZE: usize = 8192;

/// Bytes per fragment slot. The translated body grows up from the slot
/// start while literal data grows down from the slot end; a fragment
/// that needs more spans into the next slot.
pub const BASIC_BLOCK_BYTES: usize = 256;

/// Per-thread executable arena of fragment slots.
///
/// Memory-mapped once at thread init and never relocated. The mapping
/// stays writable and executable for its whole lifetime: the dispatcher
/// patches bytes that are simultaneously live instructions, and only
/// the owning thread ever executes them.
pub struct CodeCache {
    ptr: *mut u8,
    size: usize,
    slots: usize,
}

// SAFETY: the mapping is owned exclusively and only ever touched from
// the owning thread.
unsafe impl Send for CodeCache {}

impl CodeCache {
    pub fn new() -> io::Result<Self> {
        Self::with_slots(CODE_CACHE_SIZE)
    }

    pub fn with_slots(slots: usize) -> io::Result<Self> {
        let size = slots * BASIC_BLOCK_BYTES;
        // SAFETY: anonymous private mapping, no file backing.
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: ptr as *mut u8,
            size,
            slots,
        })
    }

    #[inline]
    pub fn base(&self) -> usize {
        self.ptr as usize
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Host address of the start of a fragment slot.
    #[inline]
    pub fn slot_addr(&self, index: usize) -> usize {
        assert!(index < self.slots, "fragment index out of bounds");
        self.base() + index * BASIC_BLOCK_BYTES
    }

    /// Host address one past the end of a fragment slot.
    #[inline]
    pub fn slot_end(&self, index: usize) -> usize {
        self.slot_addr(index) + BASIC_BLOCK_BYTES
    }

    /// Whether a host address lies inside this cache.
    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < self.base() + self.size
    }

    /// Fragment index owning a host address.
    #[inline]
    pub fn index_of(&self, addr: usize) -> usize {
        debug_assert!(self.contains(addr));
        (addr - self.base()) / BASIC_BLOCK_BYTES
    }

    pub fn read_u16(&self, addr: usize) -> u16 {
        assert!(self.contains(addr));
        // SAFETY: bounds checked above.
        unsafe { (addr as *const u16).read_unaligned() }
    }

    pub fn read_u32(&self, addr: usize) -> u32 {
        assert!(self.contains(addr));
        // SAFETY: bounds checked above.
        unsafe { (addr as *const u32).read_unaligned() }
    }
}

impl Drop for CodeCache {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            // SAFETY: unmapping the region mapped in `with_slots`.
            unsafe {
                libc::munmap(self.ptr as *mut libc::c_void, self.size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_drop() {
        let cc = CodeCache::with_slots(16).unwrap();
        assert!(cc.base() != 0);
        assert_eq!(cc.size(), 16 * BASIC_BLOCK_BYTES);
        drop(cc);
    }

    #[test]
    fn slot_geometry() {
        let cc = CodeCache::with_slots(16).unwrap();
        assert_eq!(cc.slot_addr(0), cc.base());
        assert_eq!(cc.slot_addr(3) - cc.slot_addr(2), BASIC_BLOCK_BYTES);
        assert_eq!(cc.index_of(cc.slot_addr(5) + 10), 5);
        assert!(cc.contains(cc.slot_addr(15)));
        assert!(!cc.contains(cc.base() + cc.size()));
    }
}
