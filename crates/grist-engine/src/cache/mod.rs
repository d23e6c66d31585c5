//! Code cache allocation
//!
//! A slab-backed allocator over page-aligned executable memory. Handouts
//! are cache-line aligned. A zero-size "staged" allocation returns the
//! *estimator PC* — the address the next real allocation is expected to
//! occupy — which the relativiser uses to judge displacement reach before
//! any bytes exist.
//!
//! Slabs stay readable+writable+executable for their whole life: edges are
//! patched in place after publication, so the write permission cannot be
//! dropped the way a load-once code region would.

pub mod index;

use parking_lot::Mutex;

pub use index::{CacheIndex, Lookup};

/// Cache-line size used for allocation alignment.
pub const CACHE_LINE: usize = 64;

const PAGE_SIZE: usize = 4096;

/// Error allocating cache memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("executable memory mapping failed")]
    MapFailed,
    #[error("allocation of {0} bytes exceeds the slab size")]
    Oversize(usize),
}

/// One mapped executable slab.
struct Slab {
    base: *mut u8,
    size: usize,
    used: usize,
}

// Safety: slab memory is process-lifetime executable memory; all mutation
// of `used` happens under the allocator lock.
unsafe impl Send for Slab {}

impl Slab {
    #[cfg(unix)]
    fn map(size: usize) -> Result<Slab, CacheError> {
        // Grounded in the same mmap discipline the AOT loader uses, except
        // the region keeps PROT_WRITE for in-place edge patching.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(CacheError::MapFailed);
        }
        Ok(Slab { base: ptr as *mut u8, size, used: 0 })
    }

    #[cfg(not(unix))]
    fn map(_size: usize) -> Result<Slab, CacheError> {
        Err(CacheError::MapFailed)
    }

    fn aligned_used(&self) -> usize {
        (self.used + CACHE_LINE - 1) & !(CACHE_LINE - 1)
    }

    fn next_pc(&self) -> u64 {
        self.base as u64 + self.aligned_used() as u64
    }

    fn fits(&self, size: usize) -> bool {
        self.aligned_used() + size <= self.size
    }
}

#[cfg(unix)]
impl Drop for Slab {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size);
        }
    }
}

/// Slab-backed executable allocator.
pub struct CodeCache {
    slabs: Mutex<Vec<Slab>>,
    slab_size: usize,
}

impl CodeCache {
    /// A cache whose slabs span `slab_pages` pages each.
    pub fn new(slab_pages: usize) -> CodeCache {
        CodeCache { slabs: Mutex::new(Vec::new()), slab_size: slab_pages.max(1) * PAGE_SIZE }
    }

    /// Allocate `size` bytes of executable memory, cache-line aligned.
    ///
    /// `size == 0` is a staged allocation: it returns the estimator PC
    /// without consuming anything.
    pub fn allocate(&self, size: usize) -> Result<u64, CacheError> {
        if size > self.slab_size {
            return Err(CacheError::Oversize(size));
        }
        let mut slabs = self.slabs.lock();
        let needs_slab = match slabs.last() {
            Some(slab) => !slab.fits(size.max(1)),
            None => true,
        };
        if needs_slab {
            slabs.push(Slab::map(self.slab_size)?);
        }
        let slab = slabs.last_mut().expect("slab just ensured");
        let pc = slab.next_pc();
        if size > 0 {
            slab.used = slab.aligned_used() + size;
        }
        Ok(pc)
    }

    /// The estimator PC: where the next real allocation will land, assuming
    /// it fits the current slab.
    pub fn estimator_pc(&self) -> Result<u64, CacheError> {
        self.allocate(0)
    }

    /// Total bytes handed out.
    pub fn bytes_used(&self) -> usize {
        self.slabs.lock().iter().map(|slab| slab.used).sum()
    }
}

// Safety: the allocator state is lock-protected; the mapped memory is
// shared executable storage by design.
unsafe impl Send for CodeCache {}
unsafe impl Sync for CodeCache {}

/// Copy encoded bytes into cache memory previously returned by
/// [`CodeCache::allocate`].
///
/// # Safety
/// `cache_pc` must come from this process's cache allocator and `bytes`
/// must fit the allocation it names.
pub unsafe fn write_code(cache_pc: u64, bytes: &[u8]) {
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), cache_pc as *mut u8, bytes.len());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alignment() {
        let cache = CodeCache::new(1);
        let a = cache.allocate(10).unwrap();
        let b = cache.allocate(10).unwrap();
        assert_eq!(a % CACHE_LINE as u64, 0);
        assert_eq!(b % CACHE_LINE as u64, 0);
        assert_eq!(b - a, CACHE_LINE as u64);
    }

    #[test]
    fn test_staged_allocation_estimates_next() {
        let cache = CodeCache::new(1);
        let estimate = cache.estimator_pc().unwrap();
        let real = cache.allocate(32).unwrap();
        assert_eq!(estimate, real);
        // A staged allocation consumes nothing.
        let estimate2 = cache.estimator_pc().unwrap();
        let real2 = cache.allocate(8).unwrap();
        assert_eq!(estimate2, real2);
        assert!(real2 > real);
    }

    #[test]
    fn test_slab_rollover() {
        let cache = CodeCache::new(1);
        let first = cache.allocate(PAGE_SIZE - CACHE_LINE).unwrap();
        let second = cache.allocate(256).unwrap();
        // The second allocation cannot fit the remainder of slab one.
        assert!(second < first || second >= first + PAGE_SIZE as u64);
    }

    #[test]
    fn test_oversize_rejected() {
        let cache = CodeCache::new(1);
        assert_eq!(cache.allocate(PAGE_SIZE + 1), Err(CacheError::Oversize(PAGE_SIZE + 1)));
    }

    #[test]
    fn test_written_code_is_readable() {
        let cache = CodeCache::new(1);
        let pc = cache.allocate(3).unwrap();
        unsafe { write_code(pc, &[0xC3, 0x90, 0x90]) };
        let bytes = unsafe { std::slice::from_raw_parts(pc as *const u8, 3) };
        assert_eq!(bytes, &[0xC3, 0x90, 0x90]);
    }
}
