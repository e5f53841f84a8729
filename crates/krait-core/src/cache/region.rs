//! Anonymous mapped regions backing the lookup cache
//!
//! The three cache tables reserve address space up front and rely on
//! `MADV_DONTNEED` to drop physical pages on clear, keeping the
//! reservation itself alive.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};

use super::CacheError;

/// A private anonymous read/write mapping with RAII unmap.
pub struct MmapRegion {
    base: *mut u8,
    len: usize,
}

// Safety: the region is plain memory; slot access goes through atomics
// and the callers serialize writers through the cache write lock.
unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

impl MmapRegion {
    pub fn new_anon(len: usize) -> Result<Self, CacheError> {
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(CacheError::MappingFailed(io::Error::last_os_error()));
        }
        Ok(MmapRegion {
            base: base as *mut u8,
            len,
        })
    }

    pub fn base(&self) -> *mut u8 {
        self.base
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Release physical pages in `[offset, offset + len)`; the anonymous
    /// private mapping reads back as zeroes afterwards.
    pub fn dont_need(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.len);
        let ret = unsafe {
            libc::madvise(
                self.base.add(offset) as *mut libc::c_void,
                len,
                libc::MADV_DONTNEED,
            )
        };
        if ret != 0 {
            log::warn!("madvise(MADV_DONTNEED) failed: {}", io::Error::last_os_error());
        }
    }

    /// Hint that `[offset, offset + len)` is about to be touched.
    pub fn will_need(&self, offset: usize, len: usize) {
        debug_assert!(offset + len <= self.len);
        let ret = unsafe {
            libc::madvise(
                self.base.add(offset) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            )
        };
        if ret != 0 {
            log::warn!("madvise(MADV_WILLNEED) failed: {}", io::Error::last_os_error());
        }
    }

    /// Relaxed atomic read of an 8-byte slot at a byte offset.
    pub fn read_u64(&self, offset: usize) -> u64 {
        debug_assert!(offset % 8 == 0 && offset + 8 <= self.len);
        unsafe { (*(self.base.add(offset) as *const AtomicU64)).load(Ordering::Relaxed) }
    }

    /// Relaxed atomic write of an 8-byte slot at a byte offset.
    pub fn write_u64(&self, offset: usize, value: u64) {
        debug_assert!(offset % 8 == 0 && offset + 8 <= self.len);
        unsafe { (*(self.base.add(offset) as *const AtomicU64)).store(value, Ordering::Relaxed) }
    }
}

impl Drop for MmapRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_region_reads_zero() {
        let region = MmapRegion::new_anon(4096).unwrap();
        assert_eq!(region.read_u64(0), 0);
        assert_eq!(region.read_u64(4088), 0);
        assert_eq!(region.len(), 4096);
    }

    #[test]
    fn test_write_read_round_trip() {
        let region = MmapRegion::new_anon(4096).unwrap();
        region.write_u64(16, 0xDEAD_BEEF_CAFE_F00D);
        assert_eq!(region.read_u64(16), 0xDEAD_BEEF_CAFE_F00D);
    }

    #[test]
    fn test_dont_need_zero_fills() {
        let region = MmapRegion::new_anon(8192).unwrap();
        region.write_u64(0, 7);
        region.write_u64(4096, 9);
        region.dont_need(0, 8192);
        assert_eq!(region.read_u64(0), 0);
        assert_eq!(region.read_u64(4096), 0);
    }
}
