//! Guest memory tracking
//!
//! The syscall layer reports every guest mapping mutation here so stale
//! translations die before the guest can reach them. Each callback runs
//! inside a signal-masked critical section: a handler interrupting the
//! walk would otherwise observe a half-invalidated cache.
//!
//! The raw-result helpers implement the guest-facing convention: a
//! failed syscall returns `-errno` in the last 4096 values of the
//! address space.

use std::io;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::cache::{BlockLinkSite, LookupCache};
use crate::signal::ScopedSignalMaskWithMutex;

/// Largest valid errno the convention encodes.
const MAX_ERRNO: u64 = 4096;

/// Whether a guest-convention result encodes `-errno`.
pub fn is_syscall_error(result: u64) -> bool {
    result > (-(MAX_ERRNO as i64)) as u64
}

/// Translate a raw `-1`/errno libc result into the guest convention.
pub fn syscall_ret(raw: i64) -> u64 {
    if raw == -1 {
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL);
        (-(errno as i64)) as u64
    } else {
        raw as u64
    }
}

/// Shared-memory attachments whose length only shmat time knows.
struct TrackerState {
    shm_regions: FxHashMap<u64, u64>,
}

/// Receives mapping mutations and invalidates translated code.
pub struct GuestMemTracker {
    cache: Arc<LookupCache>,
    state: Mutex<TrackerState>,
}

impl GuestMemTracker {
    pub fn new(cache: Arc<LookupCache>) -> Self {
        GuestMemTracker {
            cache,
            state: Mutex::new(TrackerState {
                shm_regions: FxHashMap::default(),
            }),
        }
    }

    fn invalidate(&self, addr: u64, len: u64) -> Vec<BlockLinkSite> {
        let _section = ScopedSignalMaskWithMutex::lock(&self.state);
        self.cache.invalidate_range(addr, len)
    }

    /// A fresh mapping landed over `[addr, addr + len)`.
    pub fn track_mmap(
        &self,
        addr: u64,
        len: u64,
        _prot: i32,
        _flags: i32,
        _fd: i32,
        _offset: u64,
    ) -> Vec<BlockLinkSite> {
        self.invalidate(addr, len)
    }

    pub fn track_munmap(&self, addr: u64, len: u64) -> Vec<BlockLinkSite> {
        self.invalidate(addr, len)
    }

    /// Both the old and the relocated range lose their translations.
    pub fn track_mremap(
        &self,
        old_addr: u64,
        old_len: u64,
        new_addr: u64,
        new_len: u64,
    ) -> Vec<BlockLinkSite> {
        let mut sites = self.invalidate(old_addr, old_len);
        if new_addr != old_addr || new_len != old_len {
            sites.extend(self.invalidate(new_addr, new_len));
        }
        sites
    }

    /// Permission changes can swap code under existing translations.
    pub fn track_mprotect(&self, addr: u64, len: u64, _prot: i32) -> Vec<BlockLinkSite> {
        self.invalidate(addr, len)
    }

    pub fn track_shmat(&self, _shmid: i32, addr: u64, len: u64) -> Vec<BlockLinkSite> {
        {
            let mut section = ScopedSignalMaskWithMutex::lock(&self.state);
            section.shm_regions.insert(addr, len);
        }
        self.invalidate(addr, len)
    }

    pub fn track_shmdt(&self, addr: u64) -> Vec<BlockLinkSite> {
        let len = {
            let mut section = ScopedSignalMaskWithMutex::lock(&self.state);
            section.shm_regions.remove(&addr)
        };
        match len {
            Some(len) => self.invalidate(addr, len),
            None => Vec::new(),
        }
    }
}

/// Guest-facing munmap: translate the result first, track only on
/// success, then hand back the translated value.
pub fn munmap_guest(tracker: &GuestMemTracker, addr: u64, len: u64) -> u64 {
    let raw = unsafe { libc::munmap(addr as *mut libc::c_void, len as usize) };
    let result = syscall_ret(raw as i64);
    if !is_syscall_error(result) {
        tracker.track_munmap(addr, len);
    }
    result
}

/// Guest-facing mprotect with the same ordering.
pub fn mprotect_guest(tracker: &GuestMemTracker, addr: u64, len: u64, prot: i32) -> u64 {
    let raw = unsafe { libc::mprotect(addr as *mut libc::c_void, len as usize, prot) };
    let result = syscall_ret(raw as i64);
    if !is_syscall_error(result) {
        tracker.track_mprotect(addr, len, prot);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TranslatorConfig;

    fn tracker() -> GuestMemTracker {
        let config = TranslatorConfig {
            virtual_mem_size: 1 << 32,
            ..Default::default()
        };
        GuestMemTracker::new(Arc::new(LookupCache::new(&config).unwrap()))
    }

    #[test]
    fn test_error_convention() {
        assert!(is_syscall_error((-22i64) as u64));
        assert!(is_syscall_error((-1i64) as u64));
        assert!(!is_syscall_error(0));
        assert!(!is_syscall_error(0x7F00_0000_0000));
    }

    #[test]
    fn test_munmap_translates_and_tracks() {
        let tracker = tracker();
        tracker.cache.insert(0x2000, 16, 0x99, 64).unwrap();

        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                4096,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        assert_ne!(addr, libc::MAP_FAILED);

        let result = munmap_guest(&tracker, addr as u64, 4096);
        assert!(!is_syscall_error(result));
        // Unrelated translations stay live.
        assert_eq!(tracker.cache.lookup(0x2000), Some(0x99));
    }

    #[test]
    fn test_munmap_failure_skips_tracking() {
        let tracker = tracker();
        // Unaligned address makes the kernel reject the call.
        let result = munmap_guest(&tracker, 0x1001, 4096);
        assert!(is_syscall_error(result));
        assert_eq!(result, (-(libc::EINVAL as i64)) as u64);
    }

    #[test]
    fn test_mmap_over_translated_code_invalidates() {
        let tracker = tracker();
        tracker.cache.insert(0x40_0000, 16, 0xAB, 64).unwrap();
        tracker.track_mmap(0x40_0000, 0x1000, 0, 0, -1, 0);
        assert_eq!(tracker.cache.lookup(0x40_0000), None);
    }

    #[test]
    fn test_shm_round_trip_remembers_length() {
        let tracker = tracker();
        tracker.cache.insert(0x50_0000, 16, 0xCD, 64).unwrap();
        tracker.cache.insert(0x50_3000, 16, 0xEF, 64).unwrap();

        tracker.track_shmat(3, 0x50_0000, 0x2000);
        tracker.cache.insert(0x50_0000, 16, 0xCD, 64).unwrap();

        // Detach invalidates exactly the attached window.
        tracker.track_shmdt(0x50_0000);
        assert_eq!(tracker.cache.lookup(0x50_0000), None);
        assert_eq!(tracker.cache.lookup(0x50_3000), Some(0xEF));
    }

    #[test]
    fn test_mremap_invalidates_both_ranges() {
        let tracker = tracker();
        tracker.cache.insert(0x60_0000, 16, 0x1, 64).unwrap();
        tracker.cache.insert(0x70_0000, 16, 0x2, 64).unwrap();

        tracker.track_mremap(0x60_0000, 0x1000, 0x70_0000, 0x1000);
        assert_eq!(tracker.cache.lookup(0x60_0000), None);
        assert_eq!(tracker.cache.lookup(0x70_0000), None);
    }
}
