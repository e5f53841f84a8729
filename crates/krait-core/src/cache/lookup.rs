//! Two-level block lookup
//!
//! The cache resolves a guest rip to translated host code like this:
//!
//! ```text
//! page_map[rip >> 12]
//!       |
//!       v
//! page region[rip & 0xFFF]
//!       |
//!       v
//! host code pointer
//! ```
//!
//! One 8-byte directory slot per guest page; each touched page lazily
//! claims a 32 KiB region of the block store (one host-pointer slot per
//! guest byte) from a bump allocator. A direct-mapped L1 table of
//! `(host, rip)` pairs sits in front as a hint: a stale or torn entry is
//! at worst a miss that falls through to the exact walk. Lookups are
//! lock-free; all mutation serializes through one write lock.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::region::MmapRegion;
use super::CacheError;
use crate::config::TranslatorConfig;

const PAGE_BITS: u64 = 12;
const PAGE_SIZE: u64 = 1 << PAGE_BITS;
/// Block-store bytes claimed per touched guest page: one 8-byte slot per
/// guest byte of the page.
const PAGE_REGION_SIZE: usize = (PAGE_SIZE as usize) * 8;
/// L1 bucket: host pointer then guest rip.
const L1_ENTRY_SIZE: usize = 16;

/// One installed translation, in insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockEntry {
    pub guest_rip: u64,
    pub guest_len: u64,
    pub host_ptr: u64,
    pub host_len: u64,
}

/// A patched direct branch in some other translation that jumps to a
/// target rip without a cache lookup. `original_insn` restores the
/// cold-lookup stub when the target dies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLinkSite {
    pub host_addr: u64,
    pub original_insn: u32,
}

/// State mutated only under the write lock.
struct CacheMut {
    /// Bump offset into the block store for the next page region.
    allocate_offset: usize,
    block_list: Vec<BlockEntry>,
    block_links: FxHashMap<u64, Vec<BlockLinkSite>>,
}

/// Process-wide rip → host-code map.
pub struct LookupCache {
    page_map: MmapRegion,
    block_store: MmapRegion,
    l1: MmapRegion,
    virtual_mem_size: u64,
    write_lock: Mutex<CacheMut>,
}

impl LookupCache {
    pub fn new(config: &TranslatorConfig) -> Result<Self, CacheError> {
        assert!(
            (config.l1_size / L1_ENTRY_SIZE).is_power_of_two(),
            "L1 bucket count must be a power of two"
        );
        let directory_size = (config.virtual_mem_size / PAGE_SIZE) as usize * 8;
        Ok(LookupCache {
            page_map: MmapRegion::new_anon(directory_size)?,
            block_store: MmapRegion::new_anon(config.code_size)?,
            l1: MmapRegion::new_anon(config.l1_size)?,
            virtual_mem_size: config.virtual_mem_size,
            write_lock: Mutex::new(CacheMut {
                allocate_offset: 0,
                block_list: Vec::new(),
                block_links: FxHashMap::default(),
            }),
        })
    }

    fn l1_buckets(&self) -> usize {
        self.l1.len() / L1_ENTRY_SIZE
    }

    fn l1_offset(&self, rip: u64) -> usize {
        ((rip >> 1) as usize & (self.l1_buckets() - 1)) * L1_ENTRY_SIZE
    }

    /// Lock-free lookup: L1 hint first, then the exact two-level walk,
    /// refreshing the hint on an L2 hit.
    pub fn lookup(&self, rip: u64) -> Option<u64> {
        let bucket = self.l1_offset(rip);
        let host = self.l1.read_u64(bucket);
        let tag = self.l1.read_u64(bucket + 8);
        if tag == rip && host != 0 {
            return Some(host);
        }

        if rip >= self.virtual_mem_size {
            return None;
        }
        let page_region = self.page_map.read_u64((rip >> PAGE_BITS) as usize * 8);
        if page_region == 0 {
            return None;
        }
        let slot_offset = page_region as usize - self.block_store.base() as usize
            + (rip & (PAGE_SIZE - 1)) as usize * 8;
        let host = self.block_store.read_u64(slot_offset);
        if host == 0 {
            return None;
        }

        self.l1.write_u64(bucket, host);
        self.l1.write_u64(bucket + 8, rip);
        Some(host)
    }

    /// Install a translation. On a full block store the whole cache is
    /// cleared and the insert retried once.
    pub fn insert(
        &self,
        guest_rip: u64,
        guest_len: u64,
        host_ptr: u64,
        host_len: u64,
    ) -> Result<(), CacheError> {
        assert!(
            guest_rip < self.virtual_mem_size,
            "guest rip {:#x} beyond the configured address space",
            guest_rip
        );
        assert!(host_ptr != 0, "null host pointer for rip {:#x}", guest_rip);

        let mut state = self.write_lock.lock();
        match self.insert_locked(&mut state, guest_rip, guest_len, host_ptr, host_len) {
            Err(CacheError::CacheFull) => {
                log::warn!("code cache full, clearing and retrying");
                self.clear_cache_locked(&mut state);
                self.insert_locked(&mut state, guest_rip, guest_len, host_ptr, host_len)
            }
            other => other,
        }
    }

    fn insert_locked(
        &self,
        state: &mut CacheMut,
        guest_rip: u64,
        guest_len: u64,
        host_ptr: u64,
        host_len: u64,
    ) -> Result<(), CacheError> {
        let dir_offset = (guest_rip >> PAGE_BITS) as usize * 8;
        let mut page_region = self.page_map.read_u64(dir_offset);
        if page_region == 0 {
            if state.allocate_offset + PAGE_REGION_SIZE > self.block_store.len() {
                return Err(CacheError::CacheFull);
            }
            page_region = self.block_store.base() as u64 + state.allocate_offset as u64;
            state.allocate_offset += PAGE_REGION_SIZE;
            self.page_map.write_u64(dir_offset, page_region);
        }

        let slot_offset = page_region as usize - self.block_store.base() as usize
            + (guest_rip & (PAGE_SIZE - 1)) as usize * 8;
        self.block_store.write_u64(slot_offset, host_ptr);

        let bucket = self.l1_offset(guest_rip);
        self.l1.write_u64(bucket, host_ptr);
        self.l1.write_u64(bucket + 8, guest_rip);

        state.block_list.push(BlockEntry {
            guest_rip,
            guest_len,
            host_ptr,
            host_len,
        });
        Ok(())
    }

    /// Prefault the directory slice covering `[rip, rip + size)`.
    pub fn hint_used_range(&self, rip: u64, size: u64) {
        if rip >= self.virtual_mem_size {
            return;
        }
        let first = (rip >> PAGE_BITS) as usize * 8;
        let end =
            (rip.saturating_add(size).min(self.virtual_mem_size) >> PAGE_BITS) as usize * 8 + 8;
        self.page_map.will_need(first, end.min(self.page_map.len()) - first);
    }

    /// Drop every L2 translation, keeping L1 for the caller to handle.
    pub fn clear_l2(&self) {
        let mut state = self.write_lock.lock();
        self.clear_l2_locked(&mut state);
    }

    fn clear_l2_locked(&self, state: &mut CacheMut) {
        self.page_map.dont_need(0, self.page_map.len());
        self.block_store.dont_need(0, self.block_store.len());
        state.allocate_offset = 0;
    }

    /// Drop everything: both levels, the block list, and the link table.
    pub fn clear_cache(&self) {
        let mut state = self.write_lock.lock();
        self.clear_cache_locked(&mut state);
    }

    fn clear_cache_locked(&self, state: &mut CacheMut) {
        self.l1.dont_need(0, self.l1.len());
        self.clear_l2_locked(state);
        state.block_links.clear();
        state.block_list.clear();
    }

    /// Invalidate every translation on pages covered by
    /// `[start, start + len)`. Returns the link patch sites whose target
    /// fell inside the range, for the backend to rewrite back to
    /// cold-lookup stubs. Page regions stay claimed in the block store
    /// until the next full clear.
    pub fn invalidate_range(&self, start: u64, len: u64) -> Vec<BlockLinkSite> {
        let mut state = self.write_lock.lock();
        let end = start.saturating_add(len);

        let first_page = start >> PAGE_BITS;
        let last_page = end.saturating_add(PAGE_SIZE - 1) >> PAGE_BITS;
        for page in first_page..last_page.min(self.virtual_mem_size >> PAGE_BITS) {
            self.page_map.write_u64(page as usize * 8, 0);
        }

        // Scrub matching L1 hints so a stale tag cannot resurface.
        for bucket in 0..self.l1_buckets() {
            let offset = bucket * L1_ENTRY_SIZE;
            let tag = self.l1.read_u64(offset + 8);
            if tag >= start && tag < end {
                self.l1.write_u64(offset, 0);
                self.l1.write_u64(offset + 8, 0);
            }
        }

        state
            .block_list
            .retain(|entry| entry.guest_rip + entry.guest_len <= start || entry.guest_rip >= end);

        let targets: Vec<u64> = state
            .block_links
            .keys()
            .copied()
            .filter(|&rip| rip >= start && rip < end)
            .collect();
        let mut sites = Vec::new();
        for target in targets {
            if let Some(mut links) = state.block_links.remove(&target) {
                sites.append(&mut links);
            }
        }
        sites
    }

    /// Record a direct-branch patch site aimed at `target_rip`.
    pub fn add_block_link(&self, target_rip: u64, site: BlockLinkSite) {
        let mut state = self.write_lock.lock();
        state.block_links.entry(target_rip).or_default().push(site);
    }

    /// Remove and return every patch site aimed at `target_rip`.
    pub fn erase_block_links(&self, target_rip: u64) -> Vec<BlockLinkSite> {
        let mut state = self.write_lock.lock();
        state.block_links.remove(&target_rip).unwrap_or_default()
    }

    /// Snapshot of installed translations in insertion order.
    pub fn block_list(&self) -> Vec<BlockEntry> {
        self.write_lock.lock().block_list.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache() -> LookupCache {
        // A small virtual space keeps test mappings cheap.
        let config = TranslatorConfig {
            virtual_mem_size: 1 << 32,
            l1_size: 4096 * L1_ENTRY_SIZE,
            code_size: 4 * PAGE_REGION_SIZE,
            ..Default::default()
        };
        LookupCache::new(&config).unwrap()
    }

    #[test]
    fn test_insert_lookup_round_trip() {
        let cache = small_cache();
        cache.insert(0xDEAD_0000, 16, 0xAA, 64).unwrap();
        cache.insert(0xDEAD_1000, 16, 0xBB, 64).unwrap();

        assert_eq!(cache.lookup(0xDEAD_0000), Some(0xAA));
        assert_eq!(cache.lookup(0xDEAD_1000), Some(0xBB));
        assert_eq!(cache.lookup(0xCAFE), None);
    }

    #[test]
    fn test_clear_then_reinsert() {
        let cache = small_cache();
        cache.insert(0xDEAD_0000, 16, 0xAA, 64).unwrap();
        cache.insert(0xDEAD_1000, 16, 0xBB, 64).unwrap();

        cache.clear_cache();
        assert_eq!(cache.lookup(0xDEAD_0000), None);
        assert_eq!(cache.lookup(0xDEAD_1000), None);
        assert!(cache.block_list().is_empty());

        cache.insert(0xDEAD_0000, 16, 0xCC, 64).unwrap();
        assert_eq!(cache.lookup(0xDEAD_0000), Some(0xCC));
    }

    #[test]
    fn test_clear_is_idempotent() {
        let cache = small_cache();
        cache.insert(0x1000, 16, 0x11, 64).unwrap();
        cache.clear_cache();
        cache.clear_cache();
        assert_eq!(cache.lookup(0x1000), None);
        assert!(cache.block_list().is_empty());
    }

    #[test]
    fn test_same_page_shares_one_region() {
        let cache = small_cache();
        cache.insert(0x5000, 4, 0x111, 64).unwrap();
        cache.insert(0x5004, 4, 0x222, 64).unwrap();
        cache.insert(0x5FFF, 1, 0x333, 64).unwrap();

        assert_eq!(cache.lookup(0x5000), Some(0x111));
        assert_eq!(cache.lookup(0x5004), Some(0x222));
        assert_eq!(cache.lookup(0x5FFF), Some(0x333));
        // An untouched byte of the same page misses.
        assert_eq!(cache.lookup(0x5008), None);
    }

    #[test]
    fn test_full_store_recovers_by_clearing() {
        let cache = small_cache();
        // The store holds four page regions; a fifth page forces a clear.
        for page in 0..5u64 {
            cache.insert(page * PAGE_SIZE, 16, 0x1000 + page, 64).unwrap();
        }
        // The survivor is the insert that triggered the clear.
        assert_eq!(cache.lookup(4 * PAGE_SIZE), Some(0x1004));
        assert_eq!(cache.lookup(0), None);
        assert_eq!(cache.block_list().len(), 1);
    }

    #[test]
    fn test_lookup_refreshes_l1() {
        let cache = small_cache();
        cache.insert(0x7000, 16, 0x700, 64).unwrap();
        // Aliased rip in the same L1 bucket evicts the hint, the exact
        // walk still resolves and re-validates it.
        assert_eq!(cache.lookup(0x7000), Some(0x700));
        cache.insert(0x7000 + (4096 << 1) * 16, 16, 0x701, 64).unwrap();
        assert_eq!(cache.lookup(0x7000), Some(0x700));
        assert_eq!(cache.lookup(0x7000), Some(0x700));
    }

    #[test]
    fn test_invalidate_range_is_page_granular() {
        let cache = small_cache();
        cache.insert(0x10_0000, 16, 0xA1, 64).unwrap();
        cache.insert(0x10_1000, 16, 0xA2, 64).unwrap();
        cache.insert(0x10_2000, 16, 0xA3, 64).unwrap();

        let sites = cache.invalidate_range(0x10_1000, 0x1000);
        assert!(sites.is_empty());
        assert_eq!(cache.lookup(0x10_0000), Some(0xA1));
        assert_eq!(cache.lookup(0x10_1000), None);
        assert_eq!(cache.lookup(0x10_2000), Some(0xA3));
        assert_eq!(cache.block_list().len(), 2);
    }

    #[test]
    fn test_block_links_round_trip() {
        let cache = small_cache();
        let site_a = BlockLinkSite {
            host_addr: 0x9000,
            original_insn: 0x1400_0000,
        };
        let site_b = BlockLinkSite {
            host_addr: 0x9100,
            original_insn: 0x1400_0004,
        };
        cache.add_block_link(0x2000, site_a);
        cache.add_block_link(0x2000, site_b);

        let sites = cache.erase_block_links(0x2000);
        assert_eq!(sites, vec![site_a, site_b]);
        assert!(cache.erase_block_links(0x2000).is_empty());
    }

    #[test]
    fn test_invalidation_returns_links_into_range() {
        let cache = small_cache();
        cache.insert(0x3000, 16, 0x30, 64).unwrap();
        let site = BlockLinkSite {
            host_addr: 0x8000,
            original_insn: 0x1400_0000,
        };
        cache.add_block_link(0x3000, site);
        cache.add_block_link(0x9_9000, BlockLinkSite {
            host_addr: 0x8100,
            original_insn: 0,
        });

        let sites = cache.invalidate_range(0x3000, 0x1000);
        assert_eq!(sites, vec![site]);
        // Links outside the range survive.
        assert_eq!(cache.erase_block_links(0x9_9000).len(), 1);
    }

    #[test]
    fn test_block_list_preserves_insertion_order() {
        let cache = small_cache();
        cache.insert(0x4000, 8, 0x41, 32).unwrap();
        cache.insert(0x1000, 8, 0x42, 32).unwrap();
        cache.insert(0x8000, 8, 0x43, 32).unwrap();

        let rips: Vec<u64> = cache.block_list().iter().map(|b| b.guest_rip).collect();
        assert_eq!(rips, vec![0x4000, 0x1000, 0x8000]);
    }

    #[test]
    fn test_hint_used_range_is_harmless() {
        let cache = small_cache();
        cache.hint_used_range(0x10_0000, 0x4000);
        cache.insert(0x10_0000, 16, 0x99, 64).unwrap();
        assert_eq!(cache.lookup(0x10_0000), Some(0x99));
    }
}
