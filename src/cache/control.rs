//! Which accesses go through the cache model
//!
//! The EE decides cacheability per TLB entry: each entry maps an even and an
//! odd page of the same size, and each half carries a 3-bit `C` field in its
//! EntryLo. Mode 3 is cached write-back; everything else (uncached,
//! uncached-accelerated, scratchpad) bypasses the data cache. Config bit 16
//! gates the whole data cache.

use serde::{Deserialize, Serialize};

pub const TLB_ENTRIES: usize = 48;

const CONFIG_DCACHE_ENABLE: u32 = 1 << 16;
const CACHE_MODE_WRITEBACK: u32 = 3;

/// One EE TLB entry as written by `TLBWI`/`TLBWR`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlbEntry {
    pub page_mask: u32,
    pub entry_hi: u32,
    pub entry_lo0: u32,
    pub entry_lo1: u32,
}

impl TlbEntry {
    /// Bytes mapped by each half.
    pub fn half_size(&self) -> u32 {
        (((self.page_mask >> 13) & 0xFFF) + 1) << 12
    }

    /// Virtual base of the even half.
    pub fn vpn2(&self) -> u32 {
        self.entry_hi & !(self.page_mask | 0x1FFF)
    }

    pub fn even_cached(&self) -> bool {
        (self.entry_lo0 >> 3) & 7 == CACHE_MODE_WRITEBACK
    }

    pub fn odd_cached(&self) -> bool {
        (self.entry_lo1 >> 3) & 7 == CACHE_MODE_WRITEBACK
    }

    /// True when `vaddr` lands in a half of this entry marked cached.
    pub fn caches(&self, vaddr: u32) -> bool {
        let size = self.half_size() as u64;
        let even = self.vpn2() as u64;
        let odd = even + size;
        let addr = vaddr as u64;
        (self.even_cached() && addr >= even && addr < odd) || (self.odd_cached() && addr >= odd && addr < odd + size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheControl {
    config: u32,
    tlb: Vec<TlbEntry>,
}

impl Default for CacheControl {
    fn default() -> Self {
        CacheControl::new()
    }
}

impl CacheControl {
    pub fn new() -> Self {
        CacheControl {
            config: 0,
            tlb: vec![TlbEntry::default(); TLB_ENTRIES],
        }
    }

    pub fn reset(&mut self) {
        self.config = 0;
        self.tlb.fill(TlbEntry::default());
    }

    /// Mirrors a write to COP0 Config.
    pub fn set_config(&mut self, config: u32) {
        self.config = config;
    }

    pub fn config(&self) -> u32 {
        self.config
    }

    pub fn enabled(&self) -> bool {
        self.config & CONFIG_DCACHE_ENABLE != 0
    }

    /// Mirrors a TLB write into slot `index`; out-of-range slots are ignored.
    pub fn set_tlb_entry(&mut self, index: usize, entry: TlbEntry) {
        if let Some(slot) = self.tlb.get_mut(index) {
            *slot = entry;
        }
    }

    pub fn tlb_entry(&self, index: usize) -> Option<&TlbEntry> {
        self.tlb.get(index)
    }

    /// Whether an access to `vaddr` is modelled through the data cache.
    #[inline]
    pub fn is_cached(&self, vaddr: u32) -> bool {
        self.enabled() && self.tlb.iter().any(|entry| entry.caches(vaddr))
    }
}
