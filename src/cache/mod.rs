//! EE data cache model
//!
//! 64 sets x 2 ways x 64-byte lines, indexed by address bits [11:6]. The
//! whole cache only spans a 4KB window, so every page of RAM aliases onto the
//! same 64 sets, as on hardware.
//!
//! Hits are served from the line buffer and never touch backing memory;
//! stores only reach backing memory when the line is evicted. That staleness
//! between cached and uncached aliases of the same physical line is the
//! behaviour this model exists to reproduce.

pub mod control;

pub use control::{CacheControl, TlbEntry, TLB_ENTRIES};

use crate::memory::MemValue;

pub const CACHE_SETS: usize = 64;
pub const CACHE_WAYS: usize = 2;
pub const LINE_SIZE: usize = 64;

const PAGE_TAG_MASK: usize = !0xFFF;
const LINE_MASK: usize = !(LINE_SIZE - 1);

/// State of one cache line.
///
/// `host_page` is the page-aligned host address of the line's backing store
/// and is what hits are matched against; `phys_page` is the guest physical
/// page, kept only for tag readback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheTag {
    host_page: usize,
    phys_page: u32,
    pub valid: bool,
    pub dirty: bool,
    pub lrf: bool,
    /// Present in the tag layout, never consulted by the model.
    pub locked: bool,
}

impl CacheTag {
    pub const DIRTY_FLAG: u64 = 0x20;
    pub const VALID_FLAG: u64 = 0x10;
    pub const LRF_FLAG: u64 = 0x08;
    pub const LOCK_FLAG: u64 = 0x04;
    pub const FLAG_BITS: u64 = 0x3F;

    #[inline(always)]
    pub fn matches(&self, ppf: usize) -> bool {
        self.valid && self.host_page == ppf & PAGE_TAG_MASK
    }

    /// Host address of the line this tag describes in `set`.
    pub fn line_addr(&self, set: usize) -> usize {
        self.host_page | (set << 6)
    }

    pub fn phys_page(&self) -> u32 {
        self.phys_page
    }

    /// Legacy packed layout: physical tag bits with the flags in the low six bits.
    pub fn packed(&self) -> u64 {
        let mut value = (self.phys_page & !0xFFF) as u64;
        if self.dirty {
            value |= Self::DIRTY_FLAG;
        }
        if self.valid {
            value |= Self::VALID_FLAG;
        }
        if self.lrf {
            value |= Self::LRF_FLAG;
        }
        if self.locked {
            value |= Self::LOCK_FLAG;
        }
        value
    }

    /// Decodes a packed tag. The result has no host backing, so it only
    /// describes a line; it can never be matched by an access.
    pub fn from_packed(packed: u64) -> Self {
        CacheTag {
            host_page: 0,
            phys_page: (packed as u32) & !0xFFF,
            valid: packed & Self::VALID_FLAG != 0,
            dirty: packed & Self::DIRTY_FLAG != 0,
            lrf: packed & Self::LRF_FLAG != 0,
            locked: packed & Self::LOCK_FLAG != 0,
        }
    }

    /// Applies the flag bits of a packed tag, keeping the address fields.
    ///
    /// A line that was never filled has no backing store, so it cannot be
    /// made valid or dirty this way.
    pub fn store_flags(&mut self, packed: u64) {
        let backed = self.host_page != 0;
        self.dirty = backed && packed & Self::DIRTY_FLAG != 0;
        self.valid = backed && packed & Self::VALID_FLAG != 0;
        self.lrf = packed & Self::LRF_FLAG != 0;
        self.locked = packed & Self::LOCK_FLAG != 0;
    }
}

#[derive(Clone, Copy)]
#[repr(C, align(64))]
pub struct CacheLine(pub [u8; LINE_SIZE]);

impl Default for CacheLine {
    fn default() -> Self {
        CacheLine([0; LINE_SIZE])
    }
}

#[derive(Clone, Copy, Default)]
pub struct CacheSet {
    pub tags: [CacheTag; CACHE_WAYS],
    pub data: [CacheLine; CACHE_WAYS],
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writebacks: u64,
}

/// Guest `CACHE` instruction data-cache operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOp {
    IndexLoadTag,
    IndexStoreTag,
    IndexWritebackInvalidate,
    IndexInvalidate,
    HitInvalidate,
    HitWritebackInvalidate,
    HitWriteback,
}

impl CacheOp {
    /// Decodes the R5900 `CACHE` op field.
    pub fn from_code(op: u8) -> Option<Self> {
        match op {
            0x10 => Some(CacheOp::IndexLoadTag),
            0x12 => Some(CacheOp::IndexStoreTag),
            0x14 => Some(CacheOp::IndexWritebackInvalidate),
            0x16 => Some(CacheOp::IndexInvalidate),
            0x18 => Some(CacheOp::HitInvalidate),
            0x1A => Some(CacheOp::HitWritebackInvalidate),
            0x1C => Some(CacheOp::HitWriteback),
            _ => None,
        }
    }

    pub fn is_hit_op(self) -> bool {
        matches!(
            self,
            CacheOp::HitInvalidate | CacheOp::HitWritebackInvalidate | CacheOp::HitWriteback
        )
    }
}

pub struct CacheModel {
    sets: Box<[CacheSet]>,
    stats: CacheStats,
}

impl Default for CacheModel {
    fn default() -> Self {
        CacheModel::new()
    }
}

impl CacheModel {
    pub fn new() -> Self {
        CacheModel {
            sets: vec![CacheSet::default(); CACHE_SETS].into_boxed_slice(),
            stats: CacheStats::default(),
        }
    }

    /// Empties every line without writing anything back.
    pub fn reset(&mut self) {
        self.sets.fill(CacheSet::default());
        self.stats = CacheStats::default();
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    pub fn set(&self, index: usize) -> &CacheSet {
        &self.sets[index]
    }

    #[inline(always)]
    pub fn set_index(addr: u32) -> usize {
        ((addr >> 6) & 0x3F) as usize
    }

    /// Way of `set` holding the line at host address `ppf`, if any.
    #[inline]
    pub fn find_in_cache(&self, set: usize, ppf: usize) -> Option<usize> {
        let tags = &self.sets[set].tags;
        (0..CACHE_WAYS).find(|&way| tags[way].matches(ppf))
    }

    /// Way a miss in `set` would fill.
    #[inline]
    pub fn victim_way(&self, set: usize) -> usize {
        let tags = &self.sets[set].tags;
        (tags[0].lrf ^ tags[1].lrf) as usize
    }

    /// Returns `(set, way)` holding the line of `vaddr`, filling it on a miss.
    ///
    /// # Safety
    ///
    /// `ppf` must be the host address of `vaddr` and the 64-byte line around
    /// it must be readable. The backing of every valid dirty line must still
    /// be live and writable, since the victim may be written back.
    pub unsafe fn get_free_cache(&mut self, vaddr: u32, ppf: usize, phys: u32) -> (usize, usize) {
        let set = Self::set_index(vaddr);
        if let Some(way) = self.find_in_cache(set, ppf) {
            self.stats.hits += 1;
            return (set, way);
        }

        self.stats.misses += 1;
        let way = self.victim_way(set);
        self.write_back_if_needed(set, way);
        self.load(set, way, ppf, phys);
        let tag = &mut self.sets[set].tags[way];
        tag.lrf = !tag.lrf;
        (set, way)
    }

    /// Loads through the cache.
    ///
    /// # Safety
    ///
    /// Same contract as [`CacheModel::get_free_cache`].
    pub unsafe fn read<T: MemValue>(&mut self, vaddr: u32, host: *mut u8, phys: u32) -> T {
        let (set, way) = self.get_free_cache(vaddr, host as usize, phys);
        let offset = vaddr as usize % LINE_SIZE;
        debug_assert!(offset + std::mem::size_of::<T>() <= LINE_SIZE);
        let line = &self.sets[set].data[way].0;
        (line.as_ptr().add(offset) as *const T).read_unaligned()
    }

    /// Stores into the cache, leaving backing memory untouched until eviction.
    ///
    /// # Safety
    ///
    /// Same contract as [`CacheModel::get_free_cache`].
    pub unsafe fn write<T: MemValue>(&mut self, vaddr: u32, host: *mut u8, phys: u32, value: T) {
        let (set, way) = self.get_free_cache(vaddr, host as usize, phys);
        let offset = vaddr as usize % LINE_SIZE;
        debug_assert!(offset + std::mem::size_of::<T>() <= LINE_SIZE);
        let entry = &mut self.sets[set];
        (entry.data[way].0.as_mut_ptr().add(offset) as *mut T).write_unaligned(value);
        entry.tags[way].dirty = true;
    }

    /// Index-addressed `CACHE` op: the way comes from bit 0 of `addr`.
    ///
    /// Returns the packed tag for [`CacheOp::IndexLoadTag`]; `tag_lo` supplies
    /// the flags for [`CacheOp::IndexStoreTag`].
    ///
    /// # Safety
    ///
    /// Writeback ops require the backing of the selected line to be live.
    pub unsafe fn index_op(&mut self, op: CacheOp, addr: u32, tag_lo: u64) -> Option<u64> {
        let set = Self::set_index(addr);
        let way = (addr & 1) as usize;
        match op {
            CacheOp::IndexLoadTag => return Some(self.sets[set].tags[way].packed()),
            CacheOp::IndexStoreTag => self.sets[set].tags[way].store_flags(tag_lo),
            CacheOp::IndexWritebackInvalidate => {
                self.write_back_if_needed(set, way);
                self.clear_line(set, way);
            }
            CacheOp::IndexInvalidate => self.clear_line(set, way),
            _ => {}
        }
        None
    }

    /// Hit-addressed `CACHE` op on the line backing host address `ppf`.
    ///
    /// # Safety
    ///
    /// Writeback ops require the backing of the hit line to be live.
    pub unsafe fn hit_op(&mut self, op: CacheOp, vaddr: u32, ppf: usize) {
        let set = Self::set_index(vaddr);
        let Some(way) = self.find_in_cache(set, ppf) else {
            return;
        };
        match op {
            CacheOp::HitInvalidate => self.clear_line(set, way),
            CacheOp::HitWritebackInvalidate => {
                self.write_back_if_needed(set, way);
                self.clear_line(set, way);
            }
            CacheOp::HitWriteback => self.write_back_if_needed(set, way),
            _ => {}
        }
    }

    unsafe fn write_back_if_needed(&mut self, set: usize, way: usize) {
        let entry = &mut self.sets[set];
        let tag = &mut entry.tags[way];
        if !(tag.valid && tag.dirty) {
            return;
        }
        let target = tag.line_addr(set) as *mut u8;
        std::ptr::copy_nonoverlapping(entry.data[way].0.as_ptr(), target, LINE_SIZE);
        tag.dirty = false;
        self.stats.writebacks += 1;
    }

    unsafe fn load(&mut self, set: usize, way: usize, ppf: usize, phys: u32) {
        let entry = &mut self.sets[set];
        let tag = &mut entry.tags[way];
        tag.host_page = ppf & PAGE_TAG_MASK;
        tag.phys_page = phys & !0xFFF;
        std::ptr::copy_nonoverlapping((ppf & LINE_MASK) as *const u8, entry.data[way].0.as_mut_ptr(), LINE_SIZE);
        tag.valid = true;
        tag.dirty = false;
    }

    fn clear_line(&mut self, set: usize, way: usize) {
        self.sets[set].tags[way] = CacheTag::default();
        self.sets[set].data[way] = CacheLine::default();
    }
}
