//! Which arena page each fastmem page mirrors, and the reverse.

use std::collections::HashMap;

use crate::memory::{page_index, PAGE_MASK, PAGE_SIZE, VMAP_ITEMS};

/// Per-page marker for fastmem pages that fault.
pub const NO_FASTMEM_MAPPING: u32 = u32::MAX;

pub struct FastmemMappings {
    /// Arena offset of each virtual page.
    pages: Box<[u32]>,
    /// Arena page offset to every virtual page mirroring it.
    reverse: HashMap<u32, Vec<u32>>,
}

impl Default for FastmemMappings {
    fn default() -> Self {
        FastmemMappings::new()
    }
}

impl FastmemMappings {
    pub fn new() -> Self {
        FastmemMappings {
            pages: vec![NO_FASTMEM_MAPPING; VMAP_ITEMS].into_boxed_slice(),
            reverse: HashMap::new(),
        }
    }

    /// Number of virtual pages currently mirrored.
    pub fn len(&self) -> usize {
        self.reverse.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.reverse.is_empty()
    }

    /// Records `vaddr`'s page as mirroring the arena page at `offset`.
    ///
    /// Returns the offset the page mirrored before, if any.
    pub fn create(&mut self, vaddr: u32, offset: u32) -> Option<u32> {
        let vpage = vaddr & !PAGE_MASK;
        let offset = offset & !PAGE_MASK;
        let previous = self.remove(vpage);
        self.pages[page_index(vpage)] = offset;
        self.reverse.entry(offset).or_default().push(vpage);
        previous
    }

    /// Forgets `vaddr`'s page, returning the arena offset it mirrored.
    pub fn remove(&mut self, vaddr: u32) -> Option<u32> {
        let vpage = vaddr & !PAGE_MASK;
        let slot = &mut self.pages[page_index(vpage)];
        let offset = std::mem::replace(slot, NO_FASTMEM_MAPPING);
        if offset == NO_FASTMEM_MAPPING {
            return None;
        }
        if let Some(aliases) = self.reverse.get_mut(&offset) {
            aliases.retain(|&page| page != vpage);
            if aliases.is_empty() {
                self.reverse.remove(&offset);
            }
        }
        Some(offset)
    }

    /// Arena offset of the byte at `vaddr`, when its page is mirrored.
    #[inline]
    pub fn resolve(&self, vaddr: u32) -> Option<u32> {
        match self.pages[page_index(vaddr)] {
            NO_FASTMEM_MAPPING => None,
            offset => Some(offset | (vaddr & PAGE_MASK)),
        }
    }

    /// Virtual pages mirroring the arena page containing `offset`.
    pub fn aliases(&self, offset: u32) -> &[u32] {
        self.reverse.get(&(offset & !PAGE_MASK)).map_or(&[], Vec::as_slice)
    }

    /// Every virtual page mirroring any arena page of `[offset, offset + size)`.
    pub fn aliases_in(&self, offset: u32, size: u32) -> Vec<u32> {
        let first = offset & !PAGE_MASK;
        let end = offset.saturating_add(size);
        (first..end)
            .step_by(PAGE_SIZE as usize)
            .flat_map(|page| self.aliases(page).iter().copied())
            .collect()
    }

    pub fn clear(&mut self) {
        self.pages.fill(NO_FASTMEM_MAPPING);
        self.reverse.clear();
    }
}
