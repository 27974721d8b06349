//! Physical page dispositions
//!
//! One entry per 4KB page of the [`PMAP_SIZE`] physical window. Populated at
//! power-on by the boot sequence through [`PhysicalMap::map_block`] and
//! [`PhysicalMap::map_handler`].

use std::ptr::NonNull;

use super::{is_page_aligned, page_index, HandlerId, PAGE_SIZE, PMAP_ITEMS, PMAP_SIZE};
use crate::error::MapError;

/// What backs one physical page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhysicalEntry {
    /// Host memory; the pointer addresses the first byte of the page.
    Pointer(NonNull<u8>),
    /// A registered device handler.
    Handler(HandlerId),
}

pub struct PhysicalMap {
    entries: Box<[PhysicalEntry]>,
}

impl Default for PhysicalMap {
    fn default() -> Self {
        PhysicalMap::new()
    }
}

impl PhysicalMap {
    /// Every page initially routes to [`HandlerId::DEFAULT`].
    pub fn new() -> Self {
        PhysicalMap {
            entries: vec![PhysicalEntry::Handler(HandlerId::DEFAULT); PMAP_ITEMS].into_boxed_slice(),
        }
    }

    pub fn reset(&mut self) {
        self.entries.fill(PhysicalEntry::Handler(HandlerId::DEFAULT));
    }

    /// Disposition of the page holding `paddr`, or `None` outside the window.
    #[inline(always)]
    pub fn lookup(&self, paddr: u32) -> Option<PhysicalEntry> {
        self.entries.get(page_index(paddr)).copied()
    }

    /// Fills `[start, start + size)` with direct pointers into `base`.
    ///
    /// With a non-zero `block_size`, only `block_size` bytes of `base` are
    /// used and tiled repeatedly across the range, producing mirrors. A zero
    /// `block_size` maps `size` bytes linearly.
    pub fn map_block(
        &mut self,
        base: NonNull<u8>,
        start: u32,
        size: u32,
        block_size: u32,
    ) -> Result<(), MapError> {
        const CALL: &str = "map_block";
        check_range(CALL, start, size)?;
        if base.as_ptr() as usize & (PAGE_SIZE as usize - 1) != 0 {
            return Err(MapError::MisalignedPointer {
                call: CALL,
                ptr: base.as_ptr() as usize,
            });
        }
        let block_size = if block_size == 0 { size } else { block_size };
        if !is_page_aligned(block_size) || (size != 0 && size % block_size != 0) {
            return Err(MapError::BadBlockSize {
                call: CALL,
                size,
                block_size,
            });
        }

        let first = page_index(start);
        let pages_per_block = (block_size / PAGE_SIZE) as usize;
        for i in 0..(size / PAGE_SIZE) as usize {
            let offset = (i % pages_per_block) * PAGE_SIZE as usize;
            // SAFETY: offset stays below block_size, which the caller sized `base` for.
            let ptr = unsafe { NonNull::new_unchecked(base.as_ptr().add(offset)) };
            self.entries[first + i] = PhysicalEntry::Pointer(ptr);
        }
        Ok(())
    }

    /// Routes `[start, start + size)` to a handler.
    pub fn map_handler(&mut self, id: HandlerId, start: u32, size: u32) -> Result<(), MapError> {
        check_range("map_handler", start, size)?;
        let first = page_index(start);
        let count = (size / PAGE_SIZE) as usize;
        self.entries[first..first + count].fill(PhysicalEntry::Handler(id));
        Ok(())
    }

    /// Copies the dispositions of `[start, start + size)` onto
    /// `[new_region, new_region + size)`.
    pub fn mirror(&mut self, new_region: u32, start: u32, size: u32) -> Result<(), MapError> {
        check_range("mirror", start, size)?;
        check_range("mirror", new_region, size)?;
        let src = page_index(start);
        let dst = page_index(new_region);
        let count = (size / PAGE_SIZE) as usize;
        self.entries.copy_within(src..src + count, dst);
        Ok(())
    }

    /// Host pointer backing `paddr`, when that page is direct memory.
    pub fn host_ptr(&self, paddr: u32) -> Option<NonNull<u8>> {
        match self.lookup(paddr)? {
            PhysicalEntry::Pointer(page) => {
                // SAFETY: the page pointer covers a whole 4KB page.
                Some(unsafe { NonNull::new_unchecked(page.as_ptr().add((paddr % PAGE_SIZE) as usize)) })
            }
            PhysicalEntry::Handler(_) => None,
        }
    }
}

fn check_range(call: &'static str, start: u32, size: u32) -> Result<(), MapError> {
    if !is_page_aligned(start) {
        return Err(MapError::MisalignedAddress { call, addr: start });
    }
    if !is_page_aligned(size) {
        return Err(MapError::MisalignedSize { call, size });
    }
    if start as u64 + size as u64 > PMAP_SIZE as u64 {
        return Err(MapError::OutOfRange {
            call,
            start,
            size,
            limit: PMAP_SIZE as u64,
        });
    }
    Ok(())
}
