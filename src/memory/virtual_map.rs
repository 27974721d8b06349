//! Virtual page dispositions
//!
//! Each [`VirtualEntry`] folds the physical disposition of its page together
//! with the page's virtual base, so resolving an access is one table load, one
//! variant match and one add:
//!
//! - direct pages store `host_page - vaddr_page`, and `delta + vaddr` is the
//!   host address of the byte;
//! - handler pages store `paddr_page - vaddr_page`, and `delta + vaddr` is the
//!   physical address handed to the handler.
//!
//! A second table keeps the physical page of every `vmap`ped virtual page so
//! [`VirtualMap::v2p`] works for direct pages too.

use std::ptr::NonNull;

use super::{
    is_page_aligned, page_index, HandlerId, PhysicalEntry, PhysicalMap, PAGE_MASK, PAGE_SIZE,
    VMAP_ITEMS,
};
use crate::error::MapError;

/// Marker in the virtual-to-physical table for pages with no physical address.
pub const NO_PHYSICAL: u32 = u32::MAX;

/// Disposition of one 4KB virtual page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtualEntry {
    /// Host memory at `delta + vaddr` (wrapping).
    Direct { delta: usize },
    /// Device handler, physical address `delta + vaddr` (wrapping).
    Handler { id: HandlerId, delta: u32 },
    /// No mapping; the guest takes a TLB miss.
    Unmapped,
    /// Mapped onto a physical address outside the physical window.
    BusError { delta: u32 },
}

/// Outcome of resolving one virtual address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved {
    Host(*mut u8),
    Handler { id: HandlerId, paddr: u32 },
    TlbMiss,
    BusError { paddr: u32 },
}

impl VirtualEntry {
    /// Builds the entry for virtual page `vaddr` backed by physical page `paddr`.
    pub fn project(physical: Option<PhysicalEntry>, paddr: u32, vaddr: u32) -> Self {
        match physical {
            Some(PhysicalEntry::Pointer(ptr)) => VirtualEntry::from_pointer(ptr, vaddr),
            Some(PhysicalEntry::Handler(id)) => VirtualEntry::Handler {
                id,
                delta: paddr.wrapping_sub(vaddr),
            },
            None => VirtualEntry::BusError {
                delta: paddr.wrapping_sub(vaddr),
            },
        }
    }

    pub fn from_pointer(ptr: NonNull<u8>, vaddr: u32) -> Self {
        VirtualEntry::Direct {
            delta: (ptr.as_ptr() as usize).wrapping_sub(vaddr as usize),
        }
    }

    #[inline(always)]
    pub fn resolve(self, vaddr: u32) -> Resolved {
        match self {
            VirtualEntry::Direct { delta } => Resolved::Host(delta.wrapping_add(vaddr as usize) as *mut u8),
            VirtualEntry::Handler { id, delta } => Resolved::Handler {
                id,
                paddr: vaddr.wrapping_add(delta),
            },
            VirtualEntry::Unmapped => Resolved::TlbMiss,
            VirtualEntry::BusError { delta } => Resolved::BusError {
                paddr: vaddr.wrapping_add(delta),
            },
        }
    }

    #[inline(always)]
    pub fn is_handler(self) -> bool {
        matches!(self, VirtualEntry::Handler { .. })
    }
}

pub struct VirtualMap {
    entries: Box<[VirtualEntry]>,
    ppmap: Box<[u32]>,
}

impl Default for VirtualMap {
    fn default() -> Self {
        VirtualMap::new()
    }
}

impl VirtualMap {
    /// Creates a map with every page unmapped.
    pub fn new() -> Self {
        VirtualMap {
            entries: vec![VirtualEntry::Unmapped; VMAP_ITEMS].into_boxed_slice(),
            ppmap: vec![NO_PHYSICAL; VMAP_ITEMS].into_boxed_slice(),
        }
    }

    pub fn reset(&mut self) {
        self.entries.fill(VirtualEntry::Unmapped);
        self.ppmap.fill(NO_PHYSICAL);
    }

    #[inline(always)]
    pub fn get(&self, vaddr: u32) -> VirtualEntry {
        // VMAP_ITEMS covers every u32 page index
        self.entries[page_index(vaddr)]
    }

    #[inline(always)]
    pub fn resolve(&self, vaddr: u32) -> Resolved {
        self.get(vaddr).resolve(vaddr)
    }

    /// Projects `[paddr, paddr + size)` of `pmap` onto `[vaddr, vaddr + size)`.
    ///
    /// Physical addresses past the physical window become
    /// [`VirtualEntry::BusError`] pages.
    pub fn vmap(&mut self, pmap: &PhysicalMap, vaddr: u32, paddr: u32, size: u32) -> Result<(), MapError> {
        const CALL: &str = "vmap";
        check_virtual_range(CALL, vaddr, size)?;
        if !is_page_aligned(paddr) {
            return Err(MapError::MisalignedAddress { call: CALL, addr: paddr });
        }

        for i in 0..size / PAGE_SIZE {
            let v = vaddr + i * PAGE_SIZE;
            let p = paddr.wrapping_add(i * PAGE_SIZE);
            self.entries[page_index(v)] = VirtualEntry::project(pmap.lookup(p), p, v);
            self.ppmap[page_index(v)] = p;
        }
        Ok(())
    }

    /// Maps a host buffer with no physical address at `vaddr`.
    pub fn vmap_buffer(&mut self, vaddr: u32, buffer: NonNull<u8>, size: u32) -> Result<(), MapError> {
        const CALL: &str = "vmap_buffer";
        check_virtual_range(CALL, vaddr, size)?;
        if buffer.as_ptr() as usize & PAGE_MASK as usize != 0 {
            return Err(MapError::MisalignedPointer {
                call: CALL,
                ptr: buffer.as_ptr() as usize,
            });
        }

        for i in 0..size / PAGE_SIZE {
            let v = vaddr + i * PAGE_SIZE;
            // SAFETY: the caller sized `buffer` to cover `size` bytes.
            let page = unsafe { NonNull::new_unchecked(buffer.as_ptr().add((i * PAGE_SIZE) as usize)) };
            self.entries[page_index(v)] = VirtualEntry::from_pointer(page, v);
            self.ppmap[page_index(v)] = NO_PHYSICAL;
        }
        Ok(())
    }

    /// Resets `[vaddr, vaddr + size)` to [`VirtualEntry::Unmapped`].
    pub fn unmap(&mut self, vaddr: u32, size: u32) -> Result<(), MapError> {
        check_virtual_range("vmap_unmap", vaddr, size)?;
        let first = page_index(vaddr);
        let count = (size / PAGE_SIZE) as usize;
        self.entries[first..first + count].fill(VirtualEntry::Unmapped);
        self.ppmap[first..first + count].fill(NO_PHYSICAL);
        Ok(())
    }

    /// Physical address behind `vaddr`, for pages mapped with [`VirtualMap::vmap`].
    pub fn v2p(&self, vaddr: u32) -> Option<u32> {
        match self.ppmap[page_index(vaddr)] {
            NO_PHYSICAL => None,
            page => Some(page | (vaddr & PAGE_MASK)),
        }
    }
}

fn check_virtual_range(call: &'static str, vaddr: u32, size: u32) -> Result<(), MapError> {
    if !is_page_aligned(vaddr) {
        return Err(MapError::MisalignedAddress { call, addr: vaddr });
    }
    if !is_page_aligned(size) {
        return Err(MapError::MisalignedSize { call, size });
    }
    if vaddr as u64 + size as u64 > 1u64 << 32 {
        return Err(MapError::OutOfRange {
            call,
            start: vaddr,
            size,
            limit: 1u64 << 32,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::PMAP_SIZE;

    #[repr(align(4096))]
    struct Pages([u8; 0x2000]);

    #[test]
    fn test_direct_entry_reconstructs_host_pointer() {
        let mut pages = Box::new(Pages([0; 0x2000]));
        let base = NonNull::new(pages.0.as_mut_ptr()).unwrap();
        let mut pmap = PhysicalMap::new();
        pmap.map_block(base, 0x4000, 0x2000, 0).unwrap();

        let mut vmap = VirtualMap::new();
        vmap.vmap(&pmap, 0x8000_4000, 0x4000, 0x2000).unwrap();

        let expected = unsafe { base.as_ptr().add(0x1234) };
        assert_eq!(vmap.resolve(0x8000_5234), Resolved::Host(expected));
        assert_eq!(vmap.v2p(0x8000_5234), Some(0x5234));
    }

    #[test]
    fn test_handler_entry_recovers_physical_address() {
        let pmap = {
            let mut pmap = PhysicalMap::new();
            pmap.map_handler(HandlerId::from_raw(5), 0x1000_3000, 0x1000).unwrap();
            pmap
        };
        let mut vmap = VirtualMap::new();
        vmap.vmap(&pmap, 0xB000_3000, 0x1000_3000, 0x1000).unwrap();

        assert!(vmap.get(0xB000_3008).is_handler());
        assert_eq!(
            vmap.resolve(0xB000_3008),
            Resolved::Handler {
                id: HandlerId::from_raw(5),
                paddr: 0x1000_3008
            }
        );
    }

    #[test]
    fn test_outside_physical_window_is_bus_error() {
        let pmap = PhysicalMap::new();
        let mut vmap = VirtualMap::new();
        vmap.vmap(&pmap, 0x4000_0000, PMAP_SIZE, 0x1000).unwrap();
        assert_eq!(
            vmap.resolve(0x4000_0010),
            Resolved::BusError {
                paddr: PMAP_SIZE + 0x10
            }
        );
    }

    #[test]
    fn test_unmap_and_buffer() {
        let mut pages = Box::new(Pages([0; 0x2000]));
        let buffer = NonNull::new(pages.0.as_mut_ptr()).unwrap();
        let pmap = PhysicalMap::new();
        let mut vmap = VirtualMap::new();

        vmap.vmap(&pmap, 0x7000_0000, 0, 0x2000).unwrap();
        vmap.vmap_buffer(0x7000_0000, buffer, 0x2000).unwrap();
        assert_eq!(vmap.resolve(0x7000_1004), Resolved::Host(unsafe { buffer.as_ptr().add(0x1004) }));
        assert_eq!(vmap.v2p(0x7000_1004), None);

        vmap.unmap(0x7000_0000, 0x2000).unwrap();
        assert_eq!(vmap.resolve(0x7000_0000), Resolved::TlbMiss);
        assert_eq!(vmap.resolve(0x7000_1FFF), Resolved::TlbMiss);
    }

    #[test]
    fn test_last_page_is_mappable() {
        let pmap = PhysicalMap::new();
        let mut vmap = VirtualMap::new();
        vmap.vmap(&pmap, 0xFFFF_F000, 0, 0x1000).unwrap();
        assert_eq!(vmap.v2p(0xFFFF_FFFF), Some(0xFFF));
        assert!(matches!(
            vmap.vmap(&pmap, 0xFFFF_F000, 0, 0x2000),
            Err(MapError::OutOfRange { call: "vmap", .. })
        ));
    }
}
