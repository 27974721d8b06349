//! The 4GB host reservation backing fastmem
//!
//! The whole reservation starts out `PROT_NONE`. Guest pages that resolve to
//! arena memory are mapped over it with `MAP_FIXED`, sharing the arena's
//! memfd, so `base + vaddr` addresses the same bytes as the dispatch path.
//! Every other page faults.

use std::ptr::NonNull;

use log::{debug, trace};

use crate::error::ArenaError;
use crate::memory::{Protection, PAGE_SIZE};

pub const FASTMEM_AREA_SIZE: usize = 1 << 32;

pub struct FastmemArea {
    base: NonNull<u8>,
}

// SAFETY: the area is a plain address range; mutation goes through &mut self.
unsafe impl Send for FastmemArea {}

impl FastmemArea {
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn size(&self) -> usize {
        FASTMEM_AREA_SIZE
    }

    pub fn contains(&self, addr: usize) -> bool {
        let base = self.base.as_ptr() as usize;
        addr >= base && addr - base < FASTMEM_AREA_SIZE
    }

    #[allow(dead_code)]
    fn page_ptr(&self, vaddr: u32) -> *mut u8 {
        let page = (vaddr & !(PAGE_SIZE - 1)) as usize;
        // SAFETY: every u32 is inside the 4GB reservation.
        unsafe { self.base.as_ptr().add(page) }
    }
}

#[cfg(all(any(target_os = "linux", target_os = "android"), target_pointer_width = "64"))]
impl FastmemArea {
    /// Reserves the address range without committing memory.
    pub fn reserve() -> Result<Self, ArenaError> {
        let ptr = unsafe { reserve_at(std::ptr::null_mut(), 0)? };
        let base = NonNull::new(ptr as *mut u8).ok_or(ArenaError::Unsupported)?;
        debug!("fastmem area reserved at {:p}", base.as_ptr());
        Ok(FastmemArea { base })
    }

    /// Maps the arena page at `offset` of `fd` over guest page `vaddr`.
    pub fn map_page(
        &mut self,
        vaddr: u32,
        fd: std::os::fd::RawFd,
        offset: usize,
        protection: Protection,
    ) -> Result<(), ArenaError> {
        let target = self.page_ptr(vaddr) as *mut libc::c_void;
        let ptr = unsafe {
            libc::mmap(
                target,
                PAGE_SIZE as usize,
                protection.to_prot(),
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                offset as libc::off_t,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ArenaError::last_os("map fastmem page"));
        }
        trace!("fastmem map 0x{:08X} -> arena 0x{:X} ({:?})", vaddr, offset, protection);
        Ok(())
    }

    /// Puts guest page `vaddr` back to an inaccessible anonymous page.
    pub fn unmap_page(&mut self, vaddr: u32) -> Result<(), ArenaError> {
        unsafe { reserve_at(self.page_ptr(vaddr) as *mut libc::c_void, PAGE_SIZE as usize)? };
        trace!("fastmem unmap 0x{:08X}", vaddr);
        Ok(())
    }

    /// Changes the protection of an already mapped page.
    pub fn protect_page(&mut self, vaddr: u32, protection: Protection) -> Result<(), ArenaError> {
        let rc = unsafe { libc::mprotect(self.page_ptr(vaddr) as *mut libc::c_void, PAGE_SIZE as usize, protection.to_prot()) };
        if rc != 0 {
            return Err(ArenaError::last_os("protect fastmem page"));
        }
        Ok(())
    }

    /// Drops every page mapping in one call.
    pub fn unmap_all(&mut self) -> Result<(), ArenaError> {
        unsafe { reserve_at(self.base.as_ptr() as *mut libc::c_void, FASTMEM_AREA_SIZE)? };
        debug!("fastmem area cleared");
        Ok(())
    }
}

/// Anonymous `PROT_NONE` mapping; fixed when `target` is non-null.
#[cfg(all(any(target_os = "linux", target_os = "android"), target_pointer_width = "64"))]
unsafe fn reserve_at(target: *mut libc::c_void, size: usize) -> Result<*mut libc::c_void, ArenaError> {
    let (size, mut flags) = if target.is_null() {
        (FASTMEM_AREA_SIZE, 0)
    } else {
        (size, libc::MAP_FIXED)
    };
    flags |= libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE;
    let ptr = libc::mmap(target, size, libc::PROT_NONE, flags, -1, 0);
    if ptr == libc::MAP_FAILED {
        return Err(ArenaError::last_os("reserve fastmem range"));
    }
    Ok(ptr)
}

#[cfg(all(any(target_os = "linux", target_os = "android"), target_pointer_width = "64"))]
impl Drop for FastmemArea {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base.as_ptr() as *mut libc::c_void, FASTMEM_AREA_SIZE);
        }
        debug!("fastmem area released");
    }
}

#[cfg(not(all(any(target_os = "linux", target_os = "android"), target_pointer_width = "64")))]
impl FastmemArea {
    pub fn reserve() -> Result<Self, ArenaError> {
        Err(ArenaError::Unsupported)
    }

    pub fn map_page(&mut self, _vaddr: u32, _fd: i32, _offset: usize, _protection: Protection) -> Result<(), ArenaError> {
        Err(ArenaError::Unsupported)
    }

    pub fn unmap_page(&mut self, _vaddr: u32) -> Result<(), ArenaError> {
        Err(ArenaError::Unsupported)
    }

    pub fn protect_page(&mut self, _vaddr: u32, _protection: Protection) -> Result<(), ArenaError> {
        Err(ArenaError::Unsupported)
    }

    pub fn unmap_all(&mut self) -> Result<(), ArenaError> {
        Err(ArenaError::Unsupported)
    }
}

#[cfg(all(test, target_os = "linux", target_pointer_width = "64"))]
mod tests {
    use super::*;
    use crate::memory::MemoryArena;

    #[test]
    fn test_page_mirrors_arena() {
        let mut arena = MemoryArena::new(0x4000).unwrap();
        let block = arena.allocate("ram", 0x2000, Protection::ReadWrite).unwrap();
        let mut area = FastmemArea::reserve().unwrap();
        let fd = arena.fd().unwrap();

        area.map_page(0x8000_1000, fd, block.offset() + 0x1000, Protection::ReadWrite).unwrap();
        area.map_page(0x0000_1000, fd, block.offset() + 0x1000, Protection::ReadOnly).unwrap();

        arena.slice_mut(block)[0x1008] = 0x77;
        let mirror = unsafe { *area.base().as_ptr().add(0x8000_1008) };
        assert_eq!(mirror, 0x77);

        unsafe { *area.base().as_ptr().add(0x8000_1010) = 0x42 };
        assert_eq!(arena.slice(block)[0x1010], 0x42);
        assert_eq!(unsafe { *area.base().as_ptr().add(0x1010) }, 0x42);

        area.unmap_page(0x8000_1000).unwrap();
        assert!(area.contains(area.base().as_ptr() as usize + 0x8000_1000));
        area.unmap_all().unwrap();
    }
}
