//! Shared host memory arena
//!
//! Every direct-mapped guest region (main RAM, ROMs, IOP RAM, scratchpad, VU
//! data memory) is carved out of a single shared-memory object. Keeping them
//! in one object means the fastmem mirror can map any of their pages by file
//! offset, and any host pointer into them can be turned back into an offset.

use std::ptr::NonNull;

use log::debug;

use super::PAGE_SIZE;
use crate::error::ArenaError;

/// Host page protection for a region or a fastmem page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protection {
    NoAccess,
    ReadOnly,
    ReadWrite,
}

impl Protection {
    #[cfg(unix)]
    pub(crate) fn to_prot(self) -> libc::c_int {
        match self {
            Protection::NoAccess => libc::PROT_NONE,
            Protection::ReadOnly => libc::PROT_READ,
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
        }
    }
}

/// A page-aligned slice of the arena handed out by [`MemoryArena::allocate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaBlock {
    offset: usize,
    size: usize,
}

impl ArenaBlock {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

/// A named region of the arena.
#[derive(Debug, Clone)]
pub struct ArenaRegion {
    pub name: &'static str,
    pub offset: usize,
    pub size: usize,
    pub protection: Protection,
}

pub struct MemoryArena {
    base: NonNull<u8>,
    size: usize,
    used: usize,
    regions: Vec<ArenaRegion>,
    backing: sys::Backing,
}

impl MemoryArena {
    /// Reserves `size` bytes (rounded up to whole pages) of zeroed memory.
    pub fn new(size: usize) -> Result<Self, ArenaError> {
        let size = round_up(size);
        let (base, backing) = sys::reserve(size)?;
        debug!("memory arena reserved: base={:p}, size=0x{:X}", base.as_ptr(), size);
        Ok(MemoryArena {
            base,
            size,
            used: 0,
            regions: Vec::new(),
            backing,
        })
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn remaining(&self) -> usize {
        self.size - self.used
    }

    pub fn regions(&self) -> &[ArenaRegion] {
        &self.regions
    }

    /// File descriptor of the shared-memory object, when the host has one.
    #[cfg(unix)]
    pub fn fd(&self) -> Option<std::os::fd::RawFd> {
        self.backing.fd()
    }

    /// Carves the next `size` bytes out of the arena.
    pub fn allocate(
        &mut self,
        name: &'static str,
        size: usize,
        protection: Protection,
    ) -> Result<ArenaBlock, ArenaError> {
        let size = round_up(size);
        if size > self.remaining() {
            return Err(ArenaError::Exhausted {
                requested: size,
                remaining: self.remaining(),
            });
        }
        let block = ArenaBlock {
            offset: self.used,
            size,
        };
        self.used += size;
        self.regions.push(ArenaRegion {
            name,
            offset: block.offset,
            size,
            protection,
        });
        debug!("arena region {}: offset=0x{:X}, size=0x{:X}", name, block.offset, size);
        Ok(block)
    }

    pub fn ptr(&self, block: ArenaBlock) -> NonNull<u8> {
        // SAFETY: blocks are only created by allocate() inside the arena.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(block.offset)) }
    }

    pub fn slice(&self, block: ArenaBlock) -> &[u8] {
        // SAFETY: the block lies inside the mapping, which lives as long as self.
        unsafe { std::slice::from_raw_parts(self.ptr(block).as_ptr(), block.size) }
    }

    pub fn slice_mut(&mut self, block: ArenaBlock) -> &mut [u8] {
        // SAFETY: as above; &mut self keeps Rust-side aliasing exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.ptr(block).as_ptr(), block.size) }
    }

    /// Arena offset and protection of the region containing `ptr`.
    pub fn offset_of(&self, ptr: *const u8) -> Option<(usize, Protection)> {
        let addr = ptr as usize;
        let base = self.base.as_ptr() as usize;
        if addr < base || addr >= base + self.used {
            return None;
        }
        let offset = addr - base;
        self.regions
            .iter()
            .find(|r| offset >= r.offset && offset < r.offset + r.size)
            .map(|r| (offset, r.protection))
    }
}

impl Drop for MemoryArena {
    fn drop(&mut self) {
        sys::release(self.base, self.size, &mut self.backing);
    }
}

fn round_up(size: usize) -> usize {
    let page = PAGE_SIZE as usize;
    (size + page - 1) & !(page - 1)
}

#[cfg(unix)]
mod sys {
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
    use std::ptr::{self, NonNull};

    use crate::error::ArenaError;

    pub(super) struct Backing(Option<OwnedFd>);

    impl Backing {
        pub(super) fn fd(&self) -> Option<RawFd> {
            self.0.as_ref().map(|fd| fd.as_raw_fd())
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn create_shared(size: usize) -> Result<Option<OwnedFd>, ArenaError> {
        let name = b"vtlb-arena\0";
        let fd = unsafe { libc::memfd_create(name.as_ptr() as *const libc::c_char, libc::MFD_CLOEXEC) };
        if fd < 0 {
            return Err(ArenaError::last_os("memfd_create"));
        }
        // SAFETY: fd was just returned by memfd_create and is owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        if unsafe { libc::ftruncate(fd.as_raw_fd(), size as libc::off_t) } != 0 {
            return Err(ArenaError::last_os("ftruncate arena"));
        }
        Ok(Some(fd))
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn create_shared(_size: usize) -> Result<Option<OwnedFd>, ArenaError> {
        Ok(None)
    }

    pub(super) fn reserve(size: usize) -> Result<(NonNull<u8>, Backing), ArenaError> {
        let fd = create_shared(size)?;
        let (flags, raw) = match &fd {
            Some(fd) => (libc::MAP_SHARED, fd.as_raw_fd()),
            None => (libc::MAP_PRIVATE | libc::MAP_ANON, -1),
        };
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                raw,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(ArenaError::last_os("map arena"));
        }
        let base = NonNull::new(ptr as *mut u8).ok_or(ArenaError::Unsupported)?;
        Ok((base, Backing(fd)))
    }

    pub(super) fn release(base: NonNull<u8>, size: usize, backing: &mut Backing) {
        unsafe {
            libc::munmap(base.as_ptr() as *mut libc::c_void, size);
        }
        backing.0.take();
    }
}

#[cfg(not(unix))]
mod sys {
    use std::alloc::{alloc_zeroed, dealloc, Layout};
    use std::ptr::NonNull;

    use crate::error::ArenaError;
    use crate::memory::PAGE_SIZE;

    pub(super) struct Backing;

    pub(super) fn reserve(size: usize) -> Result<(NonNull<u8>, Backing), ArenaError> {
        let layout = Layout::from_size_align(size.max(1), PAGE_SIZE as usize).map_err(|_| ArenaError::Unsupported)?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(ArenaError::Exhausted {
            requested: size,
            remaining: 0,
        })?;
        Ok((base, Backing))
    }

    pub(super) fn release(base: NonNull<u8>, size: usize, _backing: &mut Backing) {
        if let Ok(layout) = Layout::from_size_align(size.max(1), PAGE_SIZE as usize) {
            unsafe { dealloc(base.as_ptr(), layout) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_rounds_to_pages() {
        let mut arena = MemoryArena::new(0x10000).unwrap();
        let a = arena.allocate("a", 0x1800, Protection::ReadWrite).unwrap();
        let b = arena.allocate("b", 0x1000, Protection::ReadOnly).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(a.size(), 0x2000);
        assert_eq!(b.offset(), 0x2000);
        assert_eq!(arena.remaining(), 0xD000);
        assert_eq!(arena.ptr(a).as_ptr() as usize % PAGE_SIZE as usize, 0);
    }

    #[test]
    fn test_exhaustion() {
        let mut arena = MemoryArena::new(0x2000).unwrap();
        arena.allocate("ram", 0x2000, Protection::ReadWrite).unwrap();
        assert!(matches!(
            arena.allocate("more", 0x1000, Protection::ReadWrite),
            Err(ArenaError::Exhausted { requested: 0x1000, remaining: 0 })
        ));
    }

    #[test]
    fn test_offset_of_and_slices() {
        let mut arena = MemoryArena::new(0x4000).unwrap();
        let ram = arena.allocate("ram", 0x2000, Protection::ReadWrite).unwrap();
        let rom = arena.allocate("rom", 0x1000, Protection::ReadOnly).unwrap();

        arena.slice_mut(rom)[0x10] = 0xAB;
        let ptr = unsafe { arena.ptr(rom).as_ptr().add(0x10) };
        assert_eq!(arena.offset_of(ptr), Some((0x2010, Protection::ReadOnly)));
        assert_eq!(arena.offset_of(arena.ptr(ram).as_ptr()), Some((0, Protection::ReadWrite)));
        // allocated but past the last region
        let tail = unsafe { arena.base().as_ptr().add(0x3000) };
        assert_eq!(arena.offset_of(tail), None);

        assert_eq!(arena.slice(rom)[0x10], 0xAB);
    }
}
