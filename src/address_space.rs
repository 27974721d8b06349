//! The guest address space
//!
//! [`AddressSpace`] owns every table of the memory layer and is what CPU
//! cores and JIT backends hold a reference to. Boot code populates it in a
//! fixed order: register handlers, fill the physical map, project it into
//! the virtual map. Physical remaps are not propagated to virtual pages
//! already projected from them; re-`vmap` the affected range.

use std::mem::size_of;
use std::ops::Range;
use std::ptr::NonNull;

use log::{debug, error, warn};
use serde::{Deserialize, Serialize};

use crate::cache::{CacheControl, CacheModel, CacheOp, LINE_SIZE};
use crate::error::{ArenaError, MapError, Result};
use crate::fastmem::{BackpatchRecord, FaultOutcome, Fastmem, SitePatcher};
use crate::memory::{
    ArenaBlock, Bus, HandlerId, HandlerTable, LogBudget, MemValue, MemoryArena, MemoryHandler,
    PhysicalMap, Protection, Resolved, VirtualEntry, VirtualMap, PAGE_MASK, PAGE_SIZE,
};

/// Address space configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AddressSpaceConfig {
    /// Reserve the 4GB host mirror for JIT fastmem accesses.
    pub fastmem: bool,
    /// Route cacheable accesses through the data cache model.
    pub cache_emulation: bool,
    /// Bytes of shared host memory for every direct region.
    pub arena_size: usize,
    /// Log guest TLB misses and bus errors (first 50 only).
    pub log_guest_faults: bool,
}

impl Default for AddressSpaceConfig {
    fn default() -> Self {
        AddressSpaceConfig {
            fastmem: false,
            cache_emulation: false,
            arena_size: 64 * 1024 * 1024,
            log_guest_faults: true,
        }
    }
}

/// Guest-visible fault raised by an access, for the CPU core to deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestException {
    TlbMiss { vaddr: u32, write: bool },
    BusError { paddr: u32, write: bool },
}

pub struct AddressSpace {
    config: AddressSpaceConfig,
    handlers: HandlerTable,
    pmap: PhysicalMap,
    vmap: VirtualMap,
    cache: CacheModel,
    cache_control: CacheControl,
    fastmem: Option<Fastmem>,
    arena: MemoryArena,
    pending: Option<GuestException>,
    fault_log: LogBudget,
}

// SAFETY: the raw host pointers in the maps point into the arena or into
// buffers the caller promised to keep alive; the space is used from one
// thread at a time through &mut.
unsafe impl Send for AddressSpace {}

impl AddressSpace {
    /// Allocates the tables, registers the default handler and reserves host
    /// memory. Every physical page starts on the default handler and every
    /// virtual page unmapped.
    pub fn new(config: AddressSpaceConfig) -> Result<Self> {
        let arena = MemoryArena::new(config.arena_size)?;
        let fastmem = if !config.fastmem {
            None
        } else if config.cache_emulation {
            warn!("fastmem bypasses the cache model; disabled while cache emulation is on");
            None
        } else {
            Some(Fastmem::new(arena_fd(&arena)?)?)
        };
        debug!(
            "address space initialized: arena 0x{:X} bytes, fastmem {}, cache {}",
            arena.size(),
            fastmem.is_some(),
            config.cache_emulation
        );
        Ok(AddressSpace {
            config,
            handlers: HandlerTable::new(),
            pmap: PhysicalMap::new(),
            vmap: VirtualMap::new(),
            cache: CacheModel::new(),
            cache_control: CacheControl::new(),
            fastmem,
            arena,
            pending: None,
            fault_log: LogBudget::new(50),
        })
    }

    pub fn config(&self) -> &AddressSpaceConfig {
        &self.config
    }

    pub fn physical_map(&self) -> &PhysicalMap {
        &self.pmap
    }

    pub fn virtual_map(&self) -> &VirtualMap {
        &self.vmap
    }

    pub fn cache(&self) -> &CacheModel {
        &self.cache
    }

    pub fn cache_control(&self) -> &CacheControl {
        &self.cache_control
    }

    /// COP0 Config and TLB writes are mirrored here by the CPU core.
    pub fn cache_control_mut(&mut self) -> &mut CacheControl {
        &mut self.cache_control
    }

    pub fn arena(&self) -> &MemoryArena {
        &self.arena
    }

    // ---- handlers ----

    pub fn register_handler(&mut self, handler: Box<dyn MemoryHandler>) -> Result<HandlerId, MapError> {
        self.handlers.register(handler)
    }

    /// Swaps the callbacks behind `id`; every page routed to `id` follows.
    pub fn reassign_handler(
        &mut self,
        id: HandlerId,
        handler: Box<dyn MemoryHandler>,
    ) -> Result<Box<dyn MemoryHandler>, MapError> {
        self.handlers.reassign(id, handler)
    }

    pub fn handler_mut(&mut self, id: HandlerId) -> Option<&mut (dyn MemoryHandler + 'static)> {
        self.handlers.get_mut(id)
    }

    // ---- physical map ----

    /// Carves a region out of the shared arena.
    pub fn allocate(&mut self, name: &'static str, size: usize, protection: Protection) -> Result<ArenaBlock, ArenaError> {
        self.arena.allocate(name, size, protection)
    }

    pub fn block_mut(&mut self, block: ArenaBlock) -> &mut [u8] {
        self.arena.slice_mut(block)
    }

    pub fn block(&self, block: ArenaBlock) -> &[u8] {
        self.arena.slice(block)
    }

    /// Maps arena `block` at `[start, start + size)`, tiling the first
    /// `block_size` bytes when non-zero.
    pub fn map_block(&mut self, block: ArenaBlock, start: u32, size: u32, block_size: u32) -> Result<(), MapError> {
        let needed = if block_size == 0 { size } else { block_size } as usize;
        if needed > block.size() {
            return Err(MapError::BlockTooSmall {
                call: "map_block",
                needed,
                available: block.size(),
            });
        }
        self.pmap.map_block(self.arena.ptr(block), start, size, block_size)
    }

    /// Maps host memory outside the arena. Such pages never get a fastmem
    /// mirror.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for reads and writes of `block_size` (or `size`)
    /// bytes for as long as any virtual page projects it, and until the next
    /// [`AddressSpace::reset`] if the cache model may hold its lines.
    pub unsafe fn map_block_ptr(&mut self, ptr: NonNull<u8>, start: u32, size: u32, block_size: u32) -> Result<(), MapError> {
        self.pmap.map_block(ptr, start, size, block_size)
    }

    pub fn map_handler(&mut self, id: HandlerId, start: u32, size: u32) -> Result<(), MapError> {
        if !self.handlers.contains(id) {
            return Err(MapError::UnknownHandler { call: "map_handler", id });
        }
        self.pmap.map_handler(id, start, size)
    }

    pub fn mirror(&mut self, new_region: u32, start: u32, size: u32) -> Result<(), MapError> {
        self.pmap.mirror(new_region, start, size)
    }

    pub fn phys_ptr(&self, paddr: u32) -> Option<NonNull<u8>> {
        self.pmap.host_ptr(paddr)
    }

    // ---- virtual map ----

    pub fn vmap(&mut self, vaddr: u32, paddr: u32, size: u32) -> Result<()> {
        self.vmap.vmap(&self.pmap, vaddr, paddr, size)?;
        self.sync_fastmem(vaddr, size)
    }

    /// Maps arena `block` at `vaddr` with no physical address.
    pub fn vmap_block(&mut self, vaddr: u32, block: ArenaBlock, size: u32) -> Result<()> {
        if size as usize > block.size() {
            return Err(MapError::BlockTooSmall {
                call: "vmap_buffer",
                needed: size as usize,
                available: block.size(),
            }
            .into());
        }
        let ptr = self.arena.ptr(block);
        // SAFETY: the arena outlives every mapping into it.
        unsafe { self.vmap_buffer(vaddr, ptr, size) }
    }

    /// Maps a host buffer with no physical address at `vaddr`.
    ///
    /// # Safety
    ///
    /// Same contract as [`AddressSpace::map_block_ptr`], for `size` bytes.
    pub unsafe fn vmap_buffer(&mut self, vaddr: u32, buffer: NonNull<u8>, size: u32) -> Result<()> {
        self.vmap.vmap_buffer(vaddr, buffer, size)?;
        self.sync_fastmem(vaddr, size)
    }

    pub fn vmap_unmap(&mut self, vaddr: u32, size: u32) -> Result<()> {
        self.vmap.unmap(vaddr, size)?;
        self.sync_fastmem(vaddr, size)
    }

    pub fn v2p(&self, vaddr: u32) -> Option<u32> {
        self.vmap.v2p(vaddr)
    }

    fn sync_fastmem(&mut self, vaddr: u32, size: u32) -> Result<()> {
        let Some(fastmem) = self.fastmem.as_mut() else {
            return Ok(());
        };
        for i in 0..size / PAGE_SIZE {
            let v = vaddr + i * PAGE_SIZE;
            let target = match self.vmap.get(v) {
                VirtualEntry::Direct { delta } => self.arena.offset_of(delta.wrapping_add(v as usize) as *const u8),
                _ => None,
            };
            fastmem.sync_page(v, target)?;
        }
        Ok(())
    }

    // ---- access ----

    /// Reads a value through the full dispatch path.
    #[inline]
    pub fn read<T: MemValue>(&mut self, vaddr: u32) -> T {
        match self.vmap.resolve(vaddr) {
            Resolved::Host(ptr) => {
                if straddles_page::<T>(vaddr) {
                    return self.read_bytewise(vaddr);
                }
                if self.config.cache_emulation && self.cache_control.is_cached(vaddr) {
                    if !fits_line::<T>(vaddr) {
                        return self.read_bytewise(vaddr);
                    }
                    let phys = self.vmap.v2p(vaddr).unwrap_or(vaddr);
                    // SAFETY: mapped host pages are live for the whole line.
                    return unsafe { self.cache.read::<T>(vaddr, ptr, phys) };
                }
                // SAFETY: the page is mapped host memory and the access stays in it.
                unsafe { (ptr as *const T).read_unaligned() }
            }
            Resolved::Handler { id, paddr } => self.handlers.read::<T>(id, paddr),
            Resolved::TlbMiss => {
                self.raise(GuestException::TlbMiss { vaddr, write: false });
                T::default()
            }
            Resolved::BusError { paddr } => {
                self.raise(GuestException::BusError { paddr, write: false });
                T::default()
            }
        }
    }

    /// Writes a value through the full dispatch path.
    #[inline]
    pub fn write<T: MemValue>(&mut self, vaddr: u32, value: T) {
        match self.vmap.resolve(vaddr) {
            Resolved::Host(ptr) => {
                if straddles_page::<T>(vaddr) {
                    return self.write_bytewise(vaddr, value);
                }
                if self.config.cache_emulation && self.cache_control.is_cached(vaddr) {
                    if !fits_line::<T>(vaddr) {
                        return self.write_bytewise(vaddr, value);
                    }
                    let phys = self.vmap.v2p(vaddr).unwrap_or(vaddr);
                    // SAFETY: as in read.
                    return unsafe { self.cache.write::<T>(vaddr, ptr, phys, value) };
                }
                // SAFETY: as in read.
                unsafe { (ptr as *mut T).write_unaligned(value) }
            }
            Resolved::Handler { id, paddr } => self.handlers.write::<T>(id, paddr, value),
            Resolved::TlbMiss => self.raise(GuestException::TlbMiss { vaddr, write: true }),
            Resolved::BusError { paddr } => self.raise(GuestException::BusError { paddr, write: true }),
        }
    }

    /// Reads plain memory only: no handler, no cache, no exception.
    pub fn ram_read<T: MemValue>(&self, vaddr: u32) -> Option<T> {
        if straddles_page::<T>(vaddr) {
            let mut bytes = [0u8; 16];
            for (i, byte) in bytes.iter_mut().take(size_of::<T>()).enumerate() {
                *byte = self.ram_read::<u8>(vaddr.wrapping_add(i as u32))?;
            }
            // SAFETY: T is at most 16 bytes of plain integer data.
            return Some(unsafe { (bytes.as_ptr() as *const T).read_unaligned() });
        }
        match self.vmap.resolve(vaddr) {
            // SAFETY: the page is mapped host memory and the access stays in it.
            Resolved::Host(ptr) => Some(unsafe { (ptr as *const T).read_unaligned() }),
            _ => None,
        }
    }

    /// Writes plain memory only; returns false if any byte is not RAM-backed.
    pub fn ram_write<T: MemValue>(&mut self, vaddr: u32, value: T) -> bool {
        if straddles_page::<T>(vaddr) {
            let count = size_of::<T>() as u32;
            if (0..count).any(|i| !matches!(self.vmap.resolve(vaddr.wrapping_add(i)), Resolved::Host(_))) {
                return false;
            }
            let bytes = to_bytes(value);
            for i in 0..count {
                self.ram_write::<u8>(vaddr.wrapping_add(i), bytes[i as usize]);
            }
            return true;
        }
        match self.vmap.resolve(vaddr) {
            Resolved::Host(ptr) => {
                // SAFETY: as in ram_read.
                unsafe { (ptr as *mut T).write_unaligned(value) };
                true
            }
            _ => false,
        }
    }

    fn read_bytewise<T: MemValue>(&mut self, vaddr: u32) -> T {
        let mut bytes = [0u8; 16];
        for (i, byte) in bytes.iter_mut().take(size_of::<T>()).enumerate() {
            *byte = self.read::<u8>(vaddr.wrapping_add(i as u32));
        }
        // SAFETY: T is at most 16 bytes of plain integer data.
        unsafe { (bytes.as_ptr() as *const T).read_unaligned() }
    }

    fn write_bytewise<T: MemValue>(&mut self, vaddr: u32, value: T) {
        let bytes = to_bytes(value);
        for (i, &byte) in bytes.iter().take(size_of::<T>()).enumerate() {
            self.write::<u8>(vaddr.wrapping_add(i as u32), byte);
        }
    }

    // ---- guest exceptions ----

    fn raise(&mut self, exception: GuestException) {
        if self.config.log_guest_faults && self.fault_log.allow() {
            match exception {
                GuestException::TlbMiss { vaddr, write } => {
                    warn!("guest tlb miss: {} 0x{:08X}", if write { "write" } else { "read" }, vaddr)
                }
                GuestException::BusError { paddr, write } => {
                    warn!("guest bus error: {} 0x{:08X}", if write { "write" } else { "read" }, paddr)
                }
            }
        }
        if self.pending.is_none() {
            self.pending = Some(exception);
        }
    }

    /// Oldest undelivered guest exception, if any.
    pub fn take_exception(&mut self) -> Option<GuestException> {
        self.pending.take()
    }

    // ---- cache ----

    /// Executes a guest `CACHE` data-cache op on `vaddr`.
    ///
    /// Returns the packed tag for [`CacheOp::IndexLoadTag`].
    pub fn cache_op(&mut self, op: CacheOp, vaddr: u32, tag_lo: u64) -> Option<u64> {
        // SAFETY: every line in the model was filled from a mapped host page,
        // which stays live until reset.
        unsafe {
            if op.is_hit_op() {
                if let Resolved::Host(ptr) = self.vmap.resolve(vaddr) {
                    self.cache.hit_op(op, vaddr, ptr as usize);
                }
                None
            } else {
                self.cache.index_op(op, vaddr, tag_lo)
            }
        }
    }

    // ---- fastmem ----

    pub fn fastmem(&self) -> Option<&Fastmem> {
        self.fastmem.as_ref()
    }

    /// Host address JIT code adds guest addresses to; `None` without fastmem.
    pub fn fastmem_base(&self) -> Option<NonNull<u8>> {
        self.fastmem.as_ref().map(Fastmem::base)
    }

    /// Reprotects every fastmem alias of `block`, e.g. to make JIT stores to
    /// a page fault into their slow path while the dispatch path keeps
    /// writing. A later `vmap` over an alias restores the block's own
    /// protection for that page.
    pub fn update_fastmem_protection(&mut self, block: ArenaBlock, protection: Protection) -> Result<()> {
        if let Some(fastmem) = self.fastmem.as_mut() {
            fastmem.update_protection(block.offset() as u32, block.size() as u32, protection)?;
        }
        Ok(())
    }

    pub fn register_backpatch_site(&mut self, site: usize, record: BackpatchRecord) {
        if let Some(fastmem) = &self.fastmem {
            fastmem.state().table.register(site, record);
        }
    }

    /// Drops the sites of a freed JIT block.
    pub fn remove_backpatch_sites(&mut self, range: Range<usize>) {
        if let Some(fastmem) = &self.fastmem {
            fastmem.state().table.remove_sites(range);
        }
    }

    /// Whether the access at `guest_pc` already faulted and must use the slow path.
    pub fn is_faulting_pc(&self, guest_pc: u32) -> bool {
        self.fastmem
            .as_ref()
            .is_some_and(|fastmem| fastmem.state().table.is_faulting_pc(guest_pc))
    }

    /// Guest PCs whose blocks should be recompiled since the last call.
    pub fn take_recompile_requests(&mut self) -> Vec<u32> {
        self.fastmem
            .as_ref()
            .map(|fastmem| fastmem.state().table.take_recompile_requests())
            .unwrap_or_default()
    }

    pub fn set_site_patcher(&mut self, patcher: Box<dyn SitePatcher>) {
        if let Some(fastmem) = &self.fastmem {
            fastmem.set_patcher(patcher);
        }
    }

    /// Offers a host fault to the backpatcher, for hosts without the
    /// built-in signal route.
    pub fn handle_fastmem_fault(&self, host_pc: usize, fault_addr: usize) -> FaultOutcome {
        match &self.fastmem {
            Some(fastmem) => fastmem.context().handle_fault(host_pc, fault_addr),
            None => FaultOutcome::NotFastmem,
        }
    }

    // ---- lifecycle ----

    /// Back to the state right after [`AddressSpace::new`], keeping
    /// registered handlers and arena regions.
    pub fn reset(&mut self) -> Result<()> {
        self.cache.reset();
        self.cache_control.reset();
        self.pmap.reset();
        self.vmap.reset();
        self.pending = None;
        if let Some(fastmem) = self.fastmem.as_mut() {
            fastmem.state().table.clear();
            fastmem.remove_all()?;
        }
        debug!("address space reset");
        Ok(())
    }

    /// Releases the fastmem mirror and its fault route. Accesses through the
    /// dispatch path keep working.
    pub fn shutdown(&mut self) {
        if self.fastmem.take().is_some() {
            debug!("address space shut down");
        }
        self.cache.reset();
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[inline(always)]
fn straddles_page<T>(vaddr: u32) -> bool {
    (vaddr & PAGE_MASK) as usize + size_of::<T>() > PAGE_SIZE as usize
}

#[inline(always)]
fn fits_line<T>(vaddr: u32) -> bool {
    vaddr as usize % LINE_SIZE + size_of::<T>() <= LINE_SIZE
}

fn to_bytes<T: MemValue>(value: T) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    // SAFETY: T is at most 16 bytes of plain integer data.
    unsafe { (bytes.as_mut_ptr() as *mut T).write_unaligned(value) };
    bytes
}

#[cfg(unix)]
fn arena_fd(arena: &MemoryArena) -> Result<i32, ArenaError> {
    arena.fd().ok_or_else(|| {
        error!("fastmem needs a shared arena object");
        ArenaError::Unsupported
    })
}

#[cfg(not(unix))]
fn arena_fd(_arena: &MemoryArena) -> Result<i32, ArenaError> {
    Err(ArenaError::Unsupported)
}

impl Bus for AddressSpace {
    fn read8(&mut self, addr: u32) -> u8 {
        self.read(addr)
    }

    fn write8(&mut self, addr: u32, value: u8) {
        self.write(addr, value)
    }

    fn read16(&mut self, addr: u32) -> u16 {
        self.read(addr)
    }

    fn write16(&mut self, addr: u32, value: u16) {
        self.write(addr, value)
    }

    fn read32(&mut self, addr: u32) -> u32 {
        self.read(addr)
    }

    fn write32(&mut self, addr: u32, value: u32) {
        self.write(addr, value)
    }

    fn read64(&mut self, addr: u32) -> u64 {
        self.read(addr)
    }

    fn write64(&mut self, addr: u32, value: u64) {
        self.write(addr, value)
    }

    fn read128(&mut self, addr: u32) -> u128 {
        self.read(addr)
    }

    fn write128(&mut self, addr: u32, value: u128) {
        self.write(addr, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TlbEntry;
    use crate::error::Error;
    use crate::memory::NullHandler;

    fn space() -> AddressSpace {
        AddressSpace::new(AddressSpaceConfig {
            arena_size: 0x40000,
            ..AddressSpaceConfig::default()
        })
        .unwrap()
    }

    fn with_ram(space: &mut AddressSpace, size: u32) -> ArenaBlock {
        let ram = space.allocate("ram", size as usize, Protection::ReadWrite).unwrap();
        space.map_block(ram, 0, size, 0).unwrap();
        ram
    }

    struct Log(Vec<(u32, u8)>);

    impl MemoryHandler for Log {
        fn read8(&mut self, paddr: u32) -> u8 {
            self.0.push((paddr, 8));
            0x11
        }

        fn write8(&mut self, _paddr: u32, _value: u8) {}

        fn read32(&mut self, paddr: u32) -> u32 {
            self.0.push((paddr, 32));
            0x1234_5678
        }
    }

    #[test]
    fn test_aliases_share_memory() {
        let mut space = space();
        with_ram(&mut space, 0x4000);
        space.vmap(0, 0, 0x4000).unwrap();
        space.vmap(0x8000_0000, 0, 0x4000).unwrap();

        space.write::<u32>(0x1000, 0xDEAD_BEEF);
        assert_eq!(space.read::<u32>(0x8000_1000), 0xDEAD_BEEF);
        assert_eq!(space.read::<u16>(0x8000_1002), 0xDEAD);
        assert_eq!(space.v2p(0x8000_1002), Some(0x1002));
        assert_eq!(space.take_exception(), None);
    }

    #[test]
    fn test_handler_receives_physical_address() {
        let mut space = space();
        let id = space.register_handler(Box::new(Log(Vec::new()))).unwrap();
        space.map_handler(id, 0x1000_3000, 0x1000).unwrap();
        space.vmap(0xB000_3000, 0x1000_3000, 0x1000).unwrap();

        assert_eq!(space.read::<u32>(0xB000_3010), 0x1234_5678);
        assert_eq!(space.read::<u8>(0xB000_3011), 0x11);
        assert_eq!(space.ram_read::<u32>(0xB000_3010), None);
        assert!(!space.ram_write::<u32>(0xB000_3010, 1));

        let old = space.reassign_handler(id, Box::new(NullHandler)).unwrap();
        assert_eq!(space.read::<u32>(0xB000_3010), 0);
        drop(old);
    }

    #[test]
    fn test_unmapped_latches_exception() {
        let mut space = space();
        assert_eq!(space.read::<u64>(0x1234_5678), 0);
        space.write::<u8>(0x0000_0010, 5);
        assert_eq!(
            space.take_exception(),
            Some(GuestException::TlbMiss {
                vaddr: 0x1234_5678,
                write: false
            })
        );
        assert_eq!(space.take_exception(), None);

        space.vmap(0x4000_0000, 0x2000_0000, 0x1000).unwrap();
        space.write::<u32>(0x4000_0004, 1);
        assert_eq!(
            space.take_exception(),
            Some(GuestException::BusError {
                paddr: 0x2000_0004,
                write: true
            })
        );
    }

    #[test]
    fn test_page_straddling_access() {
        let mut space = space();
        let ram = with_ram(&mut space, 0x2000);
        // second page of RAM first, so the virtual pages are not host-contiguous
        space.vmap(0x1000, 0x1000, 0x1000).unwrap();
        space.vmap(0x2000, 0, 0x1000).unwrap();

        space.write::<u32>(0x1FFE, 0xAABB_CCDD);
        let bytes = space.block(ram);
        assert_eq!(&bytes[0x1FFE..0x2000], &[0xDD, 0xCC]);
        assert_eq!(&bytes[0..2], &[0xBB, 0xAA]);
        assert_eq!(space.read::<u32>(0x1FFE), 0xAABB_CCDD);
        assert_eq!(space.ram_read::<u32>(0x1FFE), Some(0xAABB_CCDD));
        assert_eq!(space.ram_read::<u32>(0x2FFE), None);
    }

    #[test]
    fn test_cached_region_defers_stores() {
        let mut space = AddressSpace::new(AddressSpaceConfig {
            cache_emulation: true,
            arena_size: 0x10000,
            ..AddressSpaceConfig::default()
        })
        .unwrap();
        let ram = with_ram(&mut space, 0x4000);
        space.vmap(0x0000_0000, 0, 0x4000).unwrap();
        space.vmap(0x2000_0000, 0, 0x4000).unwrap();
        let control = space.cache_control_mut();
        control.set_config(1 << 16);
        control.set_tlb_entry(
            0,
            TlbEntry {
                page_mask: 0x6000,
                entry_hi: 0,
                entry_lo0: 3 << 3,
                entry_lo1: 0,
            },
        );

        space.write::<u32>(0x100, 7);
        assert_eq!(space.read::<u32>(0x100), 7);
        assert_eq!(space.read::<u32>(0x2000_0100), 0);

        space.cache_op(CacheOp::HitWritebackInvalidate, 0x100, 0);
        assert_eq!(space.read::<u32>(0x2000_0100), 7);
        assert_eq!(space.block(ram)[0x100], 7);
    }

    #[test]
    fn test_cached_access_across_lines_goes_through_cache() {
        let mut space = AddressSpace::new(AddressSpaceConfig {
            cache_emulation: true,
            arena_size: 0x10000,
            ..AddressSpaceConfig::default()
        })
        .unwrap();
        let ram = with_ram(&mut space, 0x4000);
        space.vmap(0x0000_0000, 0, 0x4000).unwrap();
        let control = space.cache_control_mut();
        control.set_config(1 << 16);
        control.set_tlb_entry(
            0,
            TlbEntry {
                page_mask: 0x6000,
                entry_hi: 0,
                entry_lo0: 3 << 3,
                entry_lo1: 0,
            },
        );

        space.write::<u32>(0x40, 0xAABB_CCDD);
        assert_eq!(space.read::<u64>(0x3C), 0xAABB_CCDD_0000_0000);

        space.write::<u32>(0x3E, 0x1122_3344);
        assert_eq!(space.read::<u32>(0x40), 0xAABB_1122);
        assert_eq!(space.read::<u16>(0x3E), 0x3344);
        // nothing reached backing memory yet
        assert_eq!(&space.block(ram)[0x3C..0x44], &[0u8; 8]);
    }

    #[test]
    fn test_setup_errors_name_the_call() {
        let mut space = space();
        let small = space.allocate("small", 0x1000, Protection::ReadWrite).unwrap();
        assert_eq!(
            space.map_block(small, 0, 0x2000, 0),
            Err(MapError::BlockTooSmall {
                call: "map_block",
                needed: 0x2000,
                available: 0x1000
            })
        );
        assert!(matches!(
            space.vmap(0x123, 0, 0x1000),
            Err(Error::Map(MapError::MisalignedAddress { call: "vmap", .. }))
        ));
        assert!(matches!(
            space.map_handler(HandlerId::from_raw(50), 0, 0x1000),
            Err(MapError::UnknownHandler { call: "map_handler", .. })
        ));
    }

    #[test]
    fn test_reset_keeps_handlers() {
        let mut space = space();
        with_ram(&mut space, 0x1000);
        let id = space.register_handler(Box::new(NullHandler)).unwrap();
        space.vmap(0, 0, 0x1000).unwrap();
        space.reset().unwrap();

        assert_eq!(space.read::<u32>(0), 0);
        assert!(space.take_exception().is_some());
        space.map_handler(id, 0, 0x1000).unwrap();
        assert!(!space.is_faulting_pc(0));
        assert!(space.take_recompile_requests().is_empty());
    }
}
