//! Fastmem: a host mirror of the guest virtual space for JIT code
//!
//! `base + vaddr` either addresses the same arena byte the dispatch path
//! would reach, or faults. Faults at registered JIT sites are healed once by
//! rewriting the site into a slow-path call (see [`backpatch`]).
//!
//! The mirror is kept in lockstep with the virtual map by
//! [`AddressSpace`](crate::AddressSpace); nothing here walks the dispatch
//! tables itself.

pub mod area;
pub mod backpatch;
pub mod codegen;
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub mod fault;
pub mod mappings;
#[cfg(target_arch = "x86_64")]
pub mod slowpath;
#[cfg(all(feature = "jit-dynasm", target_arch = "x86_64", unix))]
pub mod x64;

pub use area::{FastmemArea, FASTMEM_AREA_SIZE};
pub use backpatch::{BackpatchRecord, BackpatchTable, FaultContext, FaultOutcome, FaultState};
pub use codegen::{
    encode_call_patch, DispatchOnlyCodegen, EmittedSite, GuardedAccess, PendingSite, SitePatcher,
    TrustedCodegen,
};
pub use mappings::{FastmemMappings, NO_FASTMEM_MAPPING};

use std::ptr::NonNull;
use std::sync::{Arc, MutexGuard};

use log::debug;

use crate::error::ArenaError;
use crate::memory::Protection;

pub struct Fastmem {
    area: FastmemArea,
    mappings: FastmemMappings,
    fd: i32,
    context: Arc<FaultContext>,
}

impl Fastmem {
    /// Reserves the mirror over the shared arena object `fd` and routes host
    /// faults inside it to this instance.
    pub fn new(fd: i32) -> Result<Self, ArenaError> {
        let area = FastmemArea::reserve()?;
        let context = Arc::new(FaultContext::new(
            area.base().as_ptr() as usize,
            area.size(),
            Box::new(DispatchOnlyCodegen),
        ));
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        {
            fault::install()?;
            // SAFETY: `context` lives in self and is deactivated in Drop.
            unsafe { fault::activate(&context) };
        }
        debug!("fastmem enabled, base {:p}", area.base().as_ptr());
        Ok(Fastmem {
            area,
            mappings: FastmemMappings::new(),
            fd,
            context,
        })
    }

    pub fn base(&self) -> NonNull<u8> {
        self.area.base()
    }

    pub fn mappings(&self) -> &FastmemMappings {
        &self.mappings
    }

    pub fn context(&self) -> &Arc<FaultContext> {
        &self.context
    }

    /// Locked view of the backpatch table and active patcher.
    pub fn state(&self) -> MutexGuard<'_, FaultState> {
        self.context.lock()
    }

    /// Points guest page `vaddr` at arena `offset`, or makes it fault.
    pub fn sync_page(&mut self, vaddr: u32, target: Option<(usize, Protection)>) -> Result<(), ArenaError> {
        match target {
            Some((offset, protection)) => {
                self.area.map_page(vaddr, self.fd, offset, protection)?;
                self.mappings.create(vaddr, offset as u32);
            }
            None => {
                if self.mappings.remove(vaddr).is_some() {
                    self.area.unmap_page(vaddr)?;
                }
            }
        }
        Ok(())
    }

    /// Reprotects every virtual alias of arena range `[offset, offset + size)`.
    pub fn update_protection(&mut self, offset: u32, size: u32, protection: Protection) -> Result<(), ArenaError> {
        for vaddr in self.mappings.aliases_in(offset, size) {
            self.area.protect_page(vaddr, protection)?;
        }
        Ok(())
    }

    /// Arena offset behind a host address inside the mirror.
    pub fn resolve(&self, host_addr: usize) -> Option<u32> {
        self.mappings.resolve(self.guest_address(host_addr)?)
    }

    /// Guest virtual address of a host address inside the mirror.
    pub fn guest_address(&self, host_addr: usize) -> Option<u32> {
        if !self.area.contains(host_addr) {
            return None;
        }
        Some((host_addr - self.area.base().as_ptr() as usize) as u32)
    }

    /// Drops every page mapping; the whole mirror faults again.
    pub fn remove_all(&mut self) -> Result<(), ArenaError> {
        self.mappings.clear();
        self.area.unmap_all()
    }

    pub fn set_patcher(&self, patcher: Box<dyn SitePatcher>) {
        self.context.lock().patcher = patcher;
    }
}

impl Drop for Fastmem {
    fn drop(&mut self) {
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        fault::deactivate(&self.context);
        debug!("fastmem disabled");
    }
}
