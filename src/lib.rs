//! PS2 EE memory virtualization
//!
//! Page-granular dispatch of guest loads and stores onto host memory or
//! memory-mapped device handlers, an EE data cache model for the accesses
//! that need one, and fastmem support for JIT code: a 4GB host mirror of the
//! guest space plus one-shot backpatching of faulting access sites.
//!
//! Everything hangs off an [`AddressSpace`]:
//!
//! ```no_run
//! use vtlb::{AddressSpace, AddressSpaceConfig, HardwareHandlers, StandardLayout};
//!
//! let mut space = AddressSpace::new(AddressSpaceConfig::default())?;
//! let layout = StandardLayout::install(&mut space, &HardwareHandlers::default())?;
//! space.write::<u32>(0x8000_1000, 0xDEAD_BEEF);
//! assert_eq!(space.read::<u32>(0xA000_1000), 0xDEAD_BEEF);
//! # let _ = layout;
//! # Ok::<(), vtlb::Error>(())
//! ```

pub mod address_space;
pub mod cache;
pub mod error;
pub mod fastmem;
pub mod memory;

pub use address_space::{AddressSpace, AddressSpaceConfig, GuestException};
pub use cache::{CacheControl, CacheModel, CacheOp, CacheTag, TlbEntry};
pub use error::{ArenaError, BackpatchError, Error, MapError, Result};
pub use fastmem::{BackpatchRecord, DispatchOnlyCodegen, FaultOutcome, GuardedAccess, SitePatcher, TrustedCodegen};
pub use memory::{
    AccessWidth, ArenaBlock, Bus, HandlerId, HardwareHandlers, MemValue, MemoryHandler, NullHandler, Protection,
    StandardLayout,
};
