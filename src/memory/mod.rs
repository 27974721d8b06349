//! Guest memory dispatch tables
//!
//! Layout of the emulated address space, leaves first:
//!
//! - [`HandlerTable`]: up to 128 registered memory-mapped devices.
//! - [`PhysicalMap`]: one [`PhysicalEntry`] per 4KB page of the 512MB physical
//!   window, either a host pointer or a handler id.
//! - [`VirtualMap`]: one [`VirtualEntry`] per 4KB page of the 4GB virtual space,
//!   with the physical disposition pre-folded against the page's virtual base.
//! - [`MemoryArena`]: the shared host memory object every direct region lives in.

pub mod arena;
pub mod handlers;
pub mod layout;
pub mod physical;
pub mod virtual_map;

pub use arena::{ArenaBlock, ArenaRegion, MemoryArena, Protection};
pub use handlers::{DefaultHandler, HandlerId, HandlerTable, NullHandler, MAX_HANDLERS};
pub use layout::{HardwareHandlers, StandardLayout};
pub use physical::{PhysicalEntry, PhysicalMap};
pub use virtual_map::{Resolved, VirtualEntry, VirtualMap, NO_PHYSICAL};

use std::fmt;

pub const PAGE_BITS: u32 = 12;
pub const PAGE_SIZE: u32 = 1 << PAGE_BITS;
pub const PAGE_MASK: u32 = PAGE_SIZE - 1;

/// Size of the physical window covered by the [`PhysicalMap`].
pub const PMAP_SIZE: u32 = 0x2000_0000;
pub const PMAP_ITEMS: usize = (PMAP_SIZE >> PAGE_BITS) as usize;

/// Number of 4KB pages in the 32-bit virtual space.
pub const VMAP_ITEMS: usize = 1 << (32 - PAGE_BITS);

/// Trait for memory-mapped devices
///
/// Handlers always receive the *physical* address of the access. Only
/// `read8`/`write8` are required; wider widths default to little-endian
/// composition of narrower ones, so a device overrides just the widths its
/// registers decode.
pub trait MemoryHandler: Send {
    fn read8(&mut self, paddr: u32) -> u8;
    fn write8(&mut self, paddr: u32, value: u8);

    fn read16(&mut self, paddr: u32) -> u16 {
        let lo = self.read8(paddr) as u16;
        let hi = self.read8(paddr.wrapping_add(1)) as u16;
        lo | (hi << 8)
    }

    fn write16(&mut self, paddr: u32, value: u16) {
        self.write8(paddr, value as u8);
        self.write8(paddr.wrapping_add(1), (value >> 8) as u8);
    }

    fn read32(&mut self, paddr: u32) -> u32 {
        let lo = self.read16(paddr) as u32;
        let hi = self.read16(paddr.wrapping_add(2)) as u32;
        lo | (hi << 16)
    }

    fn write32(&mut self, paddr: u32, value: u32) {
        self.write16(paddr, value as u16);
        self.write16(paddr.wrapping_add(2), (value >> 16) as u16);
    }

    fn read64(&mut self, paddr: u32) -> u64 {
        let lo = self.read32(paddr) as u64;
        let hi = self.read32(paddr.wrapping_add(4)) as u64;
        lo | (hi << 32)
    }

    fn write64(&mut self, paddr: u32, value: u64) {
        self.write32(paddr, value as u32);
        self.write32(paddr.wrapping_add(4), (value >> 32) as u32);
    }

    fn read128(&mut self, paddr: u32) -> u128 {
        let lo = self.read64(paddr) as u128;
        let hi = self.read64(paddr.wrapping_add(8)) as u128;
        lo | (hi << 64)
    }

    fn write128(&mut self, paddr: u32, value: u128) {
        self.write64(paddr, value as u64);
        self.write64(paddr.wrapping_add(8), (value >> 64) as u64);
    }
}

/// Width of a single guest access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessWidth {
    W8,
    W16,
    W32,
    W64,
    W128,
}

impl AccessWidth {
    pub const fn bits(self) -> u8 {
        match self {
            AccessWidth::W8 => 8,
            AccessWidth::W16 => 16,
            AccessWidth::W32 => 32,
            AccessWidth::W64 => 64,
            AccessWidth::W128 => 128,
        }
    }

    pub const fn bytes(self) -> u32 {
        self.bits() as u32 / 8
    }

    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            8 => Some(AccessWidth::W8),
            16 => Some(AccessWidth::W16),
            32 => Some(AccessWidth::W32),
            64 => Some(AccessWidth::W64),
            128 => Some(AccessWidth::W128),
            _ => None,
        }
    }
}

impl fmt::Display for AccessWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.bits())
    }
}

/// A value that can be loaded or stored by a single guest access.
///
/// Implemented for `u8`, `u16`, `u32`, `u64` and `u128`; the width decides
/// which [`MemoryHandler`] callback a handler-mapped access lands in.
pub trait MemValue: Copy + Default + PartialEq + fmt::Debug + 'static {
    const WIDTH: AccessWidth;

    fn read_from(handler: &mut dyn MemoryHandler, paddr: u32) -> Self;
    fn write_to(self, handler: &mut dyn MemoryHandler, paddr: u32);
}

macro_rules! mem_value {
    ($ty:ty, $width:ident, $read:ident, $write:ident) => {
        impl MemValue for $ty {
            const WIDTH: AccessWidth = AccessWidth::$width;

            #[inline(always)]
            fn read_from(handler: &mut dyn MemoryHandler, paddr: u32) -> Self {
                handler.$read(paddr)
            }

            #[inline(always)]
            fn write_to(self, handler: &mut dyn MemoryHandler, paddr: u32) {
                handler.$write(paddr, self)
            }
        }
    };
}

mem_value!(u8, W8, read8, write8);
mem_value!(u16, W16, read16, write16);
mem_value!(u32, W32, read32, write32);
mem_value!(u64, W64, read64, write64);
mem_value!(u128, W128, read128, write128);

/// Bus interface for CPU memory access
pub trait Bus {
    fn read8(&mut self, addr: u32) -> u8;
    fn write8(&mut self, addr: u32, value: u8);
    fn read16(&mut self, addr: u32) -> u16;
    fn write16(&mut self, addr: u32, value: u16);
    fn read32(&mut self, addr: u32) -> u32;
    fn write32(&mut self, addr: u32, value: u32);
    fn read64(&mut self, addr: u32) -> u64;
    fn write64(&mut self, addr: u32, value: u64);
    fn read128(&mut self, addr: u32) -> u128;
    fn write128(&mut self, addr: u32, value: u128);
}

/// Caps how many times a noisy diagnostic is logged.
#[derive(Debug, Clone)]
pub(crate) struct LogBudget {
    remaining: u32,
}

impl LogBudget {
    pub(crate) const fn new(limit: u32) -> Self {
        LogBudget { remaining: limit }
    }

    pub(crate) fn allow(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }
}

#[inline(always)]
pub(crate) const fn page_index(addr: u32) -> usize {
    (addr >> PAGE_BITS) as usize
}

#[inline(always)]
pub(crate) const fn is_page_aligned(value: u32) -> bool {
    value & PAGE_MASK == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Bytes([u8; 32]);

    impl MemoryHandler for Bytes {
        fn read8(&mut self, paddr: u32) -> u8 {
            self.0[paddr as usize % 32]
        }

        fn write8(&mut self, paddr: u32, value: u8) {
            self.0[paddr as usize % 32] = value;
        }
    }

    #[test]
    fn test_default_widths_compose_little_endian() {
        let mut dev = Bytes([0; 32]);
        dev.write32(0, 0xDEADBEEF);
        assert_eq!(dev.read8(0), 0xEF);
        assert_eq!(dev.read8(3), 0xDE);
        assert_eq!(dev.read16(2), 0xDEAD);

        dev.write128(16, 0x0011_2233_4455_6677_8899_AABB_CCDD_EEFF);
        assert_eq!(dev.read64(16), 0x8899_AABB_CCDD_EEFF);
        assert_eq!(dev.read64(24), 0x0011_2233_4455_6677);
    }

    #[test]
    fn test_mem_value_dispatches_by_width() {
        let mut dev = Bytes([0; 32]);
        0xCAFEu16.write_to(&mut dev, 4);
        assert_eq!(u8::read_from(&mut dev, 4), 0xFE);
        assert_eq!(u16::read_from(&mut dev, 4), 0xCAFE);
        assert_eq!(<u64 as MemValue>::WIDTH.bits(), 64);
    }

    #[test]
    fn test_log_budget() {
        let mut budget = LogBudget::new(2);
        assert!(budget.allow());
        assert!(budget.allow());
        assert!(!budget.allow());
    }
}
