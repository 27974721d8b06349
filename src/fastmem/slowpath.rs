//! Slow-path entry points called from patched JIT sites.
//!
//! Loads return the zero-extended value; the thunk sign-extends when the
//! access asks for it. 128-bit values travel through memory.

use crate::address_space::AddressSpace;

macro_rules! slow_access {
    ($read:ident, $write:ident, $ty:ty) => {
        /// # Safety
        ///
        /// `space` must point to a live address space not otherwise borrowed.
        pub unsafe extern "sysv64" fn $read(space: *mut AddressSpace, addr: u32) -> u64 {
            (*space).read::<$ty>(addr) as u64
        }

        /// # Safety
        ///
        /// `space` must point to a live address space not otherwise borrowed.
        pub unsafe extern "sysv64" fn $write(space: *mut AddressSpace, addr: u32, value: u64) {
            (*space).write::<$ty>(addr, value as $ty)
        }
    };
}

slow_access!(slow_read8, slow_write8, u8);
slow_access!(slow_read16, slow_write16, u16);
slow_access!(slow_read32, slow_write32, u32);
slow_access!(slow_read64, slow_write64, u64);

/// # Safety
///
/// `space` must point to a live address space and `out` to 16 writable bytes.
pub unsafe extern "sysv64" fn slow_read128(space: *mut AddressSpace, addr: u32, out: *mut u128) {
    out.write_unaligned((*space).read::<u128>(addr));
}

/// # Safety
///
/// `space` must point to a live address space and `value` to 16 readable bytes.
pub unsafe extern "sysv64" fn slow_write128(space: *mut AddressSpace, addr: u32, value: *const u128) {
    (*space).write::<u128>(addr, value.read_unaligned());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::AddressSpaceConfig;

    #[test]
    fn test_entry_points_dispatch() {
        let mut space = AddressSpace::new(AddressSpaceConfig {
            arena_size: 0x10000,
            ..AddressSpaceConfig::default()
        })
        .unwrap();
        let ram = space.allocate("ram", 0x2000, crate::memory::Protection::ReadWrite).unwrap();
        space.map_block(ram, 0, 0x2000, 0).unwrap();
        space.vmap(0x8000_0000, 0, 0x2000).unwrap();

        let ptr: *mut AddressSpace = &mut space;
        unsafe {
            slow_write32(ptr, 0x8000_0010, 0xFFFF_FFFF_8765_4321);
            assert_eq!(slow_read32(ptr, 0x8000_0010), 0x8765_4321);
            assert_eq!(slow_read8(ptr, 0x8000_0013), 0x87);

            let value = 0x0102_0304_0506_0708_090A_0B0C_0D0E_0F10u128;
            slow_write128(ptr, 0x8000_1000, &value);
            let mut out = 0u128;
            slow_read128(ptr, 0x8000_1000, &mut out);
            assert_eq!(out, value);
        }
    }
}
