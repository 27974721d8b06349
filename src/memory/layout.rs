//! The canonical EE memory map
//!
//! [`StandardLayout::install`] performs the boot-time mapping sequence:
//! carve every direct region out of the arena, fill the physical map, then
//! project it into the virtual segments.

use super::{ArenaBlock, HandlerId, NullHandler, Protection};
use crate::address_space::AddressSpace;
use crate::error::Result;

pub const MAIN_RAM_SIZE: u32 = 0x0200_0000;
pub const ROM_BASE: u32 = 0x1FC0_0000;
pub const ROM_SIZE: u32 = 0x0040_0000;
pub const ROM1_BASE: u32 = 0x1E00_0000;
pub const ROM1_SIZE: u32 = 0x0004_0000;
pub const ROM2_BASE: u32 = 0x1E40_0000;
pub const ROM2_SIZE: u32 = 0x0008_0000;
pub const IOP_RAM_BASE: u32 = 0x1C00_0000;
pub const IOP_RAM_SIZE: u32 = 0x0020_0000;
pub const IOP_RAM_WINDOW: u32 = 0x0080_0000;
pub const HW_BASE: u32 = 0x1000_0000;
pub const HW_PAGES: usize = 16;
pub const GS_BASE: u32 = 0x1200_0000;
pub const GS_SIZE: u32 = 0x2000;
pub const IOP_HW_PAGES: [u32; 3] = [0x1F80_1000, 0x1F80_3000, 0x1F80_8000];
pub const VU0_MICRO_BASE: u32 = 0x1100_0000;
pub const VU0_MEM_BASE: u32 = 0x1100_4000;
pub const VU1_MICRO_BASE: u32 = 0x1100_8000;
pub const VU1_MEM_BASE: u32 = 0x1100_C000;
pub const VU0_SIZE: u32 = 0x1000;
pub const VU1_SIZE: u32 = 0x4000;
/// VU windows are 16KB regardless of how much memory backs them.
pub const VU_WINDOW: u32 = 0x4000;
pub const SCRATCHPAD_BASE: u32 = 0x7000_0000;
pub const SCRATCHPAD_SIZE: u32 = 0x4000;

pub const KSEG0: u32 = 0x8000_0000;
pub const KSEG1: u32 = 0xA000_0000;
pub const UNCACHED_RAM: u32 = 0x2000_0000;
pub const UNCACHED_ACCEL_RAM: u32 = 0x3000_0000;
const SEGMENT_SIZE: u32 = 0x2000_0000;

/// Device handlers the board code registered. Missing ones read as zero.
#[derive(Debug, Clone, Default)]
pub struct HardwareHandlers {
    /// EE hardware registers, one id per 4KB page from `0x10000000`.
    pub hw_pages: [Option<HandlerId>; HW_PAGES],
    pub gs: Option<HandlerId>,
    pub iop_hw: Option<HandlerId>,
    /// Micro memory writes usually invalidate recompiled VU programs; without
    /// a handler the micro memory is plain RAM.
    pub vu0_micro: Option<HandlerId>,
    pub vu1_micro: Option<HandlerId>,
}

/// Arena blocks of every direct region, for loaders and debuggers.
#[derive(Debug, Clone, Copy)]
pub struct StandardLayout {
    pub main_ram: ArenaBlock,
    pub rom: ArenaBlock,
    pub rom1: ArenaBlock,
    pub rom2: ArenaBlock,
    pub iop_ram: ArenaBlock,
    pub vu0_micro: ArenaBlock,
    pub vu0_mem: ArenaBlock,
    pub vu1_micro: ArenaBlock,
    pub vu1_mem: ArenaBlock,
    pub scratchpad: ArenaBlock,
    pub null_handler: HandlerId,
}

impl StandardLayout {
    pub fn install(space: &mut AddressSpace, hw: &HardwareHandlers) -> Result<Self> {
        let layout = StandardLayout {
            main_ram: space.allocate("main ram", MAIN_RAM_SIZE as usize, Protection::ReadWrite)?,
            rom: space.allocate("rom", ROM_SIZE as usize, Protection::ReadOnly)?,
            rom1: space.allocate("rom1", ROM1_SIZE as usize, Protection::ReadOnly)?,
            rom2: space.allocate("rom2", ROM2_SIZE as usize, Protection::ReadOnly)?,
            iop_ram: space.allocate("iop ram", IOP_RAM_SIZE as usize, Protection::ReadWrite)?,
            vu0_micro: space.allocate("vu0 micro", VU0_SIZE as usize, Protection::ReadWrite)?,
            vu0_mem: space.allocate("vu0 mem", VU0_SIZE as usize, Protection::ReadWrite)?,
            vu1_micro: space.allocate("vu1 micro", VU1_SIZE as usize, Protection::ReadWrite)?,
            vu1_mem: space.allocate("vu1 mem", VU1_SIZE as usize, Protection::ReadWrite)?,
            scratchpad: space.allocate("scratchpad", SCRATCHPAD_SIZE as usize, Protection::ReadWrite)?,
            null_handler: space.register_handler(Box::new(NullHandler))?,
        };
        layout.map_physical(space, hw)?;
        layout.map_virtual(space)?;
        Ok(layout)
    }

    fn map_physical(&self, space: &mut AddressSpace, hw: &HardwareHandlers) -> Result<()> {
        let null = self.null_handler;

        space.map_block(self.main_ram, 0, MAIN_RAM_SIZE, 0)?;
        space.map_handler(null, MAIN_RAM_SIZE, HW_BASE - MAIN_RAM_SIZE)?;

        for (page, id) in hw.hw_pages.iter().enumerate() {
            space.map_handler(id.unwrap_or(null), HW_BASE + page as u32 * 0x1000, 0x1000)?;
        }
        space.map_handler(hw.gs.unwrap_or(null), GS_BASE, GS_SIZE)?;
        for &page in &IOP_HW_PAGES {
            space.map_handler(hw.iop_hw.unwrap_or(null), page, 0x1000)?;
        }

        match hw.vu0_micro {
            Some(id) => space.map_handler(id, VU0_MICRO_BASE, VU_WINDOW)?,
            None => space.map_block(self.vu0_micro, VU0_MICRO_BASE, VU_WINDOW, VU0_SIZE)?,
        }
        space.map_block(self.vu0_mem, VU0_MEM_BASE, VU_WINDOW, VU0_SIZE)?;
        match hw.vu1_micro {
            Some(id) => space.map_handler(id, VU1_MICRO_BASE, VU_WINDOW)?,
            None => space.map_block(self.vu1_micro, VU1_MICRO_BASE, VU_WINDOW, 0)?,
        }
        space.map_block(self.vu1_mem, VU1_MEM_BASE, VU_WINDOW, 0)?;

        space.map_block(self.iop_ram, IOP_RAM_BASE, IOP_RAM_WINDOW, IOP_RAM_SIZE)?;
        space.map_block(self.rom1, ROM1_BASE, ROM1_SIZE, 0)?;
        space.map_block(self.rom2, ROM2_BASE, ROM2_SIZE, 0)?;
        space.map_block(self.rom, ROM_BASE, ROM_SIZE, 0)?;
        Ok(())
    }

    fn map_virtual(&self, space: &mut AddressSpace) -> Result<()> {
        space.vmap(0, 0, SEGMENT_SIZE)?;
        space.vmap(UNCACHED_RAM, 0, MAIN_RAM_SIZE)?;
        space.vmap(UNCACHED_ACCEL_RAM, 0, MAIN_RAM_SIZE)?;
        space.vmap(KSEG0, 0, SEGMENT_SIZE)?;
        space.vmap(KSEG1, 0, SEGMENT_SIZE)?;
        space.vmap_block(SCRATCHPAD_BASE, self.scratchpad, SCRATCHPAD_SIZE)?;
        Ok(())
    }
}
