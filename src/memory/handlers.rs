//! Registered memory-mapped device handlers
//!
//! A fixed pool of [`MAX_HANDLERS`] slots. Ids are handed out in
//! registration order and never reused, so tables that refer to a handler by
//! id pick up a [`HandlerTable::reassign`] without being rewalked.

use log::warn;

use super::{LogBudget, MemValue, MemoryHandler};
use crate::error::MapError;

pub const MAX_HANDLERS: usize = 128;

/// Index of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u8);

impl HandlerId {
    /// The fallback handler installed by [`HandlerTable::new`]; every physical
    /// page starts out pointing at it.
    pub const DEFAULT: HandlerId = HandlerId(0);

    pub(crate) const fn from_raw(index: u8) -> Self {
        HandlerId(index)
    }

    #[inline(always)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Fallback for physical pages nothing was mapped to.
///
/// Reads return zero and writes are dropped. Each hit is logged (up to a cap)
/// since it means the boot-time map missed a region the guest uses.
pub struct DefaultHandler {
    budget: LogBudget,
}

impl DefaultHandler {
    pub fn new() -> Self {
        DefaultHandler {
            budget: LogBudget::new(50),
        }
    }

    fn report(&mut self, dir: &str, bits: u32, paddr: u32) {
        if self.budget.allow() {
            warn!("default physical {}{}: 0x{:08X}", dir, bits, paddr);
        }
    }
}

impl Default for DefaultHandler {
    fn default() -> Self {
        DefaultHandler::new()
    }
}

impl MemoryHandler for DefaultHandler {
    fn read8(&mut self, paddr: u32) -> u8 {
        self.report("read", 8, paddr);
        0
    }

    fn write8(&mut self, paddr: u32, _value: u8) {
        self.report("write", 8, paddr);
    }

    fn read16(&mut self, paddr: u32) -> u16 {
        self.report("read", 16, paddr);
        0
    }

    fn write16(&mut self, paddr: u32, _value: u16) {
        self.report("write", 16, paddr);
    }

    fn read32(&mut self, paddr: u32) -> u32 {
        self.report("read", 32, paddr);
        0
    }

    fn write32(&mut self, paddr: u32, _value: u32) {
        self.report("write", 32, paddr);
    }

    fn read64(&mut self, paddr: u32) -> u64 {
        self.report("read", 64, paddr);
        0
    }

    fn write64(&mut self, paddr: u32, _value: u64) {
        self.report("write", 64, paddr);
    }

    fn read128(&mut self, paddr: u32) -> u128 {
        self.report("read", 128, paddr);
        0
    }

    fn write128(&mut self, paddr: u32, _value: u128) {
        self.report("write", 128, paddr);
    }
}

/// Reserved ranges: reads are zero, writes vanish, nothing is logged.
///
/// Used for sub-ranges that games are known to poke without expecting
/// anything back. The behaviour is inherited convention, not something
/// verified against hardware.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullHandler;

impl MemoryHandler for NullHandler {
    fn read8(&mut self, _paddr: u32) -> u8 {
        0
    }

    fn write8(&mut self, _paddr: u32, _value: u8) {}

    fn read16(&mut self, _paddr: u32) -> u16 {
        0
    }

    fn write16(&mut self, _paddr: u32, _value: u16) {}

    fn read32(&mut self, _paddr: u32) -> u32 {
        0
    }

    fn write32(&mut self, _paddr: u32, _value: u32) {}

    fn read64(&mut self, _paddr: u32) -> u64 {
        0
    }

    fn write64(&mut self, _paddr: u32, _value: u64) {}

    fn read128(&mut self, _paddr: u32) -> u128 {
        0
    }

    fn write128(&mut self, _paddr: u32, _value: u128) {}
}

/// Fixed pool of registered handlers.
pub struct HandlerTable {
    slots: Vec<Box<dyn MemoryHandler>>,
}

impl Default for HandlerTable {
    fn default() -> Self {
        HandlerTable::new()
    }
}

impl HandlerTable {
    /// Creates the table with [`DefaultHandler`] registered as
    /// [`HandlerId::DEFAULT`].
    pub fn new() -> Self {
        let mut slots: Vec<Box<dyn MemoryHandler>> = Vec::with_capacity(MAX_HANDLERS);
        slots.push(Box::new(DefaultHandler::new()));
        HandlerTable { slots }
    }

    /// Number of registered handlers, the default one included.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, id: HandlerId) -> bool {
        id.index() < self.slots.len()
    }

    /// Allocates the next free slot.
    pub fn register(&mut self, handler: Box<dyn MemoryHandler>) -> Result<HandlerId, MapError> {
        let index = self.slots.len();
        if index >= MAX_HANDLERS {
            return Err(MapError::HandlerPoolExhausted(MAX_HANDLERS));
        }
        self.slots.push(handler);
        Ok(HandlerId(index as u8))
    }

    /// Replaces the callbacks of an existing slot in place.
    pub fn reassign(
        &mut self,
        id: HandlerId,
        handler: Box<dyn MemoryHandler>,
    ) -> Result<Box<dyn MemoryHandler>, MapError> {
        match self.slots.get_mut(id.index()) {
            Some(slot) => Ok(std::mem::replace(slot, handler)),
            None => Err(MapError::UnknownHandler {
                call: "reassign_handler",
                id,
            }),
        }
    }

    pub fn get_mut(&mut self, id: HandlerId) -> Option<&mut (dyn MemoryHandler + 'static)> {
        self.slots.get_mut(id.index()).map(|slot| slot.as_mut())
    }

    #[inline]
    pub(crate) fn read<T: MemValue>(&mut self, id: HandlerId, paddr: u32) -> T {
        match self.slots.get_mut(id.index()) {
            Some(handler) => T::read_from(handler.as_mut(), paddr),
            None => T::default(),
        }
    }

    #[inline]
    pub(crate) fn write<T: MemValue>(&mut self, id: HandlerId, paddr: u32, value: T) {
        if let Some(handler) = self.slots.get_mut(id.index()) {
            value.write_to(handler.as_mut(), paddr);
        }
    }
}
