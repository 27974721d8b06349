//! JIT load/store sites that may be rewritten to the slow path
//!
//! Every fastmem access the JIT emits is registered here, keyed by the host
//! address of its first instruction. When that instruction faults inside the
//! fastmem area the record is consumed, the site is rewritten into a call to
//! its slow-path thunk and the guest PC is remembered so recompiles of the
//! block never emit a fastmem access for it again.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::{Mutex, MutexGuard, PoisonError};

use log::{error, info};

use super::codegen::SitePatcher;
use crate::error::BackpatchError;

/// Everything needed to rewrite one JIT access site.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackpatchRecord {
    pub guest_pc: u32,
    /// Bytes of host code the patch may overwrite.
    pub code_size: u32,
    /// Host GPRs live across the access (bit n = register n).
    pub gpr_bitmask: u32,
    /// Host vector registers live across the access.
    pub fpr_bitmask: u32,
    pub address_register: u8,
    pub data_register: u8,
    pub size_in_bits: u8,
    pub is_signed: bool,
    pub is_load: bool,
    pub is_fpr: bool,
    /// Host address of the out-of-line slow path for this site.
    pub thunk: usize,
}

#[derive(Debug, Default)]
pub struct BackpatchTable {
    sites: HashMap<usize, BackpatchRecord>,
    faulting_pcs: HashSet<u32>,
    recompile: Vec<u32>,
}

impl BackpatchTable {
    pub fn new() -> Self {
        BackpatchTable::default()
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn register(&mut self, site: usize, record: BackpatchRecord) {
        self.sites.insert(site, record);
    }

    pub fn get(&self, site: usize) -> Option<&BackpatchRecord> {
        self.sites.get(&site)
    }

    /// Removes and returns the record for `site`; each record is used once.
    pub fn take_site(&mut self, site: usize) -> Result<BackpatchRecord, BackpatchError> {
        self.sites.remove(&site).ok_or(BackpatchError::UnknownSite(site))
    }

    /// Drops records whose host code lies in `range`, e.g. a freed block.
    pub fn remove_sites(&mut self, range: Range<usize>) {
        self.sites.retain(|site, _| !range.contains(site));
    }

    #[inline]
    pub fn is_faulting_pc(&self, guest_pc: u32) -> bool {
        self.faulting_pcs.contains(&guest_pc)
    }

    /// Marks `guest_pc` as needing the slow path and queues its block for
    /// recompilation.
    pub fn mark_faulting(&mut self, guest_pc: u32) {
        if self.faulting_pcs.insert(guest_pc) {
            self.recompile.push(guest_pc);
        }
    }

    pub fn take_recompile_requests(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.recompile)
    }

    /// Forgets every site and faulting PC, for a full JIT cache flush.
    pub fn clear(&mut self) {
        self.sites.clear();
        self.faulting_pcs.clear();
        self.recompile.clear();
    }
}

/// Result of offering a host fault to [`FaultContext::handle_fault`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The faulting address is outside the fastmem area.
    NotFastmem,
    /// The site was rewritten; retrying the instruction takes the slow path.
    Patched { guest_pc: u32, guest_addr: u32 },
    /// Inside the area but nothing can fix it.
    Unhandled,
}

pub struct FaultState {
    pub table: BackpatchTable,
    pub patcher: Box<dyn SitePatcher>,
}

/// State the host fault handler needs, shared between the owning address
/// space and the signal route.
pub struct FaultContext {
    base: usize,
    size: usize,
    state: Mutex<FaultState>,
}

impl FaultContext {
    pub fn new(base: usize, size: usize, patcher: Box<dyn SitePatcher>) -> Self {
        FaultContext {
            base,
            size,
            state: Mutex::new(FaultState {
                table: BackpatchTable::new(),
                patcher,
            }),
        }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base && addr - self.base < self.size
    }

    /// Locks the shared state. A poisoned lock is still usable: the table is
    /// only ever mutated by whole-entry inserts and removes.
    pub fn lock(&self) -> MutexGuard<'_, FaultState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Handles a fault at host address `fault_addr` raised by the instruction
    /// at `host_pc`.
    ///
    /// Runs inside the signal handler. It takes the state mutex and emits
    /// `log` records, neither of which is async-signal-safe: the faulting
    /// thread must not hold this lock, and the installed logger must not
    /// take a lock the JIT thread can hold while running guest code.
    pub fn handle_fault(&self, host_pc: usize, fault_addr: usize) -> FaultOutcome {
        if !self.contains(fault_addr) {
            return FaultOutcome::NotFastmem;
        }
        let guest_addr = (fault_addr - self.base) as u32;

        let mut state = self.lock();
        let record = match state.table.take_site(host_pc) {
            Ok(record) => record,
            Err(err) => {
                drop(state);
                error!("unrecoverable fastmem fault at guest address 0x{:08X}: {}", guest_addr, err);
                return FaultOutcome::Unhandled;
            }
        };

        if let Err(err) = state.patcher.patch_to_slowpath(host_pc, &record) {
            drop(state);
            error!(
                "failed to backpatch guest pc 0x{:08X} (host {:#x}, guest address 0x{:08X}): {}",
                record.guest_pc, host_pc, guest_addr, err
            );
            return FaultOutcome::Unhandled;
        }
        state.table.mark_faulting(record.guest_pc);
        drop(state);

        info!(
            "backpatched {} {}-bit {} at guest pc 0x{:08X}: host {:#x}, guest address 0x{:08X}, addr r{}, data {}{}, gprs {:#x}, fprs {:#x}",
            if record.is_signed { "signed" } else { "unsigned" },
            record.size_in_bits,
            if record.is_load { "load" } else { "store" },
            record.guest_pc,
            host_pc,
            guest_addr,
            record.address_register,
            if record.is_fpr { "xmm" } else { "r" },
            record.data_register,
            record.gpr_bitmask,
            record.fpr_bitmask
        );
        FaultOutcome::Patched {
            guest_pc: record.guest_pc,
            guest_addr,
        }
    }
}
