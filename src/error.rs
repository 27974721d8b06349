//! Error types
//!
//! Setup calls (handler registration, physical and virtual mapping, host
//! memory reservation) report failures through these types. The access path
//! never returns an error: guest-visible faults are latched as
//! [`GuestException`](crate::GuestException) instead.

use std::io;

use thiserror::Error;

use crate::memory::HandlerId;

/// Malformed arguments to a mapping or registration call.
///
/// Any of these indicates an emulator defect in the code building the memory
/// map, not a condition the guest can provoke.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MapError {
    #[error("{call}: address 0x{addr:08X} is not page aligned")]
    MisalignedAddress { call: &'static str, addr: u32 },
    #[error("{call}: size 0x{size:X} is not a whole number of pages")]
    MisalignedSize { call: &'static str, size: u32 },
    #[error("{call}: host pointer {ptr:#x} is not page aligned")]
    MisalignedPointer { call: &'static str, ptr: usize },
    #[error("{call}: range 0x{start:08X}+0x{size:X} exceeds the 0x{limit:X} byte window")]
    OutOfRange {
        call: &'static str,
        start: u32,
        size: u32,
        limit: u64,
    },
    #[error("{call}: block size 0x{block_size:X} does not evenly tile 0x{size:X} bytes")]
    BadBlockSize {
        call: &'static str,
        size: u32,
        block_size: u32,
    },
    #[error("{call}: 0x{needed:X} bytes requested from a 0x{available:X} byte block")]
    BlockTooSmall {
        call: &'static str,
        needed: usize,
        available: usize,
    },
    #[error("register_handler: all {0} handler slots are in use")]
    HandlerPoolExhausted(usize),
    #[error("{call}: handler {id:?} is not registered")]
    UnknownHandler { call: &'static str, id: HandlerId },
}

/// Host virtual memory could not be reserved or remapped.
#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("failed to {op}: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("arena exhausted: 0x{requested:X} bytes requested, 0x{remaining:X} remaining")]
    Exhausted { requested: usize, remaining: usize },
    #[error("fastmem is not supported on this host")]
    Unsupported,
}

impl ArenaError {
    /// Wraps `errno` from the libc call that just failed.
    #[cfg(unix)]
    pub(crate) fn last_os(op: &'static str) -> Self {
        ArenaError::Os {
            op,
            source: io::Error::last_os_error(),
        }
    }
}

/// Rewriting a JIT load/store site failed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BackpatchError {
    #[error("no backpatch record for host code address {0:#x}")]
    UnknownSite(usize),
    #[error("site {site:#x} is {code_size} bytes, a patch needs at least {needed}")]
    SiteTooSmall {
        site: usize,
        code_size: u32,
        needed: u32,
    },
    #[error("slow-path thunk {thunk:#x} is out of rel32 range of site {site:#x}")]
    ThunkOutOfRange { site: usize, thunk: usize },
    #[error("the active code generator cannot patch load/store sites")]
    Unsupported,
    #[error("failed to change code protection at {site:#x} (errno {errno})")]
    Protection { site: usize, errno: i32 },
}

/// Umbrella error for multi-step setup such as installing the standard layout.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Arena(#[from] ArenaError),
    #[error(transparent)]
    Backpatch(#[from] BackpatchError),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
