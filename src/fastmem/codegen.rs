//! The trusted codegen seam
//!
//! Everything that writes host machine code lives behind [`TrustedCodegen`]
//! and [`SitePatcher`]. [`DispatchOnlyCodegen`] never emits a fastmem access,
//! so a backend built on it always goes through the dispatch path and needs
//! no self-modifying code at all.

use super::backpatch::BackpatchRecord;
use crate::error::BackpatchError;
use crate::memory::AccessWidth;

/// Length of `call rel32`.
pub const CALL_PATCH_SIZE: u32 = 5;

const CALL_REL32: u8 = 0xE8;
const NOP: u8 = 0x90;

/// One guest load or store the JIT wants emitted as a fastmem access.
///
/// The address register must hold the guest address zero-extended to 64
/// bits. A patched site clobbers the host flags, so none may be live across
/// the access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuardedAccess {
    pub guest_pc: u32,
    pub width: AccessWidth,
    pub is_load: bool,
    pub is_signed: bool,
    pub is_fpr: bool,
    pub address_register: u8,
    pub data_register: u8,
    pub gpr_bitmask: u32,
    pub fpr_bitmask: u32,
}

impl GuardedAccess {
    /// Backpatch record for this access once its site and thunk are placed.
    pub fn record(&self, code_size: u32, thunk: usize) -> BackpatchRecord {
        BackpatchRecord {
            guest_pc: self.guest_pc,
            code_size,
            gpr_bitmask: self.gpr_bitmask,
            fpr_bitmask: self.fpr_bitmask,
            address_register: self.address_register,
            data_register: self.data_register,
            size_in_bits: self.width.bits(),
            is_signed: self.is_signed,
            is_load: self.is_load,
            is_fpr: self.is_fpr,
            thunk,
        }
    }
}

/// A fastmem access emitted into the current block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmittedSite {
    /// Offset of the access in the assembler's buffer.
    pub offset: usize,
    pub code_size: u32,
}

/// A site whose thunk has been emitted but whose buffer is not final yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingSite {
    pub site_offset: usize,
    pub thunk_offset: usize,
    pub record: BackpatchRecord,
}

impl PendingSite {
    /// Host site address and complete record, given where the buffer landed.
    pub fn resolve(self, code_base: usize) -> (usize, BackpatchRecord) {
        let mut record = self.record;
        record.thunk = code_base + self.thunk_offset;
        (code_base + self.site_offset, record)
    }
}

/// Rewrites a registered site into a call to its slow path.
///
/// Called from the host fault handler with the fault state locked.
pub trait SitePatcher: Send + Sync {
    fn patch_to_slowpath(&self, site: usize, record: &BackpatchRecord) -> Result<(), BackpatchError>;
}

/// A JIT backend able to emit fastmem accesses.
pub trait TrustedCodegen: SitePatcher {
    type Assembler;

    /// Emits `access` as a direct host access against the fastmem base, or
    /// returns `None` when the caller must emit a dispatch call instead.
    fn emit_guarded_access(&mut self, asm: &mut Self::Assembler, access: &GuardedAccess) -> Option<EmittedSite>;

    /// Emits the out-of-line thunks for every site of the block.
    fn finish_block(&mut self, asm: &mut Self::Assembler) -> Vec<PendingSite>;
}

/// Backend that never emits fastmem accesses.
#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchOnlyCodegen;

impl SitePatcher for DispatchOnlyCodegen {
    fn patch_to_slowpath(&self, _site: usize, _record: &BackpatchRecord) -> Result<(), BackpatchError> {
        Err(BackpatchError::Unsupported)
    }
}

impl TrustedCodegen for DispatchOnlyCodegen {
    type Assembler = ();

    fn emit_guarded_access(&mut self, _asm: &mut (), _access: &GuardedAccess) -> Option<EmittedSite> {
        None
    }

    fn finish_block(&mut self, _asm: &mut ()) -> Vec<PendingSite> {
        Vec::new()
    }
}

/// Bytes replacing a site: `call thunk` then NOPs up to `code_size`.
pub fn encode_call_patch(site: usize, code_size: u32, thunk: usize) -> Result<Vec<u8>, BackpatchError> {
    if code_size < CALL_PATCH_SIZE {
        return Err(BackpatchError::SiteTooSmall {
            site,
            code_size,
            needed: CALL_PATCH_SIZE,
        });
    }
    let next = site as i128 + CALL_PATCH_SIZE as i128;
    let rel = i32::try_from(thunk as i128 - next).map_err(|_| BackpatchError::ThunkOutOfRange { site, thunk })?;

    let mut bytes = Vec::with_capacity(code_size as usize);
    bytes.push(CALL_REL32);
    bytes.extend_from_slice(&rel.to_le_bytes());
    bytes.resize(code_size as usize, NOP);
    Ok(bytes)
}

/// Overwrites executable code at `site`.
///
/// # Safety
///
/// `site..site + bytes.len()` must be JIT code owned by the caller that no
/// other thread is executing mid-instruction.
#[cfg(unix)]
pub unsafe fn write_code(site: usize, bytes: &[u8]) -> Result<(), BackpatchError> {
    const HOST_PAGE: usize = 4096;
    let start = site & !(HOST_PAGE - 1);
    let end = (site + bytes.len() + HOST_PAGE - 1) & !(HOST_PAGE - 1);
    let len = end - start;

    let protect = |prot: libc::c_int| -> Result<(), BackpatchError> {
        if libc::mprotect(start as *mut libc::c_void, len, prot) != 0 {
            return Err(BackpatchError::Protection {
                site,
                errno: std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            });
        }
        Ok(())
    };

    protect(libc::PROT_READ | libc::PROT_WRITE | libc::PROT_EXEC)?;
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), site as *mut u8, bytes.len());
    protect(libc::PROT_READ | libc::PROT_EXEC)?;
    flush_icache(site, bytes.len());
    Ok(())
}

/// x86 keeps instruction fetch coherent with stores.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn flush_icache(_start: usize, _len: usize) {}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64")))]
fn flush_icache(start: usize, len: usize) {
    extern "C" {
        fn __clear_cache(start: *mut libc::c_char, end: *mut libc::c_char);
    }
    unsafe { __clear_cache(start as *mut libc::c_char, (start + len) as *mut libc::c_char) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_patch_layout() {
        let bytes = encode_call_patch(0x1000, 8, 0x2000).unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes[0], CALL_REL32);
        assert_eq!(i32::from_le_bytes(bytes[1..5].try_into().unwrap()), 0x2000 - 0x1005);
        assert_eq!(&bytes[5..], &[NOP, NOP, NOP]);
    }

    #[test]
    fn test_backwards_call() {
        let bytes = encode_call_patch(0x9000, 5, 0x1000).unwrap();
        assert_eq!(i32::from_le_bytes(bytes[1..5].try_into().unwrap()), 0x1000 - 0x9005);
    }

    #[test]
    fn test_patch_errors() {
        assert_eq!(
            encode_call_patch(0x1000, 4, 0x2000),
            Err(BackpatchError::SiteTooSmall {
                site: 0x1000,
                code_size: 4,
                needed: 5
            })
        );
        let far = 0x1000usize.wrapping_add(1 << 40);
        assert!(matches!(
            encode_call_patch(0x1000, 5, far),
            Err(BackpatchError::ThunkOutOfRange { .. })
        ));
    }

    #[test]
    fn test_pending_site_resolution() {
        let access = GuardedAccess {
            guest_pc: 0x0010_0008,
            width: AccessWidth::W16,
            is_load: true,
            is_signed: true,
            is_fpr: false,
            address_register: 6,
            data_register: 0,
            gpr_bitmask: 0,
            fpr_bitmask: 0,
        };
        let pending = PendingSite {
            site_offset: 0x10,
            thunk_offset: 0x80,
            record: access.record(5, 0),
        };
        let (site, record) = pending.resolve(0x7000_0000);
        assert_eq!(site, 0x7000_0010);
        assert_eq!(record.thunk, 0x7000_0080);
        assert_eq!(record.size_in_bits, 16);
        assert!(record.is_signed && record.is_load);
    }

    #[test]
    fn test_dispatch_only_never_emits() {
        let mut codegen = DispatchOnlyCodegen;
        let access = GuardedAccess {
            guest_pc: 0,
            width: AccessWidth::W32,
            is_load: false,
            is_signed: false,
            is_fpr: false,
            address_register: 1,
            data_register: 2,
            gpr_bitmask: 0,
            fpr_bitmask: 0,
        };
        assert_eq!(codegen.emit_guarded_access(&mut (), &access), None);
        assert!(codegen.finish_block(&mut ()).is_empty());
        let record = access.record(5, 0);
        assert_eq!(codegen.patch_to_slowpath(0, &record), Err(BackpatchError::Unsupported));
    }
}
