//! Dynasm-rs fastmem backend for x86_64
//!
//! Each guarded access is a single `mov`-family instruction against
//! `[base + addr]`, padded with NOPs so a `call rel32` fits over it. The
//! matching slow-path thunk is emitted after the block body by
//! [`X64Codegen::finish_block`]; it saves every live caller-saved register,
//! calls the `slow_*` entry point for the width and moves the result into
//! the data register.
//!
//! Only available on native builds with the `jit-dynasm` feature.

use dynasm::dynasm;
use dynasmrt::{x64::Assembler, DynasmApi};

use super::codegen::{encode_call_patch, write_code, EmittedSite, GuardedAccess, PendingSite, SitePatcher, TrustedCodegen, CALL_PATCH_SIZE};
use super::backpatch::BackpatchRecord;
use super::slowpath;
use crate::address_space::AddressSpace;
use crate::error::BackpatchError;
use crate::memory::AccessWidth;

/// Caller-saved GPRs in SysV: rax, rcx, rdx, rsi, rdi, r8-r11.
const CALLER_SAVED_GPRS: u32 = 0b0000_1111_1100_0111;
const RSP: u8 = 4;
const RBP: u8 = 5;
/// Scratch slot below the saved frame pointer, used for 128-bit values.
const SCRATCH: i32 = 16;

#[derive(Debug, Clone, Copy)]
struct Deferred {
    site_offset: usize,
    code_size: u32,
    access: GuardedAccess,
}

/// Fastmem codegen for x86_64.
///
/// `base_register` must hold the fastmem base for the whole block; see
/// [`X64Codegen::emit_load_base`].
pub struct X64Codegen {
    space: usize,
    fastmem_base: usize,
    base_register: u8,
    pending: Vec<Deferred>,
}

impl X64Codegen {
    pub fn new(space: &mut AddressSpace, base_register: u8) -> Option<Self> {
        if base_register == RSP || base_register == RBP || base_register >= 16 {
            return None;
        }
        let fastmem_base = space.fastmem_base()?.as_ptr() as usize;
        Some(X64Codegen {
            space: space as *mut AddressSpace as usize,
            fastmem_base,
            base_register,
            pending: Vec::new(),
        })
    }

    /// Patcher sharing this backend's site layout, for the fault handler.
    pub fn patcher(&self) -> X64Patcher {
        X64Patcher
    }

    pub fn emit_load_base(&self, ops: &mut Assembler) {
        dynasm!(ops
            ; mov Rq(self.base_register), QWORD self.fastmem_base as i64
        );
    }

    fn usable(&self, access: &GuardedAccess) -> bool {
        let reg_ok = |r: u8| r < 16 && r != RSP && r != RBP && r != self.base_register;
        if !reg_ok(access.address_register) {
            return false;
        }
        if access.is_fpr {
            return access.data_register < 16 && access.width != AccessWidth::W8 && access.width != AccessWidth::W16;
        }
        if !reg_ok(access.data_register) || access.width == AccessWidth::W128 {
            return false;
        }
        // byte stores from sil/dil need a REX prefix dynamic registers do not force
        !(access.width == AccessWidth::W8 && !access.is_load && (4..8).contains(&access.data_register))
    }

    fn emit_fast_path(&self, ops: &mut Assembler, a: &GuardedAccess) {
        let base = self.base_register;
        let addr = a.address_register;
        let data = a.data_register;
        match (a.is_fpr, a.is_load, a.width) {
            (false, true, AccessWidth::W8) if a.is_signed => dynasm!(ops ; movsx Rq(data), BYTE [Rq(base) + Rq(addr)]),
            (false, true, AccessWidth::W8) => dynasm!(ops ; movzx Rd(data), BYTE [Rq(base) + Rq(addr)]),
            (false, true, AccessWidth::W16) if a.is_signed => dynasm!(ops ; movsx Rq(data), WORD [Rq(base) + Rq(addr)]),
            (false, true, AccessWidth::W16) => dynasm!(ops ; movzx Rd(data), WORD [Rq(base) + Rq(addr)]),
            (false, true, AccessWidth::W32) if a.is_signed => dynasm!(ops ; movsxd Rq(data), DWORD [Rq(base) + Rq(addr)]),
            (false, true, AccessWidth::W32) => dynasm!(ops ; mov Rd(data), DWORD [Rq(base) + Rq(addr)]),
            (false, true, _) => dynasm!(ops ; mov Rq(data), QWORD [Rq(base) + Rq(addr)]),
            (false, false, AccessWidth::W8) => dynasm!(ops ; mov BYTE [Rq(base) + Rq(addr)], Rb(data)),
            (false, false, AccessWidth::W16) => dynasm!(ops ; mov WORD [Rq(base) + Rq(addr)], Rw(data)),
            (false, false, AccessWidth::W32) => dynasm!(ops ; mov DWORD [Rq(base) + Rq(addr)], Rd(data)),
            (false, false, _) => dynasm!(ops ; mov QWORD [Rq(base) + Rq(addr)], Rq(data)),
            (true, true, AccessWidth::W32) => dynasm!(ops ; movd Rx(data), DWORD [Rq(base) + Rq(addr)]),
            (true, true, AccessWidth::W64) => dynasm!(ops ; movq Rx(data), QWORD [Rq(base) + Rq(addr)]),
            (true, true, _) => dynasm!(ops ; movdqu Rx(data), [Rq(base) + Rq(addr)]),
            (true, false, AccessWidth::W32) => dynasm!(ops ; movd DWORD [Rq(base) + Rq(addr)], Rx(data)),
            (true, false, AccessWidth::W64) => dynasm!(ops ; movq QWORD [Rq(base) + Rq(addr)], Rx(data)),
            (true, false, _) => dynasm!(ops ; movdqu [Rq(base) + Rq(addr)], Rx(data)),
        }
    }

    fn emit_thunk(&self, ops: &mut Assembler, a: &GuardedAccess) {
        let mut gprs = a.gpr_bitmask & CALLER_SAVED_GPRS;
        let mut xmms = a.fpr_bitmask & 0xFFFF;
        if a.is_load {
            if a.is_fpr {
                xmms &= !(1 << a.data_register);
            } else {
                gprs &= !(1 << a.data_register);
            }
        }
        let saved_gprs: Vec<u8> = (0..16u8).filter(|r| gprs & (1 << r) != 0).collect();
        let saved_xmms: Vec<u8> = (0..16u8).filter(|r| xmms & (1 << r) != 0).collect();
        let gpr_bytes = 8 * saved_gprs.len() as i32;
        let xmm_bytes = 16 * saved_xmms.len() as i32;

        dynasm!(ops
            ; push rbp
            ; mov rbp, rsp
            ; sub rsp, SCRATCH
        );
        for &r in &saved_gprs {
            dynasm!(ops ; push Rq(r));
        }
        if xmm_bytes != 0 {
            dynasm!(ops ; sub rsp, xmm_bytes);
            for (i, &x) in saved_xmms.iter().enumerate() {
                let slot = 16 * i as i32;
                dynasm!(ops ; movdqu [rsp + slot], Rx(x));
            }
        }

        let addr = a.address_register;
        let data = a.data_register;
        match (a.is_load, a.is_fpr, a.width) {
            (true, _, AccessWidth::W128) => dynasm!(ops
                ; mov esi, Rd(addr)
                ; lea rdx, [rbp - SCRATCH]
            ),
            (true, _, _) => dynasm!(ops ; mov esi, Rd(addr)),
            (false, true, AccessWidth::W128) => dynasm!(ops
                ; movdqu [rbp - SCRATCH], Rx(data)
                ; mov esi, Rd(addr)
                ; lea rdx, [rbp - SCRATCH]
            ),
            (false, true, _) => dynasm!(ops
                ; mov esi, Rd(addr)
                ; movq rdx, Rx(data)
            ),
            (false, false, _) => dynasm!(ops
                ; push Rq(addr)
                ; push Rq(data)
                ; pop rdx
                ; pop rsi
                ; mov esi, esi
            ),
        }

        let target = slow_path_for(a.is_load, a.width);
        dynasm!(ops
            ; mov rdi, QWORD self.space as i64
            ; and rsp, -16
            ; mov rax, QWORD target as i64
            ; call rax
        );

        if a.is_load {
            match (a.is_fpr, a.width) {
                (false, AccessWidth::W8) if a.is_signed => dynasm!(ops ; movsx Rq(data), al),
                (false, AccessWidth::W8) => dynasm!(ops ; movzx Rd(data), al),
                (false, AccessWidth::W16) if a.is_signed => dynasm!(ops ; movsx Rq(data), ax),
                (false, AccessWidth::W16) => dynasm!(ops ; movzx Rd(data), ax),
                (false, AccessWidth::W32) if a.is_signed => dynasm!(ops ; movsxd Rq(data), eax),
                (false, AccessWidth::W32) => dynasm!(ops ; mov Rd(data), eax),
                (false, _) => dynasm!(ops ; mov Rq(data), rax),
                (true, AccessWidth::W32) => dynasm!(ops ; movd Rx(data), eax),
                (true, AccessWidth::W64) => dynasm!(ops ; movq Rx(data), rax),
                (true, _) => dynasm!(ops ; movdqu Rx(data), [rbp - SCRATCH]),
            }
        }

        let xmm_base = SCRATCH + gpr_bytes + xmm_bytes;
        for (i, &x) in saved_xmms.iter().enumerate() {
            let disp = 16 * i as i32 - xmm_base;
            dynasm!(ops ; movdqu Rx(x), [rbp + disp]);
        }
        let frame = SCRATCH + gpr_bytes;
        dynasm!(ops ; lea rsp, [rbp - frame]);
        for &r in saved_gprs.iter().rev() {
            dynasm!(ops ; pop Rq(r));
        }
        dynasm!(ops
            ; mov rsp, rbp
            ; pop rbp
            ; ret
        );
    }
}

fn slow_path_for(is_load: bool, width: AccessWidth) -> usize {
    match (is_load, width) {
        (true, AccessWidth::W8) => slowpath::slow_read8 as usize,
        (true, AccessWidth::W16) => slowpath::slow_read16 as usize,
        (true, AccessWidth::W32) => slowpath::slow_read32 as usize,
        (true, AccessWidth::W64) => slowpath::slow_read64 as usize,
        (true, AccessWidth::W128) => slowpath::slow_read128 as usize,
        (false, AccessWidth::W8) => slowpath::slow_write8 as usize,
        (false, AccessWidth::W16) => slowpath::slow_write16 as usize,
        (false, AccessWidth::W32) => slowpath::slow_write32 as usize,
        (false, AccessWidth::W64) => slowpath::slow_write64 as usize,
        (false, AccessWidth::W128) => slowpath::slow_write128 as usize,
    }
}

impl SitePatcher for X64Codegen {
    fn patch_to_slowpath(&self, site: usize, record: &BackpatchRecord) -> Result<(), BackpatchError> {
        X64Patcher.patch_to_slowpath(site, record)
    }
}

impl TrustedCodegen for X64Codegen {
    type Assembler = Assembler;

    fn emit_guarded_access(&mut self, ops: &mut Assembler, access: &GuardedAccess) -> Option<EmittedSite> {
        if !self.usable(access) {
            return None;
        }
        let start = ops.offset().0;
        self.emit_fast_path(ops, access);
        while ops.offset().0 - start < CALL_PATCH_SIZE as usize {
            dynasm!(ops ; nop);
        }
        let code_size = (ops.offset().0 - start) as u32;
        self.pending.push(Deferred {
            site_offset: start,
            code_size,
            access: *access,
        });
        Some(EmittedSite {
            offset: start,
            code_size,
        })
    }

    fn finish_block(&mut self, ops: &mut Assembler) -> Vec<PendingSite> {
        let deferred = std::mem::take(&mut self.pending);
        deferred
            .into_iter()
            .map(|d| {
                let thunk_offset = ops.offset().0;
                self.emit_thunk(ops, &d.access);
                PendingSite {
                    site_offset: d.site_offset,
                    thunk_offset,
                    record: d.access.record(d.code_size, 0),
                }
            })
            .collect()
    }
}

/// Rewrites sites emitted by [`X64Codegen`] into `call thunk`.
#[derive(Debug, Default, Clone, Copy)]
pub struct X64Patcher;

impl SitePatcher for X64Patcher {
    fn patch_to_slowpath(&self, site: usize, record: &BackpatchRecord) -> Result<(), BackpatchError> {
        let bytes = encode_call_patch(site, record.code_size, record.thunk)?;
        // SAFETY: `site` was registered from a live JIT block and the faulting
        // thread is parked in the fault handler.
        unsafe { write_code(site, &bytes) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_space::AddressSpaceConfig;
    use crate::memory::Protection;
    use dynasmrt::AssemblyOffset;

    #[test]
    fn test_load_site_is_patchable() {
        let mut space = match AddressSpace::new(AddressSpaceConfig {
            fastmem: true,
            arena_size: 0x10000,
            ..AddressSpaceConfig::default()
        }) {
            Ok(space) => space,
            Err(_) => return,
        };
        let ram = space.allocate("ram", 0x1000, Protection::ReadWrite).unwrap();
        space.map_block(ram, 0, 0x1000, 0).unwrap();
        space.vmap(0x8000_0000, 0, 0x1000).unwrap();
        let Some(mut codegen) = X64Codegen::new(&mut space, 3) else {
            return;
        };

        let access = GuardedAccess {
            guest_pc: 0x0010_0000,
            width: AccessWidth::W32,
            is_load: true,
            is_signed: false,
            is_fpr: false,
            address_register: 6,
            data_register: 0,
            gpr_bitmask: 1 << 6,
            fpr_bitmask: 0,
        };
        let mut ops = Assembler::new().unwrap();
        let site = codegen.emit_guarded_access(&mut ops, &access).unwrap();
        assert!(site.code_size >= CALL_PATCH_SIZE);
        let pending = codegen.finish_block(&mut ops);
        assert_eq!(pending.len(), 1);
        assert!(pending[0].thunk_offset >= site.offset + site.code_size as usize);

        let code = ops.finalize().unwrap();
        let base = code.ptr(AssemblyOffset(0)) as usize;
        let (host_site, record) = pending[0].resolve(base);
        assert_eq!(record.code_size, site.code_size);

        let bytes = encode_call_patch(host_site, record.code_size, record.thunk).unwrap();
        assert_eq!(bytes[0], 0xE8);

        let wide = GuardedAccess {
            width: AccessWidth::W128,
            ..access
        };
        let mut ops = Assembler::new().unwrap();
        assert!(codegen.emit_guarded_access(&mut ops, &wide).is_none());
    }
}
