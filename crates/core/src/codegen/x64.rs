//! x86-64 backend
//!
//! Victim patches are always `E9 rel32`, so the forwarder must be allocated
//! within ±2 GiB of the victim. Relocation decodes the victim head with
//! iced-x86 and re-encodes it at the new address with a `BlockEncoder`, which
//! rewrites rip-relative operands and branch displacements.
//!
//! Register-context ABI: the closure bridge saves the full XMM bank, then the
//! general registers in the fixed order below, a padding word, RFLAGS and the
//! next-hop slot. `r11` carries the closure-trampoline pointer into the
//! bridge and is the documented scratch clobber.

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, InstructionBlock,
};

use crate::codegen::CodeBuffer;
use crate::error::HookError;

/// Size of the `E9 rel32` patch written into the victim
pub const JMP_REL32_SIZE: usize = 5;

/// Minimum number of victim bytes the relocator must consume
pub const MIN_PATCH_SIZE: usize = JMP_REL32_SIZE;

/// Reach of a rel32 branch, minus slack for block-internal offsets
pub const NEAR_JUMP_RANGE: usize = 0x7FF0_0000;

/// The x86 family has no far patch form; the forwarder must be in rel32 range
pub const HAS_FAR_PATCH: bool = false;

/// The relocated head's back branch is also rel32
pub const RELOCATED_NEEDS_NEAR: bool = true;

/// Fill the unexecuted tail of the patch window with NOPs
pub fn pad_patch(patch: &mut Vec<u8>, to: usize) {
    while patch.len() < to {
        patch.push(0x90);
    }
}

/// XMM register (128-bit SIMD lane)
#[repr(C, align(16))]
#[derive(Clone, Copy)]
pub struct Xmm {
    pub data: [u8; 16],
}

impl Xmm {
    pub fn as_f32x4(&self) -> [f32; 4] {
        let words: [[u8; 4]; 4] = [
            self.data[0..4].try_into().unwrap(),
            self.data[4..8].try_into().unwrap(),
            self.data[8..12].try_into().unwrap(),
            self.data[12..16].try_into().unwrap(),
        ];
        words.map(f32::from_le_bytes)
    }

    pub fn as_f64x2(&self) -> [f64; 2] {
        let words: [[u8; 8]; 2] = [
            self.data[0..8].try_into().unwrap(),
            self.data[8..16].try_into().unwrap(),
        ];
        words.map(f64::from_le_bytes)
    }

    pub fn set_f64x2(&mut self, values: [f64; 2]) {
        for (i, v) in values.iter().enumerate() {
            self.data[i * 8..(i + 1) * 8].copy_from_slice(&v.to_le_bytes());
        }
    }

    pub fn as_u64x2(&self) -> [u64; 2] {
        let words: [[u8; 8]; 2] = [
            self.data[0..8].try_into().unwrap(),
            self.data[8..16].try_into().unwrap(),
        ];
        words.map(u64::from_le_bytes)
    }
}

impl Default for Xmm {
    fn default() -> Self {
        Self { data: [0u8; 16] }
    }
}

impl std::fmt::Debug for Xmm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Xmm({:02x?})", &self.data[..])
    }
}

/// General registers in context order
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GeneralRegs {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

/// Register snapshot handed to instrumentation callbacks.
///
/// The layout is public ABI and mirrors exactly what the closure bridge
/// saves; the field order must not shift between interoperating builds.
/// Writes are restored into the CPU when the bridge resumes.
#[repr(C)]
#[derive(Debug, Clone)]
pub struct RegisterContext {
    pub xmm: [Xmm; 16],
    pub general: GeneralRegs,
    pub dummy_0: u64,
    pub flags: u64,
    /// Next-hop slot consumed by the bridge's final return
    pub ret: u64,
}

const XMM_AREA: usize = 16 * 16;
const GEN_OFF: usize = XMM_AREA;
const CTX_RSP_OFF: usize = GEN_OFF + 5 * 8;
const CTX_RET_OFF: usize = GEN_OFF + 16 * 8 + 16;
/// Bytes the bridge actually pushes; `size_of::<RegisterContext>()` is
/// larger by the trailing alignment padding, which never hits the stack.
const CTX_FRAME: usize = CTX_RET_OFF + 8;

impl RegisterContext {
    /// Integer argument by position (System V AMD64)
    #[cfg(unix)]
    pub fn arg(&self, index: usize) -> u64 {
        match index {
            0 => self.general.rdi,
            1 => self.general.rsi,
            2 => self.general.rdx,
            3 => self.general.rcx,
            4 => self.general.r8,
            5 => self.general.r9,
            n => unsafe { *((self.general.rsp as *const u64).add(1 + (n - 6))) },
        }
    }

    /// Integer argument by position (Windows x64)
    #[cfg(windows)]
    pub fn arg(&self, index: usize) -> u64 {
        match index {
            0 => self.general.rcx,
            1 => self.general.rdx,
            2 => self.general.r8,
            3 => self.general.r9,
            n => unsafe { *((self.general.rsp as *const u64).add(5 + (n - 4))) },
        }
    }

    #[cfg(unix)]
    pub fn set_arg(&mut self, index: usize, value: u64) {
        match index {
            0 => self.general.rdi = value,
            1 => self.general.rsi = value,
            2 => self.general.rdx = value,
            3 => self.general.rcx = value,
            4 => self.general.r8 = value,
            5 => self.general.r9 = value,
            _ => tracing::warn!("cannot set stack argument {} through the context", index),
        }
    }

    #[cfg(windows)]
    pub fn set_arg(&mut self, index: usize, value: u64) {
        match index {
            0 => self.general.rcx = value,
            1 => self.general.rdx = value,
            2 => self.general.r8 = value,
            3 => self.general.r9 = value,
            _ => tracing::warn!("cannot set stack argument {} through the context", index),
        }
    }

    pub fn return_value(&self) -> u64 {
        self.general.rax
    }

    pub fn set_return_value(&mut self, value: u64) {
        self.general.rax = value;
    }
}

/// Where the bridge resumes after restoring registers
pub(crate) fn set_next_hop(ctx: &mut RegisterContext, addr: usize) {
    ctx.ret = addr as u64;
}

/// The victim's return address: at `[rsp]` on function entry
pub(crate) unsafe fn func_ret_address(ctx: &RegisterContext) -> usize {
    *(ctx.general.rsp as *const usize)
}

pub(crate) unsafe fn set_func_ret_address(ctx: &mut RegisterContext, addr: usize) {
    *(ctx.general.rsp as *mut usize) = addr;
}

/// General register numbering (REX-extended)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    fn code(self) -> u8 {
        self as u8
    }
}

/// Emitter for the handful of instruction forms the trampolines need
#[derive(Default)]
pub struct Assembler {
    buf: CodeBuffer,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finish(self) -> CodeBuffer {
        self.buf
    }

    pub fn size(&self) -> usize {
        self.buf.size()
    }

    pub fn push(&mut self, reg: Reg) {
        if reg.code() >= 8 {
            self.buf.emit8(0x41);
        }
        self.buf.emit8(0x50 + (reg.code() & 7));
    }

    pub fn pop(&mut self, reg: Reg) {
        if reg.code() >= 8 {
            self.buf.emit8(0x41);
        }
        self.buf.emit8(0x58 + (reg.code() & 7));
    }

    pub fn push_imm8(&mut self, value: i8) {
        self.buf.emit8(0x6A);
        self.buf.emit8(value as u8);
    }

    pub fn pushfq(&mut self) {
        self.buf.emit8(0x9C);
    }

    pub fn popfq(&mut self) {
        self.buf.emit8(0x9D);
    }

    pub fn sub_rsp(&mut self, imm: u32) {
        self.buf.emit_slice(&[0x48, 0x81, 0xEC]);
        self.buf.emit32(imm);
    }

    pub fn add_rsp(&mut self, imm: u32) {
        self.buf.emit_slice(&[0x48, 0x81, 0xC4]);
        self.buf.emit32(imm);
    }

    /// `movups [rsp + disp], xmmN`
    pub fn movups_store(&mut self, xmm: u8, disp: u32) {
        self.movups(0x11, xmm, disp);
    }

    /// `movups xmmN, [rsp + disp]`
    pub fn movups_load(&mut self, xmm: u8, disp: u32) {
        self.movups(0x10, xmm, disp);
    }

    fn movups(&mut self, opcode: u8, xmm: u8, disp: u32) {
        debug_assert!(xmm < 16);
        if xmm >= 8 {
            self.buf.emit8(0x44); // REX.R
        }
        self.buf.emit8(0x0F);
        self.buf.emit8(opcode);
        let reg = (xmm & 7) << 3;
        if disp < 0x80 {
            self.buf.emit8(0x44 | reg); // [base + disp8] with SIB
            self.buf.emit8(0x24); // base = rsp
            self.buf.emit8(disp as u8);
        } else {
            self.buf.emit8(0x84 | reg); // [base + disp32] with SIB
            self.buf.emit8(0x24);
            self.buf.emit32(disp);
        }
    }

    /// `lea rax, [rsp + disp32]`
    pub fn lea_rax_rsp(&mut self, disp: u32) {
        self.buf.emit_slice(&[0x48, 0x8D, 0x84, 0x24]);
        self.buf.emit32(disp);
    }

    /// `mov [rsp + disp32], rax`
    pub fn store_rax_rsp(&mut self, disp: u32) {
        self.buf.emit_slice(&[0x48, 0x89, 0x84, 0x24]);
        self.buf.emit32(disp);
    }

    /// `mov dst, src` for 64-bit registers
    pub fn mov_reg(&mut self, dst: Reg, src: Reg) {
        let mut rex = 0x48;
        if src.code() >= 8 {
            rex |= 0x04;
        }
        if dst.code() >= 8 {
            rex |= 0x01;
        }
        self.buf.emit8(rex);
        self.buf.emit8(0x89);
        self.buf.emit8(0xC0 | ((src.code() & 7) << 3) | (dst.code() & 7));
    }

    pub fn mov_imm64(&mut self, dst: Reg, value: u64) {
        let mut rex = 0x48;
        if dst.code() >= 8 {
            rex |= 0x01;
        }
        self.buf.emit8(rex);
        self.buf.emit8(0xB8 + (dst.code() & 7));
        self.buf.emit64(value);
    }

    /// `and rsp, -16`
    pub fn align_rsp16(&mut self) {
        self.buf.emit_slice(&[0x48, 0x83, 0xE4, 0xF0]);
    }

    pub fn call_rax(&mut self) {
        self.buf.emit_slice(&[0xFF, 0xD0]);
    }

    /// `jmp [rip + 0]` followed by the 8-byte target literal
    pub fn jmp_absolute(&mut self, target: u64) {
        self.buf.emit_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
        self.buf.emit64(target);
    }

    pub fn ret(&mut self) {
        self.buf.emit8(0xC3);
    }
}

/// Emit the `E9 rel32` victim patch aimed at `forwarder`
pub fn emit_patch(victim: usize, forwarder: usize) -> Result<[u8; JMP_REL32_SIZE], HookError> {
    let rel = forwarder as i64 - (victim as i64 + JMP_REL32_SIZE as i64);
    let rel32 = i32::try_from(rel).map_err(|_| HookError::TrampolineGeneration)?;
    let mut out = [0u8; JMP_REL32_SIZE];
    out[0] = 0xE9;
    out[1..].copy_from_slice(&rel32.to_le_bytes());
    Ok(out)
}

/// Forwarder body: an absolute jump to `dest` (substitute or closure trampoline)
pub fn emit_forwarder(dest: usize) -> CodeBuffer {
    let mut asm = Assembler::new();
    asm.jmp_absolute(dest as u64);
    asm.finish()
}

/// Relocated victim head plus the number of source bytes it covers
#[derive(Debug)]
pub struct RelocatedCode {
    pub code: Vec<u8>,
    pub consumed: usize,
}

/// Copy at least `min_bytes` whole instructions from `victim`, re-encoded to
/// run at `dest`, and terminate with a branch back to `victim + consumed`.
///
/// # Safety
/// `victim` must be readable for [`SCAN_WINDOW`] bytes.
pub unsafe fn relocate_head(
    victim: usize,
    min_bytes: usize,
    dest: usize,
) -> Result<RelocatedCode, HookError> {
    const SCAN_WINDOW: usize = 32;

    let src = std::slice::from_raw_parts(victim as *const u8, SCAN_WINDOW);
    let mut decoder = Decoder::with_ip(64, src, victim as u64, DecoderOptions::NONE);

    let mut instructions = Vec::new();
    let mut consumed = 0usize;
    while consumed < min_bytes {
        if !decoder.can_decode() {
            return Err(HookError::CodeTooShort);
        }
        let inst = decoder.decode();
        if inst.is_invalid() {
            tracing::error!("undecodable instruction at {:#x}", victim + consumed);
            return Err(HookError::UnsupportedInstruction);
        }
        match inst.flow_control() {
            FlowControl::Return
            | FlowControl::Interrupt
            | FlowControl::Exception
            | FlowControl::XbeginXabortXend => {
                // The prologue exits before the patch window is covered.
                tracing::error!(
                    "relocation-unsafe {:?} at {:#x}",
                    inst.flow_control(),
                    victim + consumed
                );
                return Err(HookError::UnsupportedInstruction);
            }
            _ => {}
        }
        consumed += inst.len();
        instructions.push(inst);
    }

    let block = InstructionBlock::new(&instructions, dest as u64);
    let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE).map_err(|e| {
        tracing::error!("relocation failed at {:#x}: {}", victim, e);
        HookError::RelocationFailed
    })?;

    let mut code = encoded.code_buffer;
    let back = victim + consumed;
    let next_ip = dest + code.len() + JMP_REL32_SIZE;
    let rel32 =
        i32::try_from(back as i64 - next_ip as i64).map_err(|_| HookError::RelocationFailed)?;
    code.push(0xE9);
    code.extend_from_slice(&rel32.to_le_bytes());

    Ok(RelocatedCode { code, consumed })
}

/// Per-entry closure trampoline: stash the trampoline object pointer in the
/// scratch register, then take the absolute jump into the shared bridge.
pub fn emit_closure_trampoline(tramp: usize, bridge: usize) -> CodeBuffer {
    let mut asm = Assembler::new();
    asm.mov_imm64(Reg::R11, tramp as u64);
    asm.jmp_absolute(bridge as u64);
    asm.finish()
}

/// The process-singleton closure bridge.
///
/// Entry state: `r11` holds the `ClosureTrampoline` pointer, `rsp` is exactly
/// where the intercepted code left it. The bridge materializes a
/// [`RegisterContext`] on the stack, calls `handler(ctx, tramp)`, restores
/// every saved register and returns through the context's next-hop slot.
pub fn emit_closure_bridge(handler: usize) -> CodeBuffer {
    use Reg::*;

    let mut asm = Assembler::new();

    // Context, pushed in reverse field order.
    asm.push_imm8(0); // ret (next-hop slot)
    asm.pushfq();
    asm.push_imm8(0); // dummy_0
    for reg in [R15, R14, R13, R12, R11, R10, R9, R8, Rsi, Rdi, Rsp, Rbp, Rdx, Rcx, Rbx, Rax] {
        asm.push(reg);
    }
    asm.sub_rsp(XMM_AREA as u32);
    for i in 0..16u8 {
        asm.movups_store(i, i as u32 * 16);
    }

    // The pushed rsp slot is a placeholder; store the true entry rsp.
    asm.lea_rax_rsp(CTX_FRAME as u32);
    asm.store_rax_rsp(CTX_RSP_OFF as u32);

    // handler(ctx, tramp) on an aligned stack; rbp is rebuilt from the
    // context afterwards so it is free as the frame anchor here.
    asm.mov_reg(Rbp, Rsp);
    asm.align_rsp16();
    #[cfg(unix)]
    {
        asm.mov_reg(Rdi, Rbp);
        asm.mov_reg(Rsi, R11);
    }
    #[cfg(windows)]
    {
        asm.mov_reg(Rcx, Rbp);
        asm.mov_reg(Rdx, R11);
        asm.sub_rsp(0x20); // shadow space
    }
    asm.mov_imm64(Rax, handler as u64);
    asm.call_rax();
    asm.mov_reg(Rsp, Rbp);

    for i in 0..16u8 {
        asm.movups_load(i, i as u32 * 16);
    }
    asm.add_rsp(XMM_AREA as u32);
    for reg in [Rax, Rbx, Rcx, Rdx, Rbp] {
        asm.pop(reg);
    }
    asm.add_rsp(8); // skip the rsp slot
    for reg in [Rdi, Rsi, R8, R9, R10, R11, R12, R13, R14, R15] {
        asm.pop(reg);
    }
    asm.add_rsp(8); // skip dummy_0
    asm.popfq();
    // Pops the next-hop slot and transfers there with the entry rsp restored.
    asm.ret();

    asm.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::allocator;
    use std::mem::offset_of;

    #[test]
    fn test_context_layout_is_abi_stable() {
        assert_eq!(CTX_FRAME, 408);
        assert_eq!(offset_of!(RegisterContext, xmm), 0);
        assert_eq!(offset_of!(RegisterContext, general), GEN_OFF);
        assert_eq!(
            offset_of!(RegisterContext, general) + offset_of!(GeneralRegs, rsp),
            CTX_RSP_OFF
        );
        assert_eq!(offset_of!(RegisterContext, dummy_0), 384);
        assert_eq!(offset_of!(RegisterContext, flags), 392);
        assert_eq!(offset_of!(RegisterContext, ret), CTX_RET_OFF);
        assert_eq!(offset_of!(RegisterContext, ret), 400);
    }

    #[test]
    fn test_emit_patch_encoding() {
        let patch = emit_patch(0x1000, 0x2000).unwrap();
        assert_eq!(patch, [0xE9, 0xFB, 0x0F, 0x00, 0x00]);

        let back = emit_patch(0x2000, 0x1000).unwrap();
        assert_eq!(back[0], 0xE9);
        assert_eq!(i32::from_le_bytes(back[1..].try_into().unwrap()), -0x1005);
    }

    #[test]
    fn test_forwarder_shape() {
        let buf = emit_forwarder(0xDEAD_BEEF_CAFE);
        assert_eq!(buf.size(), 14);
        assert_eq!(&buf.bytes()[..6], &[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(
            u64::from_le_bytes(buf.bytes()[6..14].try_into().unwrap()),
            0xDEAD_BEEF_CAFE
        );
    }

    #[test]
    fn test_closure_trampoline_shape() {
        let buf = emit_closure_trampoline(0x1111, 0x2222);
        assert_eq!(buf.size(), 24);
        assert_eq!(&buf.bytes()[..2], &[0x49, 0xBB]);
    }

    #[test]
    fn test_relocate_straightline_head() {
        // mov rax, 42; ret
        let block = allocator::shared().alloc_exec_block(32).unwrap();
        let victim = block.start();
        unsafe {
            crate::memory::patch::code_patch(
                victim as *mut u8,
                &[0x48, 0xC7, 0xC0, 0x2A, 0x00, 0x00, 0x00, 0xC3],
            )
            .unwrap();
        }

        let dest = allocator::shared().alloc_exec_block(64).unwrap();
        let relocated =
            unsafe { relocate_head(victim, MIN_PATCH_SIZE, dest.start()) }.expect("relocate");
        assert_eq!(relocated.consumed, 7);
        assert_eq!(relocated.code.len(), 7 + JMP_REL32_SIZE);
        assert_eq!(relocated.code[7], 0xE9);

        // The relocated head must behave like the original when executed.
        unsafe {
            crate::memory::patch::code_patch(dest.start() as *mut u8, &relocated.code).unwrap();
            let f: extern "C" fn() -> u64 = std::mem::transmute(dest.start());
            assert_eq!(f(), 42);
        }

        allocator::shared().free_block(dest);
        allocator::shared().free_block(block);
    }

    #[test]
    fn test_relocate_rejects_immediate_return() {
        let block = allocator::shared().alloc_exec_block(32).unwrap();
        unsafe {
            crate::memory::patch::code_patch(block.start() as *mut u8, &[0xC3; 8]).unwrap();
        }
        let err = unsafe { relocate_head(block.start(), MIN_PATCH_SIZE, 0x1000) }.unwrap_err();
        assert_eq!(err, HookError::UnsupportedInstruction);
        allocator::shared().free_block(block);
    }
}
