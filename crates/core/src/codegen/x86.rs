//! x86 (32-bit) backend
//!
//! Victim patches are always `E9 rel32`; with a 32-bit address space every
//! displacement is encodable, so near allocation never fails for range
//! reasons. Trampoline blocks are emitted position-independent with
//! push/ret idioms instead of rip-relative forms.

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, InstructionBlock,
};

use crate::codegen::CodeBuffer;
use crate::error::HookError;

pub const JMP_REL32_SIZE: usize = 5;
pub const MIN_PATCH_SIZE: usize = JMP_REL32_SIZE;

/// rel32 covers the whole 32-bit space modulo wrap-around
pub const NEAR_JUMP_RANGE: usize = usize::MAX >> 1;

pub const HAS_FAR_PATCH: bool = false;
pub const RELOCATED_NEEDS_NEAR: bool = true;

/// General registers in context order
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct GeneralRegs {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebp: u32,
    pub esp: u32,
    pub edi: u32,
    pub esi: u32,
}

/// Register snapshot handed to instrumentation callbacks.
///
/// Public ABI; mirrors the closure bridge's save order. `ret` is the slot the
/// closure trampoline pushed on entry - the bridge's final return pops it, so
/// whatever the dispatcher stores there becomes the next hop.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct RegisterContext {
    pub general: GeneralRegs,
    pub dummy_0: u32,
    pub flags: u32,
    pub ret: u32,
}

const CTX_SIZE: usize = std::mem::size_of::<RegisterContext>();
const CTX_ESP_OFF: usize = 5 * 4;

impl RegisterContext {
    /// cdecl stack argument by position
    pub fn arg(&self, index: usize) -> u32 {
        unsafe { *((self.general.esp as *const u32).add(1 + index)) }
    }

    pub fn return_value(&self) -> u32 {
        self.general.eax
    }

    pub fn set_return_value(&mut self, value: u32) {
        self.general.eax = value;
    }
}

pub(crate) fn set_next_hop(ctx: &mut RegisterContext, addr: usize) {
    ctx.ret = addr as u32;
}

pub(crate) unsafe fn func_ret_address(ctx: &RegisterContext) -> usize {
    *(ctx.general.esp as *const u32) as usize
}

pub(crate) unsafe fn set_func_ret_address(ctx: &mut RegisterContext, addr: usize) {
    *(ctx.general.esp as *mut u32) = addr as u32;
}

pub fn emit_patch(victim: usize, forwarder: usize) -> Result<Vec<u8>, HookError> {
    let rel = (forwarder as u32).wrapping_sub(victim as u32 + JMP_REL32_SIZE as u32);
    let mut out = vec![0xE9];
    out.extend_from_slice(&rel.to_le_bytes());
    Ok(out)
}

pub fn pad_patch(patch: &mut Vec<u8>, to: usize) {
    while patch.len() < to {
        patch.push(0x90);
    }
}

/// Forwarder body: `push dest; ret`, position-independent
pub fn emit_forwarder(dest: usize) -> CodeBuffer {
    let mut buf = CodeBuffer::new();
    buf.emit8(0x68); // push imm32
    buf.emit32(dest as u32);
    buf.emit8(0xC3); // ret
    buf
}

pub struct RelocatedCode {
    pub code: Vec<u8>,
    pub consumed: usize,
}

/// Copy at least `min_bytes` whole instructions from `victim`, re-encoded at
/// `dest`, terminated by a branch back to `victim + consumed`.
///
/// # Safety
/// `victim` must be readable for the scan window.
pub unsafe fn relocate_head(
    victim: usize,
    min_bytes: usize,
    dest: usize,
) -> Result<RelocatedCode, HookError> {
    const SCAN_WINDOW: usize = 32;

    let src = std::slice::from_raw_parts(victim as *const u8, SCAN_WINDOW);
    let mut decoder = Decoder::with_ip(32, src, victim as u64, DecoderOptions::NONE);

    let mut instructions = Vec::new();
    let mut consumed = 0usize;
    while consumed < min_bytes {
        if !decoder.can_decode() {
            return Err(HookError::CodeTooShort);
        }
        let inst = decoder.decode();
        if inst.is_invalid() {
            return Err(HookError::UnsupportedInstruction);
        }
        match inst.flow_control() {
            FlowControl::Return
            | FlowControl::Interrupt
            | FlowControl::Exception
            | FlowControl::XbeginXabortXend => {
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
    let encoded = BlockEncoder::encode(32, block, BlockEncoderOptions::NONE).map_err(|e| {
        tracing::error!("relocation failed at {:#x}: {}", victim, e);
        HookError::RelocationFailed
    })?;

    let mut code = encoded.code_buffer;
    let back = victim + consumed;
    let next_ip = (dest + code.len() + JMP_REL32_SIZE) as u32;
    let rel = (back as u32).wrapping_sub(next_ip);
    code.push(0xE9);
    code.extend_from_slice(&rel.to_le_bytes());

    Ok(RelocatedCode { code, consumed })
}

/// Per-entry closure trampoline: `push tramp; push bridge; ret`. The first
/// push stays on the stack as the next-hop slot the bridge returns through.
pub fn emit_closure_trampoline(tramp: usize, bridge: usize) -> CodeBuffer {
    let mut buf = CodeBuffer::new();
    buf.emit8(0x68);
    buf.emit32(tramp as u32);
    buf.emit8(0x68);
    buf.emit32(bridge as u32);
    buf.emit8(0xC3);
    buf
}

/// The process-singleton closure bridge.
///
/// Entry state: `[esp]` holds the trampoline pointer (pushed by the stub),
/// `[esp + 4]` the victim caller's return address. The context is built
/// directly below the trampoline slot, so the slot doubles as `ctx.ret`.
pub fn emit_closure_bridge(handler: usize) -> CodeBuffer {
    let mut buf = CodeBuffer::new();

    buf.emit8(0x9C); // pushfd
    buf.emit_slice(&[0x6A, 0x00]); // push 0 (dummy_0)
    buf.emit8(0x56); // push esi
    buf.emit8(0x57); // push edi
    buf.emit8(0x54); // push esp (placeholder)
    buf.emit8(0x55); // push ebp
    buf.emit8(0x52); // push edx
    buf.emit8(0x51); // push ecx
    buf.emit8(0x53); // push ebx
    buf.emit8(0x50); // push eax

    // Fix the esp slot: the function-entry esp sits just above the tramp
    // slot, CTX_SIZE bytes over the context base.
    // lea eax, [esp + CTX_SIZE]
    buf.emit_slice(&[0x8D, 0x84, 0x24]);
    buf.emit32(CTX_SIZE as u32);
    // mov [esp + CTX_ESP_OFF], eax
    buf.emit_slice(&[0x89, 0x84, 0x24]);
    buf.emit32(CTX_ESP_OFF as u32);

    // mov eax, [esp + CTX_SIZE - 4]  (tramp pointer from the ret slot)
    buf.emit_slice(&[0x8B, 0x84, 0x24]);
    buf.emit32((CTX_SIZE - 4) as u32);
    // mov ecx, esp  (ctx)
    buf.emit_slice(&[0x89, 0xE1]);

    // Aligned cdecl call: handler(ctx, tramp).
    buf.emit_slice(&[0x89, 0xE5]); // mov ebp, esp
    buf.emit_slice(&[0x83, 0xE4, 0xF0]); // and esp, -16
    buf.emit_slice(&[0x83, 0xEC, 0x08]); // sub esp, 8
    buf.emit8(0x50); // push eax (tramp)
    buf.emit8(0x51); // push ecx (ctx)
    buf.emit8(0xB8); // mov eax, handler
    buf.emit32(handler as u32);
    buf.emit_slice(&[0xFF, 0xD0]); // call eax
    buf.emit_slice(&[0x89, 0xEC]); // mov esp, ebp

    buf.emit8(0x58); // pop eax
    buf.emit8(0x5B); // pop ebx
    buf.emit8(0x59); // pop ecx
    buf.emit8(0x5A); // pop edx
    buf.emit8(0x5D); // pop ebp
    buf.emit_slice(&[0x83, 0xC4, 0x04]); // skip esp slot
    buf.emit8(0x5F); // pop edi
    buf.emit8(0x5E); // pop esi
    buf.emit_slice(&[0x83, 0xC4, 0x04]); // skip dummy_0
    buf.emit8(0x9D); // popfd
    buf.emit8(0xC3); // ret -> next hop, entry esp restored

    buf
}
