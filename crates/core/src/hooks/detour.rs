//! Inline detours
//!
//! Overwrites a function's first instructions with a jump to a bridge stub
//! and moves those instructions into a trampoline that continues into the
//! rest of the original function.
//!
//! Each detour owns one block of executable memory near its target:
//!
//! | offset | contents |
//! |---|---|
//! | 0 | trampoline: relocated prologue + absolute jump back |
//! | 128 | bridge stub (entry, pre dispatch) |
//! | 448 | post stub (return, post dispatch) |

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction,
    InstructionBlock,
};
use sourcebind_memory::{MemoryError, Pointer};
use sourcebind_sdk::{CallingConvention, Phase};

use crate::call::CallError;
use crate::codegen::{self, absolute_jump, alloc, relative_jump, CodegenError};

/// Error type for hook operations
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Invalid address: {0:x}")]
    InvalidAddress(usize),

    #[error("Failed to create detour: {0}")]
    DetourCreation(String),

    #[error("Function at {0:x} is too short to hook")]
    TooShort(usize),

    #[error("Instruction relocation failed: {0}")]
    Relocation(String),

    #[error("Memory protection failed: {0}")]
    MemoryProtection(String),

    #[error("Failed to allocate {0} bytes of executable memory")]
    Allocation(usize),

    #[error("Calling convention {0} is not supported on this architecture")]
    UnsupportedConvention(CallingConvention),

    #[error("Hook not found")]
    NotFound,

    #[error("Argument {0} does not exist")]
    ArgumentIndex(usize),

    #[error("{operation} is not available in the {phase} phase")]
    WrongPhase {
        operation: &'static str,
        phase: Phase,
    },

    #[error(transparent)]
    Call(#[from] CallError),

    #[error(transparent)]
    Codegen(#[from] CodegenError),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

pub(crate) const TRAMPOLINE_OFFSET: usize = 0;
pub(crate) const TRAMPOLINE_CAPACITY: usize = 128;
pub(crate) const BRIDGE_OFFSET: usize = 128;
pub(crate) const BRIDGE_CAPACITY: usize = 320;
pub(crate) const POST_OFFSET: usize = 448;
pub(crate) const POST_CAPACITY: usize = 192;
const BLOCK_SIZE: usize = POST_OFFSET + POST_CAPACITY;

/// Bytes decoded at the target; longer than any prologue we relocate
const PROLOGUE_WINDOW: usize = 32;

/// Relocated prologue of a target function
#[derive(Debug)]
pub(crate) struct Relocated {
    /// Trampoline code including the jump back
    pub code: Vec<u8>,
    /// Bytes of whole instructions taken from the target
    pub consumed: usize,
}

/// Re-encode the instructions covering the first `needed` bytes of `code`
/// (located at `target`) to run from `trampoline`, then jump back
pub(crate) fn relocate(
    target: usize,
    code: &[u8],
    needed: usize,
    trampoline: usize,
) -> Result<Relocated, HookError> {
    let mut decoder = Decoder::with_ip(64, code, target as u64, DecoderOptions::NONE);
    let mut instructions: Vec<Instruction> = Vec::new();
    let mut consumed = 0;

    while consumed < needed {
        if !decoder.can_decode() {
            return Err(HookError::TooShort(target));
        }
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(HookError::TooShort(target));
        }

        consumed += instruction.len();
        let ends_function = matches!(
            instruction.flow_control(),
            FlowControl::Return
                | FlowControl::UnconditionalBranch
                | FlowControl::IndirectBranch
                | FlowControl::Interrupt
                | FlowControl::Exception
        );
        instructions.push(instruction);

        if ends_function && consumed < needed {
            return Err(HookError::TooShort(target));
        }
    }

    let block = InstructionBlock::new(&instructions, trampoline as u64);
    let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)
        .map_err(|e| HookError::Relocation(e.to_string()))?;

    let mut code = encoded.code_buffer;
    code.extend_from_slice(&absolute_jump((target + consumed) as u64));
    Ok(Relocated { code, consumed })
}

/// Write `bytes` over code at `address`
///
/// # Safety
/// `address` must be mapped code that no thread is executing inside the
/// written range.
pub(crate) unsafe fn write_code(address: usize, bytes: &[u8]) -> Result<(), HookError> {
    let _guard = region::protect_with_handle(
        address as *const u8,
        bytes.len(),
        region::Protection::READ_WRITE_EXECUTE,
    )
    .map_err(|e| HookError::MemoryProtection(e.to_string()))?;

    std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
    Ok(())
}

/// A prepared or installed detour
#[derive(Debug)]
pub(crate) struct Detour {
    pub target: usize,
    pub trampoline: usize,
    pub bridge: usize,
    pub post_stub: usize,
    /// Jump to the bridge, padded with NOPs to whole instructions
    patch: Vec<u8>,
    /// Bytes the patch replaces
    original: Vec<u8>,
}

impl Detour {
    /// Allocate the stub block and build the trampoline for `target`
    ///
    /// Nothing at `target` is modified until [`install`](Self::install).
    ///
    /// # Safety
    /// `target` must be the entry of a function readable for at least 32
    /// bytes.
    pub unsafe fn prepare(target: usize) -> Result<Self, HookError> {
        if target == 0 {
            return Err(HookError::InvalidAddress(target));
        }

        let block = alloc::alloc_near(target, BLOCK_SIZE)
            .ok_or(HookError::Allocation(BLOCK_SIZE))?
            .as_ptr() as usize;
        let trampoline = block + TRAMPOLINE_OFFSET;
        let bridge = block + BRIDGE_OFFSET;
        let post_stub = block + POST_OFFSET;

        let jump: Vec<u8> = match relative_jump(target, bridge) {
            Some(near) => near.to_vec(),
            None => absolute_jump(bridge as u64).to_vec(),
        };

        let prologue = Pointer::new(target).read_bytes(PROLOGUE_WINDOW)?;
        let relocated = relocate(target, &prologue, jump.len(), trampoline)?;
        codegen::emit_bytes(&relocated.code, trampoline, TRAMPOLINE_CAPACITY)?;

        let mut patch = jump;
        patch.resize(relocated.consumed, 0x90);

        tracing::debug!(
            "Prepared detour for {:x}: {} byte patch, trampoline at {:x}",
            target,
            patch.len(),
            trampoline
        );

        Ok(Self {
            target,
            trampoline,
            bridge,
            post_stub,
            original: prologue[..relocated.consumed].to_vec(),
            patch,
        })
    }

    pub fn patch_len(&self) -> usize {
        self.patch.len()
    }

    /// Redirect the target into the bridge stub
    ///
    /// # Safety
    /// The bridge stub must be emitted; see [`write_code`].
    pub unsafe fn install(&self) -> Result<(), HookError> {
        write_code(self.target, &self.patch)
    }

    /// Put the original bytes back
    ///
    /// # Safety
    /// See [`write_code`].
    pub unsafe fn restore(&self) -> Result<(), HookError> {
        write_code(self.target, &self.original)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relocate_plain_prologue() {
        // push rbp; mov rbp, rsp; sub rsp, 0x20; ret
        let code = [0x55, 0x48, 0x89, 0xE5, 0x48, 0x83, 0xEC, 0x20, 0xC3];
        let relocated = relocate(0x1000, &code, 5, 0x9000).unwrap();

        assert_eq!(relocated.consumed, 8);
        assert_eq!(&relocated.code[..8], &code[..8]);
        assert_eq!(&relocated.code[8..], &absolute_jump(0x1008));
    }

    #[test]
    fn test_relocate_rip_relative() {
        // lea rax, [rip+0x10]; ret
        let code = [0x48, 0x8D, 0x05, 0x10, 0x00, 0x00, 0x00, 0xC3];
        let relocated = relocate(0x1000, &code, 5, 0x2000).unwrap();
        assert_eq!(relocated.consumed, 7);

        // Still addresses 0x1017 from its new location
        let disp = i32::from_le_bytes([
            relocated.code[3],
            relocated.code[4],
            relocated.code[5],
            relocated.code[6],
        ]);
        assert_eq!(0x2007 + disp as i64, 0x1017);
    }

    #[test]
    fn test_relocate_too_short() {
        // xor eax, eax; ret
        let code = [0x31, 0xC0, 0xC3, 0xCC, 0xCC, 0xCC];
        assert!(matches!(
            relocate(0x1000, &code, 5, 0x2000),
            Err(HookError::TooShort(0x1000))
        ));

        // Truncated input
        assert!(matches!(
            relocate(0x1000, &[0x90, 0x90], 5, 0x2000),
            Err(HookError::TooShort(_))
        ));
    }

    #[test]
    fn test_prepare_null_target() {
        assert!(matches!(
            unsafe { Detour::prepare(0) },
            Err(HookError::InvalidAddress(0))
        ));
    }
}
