//! Machine code generation shared by the call engine and detours
//!
//! Code is assembled with `iced-x86`'s code assembler at the address it
//! will run from, then copied into memory from [`alloc`].

pub mod alloc;

use iced_x86::code_asm::{AsmRegister64, CodeAssembler};
use iced_x86::IcedError;

#[cfg(not(windows))]
use iced_x86::code_asm::{r8, r9, rcx, rdi, rdx, rsi};
#[cfg(windows)]
use iced_x86::code_asm::{r8, r9, rcx, rdx};

/// Error type for code generation
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("Failed to allocate {0} bytes of executable memory")]
    Allocation(usize),

    #[error("Assembler error: {0}")]
    Assembler(String),

    #[error("Generated {size} bytes but only {capacity} are reserved")]
    TooLarge { size: usize, capacity: usize },
}

impl From<IcedError> for CodegenError {
    fn from(err: IcedError) -> Self {
        CodegenError::Assembler(err.to_string())
    }
}

/// Stack the caller reserves above the return address for the callee
pub const SHADOW_SPACE: usize = if cfg!(windows) { 32 } else { 0 };

/// Integer argument registers in ABI order
#[cfg(not(windows))]
pub const INT_ARG_REGS: [AsmRegister64; 6] = [rdi, rsi, rdx, rcx, r8, r9];
#[cfg(windows)]
pub const INT_ARG_REGS: [AsmRegister64; 4] = [rcx, rdx, r8, r9];

/// Vector registers used for floating point arguments
pub const FLOAT_ARG_COUNT: usize = if cfg!(windows) { 4 } else { 8 };

/// Whether integer and float arguments share positional slots (Microsoft x64)
pub const POSITIONAL_ARGS: bool = cfg!(windows);

/// Length of [`absolute_jump`]
pub const ABSOLUTE_JUMP_LEN: usize = 14;

/// `jmp [rip+0]` followed by the 64-bit destination
pub fn absolute_jump(destination: u64) -> [u8; ABSOLUTE_JUMP_LEN] {
    let mut code = [0u8; ABSOLUTE_JUMP_LEN];
    code[..6].copy_from_slice(&[0xFF, 0x25, 0x00, 0x00, 0x00, 0x00]);
    code[6..].copy_from_slice(&destination.to_le_bytes());
    code
}

/// `jmp rel32` from `from` to `to`, if in range
pub fn relative_jump(from: usize, to: usize) -> Option<[u8; 5]> {
    if !alloc::within_rel32(from + 5, to) {
        return None;
    }
    let rel = (to as i64 - (from as i64 + 5)) as i32;
    let mut code = [0xE9, 0, 0, 0, 0];
    code[1..].copy_from_slice(&rel.to_le_bytes());
    Some(code)
}

/// Assemble `asm` for `address` and copy it there
///
/// # Safety
/// `address` must be writable executable memory of at least `capacity`
/// bytes that nothing is executing.
pub unsafe fn emit(
    asm: &mut CodeAssembler,
    address: usize,
    capacity: usize,
) -> Result<usize, CodegenError> {
    let code = asm.assemble(address as u64)?;
    if code.len() > capacity {
        return Err(CodegenError::TooLarge {
            size: code.len(),
            capacity,
        });
    }
    std::ptr::copy_nonoverlapping(code.as_ptr(), address as *mut u8, code.len());
    Ok(code.len())
}

/// Copy raw bytes into executable memory from [`alloc`]
///
/// # Safety
/// Same contract as [`emit`].
pub unsafe fn emit_bytes(bytes: &[u8], address: usize, capacity: usize) -> Result<(), CodegenError> {
    if bytes.len() > capacity {
        return Err(CodegenError::TooLarge {
            size: bytes.len(),
            capacity,
        });
    }
    std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absolute_jump_encoding() {
        let code = absolute_jump(0x1122_3344_5566_7788);
        assert_eq!(&code[..6], &[0xFF, 0x25, 0, 0, 0, 0]);
        assert_eq!(&code[6..], &0x1122_3344_5566_7788u64.to_le_bytes());
    }

    #[test]
    fn test_relative_jump_encoding() {
        let code = relative_jump(0x1000, 0x2000).unwrap();
        assert_eq!(code[0], 0xE9);
        assert_eq!(i32::from_le_bytes([code[1], code[2], code[3], code[4]]), 0xFFB);

        let back = relative_jump(0x2000, 0x1000).unwrap();
        assert_eq!(i32::from_le_bytes([back[1], back[2], back[3], back[4]]), -0x1005);

        assert!(relative_jump(0x1000, 0x2_0000_0000).is_none());
    }
}
