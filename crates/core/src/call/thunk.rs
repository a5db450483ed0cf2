//! Generic call thunk
//!
//! A single piece of machine code that performs any native call described
//! by a [`CallFrame`]: it reserves and fills the stack argument area, loads
//! the argument registers, calls the target and stores both return
//! registers back into the frame.

use std::mem::offset_of;

use iced_x86::code_asm::*;
use parking_lot::Mutex;

use crate::codegen::{self, alloc, CodegenError, INT_ARG_REGS, SHADOW_SPACE};

/// Register image handed to the thunk
#[repr(C)]
#[derive(Debug)]
pub(crate) struct CallFrame {
    pub target: u64,
    pub int_args: [u64; 6],
    pub float_args: [u64; 8],
    pub stack_args: *const u64,
    pub stack_count: u64,
    pub ret_int: u64,
    pub ret_float: u64,
}

impl CallFrame {
    pub fn new(target: usize) -> Self {
        Self {
            target: target as u64,
            int_args: [0; 6],
            float_args: [0; 8],
            stack_args: std::ptr::null(),
            stack_count: 0,
            ret_int: 0,
            ret_float: 0,
        }
    }
}

type Thunk = unsafe extern "C" fn(*mut CallFrame);

const THUNK_CAPACITY: usize = 256;

/// Address of the assembled thunk, built on first use
static THUNK: Mutex<Option<usize>> = Mutex::new(None);

fn field(offset: usize) -> i32 {
    offset as i32
}

fn assemble(asm: &mut CodeAssembler) -> Result<(), IcedError> {
    let xmms = [xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7];
    let target = field(offset_of!(CallFrame, target));
    let int_args = field(offset_of!(CallFrame, int_args));
    let float_args = field(offset_of!(CallFrame, float_args));
    let stack_args = field(offset_of!(CallFrame, stack_args));
    let stack_count = field(offset_of!(CallFrame, stack_count));
    let ret_int = field(offset_of!(CallFrame, ret_int));
    let ret_float = field(offset_of!(CallFrame, ret_float));

    asm.push(rbp)?;
    asm.mov(rbp, rsp)?;
    asm.push(rbx)?;
    asm.mov(rbx, INT_ARG_REGS[0])?;

    // Outgoing area: shadow space plus stack arguments, 16-byte aligned
    asm.mov(rax, qword_ptr(rbx + stack_count))?;
    asm.shl(rax, 3)?;
    asm.add(rax, (SHADOW_SPACE + 15) as i32)?;
    asm.and(rax, -16)?;
    asm.sub(rsp, rax)?;
    asm.and(rsp, -16)?;

    let mut copy = asm.create_label();
    let mut copied = asm.create_label();
    asm.mov(r10, qword_ptr(rbx + stack_args))?;
    asm.mov(r11, qword_ptr(rbx + stack_count))?;
    asm.xor(eax, eax)?;
    asm.set_label(&mut copy)?;
    asm.cmp(rax, r11)?;
    asm.jae(copied)?;
    asm.mov(rdx, qword_ptr(r10 + rax * 8))?;
    asm.mov(qword_ptr(rsp + rax * 8 + SHADOW_SPACE as i32), rdx)?;
    asm.inc(rax)?;
    asm.jmp(copy)?;
    asm.set_label(&mut copied)?;

    // xmm6 and up are callee-saved on Microsoft x64
    for (i, xmm) in xmms.iter().take(codegen::FLOAT_ARG_COUNT).enumerate() {
        asm.movq(*xmm, qword_ptr(rbx + float_args + 8 * i as i32))?;
    }
    for (i, reg) in INT_ARG_REGS.iter().enumerate() {
        asm.mov(*reg, qword_ptr(rbx + int_args + 8 * i as i32))?;
    }

    asm.mov(r11, qword_ptr(rbx + target))?;
    // Vector register count for variadic System V callees
    asm.mov(eax, 8)?;
    asm.call(r11)?;

    asm.mov(qword_ptr(rbx + ret_int), rax)?;
    asm.movq(qword_ptr(rbx + ret_float), xmm0)?;

    asm.lea(rsp, qword_ptr(rbp - 8))?;
    asm.pop(rbx)?;
    asm.pop(rbp)?;
    asm.ret()?;
    Ok(())
}

fn thunk() -> Result<Thunk, CodegenError> {
    let mut cached = THUNK.lock();
    let address = match *cached {
        Some(address) => address,
        None => {
            let block = alloc::alloc(THUNK_CAPACITY)
                .ok_or(CodegenError::Allocation(THUNK_CAPACITY))?;
            let address = block.as_ptr() as usize;

            let mut asm = CodeAssembler::new(64)?;
            assemble(&mut asm)?;
            // SAFETY: fresh block of THUNK_CAPACITY bytes, not yet published
            let len = unsafe { codegen::emit(&mut asm, address, THUNK_CAPACITY)? };
            tracing::debug!("Assembled call thunk at {:x} ({} bytes)", address, len);

            *cached = Some(address);
            address
        }
    };

    // SAFETY: the block holds the code assembled above
    Ok(unsafe { std::mem::transmute::<usize, Thunk>(address) })
}

/// Perform the call described by `frame`
///
/// # Safety
/// `frame.target` must be a function whose real signature matches the
/// registers and stack arguments in `frame`, and `stack_args` must point to
/// `stack_count` readable words.
pub(crate) unsafe fn invoke(frame: &mut CallFrame) -> Result<(), CodegenError> {
    let thunk = thunk()?;
    thunk(frame);
    Ok(())
}

#[cfg(test)]
mod assembly_tests {
    use super::*;
    use iced_x86::Register;

    /// xmm registers the thunk writes before calling the target
    fn loaded_xmms() -> Vec<Register> {
        let mut asm = CodeAssembler::new(64).unwrap();
        assemble(&mut asm).unwrap();
        asm.instructions()
            .iter()
            .map(|instruction| instruction.op0_register())
            .filter(|register| register.is_xmm())
            .collect()
    }

    #[test]
    fn test_thunk_loads_only_float_argument_registers() {
        let loaded = loaded_xmms();
        assert_eq!(loaded.len(), codegen::FLOAT_ARG_COUNT);
        for register in loaded {
            assert!(register.number() < codegen::FLOAT_ARG_COUNT, "{:?}", register);
        }
    }
}

#[cfg(all(test, target_arch = "x86_64", unix))]
mod tests {
    use super::*;
    use crate::codegen::testing::assemble_function;

    #[test]
    fn test_thunk_register_arguments() {
        let add = assemble_function(|a| {
            a.lea(rax, qword_ptr(rdi + rsi))?;
            a.add(rax, rdx)?;
            a.ret()
        });

        let mut frame = CallFrame::new(add);
        frame.int_args[..3].copy_from_slice(&[1, 20, 300]);
        unsafe { invoke(&mut frame).unwrap() };
        assert_eq!(frame.ret_int, 321);
    }

    #[test]
    fn test_thunk_stack_arguments() {
        // Returns the second stack argument
        let second = assemble_function(|a| {
            a.mov(rax, qword_ptr(rsp + 16))?;
            a.ret()
        });

        let stack = [7u64, 99, 3];
        let mut frame = CallFrame::new(second);
        frame.stack_args = stack.as_ptr();
        frame.stack_count = stack.len() as u64;
        unsafe { invoke(&mut frame).unwrap() };
        assert_eq!(frame.ret_int, 99);
    }

    #[test]
    fn test_thunk_float_return() {
        let sum = assemble_function(|a| {
            a.addsd(xmm0, xmm1)?;
            a.ret()
        });

        let mut frame = CallFrame::new(sum);
        frame.float_args[0] = 1.25f64.to_bits();
        frame.float_args[1] = 2.5f64.to_bits();
        unsafe { invoke(&mut frame).unwrap() };
        assert_eq!(f64::from_bits(frame.ret_float), 3.75);
    }
}
