//! Bridge and post stubs of a detour
//!
//! The bridge runs in place of the hooked function's entry: it stores the
//! argument registers into a [`Registers`] on its own frame, calls the pre
//! dispatcher, reloads the (possibly changed) registers and either jumps
//! into the trampoline or, when skipping, returns straight into the post
//! stub. The pre dispatcher has already swapped the caller's return address
//! for the post stub at that point.
//!
//! The post stub stores the return registers, calls the post dispatcher,
//! which hands back the real return address, and jumps there.

use std::mem::{offset_of, size_of};

use iced_x86::code_asm::*;

use super::registers::Registers;
use crate::codegen::{self, CodegenError, INT_ARG_REGS, SHADOW_SPACE};

/// Pre dispatcher: `(hook, registers) -> skip`
pub(crate) type PreDispatch = unsafe extern "C" fn(*const (), *mut Registers) -> u64;

/// Post dispatcher: `(hook, registers, entry_sp) -> return address`
pub(crate) type PostDispatch = unsafe extern "C" fn(*const (), *mut Registers, u64) -> u64;

/// Stack reserved below the saved frame pointer
const FRAME: i32 = ((SHADOW_SPACE + size_of::<Registers>() + 15) & !15) as i32;

const XMM_ARGS: [AsmRegisterXmm; 8] = [xmm0, xmm1, xmm2, xmm3, xmm4, xmm5, xmm6, xmm7];

fn field(offset: usize) -> i32 {
    offset as i32
}

fn xmm_field(index: usize) -> i32 {
    field(offset_of!(Registers, xmm) + index * 16)
}

/// Integer registers the bridge preserves, with their slots
fn saved_gprs() -> [(AsmRegister64, i32); 7] {
    [
        (rax, field(offset_of!(Registers, rax))),
        (rdi, field(offset_of!(Registers, rdi))),
        (rsi, field(offset_of!(Registers, rsi))),
        (rdx, field(offset_of!(Registers, rdx))),
        (rcx, field(offset_of!(Registers, rcx))),
        (r8, field(offset_of!(Registers, r8))),
        (r9, field(offset_of!(Registers, r9))),
    ]
}

/// Open a frame and point r11 at the `Registers` area
fn prologue(asm: &mut CodeAssembler) -> Result<(), IcedError> {
    asm.push(rbp)?;
    asm.mov(rbp, rsp)?;
    asm.sub(rsp, FRAME)?;
    asm.and(rsp, -16)?;
    asm.lea(r11, qword_ptr(rsp + SHADOW_SPACE as i32))?;
    Ok(())
}

pub(crate) fn assemble_bridge(
    asm: &mut CodeAssembler,
    hook: usize,
    trampoline: usize,
    dispatch: PreDispatch,
) -> Result<(), IcedError> {
    prologue(asm)?;

    for (reg, offset) in saved_gprs() {
        asm.mov(qword_ptr(r11 + offset), reg)?;
    }
    for (i, xmm) in XMM_ARGS.iter().enumerate() {
        asm.movdqu(xmmword_ptr(r11 + xmm_field(i)), *xmm)?;
    }
    // Entry stack pointer: above the saved rbp, at the return address
    asm.lea(rax, qword_ptr(rbp + 8))?;
    asm.mov(qword_ptr(r11 + field(offset_of!(Registers, rsp))), rax)?;

    asm.mov(INT_ARG_REGS[0], hook as u64)?;
    asm.mov(INT_ARG_REGS[1], r11)?;
    asm.mov(rax, dispatch as usize as u64)?;
    asm.call(rax)?;
    asm.mov(r10, rax)?;

    asm.lea(r11, qword_ptr(rsp + SHADOW_SPACE as i32))?;
    for (i, xmm) in XMM_ARGS.iter().enumerate() {
        asm.movdqu(*xmm, xmmword_ptr(r11 + xmm_field(i)))?;
    }
    for (reg, offset) in saved_gprs() {
        asm.mov(reg, qword_ptr(r11 + offset))?;
    }
    asm.mov(rsp, rbp)?;
    asm.pop(rbp)?;

    let mut skip = asm.create_label();
    asm.test(r10, r10)?;
    asm.jne(skip)?;
    asm.mov(r11, trampoline as u64)?;
    asm.jmp(r11)?;
    // Return address is now the post stub
    asm.set_label(&mut skip)?;
    asm.ret()?;
    Ok(())
}

pub(crate) fn assemble_post(
    asm: &mut CodeAssembler,
    hook: usize,
    dispatch: PostDispatch,
) -> Result<(), IcedError> {
    let rax_slot = field(offset_of!(Registers, rax));
    let rdx_slot = field(offset_of!(Registers, rdx));

    prologue(asm)?;
    asm.mov(qword_ptr(r11 + rax_slot), rax)?;
    asm.mov(qword_ptr(r11 + rdx_slot), rdx)?;
    asm.movdqu(xmmword_ptr(r11 + xmm_field(0)), xmm0)?;
    asm.movdqu(xmmword_ptr(r11 + xmm_field(1)), xmm1)?;

    // rbp sits where the return address was: the entry stack pointer
    asm.mov(INT_ARG_REGS[0], hook as u64)?;
    asm.mov(INT_ARG_REGS[1], r11)?;
    asm.mov(INT_ARG_REGS[2], rbp)?;
    asm.mov(rax, dispatch as usize as u64)?;
    asm.call(rax)?;
    asm.mov(r10, rax)?;

    asm.lea(r11, qword_ptr(rsp + SHADOW_SPACE as i32))?;
    asm.mov(rax, qword_ptr(r11 + rax_slot))?;
    asm.mov(rdx, qword_ptr(r11 + rdx_slot))?;
    asm.movdqu(xmm0, xmmword_ptr(r11 + xmm_field(0)))?;
    asm.movdqu(xmm1, xmmword_ptr(r11 + xmm_field(1)))?;
    asm.mov(rsp, rbp)?;
    asm.pop(rbp)?;
    asm.jmp(r10)?;
    Ok(())
}

/// Assemble and write the bridge stub at `address`
///
/// # Safety
/// `address` must be the bridge slot of a detour block and `hook` must stay
/// valid for as long as the stub can run.
pub(crate) unsafe fn emit_bridge(
    address: usize,
    capacity: usize,
    hook: usize,
    trampoline: usize,
    dispatch: PreDispatch,
) -> Result<usize, CodegenError> {
    let mut asm = CodeAssembler::new(64)?;
    assemble_bridge(&mut asm, hook, trampoline, dispatch)?;
    codegen::emit(&mut asm, address, capacity)
}

/// Assemble and write the post stub at `address`
///
/// # Safety
/// Same contract as [`emit_bridge`].
pub(crate) unsafe fn emit_post(
    address: usize,
    capacity: usize,
    hook: usize,
    dispatch: PostDispatch,
) -> Result<usize, CodegenError> {
    let mut asm = CodeAssembler::new(64)?;
    assemble_post(&mut asm, hook, dispatch)?;
    codegen::emit(&mut asm, address, capacity)
}
