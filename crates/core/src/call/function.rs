//! Callable native functions

use std::sync::Arc;

use sourcebind_memory::{MemoryError, Pointer};
use sourcebind_sdk::{CallingConvention, FunctionSignature, Phase, SignatureError, TypeTag};

use super::layout::{ArgLocation, ArgumentLayout};
use super::thunk::{self, CallFrame};
use super::value::DynValue;
use crate::codegen::CodegenError;
use crate::hooks::{HookAction, HookContext, HookError, HookHandle, HookManager};

/// Error type for dynamic calls
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error("Expected {expected} arguments, got {got}")]
    ArgumentCount { expected: usize, got: usize },

    #[error("Argument {index} cannot be passed as {tag}")]
    ArgumentType { index: usize, tag: TypeTag },

    #[error("Function pointer is null")]
    NullFunction,

    #[error("Dynamic calls are only supported on x86-64")]
    Unsupported,

    #[error("Invalid signature: {0}")]
    Signature(#[from] SignatureError),

    #[error("Failed to build call thunk: {0}")]
    Jit(#[from] CodegenError),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// A native function address with its calling convention and signature
///
/// The signature is validated and classified once here; every call only
/// converts values.
#[derive(Debug, Clone, PartialEq)]
pub struct CallableFunction {
    address: Pointer,
    convention: CallingConvention,
    signature: FunctionSignature,
    layout: ArgumentLayout,
}

impl CallableFunction {
    pub fn new(
        address: Pointer,
        convention: CallingConvention,
        signature: FunctionSignature,
    ) -> Result<Self, CallError> {
        if address.is_null() {
            return Err(CallError::NullFunction);
        }

        let layout = ArgumentLayout::new(&signature);
        Ok(Self {
            address,
            convention,
            signature,
            layout,
        })
    }

    /// Create from a signature string such as `"ppi)B"`
    pub fn parse(
        address: Pointer,
        convention: CallingConvention,
        signature: &str,
    ) -> Result<Self, CallError> {
        Self::new(address, convention, FunctionSignature::parse(signature)?)
    }

    pub fn address(&self) -> Pointer {
        self.address
    }

    pub fn convention(&self) -> CallingConvention {
        self.convention
    }

    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    pub fn layout(&self) -> &ArgumentLayout {
        &self.layout
    }

    /// Call the function
    ///
    /// # Safety
    /// The address must point to a function whose real signature matches
    /// this one; pointer arguments must be valid for what the function does
    /// with them.
    pub unsafe fn call(&self, args: &[DynValue]) -> Result<DynValue, CallError> {
        self.call_address(self.address, args)
    }

    /// Call the unhooked function, bypassing any detour on this address
    ///
    /// Behaves like [`call`](Self::call) when the address is not hooked.
    ///
    /// # Safety
    /// Same contract as [`call`](Self::call).
    pub unsafe fn call_trampoline(
        &self,
        hooks: &HookManager,
        args: &[DynValue],
    ) -> Result<DynValue, CallError> {
        let target = hooks.trampoline(self.address).unwrap_or(self.address);
        self.call_address(target, args)
    }

    unsafe fn call_address(&self, target: Pointer, args: &[DynValue]) -> Result<DynValue, CallError> {
        if args.len() != self.signature.arity() {
            return Err(CallError::ArgumentCount {
                expected: self.signature.arity(),
                got: args.len(),
            });
        }
        if !cfg!(target_arch = "x86_64") {
            return Err(CallError::Unsupported);
        }

        let mut frame = CallFrame::new(target.address());
        let mut stack = vec![0u64; self.layout.stack_slots()];

        let slots = self.signature.args().iter().zip(self.layout.locations());
        for (index, ((tag, location), value)) in slots.zip(args).enumerate() {
            let bits = value.encode(*tag, index)?;
            match *location {
                ArgLocation::Int(reg) => frame.int_args[reg] = bits,
                ArgLocation::Float(reg) => frame.float_args[reg] = bits,
                ArgLocation::Stack(slot) => stack[slot] = bits,
            }
        }
        frame.stack_args = stack.as_ptr();
        frame.stack_count = stack.len() as u64;

        tracing::trace!(
            "Calling {} ({}, {})",
            target,
            self.signature,
            self.convention
        );
        thunk::invoke(&mut frame)?;

        Ok(DynValue::decode(
            self.signature.ret(),
            frame.ret_int,
            frame.ret_float,
        ))
    }

    pub fn is_hooked(&self, hooks: &HookManager) -> bool {
        hooks.is_hooked(self.address)
    }

    /// Entry point of the original code when hooked
    pub fn trampoline(&self, hooks: &HookManager) -> Option<Pointer> {
        hooks.trampoline(self.address)
    }

    pub fn add_pre_hook<F>(&self, hooks: &HookManager, callback: F) -> Result<HookHandle, HookError>
    where
        F: Fn(&mut HookContext<'_>) -> HookAction + Send + Sync + 'static,
    {
        hooks.add_hook(self, Phase::Pre, Arc::new(callback))
    }

    pub fn add_post_hook<F>(&self, hooks: &HookManager, callback: F) -> Result<HookHandle, HookError>
    where
        F: Fn(&mut HookContext<'_>) -> HookAction + Send + Sync + 'static,
    {
        hooks.add_hook(self, Phase::Post, Arc::new(callback))
    }
}

/// Turning raw addresses into [`CallableFunction`]s
pub trait FunctionPointer {
    fn make_function(
        self,
        convention: CallingConvention,
        signature: &str,
    ) -> Result<CallableFunction, CallError>;

    /// Function in slot `index` of the vtable of the object at `self`
    ///
    /// # Safety
    /// `self` must point to an object with a vtable of more than `index`
    /// entries.
    unsafe fn make_virtual_function(
        self,
        index: usize,
        convention: CallingConvention,
        signature: &str,
    ) -> Result<CallableFunction, CallError>;
}

impl FunctionPointer for Pointer {
    fn make_function(
        self,
        convention: CallingConvention,
        signature: &str,
    ) -> Result<CallableFunction, CallError> {
        CallableFunction::parse(self, convention, signature)
    }

    unsafe fn make_virtual_function(
        self,
        index: usize,
        convention: CallingConvention,
        signature: &str,
    ) -> Result<CallableFunction, CallError> {
        let function = self.get_virtual_function(index)?;
        CallableFunction::parse(function, convention, signature)
    }
}
