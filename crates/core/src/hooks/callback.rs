//! Hook callbacks and the context they run with

use std::ffi::CString;
use std::sync::Arc;

use slotmap::new_key_type;
use sourcebind_memory::Pointer;
use sourcebind_sdk::{FunctionSignature, Phase};

use super::detour::HookError;
use super::registers::Registers;
use crate::call::{ArgumentLayout, DynValue};

new_key_type! {
    /// Handle for one callback on a hook
    pub struct CallbackKey;
}

/// What a callback wants done after it returns
#[derive(Debug, Clone, PartialEq, Default)]
pub enum HookAction {
    /// Leave the call as it is
    #[default]
    Continue,
    /// Pre: skip the original and return this value.
    /// Post: replace the return value.
    Override(DynValue),
}

/// Callback type for hooks
pub type HookCallback = Arc<dyn Fn(&mut HookContext<'_>) -> HookAction + Send + Sync>;

/// Identifies a registered callback for removal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookHandle {
    pub address: Pointer,
    pub phase: Phase,
    pub key: CallbackKey,
}

/// View of a hooked call handed to each callback
///
/// Pre callbacks see and may change the arguments in the live registers.
/// Post callbacks see the arguments as they were passed to the original and
/// the return registers it left behind.
pub struct HookContext<'a> {
    pub(crate) phase: Phase,
    pub(crate) signature: &'a FunctionSignature,
    pub(crate) layout: &'a ArgumentLayout,
    pub(crate) registers: &'a mut Registers,
    pub(crate) entry: Option<&'a Registers>,
    pub(crate) return_address: u64,
    pub(crate) forced_return: Option<&'a DynValue>,
    pub(crate) keepalive: &'a mut Vec<CString>,
}

impl HookContext<'_> {
    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn signature(&self) -> &FunctionSignature {
        self.signature
    }

    /// Argument `index`, decoded by its signature tag
    pub fn argument(&self, index: usize) -> Result<DynValue, HookError> {
        let tag = *self
            .signature
            .args()
            .get(index)
            .ok_or(HookError::ArgumentIndex(index))?;
        let registers = self.entry.unwrap_or(&*self.registers);

        // SAFETY: rsp is the entry stack pointer of the call in progress
        unsafe {
            let bits = registers
                .argument_bits(self.layout, index)
                .ok_or(HookError::ArgumentIndex(index))?;
            Ok(DynValue::decode(tag, bits, bits))
        }
    }

    /// Replace argument `index` before the original runs
    ///
    /// Strings are kept alive until the hooked call returns.
    pub fn set_argument(&mut self, index: usize, value: DynValue) -> Result<(), HookError> {
        if self.phase != Phase::Pre {
            return Err(HookError::WrongPhase {
                operation: "set_argument",
                phase: self.phase,
            });
        }
        let tag = *self
            .signature
            .args()
            .get(index)
            .ok_or(HookError::ArgumentIndex(index))?;
        let bits = value.encode(tag, index)?;

        // SAFETY: as in `argument`
        if !unsafe { self.registers.set_argument_bits(self.layout, index, bits) } {
            return Err(HookError::ArgumentIndex(index));
        }
        if let DynValue::String(text) = value {
            self.keepalive.push(text);
        }
        Ok(())
    }

    /// Current return value
    ///
    /// In the post phase this is what the original (or a skipping pre
    /// callback) returned, including changes by earlier post callbacks. In
    /// the pre phase it is the pending override, if any.
    pub fn return_value(&self) -> DynValue {
        match self.phase {
            Phase::Pre => self.forced_return.cloned().unwrap_or_default(),
            Phase::Post => {
                let xmm0 = self.registers.xmm[0].low();
                // SAFETY: string returns come from the hooked function or a
                // retained override
                unsafe { DynValue::decode(self.signature.ret(), self.registers.rax, xmm0) }
            }
        }
    }

    /// Address the hooked call returns to
    pub fn return_address(&self) -> Pointer {
        Pointer::new(self.return_address as usize)
    }

    /// Override set by an earlier pre callback of this call
    pub fn forced_return(&self) -> Option<&DynValue> {
        self.forced_return
    }

    /// Whether the original is being skipped
    pub fn is_skipping(&self) -> bool {
        self.forced_return.is_some()
    }

    pub fn registers(&self) -> &Registers {
        &*self.registers
    }

    /// Raw registers; changes are applied when the hook resumes
    pub fn registers_mut(&mut self) -> &mut Registers {
        &mut *self.registers
    }

    /// Registers at function entry (post phase only)
    pub fn entry_registers(&self) -> Option<&Registers> {
        self.entry
    }
}
