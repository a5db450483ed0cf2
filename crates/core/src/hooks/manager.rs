//! Hook registry and dispatch
//!
//! One [`Hook`] exists per detoured address. Installing a second callback
//! on the same address reuses it; removing the last callback restores the
//! original bytes. Retired hooks are kept alive because a thread may still
//! be between the bridge and post stubs of a call that started earlier.

use std::collections::{HashMap, VecDeque};
use std::ffi::CString;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use sourcebind_memory::Pointer;
use sourcebind_sdk::{CallingConvention, FunctionSignature, Phase, TypeTag};

use super::callback::{CallbackKey, HookAction, HookCallback, HookContext, HookHandle};
use super::detour::{Detour, HookError, BRIDGE_CAPACITY, POST_CAPACITY};
use super::registers::Registers;
use super::stubs;
use crate::call::{ArgumentLayout, CallableFunction, DynValue};
use crate::registry::OrderedRegistry;

/// String return overrides kept alive per hook
const RETAINED_STRINGS: usize = 64;

/// State of one call between entry and return
struct Scope {
    return_address: u64,
    entry: Registers,
    forced_return: Option<DynValue>,
    keepalive: Vec<CString>,
}

/// A detoured function and its callbacks
pub struct Hook {
    address: Pointer,
    convention: CallingConvention,
    signature: FunctionSignature,
    layout: ArgumentLayout,
    detour: Detour,
    pre: Mutex<OrderedRegistry<CallbackKey, HookCallback>>,
    post: Mutex<OrderedRegistry<CallbackKey, HookCallback>>,
    /// Calls in flight, keyed by entry stack pointer
    scopes: Mutex<HashMap<u64, Vec<Scope>>>,
    retained: Mutex<VecDeque<CString>>,
}

impl Hook {
    /// Detour `function` and emit its stubs
    ///
    /// # Safety
    /// `function` must point at the entry of a real function.
    unsafe fn install(function: &CallableFunction) -> Result<Arc<Self>, HookError> {
        let detour = Detour::prepare(function.address().address())?;

        let hook = Arc::new(Self {
            address: function.address(),
            convention: function.convention(),
            signature: function.signature().clone(),
            layout: function.layout().clone(),
            detour,
            pre: Mutex::new(OrderedRegistry::new()),
            post: Mutex::new(OrderedRegistry::new()),
            scopes: Mutex::new(HashMap::new()),
            retained: Mutex::new(VecDeque::new()),
        });

        let this = Arc::as_ptr(&hook) as usize;
        let detour = &hook.detour;
        stubs::emit_bridge(
            detour.bridge,
            BRIDGE_CAPACITY,
            this,
            detour.trampoline,
            dispatch_pre,
        )
        .and_then(|_| stubs::emit_post(detour.post_stub, POST_CAPACITY, this, dispatch_post))
        .map_err(|e| HookError::DetourCreation(e.to_string()))?;

        detour.install()?;
        Ok(hook)
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

    /// Entry point that runs the original code
    pub fn trampoline(&self) -> Pointer {
        Pointer::new(self.detour.trampoline)
    }

    pub fn pre_count(&self) -> usize {
        self.pre.lock().len()
    }

    pub fn post_count(&self) -> usize {
        self.post.lock().len()
    }

    /// Calls currently between entry and return
    pub fn in_flight(&self) -> usize {
        self.scopes.lock().values().map(Vec::len).sum()
    }

    fn callbacks(&self, phase: Phase) -> &Mutex<OrderedRegistry<CallbackKey, HookCallback>> {
        match phase {
            Phase::Pre => &self.pre,
            Phase::Post => &self.post,
        }
    }

    fn is_empty(&self) -> bool {
        self.pre.lock().is_empty() && self.post.lock().is_empty()
    }

    /// Write a return override into the return registers
    fn apply_return(&self, value: DynValue, registers: &mut Registers) -> Result<(), HookError> {
        let ret = self.signature.ret();
        if ret == TypeTag::Void {
            return Ok(());
        }

        let bits = value.encode(ret, 0)?;
        registers.rax = bits;
        registers.xmm[0].set_low(bits);

        if let DynValue::String(text) = value {
            let mut retained = self.retained.lock();
            retained.push_back(text);
            if retained.len() > RETAINED_STRINGS {
                retained.pop_front();
            }
        }
        Ok(())
    }

    fn push_scope(&self, entry_sp: u64, scope: Scope) {
        self.scopes.lock().entry(entry_sp).or_default().push(scope);
    }

    fn pop_scope(&self, entry_sp: u64) -> Option<Scope> {
        let mut scopes = self.scopes.lock();
        let stack = scopes.get_mut(&entry_sp)?;
        let scope = stack.pop();
        if stack.is_empty() {
            scopes.remove(&entry_sp);
        }
        scope
    }

    fn run_callback(
        &self,
        phase: Phase,
        callback: &HookCallback,
        ctx: &mut HookContext<'_>,
    ) -> HookAction {
        match catch_unwind(AssertUnwindSafe(|| callback(ctx))) {
            Ok(action) => action,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(
                    "{} hook callback on {} panicked: {}",
                    phase,
                    self.address,
                    message
                );
                HookAction::Continue
            }
        }
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook")
            .field("address", &self.address)
            .field("signature", &self.signature.to_string())
            .field("trampoline", &self.trampoline())
            .field("pre", &self.pre_count())
            .field("post", &self.post_count())
            .finish()
    }
}

/// Entry of every hooked call, called from the bridge stub
///
/// Returns non-zero when the original must be skipped.
unsafe extern "C" fn dispatch_pre(hook: *const (), registers: *mut Registers) -> u64 {
    let hook = &*(hook as *const Hook);
    let registers = &mut *registers;
    let entry_sp = registers.rsp;
    let return_address = registers.return_address();

    tracing::trace!("Pre dispatch {} (frame {:x})", hook.address, entry_sp);

    let callbacks = hook.pre.lock().snapshot();
    let mut keepalive = Vec::new();
    let mut forced: Option<DynValue> = None;

    for callback in &callbacks {
        let mut ctx = HookContext {
            phase: Phase::Pre,
            signature: &hook.signature,
            layout: &hook.layout,
            registers: &mut *registers,
            entry: None,
            return_address,
            forced_return: forced.as_ref(),
            keepalive: &mut keepalive,
        };
        if let HookAction::Override(value) = hook.run_callback(Phase::Pre, callback, &mut ctx) {
            // Later callbacks still run; the last override wins
            forced = Some(value);
        }
    }

    let mut skip = false;
    if let Some(value) = forced.clone() {
        match hook.apply_return(value, registers) {
            Ok(()) => skip = true,
            Err(e) => tracing::error!("Ignoring return override on {}: {}", hook.address, e),
        }
    }

    hook.push_scope(
        entry_sp,
        Scope {
            return_address,
            entry: *registers,
            forced_return: if skip { forced } else { None },
            keepalive,
        },
    );
    *(entry_sp as *mut u64) = hook.detour.post_stub as u64;

    skip as u64
}

/// Return of every hooked call, called from the post stub
///
/// Returns the address the hooked call must return to.
unsafe extern "C" fn dispatch_post(hook: *const (), registers: *mut Registers, entry_sp: u64) -> u64 {
    let hook = &*(hook as *const Hook);
    let Some(mut scope) = hook.pop_scope(entry_sp) else {
        tracing::error!(
            "Hook on {} lost the return address of frame {:x}",
            hook.address,
            entry_sp
        );
        std::process::abort();
    };

    // Only the return registers were stored by the stub
    let mut live = scope.entry;
    live.rax = std::ptr::addr_of!((*registers).rax).read();
    live.rdx = std::ptr::addr_of!((*registers).rdx).read();
    live.xmm[0] = std::ptr::addr_of!((*registers).xmm[0]).read();
    live.xmm[1] = std::ptr::addr_of!((*registers).xmm[1]).read();

    tracing::trace!("Post dispatch {} (frame {:x})", hook.address, entry_sp);

    let callbacks = hook.post.lock().snapshot();
    for callback in &callbacks {
        let mut ctx = HookContext {
            phase: Phase::Post,
            signature: &hook.signature,
            layout: &hook.layout,
            registers: &mut live,
            entry: Some(&scope.entry),
            return_address: scope.return_address,
            forced_return: scope.forced_return.as_ref(),
            keepalive: &mut scope.keepalive,
        };
        if let HookAction::Override(value) = hook.run_callback(Phase::Post, callback, &mut ctx) {
            if let Err(e) = hook.apply_return(value, &mut live) {
                tracing::error!("Ignoring return override on {}: {}", hook.address, e);
            }
        }
    }

    std::ptr::addr_of_mut!((*registers).rax).write(live.rax);
    std::ptr::addr_of_mut!((*registers).rdx).write(live.rdx);
    std::ptr::addr_of_mut!((*registers).xmm[0]).write(live.xmm[0]);
    std::ptr::addr_of_mut!((*registers).xmm[1]).write(live.xmm[1]);

    scope.return_address
}

/// Installs, tracks and removes detours
#[derive(Default)]
pub struct HookManager {
    hooks: RwLock<HashMap<Pointer, Arc<Hook>>>,
    retired: Mutex<Vec<Arc<Hook>>>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` on `function`, detouring it on first use
    ///
    /// Fails with [`HookError::InvalidAddress`] for a null function and with
    /// the detour's error when the function cannot be patched.
    #[tracing::instrument(skip_all, fields(address = %function.address(), phase = %phase))]
    pub fn add_hook(
        &self,
        function: &CallableFunction,
        phase: Phase,
        callback: HookCallback,
    ) -> Result<HookHandle, HookError> {
        let address = function.address();
        if address.is_null() {
            return Err(HookError::InvalidAddress(0));
        }
        if !cfg!(target_arch = "x86_64") {
            return Err(HookError::UnsupportedConvention(function.convention()));
        }

        let mut hooks = self.hooks.write();
        let hook = match hooks.get(&address) {
            Some(hook) => {
                if hook.signature != *function.signature() {
                    tracing::warn!(
                        "Hook on {} keeps signature {}, ignoring {}",
                        address,
                        hook.signature,
                        function.signature()
                    );
                }
                hook.clone()
            }
            None => {
                // SAFETY: CallableFunction addresses are function entries
                let hook = unsafe { Hook::install(function)? };
                tracing::info!(
                    "Hooked {} ({}), trampoline at {}",
                    address,
                    function.signature(),
                    hook.trampoline()
                );
                hooks.insert(address, hook.clone());
                hook
            }
        };
        drop(hooks);

        let key = hook.callbacks(phase).lock().insert(callback);
        Ok(HookHandle {
            address,
            phase,
            key,
        })
    }

    /// Remove one callback; unhooks the address when it was the last
    ///
    /// Returns `false` if the callback is not registered.
    pub fn remove_hook(&self, handle: &HookHandle) -> bool {
        let mut hooks = self.hooks.write();
        let Some(hook) = hooks.get(&handle.address).cloned() else {
            return false;
        };

        let removed = hook.callbacks(handle.phase).lock().remove(handle.key).is_some();
        if removed && hook.is_empty() {
            hooks.remove(&handle.address);
            self.retire(hook);
        }
        removed
    }

    /// Remove `callback` from `function`'s `phase` list, matched by identity
    pub fn remove_callback(
        &self,
        function: &CallableFunction,
        phase: Phase,
        callback: &HookCallback,
    ) -> bool {
        let key = match self.hooks.read().get(&function.address()) {
            Some(hook) => hook
                .callbacks(phase)
                .lock()
                .find(|registered| Arc::ptr_eq(registered, callback)),
            None => None,
        };

        match key {
            Some(key) => self.remove_hook(&HookHandle {
                address: function.address(),
                phase,
                key,
            }),
            None => false,
        }
    }

    fn retire(&self, hook: Arc<Hook>) {
        // SAFETY: the patch was written by this hook and the stubs stay mapped
        match unsafe { hook.detour.restore() } {
            Ok(()) => tracing::info!("Unhooked {}", hook.address),
            Err(e) => tracing::error!("Failed to unhook {}: {}", hook.address, e),
        }
        self.retired.lock().push(hook);
    }

    pub fn find_hook(&self, address: Pointer) -> Option<Arc<Hook>> {
        self.hooks.read().get(&address).cloned()
    }

    pub fn is_hooked(&self, address: Pointer) -> bool {
        self.hooks.read().contains_key(&address)
    }

    /// Trampoline of the hook on `address`, if any
    pub fn trampoline(&self, address: Pointer) -> Option<Pointer> {
        self.hooks.read().get(&address).map(|hook| hook.trampoline())
    }

    /// Every installed hook
    pub fn hooks(&self) -> Vec<Arc<Hook>> {
        self.hooks.read().values().cloned().collect()
    }

    /// Remove every hook and restore all patched functions
    pub fn unhook_all(&self) {
        let hooks: Vec<_> = self.hooks.write().drain().map(|(_, hook)| hook).collect();
        for hook in hooks {
            hook.pre.lock().clear();
            hook.post.lock().clear();
            self.retire(hook);
        }
    }
}

impl Drop for HookManager {
    fn drop(&mut self) {
        self.unhook_all();
        // Stubs keep raw pointers to their hooks
        for hook in self.retired.get_mut().drain(..) {
            std::mem::forget(hook);
        }
    }
}

#[cfg(all(test, target_arch = "x86_64", unix))]
mod tests {
    use super::*;
    use crate::codegen::testing::assemble_function;
    use iced_x86::code_asm::*;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// `counter += 1; return a * 2 + b` with a prologue long enough to patch
    fn counted_target(counter: &'static AtomicU64) -> usize {
        assemble_function(|a| {
            a.push(rbx)?;
            a.mov(rbx, counter.as_ptr() as u64)?;
            a.add(qword_ptr(rbx), 1)?;
            a.pop(rbx)?;
            a.lea(rax, qword_ptr(rsi + rdi * 2))?;
            a.ret()
        })
    }

    fn function(address: usize, signature: &str) -> CallableFunction {
        CallableFunction::parse(Pointer::new(address), CallingConvention::Cdecl, signature)
            .unwrap()
    }

    fn int_args(a: i64, b: i64) -> Vec<DynValue> {
        vec![DynValue::Int(a), DynValue::Int(b)]
    }

    #[test]
    fn test_install_is_idempotent() {
        static CALLS: AtomicU64 = AtomicU64::new(0);
        let target = function(counted_target(&CALLS), "ll)l");
        let hooks = HookManager::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = order.clone();
        let a = target
            .add_pre_hook(&hooks, move |_| {
                first.lock().push(1);
                HookAction::Continue
            })
            .unwrap();
        let second = order.clone();
        let b = target
            .add_pre_hook(&hooks, move |_| {
                second.lock().push(2);
                HookAction::Continue
            })
            .unwrap();

        assert_eq!(hooks.hooks().len(), 1);
        let hook = hooks.find_hook(target.address()).unwrap();
        assert_eq!(hook.pre_count(), 2);

        let result = unsafe { target.call(&int_args(3, 4)) }.unwrap();
        assert_eq!(result, DynValue::Int(10));
        assert_eq!(*order.lock(), vec![1, 2]);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);

        assert!(hooks.remove_hook(&a));
        assert!(!hooks.remove_hook(&a));
        assert!(target.is_hooked(&hooks));

        unsafe { target.call(&int_args(1, 1)) }.unwrap();
        assert_eq!(*order.lock(), vec![1, 2, 2]);

        assert!(hooks.remove_hook(&b));
        assert!(!target.is_hooked(&hooks));
        assert_eq!(hooks.hooks().len(), 0);

        // Original bytes are back
        assert_eq!(unsafe { target.call(&int_args(5, 1)) }.unwrap(), DynValue::Int(11));
        assert_eq!(*order.lock(), vec![1, 2, 2]);
        assert_eq!(CALLS.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_pre_override_skips_original() {
        static CALLS: AtomicU64 = AtomicU64::new(0);
        let target = function(counted_target(&CALLS), "ll)l");
        let hooks = HookManager::new();
        let seen_by_post = Arc::new(Mutex::new(None));
        let later_ran = Arc::new(AtomicUsize::new(0));

        target
            .add_pre_hook(&hooks, |_| HookAction::Override(DynValue::Int(99)))
            .unwrap();
        let later = later_ran.clone();
        target
            .add_pre_hook(&hooks, move |ctx| {
                assert_eq!(ctx.forced_return(), Some(&DynValue::Int(99)));
                later.fetch_add(1, Ordering::SeqCst);
                HookAction::Continue
            })
            .unwrap();
        let seen = seen_by_post.clone();
        target
            .add_post_hook(&hooks, move |ctx| {
                *seen.lock() = Some(ctx.return_value());
                HookAction::Continue
            })
            .unwrap();

        let result = unsafe { target.call(&int_args(3, 4)) }.unwrap();
        assert_eq!(result, DynValue::Int(99));
        assert_eq!(CALLS.load(Ordering::SeqCst), 0);
        assert_eq!(later_ran.load(Ordering::SeqCst), 1);
        assert_eq!(*seen_by_post.lock(), Some(DynValue::Int(99)));
    }

    #[test]
    fn test_arguments_and_post_override() {
        static CALLS: AtomicU64 = AtomicU64::new(0);
        let target = function(counted_target(&CALLS), "ll)l");
        let hooks = HookManager::new();

        target
            .add_pre_hook(&hooks, |ctx| {
                assert_eq!(ctx.argument(0).unwrap(), DynValue::Int(3));
                ctx.set_argument(1, DynValue::Int(100)).unwrap();
                HookAction::Continue
            })
            .unwrap();
        target
            .add_post_hook(&hooks, |ctx| {
                assert_eq!(ctx.argument(1).unwrap(), DynValue::Int(100));
                assert_eq!(ctx.return_value(), DynValue::Int(106));
                HookAction::Override(DynValue::Int(ctx.return_value().as_i64().unwrap() + 1))
            })
            .unwrap();

        let result = unsafe { target.call(&int_args(3, 4)) }.unwrap();
        assert_eq!(result, DynValue::Int(107));
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_call_trampoline_bypasses_hooks() {
        static CALLS: AtomicU64 = AtomicU64::new(0);
        let target = function(counted_target(&CALLS), "ll)l");
        let hooks = HookManager::new();
        let pre_calls = Arc::new(AtomicUsize::new(0));

        let counter = pre_calls.clone();
        target
            .add_pre_hook(&hooks, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                HookAction::Override(DynValue::Int(-1))
            })
            .unwrap();

        let result = unsafe { target.call_trampoline(&hooks, &int_args(2, 1)) }.unwrap();
        assert_eq!(result, DynValue::Int(5));
        assert_eq!(pre_calls.load(Ordering::SeqCst), 0);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
        assert_eq!(target.trampoline(&hooks), hooks.trampoline(target.address()));
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        static CALLS: AtomicU64 = AtomicU64::new(0);
        let target = function(counted_target(&CALLS), "ll)l");
        let hooks = HookManager::new();
        let after = Arc::new(AtomicUsize::new(0));

        target.add_pre_hook(&hooks, |_| panic!("callback failure")).unwrap();
        let counter = after.clone();
        target
            .add_pre_hook(&hooks, move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                HookAction::Continue
            })
            .unwrap();

        let result = unsafe { target.call(&int_args(1, 2)) }.unwrap();
        assert_eq!(result, DynValue::Int(4));
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert_eq!(CALLS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_string_return_override() {
        static CALLS: AtomicU64 = AtomicU64::new(0);
        let address = assemble_function(|a| {
            a.push(rbx)?;
            a.mov(rbx, CALLS.as_ptr() as u64)?;
            a.add(qword_ptr(rbx), 1)?;
            a.pop(rbx)?;
            a.xor(eax, eax)?;
            a.ret()
        });
        let target = function(address, ")Z");
        let hooks = HookManager::new();

        let callback: HookCallback = Arc::new(|_: &mut HookContext<'_>| {
            HookAction::Override(DynValue::String(CString::new("patched").unwrap()))
        });
        hooks.add_hook(&target, Phase::Post, callback.clone()).unwrap();

        let result = unsafe { target.call(&[]) }.unwrap();
        assert_eq!(result, DynValue::String(CString::new("patched").unwrap()));

        let hook = hooks.find_hook(target.address()).unwrap();
        assert_eq!(hook.retained.lock().len(), 1);
        drop(hook);

        assert!(hooks.remove_callback(&target, Phase::Post, &callback));
        assert!(!hooks.remove_callback(&target, Phase::Post, &callback));
        assert_eq!(unsafe { target.call(&[]) }.unwrap(), DynValue::None);
    }

    #[test]
    fn test_unhook_all_restores_targets() {
        let hooks = HookManager::new();
        static CALLS: AtomicU64 = AtomicU64::new(0);
        let target = function(counted_target(&CALLS), "ll)l");
        target.add_post_hook(&hooks, |_| HookAction::Continue).unwrap();
        assert!(target.is_hooked(&hooks));
        hooks.unhook_all();
        assert!(!target.is_hooked(&hooks));
        assert_eq!(unsafe { target.call(&int_args(1, 0)) }.unwrap(), DynValue::Int(2));
    }
}
