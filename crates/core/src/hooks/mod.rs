//! Hook system
//!
//! Detours arbitrary native functions described by a
//! [`CallableFunction`](crate::call::CallableFunction):
//! - Pre callbacks run before the original and may change its arguments or
//!   skip it with a return value
//! - Post callbacks run after it and may replace the return value
//! - The original stays reachable through the hook's trampoline
//!
//! Callbacks run inline on the calling thread. Panics are caught and logged
//! at the native boundary.

mod callback;
mod detour;
mod manager;
mod registers;
mod stubs;

pub use callback::{CallbackKey, HookAction, HookCallback, HookContext, HookHandle};
pub use detour::HookError;
pub use manager::{Hook, HookManager};
pub use registers::{Registers, Xmm};
