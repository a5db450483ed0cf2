//! sourcebind core - Native Hooking, Dynamic Calls and Rule Managers
//!
//! This crate contains:
//! - The dynamic call engine ([`CallableFunction`]) and the detour/hook
//!   manager ([`HookManager`]) built on generated x86-64 stubs
//! - RTTI walking of native objects ([`rtti`])
//! - Rule-based collision and transmit filtering on top of engine hooks
//! - Gamedata and TOML configuration
//! - [`NativeRuntimeContext`], the owner of all of the above
//!
//! # Re-exports
//!
//! This crate re-exports the SDK and memory crates for convenience:
//! - [`sdk`] - Signature alphabet, calling conventions and engine limits
//! - [`memory`] - Native pointers and binary image resolution

use tracing::info;

pub use sourcebind_memory as memory;
pub use sourcebind_sdk as sdk;

pub mod call;
pub mod codegen;
pub mod collisions;
pub mod config;
pub mod context;
pub mod entities;
pub mod gamedata;
pub mod hooks;
pub mod registry;
pub mod rtti;
pub mod rules;
pub mod transmit;

// Re-export commonly used items
pub use call::{CallError, CallableFunction, DynValue};
pub use hooks::{HookAction, HookContext, HookError, HookHandle, HookManager, Registers};
pub use registry::Registration;
pub use rules::RuleMode;

pub use collisions::{
    CollisionManager, CollisionMap, CollisionPairs, CollisionQuery, CollisionRules, CollisionSet,
};
pub use transmit::{
    TransmitManager, TransmitMap, TransmitPairs, TransmitQuery, TransmitRules, TransmitSet,
};

pub use entities::{EntityBridge, EpochCache};
pub use rtti::{PlatformRtti, RttiBackend, RttiError, TypeInfo};

pub use config::{ConfigError, ConfigResult, CoreConfig};
pub use context::{init_runtime, runtime, NativeRuntimeContext};
pub use gamedata::{Gamedata, GamedataError};

/// Shutdown the shared runtime
///
/// Called from the FFI layer when the host unloads the plugin.
pub fn shutdown() {
    info!("sourcebind shutting down...");
    if let Some(context) = runtime() {
        context.shutdown();
    }
}
