//! C ABI exports and the host-supplied entity bridge

mod bridge;
mod exports;

pub use bridge::{FfiEntityBridge, SourcebindEntityBridge};
pub use exports::*;
