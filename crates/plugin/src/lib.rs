//! sourcebind Plugin - FFI Layer
//!
//! This crate provides the C ABI boundary between the host binding layer
//! and the Rust core. It compiles to a cdylib (.so/.dll); `build.rs`
//! writes the matching header to `include/sourcebind.h`.

pub mod ffi;

pub use sourcebind_core::shutdown;
