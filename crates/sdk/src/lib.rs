//! sourcebind SDK - Native ABI Type Definitions
//!
//! This crate contains the vocabulary shared by every other crate: the
//! compact signature alphabet used to describe native functions, calling
//! conventions, hook phases and engine-wide limits. It has no dependencies
//! and compiles quickly, allowing parallel compilation of dependent crates.
//!
//! # Modules
//!
//! - [`signature`] - One-character type tags and function signatures
//! - [`convention`] - Calling conventions and hook phases
//! - [`limits`] - Entity index limits and contents masks

pub mod convention;
pub mod limits;
pub mod signature;

pub use convention::{CallingConvention, Phase};
pub use limits::*;
pub use signature::{FunctionSignature, SignatureError, TypeTag, RETURN_SEPARATOR};
