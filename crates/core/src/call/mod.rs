//! Dynamic call engine
//!
//! Calls native functions whose signatures are only known at runtime.
//! A [`CallableFunction`] pairs an address with a parsed
//! [`FunctionSignature`](sourcebind_sdk::FunctionSignature); each call
//! converts [`DynValue`] arguments to raw register and stack words, runs
//! them through a generated thunk, and decodes the return registers.

mod function;
mod layout;
mod thunk;
mod value;

pub use function::{CallError, CallableFunction, FunctionPointer};
pub use layout::{ArgLocation, ArgumentLayout};
pub use value::DynValue;
