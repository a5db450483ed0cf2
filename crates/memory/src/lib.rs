//! sourcebind memory - Raw Native Memory and Address Resolution
//!
//! This crate handles:
//! - Unchecked native memory handles ([`Pointer`]) and the owning,
//!   bounds-checked [`NativeBuffer`]
//! - Byte-pattern scanning with `0x2A` wildcards
//! - Loading binary images through the OS loader and resolving symbols and
//!   signatures inside them
//!
//! # Architecture
//!
//! Images are loaded once through a [`BinaryImageRegistry`] keyed by
//! canonical path. Each [`BinaryImage`] caches the signatures it has
//! resolved. Lookup misses yield a null [`Pointer`]; malformed requests,
//! ambiguous hook recovery and loader failures are [`ResolveError`]s.

pub mod error;
pub mod image;
pub mod loader;
pub mod pointer;
pub mod registry;
pub mod scan;

pub use error::{MemoryError, ResolveError};
pub use image::{BinaryImage, Identifier};
pub use pointer::{NativeBuffer, Pointer, Primitive};
pub use registry::{candidate_paths, BinaryImageRegistry};
pub use scan::{format_pattern, parse_pattern, WILDCARD};
