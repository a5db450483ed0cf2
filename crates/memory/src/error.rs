//! Error types for memory access and address resolution

use std::path::PathBuf;

/// Error type for raw memory operations
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Attempted to dereference address zero
    #[error("Null pointer access at offset {offset:#x}")]
    NullPointer { offset: isize },

    /// A length of zero was supplied where bytes are required
    #[error("Zero-length {0}")]
    ZeroLength(&'static str),

    /// Source and destination ranges of a copy overlap
    #[error("Cannot copy overlapping ranges {origin:#x} -> {destination:#x} ({count} bytes), use move_to")]
    Overlap {
        origin: usize,
        destination: usize,
        count: usize,
    },

    /// Bounds-checked access outside an owned buffer
    #[error("Access of {len} bytes at offset {offset} exceeds buffer of {size} bytes")]
    OutOfBounds {
        offset: usize,
        len: usize,
        size: usize,
    },

    /// Native allocation failed
    #[error("Failed to allocate {0} bytes")]
    Allocation(usize),

    /// String contains an interior NUL and cannot be written as a C string
    #[error("String contains an interior NUL byte")]
    InteriorNul,
}

/// Error type for binary image loading and identifier resolution
#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// The OS loader could not resolve the image
    #[error("Unable to load binary image '{}': {reason}", path.display())]
    Io { path: PathBuf, reason: String },

    /// Hooked-signature recovery found more than one candidate
    #[error("Signature is ambiguous after hook recovery: {pattern}")]
    AmbiguousSignature { pattern: String },

    /// Signature text could not be parsed
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// On-disk image could not be parsed for its symbol table
    #[error("Failed to parse image '{}': {reason}", path.display())]
    ImageParse { path: PathBuf, reason: String },

    /// Error from a memory operation during scanning
    #[error(transparent)]
    Memory(#[from] MemoryError),
}
