//! Run-time type information of native objects
//!
//! Reads the compiler-generated type metadata reachable from an object's
//! vtable and expands it into a [`TypeInfo`] tree of base classes. Two
//! backends cover the two C++ ABIs the engine ships with:
//! - [`ItaniumRtti`]: GCC/Clang (`type_info` at `vtable[-1]`)
//! - [`MsvcRtti`]: MSVC (complete object locator at `vtable[-1]`)
//!
//! [`PlatformRtti`] is the backend matching the build target.

mod itanium;
mod msvc;

use std::fmt::{self, Write as _};

use sourcebind_memory::{MemoryError, Pointer};

pub use itanium::ItaniumRtti;
pub use msvc::MsvcRtti;

#[cfg(not(windows))]
pub type PlatformRtti = ItaniumRtti;
#[cfg(windows)]
pub type PlatformRtti = MsvcRtti;

/// Backend for the running process
pub fn platform() -> Result<PlatformRtti, RttiError> {
    #[cfg(windows)]
    {
        Ok(MsvcRtti::new())
    }
    #[cfg(not(windows))]
    {
        ItaniumRtti::from_process()
    }
}

/// Inheritance deeper than this is treated as corrupt metadata
pub(crate) const MAX_DEPTH: usize = 64;

/// Error type for RTTI lookups
#[derive(Debug, thiserror::Error)]
pub enum RttiError {
    #[error("Object pointer is null")]
    NullObject,

    #[error("Object at {0} has a null vtable")]
    NullVTable(Pointer),

    #[error("No type information for vtable {0}")]
    MissingTypeInfo(Pointer),

    #[error("Unrecognised type information layout at {0}")]
    UnknownLayout(Pointer),

    #[error("RTTI backend unavailable: {0}")]
    Unavailable(&'static str),

    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// One class in an inheritance tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeInfo {
    name: String,
    raw_name: String,
    offset: isize,
    is_virtual: bool,
    bases: Vec<TypeInfo>,
}

impl TypeInfo {
    pub fn new(raw_name: impl Into<String>, name: impl Into<String>, offset: isize) -> Self {
        Self {
            name: name.into(),
            raw_name: raw_name.into(),
            offset,
            is_virtual: false,
            bases: Vec::new(),
        }
    }

    pub(crate) fn with_bases(mut self, bases: Vec<TypeInfo>) -> Self {
        self.bases = bases;
        self
    }

    pub(crate) fn virtual_base(mut self, is_virtual: bool) -> Self {
        self.is_virtual = is_virtual;
        self
    }

    /// Demangled class name, e.g. `CTraceFilterSimple` or `ns::Class`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name as stored in the binary
    pub fn raw_name(&self) -> &str {
        &self.raw_name
    }

    /// Offset of this subobject inside the derived object
    ///
    /// For virtual bases this is where the ABI keeps the real offset
    /// (a vtable slot for Itanium, the displacement for MSVC).
    pub fn offset(&self) -> isize {
        self.offset
    }

    pub fn is_virtual(&self) -> bool {
        self.is_virtual
    }

    pub fn bases(&self) -> &[TypeInfo] {
        &self.bases
    }

    /// Depth-first search for a class named `class_name`, including self
    pub fn find(&self, class_name: &str) -> Option<&TypeInfo> {
        if self.name == class_name {
            return Some(self);
        }
        self.bases.iter().find_map(|base| base.find(class_name))
    }

    /// Whether this class is `class_name` or inherits from it
    pub fn is_derived_from(&self, class_name: &str) -> bool {
        self.find(class_name).is_some()
    }

    /// Indented tree of the hierarchy for diagnostics
    pub fn dump(&self) -> String {
        let mut out = String::new();
        self.dump_into(&mut out, 0);
        out
    }

    fn dump_into(&self, out: &mut String, depth: usize) {
        let _ = writeln!(
            out,
            "{:indent$}{} (offset {}{})",
            "",
            self.name,
            self.offset,
            if self.is_virtual { ", virtual" } else { "" },
            indent = depth * 2
        );
        for base in &self.bases {
            base.dump_into(out, depth + 1);
        }
    }
}

impl fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Reads type information for one C++ ABI
pub trait RttiBackend: Send + Sync {
    /// Type described by a vtable
    ///
    /// # Safety
    /// `vtable` must be the address point of a real vtable of this ABI.
    unsafe fn resolve_vtable(&self, vtable: Pointer) -> Result<TypeInfo, RttiError>;

    /// Dynamic type of the polymorphic object at `object`
    ///
    /// # Safety
    /// `object` must point to a live polymorphic object.
    unsafe fn resolve_type(&self, object: Pointer) -> Result<TypeInfo, RttiError> {
        if object.is_null() {
            return Err(RttiError::NullObject);
        }
        let vtable = object.get_pointer(0)?;
        if vtable.is_null() {
            return Err(RttiError::NullVTable(object));
        }
        self.resolve_vtable(vtable)
    }

    /// Whether the object at `object` is, or derives from, `class_name`
    ///
    /// # Safety
    /// Same contract as [`resolve_type`](Self::resolve_type).
    unsafe fn is_derived_from(&self, object: Pointer, class_name: &str) -> Result<bool, RttiError> {
        Ok(self.resolve_type(object)?.is_derived_from(class_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TypeInfo {
        TypeInfo::new("7Derived", "Derived", 0).with_bases(vec![
            TypeInfo::new("4Left", "Left", 0)
                .with_bases(vec![TypeInfo::new("4Root", "Root", 0).virtual_base(true)]),
            TypeInfo::new("5Right", "Right", 16),
        ])
    }

    #[test]
    fn test_is_derived_from_searches_depth_first() {
        let info = sample();
        assert!(info.is_derived_from("Derived"));
        assert!(info.is_derived_from("Root"));
        assert!(info.is_derived_from("Right"));
        assert!(!info.is_derived_from("Other"));
        assert_eq!(info.find("Right").map(TypeInfo::offset), Some(16));
        assert!(info.find("Root").is_some_and(TypeInfo::is_virtual));
    }

    #[test]
    fn test_dump() {
        let dump = sample().dump();
        assert_eq!(
            dump,
            "Derived (offset 0)\n  Left (offset 0)\n    Root (offset 0, virtual)\n  Right (offset 16)\n"
        );
    }

    #[test]
    fn test_null_object() {
        let backend = MsvcRtti::new();
        assert!(matches!(
            unsafe { backend.resolve_type(Pointer::NULL) },
            Err(RttiError::NullObject)
        ));

        let object = [0usize; 1];
        assert!(matches!(
            unsafe { backend.resolve_type(Pointer::from_ptr(object.as_ptr())) },
            Err(RttiError::NullVTable(_))
        ));
    }
}
