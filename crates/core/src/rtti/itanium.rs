//! Itanium C++ ABI type information (GCC, Clang)
//!
//! `vtable[-1]` points to a `std::type_info` subclass. Which subclass it is
//! (no bases, one public non-virtual base, or a base array) is told apart
//! by the `type_info` object's own vtable pointer.

use sourcebind_memory::Pointer;

use super::{RttiBackend, RttiError, TypeInfo, MAX_DEPTH};

const CLASS_TYPE_INFO: &str = "_ZTVN10__cxxabiv117__class_type_infoE";
const SI_CLASS_TYPE_INFO: &str = "_ZTVN10__cxxabiv120__si_class_type_infoE";
const VMI_CLASS_TYPE_INFO: &str = "_ZTVN10__cxxabiv121__vmi_class_type_infoE";

const WORD: isize = std::mem::size_of::<usize>() as isize;

/// `__base_class_type_info::__offset_flags` bits
const BASE_IS_VIRTUAL: i64 = 0x1;
const OFFSET_SHIFT: u32 = 8;

/// Itanium backend
///
/// Holds the address points of the three `__cxxabiv1` type_info vtables the
/// runtime library uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItaniumRtti {
    class: Pointer,
    single: Pointer,
    multiple: Pointer,
}

impl ItaniumRtti {
    /// Backend with explicit `__class_type_info`, `__si_class_type_info` and
    /// `__vmi_class_type_info` vtable address points
    pub fn new(class: Pointer, single: Pointer, multiple: Pointer) -> Self {
        Self {
            class,
            single,
            multiple,
        }
    }

    /// Look the type_info vtables up in the loaded C++ runtime
    #[cfg(unix)]
    pub fn from_process() -> Result<Self, RttiError> {
        fn address_point(symbol: &str) -> Result<Pointer, RttiError> {
            let name = std::ffi::CString::new(symbol)
                .map_err(|_| RttiError::Unavailable("invalid symbol name"))?;
            // SAFETY: dlsym with RTLD_DEFAULT only reads the loaded images
            let address = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) } as usize;
            if address == 0 {
                tracing::debug!("C++ runtime symbol {} not loaded", symbol);
                return Err(RttiError::Unavailable("C++ runtime type_info vtables not loaded"));
            }
            // Address point follows offset-to-top and the RTTI slot
            Ok(Pointer::new(address).offset(2 * WORD))
        }

        Ok(Self::new(
            address_point(CLASS_TYPE_INFO)?,
            address_point(SI_CLASS_TYPE_INFO)?,
            address_point(VMI_CLASS_TYPE_INFO)?,
        ))
    }

    #[cfg(not(unix))]
    pub fn from_process() -> Result<Self, RttiError> {
        Err(RttiError::Unavailable("Itanium RTTI needs a unix C++ runtime"))
    }

    unsafe fn walk(
        &self,
        type_info: Pointer,
        offset: isize,
        is_virtual: bool,
        depth: usize,
    ) -> Result<TypeInfo, RttiError> {
        if type_info.is_null() || depth > MAX_DEPTH {
            return Err(RttiError::UnknownLayout(type_info));
        }

        let kind = type_info.get_pointer(0)?;
        let raw_name = type_info
            .get_string_pointer(WORD)?
            .ok_or(RttiError::UnknownLayout(type_info))?;
        let name = demangle(&raw_name);

        let bases = if kind == self.class {
            Vec::new()
        } else if kind == self.single {
            let base = type_info.get_pointer(2 * WORD)?;
            vec![self.walk(base, 0, false, depth + 1)?]
        } else if kind == self.multiple {
            // u32 flags, u32 base count, then {type_info*, offset_flags} pairs
            let count = type_info.get::<u32>(2 * WORD + 4)?;
            let array = type_info.offset(3 * WORD);
            let mut bases = Vec::with_capacity(count as usize);
            for i in 0..count as isize {
                let entry = array.offset(i * 2 * WORD);
                let base = entry.get_pointer(0)?;
                let offset_flags = entry.get::<i64>(WORD)?;
                bases.push(self.walk(
                    base,
                    (offset_flags >> OFFSET_SHIFT) as isize,
                    offset_flags & BASE_IS_VIRTUAL != 0,
                    depth + 1,
                )?);
            }
            bases
        } else {
            tracing::debug!("type_info {} has unknown kind {}", type_info, kind);
            return Err(RttiError::UnknownLayout(type_info));
        };

        Ok(TypeInfo::new(raw_name, name, offset)
            .virtual_base(is_virtual)
            .with_bases(bases))
    }
}

impl RttiBackend for ItaniumRtti {
    unsafe fn resolve_vtable(&self, vtable: Pointer) -> Result<TypeInfo, RttiError> {
        let type_info = vtable.get_pointer(-WORD)?;
        if type_info.is_null() {
            return Err(RttiError::MissingTypeInfo(vtable));
        }
        self.walk(type_info, 0, false, 0)
    }
}

fn source_names(mut text: &str) -> Option<Vec<&str>> {
    let mut names = Vec::new();
    while !text.is_empty() {
        let digits = text.bytes().take_while(u8::is_ascii_digit).count();
        let len: usize = text.get(..digits)?.parse().ok()?;
        let name = text.get(digits..digits + len)?;
        names.push(name);
        text = &text[digits + len..];
    }
    Some(names)
}

/// Demangle an Itanium type name (`7CEntity`, `N6server7CPlayerE`, `St9exception`)
///
/// Names outside these forms are returned unchanged.
pub fn demangle(raw: &str) -> String {
    let text = raw.strip_prefix('*').unwrap_or(raw);
    let nested = text.strip_prefix('N').and_then(|t| t.strip_suffix('E'));
    let mut body = nested.unwrap_or(text);

    let mut prefix = "";
    if let Some(rest) = body.strip_prefix("St") {
        prefix = "std::";
        body = rest;
    }

    match source_names(body) {
        Some(names) if !names.is_empty() => format!("{}{}", prefix, names.join("::")),
        _ => raw.to_string(),
    }
}
