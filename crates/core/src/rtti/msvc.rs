//! MSVC type information
//!
//! `vtable[-1]` points to the complete object locator. On x64 every
//! reference inside the RTTI structures is an image-relative offset; the
//! locator carries its own offset so the image base can be recovered
//! without asking the loader.

use sourcebind_memory::Pointer;

use super::{RttiBackend, RttiError, TypeInfo, MAX_DEPTH};

/// Locator signature of image-relative (x64) RTTI
const SIGNATURE_RELATIVE: u32 = 1;

/// Offset of the decorated name in a TypeDescriptor
const DESCRIPTOR_NAME: isize = 16;

/// Upper bound on a hierarchy descriptor's base count
const MAX_BASES: u32 = 4096;

mod locator {
    pub const SIGNATURE: isize = 0;
    pub const TYPE_DESCRIPTOR: isize = 12;
    pub const HIERARCHY: isize = 16;
    pub const SELF: isize = 20;
}

mod hierarchy {
    pub const NUM_BASES: isize = 8;
    pub const BASE_ARRAY: isize = 12;
}

mod base {
    pub const TYPE_DESCRIPTOR: isize = 0;
    pub const NUM_CONTAINED: isize = 4;
    pub const MDISP: isize = 8;
    pub const PDISP: isize = 12;
    pub const VDISP: isize = 16;
}

/// MSVC backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsvcRtti;

impl MsvcRtti {
    pub fn new() -> Self {
        Self
    }
}

/// One resolved locator: the image base and the hierarchy to expand
struct Locator {
    image: Pointer,
    type_descriptor: Pointer,
    hierarchy: Pointer,
}

impl Locator {
    unsafe fn read(col: Pointer) -> Result<Self, RttiError> {
        let signature = col.get::<u32>(locator::SIGNATURE)?;
        if signature != SIGNATURE_RELATIVE {
            return Err(RttiError::UnknownLayout(col));
        }
        let self_rva = col.get::<u32>(locator::SELF)?;
        let image = Pointer::new(col.address().wrapping_sub(self_rva as usize));

        Ok(Self {
            image,
            type_descriptor: rva(image, col.get::<u32>(locator::TYPE_DESCRIPTOR)?),
            hierarchy: rva(image, col.get::<u32>(locator::HIERARCHY)?),
        })
    }
}

fn rva(image: Pointer, offset: u32) -> Pointer {
    image.offset(offset as isize)
}

unsafe fn descriptor_name(descriptor: Pointer) -> Result<String, RttiError> {
    if descriptor.is_null() {
        return Err(RttiError::UnknownLayout(descriptor));
    }
    Ok(descriptor
        .get_string_in_place(DESCRIPTOR_NAME)?
        .to_string_lossy()
        .into_owned())
}

/// Base class descriptors read from the flattened array
struct BaseEntry {
    raw_name: String,
    contained: usize,
    offset: isize,
    is_virtual: bool,
}

impl BaseEntry {
    unsafe fn read(image: Pointer, descriptor: Pointer) -> Result<Self, RttiError> {
        let type_descriptor = rva(image, descriptor.get::<u32>(base::TYPE_DESCRIPTOR)?);
        let pdisp = descriptor.get::<i32>(base::PDISP)?;
        let is_virtual = pdisp != -1;
        let offset = if is_virtual {
            descriptor.get::<i32>(base::VDISP)?
        } else {
            descriptor.get::<i32>(base::MDISP)?
        };

        Ok(Self {
            raw_name: descriptor_name(type_descriptor)?,
            contained: descriptor.get::<u32>(base::NUM_CONTAINED)? as usize,
            offset: offset as isize,
            is_virtual,
        })
    }
}

/// Rebuild the tree from the pre-order base array
///
/// Every entry is followed by the `contained` entries of its own bases.
fn build_tree(entries: &[BaseEntry], index: usize, depth: usize) -> Option<(TypeInfo, usize)> {
    if depth > MAX_DEPTH {
        return None;
    }
    let entry = entries.get(index)?;
    let end = index + 1 + entry.contained;
    if end > entries.len() {
        return None;
    }

    let mut bases = Vec::new();
    let mut next = index + 1;
    while next < end {
        let (base, after) = build_tree(entries, next, depth + 1)?;
        bases.push(base);
        next = after;
    }

    let info = TypeInfo::new(entry.raw_name.clone(), demangle(&entry.raw_name), entry.offset)
        .virtual_base(entry.is_virtual)
        .with_bases(bases);
    Some((info, end))
}

impl RttiBackend for MsvcRtti {
    unsafe fn resolve_vtable(&self, vtable: Pointer) -> Result<TypeInfo, RttiError> {
        let col = vtable.get_pointer(-(std::mem::size_of::<usize>() as isize))?;
        if col.is_null() {
            return Err(RttiError::MissingTypeInfo(vtable));
        }
        let locator = Locator::read(col)?;

        let count = locator.hierarchy.get::<u32>(hierarchy::NUM_BASES)?;
        if count == 0 || count > MAX_BASES {
            return Err(RttiError::UnknownLayout(locator.hierarchy));
        }
        let array = rva(
            locator.image,
            locator.hierarchy.get::<u32>(hierarchy::BASE_ARRAY)?,
        );

        let mut entries = Vec::with_capacity(count as usize);
        for i in 0..count as isize {
            let descriptor = rva(locator.image, array.get::<u32>(i * 4)?);
            entries.push(BaseEntry::read(locator.image, descriptor)?);
        }

        // The first entry describes the complete object itself
        let (info, _) =
            build_tree(&entries, 0, 0).ok_or(RttiError::UnknownLayout(locator.hierarchy))?;
        if info.raw_name() != descriptor_name(locator.type_descriptor)? {
            tracing::debug!(
                "locator {} names {} but its hierarchy starts at {}",
                col,
                descriptor_name(locator.type_descriptor)?,
                info.raw_name()
            );
        }
        Ok(info)
    }
}

/// Demangle an MSVC type descriptor name (`.?AVCEntity@@`, `.?AUPlayer@server@@`)
///
/// Templates and other encodings are returned unchanged.
pub fn demangle(raw: &str) -> String {
    let body = raw
        .strip_prefix(".?AV")
        .or_else(|| raw.strip_prefix(".?AU"))
        .and_then(|name| name.strip_suffix("@@"));

    match body {
        Some(body) if !body.is_empty() && !body.contains(['?', '$']) => {
            let mut parts: Vec<&str> = body.split('@').collect();
            parts.reverse();
            parts.join("::")
        }
        _ => raw.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Byte image holding RTTI structures at fixed offsets
    struct Image {
        bytes: Vec<u64>,
    }

    impl Image {
        fn new() -> Self {
            Self {
                bytes: vec![0; 256],
            }
        }

        fn base(&self) -> usize {
            self.bytes.as_ptr() as usize
        }

        fn raw(&mut self) -> *mut u8 {
            self.bytes.as_mut_ptr() as *mut u8
        }

        fn put_u32(&mut self, offset: usize, value: u32) {
            unsafe { (self.raw().add(offset) as *mut u32).write_unaligned(value) }
        }

        fn put_u64(&mut self, offset: usize, value: u64) {
            unsafe { (self.raw().add(offset) as *mut u64).write_unaligned(value) }
        }

        fn put_name(&mut self, offset: usize, name: &str) {
            for (i, byte) in name.bytes().chain(std::iter::once(0)).enumerate() {
                unsafe { self.raw().add(offset + i).write(byte) }
            }
        }

        /// TypeDescriptor at `offset`
        fn descriptor(&mut self, offset: usize, name: &str) {
            self.put_name(offset + DESCRIPTOR_NAME as usize, name);
        }

        /// BaseClassDescriptor at `offset`
        fn base_class(&mut self, offset: usize, td: u32, contained: u32, mdisp: i32, pdisp: i32) {
            self.put_u32(offset, td);
            self.put_u32(offset + 4, contained);
            self.put_u32(offset + 8, mdisp as u32);
            self.put_u32(offset + 12, pdisp as u32);
            self.put_u32(offset + 16, 8);
        }
    }

    // Derived : Left(: Root), virtual Shared
    fn sample() -> Image {
        let mut image = Image::new();
        image.descriptor(0x000, ".?AVDerived@@");
        image.descriptor(0x040, ".?AVLeft@@");
        image.descriptor(0x080, ".?AVRoot@@");
        image.descriptor(0x0C0, ".?AUShared@ns@@");

        image.base_class(0x100, 0x000, 3, 0, -1);
        image.base_class(0x120, 0x040, 1, 0, -1);
        image.base_class(0x140, 0x080, 0, 0, -1);
        image.base_class(0x160, 0x0C0, 0, 0, 0);

        // base class array
        for (i, bcd) in [0x100u32, 0x120, 0x140, 0x160].iter().enumerate() {
            image.put_u32(0x180 + i * 4, *bcd);
        }

        // class hierarchy descriptor
        image.put_u32(0x1A0 + 8, 4);
        image.put_u32(0x1A0 + 12, 0x180);

        // complete object locator
        image.put_u32(0x1C0, SIGNATURE_RELATIVE);
        image.put_u32(0x1C0 + 12, 0x000);
        image.put_u32(0x1C0 + 16, 0x1A0);
        image.put_u32(0x1C0 + 20, 0x1C0);

        // vtable: locator pointer, then the address point
        let col = image.base() as u64 + 0x1C0;
        image.put_u64(0x1E0, col);
        image.put_u64(0x1E8, 0xDEAD);
        image
    }

    #[test]
    fn test_demangle() {
        assert_eq!(demangle(".?AVCBaseEntity@@"), "CBaseEntity");
        assert_eq!(demangle(".?AUPlayer@server@@"), "server::Player");
        assert_eq!(demangle(".?AVInner@Outer@ns@@"), "ns::Outer::Inner");
        assert_eq!(demangle(".?AV?$CUtlVector@H@@"), ".?AV?$CUtlVector@H@@");
        assert_eq!(demangle("plain"), "plain");
    }

    #[test]
    fn test_walk_hierarchy() {
        let image = sample();
        let vtable = Pointer::new(image.base() + 0x1E8);

        let info = unsafe { MsvcRtti::new().resolve_vtable(vtable) }.unwrap();
        assert_eq!(info.name(), "Derived");
        assert_eq!(info.bases().len(), 2);
        assert_eq!(info.bases()[0].name(), "Left");
        assert_eq!(info.bases()[0].bases()[0].name(), "Root");

        let shared = info.find("ns::Shared").unwrap();
        assert!(shared.is_virtual());
        assert_eq!(shared.offset(), 8);
        assert!(info.is_derived_from("Root"));
        assert!(!info.is_derived_from("CTraceFilterSimple"));
    }

    #[test]
    fn test_object_lookup() {
        let image = sample();
        let object = [image.base() + 0x1E8];
        let backend = MsvcRtti::new();
        assert!(unsafe { backend.is_derived_from(Pointer::from_ptr(object.as_ptr()), "Left") }
            .unwrap());
    }

    #[test]
    fn test_rejects_absolute_locators() {
        let mut image = sample();
        image.put_u32(0x1C0, 0);
        let vtable = Pointer::new(image.base() + 0x1E8);
        assert!(matches!(
            unsafe { MsvcRtti::new().resolve_vtable(vtable) },
            Err(RttiError::UnknownLayout(_))
        ));
    }

    #[test]
    fn test_truncated_hierarchy() {
        let mut image = sample();
        // Derived claims more contained bases than the array holds
        image.put_u32(0x100 + 4, 7);
        let vtable = Pointer::new(image.base() + 0x1E8);
        assert!(matches!(
            unsafe { MsvcRtti::new().resolve_vtable(vtable) },
            Err(RttiError::UnknownLayout(_))
        ));
    }
}
