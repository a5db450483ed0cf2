//! Raw native memory handles
//!
//! [`Pointer`] is an unchecked address: every accessor is `unsafe` because
//! nothing here can know whether the memory behind it is mapped, large
//! enough, or still alive. The only validation performed is the null check.
//! Multiple `Pointer`s may alias the same memory freely.
//!
//! [`NativeBuffer`] is the opt-in owning counterpart: it allocates its own
//! memory, knows its size, and bounds-checks its accessors.

use std::alloc::Layout;
use std::cmp::Ordering;
use std::ffi::{c_char, CStr};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use crate::error::MemoryError;
use crate::scan;

mod sealed {
    pub trait Sealed {}
}

/// Plain numeric types that can be read from and written to raw memory
///
/// Every bit pattern of these types is valid, so unaligned reads of
/// arbitrary memory never produce an invalid value. `bool` is handled
/// separately by [`Pointer::get_bool`].
pub trait Primitive: sealed::Sealed + Copy + 'static {}

macro_rules! impl_primitive {
    ($($t:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $t {}
            impl Primitive for $t {}
        )*
    };
}

impl_primitive!(i8, u8, i16, u16, i32, u32, i64, u64, isize, usize, f32, f64);

/// Unchecked handle to native memory
///
/// Equality, ordering and arithmetic treat the handle as its integer
/// address.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pointer {
    address: usize,
}

impl Pointer {
    /// The null handle
    pub const NULL: Pointer = Pointer { address: 0 };

    pub const fn new(address: usize) -> Self {
        Self { address }
    }

    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self {
            address: ptr as usize,
        }
    }

    pub const fn address(self) -> usize {
        self.address
    }

    pub const fn is_null(self) -> bool {
        self.address == 0
    }

    pub const fn is_valid(self) -> bool {
        self.address != 0
    }

    pub fn as_ptr<T>(self) -> *const T {
        self.address as *const T
    }

    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.address as *mut T
    }

    /// New handle displaced by a signed byte offset
    pub const fn offset(self, offset: isize) -> Pointer {
        Pointer {
            address: self.address.wrapping_add_signed(offset),
        }
    }

    /// Fail with [`MemoryError::NullPointer`] if this handle is null
    pub fn validate(self) -> Result<(), MemoryError> {
        if self.is_null() {
            Err(MemoryError::NullPointer { offset: 0 })
        } else {
            Ok(())
        }
    }

    #[inline]
    fn at(self, offset: isize) -> Result<usize, MemoryError> {
        if self.is_null() {
            return Err(MemoryError::NullPointer { offset });
        }
        Ok(self.address.wrapping_add_signed(offset))
    }

    /// Read a primitive at `offset`
    ///
    /// # Safety
    /// `self + offset` must be readable for `size_of::<T>()` bytes.
    pub unsafe fn get<T: Primitive>(self, offset: isize) -> Result<T, MemoryError> {
        let address = self.at(offset)?;
        Ok(std::ptr::read_unaligned(address as *const T))
    }

    /// Write a primitive at `offset`
    ///
    /// # Safety
    /// `self + offset` must be writable for `size_of::<T>()` bytes.
    pub unsafe fn set<T: Primitive>(self, value: T, offset: isize) -> Result<(), MemoryError> {
        let address = self.at(offset)?;
        std::ptr::write_unaligned(address as *mut T, value);
        Ok(())
    }

    /// Read a C++ `bool` (any non-zero byte is `true`)
    ///
    /// # Safety
    /// `self + offset` must be readable.
    pub unsafe fn get_bool(self, offset: isize) -> Result<bool, MemoryError> {
        self.get::<u8>(offset).map(|b| b != 0)
    }

    /// # Safety
    /// `self + offset` must be writable.
    pub unsafe fn set_bool(self, value: bool, offset: isize) -> Result<(), MemoryError> {
        self.set::<u8>(value as u8, offset)
    }

    /// Dereference one level: read the address stored at `offset`
    ///
    /// # Safety
    /// `self + offset` must hold a pointer-sized value.
    pub unsafe fn get_pointer(self, offset: isize) -> Result<Pointer, MemoryError> {
        self.get::<usize>(offset).map(Pointer::new)
    }

    /// # Safety
    /// `self + offset` must be writable for a pointer-sized value.
    pub unsafe fn set_pointer(self, value: Pointer, offset: isize) -> Result<(), MemoryError> {
        self.set::<usize>(value.address, offset)
    }

    /// Borrow the NUL-terminated string stored inline at `offset`
    ///
    /// # Safety
    /// A NUL-terminated string must live at `self + offset` for `'a`.
    pub unsafe fn get_string_in_place<'a>(self, offset: isize) -> Result<&'a CStr, MemoryError> {
        let address = self.at(offset)?;
        Ok(CStr::from_ptr(address as *const c_char))
    }

    /// Copy the NUL-terminated string stored inline at `offset`
    ///
    /// # Safety
    /// A NUL-terminated string must live at `self + offset`.
    pub unsafe fn get_string_array(self, offset: isize) -> Result<String, MemoryError> {
        self.get_string_in_place(offset)
            .map(|s| s.to_string_lossy().into_owned())
    }

    /// Copy the string a `char*` at `offset` points to
    ///
    /// Returns `None` when the stored `char*` is null.
    ///
    /// # Safety
    /// `self + offset` must hold a `char*` that is null or NUL-terminated.
    pub unsafe fn get_string_pointer(self, offset: isize) -> Result<Option<String>, MemoryError> {
        let target = self.get_pointer(offset)?;
        if target.is_null() {
            return Ok(None);
        }
        target.get_string_array(0).map(Some)
    }

    /// Write `value` plus a terminating NUL inline at `offset`
    ///
    /// # Safety
    /// `self + offset` must be writable for `value.len() + 1` bytes.
    pub unsafe fn set_string_array(self, value: &str, offset: isize) -> Result<(), MemoryError> {
        if value.as_bytes().contains(&0) {
            return Err(MemoryError::InteriorNul);
        }
        let address = self.at(offset)?;
        let dst = address as *mut u8;
        std::ptr::copy_nonoverlapping(value.as_ptr(), dst, value.len());
        *dst.add(value.len()) = 0;
        Ok(())
    }

    /// Store a freshly allocated copy of `value` as a `char*` at `offset`
    ///
    /// The returned buffer does not free itself on drop: the native side
    /// now references it. Call [`NativeBuffer::set_auto_dealloc`] to take
    /// ownership back.
    ///
    /// # Safety
    /// `self + offset` must be writable for a pointer-sized value.
    pub unsafe fn set_string_pointer(
        self,
        value: &str,
        offset: isize,
    ) -> Result<NativeBuffer, MemoryError> {
        self.validate()?;
        if value.as_bytes().contains(&0) {
            return Err(MemoryError::InteriorNul);
        }
        let mut bytes = Vec::with_capacity(value.len() + 1);
        bytes.extend_from_slice(value.as_bytes());
        bytes.push(0);
        let buffer = NativeBuffer::from_bytes(&bytes, false)?;
        self.set_pointer(buffer.pointer(), offset)?;
        Ok(buffer)
    }

    /// Read slot `index` of this object's virtual table
    ///
    /// Returns a null handle when the object's vtable pointer is null. The
    /// index is not range-checked.
    ///
    /// # Safety
    /// `self` must point to an object whose first field is a vtable pointer,
    /// and `index` must be inside that vtable.
    pub unsafe fn get_virtual_function(self, index: usize) -> Result<Pointer, MemoryError> {
        let vtable = self.get_pointer(0)?;
        if vtable.is_null() {
            return Ok(Pointer::NULL);
        }
        vtable.get_pointer((index * std::mem::size_of::<usize>()) as isize)
    }

    /// Search `search_length` bytes from this address for `pattern`
    ///
    /// Uses the same wildcard rules as the image scanner.
    ///
    /// # Safety
    /// `[self, self + search_length)` must be readable.
    pub unsafe fn search_bytes(
        self,
        pattern: &[u8],
        search_length: usize,
    ) -> Result<Option<Pointer>, MemoryError> {
        self.validate()?;
        if pattern.is_empty() {
            return Err(MemoryError::ZeroLength("search pattern"));
        }
        Ok(scan::scan(self.as_ptr(), search_length, pattern).map(Pointer::from_ptr))
    }

    /// Whether `[self, self + count)` and `[destination, destination + count)` intersect
    pub fn is_overlapping(self, destination: Pointer, count: usize) -> bool {
        count != 0
            && self.address < destination.address.saturating_add(count)
            && destination.address < self.address.saturating_add(count)
    }

    fn check_transfer(self, destination: Pointer, count: usize) -> Result<(), MemoryError> {
        self.validate()?;
        destination.validate()?;
        if count == 0 {
            return Err(MemoryError::ZeroLength("copy"));
        }
        Ok(())
    }

    /// Copy `count` bytes to `destination` (`memcpy`)
    ///
    /// Fails with [`MemoryError::Overlap`] if the ranges intersect.
    ///
    /// # Safety
    /// Both ranges must be valid for `count` bytes.
    pub unsafe fn copy_to(self, destination: Pointer, count: usize) -> Result<(), MemoryError> {
        self.check_transfer(destination, count)?;
        if self.is_overlapping(destination, count) {
            return Err(MemoryError::Overlap {
                origin: self.address,
                destination: destination.address,
                count,
            });
        }
        std::ptr::copy_nonoverlapping(self.as_ptr::<u8>(), destination.as_mut_ptr::<u8>(), count);
        Ok(())
    }

    /// Move `count` bytes to `destination` (`memmove`)
    ///
    /// # Safety
    /// Both ranges must be valid for `count` bytes.
    pub unsafe fn move_to(self, destination: Pointer, count: usize) -> Result<(), MemoryError> {
        self.check_transfer(destination, count)?;
        std::ptr::copy(self.as_ptr::<u8>(), destination.as_mut_ptr::<u8>(), count);
        Ok(())
    }

    /// Lexicographically compare `count` bytes (`memcmp`)
    ///
    /// # Safety
    /// Both ranges must be readable for `count` bytes.
    pub unsafe fn compare(self, other: Pointer, count: usize) -> Result<Ordering, MemoryError> {
        let lhs = self.as_slice(count)?;
        let rhs = other.as_slice(count)?;
        Ok(lhs.cmp(rhs))
    }

    /// Borrow `len` bytes starting at this address
    ///
    /// # Safety
    /// The range must be readable and stay unmodified for `'a`.
    pub unsafe fn as_slice<'a>(self, len: usize) -> Result<&'a [u8], MemoryError> {
        self.validate()?;
        Ok(std::slice::from_raw_parts(self.as_ptr(), len))
    }

    /// Copy `len` bytes out of native memory
    ///
    /// # Safety
    /// The range must be readable.
    pub unsafe fn read_bytes(self, len: usize) -> Result<Vec<u8>, MemoryError> {
        self.as_slice(len).map(<[u8]>::to_vec)
    }

    /// Overwrite bytes at `offset`
    ///
    /// # Safety
    /// The range must be writable.
    pub unsafe fn write_bytes(self, bytes: &[u8], offset: isize) -> Result<(), MemoryError> {
        let address = self.at(offset)?;
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), address as *mut u8, bytes.len());
        Ok(())
    }
}

impl fmt::Debug for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pointer({:#x})", self.address)
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.address)
    }
}

impl fmt::LowerHex for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.address, f)
    }
}

impl From<usize> for Pointer {
    fn from(address: usize) -> Self {
        Pointer::new(address)
    }
}

impl From<Pointer> for usize {
    fn from(pointer: Pointer) -> Self {
        pointer.address
    }
}

impl<T> From<*const T> for Pointer {
    fn from(ptr: *const T) -> Self {
        Pointer::from_ptr(ptr)
    }
}

impl<T> From<*mut T> for Pointer {
    fn from(ptr: *mut T) -> Self {
        Pointer::from_ptr(ptr as *const T)
    }
}

impl Add<usize> for Pointer {
    type Output = Pointer;

    fn add(self, rhs: usize) -> Pointer {
        Pointer::new(self.address.wrapping_add(rhs))
    }
}

impl Sub<usize> for Pointer {
    type Output = Pointer;

    fn sub(self, rhs: usize) -> Pointer {
        Pointer::new(self.address.wrapping_sub(rhs))
    }
}

impl Sub<Pointer> for Pointer {
    type Output = isize;

    fn sub(self, rhs: Pointer) -> isize {
        self.address.wrapping_sub(rhs.address) as isize
    }
}

impl AddAssign<usize> for Pointer {
    fn add_assign(&mut self, rhs: usize) {
        self.address = self.address.wrapping_add(rhs);
    }
}

impl SubAssign<usize> for Pointer {
    fn sub_assign(&mut self, rhs: usize) {
        self.address = self.address.wrapping_sub(rhs);
    }
}

const BUFFER_ALIGN: usize = 16;

/// Owned, bounds-checked native allocation
///
/// With `auto_dealloc` set the memory is freed when the buffer drops;
/// without it the allocation outlives the buffer, for memory handed over
/// to native code.
pub struct NativeBuffer {
    pointer: Pointer,
    size: usize,
    auto_dealloc: bool,
}

impl NativeBuffer {
    /// Allocate `size` zeroed bytes
    pub fn alloc(size: usize, auto_dealloc: bool) -> Result<Self, MemoryError> {
        let layout = Self::layout(size)?;
        // SAFETY: layout has non-zero size
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(MemoryError::Allocation(size));
        }
        Ok(Self {
            pointer: Pointer::from_ptr(ptr),
            size,
            auto_dealloc,
        })
    }

    /// Allocate a buffer holding a copy of `bytes`
    pub fn from_bytes(bytes: &[u8], auto_dealloc: bool) -> Result<Self, MemoryError> {
        let mut buffer = Self::alloc(bytes.len(), auto_dealloc)?;
        buffer.as_mut_slice().copy_from_slice(bytes);
        Ok(buffer)
    }

    /// Reclaim memory previously given away with [`NativeBuffer::release`]
    ///
    /// # Safety
    /// `pointer` must come from `release` on a buffer of exactly `size` bytes
    /// and must not have been reclaimed already.
    pub unsafe fn from_raw(pointer: Pointer, size: usize, auto_dealloc: bool) -> Self {
        Self {
            pointer,
            size,
            auto_dealloc,
        }
    }

    fn layout(size: usize) -> Result<Layout, MemoryError> {
        if size == 0 {
            return Err(MemoryError::ZeroLength("allocation"));
        }
        Layout::from_size_align(size, BUFFER_ALIGN).map_err(|_| MemoryError::Allocation(size))
    }

    pub fn pointer(&self) -> Pointer {
        self.pointer
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn auto_dealloc(&self) -> bool {
        self.auto_dealloc
    }

    pub fn set_auto_dealloc(&mut self, auto_dealloc: bool) {
        self.auto_dealloc = auto_dealloc;
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: we own `size` initialized bytes
        unsafe { std::slice::from_raw_parts(self.pointer.as_ptr(), self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: we own `size` initialized bytes
        unsafe { std::slice::from_raw_parts_mut(self.pointer.as_mut_ptr(), self.size) }
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), MemoryError> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(MemoryError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    /// Bounds-checked read
    pub fn read<T: Primitive>(&self, offset: usize) -> Result<T, MemoryError> {
        self.check(offset, std::mem::size_of::<T>())?;
        // SAFETY: range checked against our allocation
        unsafe { self.pointer.get(offset as isize) }
    }

    /// Bounds-checked write
    pub fn write<T: Primitive>(&mut self, value: T, offset: usize) -> Result<(), MemoryError> {
        self.check(offset, std::mem::size_of::<T>())?;
        // SAFETY: range checked against our allocation
        unsafe { self.pointer.set(value, offset as isize) }
    }

    /// Give the allocation away without freeing it
    pub fn release(self) -> Pointer {
        let pointer = self.pointer;
        std::mem::forget(self);
        pointer
    }
}

impl Drop for NativeBuffer {
    fn drop(&mut self) {
        if !self.auto_dealloc {
            return;
        }
        if let Ok(layout) = Self::layout(self.size) {
            // SAFETY: allocated in `alloc` with this exact layout
            unsafe { std::alloc::dealloc(self.pointer.as_mut_ptr(), layout) };
        }
    }
}

impl fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("pointer", &self.pointer)
            .field("size", &self.size)
            .field("auto_dealloc", &self.auto_dealloc)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_primitives() {
        let mut storage = [0u8; 32];
        let ptr = Pointer::from_ptr(storage.as_mut_ptr());

        unsafe {
            ptr.set::<i32>(-41, 4).unwrap();
            ptr.set::<f64>(2.5, 8).unwrap();
            ptr.set_bool(true, 16).unwrap();

            assert_eq!(ptr.get::<i32>(4).unwrap(), -41);
            assert_eq!(ptr.get::<f64>(8).unwrap(), 2.5);
            assert!(ptr.get_bool(16).unwrap());
            // unaligned access
            ptr.set::<u32>(0xDEADBEEF, 1).unwrap();
            assert_eq!(ptr.get::<u32>(1).unwrap(), 0xDEADBEEF);
        }
    }

    #[test]
    fn test_null_access_fails() {
        unsafe {
            assert!(matches!(
                Pointer::NULL.get::<u32>(8),
                Err(MemoryError::NullPointer { offset: 8 })
            ));
            assert!(Pointer::NULL.set::<u8>(1, 0).is_err());
            assert!(Pointer::NULL.get_virtual_function(0).is_err());
        }
    }

    #[test]
    fn test_virtual_function() {
        let vtable: [usize; 3] = [0x1000, 0x2000, 0x3000];
        let object: [usize; 1] = [vtable.as_ptr() as usize];
        let ptr = Pointer::from_ptr(object.as_ptr());

        unsafe {
            assert_eq!(ptr.get_virtual_function(2).unwrap(), Pointer::new(0x3000));
        }

        let empty: [usize; 1] = [0];
        let ptr = Pointer::from_ptr(empty.as_ptr());
        unsafe {
            assert!(ptr.get_virtual_function(5).unwrap().is_null());
        }
    }

    #[test]
    fn test_strings() {
        let mut storage = [0u8; 64];
        let ptr = Pointer::from_ptr(storage.as_mut_ptr());

        unsafe {
            ptr.set_string_array("weapon_ak47", 0).unwrap();
            assert_eq!(ptr.get_string_array(0).unwrap(), "weapon_ak47");
            assert_eq!(ptr.get_string_in_place(7).unwrap().to_bytes(), b"ak47");

            let owned = ptr.set_string_pointer("models/player.mdl", 32).unwrap();
            assert!(!owned.auto_dealloc());
            assert_eq!(
                ptr.get_string_pointer(32).unwrap().as_deref(),
                Some("models/player.mdl")
            );

            ptr.set_pointer(Pointer::NULL, 32).unwrap();
            assert_eq!(ptr.get_string_pointer(32).unwrap(), None);

            assert!(matches!(
                ptr.set_string_array("a\0b", 0),
                Err(MemoryError::InteriorNul)
            ));

            drop(NativeBuffer::from_raw(owned.release(), 18, true));
        }
    }

    #[test]
    fn test_copy_rejects_overlap() {
        let mut storage: Vec<u8> = (0..16).collect();
        let base = Pointer::from_ptr(storage.as_mut_ptr());

        unsafe {
            let result = base.copy_to(base + 4, 8);
            assert!(matches!(result, Err(MemoryError::Overlap { count: 8, .. })));

            base.move_to(base + 4, 8).unwrap();
        }

        let mut expected: Vec<u8> = (0..16).collect();
        expected.copy_within(0..8, 4);
        assert_eq!(storage, expected);
    }

    #[test]
    fn test_copy_disjoint() {
        let source = [1u8, 2, 3, 4];
        let mut dest = [0u8; 4];
        unsafe {
            Pointer::from_ptr(source.as_ptr())
                .copy_to(Pointer::from_ptr(dest.as_mut_ptr()), 4)
                .unwrap();
            assert!(Pointer::from_ptr(source.as_ptr())
                .copy_to(Pointer::from_ptr(dest.as_mut_ptr()), 0)
                .is_err());
        }
        assert_eq!(dest, source);
    }

    #[test]
    fn test_search_bytes() {
        let data = [0x90u8, 0x90, 0x41, 0x13, 0x43, 0x90];
        let ptr = Pointer::from_ptr(data.as_ptr());

        unsafe {
            let found = ptr.search_bytes(&[0x41, scan::WILDCARD, 0x43], data.len()).unwrap();
            assert_eq!(found, Some(ptr + 2));
            // bounded by search_length
            assert_eq!(ptr.search_bytes(&[0x41], 2).unwrap(), None);
        }
    }

    #[test]
    fn test_arithmetic_and_ordering() {
        let a = Pointer::new(0x1000);
        let b = a + 0x20;
        assert_eq!(b.address(), 0x1020);
        assert_eq!(b - a, 0x20);
        assert_eq!(a - b, -0x20);
        assert_eq!((b - 0x10).address(), 0x1010);
        assert_eq!(a.offset(-0x10).address(), 0xFF0);
        assert!(a < b);
        assert_eq!(format!("{}", a), "0x1000");
    }

    #[test]
    fn test_compare() {
        let a = [1u8, 2, 3];
        let b = [1u8, 2, 4];
        unsafe {
            let ord = Pointer::from_ptr(a.as_ptr())
                .compare(Pointer::from_ptr(b.as_ptr()), 3)
                .unwrap();
            assert_eq!(ord, Ordering::Less);
        }
    }

    #[test]
    fn test_native_buffer_bounds() {
        let mut buffer = NativeBuffer::alloc(8, true).unwrap();
        buffer.write::<u32>(7, 4).unwrap();
        assert_eq!(buffer.read::<u32>(4).unwrap(), 7);
        assert!(matches!(
            buffer.read::<u64>(4),
            Err(MemoryError::OutOfBounds { offset: 4, len: 8, size: 8 })
        ));
        assert!(matches!(
            NativeBuffer::alloc(0, true),
            Err(MemoryError::ZeroLength(_))
        ));
    }
}
