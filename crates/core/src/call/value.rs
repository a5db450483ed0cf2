//! Dynamically typed values crossing the native boundary
//!
//! [`DynValue`] is what callers hand to the call engine and what hook
//! callbacks read and write. Conversion to and from raw register bits is
//! driven by the [`TypeTag`] of the slot involved.

use std::ffi::{c_char, CStr, CString};
use std::fmt;

use sourcebind_memory::Pointer;
use sourcebind_sdk::TypeTag;

use super::CallError;

/// A dynamically typed native value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum DynValue {
    /// No value (`void` returns, null strings)
    #[default]
    None,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Pointer(Pointer),
    String(CString),
}

impl DynValue {
    pub fn is_none(&self) -> bool {
        matches!(self, DynValue::None)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DynValue::Bool(b) => Some(*b),
            DynValue::Int(v) => Some(*v != 0),
            DynValue::UInt(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            DynValue::Bool(b) => Some(*b as i64),
            DynValue::Int(v) => Some(*v),
            DynValue::UInt(v) => Some(*v as i64),
            DynValue::Pointer(p) => Some(p.address() as i64),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DynValue::Bool(b) => Some(*b as u64),
            DynValue::Int(v) => Some(*v as u64),
            DynValue::UInt(v) => Some(*v),
            DynValue::Pointer(p) => Some(p.address() as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            DynValue::Float(v) => Some(*v),
            DynValue::Int(v) => Some(*v as f64),
            DynValue::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_pointer(&self) -> Option<Pointer> {
        match self {
            DynValue::Pointer(p) => Some(*p),
            DynValue::None => Some(Pointer::NULL),
            DynValue::Int(v) => Some(Pointer::new(*v as usize)),
            DynValue::UInt(v) => Some(Pointer::new(*v as usize)),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DynValue::String(s) => s.to_str().ok(),
            _ => None,
        }
    }

    /// Raw register bits for a slot of type `tag`
    ///
    /// Strings are passed by the address of the `CString` held in `self`,
    /// so `self` must outlive the native use of the result.
    pub(crate) fn encode(&self, tag: TypeTag, index: usize) -> Result<u64, CallError> {
        let mismatch = || CallError::ArgumentType { index, tag };
        let bits = match tag {
            TypeTag::Void => return Err(mismatch()),
            TypeTag::Bool => self.as_bool().ok_or_else(mismatch)? as u64,
            TypeTag::Char => self.as_i64().ok_or_else(mismatch)? as i8 as i64 as u64,
            TypeTag::UChar => self.as_u64().ok_or_else(mismatch)? as u8 as u64,
            TypeTag::Short => self.as_i64().ok_or_else(mismatch)? as i16 as i64 as u64,
            TypeTag::UShort => self.as_u64().ok_or_else(mismatch)? as u16 as u64,
            TypeTag::Int => self.as_i64().ok_or_else(mismatch)? as i32 as i64 as u64,
            TypeTag::UInt => self.as_u64().ok_or_else(mismatch)? as u32 as u64,
            TypeTag::Long if tag.size() == 4 => {
                self.as_i64().ok_or_else(mismatch)? as i32 as i64 as u64
            }
            TypeTag::ULong if tag.size() == 4 => self.as_u64().ok_or_else(mismatch)? as u32 as u64,
            TypeTag::Long | TypeTag::LongLong => self.as_i64().ok_or_else(mismatch)? as u64,
            TypeTag::ULong | TypeTag::ULongLong => self.as_u64().ok_or_else(mismatch)?,
            TypeTag::Float => (self.as_f64().ok_or_else(mismatch)? as f32).to_bits() as u64,
            TypeTag::Double => self.as_f64().ok_or_else(mismatch)?.to_bits(),
            TypeTag::Pointer => self.as_pointer().ok_or_else(mismatch)?.address() as u64,
            TypeTag::String => match self {
                DynValue::String(s) => s.as_ptr() as u64,
                DynValue::None => 0,
                DynValue::Pointer(p) => p.address() as u64,
                _ => return Err(mismatch()),
            },
        };
        Ok(bits)
    }

    /// Rebuild a value of type `tag` from raw register bits
    ///
    /// `int_bits` is used for integer-class tags, `float_bits` for `f`/`d`.
    ///
    /// # Safety
    /// For `Z`, a non-zero `int_bits` must point to a NUL-terminated string.
    pub(crate) unsafe fn decode(tag: TypeTag, int_bits: u64, float_bits: u64) -> DynValue {
        match tag {
            TypeTag::Void => DynValue::None,
            TypeTag::Bool => DynValue::Bool(int_bits as u8 != 0),
            TypeTag::Char => DynValue::Int(int_bits as u8 as i8 as i64),
            TypeTag::UChar => DynValue::UInt(int_bits as u8 as u64),
            TypeTag::Short => DynValue::Int(int_bits as u16 as i16 as i64),
            TypeTag::UShort => DynValue::UInt(int_bits as u16 as u64),
            TypeTag::Int => DynValue::Int(int_bits as u32 as i32 as i64),
            TypeTag::UInt => DynValue::UInt(int_bits as u32 as u64),
            TypeTag::Long if tag.size() == 4 => DynValue::Int(int_bits as u32 as i32 as i64),
            TypeTag::ULong if tag.size() == 4 => DynValue::UInt(int_bits as u32 as u64),
            TypeTag::Long | TypeTag::LongLong => DynValue::Int(int_bits as i64),
            TypeTag::ULong | TypeTag::ULongLong => DynValue::UInt(int_bits),
            TypeTag::Float => DynValue::Float(f32::from_bits(float_bits as u32) as f64),
            TypeTag::Double => DynValue::Float(f64::from_bits(float_bits)),
            TypeTag::Pointer => DynValue::Pointer(Pointer::new(int_bits as usize)),
            TypeTag::String => {
                if int_bits == 0 {
                    DynValue::None
                } else {
                    DynValue::String(CStr::from_ptr(int_bits as *const c_char).to_owned())
                }
            }
        }
    }
}

impl fmt::Display for DynValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynValue::None => f.write_str("None"),
            DynValue::Bool(b) => write!(f, "{}", b),
            DynValue::Int(v) => write!(f, "{}", v),
            DynValue::UInt(v) => write!(f, "{}", v),
            DynValue::Float(v) => write!(f, "{}", v),
            DynValue::Pointer(p) => write!(f, "{}", p),
            DynValue::String(s) => write!(f, "{:?}", s),
        }
    }
}

impl From<bool> for DynValue {
    fn from(v: bool) -> Self {
        DynValue::Bool(v)
    }
}

macro_rules! impl_from_int {
    ($variant:ident: $($t:ty),*) => {
        $(
            impl From<$t> for DynValue {
                fn from(v: $t) -> Self {
                    DynValue::$variant(v as _)
                }
            }
        )*
    };
}

impl_from_int!(Int: i8, i16, i32, i64, isize);
impl_from_int!(UInt: u8, u16, u32, u64, usize);

impl From<f32> for DynValue {
    fn from(v: f32) -> Self {
        DynValue::Float(v as f64)
    }
}

impl From<f64> for DynValue {
    fn from(v: f64) -> Self {
        DynValue::Float(v)
    }
}

impl From<Pointer> for DynValue {
    fn from(p: Pointer) -> Self {
        DynValue::Pointer(p)
    }
}

impl From<CString> for DynValue {
    fn from(s: CString) -> Self {
        DynValue::String(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_truncates_to_native_width() {
        let value = DynValue::Int(-1);
        assert_eq!(value.encode(TypeTag::UChar, 0).unwrap(), 0xFF);
        assert_eq!(value.encode(TypeTag::UShort, 0).unwrap(), 0xFFFF);
        assert_eq!(value.encode(TypeTag::Int, 0).unwrap(), u64::MAX);
        assert_eq!(DynValue::Int(300).encode(TypeTag::Char, 0).unwrap(), 44);
        assert_eq!(DynValue::Bool(true).encode(TypeTag::Bool, 0).unwrap(), 1);
    }

    #[test]
    fn test_encode_floats() {
        let bits = DynValue::Float(1.5).encode(TypeTag::Float, 0).unwrap();
        assert_eq!(bits, 1.5f32.to_bits() as u64);
        let bits = DynValue::Int(2).encode(TypeTag::Double, 0).unwrap();
        assert_eq!(f64::from_bits(bits), 2.0);
    }

    #[test]
    fn test_encode_type_mismatch() {
        let err = DynValue::Float(1.0).encode(TypeTag::Int, 3).unwrap_err();
        assert!(matches!(
            err,
            CallError::ArgumentType {
                index: 3,
                tag: TypeTag::Int
            }
        ));
        assert!(DynValue::Bool(true).encode(TypeTag::String, 0).is_err());
    }

    #[test]
    fn test_decode_sign_extension() {
        unsafe {
            assert_eq!(DynValue::decode(TypeTag::Char, 0xFF, 0), DynValue::Int(-1));
            assert_eq!(DynValue::decode(TypeTag::UChar, 0x1FF, 0), DynValue::UInt(0xFF));
            assert_eq!(
                DynValue::decode(TypeTag::Int, 0xDEAD_0000_FFFF_FFFE, 0),
                DynValue::Int(-2)
            );
            assert_eq!(DynValue::decode(TypeTag::Bool, 0x100, 0), DynValue::Bool(false));
            assert_eq!(DynValue::decode(TypeTag::Void, 7, 7), DynValue::None);
        }
    }

    #[test]
    fn test_decode_strings() {
        let text = CString::new("hello").unwrap();
        unsafe {
            assert_eq!(
                DynValue::decode(TypeTag::String, text.as_ptr() as u64, 0),
                DynValue::String(text.clone())
            );
            assert_eq!(DynValue::decode(TypeTag::String, 0, 0), DynValue::None);
        }
    }
}
