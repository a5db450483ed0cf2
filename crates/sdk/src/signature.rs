//! Compact native function signatures
//!
//! Signatures use the dyncall alphabet: one character per type, with `)`
//! separating the argument list from the return type. `"ii)i"` describes a
//! function taking two `int`s and returning an `int`; `")v"` takes nothing
//! and returns nothing.
//!
//! This format is persisted in gamedata files, so the alphabet and the
//! native width of every tag must stay stable.

use std::fmt;
use std::str::FromStr;

/// Separator between argument tags and the return tag
pub const RETURN_SEPARATOR: char = ')';

/// A single native type in a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Void,
    Bool,
    Char,
    UChar,
    Short,
    UShort,
    Int,
    UInt,
    Long,
    ULong,
    LongLong,
    ULongLong,
    Float,
    Double,
    Pointer,
    String,
}

impl TypeTag {
    /// All tags in alphabet order
    pub const ALL: [TypeTag; 16] = [
        TypeTag::Void,
        TypeTag::Bool,
        TypeTag::Char,
        TypeTag::UChar,
        TypeTag::Short,
        TypeTag::UShort,
        TypeTag::Int,
        TypeTag::UInt,
        TypeTag::Long,
        TypeTag::ULong,
        TypeTag::LongLong,
        TypeTag::ULongLong,
        TypeTag::Float,
        TypeTag::Double,
        TypeTag::Pointer,
        TypeTag::String,
    ];

    /// Parse a single signature character
    pub fn from_char(c: char) -> Option<Self> {
        let tag = match c {
            'v' => TypeTag::Void,
            'B' => TypeTag::Bool,
            'c' => TypeTag::Char,
            'C' => TypeTag::UChar,
            's' => TypeTag::Short,
            'S' => TypeTag::UShort,
            'i' => TypeTag::Int,
            'I' => TypeTag::UInt,
            'j' => TypeTag::Long,
            'J' => TypeTag::ULong,
            'l' => TypeTag::LongLong,
            'L' => TypeTag::ULongLong,
            'f' => TypeTag::Float,
            'd' => TypeTag::Double,
            'p' => TypeTag::Pointer,
            'Z' => TypeTag::String,
            _ => return None,
        };
        Some(tag)
    }

    /// The signature character for this tag
    pub const fn as_char(self) -> char {
        match self {
            TypeTag::Void => 'v',
            TypeTag::Bool => 'B',
            TypeTag::Char => 'c',
            TypeTag::UChar => 'C',
            TypeTag::Short => 's',
            TypeTag::UShort => 'S',
            TypeTag::Int => 'i',
            TypeTag::UInt => 'I',
            TypeTag::Long => 'j',
            TypeTag::ULong => 'J',
            TypeTag::LongLong => 'l',
            TypeTag::ULongLong => 'L',
            TypeTag::Float => 'f',
            TypeTag::Double => 'd',
            TypeTag::Pointer => 'p',
            TypeTag::String => 'Z',
        }
    }

    /// Native width in bytes (0 for void)
    ///
    /// `long` follows the platform's C `long`.
    pub const fn size(self) -> usize {
        match self {
            TypeTag::Void => 0,
            TypeTag::Bool | TypeTag::Char | TypeTag::UChar => 1,
            TypeTag::Short | TypeTag::UShort => 2,
            TypeTag::Int | TypeTag::UInt | TypeTag::Float => 4,
            TypeTag::Long | TypeTag::ULong => std::mem::size_of::<std::ffi::c_long>(),
            TypeTag::LongLong | TypeTag::ULongLong | TypeTag::Double => 8,
            TypeTag::Pointer | TypeTag::String => std::mem::size_of::<usize>(),
        }
    }

    /// Passed in vector registers rather than integer registers
    pub const fn is_float(self) -> bool {
        matches!(self, TypeTag::Float | TypeTag::Double)
    }

    /// Integer type of any width, excluding bool
    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            TypeTag::Char
                | TypeTag::UChar
                | TypeTag::Short
                | TypeTag::UShort
                | TypeTag::Int
                | TypeTag::UInt
                | TypeTag::Long
                | TypeTag::ULong
                | TypeTag::LongLong
                | TypeTag::ULongLong
        )
    }

    /// Signed integer type
    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            TypeTag::Char | TypeTag::Short | TypeTag::Int | TypeTag::Long | TypeTag::LongLong
        )
    }

    /// Human-readable C name
    pub const fn c_name(self) -> &'static str {
        match self {
            TypeTag::Void => "void",
            TypeTag::Bool => "bool",
            TypeTag::Char => "char",
            TypeTag::UChar => "unsigned char",
            TypeTag::Short => "short",
            TypeTag::UShort => "unsigned short",
            TypeTag::Int => "int",
            TypeTag::UInt => "unsigned int",
            TypeTag::Long => "long",
            TypeTag::ULong => "unsigned long",
            TypeTag::LongLong => "long long",
            TypeTag::ULongLong => "unsigned long long",
            TypeTag::Float => "float",
            TypeTag::Double => "double",
            TypeTag::Pointer => "void*",
            TypeTag::String => "const char*",
        }
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.c_name())
    }
}

/// Error parsing a signature string
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    /// Character is not part of the alphabet
    UnknownTag { tag: char, position: usize },
    /// No `)` separator, so no return type
    MissingReturn,
    /// Nothing or more than one tag after the separator
    InvalidReturn(String),
    /// `v` used as an argument type
    VoidArgument { position: usize },
}

impl fmt::Display for SignatureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignatureError::UnknownTag { tag, position } => {
                write!(f, "unknown type tag '{}' at position {}", tag, position)
            }
            SignatureError::MissingReturn => {
                write!(f, "signature has no return type (missing '{}')", RETURN_SEPARATOR)
            }
            SignatureError::InvalidReturn(s) => write!(f, "invalid return type: '{}'", s),
            SignatureError::VoidArgument { position } => {
                write!(f, "void used as argument at position {}", position)
            }
        }
    }
}

impl std::error::Error for SignatureError {}

/// Argument and return types of a native function
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionSignature {
    args: Vec<TypeTag>,
    ret: TypeTag,
}

impl FunctionSignature {
    /// Create a signature from already-parsed tags
    pub fn new(args: Vec<TypeTag>, ret: TypeTag) -> Result<Self, SignatureError> {
        if let Some(position) = args.iter().position(|t| *t == TypeTag::Void) {
            return Err(SignatureError::VoidArgument { position });
        }
        Ok(Self { args, ret })
    }

    /// Parse a dyncall-style signature string such as `"pi)B"`
    pub fn parse(text: &str) -> Result<Self, SignatureError> {
        let (args_text, ret_text) = text
            .split_once(RETURN_SEPARATOR)
            .ok_or(SignatureError::MissingReturn)?;

        let mut args = Vec::with_capacity(args_text.len());
        for (position, c) in args_text.chars().enumerate() {
            let tag = TypeTag::from_char(c).ok_or(SignatureError::UnknownTag { tag: c, position })?;
            if tag == TypeTag::Void {
                return Err(SignatureError::VoidArgument { position });
            }
            args.push(tag);
        }

        let mut ret_chars = ret_text.chars();
        let ret = match (ret_chars.next(), ret_chars.next()) {
            (Some(c), None) => TypeTag::from_char(c).ok_or(SignatureError::UnknownTag {
                tag: c,
                position: args_text.chars().count() + 1,
            })?,
            _ => return Err(SignatureError::InvalidReturn(ret_text.to_string())),
        };

        Ok(Self { args, ret })
    }

    /// Argument types in order
    pub fn args(&self) -> &[TypeTag] {
        &self.args
    }

    /// Return type
    pub fn ret(&self) -> TypeTag {
        self.ret
    }

    /// Number of arguments
    pub fn arity(&self) -> usize {
        self.args.len()
    }
}

impl FromStr for FunctionSignature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for tag in &self.args {
            write!(f, "{}", tag.as_char())?;
        }
        write!(f, "{}{}", RETURN_SEPARATOR, self.ret.as_char())
    }
}
