//! Calling conventions and hook phases

use std::fmt;
use std::str::FromStr;

/// ABI contract for argument passing and stack cleanup
///
/// On x86-64 all three collapse onto the platform ABI (System V or
/// Microsoft x64); `Thiscall` then simply means the object pointer is the
/// first integer argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CallingConvention {
    #[default]
    Cdecl,
    Stdcall,
    Thiscall,
}

impl CallingConvention {
    pub const fn name(self) -> &'static str {
        match self {
            CallingConvention::Cdecl => "cdecl",
            CallingConvention::Stdcall => "stdcall",
            CallingConvention::Thiscall => "thiscall",
        }
    }
}

impl fmt::Display for CallingConvention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CallingConvention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cdecl" | "convention_cdecl" => Ok(CallingConvention::Cdecl),
            "stdcall" | "convention_stdcall" => Ok(CallingConvention::Stdcall),
            "thiscall" | "convention_thiscall" => Ok(CallingConvention::Thiscall),
            other => Err(format!("unknown calling convention: {}", other)),
        }
    }
}

/// When a hook callback runs relative to the original function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Pre,
    Post,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Pre => f.write_str("pre"),
            Phase::Post => f.write_str("post"),
        }
    }
}
