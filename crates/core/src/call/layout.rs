//! Argument classification for the x86-64 calling conventions

use sourcebind_sdk::FunctionSignature;

/// Where one argument travels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgLocation {
    /// Integer register, by ABI order
    Int(usize),
    /// Vector register `xmmN`
    Float(usize),
    /// Stack slot above the return address (and shadow space)
    Stack(usize),
}

/// Register and stack assignment of every argument of a signature
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgumentLayout {
    locations: Vec<ArgLocation>,
    stack_slots: usize,
    shadow: usize,
}

impl ArgumentLayout {
    /// Layout for the platform's native convention
    pub fn new(signature: &FunctionSignature) -> Self {
        if cfg!(windows) {
            Self::win64(signature)
        } else {
            Self::sysv(signature)
        }
    }

    /// System V: integers and floats fill their register files
    /// independently, the rest go on the stack in order
    pub fn sysv(signature: &FunctionSignature) -> Self {
        let mut ints = 0;
        let mut floats = 0;
        let mut stack = 0;

        let locations = signature
            .args()
            .iter()
            .map(|tag| {
                if tag.is_float() && floats < 8 {
                    floats += 1;
                    ArgLocation::Float(floats - 1)
                } else if !tag.is_float() && ints < 6 {
                    ints += 1;
                    ArgLocation::Int(ints - 1)
                } else {
                    stack += 1;
                    ArgLocation::Stack(stack - 1)
                }
            })
            .collect();

        Self {
            locations,
            stack_slots: stack,
            shadow: 0,
        }
    }

    /// Microsoft x64: the first four arguments own a positional register,
    /// the rest follow the 32-byte shadow space
    pub fn win64(signature: &FunctionSignature) -> Self {
        let locations: Vec<_> = signature
            .args()
            .iter()
            .enumerate()
            .map(|(i, tag)| match i {
                0..=3 if tag.is_float() => ArgLocation::Float(i),
                0..=3 => ArgLocation::Int(i),
                _ => ArgLocation::Stack(i - 4),
            })
            .collect();

        Self {
            stack_slots: locations.len().saturating_sub(4),
            locations,
            shadow: 32,
        }
    }

    pub fn locations(&self) -> &[ArgLocation] {
        &self.locations
    }

    pub fn location(&self, index: usize) -> Option<ArgLocation> {
        self.locations.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Number of 8-byte stack slots the arguments need
    pub fn stack_slots(&self) -> usize {
        self.stack_slots
    }

    /// Bytes reserved for the callee between return address and stack args
    pub fn shadow(&self) -> usize {
        self.shadow
    }

    /// Offset of stack slot `slot` from the stack pointer at function entry
    pub fn stack_offset(&self, slot: usize) -> usize {
        8 + self.shadow + slot * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ArgLocation::*;

    fn sig(text: &str) -> FunctionSignature {
        text.parse().unwrap()
    }

    #[test]
    fn test_sysv_mixed_arguments() {
        let layout = ArgumentLayout::sysv(&sig("pidfi)v"));
        assert_eq!(
            layout.locations(),
            &[Int(0), Int(1), Float(0), Float(1), Int(2)]
        );
        assert_eq!(layout.stack_slots(), 0);
    }

    #[test]
    fn test_sysv_overflow_to_stack() {
        let layout = ArgumentLayout::sysv(&sig("iiiiiiiddddddddddi)v"));
        assert_eq!(layout.location(5), Some(Int(5)));
        assert_eq!(layout.location(6), Some(Stack(0)));
        assert_eq!(layout.location(15), Some(Float(7)));
        assert_eq!(layout.location(16), Some(Stack(1)));
        assert_eq!(layout.location(17), Some(Stack(2)));
        assert_eq!(layout.stack_slots(), 3);
        assert_eq!(layout.stack_offset(0), 8);
        assert_eq!(layout.stack_offset(2), 24);
    }

    #[test]
    fn test_win64_positional() {
        let layout = ArgumentLayout::win64(&sig("idpfii)v"));
        assert_eq!(
            layout.locations(),
            &[Int(0), Float(1), Int(2), Float(3), Stack(0), Stack(1)]
        );
        assert_eq!(layout.stack_slots(), 2);
        assert_eq!(layout.stack_offset(0), 40);
    }

    #[test]
    fn test_empty_signature() {
        let layout = ArgumentLayout::new(&sig(")i"));
        assert!(layout.is_empty());
        assert_eq!(layout.location(0), None);
    }
}
