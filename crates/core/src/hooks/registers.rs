//! Register snapshot taken at a hooked function's entry and exit
//!
//! Layout matches the bridge and post stubs' store order, so the stubs write
//! straight into this structure and read it back after the callbacks ran.

use crate::call::{ArgLocation, ArgumentLayout};

/// XMM register (128-bit SIMD)
#[repr(C, align(16))]
#[derive(Clone, Copy, Default, PartialEq)]
pub struct Xmm {
    pub data: [u8; 16],
}

impl Xmm {
    fn lane<const N: usize>(&self, index: usize) -> [u8; N] {
        std::array::from_fn(|i| self.data[index * N + i])
    }

    /// Interpret as 4 single-precision floats
    pub fn as_f32x4(&self) -> [f32; 4] {
        std::array::from_fn(|i| f32::from_le_bytes(self.lane(i)))
    }

    /// Interpret as 2 double-precision floats
    pub fn as_f64x2(&self) -> [f64; 2] {
        std::array::from_fn(|i| f64::from_le_bytes(self.lane(i)))
    }

    /// Interpret as 2 64-bit integers
    pub fn as_u64x2(&self) -> [u64; 2] {
        std::array::from_fn(|i| u64::from_le_bytes(self.lane(i)))
    }

    /// Low 64 bits, where scalar float arguments live
    pub fn low(&self) -> u64 {
        u64::from_le_bytes(self.lane(0))
    }

    /// Replace the low 64 bits and clear the rest
    pub fn set_low(&mut self, bits: u64) {
        self.data = [0; 16];
        self.data[..8].copy_from_slice(&bits.to_le_bytes());
    }

    /// Set from 4 single-precision floats
    pub fn set_f32x4(&mut self, values: [f32; 4]) {
        for (i, v) in values.iter().enumerate() {
            self.data[i * 4..(i + 1) * 4].copy_from_slice(&v.to_le_bytes());
        }
    }

    /// Set from 2 double-precision floats
    pub fn set_f64x2(&mut self, values: [f64; 2]) {
        for (i, v) in values.iter().enumerate() {
            self.data[i * 8..(i + 1) * 8].copy_from_slice(&v.to_le_bytes());
        }
    }
}

impl std::fmt::Debug for Xmm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Xmm({:02x?})", &self.data[..])
    }
}

/// Argument and return registers of a hooked call
///
/// On entry the integer argument registers and `xmm0-7` hold the caller's
/// arguments; on exit `rax`, `rdx`, `xmm0` and `xmm1` hold the return value.
/// `rsp` is the stack pointer at function entry, pointing at the return
/// address. Writes are reflected when the stub resumes.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Registers {
    pub xmm: [Xmm; 8],
    pub rax: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub r8: u64,
    pub r9: u64,
    pub rsp: u64,
}

impl Registers {
    /// Integer argument register `index` in ABI order
    #[cfg(not(windows))]
    pub fn int_arg(&self, index: usize) -> Option<u64> {
        match index {
            0 => Some(self.rdi),
            1 => Some(self.rsi),
            2 => Some(self.rdx),
            3 => Some(self.rcx),
            4 => Some(self.r8),
            5 => Some(self.r9),
            _ => None,
        }
    }

    #[cfg(windows)]
    pub fn int_arg(&self, index: usize) -> Option<u64> {
        match index {
            0 => Some(self.rcx),
            1 => Some(self.rdx),
            2 => Some(self.r8),
            3 => Some(self.r9),
            _ => None,
        }
    }

    #[cfg(not(windows))]
    pub fn set_int_arg(&mut self, index: usize, value: u64) -> bool {
        let reg = match index {
            0 => &mut self.rdi,
            1 => &mut self.rsi,
            2 => &mut self.rdx,
            3 => &mut self.rcx,
            4 => &mut self.r8,
            5 => &mut self.r9,
            _ => return false,
        };
        *reg = value;
        true
    }

    #[cfg(windows)]
    pub fn set_int_arg(&mut self, index: usize, value: u64) -> bool {
        let reg = match index {
            0 => &mut self.rcx,
            1 => &mut self.rdx,
            2 => &mut self.r8,
            3 => &mut self.r9,
            _ => return false,
        };
        *reg = value;
        true
    }

    /// Return address of the hooked call
    ///
    /// # Safety
    /// `rsp` must still point at the live return address slot.
    pub unsafe fn return_address(&self) -> u64 {
        *(self.rsp as *const u64)
    }

    /// Raw bits of argument `index` according to `layout`
    ///
    /// # Safety
    /// For stack arguments, `rsp` must point at the entry frame of a call
    /// that really passed them.
    pub unsafe fn argument_bits(&self, layout: &ArgumentLayout, index: usize) -> Option<u64> {
        match layout.location(index)? {
            ArgLocation::Int(reg) => self.int_arg(reg),
            ArgLocation::Float(reg) => self.xmm.get(reg).map(Xmm::low),
            ArgLocation::Stack(slot) => {
                let address = self.rsp as usize + layout.stack_offset(slot);
                Some(*(address as *const u64))
            }
        }
    }

    /// Overwrite argument `index` according to `layout`
    ///
    /// # Safety
    /// Same contract as [`argument_bits`](Self::argument_bits).
    pub unsafe fn set_argument_bits(
        &mut self,
        layout: &ArgumentLayout,
        index: usize,
        bits: u64,
    ) -> bool {
        match layout.location(index) {
            Some(ArgLocation::Int(reg)) => self.set_int_arg(reg, bits),
            Some(ArgLocation::Float(reg)) => match self.xmm.get_mut(reg) {
                Some(xmm) => {
                    xmm.set_low(bits);
                    true
                }
                None => false,
            },
            Some(ArgLocation::Stack(slot)) => {
                let address = self.rsp as usize + layout.stack_offset(slot);
                *(address as *mut u64) = bits;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sourcebind_sdk::FunctionSignature;

    #[test]
    fn test_xmm_conversions() {
        let mut xmm = Xmm::default();
        xmm.set_f32x4([1.0, 2.0, 3.0, 4.0]);
        assert_eq!(xmm.as_f32x4(), [1.0, 2.0, 3.0, 4.0]);

        xmm.set_f64x2([1.5, 2.5]);
        assert_eq!(xmm.as_f64x2(), [1.5, 2.5]);

        xmm.set_low(0x1234_5678_90AB_CDEF);
        assert_eq!(xmm.as_u64x2(), [0x1234_5678_90AB_CDEF, 0]);
    }

    #[test]
    fn test_int_argument_registers() {
        let mut regs = Registers::default();
        assert!(regs.set_int_arg(0, 11));
        assert!(regs.set_int_arg(1, 22));
        assert!(!regs.set_int_arg(6, 0));
        assert_eq!(regs.int_arg(0), Some(11));
        assert_eq!(regs.int_arg(1), Some(22));
        assert_eq!(regs.int_arg(6), None);
    }

    #[test]
    fn test_arguments_by_layout() {
        let signature: FunctionSignature = "idiiiiiiiii)v".parse().unwrap();
        let layout = ArgumentLayout::new(&signature);

        // return address, shadow space, then stack arguments
        let mut stack = [0u64; 16];
        let last = layout.stack_slots() - 1;
        stack[layout.stack_offset(last) / 8] = 77;

        let mut regs = Registers {
            rsp: stack.as_mut_ptr() as u64,
            ..Default::default()
        };

        unsafe {
            assert!(regs.set_argument_bits(&layout, 0, 5));
            assert!(regs.set_argument_bits(&layout, 1, 2.5f64.to_bits()));
            assert_eq!(regs.argument_bits(&layout, 0), Some(5));
            assert_eq!(regs.argument_bits(&layout, 1), Some(2.5f64.to_bits()));
            assert_eq!(regs.argument_bits(&layout, 10), Some(77));
            assert_eq!(regs.argument_bits(&layout, 11), None);

            assert!(regs.set_argument_bits(&layout, 10, 78));
        }
        assert_eq!(stack[layout.stack_offset(last) / 8], 78);
    }
}
