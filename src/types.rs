//! Core element types and the crate error.

use std::fmt;

use thiserror::Error;

/// Element type of a kernel operand or auxiliary tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    Bf16,
    F16,
    /// 8-bit float, 5 exponent bits, 2 mantissa bits (bias 15).
    F8E5M2,
    /// 8-bit float, 4 exponent bits, 3 mantissa bits (bias 7).
    F8E4M3,
    S32,
    S8,
    U8,
    /// Signed 4-bit, two per byte.
    S4,
    /// Unsigned 4-bit, two per byte.
    U4,
    /// Normal-float-4 codebook index, two per byte.
    Nf4,
}

impl DataType {
    /// Storage size in bits.
    pub const fn bits(self) -> usize {
        match self {
            Self::F32 | Self::S32 => 32,
            Self::Bf16 | Self::F16 => 16,
            Self::F8E5M2 | Self::F8E4M3 | Self::S8 | Self::U8 => 8,
            Self::S4 | Self::U4 | Self::Nf4 => 4,
        }
    }

    /// Size in bytes of one element, or of one packed byte for 4-bit types.
    pub const fn size_bytes(self) -> usize {
        match self.bits() {
            4 => 1,
            b => b / 8,
        }
    }

    /// Elements packed per storage byte along the reduction dimension.
    pub const fn pack_factor(self) -> usize {
        if self.bits() == 4 {
            2
        } else {
            1
        }
    }

    pub const fn is_int8(self) -> bool {
        matches!(self, Self::S8 | Self::U8)
    }

    pub const fn is_fp8(self) -> bool {
        matches!(self, Self::F8E5M2 | Self::F8E4M3)
    }

    pub const fn is_4bit(self) -> bool {
        self.bits() == 4
    }

    pub const fn is_float(self) -> bool {
        matches!(
            self,
            Self::F32 | Self::Bf16 | Self::F16 | Self::F8E5M2 | Self::F8E4M3
        )
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::F32 => "f32",
            Self::Bf16 => "bf16",
            Self::F16 => "f16",
            Self::F8E5M2 => "f8_e5m2",
            Self::F8E4M3 => "f8_e4m3",
            Self::S32 => "s32",
            Self::S8 => "s8",
            Self::U8 => "u8",
            Self::S4 => "s4",
            Self::U4 => "u4",
            Self::Nf4 => "nf4",
        };
        f.write_str(s)
    }
}

/// Every way kernel construction can fail.
///
/// All of these are raised while building the kernel. A kernel that was
/// built successfully has no error path of its own.
#[derive(Debug, Error)]
pub enum BrgemmError {
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("unsupported configuration: {0}")]
    Unsupported(String),
    #[error("register budget exceeded: {needed} vector registers needed, {available} available ({context})")]
    RegisterBudget {
        needed: usize,
        available: usize,
        context: String,
    },
    #[error("register alias: {first} and {second} both map to {physical} during {phase}")]
    RegisterAlias {
        first: String,
        second: String,
        physical: String,
        phase: &'static str,
    },
    #[error("assembler error: {0}")]
    Assembler(String),
    #[error("executable memory: {0}")]
    Memory(String),
}

impl From<iced_x86::IcedError> for BrgemmError {
    fn from(e: iced_x86::IcedError) -> Self {
        BrgemmError::Assembler(e.to_string())
    }
}

pub type BrgemmResult<T> = Result<T, BrgemmError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sizes() {
        assert_eq!(DataType::F32.size_bytes(), 4);
        assert_eq!(DataType::Bf16.size_bytes(), 2);
        assert_eq!(DataType::U8.size_bytes(), 1);
        assert_eq!(DataType::Nf4.size_bytes(), 1);
        assert_eq!(DataType::U4.pack_factor(), 2);
        assert_eq!(DataType::S8.pack_factor(), 1);
    }

    #[test]
    fn test_classes() {
        assert!(DataType::F8E4M3.is_fp8());
        assert!(DataType::F8E4M3.is_float());
        assert!(DataType::U8.is_int8());
        assert!(!DataType::S32.is_int8());
        assert!(DataType::S4.is_4bit());
    }
}
