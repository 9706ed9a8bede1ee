use serde::{Deserialize, Serialize};

/// Closed enumeration of the scalar element types a buffer can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    /// 32-bit IEEE-754 floating point.
    F32,
    /// 16-bit IEEE-754 floating point.
    F16,
    /// 16-bit bfloat16.
    Bf16,
    I64,
    I32,
    I16,
    I8,
    U64,
    U32,
    U16,
    U8,
    /// One byte per element, values restricted to `{0, 1}`.
    Boolean,
}

impl ElementType {
    /// Storage width in bits of one element.
    pub fn bit_width(self) -> usize {
        match self {
            ElementType::F32 | ElementType::I32 | ElementType::U32 => 32,
            ElementType::F16 | ElementType::Bf16 => 16,
            ElementType::I64 | ElementType::U64 => 64,
            ElementType::I16 | ElementType::U16 => 16,
            ElementType::I8 | ElementType::U8 | ElementType::Boolean => 8,
        }
    }

    /// Storage size in bytes of one element.
    ///
    /// Every member of the closed set is at least one byte wide; see
    /// [`ElementType::byte_len`] for the packing rule applied to counts.
    pub fn size_in_bytes(self) -> usize {
        self.bit_width() / 8
    }

    /// Total byte length of a packed buffer holding `count` elements.
    ///
    /// Defined as `ceil(count * bit_width / 8)`: sub-byte types, were any
    /// added to the set, pack LSB-first within a byte and round the tail
    /// byte up.
    pub fn byte_len(self, count: usize) -> usize {
        (count * self.bit_width() + 7) / 8
    }

    pub fn is_float(self) -> bool {
        matches!(self, ElementType::F32 | ElementType::F16 | ElementType::Bf16)
    }

    pub fn is_integer(self) -> bool {
        matches!(
            self,
            ElementType::I64
                | ElementType::I32
                | ElementType::I16
                | ElementType::I8
                | ElementType::U64
                | ElementType::U32
                | ElementType::U16
                | ElementType::U8
        )
    }

    /// `true` for floats and signed integers.
    pub fn is_signed(self) -> bool {
        matches!(
            self,
            ElementType::F32
                | ElementType::F16
                | ElementType::Bf16
                | ElementType::I64
                | ElementType::I32
                | ElementType::I16
                | ElementType::I8
        )
    }

    /// Short lowercase name used in diagnostics and kernel symbols.
    pub fn name(self) -> &'static str {
        match self {
            ElementType::F32 => "f32",
            ElementType::F16 => "f16",
            ElementType::Bf16 => "bf16",
            ElementType::I64 => "i64",
            ElementType::I32 => "i32",
            ElementType::I16 => "i16",
            ElementType::I8 => "i8",
            ElementType::U64 => "u64",
            ElementType::U32 => "u32",
            ElementType::U16 => "u16",
            ElementType::U8 => "u8",
            ElementType::Boolean => "boolean",
        }
    }
}

impl std::fmt::Display for ElementType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
