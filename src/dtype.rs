//! Element types and inline constants.

use num_complex::{Complex32, Complex64};
use std::hash::{Hash, Hasher};

/// Element type of a base or constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DType {
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    CF32,
    CF64,
    /// 128-bit opaque counter/key pair used by the counter-based generator
    R123,
}

impl DType {
    #[must_use]
    pub const fn byte_size(self) -> usize {
        match self {
            DType::Bool | DType::I8 | DType::U8 => 1,
            DType::I16 | DType::U16 => 2,
            DType::I32 | DType::U32 | DType::F32 => 4,
            DType::I64 | DType::U64 | DType::F64 | DType::CF32 => 8,
            DType::CF64 | DType::R123 => 16,
        }
    }

    /// Type name in the generated C dialect.
    #[must_use]
    pub const fn c99(self) -> &'static str {
        match self {
            DType::Bool | DType::U8 => "uint8_t",
            DType::I8 => "int8_t",
            DType::I16 => "int16_t",
            DType::I32 => "int32_t",
            DType::I64 => "int64_t",
            DType::U16 => "uint16_t",
            DType::U32 => "uint32_t",
            DType::U64 => "uint64_t",
            DType::F32 => "float",
            DType::F64 => "double",
            DType::CF32 => "float complex",
            DType::CF64 => "double complex",
            DType::R123 => "smelt_r123_t",
        }
    }

    /// Short tag used in canonical kernel symbols.
    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            DType::Bool => "b",
            DType::I8 => "i8",
            DType::I16 => "i16",
            DType::I32 => "i32",
            DType::I64 => "i64",
            DType::U8 => "u8",
            DType::U16 => "u16",
            DType::U32 => "u32",
            DType::U64 => "u64",
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::CF32 => "c64",
            DType::CF64 => "c128",
            DType::R123 => "r123",
        }
    }

    #[must_use]
    pub const fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    #[must_use]
    pub const fn is_complex(self) -> bool {
        matches!(self, DType::CF32 | DType::CF64)
    }

    #[must_use]
    pub const fn is_int(self) -> bool {
        matches!(
            self,
            DType::I8
                | DType::I16
                | DType::I32
                | DType::I64
                | DType::U8
                | DType::U16
                | DType::U32
                | DType::U64
        )
    }

    #[must_use]
    pub const fn is_signed(self) -> bool {
        matches!(
            self,
            DType::I8 | DType::I16 | DType::I32 | DType::I64 | DType::F32 | DType::F64
        )
    }

    /// C expression for the largest representable value (reduction neutral of `min`).
    /// Not defined for complex or opaque types.
    #[must_use]
    pub const fn max_literal(self) -> Option<&'static str> {
        match self {
            DType::Bool => Some("1"),
            DType::I8 => Some("INT8_MAX"),
            DType::I16 => Some("INT16_MAX"),
            DType::I32 => Some("INT32_MAX"),
            DType::I64 => Some("INT64_MAX"),
            DType::U8 => Some("UINT8_MAX"),
            DType::U16 => Some("UINT16_MAX"),
            DType::U32 => Some("UINT32_MAX"),
            DType::U64 => Some("UINT64_MAX"),
            DType::F32 => Some("FLT_MAX"),
            DType::F64 => Some("DBL_MAX"),
            DType::CF32 | DType::CF64 | DType::R123 => None,
        }
    }

    /// C expression for the smallest representable value (reduction neutral of `max`).
    #[must_use]
    pub const fn min_literal(self) -> Option<&'static str> {
        match self {
            DType::Bool => Some("0"),
            DType::I8 => Some("INT8_MIN"),
            DType::I16 => Some("INT16_MIN"),
            DType::I32 => Some("INT32_MIN"),
            DType::I64 => Some("INT64_MIN"),
            DType::U8 | DType::U16 | DType::U32 | DType::U64 => Some("0"),
            DType::F32 => Some("-FLT_MAX"),
            DType::F64 => Some("-DBL_MAX"),
            DType::CF32 | DType::CF64 | DType::R123 => None,
        }
    }

    #[must_use]
    pub fn zero(self) -> Constant {
        match self {
            DType::Bool => Constant::Bool(false),
            DType::I8 => Constant::I8(0),
            DType::I16 => Constant::I16(0),
            DType::I32 => Constant::I32(0),
            DType::I64 => Constant::I64(0),
            DType::U8 => Constant::U8(0),
            DType::U16 => Constant::U16(0),
            DType::U32 => Constant::U32(0),
            DType::U64 => Constant::U64(0),
            DType::F32 => Constant::F32(0.0),
            DType::F64 => Constant::F64(0.0),
            DType::CF32 => Constant::CF32(Complex32::new(0.0, 0.0)),
            DType::CF64 => Constant::CF64(Complex64::new(0.0, 0.0)),
            DType::R123 => Constant::R123 { start: 0, key: 0 },
        }
    }

    #[must_use]
    pub fn one(self) -> Constant {
        match self {
            DType::Bool => Constant::Bool(true),
            DType::I8 => Constant::I8(1),
            DType::I16 => Constant::I16(1),
            DType::I32 => Constant::I32(1),
            DType::I64 => Constant::I64(1),
            DType::U8 => Constant::U8(1),
            DType::U16 => Constant::U16(1),
            DType::U32 => Constant::U32(1),
            DType::U64 => Constant::U64(1),
            DType::F32 => Constant::F32(1.0),
            DType::F64 => Constant::F64(1.0),
            DType::CF32 => Constant::CF32(Complex32::new(1.0, 0.0)),
            DType::CF64 => Constant::CF64(Complex64::new(1.0, 0.0)),
            DType::R123 => Constant::R123 { start: 1, key: 0 },
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// An inline scalar value carried by a constant view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Constant {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    CF32(Complex32),
    CF64(Complex64),
    R123 { start: u64, key: u64 },
}

// Equality and hashing go through the bit pattern so constants can key maps.
impl Eq for Constant {}

impl Hash for Constant {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.dtype().byte_size() as u8);
        match self {
            Constant::Bool(x) => state.write_u8(u8::from(*x)),
            Constant::I8(x) => state.write_i8(*x),
            Constant::I16(x) => state.write_i16(*x),
            Constant::I32(x) => state.write_i32(*x),
            Constant::I64(x) => state.write_i64(*x),
            Constant::U8(x) => state.write_u8(*x),
            Constant::U16(x) => state.write_u16(*x),
            Constant::U32(x) => state.write_u32(*x),
            Constant::U64(x) => state.write_u64(*x),
            Constant::F32(x) => state.write(&x.to_le_bytes()),
            Constant::F64(x) => state.write(&x.to_le_bytes()),
            Constant::CF32(x) => {
                state.write(&x.re.to_le_bytes());
                state.write(&x.im.to_le_bytes());
            }
            Constant::CF64(x) => {
                state.write(&x.re.to_le_bytes());
                state.write(&x.im.to_le_bytes());
            }
            Constant::R123 { start, key } => {
                state.write_u64(*start);
                state.write_u64(*key);
            }
        }
    }
}

impl Constant {
    #[must_use]
    pub const fn dtype(&self) -> DType {
        match self {
            Constant::Bool(_) => DType::Bool,
            Constant::I8(_) => DType::I8,
            Constant::I16(_) => DType::I16,
            Constant::I32(_) => DType::I32,
            Constant::I64(_) => DType::I64,
            Constant::U8(_) => DType::U8,
            Constant::U16(_) => DType::U16,
            Constant::U32(_) => DType::U32,
            Constant::U64(_) => DType::U64,
            Constant::F32(_) => DType::F32,
            Constant::F64(_) => DType::F64,
            Constant::CF32(_) => DType::CF32,
            Constant::CF64(_) => DType::CF64,
            Constant::R123 { .. } => DType::R123,
        }
    }

    /// Interpret the constant as an axis number, as reductions and scans
    /// store their swept axis in the constant operand.
    #[must_use]
    pub const fn as_axis(&self) -> Option<i64> {
        match self {
            Constant::I8(x) => Some(*x as i64),
            Constant::I16(x) => Some(*x as i64),
            Constant::I32(x) => Some(*x as i64),
            Constant::I64(x) => Some(*x),
            Constant::U8(x) => Some(*x as i64),
            Constant::U16(x) => Some(*x as i64),
            Constant::U32(x) => Some(*x as i64),
            Constant::U64(x) => Some(*x as i64),
            _ => None,
        }
    }

    /// Native-endian value bytes, padded to 16. This is the storage handed
    /// to compiled kernels for SCALAR_CONST operands, so it must match the
    /// target's own representation.
    #[must_use]
    pub fn to_ne_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        match self {
            Constant::Bool(x) => out[0] = u8::from(*x),
            Constant::I8(x) => out[..1].copy_from_slice(&x.to_ne_bytes()),
            Constant::I16(x) => out[..2].copy_from_slice(&x.to_ne_bytes()),
            Constant::I32(x) => out[..4].copy_from_slice(&x.to_ne_bytes()),
            Constant::I64(x) => out[..8].copy_from_slice(&x.to_ne_bytes()),
            Constant::U8(x) => out[..1].copy_from_slice(&x.to_ne_bytes()),
            Constant::U16(x) => out[..2].copy_from_slice(&x.to_ne_bytes()),
            Constant::U32(x) => out[..4].copy_from_slice(&x.to_ne_bytes()),
            Constant::U64(x) => out[..8].copy_from_slice(&x.to_ne_bytes()),
            Constant::F32(x) => out[..4].copy_from_slice(&x.to_ne_bytes()),
            Constant::F64(x) => out[..8].copy_from_slice(&x.to_ne_bytes()),
            Constant::CF32(x) => {
                out[..4].copy_from_slice(&x.re.to_ne_bytes());
                out[4..8].copy_from_slice(&x.im.to_ne_bytes());
            }
            Constant::CF64(x) => {
                out[..8].copy_from_slice(&x.re.to_ne_bytes());
                out[8..16].copy_from_slice(&x.im.to_ne_bytes());
            }
            Constant::R123 { start, key } => {
                out[..8].copy_from_slice(&start.to_ne_bytes());
                out[8..16].copy_from_slice(&key.to_ne_bytes());
            }
        }
        out
    }
}

impl std::fmt::Display for Constant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constant::Bool(x) => f.write_fmt(format_args!("{}", u8::from(*x))),
            Constant::I8(x) => f.write_fmt(format_args!("{x}")),
            Constant::I16(x) => f.write_fmt(format_args!("{x}")),
            Constant::I32(x) => f.write_fmt(format_args!("{x}")),
            Constant::I64(x) => f.write_fmt(format_args!("{x}")),
            Constant::U8(x) => f.write_fmt(format_args!("{x}")),
            Constant::U16(x) => f.write_fmt(format_args!("{x}")),
            Constant::U32(x) => f.write_fmt(format_args!("{x}")),
            Constant::U64(x) => f.write_fmt(format_args!("{x}")),
            Constant::F32(x) => f.write_fmt(format_args!("{x:?}")),
            Constant::F64(x) => f.write_fmt(format_args!("{x:?}")),
            Constant::CF32(x) => f.write_fmt(format_args!("{}+{}i", x.re, x.im)),
            Constant::CF64(x) => f.write_fmt(format_args!("{}+{}i", x.re, x.im)),
            Constant::R123 { start, key } => f.write_fmt(format_args!("r123({start},{key})")),
        }
    }
}
