//! Sub-32-bit floating point formats.
//!
//! Both formats keep the IEEE 754 layout (sign, biased exponent, mantissa) but with fewer
//! bits. A value is narrowed by re-biasing the exponent of its 64-bit representation and
//! truncating the mantissa; there are no subnormals, so anything below the smallest normal
//! exponent becomes a signed zero and anything above the largest becomes a signed infinity.
//!
//! | format   | bits | exponent | mantissa | bias |
//! |----------|------|----------|----------|------|
//! | `Float1` | 8    | 4        | 3        | 7    |
//! | `Float3` | 24   | 7        | 16       | 63   |

use std::fmt;

const F64_MANTISSA_BITS: u32 = 52;
const F64_EXPONENT_MASK: u64 = 0x7ff;
const F64_BIAS: i64 = 1023;

/// Narrows a double into a `1 + exponent_bits + mantissa_bits` wide pattern.
fn narrow(value: f64, exponent_bits: u32, mantissa_bits: u32) -> u64 {
    let bits = value.to_bits();
    let sign = (bits >> 63) << (exponent_bits + mantissa_bits);
    let exponent = ((bits >> F64_MANTISSA_BITS) & F64_EXPONENT_MASK) as i64;
    let mantissa = bits & ((1u64 << F64_MANTISSA_BITS) - 1);

    let exponent_max = (1u64 << exponent_bits) - 1;
    let infinity = sign | (exponent_max << mantissa_bits);

    if exponent == F64_EXPONENT_MASK as i64 {
        return if mantissa != 0 {
            infinity | (1u64 << (mantissa_bits - 1))
        } else {
            infinity
        };
    }

    // Zero and double subnormals are far below every narrow exponent range.
    if exponent == 0 {
        return sign;
    }

    let bias = (1i64 << (exponent_bits - 1)) - 1;
    let rebiased = exponent - F64_BIAS + bias;
    if rebiased >= exponent_max as i64 {
        return infinity;
    }
    if rebiased <= 0 {
        return sign;
    }

    sign | ((rebiased as u64) << mantissa_bits) | (mantissa >> (F64_MANTISSA_BITS - mantissa_bits))
}

/// Widens a narrow pattern back into a double. Exact: every narrow value is representable.
fn widen(bits: u64, exponent_bits: u32, mantissa_bits: u32) -> f64 {
    let sign = ((bits >> (exponent_bits + mantissa_bits)) & 1) << 63;
    let exponent_max = (1u64 << exponent_bits) - 1;
    let exponent = (bits >> mantissa_bits) & exponent_max;
    let mantissa = bits & ((1u64 << mantissa_bits) - 1);

    if exponent == exponent_max {
        let payload = if mantissa != 0 { 1u64 << 51 } else { 0 };
        return f64::from_bits(sign | (F64_EXPONENT_MASK << F64_MANTISSA_BITS) | payload);
    }
    if exponent == 0 {
        return f64::from_bits(sign);
    }

    let bias = (1i64 << (exponent_bits - 1)) - 1;
    let rebiased = (exponent as i64 - bias + F64_BIAS) as u64;
    f64::from_bits(
        sign | (rebiased << F64_MANTISSA_BITS) | (mantissa << (F64_MANTISSA_BITS - mantissa_bits)),
    )
}

/// An 8-bit float: 1 sign, 4 exponent and 3 mantissa bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Float1(u8);

impl Float1 {
    pub const EXPONENT_BITS: u32 = 4;
    pub const MANTISSA_BITS: u32 = 3;
    pub const NAN: Float1 = Float1(0x7c);
    pub const INFINITY: Float1 = Float1(0x78);
    pub const NEG_INFINITY: Float1 = Float1(0xf8);
    /// Largest finite value, 240.
    pub const MAX: Float1 = Float1(0x77);

    pub fn from_f64(value: f64) -> Self {
        Float1(narrow(value, Self::EXPONENT_BITS, Self::MANTISSA_BITS) as u8)
    }

    pub fn to_f64(self) -> f64 {
        widen(self.0 as u64, Self::EXPONENT_BITS, Self::MANTISSA_BITS)
    }

    pub fn from_bits(bits: u8) -> Self {
        Float1(bits)
    }

    pub fn to_bits(self) -> u8 {
        self.0
    }

    pub fn is_nan(self) -> bool {
        self.0 & 0x78 == 0x78 && self.0 & 0x07 != 0
    }
}

impl fmt::Debug for Float1 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Float1({:#04x} = {})", self.0, self.to_f64())
    }
}

/// A 24-bit float: 1 sign, 7 exponent and 16 mantissa bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Float3(u32);

impl Float3 {
    pub const EXPONENT_BITS: u32 = 7;
    pub const MANTISSA_BITS: u32 = 16;
    const MASK: u32 = 0x00ff_ffff;
    pub const NAN: Float3 = Float3(0x7f_8000);
    pub const INFINITY: Float3 = Float3(0x7f_0000);
    pub const NEG_INFINITY: Float3 = Float3(0xff_0000);

    pub fn from_f64(value: f64) -> Self {
        Float3(narrow(value, Self::EXPONENT_BITS, Self::MANTISSA_BITS) as u32)
    }

    pub fn to_f64(self) -> f64 {
        widen(self.0 as u64, Self::EXPONENT_BITS, Self::MANTISSA_BITS)
    }

    /// Builds a value from the low 24 bits of `bits`.
    pub fn from_bits(bits: u32) -> Self {
        Float3(bits & Self::MASK)
    }

    pub fn to_bits(self) -> u32 {
        self.0
    }

    /// Big-endian three byte form, as stored in a partition slot.
    pub fn to_be_bytes(self) -> [u8; 3] {
        let [_, a, b, c] = self.0.to_be_bytes();
        [a, b, c]
    }

    pub fn from_be_bytes(bytes: [u8; 3]) -> Self {
        Float3(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]))
    }

    pub fn is_nan(self) -> bool {
        self.0 & 0x7f_0000 == 0x7f_0000 && self.0 & 0xffff != 0
    }
}

impl fmt::Debug for Float3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Float3({:#08x} = {})", self.0, self.to_f64())
    }
}
