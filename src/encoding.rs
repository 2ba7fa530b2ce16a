//! Fixed-width slot codecs.
//!
//! A codec turns a nullable [`Number`] into exactly [`Codec::type_width`] bytes and back.
//! Every codec reserves one bit pattern for null: the minimum value of an integer type and
//! NaN for floating point types. A real value that happens to encode to that pattern reads
//! back as null.

use crate::minifloat::{Float1, Float3};
use crate::quantize::{CurvedCodec, MappedCodec};
use crate::{Number, Result, TslabError};
use half::f16;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Encodes and decodes nullable numbers in fixed-width slots of a byte buffer.
///
/// `slot` is an index, not a byte offset. Callers check bounds; codecs panic on a slot
/// outside `buf`.
pub trait Codec: Send + Sync + fmt::Debug {
    /// Width of one slot in bytes.
    fn type_width(&self) -> usize;

    /// Reads the value stored in `slot`.
    fn decode(&self, buf: &[u8], slot: usize) -> Option<Number>;

    /// Writes `value` into `slot`.
    fn encode(&self, buf: &mut [u8], slot: usize, value: Option<Number>);

    /// Writes the null pattern into every slot of `buf`.
    fn fill_null(&self, buf: &mut [u8]) {
        let width = self.type_width();
        let mut template = vec![0u8; width];
        self.encode(&mut template, 0, None);
        for chunk in buf.chunks_exact_mut(width) {
            chunk.copy_from_slice(&template);
        }
    }
}

#[inline]
fn slot_bytes(buf: &[u8], slot: usize, width: usize) -> &[u8] {
    let offset = slot * width;
    &buf[offset..offset + width]
}

#[inline]
fn slot_bytes_mut(buf: &mut [u8], slot: usize, width: usize) -> &mut [u8] {
    let offset = slot * width;
    &mut buf[offset..offset + width]
}

/// Width of a signed integer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntWidth {
    W8,
    W16,
    W32,
    W64,
}

impl IntWidth {
    pub fn bytes(self) -> usize {
        match self {
            IntWidth::W8 => 1,
            IntWidth::W16 => 2,
            IntWidth::W32 => 4,
            IntWidth::W64 => 8,
        }
    }

    /// Smallest representable value; reserved as the null sentinel.
    pub fn min_value(self) -> i64 {
        match self {
            IntWidth::W8 => i8::MIN as i64,
            IntWidth::W16 => i16::MIN as i64,
            IntWidth::W32 => i32::MIN as i64,
            IntWidth::W64 => i64::MIN,
        }
    }

    pub fn max_value(self) -> i64 {
        match self {
            IntWidth::W8 => i8::MAX as i64,
            IntWidth::W16 => i16::MAX as i64,
            IntWidth::W32 => i32::MAX as i64,
            IntWidth::W64 => i64::MAX,
        }
    }
}

/// Native big-endian signed integer codec.
#[derive(Debug, Clone, Copy)]
pub struct IntCodec {
    width: IntWidth,
}

impl IntCodec {
    pub fn new(width: IntWidth) -> Self {
        Self { width }
    }

    pub fn width(&self) -> IntWidth {
        self.width
    }

    /// Reads the raw integer in `slot`, sentinel included.
    pub fn read_raw(&self, buf: &[u8], slot: usize) -> i64 {
        let bytes = slot_bytes(buf, slot, self.width.bytes());
        match self.width {
            IntWidth::W8 => bytes[0] as i8 as i64,
            IntWidth::W16 => i16::from_be_bytes([bytes[0], bytes[1]]) as i64,
            IntWidth::W32 => i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64,
            IntWidth::W64 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                i64::from_be_bytes(raw)
            }
        }
    }

    /// Writes `raw` into `slot`, saturating it to the slot width. Only the sentinel itself
    /// lands on the minimum; smaller values saturate one above it.
    pub fn write_raw(&self, buf: &mut [u8], slot: usize, raw: i64) {
        let min = self.width.min_value();
        let raw = if raw == min {
            raw
        } else {
            raw.clamp(min + 1, self.width.max_value())
        };
        let bytes = slot_bytes_mut(buf, slot, self.width.bytes());
        match self.width {
            IntWidth::W8 => bytes[0] = raw as i8 as u8,
            IntWidth::W16 => bytes.copy_from_slice(&(raw as i16).to_be_bytes()),
            IntWidth::W32 => bytes.copy_from_slice(&(raw as i32).to_be_bytes()),
            IntWidth::W64 => bytes.copy_from_slice(&raw.to_be_bytes()),
        }
    }
}

impl Codec for IntCodec {
    fn type_width(&self) -> usize {
        self.width.bytes()
    }

    fn decode(&self, buf: &[u8], slot: usize) -> Option<Number> {
        let raw = self.read_raw(buf, slot);
        (raw != self.width.min_value()).then_some(Number::Int(raw))
    }

    fn encode(&self, buf: &mut [u8], slot: usize, value: Option<Number>) {
        let raw = match value {
            Some(Number::Int(v)) => v,
            Some(Number::Float(v)) if !v.is_nan() => v
                .round()
                .clamp((self.width.min_value() + 1) as f64, self.width.max_value() as f64)
                as i64,
            _ => self.width.min_value(),
        };
        self.write_raw(buf, slot, raw);
    }
}

/// Floating point slot layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FloatKind {
    /// 8-bit minifloat, see [`Float1`].
    Mini8,
    /// IEEE 754 half precision.
    Half,
    /// 24-bit minifloat, see [`Float3`].
    Mini24,
    Single,
    Double,
}

/// Floating point codec. NaN is the null pattern.
#[derive(Debug, Clone, Copy)]
pub struct FloatCodec {
    kind: FloatKind,
}

impl FloatCodec {
    pub fn new(kind: FloatKind) -> Self {
        Self { kind }
    }
}

impl Codec for FloatCodec {
    fn type_width(&self) -> usize {
        match self.kind {
            FloatKind::Mini8 => 1,
            FloatKind::Half => 2,
            FloatKind::Mini24 => 3,
            FloatKind::Single => 4,
            FloatKind::Double => 8,
        }
    }

    fn decode(&self, buf: &[u8], slot: usize) -> Option<Number> {
        let bytes = slot_bytes(buf, slot, self.type_width());
        let value = match self.kind {
            FloatKind::Mini8 => Float1::from_bits(bytes[0]).to_f64(),
            FloatKind::Half => f16::from_bits(u16::from_be_bytes([bytes[0], bytes[1]])).to_f64(),
            FloatKind::Mini24 => Float3::from_be_bytes([bytes[0], bytes[1], bytes[2]]).to_f64(),
            FloatKind::Single => {
                f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as f64
            }
            FloatKind::Double => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                f64::from_be_bytes(raw)
            }
        };
        (!value.is_nan()).then_some(Number::Float(value))
    }

    fn encode(&self, buf: &mut [u8], slot: usize, value: Option<Number>) {
        let value = value.map(Number::as_f64).unwrap_or(f64::NAN);
        let bytes = slot_bytes_mut(buf, slot, self.type_width());
        match self.kind {
            FloatKind::Mini8 => bytes[0] = Float1::from_f64(value).to_bits(),
            FloatKind::Half => bytes.copy_from_slice(&f16::from_f64(value).to_bits().to_be_bytes()),
            FloatKind::Mini24 => bytes.copy_from_slice(&Float3::from_f64(value).to_be_bytes()),
            FloatKind::Single => bytes.copy_from_slice(&(value as f32).to_be_bytes()),
            FloatKind::Double => bytes.copy_from_slice(&value.to_be_bytes()),
        }
    }
}

/// Storage kind of a series. Determines slot width and codec chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumberType {
    Float8,
    Float16,
    Float24,
    Float32,
    Float64,
    Int8,
    Int16,
    Int32,
    Int64,
    Mapped8,
    Mapped16,
    Mapped32,
    Curved8,
    Curved16,
    Curved32,
}

impl NumberType {
    pub const ALL: [NumberType; 15] = [
        NumberType::Float8,
        NumberType::Float16,
        NumberType::Float24,
        NumberType::Float32,
        NumberType::Float64,
        NumberType::Int8,
        NumberType::Int16,
        NumberType::Int32,
        NumberType::Int64,
        NumberType::Mapped8,
        NumberType::Mapped16,
        NumberType::Mapped32,
        NumberType::Curved8,
        NumberType::Curved16,
        NumberType::Curved32,
    ];

    pub fn name(self) -> &'static str {
        match self {
            NumberType::Float8 => "float8",
            NumberType::Float16 => "float16",
            NumberType::Float24 => "float24",
            NumberType::Float32 => "float32",
            NumberType::Float64 => "float64",
            NumberType::Int8 => "int8",
            NumberType::Int16 => "int16",
            NumberType::Int32 => "int32",
            NumberType::Int64 => "int64",
            NumberType::Mapped8 => "mapped8",
            NumberType::Mapped16 => "mapped16",
            NumberType::Mapped32 => "mapped32",
            NumberType::Curved8 => "curved8",
            NumberType::Curved16 => "curved16",
            NumberType::Curved32 => "curved32",
        }
    }

    /// Slot width in bytes.
    pub fn width(self) -> usize {
        match self {
            NumberType::Float8 | NumberType::Int8 | NumberType::Mapped8 | NumberType::Curved8 => 1,
            NumberType::Float16
            | NumberType::Int16
            | NumberType::Mapped16
            | NumberType::Curved16 => 2,
            NumberType::Float24 => 3,
            NumberType::Float32
            | NumberType::Int32
            | NumberType::Mapped32
            | NumberType::Curved32 => 4,
            NumberType::Float64 | NumberType::Int64 => 8,
        }
    }

    /// True for the types that quantize a declared domain onto integers.
    pub fn requires_domain(self) -> bool {
        matches!(
            self,
            NumberType::Mapped8
                | NumberType::Mapped16
                | NumberType::Mapped32
                | NumberType::Curved8
                | NumberType::Curved16
                | NumberType::Curved32
        )
    }

    fn int_width(self) -> Option<IntWidth> {
        match self {
            NumberType::Int8 | NumberType::Mapped8 | NumberType::Curved8 => Some(IntWidth::W8),
            NumberType::Int16 | NumberType::Mapped16 | NumberType::Curved16 => {
                Some(IntWidth::W16)
            }
            NumberType::Int32 | NumberType::Mapped32 | NumberType::Curved32 => {
                Some(IntWidth::W32)
            }
            NumberType::Int64 => Some(IntWidth::W64),
            _ => None,
        }
    }

    /// Builds the codec chain for this type. Mapped and curved types wrap an integer codec
    /// and need a finite `[min, max]` domain with `min < max`.
    pub fn codec(self, min: Option<f64>, max: Option<f64>) -> Result<Arc<dyn Codec>> {
        let codec: Arc<dyn Codec> = match self {
            NumberType::Float8 => Arc::new(FloatCodec::new(FloatKind::Mini8)),
            NumberType::Float16 => Arc::new(FloatCodec::new(FloatKind::Half)),
            NumberType::Float24 => Arc::new(FloatCodec::new(FloatKind::Mini24)),
            NumberType::Float32 => Arc::new(FloatCodec::new(FloatKind::Single)),
            NumberType::Float64 => Arc::new(FloatCodec::new(FloatKind::Double)),
            NumberType::Int8 | NumberType::Int16 | NumberType::Int32 | NumberType::Int64 => {
                Arc::new(IntCodec::new(self.int_width().unwrap_or(IntWidth::W64)))
            }
            NumberType::Mapped8
            | NumberType::Mapped16
            | NumberType::Mapped32
            | NumberType::Curved8
            | NumberType::Curved16
            | NumberType::Curved32 => {
                let (min, max) = match (min, max) {
                    (Some(min), Some(max)) if min.is_finite() && max.is_finite() && min < max => {
                        (min, max)
                    }
                    _ => {
                        return Err(TslabError::MissingDomain {
                            number_type: self.name().to_string(),
                        });
                    }
                };
                let inner = IntCodec::new(self.int_width().unwrap_or(IntWidth::W32));
                if matches!(
                    self,
                    NumberType::Mapped8 | NumberType::Mapped16 | NumberType::Mapped32
                ) {
                    Arc::new(MappedCodec::new(inner, min, max))
                } else {
                    Arc::new(CurvedCodec::new(inner, min, max))
                }
            }
        };
        Ok(codec)
    }
}

impl fmt::Display for NumberType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for NumberType {
    type Err = TslabError;

    fn from_str(s: &str) -> Result<Self> {
        let lower = s.trim().to_ascii_lowercase();
        NumberType::ALL
            .into_iter()
            .find(|t| t.name() == lower)
            .ok_or_else(|| TslabError::UnknownNumberType(s.to_string()))
    }
}
