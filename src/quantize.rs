//! Quantizing adapters that store a bounded real domain in integer slots.
//!
//! Both adapters clamp input to the declared `[min, max]` domain before scaling, and keep the
//! inner integer codec's minimum value reserved as null.

use crate::Number;
use crate::encoding::{Codec, IntCodec};

/// `2 / (1 + e^(-2x)) - 1`, i.e. `tanh(x)`.
pub fn curve(x: f64) -> f64 {
    2.0 / (1.0 + (-2.0 * x).exp()) - 1.0
}

/// Inverse of [`curve`]: `0.5 * ln((1 + y) / (1 - y))`.
pub fn decurve(y: f64) -> f64 {
    0.5 * ((1.0 + y) / (1.0 - y)).ln()
}

/// Linear quantization of `[min, max]` onto `[MIN + 1, MAX]` of the inner integer type.
#[derive(Debug, Clone)]
pub struct MappedCodec {
    inner: IntCodec,
    min: f64,
    max: f64,
    low: f64,
    high: f64,
}

impl MappedCodec {
    pub fn new(inner: IntCodec, min: f64, max: f64) -> Self {
        let width = inner.width();
        Self {
            inner,
            min,
            max,
            low: (width.min_value() + 1) as f64,
            high: width.max_value() as f64,
        }
    }

    /// Domain distance between two adjacent integer codes.
    pub fn step(&self) -> f64 {
        (self.max - self.min) / (self.high - self.low)
    }
}

impl Codec for MappedCodec {
    fn type_width(&self) -> usize {
        self.inner.type_width()
    }

    fn decode(&self, buf: &[u8], slot: usize) -> Option<Number> {
        let raw = self.inner.read_raw(buf, slot);
        if raw == self.inner.width().min_value() {
            return None;
        }
        let ratio = (raw as f64 - self.low) / (self.high - self.low);
        Some(Number::Float(ratio * (self.max - self.min) + self.min))
    }

    fn encode(&self, buf: &mut [u8], slot: usize, value: Option<Number>) {
        let raw = match value.map(Number::as_f64) {
            Some(x) if !x.is_nan() => {
                let x = x.clamp(self.min, self.max);
                let ratio = (x - self.min) / (self.max - self.min);
                (ratio * (self.high - self.low) + self.low).round() as i64
            }
            _ => self.inner.width().min_value(),
        };
        self.inner.write_raw(buf, slot, raw);
    }
}

/// Nonlinear quantization: values are mapped into `[-1, 1]`, bent through [`curve`] and
/// spread over the symmetric signed range `[-MAX, MAX]`. Codes are densest around the
/// center of the domain.
#[derive(Debug, Clone)]
pub struct CurvedCodec {
    inner: IntCodec,
    min: f64,
    max: f64,
    scale: f64,
    norm: f64,
}

impl CurvedCodec {
    pub fn new(inner: IntCodec, min: f64, max: f64) -> Self {
        let scale = inner.width().max_value() as f64;
        Self {
            inner,
            min,
            max,
            scale,
            norm: curve(1.0),
        }
    }

    /// Widest domain distance between two adjacent integer codes, reached at the domain edges.
    pub fn max_step(&self) -> f64 {
        let y = self.norm;
        let du_dy = 1.0 / (1.0 - y * y);
        (self.max - self.min) / 2.0 * du_dy * self.norm / self.scale
    }
}

impl Codec for CurvedCodec {
    fn type_width(&self) -> usize {
        self.inner.type_width()
    }

    fn decode(&self, buf: &[u8], slot: usize) -> Option<Number> {
        let raw = self.inner.read_raw(buf, slot);
        if raw == self.inner.width().min_value() {
            return None;
        }
        let y = raw as f64 / self.scale * self.norm;
        let u = decurve(y);
        let x = (u + 1.0) / 2.0 * (self.max - self.min) + self.min;
        Some(Number::Float(x.clamp(self.min, self.max)))
    }

    fn encode(&self, buf: &mut [u8], slot: usize, value: Option<Number>) {
        let raw = match value.map(Number::as_f64) {
            Some(x) if !x.is_nan() => {
                let x = x.clamp(self.min, self.max);
                let u = 2.0 * (x - self.min) / (self.max - self.min) - 1.0;
                let y = curve(u) / self.norm;
                (y * self.scale).round() as i64
            }
            _ => self.inner.width().min_value(),
        };
        self.inner.write_raw(buf, slot, raw);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoding::IntWidth;

    fn round_trip(codec: &dyn Codec, x: f64) -> f64 {
        let mut buf = vec![0u8; codec.type_width()];
        codec.encode(&mut buf, 0, Some(Number::Float(x)));
        codec.decode(&buf, 0).map(Number::as_f64).unwrap_or(f64::NAN)
    }

    #[test]
    fn test_curve_inverse() {
        for x in [-1.0, -0.5, 0.0, 0.25, 0.9, 1.0] {
            assert!((decurve(curve(x)) - x).abs() < 1e-12);
        }
        assert!((curve(1.0) - 1f64.tanh()).abs() < 1e-15);
    }

    #[test]
    fn test_mapped_within_one_step() {
        for width in [IntWidth::W8, IntWidth::W16, IntWidth::W32] {
            let codec = MappedCodec::new(IntCodec::new(width), -40.0, 60.0);
            let step = codec.step();
            let mut x = -40.0;
            while x <= 60.0 {
                let decoded = round_trip(&codec, x);
                assert!((decoded - x).abs() <= step, "{width:?}: {x} -> {decoded}");
                x += 0.37;
            }
            assert_eq!(round_trip(&codec, -40.0), -40.0);
            assert!((round_trip(&codec, 60.0) - 60.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_mapped_clamps_out_of_domain() {
        let codec = MappedCodec::new(IntCodec::new(IntWidth::W8), 0.0, 10.0);
        assert_eq!(round_trip(&codec, -1000.0), 0.0);
        assert!((round_trip(&codec, 1000.0) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_mapped_minimum_does_not_collide_with_null() {
        let codec = MappedCodec::new(IntCodec::new(IntWidth::W8), 0.0, 10.0);
        let mut buf = [0u8; 1];
        codec.encode(&mut buf, 0, Some(Number::Float(0.0)));
        assert_eq!(buf[0] as i8, -127);
        codec.encode(&mut buf, 0, None);
        assert_eq!(buf[0] as i8, i8::MIN);
        assert_eq!(codec.decode(&buf, 0), None);
    }

    #[test]
    fn test_curved_within_one_step() {
        for width in [IntWidth::W8, IntWidth::W16, IntWidth::W32] {
            let codec = CurvedCodec::new(IntCodec::new(width), 0.0, 100.0);
            let step = codec.max_step();
            let mut x = 0.0;
            while x <= 100.0 {
                let decoded = round_trip(&codec, x);
                assert!((decoded - x).abs() <= step, "{width:?}: {x} -> {decoded}");
                x += 0.5;
            }
        }
    }

    #[test]
    fn test_curved_center_is_most_precise() {
        let codec = CurvedCodec::new(IntCodec::new(IntWidth::W8), -1.0, 1.0);
        let center_error = (round_trip(&codec, 0.013) - 0.013).abs();
        let edge_error = (round_trip(&codec, 0.987) - 0.987).abs();
        let center_gap = round_trip(&codec, 0.0) - round_trip(&codec, -0.02);
        assert!(center_error < 0.01);
        assert!(edge_error < codec.max_step());
        assert!(center_gap >= 0.0);

        // Adjacent codes are closer together near the center than at the edge.
        let mut buf = [0u8; 1];
        let decode_raw = |raw: i8, buf: &mut [u8; 1]| {
            buf[0] = raw as u8;
            codec.decode(buf, 0).map(Number::as_f64).unwrap_or(f64::NAN)
        };
        let center = decode_raw(1, &mut buf) - decode_raw(0, &mut buf);
        let edge = decode_raw(127, &mut buf) - decode_raw(126, &mut buf);
        assert!(center < edge, "center {center} edge {edge}");
    }

    #[test]
    fn test_curved_clamps_and_reserves_null() {
        let codec = CurvedCodec::new(IntCodec::new(IntWidth::W16), 10.0, 20.0);
        assert!((round_trip(&codec, -5.0) - 10.0).abs() < codec.max_step());
        assert!((round_trip(&codec, 99.0) - 20.0).abs() < codec.max_step());

        let mut buf = [0u8; 2];
        codec.encode(&mut buf, 0, Some(Number::Float(10.0)));
        assert_eq!(i16::from_be_bytes(buf), -i16::MAX);
        codec.encode(&mut buf, 0, None);
        assert_eq!(codec.decode(&buf, 0), None);
    }
}
