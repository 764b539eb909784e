//! Fixed-point arithmetic for meter readings.
//!
//! Query records must be hashable and exactly comparable across nodes, so
//! floating point is out; readings are stored as a 64-bit integer with 16
//! fractional bits, which gives sub-watt-hour precision over any realistic
//! consumption range.

use std::{
    fmt,
    iter::Sum,
    ops::{Add, AddAssign},
};

use anoq_core::message::{ByteReader, DecodeError, FromBytes, ToBytes};

const FRACTIONAL_BITS: u32 = 16;
const SCALE: f64 = (1u64 << FRACTIONAL_BITS) as f64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FixedPoint(i64);

impl FixedPoint {
    pub const ZERO: FixedPoint = FixedPoint(0);

    pub fn from_f64(value: f64) -> Self {
        Self((value * SCALE).round() as i64)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / SCALE
    }

    pub fn raw(self) -> i64 {
        self.0
    }
}

impl Add for FixedPoint {
    type Output = FixedPoint;

    fn add(self, other: FixedPoint) -> FixedPoint {
        FixedPoint(self.0 + other.0)
    }
}

impl AddAssign for FixedPoint {
    fn add_assign(&mut self, other: FixedPoint) {
        self.0 += other.0;
    }
}

impl Sum for FixedPoint {
    fn sum<I: Iterator<Item = FixedPoint>>(iter: I) -> FixedPoint {
        iter.fold(FixedPoint::ZERO, Add::add)
    }
}

impl fmt::Display for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.to_f64())
    }
}

impl ToBytes for FixedPoint {
    fn buffer_length(&self) -> usize {
        8
    }

    fn to_bytes(&self, buffer: &mut Vec<u8>) {
        self.0.to_bytes(buffer);
    }
}

impl FromBytes for FixedPoint {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self(i64::from_bytes(reader)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_round_trips_to_precision() {
        for value in [0.0, 1.5, -3.25, 1000.125] {
            assert!((FixedPoint::from_f64(value).to_f64() - value).abs() < 1.0 / SCALE);
        }
    }

    #[test]
    fn addition_is_exact() {
        let a = FixedPoint::from_f64(0.5);
        let b = FixedPoint::from_f64(0.25);
        assert_eq!(a + b, FixedPoint::from_f64(0.75));
    }

    #[test]
    fn wire_round_trip() {
        let value = FixedPoint::from_f64(123.456);
        let mut buf = Vec::new();
        value.to_bytes(&mut buf);
        let parsed = FixedPoint::from_bytes(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(parsed, value);
    }
}
