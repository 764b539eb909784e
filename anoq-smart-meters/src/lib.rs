//! A simulated smart-meter deployment of the anoq query protocol.
//!
//! Every client process simulates one household: a set of devices drawn
//! from saturation tables, advanced one timestep at a time on a background
//! thread. The utility issues consumption queries; the meters answer them
//! through the anonymous aggregation protocol, so the utility learns street
//! totals but never a single household's usage.

pub mod device;
pub mod fixed_point;
pub mod meter;

use anoq_core::{
    message::{ByteReader, DecodeError, FromBytes, ToBytes},
    Opcode,
};

pub use crate::{
    device::{Device, DeviceConfig},
    fixed_point::FixedPoint,
    meter::{meter_data_source, IncomeLevel, SimSmartMeter},
};

/// Select: total consumption over a window (4-byte LE minutes argument).
pub const MEASURE_CONSUMPTION: Opcode = 0;
/// Select: shiftable consumption over a window.
pub const MEASURE_SHIFTABLE_CONSUMPTION: Opcode = 1;
/// Select: consumption over the last simulated day (no argument).
pub const MEASURE_DAILY_CONSUMPTION: Opcode = 2;
/// Select: projected per-timestep usage over a window.
pub const SIMULATE_PROJECTED_USAGE: Opcode = 3;
/// Filter: accept everything.
pub const NO_FILTER: Opcode = 0;
/// Aggregate: element-wise vector sum.
pub const SUM_VECTORS: Opcode = 0;

/// The record type of this deployment: one fixed-point value per timestep
/// (a single-element vector for the scalar measurements).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct UsageVector(pub Vec<FixedPoint>);

impl UsageVector {
    pub fn total(&self) -> FixedPoint {
        self.0.iter().copied().sum()
    }
}

impl ToBytes for UsageVector {
    fn buffer_length(&self) -> usize {
        self.0.buffer_length()
    }

    fn to_bytes(&self, buffer: &mut Vec<u8>) {
        self.0.to_bytes(buffer);
    }
}

impl FromBytes for UsageVector {
    fn from_bytes(reader: &mut ByteReader<'_>) -> Result<Self, DecodeError> {
        Ok(Self(Vec::from_bytes(reader)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_vector_round_trip() {
        let vector = UsageVector(vec![FixedPoint::from_f64(1.5), FixedPoint::from_f64(-2.0)]);
        let mut buf = Vec::new();
        vector.to_bytes(&mut buf);
        assert_eq!(buf.len(), vector.buffer_length());
        let parsed = UsageVector::from_bytes(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(parsed, vector);
    }
}
