//! The per-client query protocol: the four-phase engine and its agreement
//! and aggregation sub-state-machines.

pub mod aggregation;
pub mod agreement;
pub mod engine;

#[cfg(test)]
mod tests;

pub use self::{
    aggregation::AggregationState,
    agreement::AgreementState,
    engine::{ProtocolEngine, ProtocolPhase, TimerEvent},
};
