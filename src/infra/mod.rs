//! Runtime bootstrap: error types and telemetry.

pub mod error;
pub mod telemetry;
