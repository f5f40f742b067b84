//! Unified health.measurement.v1 intake schema
//!
//! This module defines the submission shape accepted from the intake layer and
//! the adapter that turns single or bulk payloads into raw measurements.

mod adapter;
mod submission;

pub use adapter::*;
pub use submission::*;
