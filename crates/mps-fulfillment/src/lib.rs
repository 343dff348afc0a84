//! mps-fulfillment
//!
//! Fulfillment state machine for a single posting. Deterministic, pure logic.
//! No IO, no clock reads.

mod state_machine;

pub use state_machine::*;
