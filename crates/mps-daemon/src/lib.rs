//! mps-daemon library target.
//!
//! Exposes the router, shared state and startup wiring for integration tests
//! and for `mps-cli`. The binary `main.rs` depends on this library target.

pub mod api_types;
pub mod routes;
pub mod state;
pub mod wiring;
