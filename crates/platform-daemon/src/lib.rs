//! `platform-daemon` library target.
//!
//! Exposes the router and state for integration tests; the binary
//! `main.rs` depends on this library target, matching the teacher's
//! `mqk-daemon` split.

pub mod api_types;
pub mod routes;
pub mod state;
