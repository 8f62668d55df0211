//! Process/saga orchestration (spec §3/§4.8, C8/C9).
//!
//! [`graph`] builds the immutable step graph a process type is configured
//! with; [`manager`] drives instances through it; [`replay`] reconstructs an
//! instance's control-flow state from its `process_log` alone.

pub mod graph;
pub mod manager;
pub mod replay;

pub use graph::{GraphError, NextOf, ProcessGraph, ProcessGraphBuilder};
pub use manager::{ManagerConfig, PayloadRenderer, ProcessConfiguration, ProcessManager, ReplyOutcome};
pub use replay::fold;
