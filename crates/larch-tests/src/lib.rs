//! End-to-end test scenarios for the Larch replication engine.
//!
//! The [`harness`] module builds in-process topologies (one relay plus N
//! members, wired over paired sessions) and the scenario modules drive them
//! through convergence, conflict resolution, flow control, and recovery.

pub mod conflict_scenarios;
pub mod harness;
pub mod proptest_replay;
pub mod recovery_tests;
pub mod repl_scenarios;

pub use harness::{Member, TestTopology, TopologyOptions};
