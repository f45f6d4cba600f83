//! Stress harness for the quiesce synchronization layer.
//!
//! This crate provides:
//! - Scenarios: executable workloads for the wait-morphing and reclamation
//!   guarantees, run with real threads on a simulated machine
//! - A runner that times each scenario and reports its outcome
//! - The JSONL structured-log contract shared by the runner and the
//!   `harness validate-log` checker

#![forbid(unsafe_code)]

pub mod error;
pub mod runner;
pub mod scenario;
pub mod structured_log;

pub use error::HarnessError;
pub use runner::{ScenarioReport, ScenarioRunner};
pub use scenario::Scenario;
