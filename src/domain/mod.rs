//! Domain types for conduit.
//!
//! This module contains the runtime records of workflow runs:
//! - Strategy: composition strategy tag
//! - WorkflowExecution: one run, with per-unit results
//! - ExecutionStatus: lookup view for submitted runs

pub mod execution;

pub use execution::{ExecutionStatus, Strategy, UnitResult, UnitStatus, WorkflowExecution};
