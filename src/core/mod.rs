//! Core coordination logic.
//!
//! This module contains:
//! - Workflow: definitions, transforms, aggregators and YAML loading
//! - Coordinator: registries and the execution engine
//! - Relay: single-operation streaming onto a session
//! - Stats: counters and the recent-execution window

pub mod coordinator;
pub mod error;
pub mod relay;
pub mod stats;
pub mod workflow;

// Re-export commonly used types
pub use coordinator::{Coordinator, CoordinatorConfig, RunOptions};
pub use error::CoordinatorError;
pub use stats::{CoordinatorStats, ExecutionSummary, ProviderCallStats};
pub use workflow::{
    pick, Aggregator, AggregatorFn, Invocation, Step, SubTask, Task, Transform, TransformFn,
    WorkflowDefinition, WorkflowPlan,
};
