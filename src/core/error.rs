//! Coordinator errors.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::WorkflowExecution;
use crate::resilience::CallError;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("Unknown strategy '{strategy}' in workflow '{workflow}'")]
    UnknownStrategy { workflow: String, strategy: String },

    #[error("Unknown transform: {0}")]
    UnknownTransform(String),

    #[error("Unknown aggregator: {0}")]
    UnknownAggregator(String),

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    /// A unit failed and stopped the run; carries the partial execution
    #[error("Workflow execution {} failed: {source}", .execution.id)]
    ExecutionFailed {
        execution: Box<WorkflowExecution>,
        #[source]
        source: CallError,
    },
}

impl CoordinatorError {
    /// Id of the execution this error belongs to, if one was started
    pub fn execution_id(&self) -> Option<Uuid> {
        self.execution().map(|e| e.id)
    }

    pub fn execution(&self) -> Option<&WorkflowExecution> {
        match self {
            CoordinatorError::ExecutionFailed { execution, .. } => Some(execution),
            _ => None,
        }
    }
}
