//! Workflow executions and per-unit results.
//!
//! An execution is built up while a workflow runs and frozen once it
//! finishes. Finished executions are kept in the coordinator's recent
//! history window; nothing here is persisted.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Composition strategy of a workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Sequential,
    Parallel,
    Hierarchical,
}

impl Strategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::Sequential => "sequential",
            Strategy::Parallel => "parallel",
            Strategy::Hierarchical => "hierarchical",
        }
    }

    /// Parse a strategy tag; `None` for anything unrecognised
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "sequential" => Some(Strategy::Sequential),
            "parallel" => Some(Strategy::Parallel),
            "hierarchical" => Some(Strategy::Hierarchical),
            _ => None,
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one unit (step, task, master or sub-task)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    Succeeded,
    Failed,
}

/// Result of invoking one provider operation inside a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitResult {
    /// Position of the unit in its definition
    pub index: usize,
    pub provider: String,
    pub operation: String,
    pub status: UnitStatus,
    pub duration_ms: u64,

    /// Attempts made, retries included
    pub attempts: u32,

    pub input: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Classified kind, `CIRCUIT_OPEN` or `CANCELLED`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<String>,
}

impl UnitResult {
    pub fn succeeded(&self) -> bool {
        self.status == UnitStatus::Succeeded
    }

    /// Compact view used in aggregated results
    pub fn to_envelope(&self) -> Value {
        match self.status {
            UnitStatus::Succeeded => json!({
                "provider": self.provider,
                "operation": self.operation,
                "success": true,
                "output": self.output,
            }),
            UnitStatus::Failed => json!({
                "provider": self.provider,
                "operation": self.operation,
                "success": false,
                "error": self.error,
                "errorKind": self.error_kind,
            }),
        }
    }
}

/// A single run of a workflow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: Uuid,

    /// Name of the definition, absent for ad-hoc runs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,

    pub strategy: Strategy,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,

    /// Steps, tasks or sub-tasks in definition order
    pub units: Vec<UnitResult>,

    /// Master unit of a hierarchical run
    #[serde(skip_serializing_if = "Option::is_none")]
    pub master: Option<UnitResult>,

    pub result: Option<Value>,
    pub success: bool,
}

impl WorkflowExecution {
    pub fn new(id: Uuid, workflow_name: Option<String>, strategy: Strategy) -> Self {
        Self {
            id,
            workflow_name,
            strategy,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: 0,
            units: Vec::new(),
            master: None,
            result: None,
            success: false,
        }
    }

    /// Freeze the execution with its final result
    pub fn finish(&mut self, result: Option<Value>, success: bool) {
        let now = Utc::now();
        self.duration_ms = (now - self.started_at).num_milliseconds().max(0) as u64;
        self.completed_at = Some(now);
        self.result = result;
        self.success = success;
    }

    pub fn is_finished(&self) -> bool {
        self.completed_at.is_some()
    }

    /// First failed unit, master included
    pub fn first_failure(&self) -> Option<&UnitResult> {
        self.master
            .iter()
            .chain(self.units.iter())
            .find(|u| !u.succeeded())
    }
}

/// Lookup result for an execution id
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running {
        #[serde(rename = "startTime")]
        start_time: DateTime<Utc>,
        #[serde(rename = "duration")]
        elapsed_ms: u64,
    },
    Completed {
        #[serde(rename = "startTime")]
        start_time: DateTime<Utc>,
        #[serde(rename = "duration")]
        duration_ms: u64,
    },
    Failed {
        #[serde(rename = "startTime")]
        start_time: DateTime<Utc>,
        #[serde(rename = "duration")]
        duration_ms: u64,
    },
    NotFound,
}

impl ExecutionStatus {
    /// Status of a finished execution
    pub fn of(execution: &WorkflowExecution) -> Self {
        if execution.success {
            ExecutionStatus::Completed {
                start_time: execution.started_at,
                duration_ms: execution.duration_ms,
            }
        } else {
            ExecutionStatus::Failed {
                start_time: execution.started_at,
                duration_ms: execution.duration_ms,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(status: UnitStatus) -> UnitResult {
        UnitResult {
            index: 0,
            provider: "llm".to_string(),
            operation: "summarize".to_string(),
            status,
            duration_ms: 3,
            attempts: 1,
            input: json!({}),
            output: (status == UnitStatus::Succeeded).then(|| json!("ok")),
            error: (status == UnitStatus::Failed).then(|| "boom".to_string()),
            error_kind: (status == UnitStatus::Failed).then(|| "SERVER_ERROR".to_string()),
        }
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(Strategy::parse("parallel"), Some(Strategy::Parallel));
        assert_eq!(Strategy::parse("round_robin"), None);
    }

    #[test]
    fn test_envelope_shapes() {
        let ok = unit(UnitStatus::Succeeded).to_envelope();
        assert_eq!(ok["success"], true);
        assert_eq!(ok["output"], "ok");

        let failed = unit(UnitStatus::Failed).to_envelope();
        assert_eq!(failed["success"], false);
        assert_eq!(failed["errorKind"], "SERVER_ERROR");
    }

    #[test]
    fn test_first_failure_checks_master() {
        let mut execution = WorkflowExecution::new(Uuid::new_v4(), None, Strategy::Hierarchical);
        execution.master = Some(unit(UnitStatus::Failed));
        execution.units.push(unit(UnitStatus::Succeeded));

        assert_eq!(execution.first_failure().unwrap().error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_status_serialization() {
        let status = serde_json::to_value(ExecutionStatus::NotFound).unwrap();
        assert_eq!(status, json!({"status": "not_found"}));

        let mut execution = WorkflowExecution::new(Uuid::new_v4(), None, Strategy::Parallel);
        execution.finish(Some(json!([])), true);
        let status = serde_json::to_value(ExecutionStatus::of(&execution)).unwrap();
        assert_eq!(status["status"], "completed");
        assert!(status.get("startTime").is_some());
    }
}
