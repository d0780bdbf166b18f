//! Coordinator statistics and the recent-execution window.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::{Strategy, WorkflowExecution};

/// Call counters for one provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderCallStats {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    /// Attempts including retries
    pub attempts: u64,
}

/// One line of the recent-execution window
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionSummary {
    pub id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workflow_name: Option<String>,
    pub strategy: Strategy,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub success: bool,
}

impl From<&WorkflowExecution> for ExecutionSummary {
    fn from(execution: &WorkflowExecution) -> Self {
        Self {
            id: execution.id,
            workflow_name: execution.workflow_name.clone(),
            strategy: execution.strategy,
            started_at: execution.started_at,
            duration_ms: execution.duration_ms,
            success: execution.success,
        }
    }
}

/// Snapshot returned by `Coordinator::get_stats`
#[derive(Debug, Clone, Serialize)]
pub struct CoordinatorStats {
    pub total_executions: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub running: usize,
    pub by_strategy: BTreeMap<String, u64>,
    pub mean_duration_ms: f64,
    pub providers: BTreeMap<String, ProviderCallStats>,
    /// Most recent first
    pub recent: Vec<ExecutionSummary>,
}

/// Mutable accumulator behind the coordinator's stats lock
#[derive(Debug)]
pub(crate) struct StatsRecorder {
    history_limit: usize,
    history: VecDeque<WorkflowExecution>,
    total: u64,
    succeeded: u64,
    failed: u64,
    total_duration_ms: u64,
    by_strategy: BTreeMap<String, u64>,
    providers: HashMap<String, ProviderCallStats>,
}

impl StatsRecorder {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit,
            history: VecDeque::with_capacity(history_limit.min(1024)),
            total: 0,
            succeeded: 0,
            failed: 0,
            total_duration_ms: 0,
            by_strategy: BTreeMap::new(),
            providers: HashMap::new(),
        }
    }

    /// Count a finished execution and push it into the window
    pub fn record_execution(&mut self, execution: &WorkflowExecution) {
        self.total += 1;
        if execution.success {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.total_duration_ms += execution.duration_ms;
        *self
            .by_strategy
            .entry(execution.strategy.to_string())
            .or_insert(0) += 1;

        if self.history_limit == 0 {
            return;
        }
        while self.history.len() >= self.history_limit {
            self.history.pop_front();
        }
        self.history.push_back(execution.clone());
    }

    pub fn record_call(&mut self, provider: &str, success: bool, attempts: u32) {
        let stats = self.providers.entry(provider.to_string()).or_default();
        stats.calls += 1;
        stats.attempts += attempts as u64;
        if success {
            stats.successes += 1;
        } else {
            stats.failures += 1;
        }
    }

    pub fn reset_providers(&mut self) {
        self.providers.clear();
    }

    /// Finished execution still inside the window
    pub fn find(&self, id: Uuid) -> Option<&WorkflowExecution> {
        self.history.iter().rev().find(|e| e.id == id)
    }

    pub fn snapshot(&self, running: usize) -> CoordinatorStats {
        let mean_duration_ms = if self.total == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.total as f64
        };

        CoordinatorStats {
            total_executions: self.total,
            succeeded: self.succeeded,
            failed: self.failed,
            running,
            by_strategy: self.by_strategy.clone(),
            mean_duration_ms,
            providers: self
                .providers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            recent: self.history.iter().rev().map(ExecutionSummary::from).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(strategy: Strategy, success: bool) -> WorkflowExecution {
        let mut execution = WorkflowExecution::new(Uuid::new_v4(), None, strategy);
        execution.finish(None, success);
        execution.duration_ms = 10;
        execution
    }

    #[test]
    fn test_history_is_bounded() {
        let mut recorder = StatsRecorder::new(2);
        let first = finished(Strategy::Parallel, true);
        let first_id = first.id;
        recorder.record_execution(&first);
        recorder.record_execution(&finished(Strategy::Parallel, true));
        recorder.record_execution(&finished(Strategy::Sequential, false));

        assert!(recorder.find(first_id).is_none());
        let stats = recorder.snapshot(0);
        assert_eq!(stats.total_executions, 3);
        assert_eq!(stats.recent.len(), 2);
        assert!(!stats.recent[0].success);
        assert_eq!(stats.by_strategy["parallel"], 2);
        assert_eq!(stats.mean_duration_ms, 10.0);
    }

    #[test]
    fn test_provider_counters_reset() {
        let mut recorder = StatsRecorder::new(10);
        recorder.record_call("llm", true, 1);
        recorder.record_call("llm", false, 3);

        let stats = recorder.snapshot(0);
        assert_eq!(
            stats.providers["llm"],
            ProviderCallStats {
                calls: 2,
                successes: 1,
                failures: 1,
                attempts: 4,
            }
        );

        recorder.reset_providers();
        assert!(recorder.snapshot(0).providers.is_empty());
    }
}
