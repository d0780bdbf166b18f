//! Workflow coordinator.
//!
//! Runs sequential, parallel and hierarchical compositions of registered
//! providers. Every provider call goes through the resilience layer;
//! every run gets a fresh execution id, and finished runs land in the
//! recent-history window.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::error::CoordinatorError;
use super::stats::{CoordinatorStats, StatsRecorder};
use super::workflow::{
    Aggregator, AggregatorFn, Invocation, Step, SubTask, Task, TransformFn, WorkflowDefinition,
    WorkflowPlan,
};
use crate::adapters::{Provider, ProviderError};
use crate::domain::{ExecutionStatus, UnitResult, UnitStatus, WorkflowExecution};
use crate::metrics::{MetricsSink, NoopMetrics};
use crate::resilience::{CallError, CallOptions, ErrorKind, Resilience};
use crate::streaming::StreamingManager;

/// Coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Finished executions kept for stats and status lookups
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_history_limit() -> usize {
    100
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

/// Per-run overrides
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    /// Retry budget for every unit of this run
    #[serde(default)]
    pub max_retries: Option<u32>,
}

/// Registry entries a run needs, captured once before it starts
struct Bindings {
    providers: HashMap<String, Arc<dyn Provider>>,
    transforms: HashMap<String, TransformFn>,
    aggregators: HashMap<String, AggregatorFn>,
}

/// Why a run stopped early
enum Abort {
    Call(CallError),
    Config(CoordinatorError),
}

impl From<CoordinatorError> for Abort {
    fn from(e: CoordinatorError) -> Self {
        Abort::Config(e)
    }
}

/// Reports per-unit progress onto a stream session
struct Progress<'a> {
    streams: &'a StreamingManager,
    session_id: &'a str,
    total: usize,
    done: AtomicUsize,
}

impl Progress<'_> {
    async fn unit_finished(&self, unit: &UnitResult) {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        let percent = if self.total == 0 {
            100.0
        } else {
            (done as f64 / self.total as f64 * 100.0).min(100.0)
        };
        let outcome = if unit.succeeded() { "succeeded" } else { "failed" };
        let message = format!("{}.{} {}", unit.provider, unit.operation, outcome);
        self.streams
            .progress(self.session_id, percent, Some(&message))
            .await;
    }
}

/// Main workflow coordinator
pub struct Coordinator {
    config: CoordinatorConfig,
    resilience: Arc<Resilience>,
    providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
    workflows: RwLock<HashMap<String, Arc<WorkflowDefinition>>>,
    transforms: RwLock<HashMap<String, TransformFn>>,
    aggregators: RwLock<HashMap<String, AggregatorFn>>,
    running: RwLock<HashMap<Uuid, DateTime<Utc>>>,
    stats: Mutex<StatsRecorder>,
    metrics: Arc<dyn MetricsSink>,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default(), Arc::new(Resilience::default()))
    }
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig, resilience: Arc<Resilience>) -> Self {
        Self::with_metrics(config, resilience, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(
        config: CoordinatorConfig,
        resilience: Arc<Resilience>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let stats = StatsRecorder::new(config.history_limit);
        Self {
            config,
            resilience,
            providers: RwLock::new(HashMap::new()),
            workflows: RwLock::new(HashMap::new()),
            transforms: RwLock::new(HashMap::new()),
            aggregators: RwLock::new(HashMap::new()),
            running: RwLock::new(HashMap::new()),
            stats: Mutex::new(stats),
            metrics,
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn resilience(&self) -> &Arc<Resilience> {
        &self.resilience
    }

    // ------------------------------------------------------------------
    // Registries
    // ------------------------------------------------------------------

    /// Register a provider, replacing any provider with the same name
    pub async fn register_provider(&self, provider: Arc<dyn Provider>) {
        let name = provider.name().to_string();
        if self
            .providers
            .write()
            .await
            .insert(name.clone(), provider)
            .is_some()
        {
            warn!(provider = %name, "Provider overwritten");
        } else {
            debug!(provider = %name, "Provider registered");
        }
    }

    pub async fn provider(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.read().await.get(name).cloned()
    }

    pub async fn provider_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Store a named workflow, replacing any with the same name
    pub async fn define_workflow(&self, definition: WorkflowDefinition) -> Result<(), CoordinatorError> {
        definition.validate()?;
        let name = definition.name.clone();
        if self
            .workflows
            .write()
            .await
            .insert(name.clone(), Arc::new(definition))
            .is_some()
        {
            warn!(workflow = %name, "Workflow definition overwritten");
        }
        Ok(())
    }

    pub async fn workflow(&self, name: &str) -> Option<Arc<WorkflowDefinition>> {
        self.workflows.read().await.get(name).cloned()
    }

    /// Defined workflows sorted by name
    pub async fn workflows(&self) -> Vec<Arc<WorkflowDefinition>> {
        let mut all: Vec<_> = self.workflows.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub async fn register_transform<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    {
        self.transforms.write().await.insert(name.into(), Arc::new(f));
    }

    pub async fn register_aggregator<F>(&self, name: impl Into<String>, f: F)
    where
        F: Fn(&Value, &[UnitResult]) -> Value + Send + Sync + 'static,
    {
        self.aggregators.write().await.insert(name.into(), Arc::new(f));
    }

    /// Resolve everything `plan` references, failing before any call
    async fn preflight(&self, plan: &WorkflowPlan) -> Result<Bindings, CoordinatorError> {
        let mut bindings = Bindings {
            providers: HashMap::new(),
            transforms: HashMap::new(),
            aggregators: HashMap::new(),
        };

        {
            let providers = self.providers.read().await;
            for name in plan.providers() {
                let provider = providers
                    .get(name)
                    .ok_or_else(|| CoordinatorError::UnknownProvider(name.to_string()))?;
                bindings.providers.insert(name.to_string(), provider.clone());
            }
        }

        {
            let transforms = self.transforms.read().await;
            for name in plan.transform_names() {
                let f = transforms
                    .get(name)
                    .ok_or_else(|| CoordinatorError::UnknownTransform(name.to_string()))?;
                bindings.transforms.insert(name.to_string(), f.clone());
            }
        }

        if let Some(name) = plan.aggregator_name() {
            let f = self
                .aggregators
                .read()
                .await
                .get(name)
                .cloned()
                .ok_or_else(|| CoordinatorError::UnknownAggregator(name.to_string()))?;
            bindings.aggregators.insert(name.to_string(), f);
        }

        Ok(bindings)
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Run steps in order; the first failure stops the run
    pub async fn run_sequential(
        &self,
        steps: Vec<Step>,
        input: Value,
    ) -> Result<WorkflowExecution, CoordinatorError> {
        let plan = WorkflowPlan::Sequential { steps };
        self.execute(Uuid::new_v4(), None, &plan, input, &RunOptions::default(), None)
            .await
    }

    /// Run tasks concurrently; failures are recorded per task
    pub async fn run_parallel(
        &self,
        tasks: Vec<Task>,
        shared_input: Value,
    ) -> Result<WorkflowExecution, CoordinatorError> {
        let plan = WorkflowPlan::Parallel { tasks };
        self.execute(
            Uuid::new_v4(),
            None,
            &plan,
            shared_input,
            &RunOptions::default(),
            None,
        )
        .await
    }

    /// Run the master, then fan its output out to the sub-tasks
    pub async fn run_hierarchical(
        &self,
        master: Invocation,
        sub_tasks: Vec<SubTask>,
        input: Value,
        aggregator: Option<Aggregator>,
    ) -> Result<WorkflowExecution, CoordinatorError> {
        let plan = WorkflowPlan::Hierarchical {
            master,
            sub_tasks,
            aggregator,
        };
        self.execute(Uuid::new_v4(), None, &plan, input, &RunOptions::default(), None)
            .await
    }

    /// Run a named workflow
    pub async fn run_workflow(
        &self,
        name: &str,
        input: Value,
    ) -> Result<WorkflowExecution, CoordinatorError> {
        self.run_workflow_with(name, input, RunOptions::default())
            .await
    }

    #[instrument(skip(self, input, options), fields(workflow = %name))]
    pub async fn run_workflow_with(
        &self,
        name: &str,
        input: Value,
        options: RunOptions,
    ) -> Result<WorkflowExecution, CoordinatorError> {
        let definition = self
            .workflow(name)
            .await
            .ok_or_else(|| CoordinatorError::UnknownWorkflow(name.to_string()))?;

        self.execute(
            Uuid::new_v4(),
            Some(definition.name.clone()),
            &definition.plan,
            input,
            &options,
            None,
        )
        .await
    }

    /// Start a named workflow in the background and return its id.
    ///
    /// Configuration errors are reported here; the run itself is looked
    /// up through `execution_status`.
    pub async fn submit(
        self: &Arc<Self>,
        name: &str,
        input: Value,
        options: RunOptions,
    ) -> Result<Uuid, CoordinatorError> {
        let definition = self
            .workflow(name)
            .await
            .ok_or_else(|| CoordinatorError::UnknownWorkflow(name.to_string()))?;
        self.preflight(&definition.plan).await?;

        let id = Uuid::new_v4();
        self.running.write().await.insert(id, Utc::now());
        info!(execution_id = %id, workflow = %name, "Workflow submitted");

        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let result = coordinator
                .execute(
                    id,
                    Some(definition.name.clone()),
                    &definition.plan,
                    input,
                    &options,
                    None,
                )
                .await;
            if let Err(e) = result {
                warn!(execution_id = %id, error = %e, "Submitted workflow failed");
            }
        });

        Ok(id)
    }

    /// Run a named workflow, reporting progress on a stream session
    pub async fn run_workflow_streamed(
        &self,
        name: &str,
        input: Value,
        streams: &StreamingManager,
        session_id: &str,
    ) -> Result<WorkflowExecution, CoordinatorError> {
        let definition = match self.workflow(name).await {
            Some(d) => d,
            None => {
                let err = CoordinatorError::UnknownWorkflow(name.to_string());
                streams.error(session_id, &err.to_string(), false).await;
                return Err(err);
            }
        };

        let id = Uuid::new_v4();
        streams
            .status(
                session_id,
                "running",
                Some(json!({ "workflowName": name, "workflowId": id })),
            )
            .await;

        let progress = Progress {
            streams,
            session_id,
            total: definition.plan.unit_count()
                + usize::from(matches!(definition.plan, WorkflowPlan::Hierarchical { .. })),
            done: AtomicUsize::new(0),
        };

        let result = self
            .execute(
                id,
                Some(definition.name.clone()),
                &definition.plan,
                input,
                &RunOptions::default(),
                Some(&progress),
            )
            .await;

        match &result {
            Ok(execution) => {
                streams
                    .complete(
                        session_id,
                        json!({
                            "workflowId": execution.id,
                            "success": execution.success,
                            "result": execution.result,
                            "duration": execution.duration_ms,
                        }),
                    )
                    .await;
            }
            Err(e) => {
                streams.error(session_id, &e.to_string(), false).await;
            }
        }
        result
    }

    /// Status of a running or recently finished execution
    pub async fn execution_status(&self, id: Uuid) -> ExecutionStatus {
        if let Some(started) = self.running.read().await.get(&id) {
            let elapsed = (Utc::now() - *started).num_milliseconds().max(0) as u64;
            return ExecutionStatus::Running {
                start_time: *started,
                elapsed_ms: elapsed,
            };
        }

        match self.stats.lock().await.find(id) {
            Some(execution) => ExecutionStatus::of(execution),
            None => ExecutionStatus::NotFound,
        }
    }

    /// Finished execution still inside the history window
    pub async fn execution(&self, id: Uuid) -> Option<WorkflowExecution> {
        self.stats.lock().await.find(id).cloned()
    }

    pub async fn get_stats(&self) -> CoordinatorStats {
        let running = self.running.read().await.len();
        self.stats.lock().await.snapshot(running)
    }

    pub async fn reset_provider_stats(&self) {
        self.stats.lock().await.reset_providers();
        info!("Provider call counters reset");
    }

    /// Count one guarded provider call
    pub(crate) async fn record_call(&self, provider: &str, success: bool, attempts: u32) {
        self.stats
            .lock()
            .await
            .record_call(provider, success, attempts);
    }

    // ------------------------------------------------------------------
    // Execution
    // ------------------------------------------------------------------

    async fn execute(
        &self,
        id: Uuid,
        name: Option<String>,
        plan: &WorkflowPlan,
        input: Value,
        options: &RunOptions,
        progress: Option<&Progress<'_>>,
    ) -> Result<WorkflowExecution, CoordinatorError> {
        let bindings = match self.preflight(plan).await {
            Ok(b) => b,
            Err(e) => {
                self.running.write().await.remove(&id);
                return Err(e);
            }
        };

        let mut execution = WorkflowExecution::new(id, name, plan.strategy());
        if let Some(started) = self.running.read().await.get(&id) {
            execution.started_at = *started;
        }
        self.running
            .write()
            .await
            .insert(id, execution.started_at);

        info!(
            execution_id = %id,
            workflow = execution.workflow_name.as_deref().unwrap_or("-"),
            strategy = %execution.strategy,
            units = plan.unit_count(),
            "Starting workflow execution"
        );

        let outcome = match plan {
            WorkflowPlan::Sequential { steps } => {
                self.sequential(&bindings, steps, input, &mut execution, options, progress)
                    .await
            }
            WorkflowPlan::Parallel { tasks } => {
                self.parallel(&bindings, tasks, input, &mut execution, options, progress)
                    .await;
                Ok(())
            }
            WorkflowPlan::Hierarchical {
                master,
                sub_tasks,
                aggregator,
            } => {
                self.hierarchical(
                    &bindings,
                    master,
                    sub_tasks,
                    aggregator.as_ref(),
                    input,
                    &mut execution,
                    options,
                    progress,
                )
                .await
            }
        };

        if !execution.is_finished() {
            execution.finish(None, false);
        }

        self.running.write().await.remove(&id);
        self.stats.lock().await.record_execution(&execution);
        self.metrics.increment(
            if execution.success {
                "workflow.succeeded"
            } else {
                "workflow.failed"
            },
            1,
        );
        self.metrics
            .histogram("workflow.duration_ms", execution.duration_ms as f64);

        match outcome {
            Ok(()) => {
                info!(
                    execution_id = %id,
                    success = execution.success,
                    duration_ms = execution.duration_ms,
                    "Workflow execution finished"
                );
                Ok(execution)
            }
            Err(Abort::Call(source)) => {
                error!(execution_id = %id, error = %source, "Workflow execution aborted");
                Err(CoordinatorError::ExecutionFailed {
                    execution: Box::new(execution),
                    source,
                })
            }
            Err(Abort::Config(e)) => Err(e),
        }
    }

    async fn sequential(
        &self,
        bindings: &Bindings,
        steps: &[Step],
        input: Value,
        execution: &mut WorkflowExecution,
        options: &RunOptions,
        progress: Option<&Progress<'_>>,
    ) -> Result<(), Abort> {
        let mut current = input;

        for (index, step) in steps.iter().enumerate() {
            let (unit, result) = self
                .invoke_unit(
                    bindings,
                    index,
                    &step.provider,
                    &step.operation,
                    current.clone(),
                    options,
                )
                .await;
            if let Some(p) = progress {
                p.unit_finished(&unit).await;
            }
            execution.units.push(unit);

            let output = result.map_err(Abort::Call)?;
            current = match &step.transform {
                Some(transform) => transform.apply(&output, &current, &bindings.transforms)?,
                None => output,
            };
        }

        execution.finish(Some(current), true);
        Ok(())
    }

    async fn parallel(
        &self,
        bindings: &Bindings,
        tasks: &[Task],
        shared_input: Value,
        execution: &mut WorkflowExecution,
        options: &RunOptions,
        progress: Option<&Progress<'_>>,
    ) {
        let invocations = tasks
            .iter()
            .map(|t| {
                let input = t.input.clone().unwrap_or_else(|| shared_input.clone());
                (t.provider.as_str(), t.operation.as_str(), input)
            })
            .collect();

        let units = self.fan_out(bindings, invocations, options, progress).await;
        let success = units.iter().all(UnitResult::succeeded);
        let result = Value::Array(units.iter().map(UnitResult::to_envelope).collect());

        execution.units = units;
        execution.finish(Some(result), success);
    }

    #[allow(clippy::too_many_arguments)]
    async fn hierarchical(
        &self,
        bindings: &Bindings,
        master: &Invocation,
        sub_tasks: &[SubTask],
        aggregator: Option<&Aggregator>,
        input: Value,
        execution: &mut WorkflowExecution,
        options: &RunOptions,
        progress: Option<&Progress<'_>>,
    ) -> Result<(), Abort> {
        let (unit, result) = self
            .invoke_unit(
                bindings,
                0,
                &master.provider,
                &master.operation,
                input.clone(),
                options,
            )
            .await;
        if let Some(p) = progress {
            p.unit_finished(&unit).await;
        }
        execution.master = Some(unit);
        let master_output = result.map_err(Abort::Call)?;

        let mut invocations = Vec::with_capacity(sub_tasks.len());
        for sub in sub_tasks {
            let sub_input = match &sub.input_transform {
                Some(t) => t.apply(&master_output, &input, &bindings.transforms)?,
                None => master_output.clone(),
            };
            invocations.push((sub.provider.as_str(), sub.operation.as_str(), sub_input));
        }

        let units = self.fan_out(bindings, invocations, options, progress).await;
        let success = units.iter().all(UnitResult::succeeded);
        let result = match aggregator {
            Some(a) => a.aggregate(&master_output, &units, &bindings.aggregators)?,
            None => Aggregator::default_envelope(&master_output, &units),
        };

        execution.units = units;
        execution.finish(Some(result), success);
        Ok(())
    }

    /// Invoke units concurrently; results keep invocation order
    async fn fan_out(
        &self,
        bindings: &Bindings,
        invocations: Vec<(&str, &str, Value)>,
        options: &RunOptions,
        progress: Option<&Progress<'_>>,
    ) -> Vec<UnitResult> {
        let futures = invocations
            .into_iter()
            .enumerate()
            .map(move |(index, (provider, operation, input))| async move {
                let (unit, _) = self
                    .invoke_unit(bindings, index, provider, operation, input, options)
                    .await;
                if let Some(p) = progress {
                    p.unit_finished(&unit).await;
                }
                unit
            });

        join_all(futures).await
    }

    /// One guarded provider call, recorded as a unit
    async fn invoke_unit(
        &self,
        bindings: &Bindings,
        index: usize,
        provider: &str,
        operation: &str,
        input: Value,
        options: &RunOptions,
    ) -> (UnitResult, Result<Value, CallError>) {
        let started = Instant::now();

        let result = match bindings.providers.get(provider) {
            Some(p) => {
                let call_options = CallOptions {
                    max_retries: options.max_retries,
                    cancel: None,
                };
                self.resilience
                    .execute_with_retry(provider, call_options, || {
                        let p = p.clone();
                        let input = input.clone();
                        async move { p.invoke(operation, input).await }
                    })
                    .await
            }
            None => Err(CallError::Failed {
                key: provider.to_string(),
                kind: ErrorKind::BadRequest,
                attempts: 0,
                source: ProviderError::new(format!("Unknown provider: {}", provider)),
            }),
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let (status, attempts, output, error, error_kind, result) = match result {
            Ok(outcome) => (
                UnitStatus::Succeeded,
                outcome.attempts,
                Some(outcome.value.clone()),
                None,
                None,
                Ok(outcome.value),
            ),
            Err(e) => {
                let kind = match &e {
                    CallError::Failed { kind, .. } => kind.as_str(),
                    CallError::CircuitOpen { .. } => "CIRCUIT_OPEN",
                    CallError::Cancelled { .. } => "CANCELLED",
                };
                (
                    UnitStatus::Failed,
                    e.attempts(),
                    None,
                    Some(e.to_string()),
                    Some(kind.to_string()),
                    Err(e),
                )
            }
        };

        self.record_call(provider, status == UnitStatus::Succeeded, attempts)
            .await;
        debug!(
            index,
            provider,
            operation,
            ?status,
            attempts,
            duration_ms,
            "Unit finished"
        );

        let unit = UnitResult {
            index,
            provider: provider.to_string(),
            operation: operation.to_string(),
            status,
            duration_ms,
            attempts,
            input,
            output,
            error,
            error_kind,
        };
        (unit, result)
    }
}
