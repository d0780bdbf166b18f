//! Command-line interface for conduit.
//!
//! Provides commands for running workflows, streaming a single provider
//! operation, serving the HTTP API, and inspecting configuration.

use std::io::{self, IsTerminal, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use uuid::Uuid;

use crate::adapters::FabricProvider;
use crate::config::{self, ResolvedConfig};
use crate::core::{Coordinator, CoordinatorError, RunOptions, WorkflowDefinition};
use crate::domain::{UnitResult, WorkflowExecution};
use crate::metrics::TracingMetrics;
use crate::resilience::Resilience;
use crate::server::{self, AppState};
use crate::streaming::{ChannelTransport, EventKind, StreamingManager};

/// conduit - Resilient AI workflow coordinator
#[derive(Parser, Debug)]
#[command(name = "conduit")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a named workflow
    Run {
        /// Workflow name (loaded from the workflows directory)
        workflow: String,

        /// Input as JSON (plain text is wrapped as {"text": ...})
        #[arg(short, long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read input from a file
        #[arg(long)]
        input_file: Option<PathBuf>,

        /// Retry budget per unit
        #[arg(long)]
        max_retries: Option<u32>,
    },

    /// Stream a single provider operation to stdout
    Stream {
        /// Operation name (for fabric: the pattern)
        operation: String,

        /// Provider name
        #[arg(short, long, default_value = "fabric")]
        provider: String,

        /// Input as JSON (plain text is wrapped as {"text": ...})
        #[arg(short, long, conflicts_with = "input_file")]
        input: Option<String>,

        /// Read input from a file
        #[arg(long)]
        input_file: Option<PathBuf>,
    },

    /// Start the HTTP server
    Serve {
        /// Address to bind to (overrides config)
        #[arg(long, env = "CONDUIT_HOST")]
        host: Option<String>,

        /// Port to bind to (overrides config)
        #[arg(short, long, env = "CONDUIT_PORT")]
        port: Option<u16>,
    },

    /// List workflow definitions
    Workflows,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run {
                workflow,
                input,
                input_file,
                max_retries,
            } => run_workflow(&workflow, input, input_file, max_retries).await,
            Commands::Stream {
                operation,
                provider,
                input,
                input_file,
            } => stream_operation(&provider, &operation, input, input_file).await,
            Commands::Serve { host, port } => serve(host, port).await,
            Commands::Workflows => list_workflows().await,
            Commands::Config => show_config(),
        }
    }
}

/// Build the coordinator and stream manager from configuration
pub async fn bootstrap(cfg: &ResolvedConfig) -> Result<(Arc<Coordinator>, StreamingManager)> {
    let metrics = Arc::new(TracingMetrics);
    let resilience = Arc::new(Resilience::new(cfg.resilience.clone()));
    let coordinator = Arc::new(Coordinator::with_metrics(
        cfg.coordinator.clone(),
        resilience,
        metrics.clone(),
    ));

    let mut fabric = match &cfg.fabric.binary_path {
        Some(path) => FabricProvider::with_binary_path(path.clone()),
        None => FabricProvider::new(),
    };
    if let Some(timeout) = cfg.fabric.timeout {
        fabric = fabric.with_timeout(timeout);
    }
    coordinator.register_provider(Arc::new(fabric)).await;

    let workflows = WorkflowDefinition::load_dir(&cfg.workflows_dir)?;
    tracing::debug!(
        count = workflows.len(),
        dir = %cfg.workflows_dir.display(),
        "Loaded workflow definitions"
    );
    for workflow in workflows {
        coordinator.define_workflow(workflow).await?;
    }

    let streams = StreamingManager::with_metrics(cfg.streaming.clone(), metrics);
    Ok((coordinator, streams))
}

/// Resolve command input: inline JSON/text, a file, or piped stdin
fn read_input(inline: Option<String>, file: Option<PathBuf>) -> Result<Value> {
    let raw = if let Some(text) = inline {
        text
    } else if let Some(path) = file {
        std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read input file: {}", path.display()))?
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin()
            .read_to_string(&mut buffer)
            .context("Failed to read from stdin")?;
        buffer
    } else {
        anyhow::bail!("No input provided. Use --input, --input-file or pipe to stdin");
    };

    Ok(parse_input(&raw))
}

/// JSON if it parses, otherwise `{"text": raw}`
fn parse_input(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::json!({ "text": raw }))
}

/// Run a named workflow and print its result
async fn run_workflow(
    name: &str,
    input: Option<String>,
    input_file: Option<PathBuf>,
    max_retries: Option<u32>,
) -> Result<()> {
    let cfg = config::config()?;
    let (coordinator, _) = bootstrap(cfg).await?;
    let input = read_input(input, input_file)?;

    match coordinator
        .run_workflow_with(name, input, RunOptions { max_retries })
        .await
    {
        Ok(execution) => {
            let result = execution.result.clone().unwrap_or(Value::Null);
            println!("{}", serde_json::to_string_pretty(&result)?);
            if execution.success {
                eprintln!("\n[Execution {} completed in {}ms]", execution.id, execution.duration_ms);
            } else {
                for unit in execution.units.iter().filter(|u| !u.succeeded()) {
                    eprintln!("{}", describe_failure(unit));
                }
                eprintln!("\n[Execution {} finished with failures]", execution.id);
                std::process::exit(1);
            }
        }
        Err(CoordinatorError::ExecutionFailed { execution, source }) => {
            eprintln!("{}", failure_summary(&execution, &source.to_string()));
            std::process::exit(1);
        }
        Err(e) => return Err(e.into()),
    }

    Ok(())
}

fn describe_failure(unit: &UnitResult) -> String {
    format!(
        "  unit {} ({}.{}) failed: {}",
        unit.index,
        unit.provider,
        unit.operation,
        unit.error.as_deref().unwrap_or("unknown error")
    )
}

/// Report for a run that stopped on a failed unit
fn failure_summary(execution: &WorkflowExecution, cause: &str) -> String {
    match execution.first_failure() {
        Some(unit) => format!(
            "{}\n\n[Execution {} failed: {}]",
            describe_failure(unit),
            execution.id,
            cause
        ),
        None => format!("\n[Execution {} failed: {}]", execution.id, cause),
    }
}

/// Stream one provider operation, printing chunks as they arrive
async fn stream_operation(
    provider: &str,
    operation: &str,
    input: Option<String>,
    input_file: Option<PathBuf>,
) -> Result<()> {
    let cfg = config::config()?;
    let (coordinator, streams) = bootstrap(cfg).await?;
    let input = read_input(input, input_file)?;

    let session_id = Uuid::new_v4().to_string();
    let (transport, mut rx) = ChannelTransport::new(cfg.streaming.channel_capacity);
    streams.open(Arc::new(transport), session_id.clone()).await?;

    let relay = {
        let coordinator = coordinator.clone();
        let streams = streams.clone();
        let provider = provider.to_string();
        let operation = operation.to_string();
        let session_id = session_id.clone();
        tokio::spawn(async move {
            coordinator
                .stream_operation(&streams, &session_id, &provider, &operation, input)
                .await
        })
    };

    let mut failed = false;
    let mut stdout = io::stdout();
    loop {
        tokio::select! {
            event = rx.recv() => {
                let Some(event) = event else { break };
                match event.event {
                    EventKind::Chunk => {
                        let data = &event.data["data"];
                        match data.as_str() {
                            Some(text) => write!(stdout, "{}", text)?,
                            None => write!(stdout, "{}", data)?,
                        }
                        stdout.flush()?;
                    }
                    EventKind::Error => {
                        failed = true;
                        eprintln!("\n[Stream error: {}]", event.data["message"].as_str().unwrap_or("unknown"));
                    }
                    EventKind::Close => {
                        eprintln!("\n[Stream closed: {}]", event.data["reason"].as_str().unwrap_or("-"));
                    }
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                streams.cancel(&session_id).await;
            }
        }
    }

    relay.await.context("Stream relay task panicked")??;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Start the HTTP server
async fn serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    let cfg = config::config()?;
    let (coordinator, streams) = bootstrap(cfg).await?;

    let mut server_config = cfg.server.clone();
    if let Some(host) = host {
        server_config.host = host;
    }
    if let Some(port) = port {
        server_config.port = port;
    }

    server::serve(&server_config, AppState::new(coordinator, streams)).await
}

/// List workflow definitions
async fn list_workflows() -> Result<()> {
    let cfg = config::config()?;
    let workflows = WorkflowDefinition::load_dir(&cfg.workflows_dir)?;

    if workflows.is_empty() {
        println!("No workflows found in {}", cfg.workflows_dir.display());
        return Ok(());
    }

    println!("{:<28} {:<14} {:>5}  DESCRIPTION", "NAME", "STRATEGY", "UNITS");
    println!("{}", "-".repeat(72));
    for workflow in &workflows {
        println!(
            "{:<28} {:<14} {:>5}  {}",
            workflow.name,
            workflow.strategy(),
            workflow.plan.unit_count(),
            workflow.description.as_deref().unwrap_or("")
        );
    }

    Ok(())
}

/// Print the resolved configuration
fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("conduit configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:      {}", cfg.home.display());
    println!("  Workflows: {}", cfg.workflows_dir.display());
    println!();
    println!("Resilience:");
    println!("  Failure threshold: {}", cfg.resilience.breaker.failure_threshold);
    println!("  Reset timeout:     {}ms", cfg.resilience.breaker.reset_timeout_ms);
    println!("  Max retries:       {}", cfg.resilience.retry.max_retries);
    println!(
        "  Backoff:           {}ms x{} (cap {}ms, jitter {})",
        cfg.resilience.retry.base_delay_ms,
        cfg.resilience.retry.backoff_multiplier,
        cfg.resilience.retry.max_delay_ms,
        cfg.resilience.retry.jitter
    );
    println!();
    println!("Streaming:");
    println!("  Idle timeout:   {}ms", cfg.streaming.idle_timeout_ms);
    println!("  Cleanup every:  {}ms", cfg.streaming.cleanup_interval_ms);
    println!("  Partial every:  {} chunks", cfg.streaming.partial_every);
    println!("  Write timeout:  {}ms", cfg.streaming.write_timeout_ms);
    println!("  Max sessions:   {}", cfg.streaming.max_sessions);
    println!();
    println!("Server: {}:{}", cfg.server.host, cfg.server.port);
    println!("History limit: {}", cfg.coordinator.history_limit);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_input_json_or_text() {
        assert_eq!(parse_input(r#"{"x": 1}"#), json!({"x": 1}));
        assert_eq!(parse_input("hello world"), json!({"text": "hello world"}));
    }

    #[test]
    fn test_failure_summary_names_failed_unit() {
        use crate::domain::{Strategy, UnitStatus};

        let mut execution = WorkflowExecution::new(Uuid::new_v4(), None, Strategy::Hierarchical);
        execution.master = Some(UnitResult {
            index: 0,
            provider: "llm".to_string(),
            operation: "plan".to_string(),
            status: UnitStatus::Failed,
            duration_ms: 5,
            attempts: 2,
            input: json!({}),
            output: None,
            error: Some("quota exceeded".to_string()),
            error_kind: Some("RATE_LIMIT".to_string()),
        });

        let summary = failure_summary(&execution, "rate limited");
        assert!(summary.starts_with("  unit 0 (llm.plan) failed: quota exceeded"));
        assert!(summary.ends_with(&format!("[Execution {} failed: rate limited]", execution.id)));

        let empty = WorkflowExecution::new(Uuid::new_v4(), None, Strategy::Sequential);
        assert!(!failure_summary(&empty, "x").contains("unit"));
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::parse_from(["conduit", "run", "digest", "--input", "{}", "--max-retries", "2"]);
        match cli.command {
            Commands::Run {
                workflow,
                input,
                max_retries,
                ..
            } => {
                assert_eq!(workflow, "digest");
                assert_eq!(input.as_deref(), Some("{}"));
                assert_eq!(max_retries, Some(2));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_cli_stream_defaults_to_fabric() {
        let cli = Cli::parse_from(["conduit", "stream", "summarize", "-i", "text"]);
        assert!(matches!(
            cli.command,
            Commands::Stream { ref provider, .. } if provider == "fabric"
        ));
    }
}
