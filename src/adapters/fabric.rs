//! Fabric provider for AI pattern execution.
//!
//! Calls the `fabric` CLI directly: the operation name is the pattern,
//! the input text is piped to stdin. Streaming mode reads stdout line by
//! line; the child is killed when the stream is dropped, so an abandoned
//! stream stops generating (and billing) immediately.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};
use tokio::time::timeout;
use tracing::debug;

use super::{input_text, ChunkStream, Provider, ProviderError};
use crate::resilience::ErrorKind;

/// Default per-call timeout for non-streaming invocations
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Fabric provider using subprocess mode
pub struct FabricProvider {
    /// Path to the fabric binary (default: "fabric")
    binary_path: String,

    /// Timeout for a complete (non-streaming) invocation
    call_timeout: Duration,
}

impl Default for FabricProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl FabricProvider {
    /// Create a Fabric provider with the default binary path
    ///
    /// Looks for fabric-ai first (Homebrew install), falls back to fabric
    pub fn new() -> Self {
        let binary_path = if std::process::Command::new("fabric-ai")
            .arg("--help")
            .output()
            .is_ok()
        {
            "fabric-ai".to_string()
        } else {
            "fabric".to_string()
        };

        Self {
            binary_path,
            call_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Create a Fabric provider with a custom binary path
    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            call_timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the invocation timeout
    pub fn with_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Spawn `fabric -p <pattern>` and feed it the input text
    async fn spawn(&self, pattern: &str, input: &str, streaming: bool) -> Result<Child, ProviderError> {
        let mut command = Command::new(&self.binary_path);
        command.args(["-p", pattern]);
        if streaming {
            command.arg("--stream");
        }

        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(if streaming { Stdio::null() } else { Stdio::piped() })
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProviderError::new(format!(
                    "Failed to spawn fabric process for pattern '{}': {}",
                    pattern, e
                ))
                .with_kind(ErrorKind::BadRequest)
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(input.as_bytes()).await.map_err(|e| {
                ProviderError::new(format!("Failed to write to fabric stdin: {}", e))
                    .with_kind(ErrorKind::Network)
            })?;
            // Dropping stdin signals EOF
        }

        Ok(child)
    }
}

#[async_trait]
impl Provider for FabricProvider {
    fn name(&self) -> &str {
        "fabric"
    }

    async fn invoke(&self, operation: &str, input: Value) -> Result<Value, ProviderError> {
        let child = self.spawn(operation, &input_text(&input), false).await?;

        let output = timeout(self.call_timeout, child.wait_with_output())
            .await
            .map_err(|_| {
                ProviderError::new(format!(
                    "Fabric pattern '{}' timed out after {:?}",
                    operation, self.call_timeout
                ))
                .with_kind(ErrorKind::Timeout)
            })?
            .map_err(|e| {
                ProviderError::new(format!(
                    "Failed to wait for fabric process for pattern '{}': {}",
                    operation, e
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProviderError::new(format!(
                "Fabric pattern '{}' failed with exit code {}: {}",
                operation,
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        let text = String::from_utf8(output.stdout).map_err(|_| {
            ProviderError::new("Fabric output is not valid UTF-8").with_kind(ErrorKind::Validation)
        })?;

        Ok(json!({ "text": text }))
    }

    async fn stream(&self, operation: &str, input: Value) -> Result<ChunkStream, ProviderError> {
        let mut child = self.spawn(operation, &input_text(&input), true).await?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ProviderError::new("Fabric process has no stdout").with_kind(ErrorKind::Network)
        })?;

        debug!(pattern = %operation, "Streaming fabric output");

        let state = LineState::Reading {
            lines: BufReader::new(stdout).lines(),
            child,
            pattern: operation.to_string(),
        };

        Ok(stream::unfold(state, next_line).boxed())
    }
}

/// Unfold state for the streaming reader; owns the child so it lives
/// (and is killed) together with the stream.
enum LineState {
    Reading {
        lines: Lines<BufReader<ChildStdout>>,
        child: Child,
        pattern: String,
    },
    Done,
}

async fn next_line(state: LineState) -> Option<(Result<Value, ProviderError>, LineState)> {
    let LineState::Reading {
        mut lines,
        mut child,
        pattern,
    } = state
    else {
        return None;
    };

    match lines.next_line().await {
        Ok(Some(line)) => Some((
            Ok(Value::String(format!("{}\n", line))),
            LineState::Reading {
                lines,
                child,
                pattern,
            },
        )),
        Ok(None) => match child.wait().await {
            Ok(status) if status.success() => None,
            Ok(status) => Some((
                Err(ProviderError::new(format!(
                    "Fabric pattern '{}' failed with exit code {}",
                    pattern,
                    status.code().unwrap_or(-1)
                ))),
                LineState::Done,
            )),
            Err(e) => Some((
                Err(ProviderError::new(format!(
                    "Failed to wait for fabric process for pattern '{}': {}",
                    pattern, e
                ))),
                LineState::Done,
            )),
        },
        Err(e) => Some((
            Err(ProviderError::new(format!("Failed to read fabric output: {}", e))
                .with_kind(ErrorKind::Network)),
            LineState::Done,
        )),
    }
}
