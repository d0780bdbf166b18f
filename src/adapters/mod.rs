//! Provider interfaces for external capability backends.
//!
//! A provider is a named unit exposing async operations over JSON values.
//! The coordinator holds providers as `Arc<dyn Provider>` and never looks
//! at what they compute, only at whether a call succeeded.

pub mod fabric;
pub mod function;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::Value;
use thiserror::Error;

use crate::resilience::ErrorKind;

// Re-export the bundled providers
pub use fabric::FabricProvider;
pub use function::FnProvider;

/// Incremental output of a streaming operation
pub type ChunkStream = BoxStream<'static, Result<Value, ProviderError>>;

/// Failure reported by a provider operation.
///
/// Carries whatever the backend told us: a message, optionally an HTTP-like
/// status code, and optionally an explicit kind when the provider knows
/// better than message inspection would.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ProviderError {
    /// Human-readable error message
    pub message: String,

    /// Status code reported by the backend (if any)
    pub status: Option<u16>,

    /// Kind asserted by the provider, bypassing classification
    pub kind: Option<ErrorKind>,
}

impl ProviderError {
    /// Create an error with just a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status: None,
            kind: None,
        }
    }

    /// Attach a status code
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach an explicit error kind
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// The provider does not expose the requested operation
    pub fn unsupported_operation(provider: &str, operation: &str) -> Self {
        Self::new(format!(
            "Provider '{}' does not support operation '{}'",
            provider, operation
        ))
        .with_kind(ErrorKind::BadRequest)
    }
}

/// Trait for capability providers
#[async_trait]
pub trait Provider: Send + Sync {
    /// Registry name of the provider
    fn name(&self) -> &str;

    /// Operations this provider advertises (informational)
    fn operations(&self) -> Vec<String> {
        Vec::new()
    }

    /// Invoke an operation and wait for its complete output
    async fn invoke(&self, operation: &str, input: Value) -> Result<Value, ProviderError>;

    /// Start an operation that yields output incrementally.
    ///
    /// The default delivers the whole `invoke` result as a single chunk.
    /// Dropping the returned stream must release any upstream work.
    async fn stream(&self, operation: &str, input: Value) -> Result<ChunkStream, ProviderError> {
        let output = self.invoke(operation, input).await?;
        Ok(stream::once(async move { Ok(output) }).boxed())
    }
}

/// Extract the text a text-oriented provider should work on.
///
/// Strings pass through, objects contribute their `text` field, anything
/// else is serialized as JSON.
pub fn input_text(input: &Value) -> String {
    match input {
        Value::String(s) => s.clone(),
        Value::Object(map) => match map.get("text") {
            Some(Value::String(text)) => text.clone(),
            _ => input.to_string(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
