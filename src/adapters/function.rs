//! Closure-backed provider.
//!
//! Lets embedders (and tests) register operations as async closures
//! without writing a dedicated `Provider` impl.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use serde_json::Value;

use super::{ChunkStream, Provider, ProviderError};

type OperationFn = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ProviderError>> + Send + Sync>;
type StreamFn = Arc<dyn Fn(Value) -> ChunkStream + Send + Sync>;

/// Provider whose operations are plain async closures
pub struct FnProvider {
    name: String,
    operations: HashMap<String, OperationFn>,
    streams: HashMap<String, StreamFn>,
}

impl FnProvider {
    /// Create an empty provider
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            operations: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    /// Add a request/response operation
    pub fn with_operation<F, Fut>(mut self, operation: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ProviderError>> + Send + 'static,
    {
        self.operations
            .insert(operation.into(), Arc::new(move |input| Box::pin(f(input))));
        self
    }

    /// Add a streaming operation
    pub fn with_stream<F>(mut self, operation: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> ChunkStream + Send + Sync + 'static,
    {
        self.streams.insert(operation.into(), Arc::new(f));
        self
    }
}

#[async_trait]
impl Provider for FnProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn operations(&self) -> Vec<String> {
        let mut ops: Vec<String> = self
            .operations
            .keys()
            .chain(self.streams.keys())
            .cloned()
            .collect();
        ops.sort();
        ops.dedup();
        ops
    }

    async fn invoke(&self, operation: &str, input: Value) -> Result<Value, ProviderError> {
        match self.operations.get(operation) {
            Some(op) => op(input).await,
            None => Err(ProviderError::unsupported_operation(&self.name, operation)),
        }
    }

    async fn stream(&self, operation: &str, input: Value) -> Result<ChunkStream, ProviderError> {
        if let Some(stream_fn) = self.streams.get(operation) {
            return Ok(stream_fn(input));
        }
        let output = self.invoke(operation, input).await?;
        Ok(stream::once(async move { Ok(output) }).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_invoke_registered_operation() {
        let provider = FnProvider::new("math")
            .with_operation("double", |input: Value| async move {
                let x = input["x"].as_i64().unwrap_or(0);
                Ok(json!({ "x": x * 2 }))
            });

        let out = provider.invoke("double", json!({"x": 21})).await.unwrap();
        assert_eq!(out, json!({"x": 42}));
        assert_eq!(provider.operations(), vec!["double".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_operation_fails() {
        let provider = FnProvider::new("empty");
        let err = provider.invoke("missing", Value::Null).await.unwrap_err();
        assert!(err.message.contains("missing"));
    }

    #[tokio::test]
    async fn test_stream_falls_back_to_invoke() {
        let provider = FnProvider::new("echo")
            .with_operation("say", |input: Value| async move { Ok(input) });

        let chunks: Vec<_> = provider
            .stream("say", json!("hi"))
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].as_ref().unwrap(), &json!("hi"));
    }
}
