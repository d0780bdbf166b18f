//! Single-operation streaming: one provider stream relayed onto one
//! stream session.
//!
//! The resilience layer guards opening the upstream stream; once chunks
//! flow, the session owns the connection and its cancellation token is
//! what stops generation when the client goes away.

use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use super::coordinator::Coordinator;
use super::error::CoordinatorError;
use crate::adapters::ProviderError;
use crate::resilience::{CallError, CallOptions};
use crate::streaming::{PipeOutcome, StreamingManager};

impl Coordinator {
    /// Stream `provider.operation(input)` onto an open session.
    ///
    /// Ends the session with `complete` on success and a non-recoverable
    /// `error` on failure. A session closed from the other side just
    /// stops generation.
    #[instrument(skip(self, streams, input), fields(provider = %provider, operation = %operation))]
    pub async fn stream_operation(
        &self,
        streams: &StreamingManager,
        session_id: &str,
        provider: &str,
        operation: &str,
        input: Value,
    ) -> Result<PipeOutcome, CoordinatorError> {
        let Some(upstream) = self.provider(provider).await else {
            let err = CoordinatorError::UnknownProvider(provider.to_string());
            streams.error(session_id, &err.to_string(), false).await;
            return Err(err);
        };

        let Some(token) = streams.cancellation_token(session_id).await else {
            info!(session_id, "Session gone before streaming started");
            return Ok(PipeOutcome::Cancelled { chunks: 0 });
        };

        streams
            .status(
                session_id,
                "started",
                Some(json!({ "provider": provider, "operation": operation })),
            )
            .await;

        let opened = self
            .resilience()
            .execute_with_retry(
                provider,
                CallOptions::default().with_cancel(token),
                || {
                    let upstream = upstream.clone();
                    let input = input.clone();
                    async move { upstream.stream(operation, input).await }
                },
            )
            .await;

        let (chunks, attempts) = match opened {
            Ok(outcome) => (outcome.value, outcome.attempts),
            Err(CallError::Cancelled { attempts, .. }) => {
                info!(session_id, attempts, "Session closed while opening stream");
                return Ok(PipeOutcome::Cancelled { chunks: 0 });
            }
            Err(e) => {
                self.record_call(provider, false, e.attempts()).await;
                streams.error(session_id, &e.to_string(), false).await;
                let error = match e {
                    CallError::Failed { source, .. } => source,
                    other => ProviderError::new(other.to_string()),
                };
                return Ok(PipeOutcome::Failed { chunks: 0, error });
            }
        };

        let outcome = streams.pipe(session_id, chunks).await;
        match &outcome {
            PipeOutcome::Finished { chunks, text } => {
                self.record_call(provider, true, attempts).await;
                streams
                    .complete(session_id, json!({ "text": text, "chunks": chunks }))
                    .await;
            }
            PipeOutcome::Cancelled { chunks } => {
                // Upstream delivered until the client left
                self.record_call(provider, true, attempts).await;
                info!(session_id, chunks, "Generation stopped by session close");
            }
            PipeOutcome::Failed { chunks, error } => {
                warn!(session_id, chunks, error = %error, "Stream broke mid-generation");
                self.resilience().record_failure(provider).await;
                self.record_call(provider, false, attempts).await;
                streams.error(session_id, &error.message, false).await;
            }
        }

        Ok(outcome)
    }
}
