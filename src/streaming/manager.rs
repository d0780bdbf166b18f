//! Stream session manager.
//!
//! Owns every open session, writes events only while a session is active,
//! and finalizes sessions exactly once whatever ends them: completion,
//! error, cancel, idle timeout or the client disconnecting. Closing a
//! session cancels its token, which is what stops the generation loop.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::event::{EventKind, StreamEvent};
use super::session::{CloseReason, SessionInfo, StreamSession};
use super::transport::{Transport, TransportError};
use super::StreamingConfig;
use crate::adapters::{ChunkStream, ProviderError};
use crate::metrics::{MetricsSink, NoopMetrics};

#[derive(Debug, Error)]
pub enum StreamError {
    #[error("Stream session already exists: {0}")]
    DuplicateSession(String),

    #[error("Too many concurrent streams (limit {0})")]
    TooManySessions(usize),
}

/// How a generation loop ended
#[derive(Debug)]
pub enum PipeOutcome {
    /// Upstream ran dry; `text` is the concatenated output
    Finished { chunks: u64, text: String },
    /// Session went terminal first; upstream was dropped
    Cancelled { chunks: u64 },
    /// Upstream yielded an error
    Failed { chunks: u64, error: ProviderError },
}

/// Streaming counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamStats {
    pub opened: u64,
    pub active: usize,
    pub completed: u64,
    pub errored: u64,
    pub cancelled: u64,
    pub client_disconnects: u64,
    pub timeouts: u64,
    pub shutdowns: u64,
    pub total_messages: u64,
    pub mean_duration_ms: f64,
}

#[derive(Default)]
struct StatsAccumulator {
    stats: StreamStats,
    closed: u64,
    total_duration_ms: u64,
}

impl StatsAccumulator {
    fn record_close(&mut self, reason: CloseReason, duration: Duration) {
        let counter = match reason {
            CloseReason::Completed => &mut self.stats.completed,
            CloseReason::Error => &mut self.stats.errored,
            CloseReason::Cancelled => &mut self.stats.cancelled,
            CloseReason::ClientDisconnect => &mut self.stats.client_disconnects,
            CloseReason::Timeout => &mut self.stats.timeouts,
            CloseReason::Shutdown => &mut self.stats.shutdowns,
        };
        *counter += 1;

        self.closed += 1;
        self.total_duration_ms += duration.as_millis() as u64;
        self.stats.mean_duration_ms = self.total_duration_ms as f64 / self.closed as f64;
    }
}

/// How long the `close` event may block before the transport is ended
const CLOSE_GRACE: Duration = Duration::from_millis(250);

struct SessionEntry {
    /// Lifecycle state; never held across a transport write
    session: Mutex<StreamSession>,
    /// Serializes writes so events keep their order
    writer: Mutex<()>,
    transport: Arc<dyn Transport>,
    cancel: CancellationToken,
}

enum Delivery {
    Written,
    Abandoned,
    Rejected(TransportError),
    Stalled,
}

impl SessionEntry {
    /// Write `event` unless the session closes first.
    ///
    /// Holds the write lock only, and gives up on cancel or after `limit`.
    async fn deliver(&self, event: &StreamEvent, limit: Duration) -> Delivery {
        let _writer = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Delivery::Abandoned,
            guard = self.writer.lock() => guard,
        };

        let written = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Delivery::Abandoned,
            written = tokio::time::timeout(limit, self.transport.write(event)) => written,
        };

        match written {
            Ok(Ok(())) => {
                self.session.lock().await.touch();
                Delivery::Written
            }
            Ok(Err(e)) => Delivery::Rejected(e),
            Err(_) => Delivery::Stalled,
        }
    }
}

struct Inner {
    config: StreamingConfig,
    sessions: RwLock<HashMap<String, Arc<SessionEntry>>>,
    stats: Mutex<StatsAccumulator>,
    metrics: Arc<dyn MetricsSink>,
}

/// Registry of open stream sessions. Cheap to clone.
#[derive(Clone)]
pub struct StreamingManager {
    inner: Arc<Inner>,
}

impl Default for StreamingManager {
    fn default() -> Self {
        Self::new(StreamingConfig::default())
    }
}

impl StreamingManager {
    pub fn new(config: StreamingConfig) -> Self {
        Self::with_metrics(config, Arc::new(NoopMetrics))
    }

    pub fn with_metrics(config: StreamingConfig, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sessions: RwLock::new(HashMap::new()),
                stats: Mutex::new(StatsAccumulator::default()),
                metrics,
            }),
        }
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.inner.config
    }

    /// Register a session on `transport` and send `connected`.
    ///
    /// The transport's close notification is wired to finalize the
    /// session with `client_disconnect`.
    #[instrument(skip(self, transport, session_id), fields(session_id = tracing::field::Empty))]
    pub async fn open(
        &self,
        transport: Arc<dyn Transport>,
        session_id: impl Into<String>,
    ) -> Result<SessionInfo, StreamError> {
        let id = session_id.into();
        tracing::Span::current().record("session_id", id.as_str());

        let entry = Arc::new(SessionEntry {
            session: Mutex::new(StreamSession::new(id.clone())),
            writer: Mutex::new(()),
            transport,
            cancel: CancellationToken::new(),
        });

        let active = {
            let mut sessions = self.inner.sessions.write().await;
            if sessions.contains_key(&id) {
                return Err(StreamError::DuplicateSession(id));
            }
            if sessions.len() >= self.inner.config.max_sessions {
                return Err(StreamError::TooManySessions(self.inner.config.max_sessions));
            }
            sessions.insert(id.clone(), entry.clone());
            sessions.len()
        };

        self.inner.stats.lock().await.stats.opened += 1;
        self.inner.metrics.increment("stream.opened", 1);
        self.inner.metrics.gauge("stream.active", active as f64);

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let hook_id = id.clone();
        entry
            .transport
            .on_close(Box::new(move || {
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        StreamingManager { inner }
                            .close(&hook_id, CloseReason::ClientDisconnect)
                            .await;
                    }
                })
            }))
            .await;

        info!("Stream session opened");
        self.emit(&id, EventKind::Connected, json!({ "sessionId": id }))
            .await;

        let info = SessionInfo::from(&*entry.session.lock().await);
        Ok(info)
    }

    async fn entry(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.inner.sessions.read().await.get(session_id).cloned()
    }

    /// Write one event if the session is active.
    ///
    /// Returns false for unknown or terminal sessions; a client can
    /// disconnect between two emits, so this is not an error.
    pub async fn emit(&self, session_id: &str, kind: EventKind, payload: Value) -> bool {
        let Some(entry) = self.entry(session_id).await else {
            debug!(session_id, event = %kind, "Emit to unknown session dropped");
            return false;
        };

        if !entry.session.lock().await.is_active() {
            debug!(session_id, event = %kind, "Emit to closed session dropped");
            return false;
        }

        let event = StreamEvent::new(kind, payload);
        match entry.deliver(&event, self.inner.config.write_timeout()).await {
            Delivery::Written => {}
            Delivery::Abandoned => {
                debug!(session_id, event = %kind, "Session closed during emit");
                return false;
            }
            Delivery::Rejected(e) => {
                debug!(session_id, event = %kind, error = %e, "Transport rejected event");
                return false;
            }
            Delivery::Stalled => {
                warn!(
                    session_id,
                    event = %kind,
                    timeout_ms = self.inner.config.write_timeout_ms,
                    "Client not reading, treating as disconnect"
                );
                self.close(session_id, CloseReason::ClientDisconnect).await;
                return false;
            }
        }

        self.inner.stats.lock().await.stats.total_messages += 1;
        true
    }

    pub async fn progress(&self, session_id: &str, percent: f64, message: Option<&str>) -> bool {
        let percent = percent.clamp(0.0, 100.0);
        self.emit(
            session_id,
            EventKind::Progress,
            json!({ "percent": percent, "message": message }),
        )
        .await
    }

    pub async fn status(&self, session_id: &str, state: &str, details: Option<Value>) -> bool {
        self.emit(
            session_id,
            EventKind::Status,
            json!({ "state": state, "details": details }),
        )
        .await
    }

    pub async fn chunk(&self, session_id: &str, data: Value, index: u64) -> bool {
        self.emit(
            session_id,
            EventKind::Chunk,
            json!({ "data": data, "index": index }),
        )
        .await
    }

    pub async fn partial(&self, session_id: &str, data: Value) -> bool {
        self.emit(session_id, EventKind::Partial, json!({ "data": data }))
            .await
    }

    /// Emit an `error` event; non-recoverable errors also close the session
    pub async fn error(&self, session_id: &str, message: &str, recoverable: bool) -> bool {
        let delivered = self
            .emit(
                session_id,
                EventKind::Error,
                json!({ "message": message, "recoverable": recoverable }),
            )
            .await;

        if !recoverable {
            self.close(session_id, CloseReason::Error).await;
        }
        delivered
    }

    /// Emit `complete` and close the session
    pub async fn complete(&self, session_id: &str, result: Value) -> bool {
        let delivered = self
            .emit(session_id, EventKind::Complete, json!({ "result": result }))
            .await;
        self.close(session_id, CloseReason::Completed).await;
        delivered
    }

    /// Cancel a session on request
    pub async fn cancel(&self, session_id: &str) -> bool {
        self.close(session_id, CloseReason::Cancelled).await
    }

    /// Finalize a session. Returns true only for the call that closed it.
    pub async fn close(&self, session_id: &str, reason: CloseReason) -> bool {
        let Some(entry) = self.entry(session_id).await else {
            debug!(session_id, %reason, "Close for unknown session ignored");
            return false;
        };

        // Stop generation before anything else
        entry.cancel.cancel();

        if !entry.session.lock().await.finish(reason) {
            debug!(session_id, %reason, "Session already closed");
            return false;
        }

        let (duration, messages) = {
            // In-flight emits see the cancel and release the writer
            let _writer = entry.writer.lock().await;
            let (duration, messages) = {
                let session = entry.session.lock().await;
                (session.age(), session.message_count)
            };

            let event = StreamEvent::new(
                EventKind::Close,
                json!({
                    "reason": reason,
                    "duration_ms": duration.as_millis() as u64,
                    "message_count": messages,
                }),
            );
            match tokio::time::timeout(CLOSE_GRACE, entry.transport.write(&event)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!(session_id, error = %e, "Close event not delivered"),
                Err(_) => debug!(session_id, "Close event not delivered, client not reading"),
            }
            entry.transport.end().await;
            (duration, messages)
        };

        let active = {
            let mut sessions = self.inner.sessions.write().await;
            sessions.remove(session_id);
            sessions.len()
        };

        self.inner.stats.lock().await.record_close(reason, duration);
        self.inner
            .metrics
            .increment(&format!("stream.closed.{}", reason), 1);
        self.inner
            .metrics
            .histogram("stream.duration_ms", duration.as_millis() as f64);
        self.inner.metrics.gauge("stream.active", active as f64);

        info!(
            session_id,
            %reason,
            duration_ms = duration.as_millis() as u64,
            messages,
            "Stream session closed"
        );
        true
    }

    /// Close sessions idle for longer than `max_age`; returns how many
    pub async fn cleanup_idle(&self, max_age: Duration) -> usize {
        let entries: Vec<(String, Arc<SessionEntry>)> = self
            .inner
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.clone()))
            .collect();

        let now = Instant::now();
        let mut stale = Vec::new();
        for (id, entry) in entries {
            // Busy sessions are not idle
            let Ok(session) = entry.session.try_lock() else {
                continue;
            };
            if session.is_active() && session.idle_for(now) > max_age {
                stale.push(id);
            }
        }

        let mut closed = 0;
        for id in stale {
            if self.close(&id, CloseReason::Timeout).await {
                closed += 1;
            }
        }

        if closed > 0 {
            info!(closed, "Closed idle stream sessions");
        }
        closed
    }

    /// Run `cleanup_idle` every `interval` until the manager is dropped
    pub fn spawn_idle_reaper(&self, interval: Duration, max_age: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                StreamingManager { inner }.cleanup_idle(max_age).await;
            }
        })
    }

    /// Close every open session with `shutdown`
    pub async fn shutdown(&self) -> usize {
        let mut closed = 0;
        for id in self.list_active_ids().await {
            if self.close(&id, CloseReason::Shutdown).await {
                closed += 1;
            }
        }
        closed
    }

    /// Token cancelled when the session closes
    pub async fn cancellation_token(&self, session_id: &str) -> Option<CancellationToken> {
        self.entry(session_id).await.map(|e| e.cancel.clone())
    }

    pub async fn is_active(&self, session_id: &str) -> bool {
        match self.entry(session_id).await {
            Some(entry) => entry.session.lock().await.is_active(),
            None => false,
        }
    }

    pub async fn session(&self, session_id: &str) -> Option<SessionInfo> {
        let entry = self.entry(session_id).await?;
        let session = entry.session.lock().await;
        Some(SessionInfo::from(&*session))
    }

    pub async fn list_active_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn get_stats(&self) -> StreamStats {
        let mut stats = self.inner.stats.lock().await.stats.clone();
        stats.active = self.inner.sessions.read().await.len();
        stats
    }

    /// Forward upstream chunks to the session until the upstream ends or
    /// the session goes terminal.
    ///
    /// Liveness is checked before every chunk is requested and raced
    /// against the pending chunk, so a disconnect stops consumption
    /// without waiting for the next token. Returning drops `chunks`.
    pub async fn pipe(&self, session_id: &str, mut chunks: ChunkStream) -> PipeOutcome {
        let Some(token) = self.cancellation_token(session_id).await else {
            return PipeOutcome::Cancelled { chunks: 0 };
        };

        let partial_every = self.inner.config.partial_every;
        let mut index: u64 = 0;
        let mut text = String::new();

        loop {
            if token.is_cancelled() {
                info!(session_id, chunks = index, "Session closed, stopping generation");
                return PipeOutcome::Cancelled { chunks: index };
            }

            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!(session_id, chunks = index, "Session closed mid-chunk, stopping generation");
                    return PipeOutcome::Cancelled { chunks: index };
                }
                next = chunks.next() => next,
            };

            match next {
                None => return PipeOutcome::Finished { chunks: index, text },
                Some(Ok(chunk)) => {
                    append_text(&mut text, &chunk);
                    if !self.chunk(session_id, chunk, index).await {
                        return PipeOutcome::Cancelled { chunks: index };
                    }
                    index += 1;

                    if partial_every > 0 && index % partial_every == 0 {
                        self.partial(session_id, json!({ "text": text, "chunks": index }))
                            .await;
                    }
                }
                Some(Err(error)) => {
                    warn!(session_id, chunks = index, error = %error, "Upstream stream failed");
                    return PipeOutcome::Failed {
                        chunks: index,
                        error,
                    };
                }
            }
        }
    }
}

fn append_text(text: &mut String, chunk: &Value) {
    match chunk {
        Value::String(s) => text.push_str(s),
        Value::Object(map) => match map.get("text") {
            Some(Value::String(s)) => text.push_str(s),
            _ => text.push_str(&chunk.to_string()),
        },
        other => text.push_str(&other.to_string()),
    }
}
