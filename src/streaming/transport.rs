//! Push transports that stream sessions write to.
//!
//! A transport accepts events in order, reports a one-shot close
//! notification when the client goes away, and can be ended by us.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::event::StreamEvent;

/// Callback run once when the client side of a transport closes
pub type CloseHandler = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport closed")]
    Closed,
}

/// Push channel to a single client
#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver one event
    async fn write(&self, event: &StreamEvent) -> Result<(), TransportError>;

    /// Register the handler to run when the client disconnects
    async fn on_close(&self, handler: CloseHandler);

    /// Release the transport from our side
    async fn end(&self);
}

/// Transport backed by a bounded tokio channel.
///
/// The receiving half is handed to whatever drives the wire (an SSE
/// response body, a test). Dropping the receiver counts as a disconnect.
pub struct ChannelTransport {
    sender: Mutex<Option<mpsc::Sender<StreamEvent>>>,
    ended: CancellationToken,
}

impl ChannelTransport {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let transport = Self {
            sender: Mutex::new(Some(tx)),
            ended: CancellationToken::new(),
        };
        (transport, rx)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn write(&self, event: &StreamEvent) -> Result<(), TransportError> {
        let sender = self.sender.lock().await.clone();
        match sender {
            Some(tx) => tx.send(event.clone()).await.map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn on_close(&self, handler: CloseHandler) {
        let Some(tx) = self.sender.lock().await.clone() else {
            return;
        };
        let ended = self.ended.clone();

        // The watcher holds a sender clone, so it must exit on `end()` or
        // the receiver would never see the channel close.
        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {
                    debug!("Channel transport receiver dropped");
                    handler().await;
                }
                _ = ended.cancelled() => {}
            }
        });
    }

    async fn end(&self) {
        self.sender.lock().await.take();
        self.ended.cancel();
    }
}

/// In-memory transport that records every event.
///
/// Writes always succeed, including after a simulated disconnect, so a
/// test can observe exactly what the session tried to deliver.
#[derive(Default)]
pub struct RecordingTransport {
    events: Mutex<Vec<StreamEvent>>,
    handler: Mutex<Option<CloseHandler>>,
    ended: AtomicBool,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far
    pub async fn events(&self) -> Vec<StreamEvent> {
        self.events.lock().await.clone()
    }

    /// Whether `end()` has been called
    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    /// Simulate the client going away; runs the close handler once
    pub async fn disconnect(&self) {
        let handler = self.handler.lock().await.take();
        if let Some(handler) = handler {
            handler().await;
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn write(&self, event: &StreamEvent) -> Result<(), TransportError> {
        self.events.lock().await.push(event.clone());
        Ok(())
    }

    async fn on_close(&self, handler: CloseHandler) {
        *self.handler.lock().await = Some(handler);
    }

    async fn end(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}
