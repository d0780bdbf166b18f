//! Streaming Integration Tests
//!
//! Session lifecycle, exactly-once close, and generation stopping when
//! the client goes away.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use conduit::adapters::{ChunkStream, FnProvider};
use conduit::core::Coordinator;
use conduit::streaming::{
    ChannelTransport, CloseReason, EventKind, PipeOutcome, RecordingTransport, StreamEvent,
    StreamingConfig, StreamingManager,
};
use futures::stream::{self, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;

/// Sets a flag when the upstream stream is dropped
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Yields `chunks`, then never finishes
fn hanging_stream(chunks: Vec<&'static str>, dropped: Arc<AtomicBool>) -> ChunkStream {
    let guard = DropFlag(dropped);
    stream::iter(chunks.into_iter().map(|c| Ok(json!(c))))
        .chain(stream::pending())
        .map(move |item| {
            let _ = &guard;
            item
        })
        .boxed()
}

fn closes(events: &[StreamEvent]) -> Vec<&StreamEvent> {
    events.iter().filter(|e| e.event == EventKind::Close).collect()
}

fn count(events: &[StreamEvent], kind: EventKind) -> usize {
    events.iter().filter(|e| e.event == kind).count()
}

async fn wait_for_chunks(transport: &RecordingTransport, n: usize) {
    for _ in 0..1000 {
        if count(&transport.events().await, EventKind::Chunk) >= n {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("never saw {} chunks", n);
}

#[tokio::test]
async fn test_close_is_exactly_once() {
    let streams = StreamingManager::default();
    let transport = Arc::new(RecordingTransport::new());
    streams.open(transport.clone(), "s1").await.unwrap();

    assert!(streams.complete("s1", json!("done")).await);
    assert!(!streams.close("s1", CloseReason::Cancelled).await);
    assert!(!streams.cancel("s1").await);
    transport.disconnect().await;

    let events = transport.events().await;
    let closes = closes(&events);
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].data["reason"], "completed");
    assert_eq!(closes[0].data["message_count"], 2);
    assert!(transport.is_ended());

    // Nothing is written after close
    assert!(!streams.chunk("s1", json!("late"), 0).await);
    assert_eq!(transport.events().await.len(), events.len());
    assert_eq!(streams.get_stats().await.completed, 1);
}

#[tokio::test]
async fn test_disconnect_before_generation_sends_nothing() {
    let coordinator = Coordinator::default();
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = dropped.clone();
    coordinator
        .register_provider(Arc::new(FnProvider::new("llm").with_stream(
            "chat",
            move |_| hanging_stream(vec!["never"], flag.clone()),
        )))
        .await;

    let streams = StreamingManager::default();
    let transport = Arc::new(RecordingTransport::new());
    streams.open(transport.clone(), "early").await.unwrap();
    transport.disconnect().await;

    let outcome = coordinator
        .stream_operation(&streams, "early", "llm", "chat", json!({}))
        .await
        .unwrap();
    assert!(matches!(outcome, PipeOutcome::Cancelled { chunks: 0 }));

    let events = transport.events().await;
    assert_eq!(count(&events, EventKind::Chunk), 0);
    let closes = closes(&events);
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].data["reason"], "client_disconnect");
    assert_eq!(streams.get_stats().await.client_disconnects, 1);
}

#[tokio::test]
async fn test_disconnect_mid_stream_stops_generation() {
    let coordinator = Arc::new(Coordinator::default());
    let dropped = Arc::new(AtomicBool::new(false));
    let flag = dropped.clone();
    coordinator
        .register_provider(Arc::new(FnProvider::new("llm").with_stream(
            "chat",
            move |_| hanging_stream(vec!["Hel", "lo"], flag.clone()),
        )))
        .await;

    let streams = StreamingManager::default();
    let transport = Arc::new(RecordingTransport::new());
    streams.open(transport.clone(), "mid").await.unwrap();

    let relay = {
        let coordinator = coordinator.clone();
        let streams = streams.clone();
        tokio::spawn(async move {
            coordinator
                .stream_operation(&streams, "mid", "llm", "chat", json!({"text": "hi"}))
                .await
        })
    };

    wait_for_chunks(&transport, 2).await;
    transport.disconnect().await;

    let outcome = tokio::time::timeout(Duration::from_secs(5), relay)
        .await
        .expect("relay stops after disconnect")
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, PipeOutcome::Cancelled { chunks: 2 }));
    assert!(dropped.load(Ordering::SeqCst));

    let events = transport.events().await;
    assert_eq!(count(&events, EventKind::Chunk), 2);
    assert_eq!(count(&events, EventKind::Complete), 0);
    let closes = closes(&events);
    assert_eq!(closes.len(), 1);
    assert_eq!(closes[0].data["reason"], "client_disconnect");
    assert!(!streams.is_active("mid").await);

    // The opened upstream still counts as one successful call
    let stats = coordinator.get_stats().await;
    assert_eq!(stats.providers["llm"].calls, 1);
    assert_eq!(stats.providers["llm"].successes, 1);
}

#[tokio::test]
async fn test_relay_delivers_chunks_in_order() {
    let coordinator = Coordinator::default();
    coordinator
        .register_provider(Arc::new(FnProvider::new("llm").with_stream("chat", |_| {
            stream::iter(vec![
                Ok(json!("a")),
                Ok(json!({"text": "b"})),
                Ok(json!("c")),
            ])
            .boxed()
        })))
        .await;

    let streams = StreamingManager::new(StreamingConfig {
        partial_every: 2,
        ..StreamingConfig::default()
    });
    let transport = Arc::new(RecordingTransport::new());
    streams.open(transport.clone(), "ok").await.unwrap();

    let outcome = coordinator
        .stream_operation(&streams, "ok", "llm", "chat", Value::Null)
        .await
        .unwrap();
    assert!(matches!(outcome, PipeOutcome::Finished { chunks: 3, ref text } if text == "abc"));

    let events = transport.events().await;
    let kinds: Vec<EventKind> = events.iter().map(|e| e.event).collect();
    assert_eq!(
        kinds,
        vec![
            EventKind::Connected,
            EventKind::Status,
            EventKind::Chunk,
            EventKind::Chunk,
            EventKind::Partial,
            EventKind::Chunk,
            EventKind::Complete,
            EventKind::Close,
        ]
    );
    let indexes: Vec<&Value> = events
        .iter()
        .filter(|e| e.event == EventKind::Chunk)
        .map(|e| &e.data["index"])
        .collect();
    assert_eq!(indexes, vec![&json!(0), &json!(1), &json!(2)]);
    assert_eq!(events[6].data["result"]["text"], "abc");
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_closes_idle_sessions() {
    let streams = StreamingManager::default();
    let idle = Arc::new(RecordingTransport::new());
    let busy = Arc::new(RecordingTransport::new());
    streams.open(idle.clone(), "idle").await.unwrap();
    streams.open(busy.clone(), "busy").await.unwrap();

    tokio::time::advance(Duration::from_secs(40)).await;
    streams.progress("busy", 50.0, None).await;
    tokio::time::advance(Duration::from_secs(30)).await;

    let closed = streams.cleanup_idle(Duration::from_secs(60)).await;
    assert_eq!(closed, 1);
    assert_eq!(streams.list_active_ids().await, vec!["busy".to_string()]);

    let events = idle.events().await;
    assert_eq!(closes(&events)[0].data["reason"], "timeout");
    assert_eq!(streams.get_stats().await.timeouts, 1);
}

#[tokio::test]
async fn test_dropped_receiver_is_client_disconnect() {
    let streams = StreamingManager::default();
    let (transport, mut rx) = ChannelTransport::new(8);
    streams.open(Arc::new(transport), "sse").await.unwrap();

    let token = streams.cancellation_token("sse").await.unwrap();
    let connected = rx.recv().await.unwrap();
    assert_eq!(connected.event, EventKind::Connected);
    assert_eq!(connected.data["sessionId"], "sse");

    drop(rx);
    tokio::time::timeout(Duration::from_secs(5), token.cancelled())
        .await
        .expect("session cancelled after receiver drop");

    assert!(!streams.is_active("sse").await);
    assert_eq!(streams.get_stats().await.client_disconnects, 1);
}

#[tokio::test]
async fn test_shutdown_closes_everything() {
    let streams = StreamingManager::default();
    let a = Arc::new(RecordingTransport::new());
    let b = Arc::new(RecordingTransport::new());
    streams.open(a.clone(), "a").await.unwrap();
    streams.open(b.clone(), "b").await.unwrap();

    assert_eq!(streams.shutdown().await, 2);
    assert!(streams.list_active_ids().await.is_empty());
    for t in [a, b] {
        assert_eq!(closes(&t.events().await)[0].data["reason"], "shutdown");
    }
}

#[tokio::test]
async fn test_unread_client_does_not_block_cleanup_or_close() {
    let streams = StreamingManager::default();
    // `connected` fills the single slot and the receiver is never read
    let (transport, _rx) = ChannelTransport::new(1);
    streams.open(Arc::new(transport), "slow").await.unwrap();

    let writer = {
        let streams = streams.clone();
        tokio::spawn(async move { streams.chunk("slow", json!("blocked"), 0).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    timeout(Duration::from_secs(2), streams.cleanup_idle(Duration::ZERO))
        .await
        .expect("idle sweep is not blocked by a pending write");
    timeout(Duration::from_secs(2), streams.close("slow", CloseReason::Cancelled))
        .await
        .expect("close is not blocked by a pending write");

    assert!(streams.list_active_ids().await.is_empty());
    let delivered = timeout(Duration::from_secs(2), writer)
        .await
        .expect("pending write abandoned")
        .unwrap();
    assert!(!delivered);
}
