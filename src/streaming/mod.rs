//! Streaming delivery of incremental results.
//!
//! This module contains:
//! - event: typed wire events
//! - session: per-connection state and close reasons
//! - transport: push channels (tokio channel, in-memory recorder)
//! - manager: session registry, emitters, idle cleanup and the
//!   cancellation-aware generation loop

pub mod event;
pub mod manager;
pub mod session;
pub mod transport;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use event::{EventKind, StreamEvent};
pub use manager::{PipeOutcome, StreamError, StreamStats, StreamingManager};
pub use session::{CloseReason, SessionInfo, SessionStatus, StreamSession};
pub use transport::{ChannelTransport, CloseHandler, RecordingTransport, Transport, TransportError};

/// Streaming configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Sessions idle longer than this are closed (default: 5 min)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// How often the idle reaper runs (default: 60s)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_ms: u64,

    /// Emit a `partial` event every N chunks (0 disables)
    #[serde(default = "default_partial_every")]
    pub partial_every: u64,

    /// Buffered events per channel transport
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// A write blocked longer than this counts as a disconnect (default: 5s)
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,

    /// Maximum concurrently open sessions
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
}

fn default_idle_timeout() -> u64 {
    300_000
}
fn default_cleanup_interval() -> u64 {
    60_000
}
fn default_partial_every() -> u64 {
    10
}
fn default_channel_capacity() -> usize {
    64
}
fn default_write_timeout() -> u64 {
    5_000
}
fn default_max_sessions() -> usize {
    1000
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            idle_timeout_ms: default_idle_timeout(),
            cleanup_interval_ms: default_cleanup_interval(),
            partial_every: default_partial_every(),
            channel_capacity: default_channel_capacity(),
            write_timeout_ms: default_write_timeout(),
            max_sessions: default_max_sessions(),
        }
    }
}

impl StreamingConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}
