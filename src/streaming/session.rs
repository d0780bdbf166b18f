//! Stream session state.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Result delivered
    Completed,
    /// Non-recoverable error delivered
    Error,
    /// Cancelled through the API
    Cancelled,
    /// Client went away
    ClientDisconnect,
    /// Idle past the configured limit
    Timeout,
    /// Process shutting down
    Shutdown,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::Completed => "completed",
            CloseReason::Error => "error",
            CloseReason::Cancelled => "cancelled",
            CloseReason::ClientDisconnect => "client_disconnect",
            CloseReason::Timeout => "timeout",
            CloseReason::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "reason")]
pub enum SessionStatus {
    Active,
    Closed(CloseReason),
}

/// One open delivery channel
#[derive(Debug, Clone)]
pub struct StreamSession {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    /// Events delivered so far
    pub message_count: u64,
    pub last_activity: Instant,
    opened: Instant,
}

impl StreamSession {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            created_at: Utc::now(),
            status: SessionStatus::Active,
            message_count: 0,
            last_activity: now,
            opened: now,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == SessionStatus::Active
    }

    /// Record a delivered event
    pub fn touch(&mut self) {
        self.message_count += 1;
        self.last_activity = Instant::now();
    }

    /// Time since the last delivered event
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity)
    }

    /// Time since the session was opened
    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }

    /// Move to the terminal state; false if already terminal
    pub fn finish(&mut self, reason: CloseReason) -> bool {
        if !self.is_active() {
            return false;
        }
        self.status = SessionStatus::Closed(reason);
        true
    }
}

/// Serializable view of a session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub message_count: u64,
    pub idle_ms: u64,
}

impl From<&StreamSession> for SessionInfo {
    fn from(session: &StreamSession) -> Self {
        Self {
            id: session.id.clone(),
            created_at: session.created_at,
            status: session.status,
            message_count: session.message_count,
            idle_ms: session.idle_for(Instant::now()).as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_is_one_shot() {
        let mut session = StreamSession::new("s1");
        assert!(session.is_active());

        assert!(session.finish(CloseReason::ClientDisconnect));
        assert!(!session.finish(CloseReason::Completed));
        assert_eq!(
            session.status,
            SessionStatus::Closed(CloseReason::ClientDisconnect)
        );
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_value(SessionStatus::Closed(CloseReason::Timeout)).unwrap();
        assert_eq!(json["status"], "closed");
        assert_eq!(json["reason"], "timeout");
    }
}
