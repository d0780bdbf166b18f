//! Typed events delivered over a stream session.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Names of the events a session can carry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Connected,
    Status,
    Progress,
    Chunk,
    Partial,
    Error,
    Complete,
    Close,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Connected => "connected",
            EventKind::Status => "status",
            EventKind::Progress => "progress",
            EventKind::Chunk => "chunk",
            EventKind::Partial => "partial",
            EventKind::Error => "error",
            EventKind::Complete => "complete",
            EventKind::Close => "close",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One event on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub event: EventKind,

    /// JSON payload
    pub data: Value,

    /// Emission time in milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl StreamEvent {
    /// Create an event stamped with the current time
    pub fn new(event: EventKind, data: Value) -> Self {
        Self {
            event,
            data,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    /// Payload as sent to the client: object payloads gain a `timestamp`
    /// field, anything else is wrapped as `{ value, timestamp }`.
    pub fn wire_data(&self) -> Value {
        match &self.data {
            Value::Object(map) => {
                let mut map = map.clone();
                map.insert("timestamp".to_string(), json!(self.timestamp));
                Value::Object(map)
            }
            other => json!({ "value": other, "timestamp": self.timestamp }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_data_adds_timestamp() {
        let event = StreamEvent::new(EventKind::Progress, json!({"percent": 50}));
        let wire = event.wire_data();
        assert_eq!(wire["percent"], 50);
        assert_eq!(wire["timestamp"], json!(event.timestamp));
    }

    #[test]
    fn test_wire_data_wraps_scalars() {
        let event = StreamEvent::new(EventKind::Chunk, json!("hello"));
        assert_eq!(event.wire_data()["value"], "hello");
    }

}
