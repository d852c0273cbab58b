use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single entry published on the event bus. Consumers (hooks, phase event
/// logs, SSE bridges) key off `event_type` and read whatever they need out of
/// `properties`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineEvent {
    pub event_type: String,
    pub properties: Value,
    pub at: DateTime<Utc>,
}

impl EngineEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
            at: Utc::now(),
        }
    }
}
