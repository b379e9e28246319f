use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Engine progress event, fanned out on the run event bus. Property keys use
/// camelCase (`runID`, `taskID`, ...) for wire consumers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub event_type: String,
    pub properties: Value,
    pub timestamp: DateTime<Utc>,
}

impl RunEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
            timestamp: Utc::now(),
        }
    }
}
