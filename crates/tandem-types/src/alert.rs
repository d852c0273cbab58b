use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRecord {
    pub timestamp: DateTime<Utc>,
    pub level: AlertLevel,
    pub component: String,
    pub message: String,
    #[serde(default)]
    pub details: Value,
}

impl AlertRecord {
    pub fn new(level: AlertLevel, component: impl Into<String>, message: impl Into<String>, details: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
            details,
        }
    }
}
