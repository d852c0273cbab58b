use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cooldown kinds and their durations, carried over from the provider
/// fallback chain's classification table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    Billing,
    RateLimit,
    Other,
}

impl FailureKind {
    pub fn cooldown_seconds(self) -> i64 {
        match self {
            FailureKind::Billing => 3600,
            FailureKind::RateLimit => 60,
            FailureKind::Other => 15,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownEntry {
    pub kind: FailureKind,
    pub until: DateTime<Utc>,
}

impl CooldownEntry {
    pub fn new(kind: FailureKind, now: DateTime<Utc>) -> Self {
        Self {
            kind,
            until: now + chrono::Duration::seconds(kind.cooldown_seconds()),
        }
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.until
    }
}
