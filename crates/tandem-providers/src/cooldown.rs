//! Provider cooldown tracker (C2), ported from `provider_chain.py`'s
//! `ProviderCooldownTracker`. The dispatcher consults this from inside its
//! candidate loop, so every operation here is synchronous — no awaits in the
//! critical section.

use std::collections::HashMap;
use std::sync::Mutex;

use tandem_types::{CooldownEntry, FailureKind};

#[derive(Debug, Clone)]
pub struct CooldownStatus {
    pub provider: String,
    pub kind: Option<FailureKind>,
    pub seconds_remaining: i64,
}

pub struct CooldownTracker {
    entries: Mutex<HashMap<String, CooldownEntry>>,
}

impl CooldownTracker {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// `(available, reason)` — `reason` is `None` when available, otherwise a
    /// human-readable cooldown explanation. Lazily evicts the entry if its
    /// cooldown has already elapsed.
    pub fn is_available(&self, provider: &str) -> (bool, Option<String>) {
        let now = chrono::Utc::now();
        let mut entries = self.entries.lock().expect("cooldown mutex poisoned");
        match entries.get(provider) {
            Some(entry) if !entry.expired(now) => {
                let remaining = (entry.until - now).num_seconds().max(0);
                (
                    false,
                    Some(format!(
                        "{provider} cooling down ({:?}, {remaining}s remaining)",
                        entry.kind
                    )),
                )
            }
            Some(_) => {
                entries.remove(provider);
                (true, None)
            }
            None => (true, None),
        }
    }

    pub fn mark_failure(&self, provider: &str, kind: FailureKind) {
        let now = chrono::Utc::now();
        let mut entries = self.entries.lock().expect("cooldown mutex poisoned");
        entries.insert(provider.to_string(), CooldownEntry::new(kind, now));
    }

    pub fn mark_success(&self, provider: &str) {
        let mut entries = self.entries.lock().expect("cooldown mutex poisoned");
        entries.remove(provider);
    }

    pub fn status(&self) -> Vec<CooldownStatus> {
        let now = chrono::Utc::now();
        let entries = self.entries.lock().expect("cooldown mutex poisoned");
        entries
            .iter()
            .map(|(provider, entry)| CooldownStatus {
                provider: provider.clone(),
                kind: Some(entry.kind),
                seconds_remaining: (entry.until - now).num_seconds().max(0),
            })
            .collect()
    }
}

impl Default for CooldownTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_marks_unavailable_with_kind_specific_duration() {
        let tracker = CooldownTracker::new();
        tracker.mark_failure("anthropic", FailureKind::RateLimit);
        let (available, reason) = tracker.is_available("anthropic");
        assert!(!available);
        assert!(reason.unwrap().contains("anthropic"));
    }

    #[test]
    fn success_clears_cooldown() {
        let tracker = CooldownTracker::new();
        tracker.mark_failure("openai", FailureKind::Other);
        tracker.mark_success("openai");
        assert!(tracker.is_available("openai").0);
    }

    #[test]
    fn unseen_provider_is_available() {
        let tracker = CooldownTracker::new();
        assert!(tracker.is_available("never-seen").0);
    }

    #[test]
    fn billing_cooldown_is_one_hour() {
        let tracker = CooldownTracker::new();
        tracker.mark_failure("openai", FailureKind::Billing);
        let status = tracker.status();
        let entry = status.iter().find(|s| s.provider == "openai").unwrap();
        assert!(entry.seconds_remaining > 3500);
    }
}
