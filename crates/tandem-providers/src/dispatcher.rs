//! Provider dispatcher (C5), ported from `provider_chain.py`'s
//! `call_with_fallback`/`_call_provider`. Tries each candidate in a named
//! fallback chain in order, consulting [`CooldownTracker`] before each call
//! and recording failures against it, until one succeeds or the chain is
//! exhausted.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use tandem_types::{ContentBlock, FailureKind, ToolSchema};
use tokio_util::sync::CancellationToken;

use crate::{ChatMessage, ProviderRegistry, StreamChunk};
use crate::cooldown::CooldownTracker;

/// A prompt-prefix cache hint is only passed through for up to this many
/// blocks, matching `_call_anthropic`'s `existing_cache_blocks < 4` guard.
pub const MAX_CACHE_BLOCKS: usize = 4;

const CALL_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
}

#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub content: Vec<ContentBlock>,
    pub provider: String,
    pub model: String,
    pub usage: Usage,
    pub stop_reason: String,
}

#[derive(Debug, Clone)]
pub struct CandidateFailure {
    pub provider: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct ChainExhausted {
    pub chain: String,
    pub failures: Vec<CandidateFailure>,
}

impl std::fmt::Display for ChainExhausted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "all providers exhausted for chain `{}`: ", self.chain)?;
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{} ({})", failure.provider, failure.reason)?;
        }
        Ok(())
    }
}

impl std::error::Error for ChainExhausted {}

/// Named fallback chains. `tool_executor` requires structured tool-call
/// support; `text_reasoner` has no such requirement and is ordered
/// cheapest-first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Chain {
    ToolExecutor,
    TextReasoner,
}

impl Chain {
    pub fn name(self) -> &'static str {
        match self {
            Chain::ToolExecutor => "tool_executor",
            Chain::TextReasoner => "text_reasoner",
        }
    }
}

/// Dispatches `messages` against `candidates` (ordered provider ids) in
/// `chain`, consulting `cooldowns` before each attempt and recording the
/// outcome. Returns a normalized [`DispatchResponse`] or the aggregated
/// per-candidate failure list.
pub async fn dispatch(
    chain: Chain,
    candidates: &[String],
    registry: &ProviderRegistry,
    cooldowns: &CooldownTracker,
    messages: Vec<ChatMessage>,
    tools: Option<Vec<ToolSchema>>,
) -> Result<DispatchResponse, ChainExhausted> {
    let mut failures = Vec::new();

    for provider_id in candidates {
        let (available, reason) = cooldowns.is_available(provider_id);
        if !available {
            failures.push(CandidateFailure {
                provider: provider_id.clone(),
                reason: reason.unwrap_or_else(|| "cooling down".to_string()),
            });
            continue;
        }

        let call = registry.stream_for_provider(
            Some(provider_id.as_str()),
            None,
            messages.clone(),
            tools.clone(),
            CancellationToken::new(),
        );

        let result = tokio::time::timeout(CALL_TIMEOUT, call).await;
        match result {
            Err(_) => {
                cooldowns.mark_failure(provider_id, FailureKind::Other);
                failures.push(CandidateFailure {
                    provider: provider_id.clone(),
                    reason: "timed out".to_string(),
                });
            }
            Ok(Err(err)) => {
                let kind = classify_failure(&err.to_string());
                cooldowns.mark_failure(provider_id, kind);
                failures.push(CandidateFailure {
                    provider: provider_id.clone(),
                    reason: err.to_string(),
                });
            }
            Ok(Ok(stream)) => match collect_stream(stream).await {
                Ok((content, usage, stop_reason)) => {
                    cooldowns.mark_success(provider_id);
                    return Ok(DispatchResponse {
                        content,
                        provider: provider_id.clone(),
                        model: String::new(),
                        usage,
                        stop_reason,
                    });
                }
                Err(message) => {
                    let kind = classify_failure(&message);
                    cooldowns.mark_failure(provider_id, kind);
                    failures.push(CandidateFailure {
                        provider: provider_id.clone(),
                        reason: message,
                    });
                }
            },
        }
    }

    Err(ChainExhausted {
        chain: chain.name().to_string(),
        failures,
    })
}

async fn collect_stream(
    mut stream: std::pin::Pin<Box<dyn futures::Stream<Item = anyhow::Result<StreamChunk>> + Send>>,
) -> Result<(Vec<ContentBlock>, Usage, String), String> {
    let mut text = String::new();
    let mut tool_calls: HashMap<String, (String, String)> = HashMap::new();
    let mut order = Vec::new();
    let mut usage = Usage { input: 0, output: 0 };
    let mut stop_reason = "stop".to_string();

    while let Some(chunk) = stream.next().await {
        match chunk.map_err(|e| e.to_string())? {
            StreamChunk::TextDelta(delta) => text.push_str(&delta),
            StreamChunk::ReasoningDelta(_) => {}
            StreamChunk::ToolCallStart { id, name } => {
                order.push(id.clone());
                tool_calls.insert(id, (name, String::new()));
            }
            StreamChunk::ToolCallDelta { id, args_delta } => {
                if let Some(entry) = tool_calls.get_mut(&id) {
                    entry.1.push_str(&args_delta);
                }
            }
            StreamChunk::ToolCallEnd { .. } => {}
            StreamChunk::Done { finish_reason, usage: u } => {
                stop_reason = finish_reason;
                if let Some(u) = u {
                    usage.input = u.prompt_tokens;
                    usage.output = u.completion_tokens;
                }
            }
        }
    }

    let mut content = Vec::new();
    if !text.is_empty() {
        content.push(ContentBlock::text(text));
    }
    for id in order {
        if let Some((name, args)) = tool_calls.remove(&id) {
            let input = serde_json::from_str(&args).unwrap_or(serde_json::json!({}));
            content.push(ContentBlock::ToolUse { id, name, input });
        }
    }

    Ok((content, usage, stop_reason))
}

fn classify_failure(message: &str) -> FailureKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("billing") || lower.contains("credit") || lower.contains("insufficient_quota") {
        FailureKind::Billing
    } else if lower.contains("rate limit") || lower.contains("429") || lower.contains("too many requests") {
        FailureKind::RateLimit
    } else {
        FailureKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_billing_and_rate_limit_distinctly() {
        assert!(matches!(classify_failure("insufficient_quota: out of credit"), FailureKind::Billing));
        assert!(matches!(classify_failure("429 too many requests"), FailureKind::RateLimit));
        assert!(matches!(classify_failure("connection reset"), FailureKind::Other));
    }

    #[test]
    fn chain_exhausted_display_lists_all_failures() {
        let exhausted = ChainExhausted {
            chain: "tool_executor".to_string(),
            failures: vec![
                CandidateFailure { provider: "a".into(), reason: "cooling down".into() },
                CandidateFailure { provider: "b".into(), reason: "timed out".into() },
            ],
        };
        let message = exhausted.to_string();
        assert!(message.contains("tool_executor"));
        assert!(message.contains("cooling down"));
        assert!(message.contains("timed out"));
    }
}
