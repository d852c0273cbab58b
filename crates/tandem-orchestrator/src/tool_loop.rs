//! Tool-use loop (C6): the core `call_agent` primitive every phase driver
//! calls into. A tool-free call is a single `text_reasoner` round trip; a
//! tool-bearing call drives the `tool_executor` chain in a loop, feeding
//! tool results back as conversation turns, capped at 30 iterations.

use serde_json::Value;
use tandem_providers::{dispatch, Chain, ChainExhausted, CooldownTracker, ProviderRegistry};
use tandem_providers::ChatMessage;
use tandem_tools::ToolRegistry;
use tandem_types::ContentBlock;

use crate::cost_ledger::CostLedger;
use crate::error::OrchestratorError;

const MAX_ITERATIONS: usize = 30;

#[derive(Debug, Clone, serde::Serialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub input: Value,
    pub output: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AgentCallResult {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
    pub tool_calls: Vec<ToolCallRecord>,
    pub cost_usd: f64,
    pub cap_reached: bool,
}

pub struct ToolLoop<'a> {
    pub providers: &'a ProviderRegistry,
    pub cooldowns: &'a CooldownTracker,
    pub cost_ledger: &'a CostLedger,
    pub tools: &'a ToolRegistry,
    pub tool_executor_chain: &'a [String],
    pub text_reasoner_chain: &'a [String],
}

impl<'a> ToolLoop<'a> {
    pub async fn call_agent(
        &self,
        role: &str,
        project: &str,
        model: &str,
        prompt: &str,
        allowed_tools: &[String],
    ) -> Result<AgentCallResult, OrchestratorError> {
        if allowed_tools.is_empty() {
            return self.call_text_reasoner(role, project, model, prompt).await;
        }

        let mut messages = vec![ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        }];
        let mut tool_calls = Vec::new();
        let mut accumulated_text = String::new();
        let mut total_in = 0u64;
        let mut total_out = 0u64;
        let mut total_cost = 0.0;

        let schemas = self.tools.list().await;
        let tool_schemas: Vec<_> = schemas
            .into_iter()
            .filter(|schema| allowed_tools.iter().any(|name| name == &schema.name))
            .collect();

        for _iteration in 0..MAX_ITERATIONS {
            let response = dispatch(
                Chain::ToolExecutor,
                self.tool_executor_chain,
                self.providers,
                self.cooldowns,
                messages.clone(),
                Some(tool_schemas.clone()),
            )
            .await
            .map_err(exhausted_to_error)?;

            let cost = self
                .cost_ledger
                .record(project, role, model, response.usage.input, response.usage.output)
                .await;
            total_cost += cost;
            total_in += response.usage.input;
            total_out += response.usage.output;

            let mut text_blocks = Vec::new();
            let mut tool_use_blocks = Vec::new();
            for block in &response.content {
                match block {
                    ContentBlock::Text { text } => text_blocks.push(text.clone()),
                    ContentBlock::ToolUse { id, name, input } => {
                        tool_use_blocks.push((id.clone(), name.clone(), input.clone()))
                    }
                    ContentBlock::ToolResult { .. } => {}
                }
            }
            accumulated_text = text_blocks.join("\n");

            if tool_use_blocks.is_empty() {
                return Ok(AgentCallResult {
                    text: accumulated_text,
                    tokens_in: total_in,
                    tokens_out: total_out,
                    tool_calls,
                    cost_usd: total_cost,
                    cap_reached: false,
                });
            }

            let mut assistant_summary = String::new();
            let mut tool_result_summary = String::new();
            for (id, name, input) in tool_use_blocks {
                let result = match self.tools.execute(&name, input.clone()).await {
                    Ok(result) => result.output,
                    Err(err) => format!("Error: {err}"),
                };
                assistant_summary.push_str(&format!("[tool_use id={id} name={name} input={input}]\n"));
                tool_result_summary.push_str(&format!("[tool_result id={id}] {}\n", truncate(&result, 2000)));
                tool_calls.push(ToolCallRecord {
                    name,
                    input,
                    output: result,
                });
            }

            messages.push(ChatMessage {
                role: "assistant".to_string(),
                content: format!("{accumulated_text}\n{assistant_summary}"),
            });
            messages.push(ChatMessage {
                role: "user".to_string(),
                content: tool_result_summary,
            });
        }

        tool_calls.push(ToolCallRecord {
            name: "_cap".to_string(),
            input: serde_json::json!({"cap_reached": true}),
            output: String::new(),
        });
        Ok(AgentCallResult {
            text: accumulated_text,
            tokens_in: total_in,
            tokens_out: total_out,
            tool_calls,
            cost_usd: total_cost,
            cap_reached: true,
        })
    }

    async fn call_text_reasoner(
        &self,
        role: &str,
        project: &str,
        model: &str,
        prompt: &str,
    ) -> Result<AgentCallResult, OrchestratorError> {
        let messages = vec![ChatMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        }];
        let response = dispatch(
            Chain::TextReasoner,
            self.text_reasoner_chain,
            self.providers,
            self.cooldowns,
            messages,
            None,
        )
        .await
        .map_err(exhausted_to_error)?;

        let cost = self
            .cost_ledger
            .record(project, role, model, response.usage.input, response.usage.output)
            .await;

        let text = response
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(AgentCallResult {
            text,
            tokens_in: response.usage.input,
            tokens_out: response.usage.output,
            tool_calls: Vec::new(),
            cost_usd: cost,
            cap_reached: false,
        })
    }
}

fn exhausted_to_error(err: ChainExhausted) -> OrchestratorError {
    OrchestratorError::AllProvidersExhausted {
        chain: err.chain.clone(),
        last_error: err.to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut truncated: String = text.chars().take(max_chars).collect();
        truncated.push_str("...[truncated]");
        truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_leaves_short_text_untouched() {
        assert_eq!(truncate("short", 2000), "short");
    }

    #[test]
    fn truncate_caps_long_text() {
        let long = "a".repeat(3000);
        let truncated = truncate(&long, 2000);
        assert!(truncated.ends_with("...[truncated]"));
        assert!(truncated.len() < long.len());
    }
}
