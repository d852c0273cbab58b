//! Declarative workflow engine (C13), ported from `workflow_engine.py`'s
//! dataclass shapes (`WorkflowStatus`/`TaskStatus`/`TaskType`/
//! `TaskDefinition`/`TaskExecution`/`WorkflowDefinition`/
//! `WorkflowExecution`). Unlike the five-phase pipeline in `pipeline.rs`,
//! a workflow is an arbitrary task graph: each task names its successor
//! (`next_task`) or, for a `parallel` task, a set of sibling ids to run
//! concurrently before continuing.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tandem_core::DataRoot;

use crate::retry::calculate_backoff;
use crate::retry::RetryPolicy;
use crate::tool_loop::ToolLoop;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Running,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Done,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    AgentCall,
    HttpRequest,
    Conditional,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub task_type: TaskType,
    #[serde(default)]
    pub params: Value,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_retry_backoff_s")]
    pub retry_backoff_s: u64,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub skip_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_task: Option<String>,
}

fn default_retry_backoff_s() -> u64 {
    2
}

fn default_timeout_seconds() -> u64 {
    120
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskExecution {
    pub task_id: String,
    pub status: TaskStatus,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub start_task: String,
    pub tasks: Vec<TaskDefinition>,
}

impl WorkflowDefinition {
    fn task(&self, id: &str) -> Option<&TaskDefinition> {
        self.tasks.iter().find(|t| t.id == id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub task_executions: HashMap<String, TaskExecution>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Runs `definition` to completion (or until an unskippable task fails),
/// following `next_task` links starting at `start_task`. `tool_loop` backs
/// `agent_call` tasks; `http_client` backs `http_request` tasks. The
/// execution record is persisted under `data_root` after every task
/// completes, using the same per-step JSON structure `pipeline.rs` uses for
/// job progress, so a crashed workflow leaves a readable partial record.
pub async fn run(
    definition: &WorkflowDefinition,
    tool_loop: &ToolLoop<'_>,
    http_client: &reqwest::Client,
    data_root: &DataRoot,
) -> WorkflowExecution {
    let mut execution = WorkflowExecution {
        workflow_id: definition.id.clone(),
        status: WorkflowStatus::Running,
        task_executions: HashMap::new(),
        started_at: Utc::now(),
        finished_at: None,
    };
    persist_execution(data_root, &execution).await;

    let mut cursor = Some(definition.start_task.clone());
    while let Some(task_id) = cursor {
        let Some(task) = definition.task(&task_id) else {
            execution.status = WorkflowStatus::Failed;
            break;
        };

        let result = run_task(task, definition, tool_loop, http_client).await;
        let failed = matches!(result.status, TaskStatus::Failed);
        cursor = task.next_task.clone();
        execution.task_executions.insert(task_id.clone(), result);
        persist_execution(data_root, &execution).await;

        if failed && !task.skip_on_error {
            execution.status = WorkflowStatus::Failed;
            execution.finished_at = Some(Utc::now());
            persist_execution(data_root, &execution).await;
            return execution;
        }
    }

    execution.status = WorkflowStatus::Done;
    execution.finished_at = Some(Utc::now());
    persist_execution(data_root, &execution).await;
    execution
}

async fn persist_execution(data_root: &DataRoot, execution: &WorkflowExecution) {
    let path = data_root.workflow_execution_file(&execution.workflow_id);
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    if let Ok(raw) = serde_json::to_string_pretty(execution) {
        let _ = tokio::fs::write(&path, raw).await;
    }
}

async fn run_task(
    task: &TaskDefinition,
    definition: &WorkflowDefinition,
    tool_loop: &ToolLoop<'_>,
    http_client: &reqwest::Client,
) -> TaskExecution {
    let started_at = Utc::now();
    let policy = RetryPolicy {
        max_retries: task.retry_count,
        base_delay: Duration::from_secs(task.retry_backoff_s),
        max_delay: Duration::from_secs(task.retry_backoff_s.max(1) * 10),
        jitter: true,
    };

    let mut attempts = 0;
    let mut last_error = None;
    for attempt in 0..=task.retry_count {
        attempts = attempt + 1;
        let timeout = Duration::from_secs(task.timeout_seconds);
        let outcome = tokio::time::timeout(timeout, execute_once(task, definition, tool_loop, http_client)).await;
        match outcome {
            Ok(Ok(output)) => {
                return TaskExecution {
                    task_id: task.id.clone(),
                    status: TaskStatus::Done,
                    attempts,
                    output: Some(output),
                    error: None,
                    started_at,
                    finished_at: Some(Utc::now()),
                };
            }
            Ok(Err(err)) => last_error = Some(err),
            Err(_) => last_error = Some("task timed out".to_string()),
        }
        if attempt < task.retry_count {
            tokio::time::sleep(calculate_backoff(attempt, &policy)).await;
        }
    }

    TaskExecution {
        task_id: task.id.clone(),
        status: if task.skip_on_error { TaskStatus::Skipped } else { TaskStatus::Failed },
        attempts,
        output: None,
        error: last_error,
        started_at,
        finished_at: Some(Utc::now()),
    }
}

async fn execute_once(
    task: &TaskDefinition,
    definition: &WorkflowDefinition,
    tool_loop: &ToolLoop<'_>,
    http_client: &reqwest::Client,
) -> Result<Value, String> {
    match task.task_type {
        TaskType::AgentCall => execute_agent_call(task, tool_loop).await,
        TaskType::HttpRequest => execute_http_request(task, http_client).await,
        TaskType::Conditional => execute_conditional(task),
        TaskType::Parallel => execute_parallel(task, definition, tool_loop, http_client).await,
    }
}

async fn execute_agent_call(task: &TaskDefinition, tool_loop: &ToolLoop<'_>) -> Result<Value, String> {
    let role = task.params.get("role").and_then(Value::as_str).unwrap_or("planner");
    let project = task.params.get("project").and_then(Value::as_str).unwrap_or("default");
    let model = task.params.get("model").and_then(Value::as_str).unwrap_or("claude-sonnet-4-20250514");
    let prompt = task.params.get("prompt").and_then(Value::as_str).unwrap_or_default();
    let tools: Vec<String> = task
        .params
        .get("tools")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();

    let result = tool_loop
        .call_agent(role, project, model, prompt, &tools)
        .await
        .map_err(|e| e.to_string())?;
    Ok(serde_json::json!({"text": result.text, "cost_usd": result.cost_usd}))
}

async fn execute_http_request(task: &TaskDefinition, client: &reqwest::Client) -> Result<Value, String> {
    let url = task
        .params
        .get("url")
        .and_then(Value::as_str)
        .ok_or_else(|| "http_request task missing `url` param".to_string())?;
    let method = task.params.get("method").and_then(Value::as_str).unwrap_or("GET").to_uppercase();
    let body = task.params.get("body").cloned();

    let method = reqwest::Method::from_bytes(method.as_bytes()).map_err(|e| e.to_string())?;
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request.send().await.map_err(|e| e.to_string())?;
    let status = response.status().as_u16();
    let text = response.text().await.unwrap_or_default();
    let parsed = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
    if status >= 400 {
        return Err(format!("http {status}: {parsed}"));
    }
    Ok(serde_json::json!({"status": status, "body": parsed}))
}

/// Evaluates `params.field == params.equals` against `params.against`,
/// a value literally embedded at workflow-definition time (no cross-task
/// data lookup — a task that needs a prior task's output should read it
/// from the execution's recorded outputs, not via this helper).
fn execute_conditional(task: &TaskDefinition) -> Result<Value, String> {
    let field = task.params.get("field").cloned().unwrap_or(Value::Null);
    let expected = task.params.get("equals").cloned().unwrap_or(Value::Null);
    Ok(serde_json::json!({"matched": field == expected}))
}

/// Runs the sibling tasks named in `params.tasks` concurrently. The group
/// fails as soon as any sub-task fails, matching `skip_on_error` only at the
/// group's own task level, not per sub-task.
async fn execute_parallel(
    task: &TaskDefinition,
    definition: &WorkflowDefinition,
    tool_loop: &ToolLoop<'_>,
    http_client: &reqwest::Client,
) -> Result<Value, String> {
    let sub_task_ids: Vec<String> = task
        .params
        .get("tasks")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .unwrap_or_default();

    // Boxed so the mutual recursion (`execute_once` -> `execute_parallel` ->
    // `execute_once`) doesn't require an infinitely-sized future type.
    let futures = sub_task_ids.iter().map(|id| {
        Box::pin(async move {
            let Some(sub_task) = definition.task(id) else {
                return Err(format!("unknown sub-task `{id}`"));
            };
            execute_once(sub_task, definition, tool_loop, http_client).await
        }) as std::pin::Pin<Box<dyn std::future::Future<Output = Result<Value, String>> + Send + '_>>
    });

    let results = futures::future::join_all(futures).await;
    let mut outputs = Vec::with_capacity(results.len());
    for (id, result) in sub_task_ids.iter().zip(results) {
        match result {
            Ok(value) => outputs.push(serde_json::json!({"task": id, "output": value})),
            Err(err) => return Err(format!("sub-task `{id}` failed: {err}")),
        }
    }
    Ok(Value::Array(outputs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conditional_matches_equal_values() {
        let task = TaskDefinition {
            id: "cond".to_string(),
            task_type: TaskType::Conditional,
            params: serde_json::json!({"field": "ready", "equals": "ready"}),
            retry_count: 0,
            retry_backoff_s: 1,
            timeout_seconds: 5,
            skip_on_error: false,
            next_task: None,
        };
        let result = execute_conditional(&task).unwrap();
        assert_eq!(result["matched"], true);
    }

    #[test]
    fn conditional_rejects_mismatched_values() {
        let task = TaskDefinition {
            id: "cond".to_string(),
            task_type: TaskType::Conditional,
            params: serde_json::json!({"field": "ready", "equals": "not-ready"}),
            retry_count: 0,
            retry_backoff_s: 1,
            timeout_seconds: 5,
            skip_on_error: false,
            next_task: None,
        };
        let result = execute_conditional(&task).unwrap();
        assert_eq!(result["matched"], false);
    }

    #[tokio::test]
    async fn run_persists_the_execution_under_data_root() {
        use tandem_providers::{CooldownTracker, ProviderRegistry};
        use tandem_tools::ToolRegistry;

        let dir = tempfile::tempdir().unwrap();
        let data_root = DataRoot::new(dir.path());
        data_root.ensure_layout().await.unwrap();

        let definition = WorkflowDefinition {
            id: "wf-1".to_string(),
            name: "single conditional".to_string(),
            start_task: "cond".to_string(),
            tasks: vec![TaskDefinition {
                id: "cond".to_string(),
                task_type: TaskType::Conditional,
                params: serde_json::json!({"field": "ready", "equals": "ready"}),
                retry_count: 0,
                retry_backoff_s: 1,
                timeout_seconds: 5,
                skip_on_error: false,
                next_task: None,
            }],
        };

        let providers = ProviderRegistry::new(Default::default());
        let cooldowns = CooldownTracker::new();
        let cost_ledger = crate::cost_ledger::CostLedger::new(data_root.costs_log());
        let tools = ToolRegistry::new();
        let tool_loop = ToolLoop {
            providers: &providers,
            cooldowns: &cooldowns,
            cost_ledger: &cost_ledger,
            tools: &tools,
            tool_executor_chain: &[],
            text_reasoner_chain: &[],
        };
        let http_client = reqwest::Client::new();

        let execution = run(&definition, &tool_loop, &http_client, &data_root).await;
        assert_eq!(execution.status, WorkflowStatus::Done);

        let raw = tokio::fs::read_to_string(data_root.workflow_execution_file("wf-1")).await.unwrap();
        let persisted: WorkflowExecution = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted.status, WorkflowStatus::Done);
        assert!(persisted.task_executions.contains_key("cond"));
    }
}
