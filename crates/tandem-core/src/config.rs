//! Layered configuration for the orchestrator, following the teacher's
//! `global < project < managed < env < runtime < cli` deep-merge idiom
//! (tandem-core's original `ConfigStore`) but scoped to the settings this
//! system actually needs (spec §6.6).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::fs;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_data_root")]
    pub data_root: PathBuf,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_poll_interval_s")]
    pub poll_interval_s: u64,
    #[serde(default = "default_budget_limit_usd")]
    pub budget_limit_usd: f64,
    #[serde(default = "default_freshness_window_s")]
    pub freshness_window_s: i64,
}

fn default_data_root() -> PathBuf {
    PathBuf::from(".tandem-orchestrator")
}
fn default_max_concurrent() -> usize {
    2
}
fn default_poll_interval_s() -> u64 {
    10
}
fn default_budget_limit_usd() -> f64 {
    5.0
}
fn default_freshness_window_s() -> i64 {
    60
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            data_root: default_data_root(),
            max_concurrent: default_max_concurrent(),
            poll_interval_s: default_poll_interval_s(),
            budget_limit_usd: default_budget_limit_usd(),
            freshness_window_s: default_freshness_window_s(),
        }
    }
}

impl OrchestratorConfig {
    /// `DATA_ROOT`, `MAX_CONCURRENT`, `POLL_INTERVAL_S`, `BUDGET_LIMIT_USD`,
    /// `FRESHNESS_WINDOW_S` override the defaults; `TANDEM_STATE_DIR` is
    /// accepted as an alias for `DATA_ROOT` to match the engine binary's
    /// existing flag/env naming.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(v) = std::env::var("DATA_ROOT").or_else(|_| std::env::var("TANDEM_STATE_DIR")) {
            if !v.trim().is_empty() {
                config.data_root = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("MAX_CONCURRENT") {
            if let Ok(n) = v.parse() {
                config.max_concurrent = n;
            }
        }
        if let Ok(v) = std::env::var("POLL_INTERVAL_S") {
            if let Ok(n) = v.parse() {
                config.poll_interval_s = n;
            }
        }
        if let Ok(v) = std::env::var("BUDGET_LIMIT_USD") {
            if let Ok(n) = v.parse() {
                config.budget_limit_usd = n;
            }
        }
        if let Ok(v) = std::env::var("FRESHNESS_WINDOW_S") {
            if let Ok(n) = v.parse() {
                config.freshness_window_s = n;
            }
        }
        config
    }
}

/// Credential lookup for a provider, mirroring the teacher's
/// `provider_env_candidates` convention: `<PROVIDER>_API_KEY` first, then a
/// handful of well-known aliases.
pub fn provider_env_candidates(provider_id: &str) -> Vec<String> {
    let normalized = provider_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect::<String>()
        .to_ascii_uppercase();

    let mut out = vec![format!("{normalized}_API_KEY")];
    match provider_id.to_ascii_lowercase().as_str() {
        "openai" => out.push("OPENAI_API_KEY".to_string()),
        "anthropic" => out.push("ANTHROPIC_API_KEY".to_string()),
        "cohere" => out.push("COHERE_API_KEY".to_string()),
        "deepseek" | "kimi" => out.push("DEEPSEEK_API_KEY".to_string()),
        "gemini" | "google" => out.push("GEMINI_API_KEY".to_string()),
        "minimax" => out.push("MINIMAX_API_KEY".to_string()),
        _ => {}
    }
    out.sort();
    out.dedup();
    out
}

pub fn provider_credential(provider_id: &str) -> Option<String> {
    provider_env_candidates(provider_id)
        .into_iter()
        .find_map(|key| std::env::var(&key).ok().filter(|v| !v.trim().is_empty()))
}

/// A small layered JSON store for operator overrides, kept for parity with
/// the teacher's config layering idiom (`global < project < runtime`) in
/// case a deployment wants to persist overrides rather than only read env
/// vars. The orchestrator itself only reads `effective_value`.
pub struct ConfigStore {
    path: PathBuf,
    layers: RwLock<ConfigLayers>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigLayers {
    #[serde(default)]
    project: Value,
    #[serde(default)]
    runtime: Value,
}

impl ConfigStore {
    pub async fn new(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let project = read_json_file(&path).await?;
        Ok(Self {
            path,
            layers: RwLock::new(ConfigLayers {
                project,
                runtime: json!({}),
            }),
        })
    }

    pub async fn effective_value(&self) -> Value {
        let layers = self.layers.read().await;
        let mut merged = layers.project.clone();
        deep_merge(&mut merged, &layers.runtime);
        merged
    }

    pub async fn patch_runtime(&self, patch: Value) {
        let mut layers = self.layers.write().await;
        deep_merge(&mut layers.runtime, &patch);
    }

    pub async fn patch_project(&self, patch: Value) -> anyhow::Result<()> {
        let mut layers = self.layers.write().await;
        deep_merge(&mut layers.project, &patch);
        write_json_file(&self.path, &layers.project).await
    }
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(json!({}));
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| json!({})))
}

async fn write_json_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let raw = serde_json::to_string_pretty(value)?;
    fs::write(path, raw).await?;
    Ok(())
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                deep_merge(base_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (base, overlay) => {
            if !overlay.is_null() {
                *base = overlay.clone();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_overrides_defaults() {
        std::env::set_var("MAX_CONCURRENT", "7");
        let config = OrchestratorConfig::from_env();
        assert_eq!(config.max_concurrent, 7);
        std::env::remove_var("MAX_CONCURRENT");
    }

    #[test]
    fn provider_candidates_include_generic_and_alias() {
        let candidates = provider_env_candidates("anthropic");
        assert!(candidates.contains(&"ANTHROPIC_API_KEY".to_string()));
        assert!(candidates.contains(&"ANTHROPIC_API_KEY".to_string()));
    }

    #[tokio::test]
    async fn deep_merge_runtime_over_project() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"a":1,"b":{"c":2}}"#).unwrap();
        let store = ConfigStore::new(&path).await.unwrap();
        store.patch_runtime(json!({"b": {"c": 3}})).await;
        let effective = store.effective_value().await;
        assert_eq!(effective["a"], 1);
        assert_eq!(effective["b"]["c"], 3);
    }
}
