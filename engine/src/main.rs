use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tandem_core::{DataRoot, OrchestratorConfig};
use tandem_orchestrator::{CircuitBreaker, CostLedger, FileJobStore, JobRunner, JobStore, ProviderChains};
use tandem_providers::{AppConfig, ProviderConfig};
use tandem_server::{serve, AppState, HealthState};
use tracing::info;

/// Providers that can be enabled purely from env vars (`<ID>_API_KEY`,
/// plus the well-known aliases `provider_env_candidates` checks), without
/// requiring an explicit config file entry.
const KNOWN_PROVIDER_IDS: &[&str] = &[
    "ollama", "openai", "openrouter", "groq", "mistral", "together", "azure", "bedrock", "vertex", "copilot",
];

#[derive(Parser, Debug)]
#[command(name = "tandem-engine")]
#[command(about = "Tandem autonomous job orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Starts the HTTP server and the job poll loop.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Submits a single job and prints its id, without starting the server.
    Submit { task: String, project: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve { hostname, port, state_dir } => {
            let config = resolve_config(state_dir);
            let addr: SocketAddr = format!("{hostname}:{port}").parse().context("invalid hostname or port")?;
            log_startup_paths(&config, &addr);

            let data_root = DataRoot::new(config.data_root.clone());
            data_root.ensure_layout().await?;
            let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(data_root.clone()));
            recover_stale(&data_root, store.as_ref(), config.freshness_window_s).await;

            let job_runner = Arc::new(
                JobRunner::new(config.clone(), provider_config(), store, provider_chains()).await,
            );
            let health = HealthState {
                circuit_breaker: Arc::new(CircuitBreaker::load(data_root.circuit_breakers_file()).await),
                cost_ledger: Arc::new(CostLedger::new(data_root.costs_log())),
                data_root: Arc::new(data_root),
                job_runner: job_runner.clone(),
            };
            let state = AppState { job_runner, health };
            serve(addr, state).await?;
        }
        Command::Submit { task, project } => {
            let config = resolve_config(None);
            let data_root = DataRoot::new(config.data_root.clone());
            data_root.ensure_layout().await?;
            let store: Arc<dyn JobStore> = Arc::new(FileJobStore::new(data_root));
            let job_runner = Arc::new(JobRunner::new(config, provider_config(), store, provider_chains()).await);
            let job = job_runner.submit(task, project).await?;
            println!("{}", job.id);
        }
    }

    Ok(())
}

fn resolve_config(state_dir_flag: Option<String>) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::from_env();
    if let Some(dir) = state_dir_flag {
        config.data_root = PathBuf::from(dir);
    }
    config
}

async fn recover_stale(data_root: &DataRoot, store: &dyn JobStore, freshness_window_s: i64) {
    match tandem_orchestrator::recover_stale_jobs(data_root, store, freshness_window_s).await {
        Ok(report) if !report.recovered.is_empty() || !report.unrecoverable.is_empty() => {
            info!(
                recovered = report.recovered.len(),
                unrecoverable = report.unrecoverable.len(),
                "crash recovery sweep complete"
            );
        }
        Ok(_) => {}
        Err(err) => tracing::warn!(error = %err, "crash recovery sweep failed"),
    }
}

fn provider_config() -> AppConfig {
    let mut providers = std::collections::HashMap::new();
    for id in KNOWN_PROVIDER_IDS {
        providers.insert(id.to_string(), ProviderConfig::default());
    }
    AppConfig {
        providers,
        default_provider: std::env::var("TANDEM_DEFAULT_PROVIDER").ok(),
    }
}

/// The tool-executor and text-reasoner fallback chains, overridable via
/// `TANDEM_TOOL_CHAIN`/`TANDEM_TEXT_CHAIN` as comma-separated provider ids.
fn provider_chains() -> ProviderChains {
    let default_chain = || KNOWN_PROVIDER_IDS.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    let from_env = |key: &str| {
        std::env::var(key)
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect::<Vec<_>>())
            .filter(|v: &Vec<String>| !v.is_empty())
    };
    ProviderChains {
        tool_executor: from_env("TANDEM_TOOL_CHAIN").unwrap_or_else(default_chain),
        text_reasoner: from_env("TANDEM_TEXT_CHAIN").unwrap_or_else(default_chain),
    }
}

fn log_startup_paths(config: &OrchestratorConfig, addr: &SocketAddr) {
    info!("starting tandem-engine on http://{addr}");
    info!(
        "data_root={} max_concurrent={} poll_interval_s={} budget_limit_usd={}",
        config.data_root.display(),
        config.max_concurrent,
        config.poll_interval_s,
        config.budget_limit_usd,
    );
}
