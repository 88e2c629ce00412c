//! ddimine: drug-drug interaction evidence miner.
//! Entry point for the agent binary.
//!
//! Reads one command per line from stdin:
//!   <tool_name> [json params]   invoke a tool, print its JSON reply
//!   manifest                    list tools and their parameter schemas
//!   quit                        stop any running job and exit

mod config;
mod tools;

use std::sync::Arc;

use anyhow::Context;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ddimine_common::error::DdiError;
use ddimine_ingestion::models::MiningEvent;
use ddimine_ingestion::sources::ExtractorSet;
use ddimine_ingestion::vocabulary::DrugVocabulary;
use ddimine_ingestion::Orchestrator;

use tools::ToolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries tool replies only.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ddimine=debug,info")),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("ddimine starting up");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = config::Config::load().context("loading ddimine.toml")?;
    info!(
        max_batch_size = config.mining.max_batch_size,
        max_concurrent_drugs = config.mining.max_concurrent_drugs,
        cache_ttl_secs = config.mining.cache_ttl_secs,
        pubmed_api_key = config.sources.pubmed_api_key.is_some(),
        "Configuration loaded"
    );

    let vocabulary = Arc::new(DrugVocabulary::curated());
    let extractors = ExtractorSet::live(&config.mining, vocabulary.clone(), config.credentials())?;
    let orch = Orchestrator::builder(config.mining.clone())
        .extractors(extractors)
        .vocabulary(vocabulary)
        .build()?;

    spawn_event_logger(&orch);

    let registry = tools::build_default_registry(orch.clone());
    info!("Ready. Type `manifest` for the tool list, `quit` to exit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line {
            "quit" | "exit" => break,
            "manifest" => print_json(&registry.manifest()),
            _ => print_json(&dispatch(&registry, line).await),
        }
    }

    if orch.stop() {
        info!("Running job cancelled on shutdown");
    }
    Ok(())
}

/// Split `<tool> [json]` and invoke; errors become a JSON error object.
async fn dispatch(registry: &ToolRegistry, line: &str) -> Value {
    let (name, raw) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
    let params = if raw.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        match serde_json::from_str(raw) {
            Ok(v) => v,
            Err(e) => return error_reply(&anyhow::anyhow!("Params are not valid JSON: {e}")),
        }
    };

    match registry.invoke(name, params).await {
        Ok(v) => v,
        Err(e) => {
            warn!(tool = name, error = %e, "Tool failed");
            error_reply(&e)
        }
    }
}

fn error_reply(err: &anyhow::Error) -> Value {
    let code = err.downcast_ref::<DdiError>().map(DdiError::code).unwrap_or("tool_error");
    serde_json::json!({ "error": err.to_string(), "code": code })
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{s}"),
        Err(e) => warn!("Could not render reply: {e}"),
    }
}

/// Log job lifecycle events as they happen.
fn spawn_event_logger(orch: &Orchestrator) {
    let mut events = orch.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(MiningEvent::JobStarted { job_id, total_drugs }) => {
                    info!(%job_id, total_drugs, "Job started");
                }
                Ok(MiningEvent::DrugCompleted { job_id, drug, status, records }) => {
                    info!(%job_id, %drug, ?status, records, "Drug completed");
                }
                Ok(MiningEvent::JobFinished { job_id, status }) => {
                    info!(%job_id, status = status.as_str(), "Job finished");
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Event logger lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
