//! Command-line host for the swcache worker.
//!
//! Drives one worker over the file-backed store and the real network, and
//! prints a JSON result on stdout:
//! - lifecycle: `install`, `activate`
//! - requests: `fetch <url>`
//! - administration: `message`, `evict`, `clear`, `generations`

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use swcache_common::{init_logging, LogConfig, SwConfig};
use swcache_net::{HttpFetcher, LoaderConfig, Request};
use swcache_sw::{FileCacheStore, ServiceWorker};
use tracing::{debug, error};

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Offline-first request cache", version)]
struct Args {
    /// JSON config file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(long, short)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pre-populate the version's cache generation
    Install,
    /// Install, then sweep old generations
    Activate,
    /// Answer a GET request through the cache
    Fetch {
        url: String,
        /// Treat the request as a page navigation
        #[arg(long)]
        document: bool,
    },
    /// Send a control message, e.g. '{"type":"GET_VERSION"}'
    Message { json: String },
    /// Drop one cached URL
    Evict { url: String },
    /// Delete every cache generation
    Clear,
    /// List cache generations
    Generations,
}

#[derive(Serialize)]
struct CommandResult {
    status: &'static str,
    version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = init_logging(LogConfig::cli(args.verbose)) {
        eprintln!("swcache: logging unavailable: {e}");
    }

    let (version, outcome) = match load_config(&args) {
        Ok(config) => {
            let version = config.version.clone();
            (version, run(config, args.command).await)
        }
        Err(e) => (String::new(), Err(e)),
    };

    let result = match outcome {
        Ok(result) => CommandResult {
            status: "ok",
            version,
            result: Some(result),
            error: None,
        },
        Err(e) => {
            error!(error = %format!("{e:#}"), "Command failed");
            CommandResult {
                status: "error",
                version,
                result: None,
                error: Some(format!("{e:#}")),
            }
        }
    };

    match serde_json::to_string(&result) {
        Ok(line) => println!("{line}"),
        Err(e) => eprintln!("swcache: cannot encode result: {e}"),
    }

    if result.status != "ok" {
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> anyhow::Result<SwConfig> {
    let config = match &args.config {
        Some(path) => SwConfig::load(path)?,
        None => SwConfig::default(),
    };
    debug!(version = %config.version, origin = %config.origin, "Loaded config");
    Ok(config)
}

async fn run(config: SwConfig, command: Command) -> anyhow::Result<Value> {
    let mut store = FileCacheStore::new(&config.store_dir);
    if let Some(quota) = config.quota_bytes {
        store = store.with_quota(quota);
    }

    let loader = LoaderConfig {
        origin: config.origin.clone(),
        user_agent: config.user_agent.clone(),
        timeout: config.fetch_timeout(),
        max_redirects: config.max_redirects,
    };
    let fetcher = HttpFetcher::new(loader).context("cannot build HTTP client")?;

    let (worker, _events) = ServiceWorker::new(config, Arc::new(store), Arc::new(fetcher));
    let worker = Arc::new(worker);

    let result = execute(&worker, command).await;
    // Background refreshes finish before the process exits.
    worker.settle().await;
    result
}

async fn execute(worker: &Arc<ServiceWorker>, command: Command) -> anyhow::Result<Value> {
    match command {
        Command::Install => {
            worker.install().await?;
            Ok(json!({ "state": worker.state().await, "keys": key_list(worker).await? }))
        }
        Command::Activate => {
            worker.install().await?;
            worker.activate().await?;
            Ok(json!({ "state": worker.state().await, "keys": key_list(worker).await? }))
        }
        Command::Fetch { url, document } => {
            let url = worker.config().resolve(&url)?;
            let request = if document {
                Request::navigate(url)
            } else {
                Request::get(url)
            };
            let interception = worker.intercept(&request).await?;
            let response = &interception.response;
            Ok(json!({
                "url": response.url.as_str(),
                "status": response.status.as_u16(),
                "outcome": interception.outcome,
                "response_type": response.response_type,
                "content_type": response.content_type().map(|m| m.to_string()),
                "body": response.text().ok(),
            }))
        }
        Command::Message { json } => {
            let data: Value = serde_json::from_str(&json).context("message is not JSON")?;
            let reply = worker.connect().post_message(data).await?;
            Ok(json!({ "reply": reply }))
        }
        Command::Evict { url } => {
            let url = worker.config().resolve(&url)?;
            let removed = worker.evict(&url).await?;
            Ok(json!({ "url": url.as_str(), "removed": removed }))
        }
        Command::Clear => {
            let deleted = worker.clear().await?;
            Ok(json!({ "deleted": deleted }))
        }
        Command::Generations => {
            let generations: Vec<Value> = worker
                .generations()
                .await?
                .into_iter()
                .map(|(name, state)| json!({ "name": name, "state": state }))
                .collect();
            Ok(Value::Array(generations))
        }
    }
}

async fn key_list(worker: &ServiceWorker) -> anyhow::Result<Vec<String>> {
    Ok(worker
        .keys()
        .await?
        .into_iter()
        .map(|key| key.url)
        .collect())
}
