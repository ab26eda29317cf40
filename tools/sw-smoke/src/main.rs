//! Smoke harness for the RustKit offline worker.
//!
//! Registers the worker against a live origin, lets it precache and activate,
//! then fetches each given path from a controlled page and prints a JSON
//! report of where every response came from.
//!
//! ## Usage
//!
//! ```bash
//! # Precache and fetch two pages online
//! sw-smoke --origin http://localhost:8080 / /about
//!
//! # Same, but cut the network after activation
//! sw-smoke --origin http://localhost:8080 --offline / /blog/1
//!
//! # Custom asset list and cache version
//! sw-smoke --origin http://localhost:8080 --config worker.json /
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use rustkit_common::{init_logging, LogConfig, LogFormat, ResultExt, RustKitError};
use rustkit_net::{Fetch, LoaderConfig, NetError, Request, ResourceLoader, Response};
use rustkit_sw::{
    MemoryCacheStorage, OfflineWorker, ResponseSource, ServiceWorkerContainer,
    ServiceWorkerError, WorkerConfig,
};
use serde_json::{json, Value};
use tracing::info;
use url::Url;

#[derive(Parser)]
#[command(name = "sw-smoke")]
#[command(about = "Smoke harness for the RustKit offline worker")]
struct Cli {
    /// Origin the worker is registered for
    #[arg(long)]
    origin: Url,

    /// Worker configuration (JSON); the shipped configuration when omitted
    #[arg(long)]
    config: Option<PathBuf>,

    /// Switch the network off after activation
    #[arg(long)]
    offline: bool,

    /// Log format: pretty, compact or json
    #[arg(long, default_value = "compact")]
    log_format: LogFormat,

    /// Log filter, e.g. "rustkit_sw=debug"
    #[arg(long)]
    log_filter: Option<String>,

    /// Paths to fetch once the worker is active
    paths: Vec<String>,
}

/// HTTP loader that can be cut off.
struct Uplink {
    loader: ResourceLoader,
    offline: AtomicBool,
}

#[async_trait]
impl Fetch for Uplink {
    async fn fetch(&self, request: &Request) -> Result<Response, NetError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(NetError::RequestFailed("network switched off".into()));
        }
        self.loader.load(request).await
    }
}

fn load_config(path: Option<&Path>) -> rustkit_common::Result<WorkerConfig> {
    let Some(path) = path else {
        return Ok(WorkerConfig::default());
    };
    let text = std::fs::read_to_string(path)?;
    WorkerConfig::from_json(&text).config_context(format!("parsing {}", path.display()))
}

fn classify(err: ServiceWorkerError) -> RustKitError {
    match err {
        ServiceWorkerError::NoResponse(url) => RustKitError::NotFound(url),
        ServiceWorkerError::CacheError(msg) => RustKitError::cache(msg),
        err @ ServiceWorkerError::NetworkError(_) => {
            RustKitError::network_with_source("fetch failed", err)
        }
        other => RustKitError::lifecycle_with_source("worker", other),
    }
}

fn source_label(source: &ResponseSource) -> String {
    match source {
        ResponseSource::Network => "network".to_string(),
        ResponseSource::Cache { bucket } => format!("cache:{bucket}"),
        ResponseSource::OfflinePage { bucket } => format!("offline-page:{bucket}"),
    }
}

async fn run(cli: Cli) -> rustkit_common::Result<Value> {
    if !matches!(cli.origin.scheme(), "http" | "https") {
        return Err(RustKitError::config(format!(
            "origin must be http or https, got {}",
            cli.origin
        )));
    }
    let config = load_config(cli.config.as_deref())?;

    let loader = ResourceLoader::new(LoaderConfig::default())
        .map_err(|e| RustKitError::network_with_source("building HTTP client", e))?;
    let uplink = Arc::new(Uplink {
        loader,
        offline: AtomicBool::new(false),
    });
    let caches = Arc::new(MemoryCacheStorage::new());
    let (container, _) = ServiceWorkerContainer::new(caches, uplink.clone());

    let worker = OfflineWorker::new(cli.origin.clone(), config, container.context())
        .config_context("worker configuration")?;
    let precache_name = worker.config().precache_name.clone();
    let state = container
        .register(Arc::new(worker))
        .await
        .lifecycle_context("registering worker")?;
    info!(?state, cache = %precache_name, "worker registered");

    let page = container.open_page(cli.origin.clone()).await;
    if cli.offline {
        uplink.offline.store(true, Ordering::SeqCst);
        info!("network switched off");
    }

    let mut results = Vec::new();
    for path in &cli.paths {
        let url = cli
            .origin
            .join(path)
            .config_context(format!("joining '{path}'"))?;
        let entry = match container.fetch(&page.id, Request::get(url)).await {
            Ok(page_response) => json!({
                "path": path,
                "status": page_response.response.status.as_u16(),
                "source": source_label(&page_response.source),
                "bytes": page_response.response.body().len(),
            }),
            Err(e) => {
                let err = classify(e);
                json!({
                    "path": path,
                    "error": err.to_string(),
                    "category": err.category(),
                })
            }
        };
        results.push(entry);
    }

    Ok(json!({
        "origin": cli.origin.as_str(),
        "precache": precache_name,
        "offline": cli.offline,
        "results": results,
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut log_config = LogConfig::default().with_format(cli.log_format);
    if let Some(ref filter) = cli.log_filter {
        log_config = log_config.with_filter(filter.clone());
    }
    init_logging(log_config)?;

    let report = run(cli).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_paths_and_flags() {
        let cli = Cli::try_parse_from([
            "sw-smoke",
            "--origin",
            "http://localhost:8080",
            "--offline",
            "--log-format",
            "json",
            "/",
            "/about",
        ])
        .unwrap();

        assert!(cli.offline);
        assert_eq!(cli.log_format, LogFormat::Json);
        assert_eq!(cli.paths, vec!["/", "/about"]);
    }

    #[test]
    fn test_classify_no_response_is_not_found() {
        let err = classify(ServiceWorkerError::NoResponse("http://x/".into()));
        assert_eq!(err.category(), "not_found");
    }

    #[test]
    fn test_source_labels() {
        assert_eq!(source_label(&ResponseSource::Network), "network");
        assert_eq!(
            source_label(&ResponseSource::OfflinePage {
                bucket: "precache-v1".into()
            }),
            "offline-page:precache-v1"
        );
    }

    #[test]
    fn test_load_config_defaults_without_path() {
        assert_eq!(load_config(None).unwrap(), WorkerConfig::default());
    }
}
