//! Smart Repository Cache
//!
//! Runs the cache engine against KeyDB/Redis (or an in-process store) and
//! serves health and prometheus endpoints.
//!
//! ```text
//!   smart-repo-cache serve --redis-url redis://keydb:6379 --content-root /srv/repos
//!   smart-repo-cache check-config --config engine.yaml
//! ```

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use smart_repo_cache::telemetry::init_logging;
use smart_repo_cache::{
    CacheEngine, ClockRef, ContentSource, DirectorySource, EngineConfig, EngineMetrics, InMemoryRemoteStore,
    KeyDbConfig, KeyDbStore, RemoteStore, SystemClock,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Smart Repository Cache - tiered, navigation-aware cache for repository content
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON", global = true)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine with health and metrics endpoints
    Serve(ServeArgs),
    /// Validate a configuration file and print the effective configuration
    CheckConfig {
        /// YAML configuration file
        #[arg(long, env = "CACHE_CONFIG")]
        config: PathBuf,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// YAML configuration file
    #[arg(long, env = "CACHE_CONFIG")]
    config: Option<PathBuf>,

    /// KeyDB/Redis URL, overriding the configuration file
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Keep cached values in process instead of KeyDB/Redis
    #[arg(long, env = "IN_MEMORY")]
    in_memory: bool,

    /// Directory holding repository checkouts as <owner>/<name>/...
    #[arg(long, env = "CONTENT_ROOT", default_value = "./repos")]
    content_root: PathBuf,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: SocketAddr,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: SocketAddr,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_json);

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::CheckConfig { config } => check_config(&config),
    }
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = EngineConfig::from_yaml_file(path)
        .with_context(|| format!("invalid configuration {}", path.display()))?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::from_yaml_file(path)
            .with_context(|| format!("loading configuration {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if let Some(url) = args.redis_url {
        config.store.redis_url = url;
    }

    info!("Starting Smart Repository Cache");
    info!("  Version: {}", smart_repo_cache::VERSION);
    info!("  Remote store: {}", if args.in_memory { "in-memory" } else { config.store.redis_url.as_str() });
    info!("  Content root: {}", args.content_root.display());

    let clock: ClockRef = Arc::new(SystemClock);
    let remote: Arc<dyn RemoteStore> = if args.in_memory {
        Arc::new(InMemoryRemoteStore::new(clock.clone()))
    } else {
        Arc::new(KeyDbStore::new(KeyDbConfig::from(&config.store)))
    };
    let source: Arc<dyn ContentSource> = Arc::new(DirectorySource::new(&args.content_root));

    let engine = CacheEngine::new(config, remote, source, clock)?;
    engine.initialize().await.context("connecting to the remote store")?;
    engine.start();

    let metrics = Arc::new(EngineMetrics::new()?);
    let shutdown = CancellationToken::new();

    let health = tokio::spawn(run_health_server(args.health_addr, engine.clone(), shutdown.clone()));
    let exporter = tokio::spawn(run_metrics_server(
        args.metrics_addr,
        engine.clone(),
        metrics,
        shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!("Shutdown signal received");
    shutdown.cancel();

    for (name, handle) in [("health", health), ("metrics", exporter)] {
        match handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(server = name, error = %e, "Server failed"),
            Err(e) => error!(server = name, error = %e, "Server task panicked"),
        }
    }

    engine.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

// =============================================================================
// Health Server
// =============================================================================

async fn health_response(engine: &CacheEngine, req: Request<Body>) -> Response<Body> {
    match req.uri().path() {
        "/healthz" | "/livez" => respond(StatusCode::OK, "text/plain", "ok"),
        "/readyz" if engine.store().is_degraded() => {
            respond(StatusCode::SERVICE_UNAVAILABLE, "text/plain", "remote store degraded")
        }
        "/readyz" => respond(StatusCode::OK, "text/plain", "ok"),
        "/status" => match serde_json::to_vec(&engine.status().await) {
            Ok(body) => respond(StatusCode::OK, "application/json", body),
            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
        },
        _ => respond(StatusCode::NOT_FOUND, "text/plain", "not found"),
    }
}

async fn run_health_server(
    addr: SocketAddr,
    engine: Arc<CacheEngine>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let engine = engine.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let engine = engine.clone();
                async move { Ok::<_, Infallible>(health_response(&engine, req).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr).with_context(|| format!("binding health server to {}", addr))?;
    info!("Health server listening on {}", addr);
    server
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("health server")?;
    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn metrics_response(engine: &CacheEngine, metrics: &EngineMetrics, req: Request<Body>) -> Response<Body> {
    if req.uri().path() != "/metrics" {
        return respond(StatusCode::NOT_FOUND, "text/plain", "not found");
    }

    metrics.update(&engine.status().await);
    match metrics.encode() {
        Ok((content_type, body)) => {
            let mut response = respond(StatusCode::OK, "text/plain", body);
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response.headers_mut().insert(CONTENT_TYPE, value);
            }
            response
        }
        Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", e.to_string()),
    }
}

async fn run_metrics_server(
    addr: SocketAddr,
    engine: Arc<CacheEngine>,
    metrics: Arc<EngineMetrics>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let engine = engine.clone();
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let engine = engine.clone();
                let metrics = metrics.clone();
                async move { Ok::<_, Infallible>(metrics_response(&engine, &metrics, req).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr).with_context(|| format!("binding metrics server to {}", addr))?;
    info!("Metrics server listening on {}", addr);
    server
        .serve(make_svc)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("metrics server")?;
    Ok(())
}
