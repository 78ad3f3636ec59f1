//! LLM Gateway - Main entry point
//!
//! Loads the YAML configuration, connects the usage store, registers the
//! provider adapters and serves the HTTP API until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use llm_gateway::{
    build_router, build_state,
    core::{config::resolve_config_path, init_logging, init_metrics},
    GatewayConfig,
};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "llm-gateway", version, about = "OpenAI-compatible LLM gateway")]
struct Cli {
    /// Path to the YAML configuration file (CONFIG_PATH takes priority)
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Validate the configuration and exit
    #[arg(long)]
    validate: bool,
}

fn main() -> ExitCode {
    // Load .env file if present (before reading any environment variables)
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let worker_threads = std::env::var("TOKIO_WORKER_THREADS")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .or_else(detect_cpu_limit)
        .unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        });

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Failed to build tokio runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(async_main(cli, worker_threads)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{:#}", e), "Gateway exited with error");
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn async_main(cli: Cli, worker_threads: usize) -> Result<()> {
    let path = resolve_config_path(&cli.config);
    let config = GatewayConfig::load(&path)?;
    config
        .validate()
        .with_context(|| format!("Invalid configuration in {}", path))?;

    if cli.validate {
        println!("Configuration {} is valid", path);
        return Ok(());
    }

    init_logging(&config.logging)?;
    init_metrics();
    tracing::info!(worker_threads, config = %path, "Starting LLM Gateway");

    let addr = config.server.socket_addr()?;
    let admin_enabled = config
        .server
        .admin_api_key
        .as_deref()
        .is_some_and(|k| !k.is_empty());
    let metrics_endpoint = config
        .logging
        .prometheus
        .enabled
        .then(|| config.logging.prometheus.endpoint.clone());
    let provider_count = config.providers.len();

    let state = build_state(config).await?;
    let app = build_router(state);

    tracing::info!(providers = provider_count, "Listening on {}", addr);
    tracing::info!("OpenAI API: /v1/chat/completions, /v1/embeddings, /v1/models");
    if admin_enabled {
        tracing::info!("Admin API: /admin/v1/*");
    } else {
        tracing::warn!("Admin API disabled: server.admin_api_key is not set");
    }
    tracing::info!("Swagger UI: /swagger-ui");
    if let Some(endpoint) = metrics_endpoint {
        tracing::info!("Metrics endpoint: {}", endpoint);
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    tracing::info!("Gateway stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("Shutdown signal received, draining connections");
}

/// Detect CPU limit from cgroup (for containerized environments)
fn detect_cpu_limit() -> Option<usize> {
    let cores = |quota: i64, period: i64| ((quota as f64 / period as f64).ceil() as usize).max(1);

    // cgroup v2: "<quota> <period>" or "max <period>"
    if let Ok(max) = std::fs::read_to_string("/sys/fs/cgroup/cpu.max") {
        if let [quota, period] = max.split_whitespace().collect::<Vec<_>>()[..] {
            if let (Ok(quota), Ok(period)) = (quota.parse::<i64>(), period.parse::<i64>()) {
                if quota > 0 && period > 0 {
                    return Some(cores(quota, period));
                }
            }
        }
    }

    let read = |file: &str| -> Option<i64> {
        std::fs::read_to_string(format!("/sys/fs/cgroup/cpu/{}", file))
            .ok()?
            .trim()
            .parse()
            .ok()
    };
    let quota = read("cpu.cfs_quota_us")?;
    let period = read("cpu.cfs_period_us")?;
    (quota > 0 && period > 0).then(|| cores(quota, period))
}
