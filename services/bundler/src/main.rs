use anyhow::{Context, Result};
use corpus_bundler::{Config, ReleaseOrchestrator, RunReport};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    // Load configuration
    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        release = %config.release.name,
        "Starting corpus bundler"
    );

    match run(config).await {
        Ok(report) if report.has_failures() => {
            for (step, message) in &report.stats.errors {
                warn!(step = %step, error = %message, "Release finished with a failed step");
            }
            ExitCode::FAILURE
        }
        Ok(report) => {
            info!(
                rows_seen = report.rows_seen,
                clips_saved = report.clips_saved,
                locales = report.stats.locales.len(),
                "Release complete"
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %format!("{e:#}"), "Release failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: Config) -> Result<RunReport> {
    // Initialize metrics
    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let orchestrator = ReleaseOrchestrator::initialize(config)
        .await
        .context("Failed to initialize release")?;

    orchestrator.run().await
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}
