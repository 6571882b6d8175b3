//! `target-bigquery` entry point.
//!
//! This file is intentionally thin: it parses the one required flag, wires
//! configuration, warehouse client, and telemetry beacon together, then
//! drives the selected ingestion driver to completion over standard input.
//! All real work lives in `sink-engine`.

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use sink_config::ReplicationMethod;
use sink_engine::bulk_load::BulkLoadDriver;
use sink_engine::per_row::PerRowDriver;
use sink_engine::HybridEngine;
use sink_warehouse::BigQueryWarehouseClient;
use tokio::io::{self, AsyncWriteExt};
use tracing::{debug, error, info};

#[derive(Parser)]
#[command(name = "target-bigquery")]
#[command(about = "Singer target: materializes a tap's record stream into BigQuery", long_about = None)]
struct Cli {
    /// Path to the target's JSON configuration file.
    #[arg(short, long = "config", required = true)]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Dev convenience: silent if the file does not exist — production
    // injects env vars (and GCP credentials) directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "target-bigquery exited with an error");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    let config = sink_config::load_config(&cli.config).context("loading configuration")?;

    let warehouse = match &config.service_account_key_path {
        Some(path) => BigQueryWarehouseClient::from_service_account_key_file(path, config.project_id.clone())
            .await
            .context("authenticating with service account key")?,
        None => BigQueryWarehouseClient::from_application_default_credentials(config.project_id.clone())
            .await
            .context("authenticating with application default credentials")?,
    };
    let warehouse = std::sync::Arc::new(warehouse);

    if !config.disable_collection() {
        spawn_telemetry_beacon();
    }

    spawn_signal_logger();

    let stdin = io::BufReader::new(io::stdin());
    let mut stdout = io::stdout();

    match config.replication_method() {
        ReplicationMethod::Hybrid => {
            let mut engine = HybridEngine::new(
                warehouse,
                config.dataset_id.clone(),
                config.location.clone(),
                config.validate_records(),
                config.can_delete_table(),
            );
            engine.ensure_dataset().await?;
            engine.run(stdin, &mut stdout).await?;
            if !engine.failed_lines().is_empty() {
                info!(count = engine.failed_lines().len(), "completed with failed lines");
            }
        }
        ReplicationMethod::Stream => {
            let mut driver = PerRowDriver::new(warehouse, config.dataset_id.clone(), config.location.clone());
            driver.ensure_dataset().await?;
            if let Some(state) = driver.run(stdin).await? {
                sink_engine::emit_checkpoint(&mut stdout, &state).await?;
            }
        }
        ReplicationMethod::BulkLoad { truncate } => {
            // The bulk-load driver buffers an entire run to scratch files
            // before issuing a single load job at end-of-input; failing here
            // means the operator learns their warehouse client can't back
            // this mode before a line of stdin is consumed, not after.
            if !warehouse.supports_bulk_load() {
                anyhow::bail!(
                    "configured replication_method requires bulk loading, which this warehouse client does not support"
                );
            }
            let mut driver = BulkLoadDriver::new(warehouse, config.dataset_id.clone(), config.location.clone(), truncate);
            driver.ensure_dataset().await?;
            if let Some(state) = driver.run(stdin).await? {
                sink_engine::emit_checkpoint(&mut stdout, &state).await?;
            }
        }
    }

    stdout.flush().await.context("flushing stdout")?;
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();
}

/// Logs a diagnostic note on `SIGINT`/`SIGTERM` and nothing else: the
/// in-flight retry loop's own wall-clock cap is the only bound on shutdown,
/// so there is no in-flight work to flush here. Spawned once, never awaited.
fn spawn_signal_logger() {
    tokio::spawn(async {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigint = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(err) => {
                    debug!(error = %err, "unable to install SIGINT handler");
                    return;
                }
            };
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(err) => {
                    debug!(error = %err, "unable to install SIGTERM handler");
                    return;
                }
            };
            tokio::select! {
                _ = sigint.recv() => info!("received SIGINT; finishing the in-flight retry loop, no explicit flush"),
                _ = sigterm.recv() => info!("received SIGTERM; finishing the in-flight retry loop, no explicit flush"),
            }
        }
        #[cfg(not(unix))]
        {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received ctrl-c; finishing the in-flight retry loop, no explicit flush");
            }
        }
    });
}

/// Fire-and-forget anonymous usage ping. Never awaited by the caller,
/// never blocks the ingestion loop; failures are swallowed at debug level.
fn spawn_telemetry_beacon() {
    tokio::spawn(async {
        let url = format!(
            "https://collector.singer.io/v1/usage?name=target-bigquery&version={}",
            env!("CARGO_PKG_VERSION")
        );
        match reqwest::Client::new().get(url).send().await {
            Ok(response) if response.status().is_success() => {
                debug!("telemetry beacon delivered");
            }
            Ok(response) => {
                debug!(status = %response.status(), "telemetry beacon rejected");
            }
            Err(err) => {
                debug!(error = %err, "telemetry beacon failed");
            }
        }
    });
}
