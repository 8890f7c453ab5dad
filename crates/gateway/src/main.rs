//! Credit gateway - main entry point.

use anyhow::{Context, Result};
use credential_broker::RefreshCoordinator;
use credit_ledger::SpendRecorder;
use gateway::{driver, Config, Pipeline};
use std::sync::Arc;
use tokio::io::{stdin, stdout, BufReader};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use upstream_client::ChatClient;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.gateway.log_level, config.gateway.log_json);

    info!("Starting credit gateway...");

    let credentials = RefreshCoordinator::from_config(&config.refresh)
        .await
        .context("Failed to create refresh coordinator")?;

    let metering = SpendRecorder::from_config(&config.metering)
        .await
        .context("Failed to create spend recorder")?;

    let upstream = ChatClient::new(
        &config.upstream.base_url,
        &config.upstream.model,
        config.upstream.timeout,
    )
    .context("Failed to create upstream client")?;

    let pipeline = Pipeline::new(credentials, Arc::new(metering), upstream)
        .with_system_prompt(config.gateway.system_prompt.clone())
        .with_max_retries(config.upstream.max_retries);

    info!(
        "Upstream endpoint: {} (model={})",
        config.upstream.base_url, config.upstream.model
    );
    info!("Metering mode: {:?}", config.metering.mode);
    info!("Reading requests from stdin...");

    driver::run(&pipeline, BufReader::new(stdin()), stdout()).await?;

    info!("Shutting down...");
    Ok(())
}

/// Logs go to stderr; stdout carries responses.
fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
