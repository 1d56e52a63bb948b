//! bagframes - download ROS bags, extract image frames, publish them.

use anyhow::{Context, Result};
use bagframes_transfer::{Config, LoggingConfig, Routine};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.logging)?;

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }

    info!(
        service = %config.service.name,
        source = %config.source.bucket,
        destination = %config.destination.bucket,
        "Starting bagframes routine"
    );

    let routine = Routine::from_config(config)
        .await
        .context("Failed to initialize object stores")?;

    let report = tokio::select! {
        report = routine.run() => report?,
        _ = signal::ctrl_c() => {
            warn!("Interrupted, output may be incomplete");
            anyhow::bail!("Interrupted");
        }
    };

    let failed_files = report.extraction.failed_files().count();
    if failed_files > 0 {
        warn!(failed_files, "Some bag files could not be read");
    }

    info!(
        bags = report.downloads.succeeded(),
        frames = report.extraction.frames_written(),
        stored = report.uploads.succeeded(),
        "bagframes routine completed"
    );

    Ok(())
}

/// Initialize tracing/logging
fn init_logging(config: &LoggingConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let writer = match &config.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stdout),
    };

    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(config.file.is_none())
        .with_file(config.include_location)
        .with_line_number(config.include_location);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber.with(layer.json()).init();
    } else {
        subscriber.with(layer.pretty()).init();
    }

    Ok(())
}
