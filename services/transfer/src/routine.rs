//! The full routine: download bags, extract frames, publish the image tree.

use crate::config::Config;
use crate::object_store::{ObjectStore, S3ObjectStore};
use crate::transfer::{BagDownloader, TransferReport, TreePublisher};
use anyhow::{Context, Result};
use bagframes_extractor::{BatchReport, Extractor, TimeWindow};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, instrument};

/// Summary of one routine run.
#[derive(Debug)]
pub struct RoutineReport {
    pub downloads: TransferReport,
    pub extraction: BatchReport,
    pub uploads: TransferReport,
}

pub struct Routine {
    config: Config,
    source: Arc<dyn ObjectStore>,
    destination: Arc<dyn ObjectStore>,
}

impl Routine {
    pub fn new(
        config: Config,
        source: Arc<dyn ObjectStore>,
        destination: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            config,
            source,
            destination,
        }
    }

    /// Routine backed by the S3 buckets named in `config`.
    pub async fn from_config(config: Config) -> Result<Self> {
        let source = S3ObjectStore::new(&config.source)
            .await
            .context("Failed to initialize source bucket")?;
        let destination = S3ObjectStore::new(&config.destination)
            .await
            .context("Failed to initialize destination bucket")?;

        Ok(Self::new(config, Arc::new(source), Arc::new(destination)))
    }

    /// Run download → extract → publish.
    ///
    /// An invalid window stops the run before anything is transferred.
    #[instrument(
        skip(self),
        fields(
            source = %self.config.source.bucket,
            destination = %self.config.destination.bucket
        )
    )]
    pub async fn run(&self) -> Result<RoutineReport> {
        let window = self.config.window().map_err(|e| {
            error!(error = %e, "Invalid filter window, nothing processed");
            e
        })?;

        let concurrency = self.config.transfer.concurrency;
        let staging = &self.config.staging;

        let downloads = BagDownloader::new(Arc::clone(&self.source), concurrency)
            .download_bags(&self.config.source.prefix, &staging.bag_dir)
            .await?;

        let extraction = self.extract(window).await?;

        let uploads = TreePublisher::new(Arc::clone(&self.destination), concurrency)
            .publish(&staging.pictures_dir)
            .await?;

        info!(
            bags_downloaded = downloads.succeeded(),
            frames_written = extraction.frames_written(),
            frames_failed = extraction.frames_failed(),
            files_stored = uploads.succeeded(),
            "Routine finished"
        );

        Ok(RoutineReport {
            downloads,
            extraction,
            uploads,
        })
    }

    /// Extraction is synchronous file work, so it runs on the blocking pool.
    async fn extract(&self, window: TimeWindow) -> Result<BatchReport> {
        let input_dir = self.config.input_dir();
        tokio::fs::create_dir_all(&input_dir)
            .await
            .with_context(|| format!("Failed to create {}", input_dir.display()))?;

        let output_root: PathBuf = self.config.staging.pictures_dir.clone();
        let settings = self.config.extraction.clone();

        let report = tokio::task::spawn_blocking(move || {
            let mut extractor = Extractor::new(output_root, settings.topics, settings.image_types);
            extractor.run_window(&input_dir, &window)
        })
        .await
        .context("Extraction task panicked")?
        .context("Extraction failed")?;

        Ok(report)
    }
}
