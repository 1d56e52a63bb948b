//! Concurrent bag downloads and image tree publishing.
//!
//! Every object is transferred independently: a failed item is logged and
//! reported, the rest of the batch carries on.

use crate::object_store::{ObjectEntry, ObjectStore};
use anyhow::{anyhow, Context, Result};
use bagframes_extractor::has_bag_extension;
use futures::stream::{self, StreamExt};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use walkdir::WalkDir;

/// Result of transferring one object.
#[derive(Debug)]
pub struct TransferOutcome {
    pub key: String,
    pub local_path: Option<PathBuf>,
    pub result: Result<u64>,
}

impl TransferOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Outcomes of one batch, sorted by key.
#[derive(Debug, Default)]
pub struct TransferReport {
    pub outcomes: Vec<TransferOutcome>,
}

impl TransferReport {
    fn from_outcomes(mut outcomes: Vec<TransferOutcome>) -> Self {
        outcomes.sort_by(|a, b| a.key.cmp(&b.key));
        Self { outcomes }
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_ok()).count()
    }

    pub fn failed(&self) -> impl Iterator<Item = &TransferOutcome> {
        self.outcomes.iter().filter(|o| !o.is_ok())
    }
}

/// Downloads the bag files of a bucket prefix into a local directory.
pub struct BagDownloader {
    store: Arc<dyn ObjectStore>,
    concurrency: usize,
}

impl BagDownloader {
    pub fn new(store: Arc<dyn ObjectStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Download every `.bag` object under `prefix` to `{bag_dir}/{key}`.
    #[instrument(skip(self, bag_dir), fields(bag_dir = %bag_dir.display()))]
    pub async fn download_bags(&self, prefix: &str, bag_dir: &Path) -> Result<TransferReport> {
        let entries = self
            .store
            .list(prefix)
            .await
            .context("Failed to list source bucket")?;

        let bags: Vec<ObjectEntry> = entries.into_iter().filter(|e| is_bag_key(&e.key)).collect();
        info!(count = bags.len(), "Downloading bag files");

        let outcomes = stream::iter(bags)
            .map(|entry| {
                let store = Arc::clone(&self.store);
                async move { download_one(store.as_ref(), entry, bag_dir).await }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let report = TransferReport::from_outcomes(outcomes);
        info!(
            downloaded = report.succeeded(),
            failed = report.failed().count(),
            "Bag download finished"
        );
        Ok(report)
    }
}

async fn download_one(
    store: &dyn ObjectStore,
    entry: ObjectEntry,
    bag_dir: &Path,
) -> TransferOutcome {
    let Some(local_path) = local_path_for(bag_dir, &entry.key) else {
        warn!(key = %entry.key, "Refusing to download key outside the bag directory");
        return TransferOutcome {
            result: Err(anyhow!("Unsafe object key {}", entry.key)),
            key: entry.key,
            local_path: None,
        };
    };

    debug!(key = %entry.key, size = entry.size, "Downloading");
    let result = store.download(&entry.key, &local_path).await;
    match &result {
        Ok(bytes) => info!(key = %entry.key, bytes, "Downloaded"),
        Err(e) => warn!(key = %entry.key, error = %e, "Download failed"),
    }

    TransferOutcome {
        key: entry.key,
        local_path: Some(local_path),
        result,
    }
}

/// A key that names a bag file and not a directory marker.
fn is_bag_key(key: &str) -> bool {
    !key.ends_with('/') && has_bag_extension(Path::new(key))
}

/// Local path of `key` under `dir`, or `None` when the key would escape it.
pub fn local_path_for(dir: &Path, key: &str) -> Option<PathBuf> {
    let relative = Path::new(key);
    let safe = relative.components().next().is_some()
        && relative
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    safe.then(|| dir.join(relative))
}

/// Replaces the contents of a bucket with a local directory tree.
pub struct TreePublisher {
    store: Arc<dyn ObjectStore>,
    concurrency: usize,
}

impl TreePublisher {
    pub fn new(store: Arc<dyn ObjectStore>, concurrency: usize) -> Self {
        Self {
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Empty the bucket, then upload every file under `root` keyed by its
    /// `/`-separated path relative to `root`.
    #[instrument(skip(self, root), fields(root = %root.display()))]
    pub async fn publish(&self, root: &Path) -> Result<TransferReport> {
        let files = collect_files(root)?;

        let deleted = self
            .store
            .delete_all()
            .await
            .context("Failed to empty destination bucket")?;
        info!(deleted, "Destination bucket emptied");

        let outcomes = stream::iter(files)
            .map(|(path, key)| {
                let store = Arc::clone(&self.store);
                async move {
                    let result = store.upload(&path, &key).await.map(|()| 0);
                    if let Err(e) = &result {
                        warn!(key = %key, error = %e, "Upload failed");
                    }
                    TransferOutcome {
                        key,
                        local_path: Some(path),
                        result,
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let report = TransferReport::from_outcomes(outcomes);
        info!(
            stored = report.succeeded(),
            failed = report.failed().count(),
            "Stored {} files",
            report.succeeded()
        );
        Ok(report)
    }
}

/// Every regular file under `root` with its object key, sorted by path.
/// A missing root is an empty tree.
pub fn collect_files(root: &Path) -> Result<Vec<(PathBuf, String)>> {
    if !root.exists() {
        warn!(root = %root.display(), "Output directory does not exist, nothing to upload");
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", root.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry.path().strip_prefix(root).with_context(|| {
            format!("{} is not under {}", entry.path().display(), root.display())
        })?;
        files.push((entry.path().to_path_buf(), object_key(relative)));
    }

    Ok(files)
}

fn object_key(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
