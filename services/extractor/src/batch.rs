//! Batch driver: runs every bag in a directory through
//! read → filter → decode → write, one file and one frame at a time.

use crate::bag_reader::{BagFile, BagMessage};
use crate::error::{DecodeError, ExtractError, Result};
use crate::frame_decoder::decode;
use crate::image_filter::ImageTypes;
use crate::output_writer::{output_path, FrameSink, PngSink};
use crate::time_window::{TimeRange, TimeWindow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument, warn};

/// Extension of bag files picked up from the input directory (case-insensitive).
pub const BAG_EXTENSION: &str = "bag";

/// What to extract.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExtractionSettings {
    /// Topics to extract frames from (empty = every image topic)
    #[serde(default)]
    pub topics: Vec<String>,
    /// Message type names treated as images
    #[serde(default)]
    pub image_types: ImageTypes,
    /// Window start, `YYYY-MM-DD HH:MM:SS` in UTC
    #[serde(default)]
    pub min_filter_time: Option<String>,
    /// Window end, `YYYY-MM-DD HH:MM:SS` in UTC
    #[serde(default)]
    pub max_filter_time: Option<String>,
}

/// Outcome of processing one bag file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReport {
    pub path: PathBuf,
    pub frames_written: usize,
    pub frames_failed: usize,
    /// Set when the bag could not be opened or read to the end
    pub error: Option<String>,
}

impl FileReport {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            frames_written: 0,
            frames_failed: 0,
            error: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Outcome of a batch run, one entry per bag in processing order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub files: Vec<FileReport>,
}

impl BatchReport {
    pub fn frames_written(&self) -> usize {
        self.files.iter().map(|f| f.frames_written).sum()
    }

    pub fn frames_failed(&self) -> usize {
        self.files.iter().map(|f| f.frames_failed).sum()
    }

    pub fn failed_files(&self) -> impl Iterator<Item = &FileReport> {
        self.files.iter().filter(|f| !f.is_ok())
    }
}

/// Drives bag files through the extraction pipeline.
pub struct Extractor<S = PngSink> {
    output_root: PathBuf,
    topics: Vec<String>,
    image_types: ImageTypes,
    sink: S,
}

impl Extractor<PngSink> {
    /// Extractor writing PNG files under `output_root`.
    pub fn new(
        output_root: impl Into<PathBuf>,
        topics: Vec<String>,
        image_types: ImageTypes,
    ) -> Self {
        Self::with_sink(output_root, topics, image_types, PngSink)
    }
}

impl<S: FrameSink> Extractor<S> {
    pub fn with_sink(
        output_root: impl Into<PathBuf>,
        topics: Vec<String>,
        image_types: ImageTypes,
        sink: S,
    ) -> Self {
        Self {
            output_root: output_root.into(),
            topics,
            image_types,
            sink,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Parse and validate the window, then process every bag in `input_dir`.
    ///
    /// An invalid window is reported before any file is touched.
    pub fn run(
        &mut self,
        input_dir: &Path,
        start: Option<&str>,
        end: Option<&str>,
    ) -> Result<BatchReport> {
        info!(
            input_dir = %input_dir.display(),
            topics = ?self.topics,
            start = ?start,
            end = ?end,
            "Processing bag files started"
        );

        let window = TimeWindow::parse(start, end).map_err(|e| {
            error!(error = %e, "Invalid filter window, no files processed");
            e
        })?;

        self.run_window(input_dir, &window)
    }

    /// Process every bag in `input_dir`, sorted by file name, within `window`.
    pub fn run_window(&mut self, input_dir: &Path, window: &TimeWindow) -> Result<BatchReport> {
        let files = list_bag_files(input_dir)?;
        let window_suffix = window.folder_suffix();
        let range = window.range();

        debug!(
            files = files.len(),
            window = %window_suffix,
            "Bag files to process"
        );
        if range.is_empty() {
            warn!(
                window = %window_suffix,
                "Window lies outside the range of bag timestamps, no frames will match"
            );
        }

        let mut report = BatchReport::default();
        for path in &files {
            report
                .files
                .push(self.process_file(path, range, &window_suffix));
        }

        info!(
            files = report.files.len(),
            failed_files = report.failed_files().count(),
            frames_written = report.frames_written(),
            frames_failed = report.frames_failed(),
            "Processing bag files finished"
        );

        Ok(report)
    }

    /// Extract every admitted frame of one bag.
    ///
    /// Never fails: open and read errors end this file and are recorded in
    /// the report; decode and write errors skip one frame.
    #[instrument(skip(self, path, range, window_suffix), fields(file = %path.display()))]
    pub fn process_file(
        &mut self,
        path: &Path,
        range: TimeRange,
        window_suffix: &str,
    ) -> FileReport {
        info!("Processing file");
        let mut report = FileReport::new(path);

        let mut bag = match BagFile::open(path) {
            Ok(bag) => bag,
            Err(e) => {
                error!(error = %e, "Failed to open bag");
                report.error = Some(e.to_string());
                return report;
            }
        };

        let types = &self.image_types;
        let sink = &mut self.sink;
        let root = self.output_root.as_path();

        for item in bag.read_messages(&self.topics, range, |conn| types.admits(conn)) {
            let message = match item {
                Ok(message) => message,
                Err(e) => {
                    error!(error = %e, "Failed to read bag, skipping rest of file");
                    report.error = Some(e.to_string());
                    break;
                }
            };

            match extract_frame(types, sink, root, path, &message, window_suffix) {
                Ok(written) => {
                    report.frames_written += 1;
                    info!(output = %written.display(), "Written file");
                }
                Err(e) => {
                    report.frames_failed += 1;
                    warn!(
                        topic = %message.topic(),
                        time = %message.time,
                        error = %e,
                        "Failed to extract frame"
                    );
                }
            }
        }

        report
    }
}

fn extract_frame<S: FrameSink>(
    types: &ImageTypes,
    sink: &mut S,
    root: &Path,
    source: &Path,
    message: &BagMessage,
    window_suffix: &str,
) -> Result<PathBuf> {
    let kind = types
        .classify(message.data_type())
        .ok_or_else(|| DecodeError::NotAnImage(message.data_type().to_string()))?;

    let frame = decode(kind, &message.data)?;
    let path = output_path(
        root,
        source,
        message.topic(),
        types.label(kind),
        message.time,
        window_suffix,
    );
    sink.write(&path, &frame)?;

    Ok(path)
}

/// Bag files directly inside `dir`, sorted by file name.
pub fn list_bag_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = fs::read_dir(dir).map_err(|source| ExtractError::InputDir {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry.path()),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Failed to read directory entry");
                None
            }
        })
        .filter(|path| path.is_file() && has_bag_extension(path))
        .collect();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    Ok(files)
}

pub fn has_bag_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map_or(false, |ext| ext.eq_ignore_ascii_case(BAG_EXTENSION))
}
