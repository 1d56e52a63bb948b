//! Bagframes Extractor - image frame extraction from ROS bag recordings
//!
//! Reads every bag file in a directory, keeps the image messages recorded on
//! the selected topics inside a time window, and writes each one as a PNG into
//! a deterministic directory tree:
//!
//! ```text
//! *.bag ──► BagFile::read_messages ──► ImageTypes ──► decode ──► FrameSink
//!           (topics, time range)       (type filter)  (raw or    (PNG under
//!                                                      compressed) output_path)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use bagframes_extractor::{Extractor, ImageTypes};
//! use std::path::Path;
//!
//! fn main() -> Result<(), bagframes_extractor::ExtractError> {
//!     let mut extractor = Extractor::new(
//!         "/data/pictures",
//!         vec!["/camera/image_raw".to_string()],
//!         ImageTypes::default(),
//!     );
//!     let report = extractor.run(
//!         Path::new("/data/bags"),
//!         Some("2023-08-22 18:33:48"),
//!         Some("2023-08-22 18:33:52"),
//!     )?;
//!     println!("{} frames written", report.frames_written());
//!     Ok(())
//! }
//! ```

pub mod bag_reader;
pub mod batch;
pub mod error;
pub mod frame_decoder;
pub mod image_filter;
pub mod output_writer;
pub mod time_window;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use bag_reader::{BagFile, BagMessage, ChunkInfo, Connection};
pub use batch::{
    has_bag_extension, list_bag_files, BatchReport, ExtractionSettings, Extractor, FileReport,
    BAG_EXTENSION,
};
pub use error::{BagError, DecodeError, ExtractError};
pub use frame_decoder::{decode, DecodedFrame};
pub use image_filter::{ImageKind, ImageTypes};
pub use output_writer::{output_path, FrameSink, PngSink};
pub use time_window::{RosTime, TimeRange, TimeWindow};
