//! Output naming and image writing.
//!
//! Layout of the produced tree:
//!
//! ```text
//! {root}/{channel}/{type}/{window start}_{window end}/{time}-{nsecs}({bag name}).png
//! ```
//!
//! The path depends only on its inputs, so a re-run over the same bags and
//! window overwrites the files of the previous run instead of adding new ones.

use crate::error::{ExtractError, Result};
use crate::frame_decoder::DecodedFrame;
use crate::time_window::RosTime;
use image::ImageFormat;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Extension of every produced file.
pub const OUTPUT_EXTENSION: &str = "png";

/// Compute the output file path for one frame.
///
/// * `source_file` - bag the frame came from; its lowercased stem ends the file name
/// * `topic` - channel the frame was recorded on
/// * `type_label` - directory label of the frame's declared type
/// * `time` - record time of the frame
/// * `window_suffix` - folder component derived from the extraction window
pub fn output_path(
    root: &Path,
    source_file: &Path,
    topic: &str,
    type_label: &str,
    time: RosTime,
    window_suffix: &str,
) -> PathBuf {
    let file_name = format!(
        "{}({}).{}",
        time.file_token(),
        source_base_name(source_file),
        OUTPUT_EXTENSION
    );

    root.join(channel_token(topic))
        .join(type_label)
        .join(window_suffix)
        .join(file_name)
}

/// Bag file name without directory or extension, lowercased.
pub fn source_base_name(source_file: &Path) -> String {
    source_file
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Topic with its leading `/` removed and remaining separators turned into `_`.
pub fn channel_token(topic: &str) -> String {
    topic.strip_prefix('/').unwrap_or(topic).replace('/', "_")
}

/// Destination for decoded frames.
pub trait FrameSink {
    /// Store `frame` at `path`, replacing anything already there.
    fn write(&mut self, path: &Path, frame: &DecodedFrame) -> Result<()>;
}

/// Writes frames as PNG files, creating directories as needed.
#[derive(Debug, Default, Clone, Copy)]
pub struct PngSink;

impl PngSink {
    /// Make sure the directory exists. Safe to call repeatedly.
    fn ensure_dir(dir: &Path) -> Result<()> {
        fs::create_dir_all(dir).map_err(|source| ExtractError::CreateDir {
            path: dir.to_path_buf(),
            source,
        })
    }
}

impl FrameSink for PngSink {
    fn write(&mut self, path: &Path, frame: &DecodedFrame) -> Result<()> {
        if let Some(dir) = path.parent() {
            Self::ensure_dir(dir)?;
        }

        frame
            .image()
            .save_with_format(path, ImageFormat::Png)
            .map_err(|source| ExtractError::WriteImage {
                path: path.to_path_buf(),
                source,
            })?;

        trace!(
            path = %path.display(),
            width = frame.width(),
            height = frame.height(),
            "Frame written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame_decoder::decode;
    use crate::image_filter::ImageKind;
    use crate::test_support::{raw_image_payload, tiny_raw_image};
    use image::GenericImageView;
    use tempfile::TempDir;

    const SUFFIX: &str = "2023-08-22_18-33-48_2023-08-22_18-33-52";

    #[test]
    fn test_output_path_layout() {
        let path = output_path(
            Path::new("/data/pictures"),
            Path::new("/data/s3/bg/Run_01.BAG"),
            "/realsense_gripper/color/image_raw/compressed",
            "CompressedImage",
            RosTime::new(1_692_729_229, 42),
            SUFFIX,
        );

        assert_eq!(
            path,
            PathBuf::from(
                "/data/pictures/realsense_gripper_color_image_raw_compressed/CompressedImage/\
                 2023-08-22_18-33-48_2023-08-22_18-33-52/2023-08-22_18-33-49-42(run_01).png"
            )
        );
    }

    #[test]
    fn test_output_path_is_deterministic() {
        let args = (
            Path::new("out"),
            Path::new("in/a.bag"),
            "/cam/image_raw",
            "Image",
            RosTime::new(200, 0),
        );
        let first = output_path(args.0, args.1, args.2, args.3, args.4, SUFFIX);
        let second = output_path(args.0, args.1, args.2, args.3, args.4, SUFFIX);
        assert_eq!(first, second);
    }

    #[test]
    fn test_channel_token() {
        assert_eq!(channel_token("/cam/image_raw"), "cam_image_raw");
        assert_eq!(channel_token("cam/image_raw"), "cam_image_raw");
        // Only one leading separator is stripped
        assert_eq!(channel_token("//cam"), "_cam");
    }

    #[test]
    fn test_source_base_name() {
        assert_eq!(source_base_name(Path::new("/x/Flight.Test.BAG")), "flight.test");
        assert_eq!(source_base_name(Path::new("plain")), "plain");
    }

    #[test]
    fn test_png_sink_creates_dirs_and_overwrites() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c/frame.png");
        let mut sink = PngSink;

        let small = decode(ImageKind::Raw, &tiny_raw_image()).unwrap();
        sink.write(&path, &small).unwrap();
        assert!(path.exists());

        let larger = decode(
            ImageKind::Raw,
            &raw_image_payload(3, 1, "mono8", false, 3, &[1, 2, 3]),
        )
        .unwrap();
        sink.write(&path, &larger).unwrap();

        let reloaded = image::open(&path).unwrap();
        assert_eq!((reloaded.width(), reloaded.height()), (3, 1));
        assert_eq!(fs::read_dir(path.parent().unwrap()).unwrap().count(), 1);
    }

    #[test]
    fn test_png_sink_reports_directory_errors() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, b"file, not a directory").unwrap();

        let frame = decode(ImageKind::Raw, &tiny_raw_image()).unwrap();
        let result = PngSink.write(&blocker.join("frame.png"), &frame);
        assert!(matches!(result, Err(ExtractError::CreateDir { .. })));
    }
}
