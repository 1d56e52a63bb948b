//! Declared-type allow-list applied to bag connections before any decoding.

use crate::bag_reader::Connection;
use serde::Deserialize;
use std::fmt;

/// The two image message kinds the pipeline extracts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    /// Uncompressed pixel buffer with width/height/encoding metadata
    Raw,
    /// Compressed stream (JPEG, PNG, ...)
    Compressed,
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageKind::Raw => write!(f, "raw"),
            ImageKind::Compressed => write!(f, "compressed"),
        }
    }
}

/// Wire type names that map onto [`ImageKind`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageTypes {
    /// Type name of raw image messages
    #[serde(default = "default_raw_type")]
    pub raw: String,
    /// Type name of compressed image messages
    #[serde(default = "default_compressed_type")]
    pub compressed: String,
}

fn default_raw_type() -> String {
    "sensor_msgs/Image".to_string()
}

fn default_compressed_type() -> String {
    "sensor_msgs/CompressedImage".to_string()
}

impl Default for ImageTypes {
    fn default() -> Self {
        Self {
            raw: default_raw_type(),
            compressed: default_compressed_type(),
        }
    }
}

impl ImageTypes {
    pub fn new(raw: impl Into<String>, compressed: impl Into<String>) -> Self {
        Self {
            raw: raw.into(),
            compressed: compressed.into(),
        }
    }

    /// Map a declared type onto an image kind. Anything else is `None`.
    pub fn classify(&self, data_type: &str) -> Option<ImageKind> {
        if data_type == self.raw {
            Some(ImageKind::Raw)
        } else if data_type == self.compressed {
            Some(ImageKind::Compressed)
        } else {
            None
        }
    }

    /// Connection predicate handed to the bag reader.
    pub fn admits(&self, connection: &Connection) -> bool {
        self.classify(&connection.data_type).is_some()
    }

    /// Directory label for a kind: the last `/` segment of its type name,
    /// so `sensor_msgs/Image` becomes `Image`.
    pub fn label(&self, kind: ImageKind) -> &str {
        let name = match kind {
            ImageKind::Raw => &self.raw,
            ImageKind::Compressed => &self.compressed,
        };
        name.rsplit('/').next().unwrap_or(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection(data_type: &str) -> Connection {
        Connection {
            id: 0,
            topic: "/cam".to_string(),
            data_type: data_type.to_string(),
            md5sum: String::new(),
            message_definition: String::new(),
            caller_id: None,
            latching: false,
        }
    }

    #[test]
    fn test_classify_default_types() {
        let types = ImageTypes::default();
        assert_eq!(types.classify("sensor_msgs/Image"), Some(ImageKind::Raw));
        assert_eq!(
            types.classify("sensor_msgs/CompressedImage"),
            Some(ImageKind::Compressed)
        );
        assert_eq!(types.classify("sensor_msgs/Imu"), None);
        // Matching is exact, not by suffix
        assert_eq!(types.classify("Image"), None);
    }

    #[test]
    fn test_unknown_types_are_not_admitted() {
        let types = ImageTypes::default();
        assert!(types.admits(&connection("sensor_msgs/Image")));
        assert!(!types.admits(&connection("sensor_msgs/PointCloud2")));
        assert!(!types.admits(&connection("")));
    }

    #[test]
    fn test_labels() {
        let types = ImageTypes::default();
        assert_eq!(types.label(ImageKind::Raw), "Image");
        assert_eq!(types.label(ImageKind::Compressed), "CompressedImage");

        let custom = ImageTypes::new("RawImage", "CompressedImage");
        assert_eq!(custom.label(ImageKind::Raw), "RawImage");
    }
}
