//! Error types for the extraction pipeline.
//!
//! The variants follow the severity split of the batch driver: a
//! [`ExtractError::InvalidWindow`] stops the whole run, a [`BagError`] stops
//! one bag file, and a [`DecodeError`] or write failure stops one frame.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading a bag container.
#[derive(Debug, Error)]
pub enum BagError {
    #[error("I/O error reading bag: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not a ROS bag v2.0 file (found {0:?})")]
    BadMagic(String),

    #[error("Bag truncated while reading {0}")]
    Truncated(&'static str),

    #[error("Record header is missing field '{0}'")]
    MissingField(&'static str),

    #[error("Invalid value for field '{field}': {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },

    #[error("Unexpected record op {found:#04x} (expected {expected})")]
    UnexpectedOp { found: u8, expected: &'static str },

    #[error("Unsupported chunk compression: {0}")]
    UnsupportedCompression(String),

    #[error("Chunk decompressed to {actual} bytes, header declared {declared}")]
    ChunkSizeMismatch { declared: usize, actual: usize },
}

/// Errors raised while decoding an image message payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("Message payload truncated while reading {0}")]
    Truncated(&'static str),

    #[error("Unsupported image encoding: {0}")]
    UnsupportedEncoding(String),

    #[error("Image has zero size ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },

    #[error("Image data too short: need {expected} bytes, have {actual}")]
    DataSize { expected: usize, actual: usize },

    #[error("Row stride {step} is smaller than packed row size {row_bytes}")]
    InvalidStep { step: u32, row_bytes: usize },

    #[error("Message type {0} is not an image type")]
    NotAnImage(String),

    #[error("Compressed image could not be decoded: {0}")]
    Image(#[from] image::ImageError),
}

/// Top-level errors of the extraction pipeline.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("Invalid filter time {value:?}: expected YYYY-MM-DD HH:MM:SS")]
    InvalidTime { value: String },

    #[error("Start filter time {start} is later than end filter time {end}")]
    InvalidWindow { start: String, end: String },

    #[error("Cannot list input directory {path}: {source}")]
    InputDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Bag(#[from] BagError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("Cannot create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot write image {path}: {source}")]
    WriteImage {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

pub type Result<T, E = ExtractError> = std::result::Result<T, E>;
