//! Decoding of image message payloads into in-memory pixel buffers.
//!
//! Both kinds decode to a [`DecodedFrame`] wrapping an
//! [`image::DynamicImage`], so the writer never needs to know which kind of
//! message a frame came from. Raw images are serialized `sensor_msgs/Image`
//! messages; compressed images are serialized `sensor_msgs/CompressedImage`
//! messages whose data is sniffed and decoded by the `image` crate.

use crate::error::DecodeError;
use crate::image_filter::ImageKind;
use image::{DynamicImage, GenericImageView, ImageBuffer, Luma, Rgb, Rgba};

/// Length of the depth quantization header that precedes the PNG stream of a
/// `compressedDepth` image.
const COMPRESSED_DEPTH_HEADER_LEN: usize = 12;

/// A decoded image frame.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    image: DynamicImage,
    source_format: String,
}

impl DecodedFrame {
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn image(&self) -> &DynamicImage {
        &self.image
    }

    /// The message's `encoding` (raw) or `format` (compressed) string.
    pub fn source_format(&self) -> &str {
        &self.source_format
    }
}

/// Decode a message payload of the given kind.
pub fn decode(kind: ImageKind, payload: &[u8]) -> Result<DecodedFrame, DecodeError> {
    match kind {
        ImageKind::Raw => decode_raw(payload),
        ImageKind::Compressed => decode_compressed(payload),
    }
}

fn decode_raw(payload: &[u8]) -> Result<DecodedFrame, DecodeError> {
    let mut cursor = MessageCursor::new(payload);
    cursor.skip_std_header()?;
    let height = cursor.read_u32("height")?;
    let width = cursor.read_u32("width")?;
    let encoding = cursor.read_string("encoding")?;
    let is_bigendian = cursor.read_u8("is_bigendian")? != 0;
    let step = cursor.read_u32("step")?;
    let data = cursor.read_bytes("data")?;

    let layout = PixelLayout::for_encoding(&encoding)
        .ok_or_else(|| DecodeError::UnsupportedEncoding(encoding.clone()))?;

    if width == 0 || height == 0 {
        return Err(DecodeError::EmptyImage { width, height });
    }

    let row_bytes = width as usize * layout.channels * layout.sample_bytes;
    let step = step as usize;
    if step < row_bytes {
        return Err(DecodeError::InvalidStep {
            step: step as u32,
            row_bytes,
        });
    }

    let expected = step
        .checked_mul(height as usize - 1)
        .and_then(|padded| padded.checked_add(row_bytes))
        .unwrap_or(usize::MAX);
    if data.len() < expected {
        return Err(DecodeError::DataSize {
            expected,
            actual: data.len(),
        });
    }

    let rows = (0..height as usize).map(|y| &data[y * step..y * step + row_bytes]);
    let image = match layout.sample_bytes {
        1 => layout.build_8bit(width, height, rows),
        _ => layout.build_16bit(width, height, rows, is_bigendian),
    }
    .ok_or(DecodeError::DataSize {
        expected,
        actual: data.len(),
    })?;

    Ok(DecodedFrame {
        image,
        source_format: encoding,
    })
}

fn decode_compressed(payload: &[u8]) -> Result<DecodedFrame, DecodeError> {
    let mut cursor = MessageCursor::new(payload);
    cursor.skip_std_header()?;
    let format = cursor.read_string("format")?;
    let mut data = cursor.read_bytes("data")?;

    if format.contains("compressedDepth") {
        if data.len() < COMPRESSED_DEPTH_HEADER_LEN {
            return Err(DecodeError::Truncated("compressed depth header"));
        }
        data = &data[COMPRESSED_DEPTH_HEADER_LEN..];
    }

    let image = image::load_from_memory(data)?;

    Ok(DecodedFrame {
        image,
        source_format: format,
    })
}

/// Memory layout implied by a raw image `encoding`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PixelLayout {
    channels: usize,
    sample_bytes: usize,
    /// Stored as BGR(A); swap to RGB(A)
    swap_rb: bool,
}

impl PixelLayout {
    fn for_encoding(encoding: &str) -> Option<Self> {
        let (channels, sample_bytes, swap_rb) = match encoding {
            "mono8" | "8UC1" => (1, 1, false),
            "mono16" | "16UC1" => (1, 2, false),
            "rgb8" => (3, 1, false),
            "bgr8" | "8UC3" => (3, 1, true),
            "rgba8" => (4, 1, false),
            "bgra8" | "8UC4" => (4, 1, true),
            "rgb16" => (3, 2, false),
            "bgr16" | "16UC3" => (3, 2, true),
            "rgba16" => (4, 2, false),
            "bgra16" | "16UC4" => (4, 2, true),
            _ => return None,
        };
        Some(Self {
            channels,
            sample_bytes,
            swap_rb,
        })
    }

    fn build_8bit<'a>(
        &self,
        width: u32,
        height: u32,
        rows: impl Iterator<Item = &'a [u8]>,
    ) -> Option<DynamicImage> {
        let mut samples: Vec<u8> = rows.flatten().copied().collect();
        if self.swap_rb {
            samples
                .chunks_exact_mut(self.channels)
                .for_each(|px| px.swap(0, 2));
        }

        match self.channels {
            1 => ImageBuffer::<Luma<u8>, _>::from_raw(width, height, samples)
                .map(DynamicImage::ImageLuma8),
            3 => ImageBuffer::<Rgb<u8>, _>::from_raw(width, height, samples)
                .map(DynamicImage::ImageRgb8),
            _ => ImageBuffer::<Rgba<u8>, _>::from_raw(width, height, samples)
                .map(DynamicImage::ImageRgba8),
        }
    }

    fn build_16bit<'a>(
        &self,
        width: u32,
        height: u32,
        rows: impl Iterator<Item = &'a [u8]>,
        big_endian: bool,
    ) -> Option<DynamicImage> {
        let mut samples: Vec<u16> = rows
            .flat_map(|row| row.chunks_exact(2))
            .map(|pair| {
                let bytes = [pair[0], pair[1]];
                if big_endian {
                    u16::from_be_bytes(bytes)
                } else {
                    u16::from_le_bytes(bytes)
                }
            })
            .collect();
        if self.swap_rb {
            samples
                .chunks_exact_mut(self.channels)
                .for_each(|px| px.swap(0, 2));
        }

        match self.channels {
            1 => ImageBuffer::<Luma<u16>, _>::from_raw(width, height, samples)
                .map(DynamicImage::ImageLuma16),
            3 => ImageBuffer::<Rgb<u16>, _>::from_raw(width, height, samples)
                .map(DynamicImage::ImageRgb16),
            _ => ImageBuffer::<Rgba<u16>, _>::from_raw(width, height, samples)
                .map(DynamicImage::ImageRgba16),
        }
    }
}

/// Reader for the ROS1 message serialization (little-endian, u32 length prefixes).
struct MessageCursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> MessageCursor<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(DecodeError::Truncated(what))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn read_u8(&mut self, what: &'static str) -> Result<u8, DecodeError> {
        Ok(self.take(1, what)?[0])
    }

    fn read_u32(&mut self, what: &'static str) -> Result<u32, DecodeError> {
        let b = self.take(4, what)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_bytes(&mut self, what: &'static str) -> Result<&'a [u8], DecodeError> {
        let len = self.read_u32(what)? as usize;
        self.take(len, what)
    }

    fn read_string(&mut self, what: &'static str) -> Result<String, DecodeError> {
        Ok(String::from_utf8_lossy(self.read_bytes(what)?).into_owned())
    }

    /// Skip `std_msgs/Header`: seq, stamp, frame_id.
    fn skip_std_header(&mut self) -> Result<(), DecodeError> {
        self.take(12, "header")?;
        self.read_bytes("header frame_id")?;
        Ok(())
    }
}
