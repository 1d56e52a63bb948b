//! Synthetic bag and message builders for unit tests.

use crate::bag_reader::{op, BAG_MAGIC};
use crate::time_window::RosTime;
use image::{DynamicImage, ImageOutputFormat, Rgb, RgbImage};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::path::Path;

pub const RAW_IMAGE: &str = "sensor_msgs/Image";
pub const COMPRESSED_IMAGE: &str = "sensor_msgs/CompressedImage";

#[derive(Debug, Clone, Copy)]
pub enum Compression {
    None,
    Lz4,
    /// Use the checked-in bz2 chunk; the chunk must match [`bz2_image_chunk`]
    Bz2,
    /// Store the data uncompressed but write this name into the chunk header
    Label(&'static str),
}

type Message = (u32, RosTime, Vec<u8>);

/// bz2 body of a chunk holding `/cam/image_raw` (connection 0) followed by
/// messages `a` at 100 s and `b` at 120 s.
const BZ2_IMAGE_CHUNK: &[u8] = include_bytes!("testdata/image_chunk.bz2");

/// Bag whose single chunk is the checked-in bz2 fixture.
pub fn bz2_image_chunk() -> BagBuilder {
    BagBuilder::new()
        .connection(0, "/cam/image_raw", RAW_IMAGE)
        .chunk_with(
            Compression::Bz2,
            vec![
                (0, RosTime::new(100, 0), b"a".to_vec()),
                (0, RosTime::new(120, 0), b"b".to_vec()),
            ],
        )
}

/// Builds a ROS bag v2.0 byte image.
pub struct BagBuilder {
    connections: BTreeMap<u32, (String, String)>,
    chunks: Vec<(Compression, Vec<Message>)>,
    compression: Compression,
    indexed: bool,
}

impl BagBuilder {
    pub fn new() -> Self {
        Self {
            connections: BTreeMap::new(),
            chunks: Vec::new(),
            compression: Compression::None,
            indexed: true,
        }
    }

    pub fn connection(mut self, id: u32, topic: &str, data_type: &str) -> Self {
        self.connections
            .insert(id, (topic.to_string(), data_type.to_string()));
        self
    }

    /// Add a chunk using the builder's default compression.
    pub fn chunk(self, messages: Vec<Message>) -> Self {
        let compression = self.compression;
        self.chunk_with(compression, messages)
    }

    pub fn chunk_with(mut self, compression: Compression, messages: Vec<Message>) -> Self {
        self.chunks.push((compression, messages));
        self
    }

    /// Default compression for chunks added after this call.
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        for chunk in &mut self.chunks {
            chunk.0 = compression;
        }
        self
    }

    /// Leave `index_pos` at zero and omit the index section.
    pub fn unindexed(mut self) -> Self {
        self.indexed = false;
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let prefix_len = BAG_MAGIC.len() + self.bag_header(0).len();
        let mut body = Vec::new();
        let mut chunk_infos = Vec::new();
        let mut written_connections = Vec::new();

        for (compression, messages) in &self.chunks {
            let chunk_pos = (prefix_len + body.len()) as u64;

            let mut inner = Vec::new();
            let mut offsets: BTreeMap<u32, Vec<(RosTime, u32)>> = BTreeMap::new();
            for (conn, time, data) in messages {
                if !written_connections.contains(conn) {
                    inner.extend(self.connection_record(*conn));
                    written_connections.push(*conn);
                }
                offsets
                    .entry(*conn)
                    .or_default()
                    .push((*time, inner.len() as u32));
                inner.extend(record(
                    &[
                        ("op", vec![op::MSG_DATA]),
                        ("conn", conn.to_le_bytes().to_vec()),
                        ("time", time.to_le_bytes().to_vec()),
                    ],
                    data,
                ));
            }

            let (label, stored) = compress(*compression, &inner);
            body.extend(record(
                &[
                    ("op", vec![op::CHUNK]),
                    ("compression", label.as_bytes().to_vec()),
                    ("size", (inner.len() as u32).to_le_bytes().to_vec()),
                ],
                &stored,
            ));

            for (conn, entries) in &offsets {
                let mut data = Vec::new();
                for (time, offset) in entries {
                    data.extend(time.to_le_bytes());
                    data.extend(offset.to_le_bytes());
                }
                body.extend(record(
                    &[
                        ("op", vec![op::INDEX_DATA]),
                        ("ver", 1u32.to_le_bytes().to_vec()),
                        ("conn", conn.to_le_bytes().to_vec()),
                        ("count", (entries.len() as u32).to_le_bytes().to_vec()),
                    ],
                    &data,
                ));
            }

            let start = messages.iter().map(|m| m.1).min().unwrap_or_default();
            let end = messages.iter().map(|m| m.1).max().unwrap_or_default();
            let counts: Vec<(u32, u32)> = offsets
                .iter()
                .map(|(conn, entries)| (*conn, entries.len() as u32))
                .collect();
            chunk_infos.push((chunk_pos, start, end, counts));
        }

        let index_pos = if self.indexed {
            let index_pos = (prefix_len + body.len()) as u64;
            for id in self.connections.keys() {
                body.extend(self.connection_record(*id));
            }
            for (chunk_pos, start, end, counts) in &chunk_infos {
                let mut data = Vec::new();
                for (conn, count) in counts {
                    data.extend(conn.to_le_bytes());
                    data.extend(count.to_le_bytes());
                }
                body.extend(record(
                    &[
                        ("op", vec![op::CHUNK_INFO]),
                        ("ver", 1u32.to_le_bytes().to_vec()),
                        ("chunk_pos", chunk_pos.to_le_bytes().to_vec()),
                        ("start_time", start.to_le_bytes().to_vec()),
                        ("end_time", end.to_le_bytes().to_vec()),
                        ("count", (counts.len() as u32).to_le_bytes().to_vec()),
                    ],
                    &data,
                ));
            }
            index_pos
        } else {
            0
        };

        let mut out = BAG_MAGIC.to_vec();
        out.extend(self.bag_header(index_pos));
        out.extend(body);
        out
    }

    pub fn write_to(&self, path: &Path) {
        std::fs::File::create(path)
            .and_then(|mut f| f.write_all(&self.build()))
            .expect("write test bag");
    }

    fn bag_header(&self, index_pos: u64) -> Vec<u8> {
        let (conn_count, chunk_count) = if self.indexed {
            (self.connections.len() as u32, self.chunks.len() as u32)
        } else {
            (0, 0)
        };
        record(
            &[
                ("op", vec![op::BAG_HEADER]),
                ("index_pos", index_pos.to_le_bytes().to_vec()),
                ("conn_count", conn_count.to_le_bytes().to_vec()),
                ("chunk_count", chunk_count.to_le_bytes().to_vec()),
            ],
            &[b' '; 32],
        )
    }

    fn connection_record(&self, id: u32) -> Vec<u8> {
        let (topic, data_type) = self
            .connections
            .get(&id)
            .cloned()
            .unwrap_or_else(|| (format!("/unknown_{}", id), "std_msgs/Empty".to_string()));
        let details = header_bytes(&[
            ("topic", topic.as_bytes().to_vec()),
            ("type", data_type.as_bytes().to_vec()),
            ("md5sum", b"060021388200f6f0f447d0fcd9c64743".to_vec()),
            ("message_definition", b"# test".to_vec()),
        ]);
        record(
            &[
                ("op", vec![op::CONNECTION]),
                ("conn", id.to_le_bytes().to_vec()),
                ("topic", topic.as_bytes().to_vec()),
            ],
            &details,
        )
    }
}

fn compress(compression: Compression, data: &[u8]) -> (&'static str, Vec<u8>) {
    match compression {
        Compression::None => ("none", data.to_vec()),
        Compression::Label(label) => (label, data.to_vec()),
        Compression::Lz4 => {
            let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
            encoder.write_all(data).expect("lz4 encode");
            ("lz4", encoder.finish().expect("lz4 finish"))
        }
        Compression::Bz2 => {
            let mut inflated = Vec::new();
            bzip2_rs::DecoderReader::new(BZ2_IMAGE_CHUNK)
                .read_to_end(&mut inflated)
                .expect("bz2 fixture");
            assert_eq!(inflated, data, "chunk does not match the bz2 fixture");
            ("bz2", BZ2_IMAGE_CHUNK.to_vec())
        }
    }
}

fn header_bytes(fields: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in fields {
        let len = (name.len() + 1 + value.len()) as u32;
        out.extend(len.to_le_bytes());
        out.extend(name.as_bytes());
        out.push(b'=');
        out.extend(value);
    }
    out
}

fn record(fields: &[(&str, Vec<u8>)], data: &[u8]) -> Vec<u8> {
    let header = header_bytes(fields);
    let mut out = Vec::new();
    out.extend((header.len() as u32).to_le_bytes());
    out.extend(header);
    out.extend((data.len() as u32).to_le_bytes());
    out.extend(data);
    out
}

fn ros_string(out: &mut Vec<u8>, value: &[u8]) {
    out.extend((value.len() as u32).to_le_bytes());
    out.extend(value);
}

fn ros_header(out: &mut Vec<u8>) {
    out.extend(7u32.to_le_bytes()); // seq
    out.extend(RosTime::new(1, 2).to_le_bytes());
    ros_string(out, b"camera_link");
}

/// Serialized `sensor_msgs/Image`.
pub fn raw_image_payload(
    width: u32,
    height: u32,
    encoding: &str,
    is_bigendian: bool,
    step: u32,
    data: &[u8],
) -> Vec<u8> {
    let mut out = Vec::new();
    ros_header(&mut out);
    out.extend(height.to_le_bytes());
    out.extend(width.to_le_bytes());
    ros_string(&mut out, encoding.as_bytes());
    out.push(u8::from(is_bigendian));
    out.extend(step.to_le_bytes());
    ros_string(&mut out, data);
    out
}

/// Serialized `sensor_msgs/CompressedImage`.
pub fn compressed_image_payload(format: &str, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    ros_header(&mut out);
    ros_string(&mut out, format.as_bytes());
    ros_string(&mut out, data);
    out
}

/// Small mono8 image message, convenient where pixel content does not matter.
pub fn tiny_raw_image() -> Vec<u8> {
    raw_image_payload(2, 2, "mono8", false, 2, &[0, 64, 128, 255])
}

/// PNG bytes of a `width` x `height` image with a red top-left pixel.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let mut img = RgbImage::from_pixel(width, height, Rgb([0, 0, 255]));
    img.put_pixel(0, 0, Rgb([255, 0, 0]));
    encode(DynamicImage::ImageRgb8(img), ImageOutputFormat::Png)
}

/// JPEG bytes of a uniform gray image.
pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([128, 128, 128]));
    encode(DynamicImage::ImageRgb8(img), ImageOutputFormat::Jpeg(90))
}

fn encode(img: DynamicImage, format: ImageOutputFormat) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    img.write_to(&mut out, format).expect("encode test image");
    out.into_inner()
}
