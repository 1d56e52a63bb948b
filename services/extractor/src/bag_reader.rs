//! ROS bag v2.0 container reader.
//!
//! A bag is a magic line followed by length-prefixed records. Message data
//! lives inside (optionally compressed) chunk records; an index section at the
//! end of the file lists every connection and, per chunk, its time span and
//! per-connection message counts.
//!
//! [`BagFile::read_messages`] walks chunks lazily: with an index, chunks whose
//! time span misses the requested range or that hold no selected connection
//! are skipped without being read. Without an index (a recording that was
//! never closed) the file is scanned record by record. Either way only one
//! decompressed chunk is held in memory.

use crate::error::BagError;
use crate::time_window::{RosTime, TimeRange};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::iter::FusedIterator;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, trace};

/// First line of every v2.0 bag.
pub const BAG_MAGIC: &[u8] = b"#ROSBAG V2.0\n";

/// Upper bound on buffer space reserved up front from a size read out of the file.
const MAX_PREALLOC: usize = 64 * 1024 * 1024;

/// Record kinds, stored in the `op` header field.
pub(crate) mod op {
    pub const MSG_DATA: u8 = 0x02;
    pub const BAG_HEADER: u8 = 0x03;
    pub const INDEX_DATA: u8 = 0x04;
    pub const CHUNK: u8 = 0x05;
    pub const CHUNK_INFO: u8 = 0x06;
    pub const CONNECTION: u8 = 0x07;
}

/// A topic/type pairing that messages in the bag refer to by id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub id: u32,
    pub topic: String,
    /// Declared message type, e.g. `sensor_msgs/Image`
    pub data_type: String,
    pub md5sum: String,
    pub message_definition: String,
    pub caller_id: Option<String>,
    pub latching: bool,
}

/// One message read from a bag.
#[derive(Debug, Clone)]
pub struct BagMessage {
    pub connection: Arc<Connection>,
    /// Time the message was recorded
    pub time: RosTime,
    /// Serialized message payload
    pub data: Vec<u8>,
}

impl BagMessage {
    pub fn topic(&self) -> &str {
        &self.connection.topic
    }

    pub fn data_type(&self) -> &str {
        &self.connection.data_type
    }
}

/// Index entry describing one chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub chunk_pos: u64,
    pub start_time: RosTime,
    pub end_time: RosTime,
    /// `(connection id, message count)` pairs
    pub message_counts: Vec<(u32, u32)>,
}

impl ChunkInfo {
    fn holds_any(&self, connections: &HashSet<u32>) -> bool {
        self.message_counts
            .iter()
            .any(|(conn, count)| *count > 0 && connections.contains(conn))
    }
}

/// An open bag file.
pub struct BagFile {
    path: PathBuf,
    reader: BufReader<File>,
    index_pos: u64,
    /// Offset of the first record after the bag header
    data_start: u64,
    chunk_count: u32,
    connections: BTreeMap<u32, Arc<Connection>>,
    chunk_infos: Vec<ChunkInfo>,
}

impl BagFile {
    /// Open a bag for reading and load its index, if it has one.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, BagError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 13];
        read_exact(&mut reader, &mut magic, "magic line")?;
        if magic != BAG_MAGIC {
            return Err(BagError::BadMagic(
                String::from_utf8_lossy(&magic).trim_end().to_string(),
            ));
        }

        let (header, data_len) =
            read_record_header(&mut reader)?.ok_or(BagError::Truncated("bag header"))?;
        expect_op(&header, op::BAG_HEADER, "bag header")?;
        let index_pos = header.u64("index_pos")?;
        let conn_count = header.u32("conn_count")?;
        let chunk_count = header.u32("chunk_count")?;
        skip_data(&mut reader, data_len, "bag header padding")?;
        let data_start = reader.stream_position()?;

        let mut bag = Self {
            path,
            reader,
            index_pos,
            data_start,
            chunk_count,
            connections: BTreeMap::new(),
            chunk_infos: Vec::new(),
        };

        if bag.is_indexed() {
            if index_pos >= file_len {
                return Err(BagError::Truncated("index section"));
            }
            bag.read_index()?;
            if bag.chunk_infos.len() < chunk_count as usize {
                return Err(BagError::Truncated("chunk index"));
            }
            if bag.connections.len() != conn_count as usize {
                debug!(
                    path = %bag.path.display(),
                    declared = conn_count,
                    found = bag.connections.len(),
                    "Connection count differs from bag header"
                );
            }
        }

        debug!(
            path = %bag.path.display(),
            indexed = bag.is_indexed(),
            connections = bag.connections.len(),
            chunks = bag.chunk_count,
            "Opened bag"
        );

        Ok(bag)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the bag was closed cleanly and carries an index section.
    pub fn is_indexed(&self) -> bool {
        self.index_pos != 0
    }

    /// Number of chunks declared in the bag header.
    pub fn chunk_count(&self) -> u32 {
        self.chunk_count
    }

    /// Connections known so far. For unindexed bags this grows as the file is read.
    pub fn connections(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values().map(Arc::as_ref)
    }

    pub fn chunk_infos(&self) -> &[ChunkInfo] {
        &self.chunk_infos
    }

    /// Lazily read messages in storage order.
    ///
    /// A message is yielded when its topic is in `topics` (an empty slice
    /// admits every topic), `filter` accepts its connection, and its time lies
    /// in `range`. Each call starts again from the beginning of the bag.
    pub fn read_messages<F>(
        &mut self,
        topics: &[String],
        range: TimeRange,
        mut filter: F,
    ) -> Messages<'_, F>
    where
        F: FnMut(&Connection) -> bool,
    {
        let topics: HashSet<String> = topics.iter().cloned().collect();

        let selected: HashSet<u32> = self
            .connections
            .values()
            .filter(|conn| selects(&topics, &mut filter, conn))
            .map(|conn| conn.id)
            .collect();

        let source = if self.is_indexed() {
            let mut positions: Vec<u64> = self
                .chunk_infos
                .iter()
                .filter(|info| range.overlaps(info.start_time, info.end_time))
                .filter(|info| info.holds_any(&selected))
                .map(|info| info.chunk_pos)
                .collect();
            positions.sort_unstable();

            trace!(
                path = %self.path.display(),
                selected_connections = selected.len(),
                chunks = positions.len(),
                total_chunks = self.chunk_infos.len(),
                "Chunks selected from index"
            );

            ChunkSource::Indexed(positions.into())
        } else {
            ChunkSource::Scan(self.data_start)
        };

        Messages {
            bag: self,
            topics,
            range,
            filter,
            selected,
            source,
            chunk: None,
            finished: false,
        }
    }

    fn read_index(&mut self) -> Result<(), BagError> {
        self.reader.seek(SeekFrom::Start(self.index_pos))?;

        while let Some((header, data_len)) = read_record_header(&mut self.reader)? {
            let data = read_data(&mut self.reader, data_len, "index record")?;
            match header.op()? {
                op::CONNECTION => {
                    let conn = parse_connection(&header, &data)?;
                    self.connections.insert(conn.id, Arc::new(conn));
                }
                op::CHUNK_INFO => self.chunk_infos.push(parse_chunk_info(&header, &data)?),
                found => {
                    return Err(BagError::UnexpectedOp {
                        found,
                        expected: "connection or chunk info in index section",
                    })
                }
            }
        }

        Ok(())
    }
}

/// Lazy, filtered sequence of messages returned by [`BagFile::read_messages`].
///
/// After the first error the iterator is exhausted.
pub struct Messages<'a, F> {
    bag: &'a mut BagFile,
    topics: HashSet<String>,
    range: TimeRange,
    filter: F,
    selected: HashSet<u32>,
    source: ChunkSource,
    chunk: Option<ChunkCursor>,
    finished: bool,
}

enum ChunkSource {
    /// Chunk offsets taken from the index, ascending
    Indexed(VecDeque<u64>),
    /// Offset of the next top-level record to scan
    Scan(u64),
}

struct ChunkCursor {
    data: Vec<u8>,
    pos: usize,
}

impl<'a, F> Messages<'a, F>
where
    F: FnMut(&Connection) -> bool,
{
    fn next_in_chunk(&mut self) -> Result<Option<BagMessage>, BagError> {
        loop {
            let Some(chunk) = self.chunk.as_mut() else {
                return Ok(None);
            };
            let Some((header, data)) = next_record_in(&chunk.data, &mut chunk.pos)? else {
                return Ok(None);
            };

            match header.op()? {
                op::MSG_DATA => {
                    let conn_id = header.u32("conn")?;
                    if !self.selected.contains(&conn_id) {
                        continue;
                    }
                    let time = header.time("time")?;
                    if !self.range.contains(time) {
                        continue;
                    }
                    let Some(connection) = self.bag.connections.get(&conn_id) else {
                        continue;
                    };
                    return Ok(Some(BagMessage {
                        connection: Arc::clone(connection),
                        time,
                        data: data.to_vec(),
                    }));
                }
                op::CONNECTION => {
                    let conn = parse_connection(&header, data)?;
                    self.register(conn);
                }
                _ => {}
            }
        }
    }

    fn load_next_chunk(&mut self) -> Result<Option<Vec<u8>>, BagError> {
        let scan_from = match &mut self.source {
            ChunkSource::Indexed(positions) => {
                return match positions.pop_front() {
                    Some(pos) => read_chunk_at(&mut self.bag.reader, pos).map(Some),
                    None => Ok(None),
                };
            }
            ChunkSource::Scan(pos) => *pos,
        };

        self.scan_for_chunk(scan_from)
    }

    /// Walk top-level records from `from` until the next chunk, learning
    /// connections on the way.
    fn scan_for_chunk(&mut self, from: u64) -> Result<Option<Vec<u8>>, BagError> {
        self.bag.reader.seek(SeekFrom::Start(from))?;

        while let Some((header, data_len)) = read_record_header(&mut self.bag.reader)? {
            match header.op()? {
                op::CHUNK => {
                    let data = read_data(&mut self.bag.reader, data_len, "chunk data")?;
                    self.source = ChunkSource::Scan(self.bag.reader.stream_position()?);
                    return decompress_chunk(&header, data).map(Some);
                }
                op::CONNECTION => {
                    let data = read_data(&mut self.bag.reader, data_len, "connection record")?;
                    let conn = parse_connection(&header, &data)?;
                    self.register(conn);
                }
                op::INDEX_DATA | op::CHUNK_INFO => {
                    skip_data(&mut self.bag.reader, data_len, "index record")?
                }
                other => {
                    trace!(op = other, "Skipping unexpected top-level record");
                    skip_data(&mut self.bag.reader, data_len, "record data")?
                }
            }
        }

        Ok(None)
    }

    fn register(&mut self, conn: Connection) {
        if self.bag.connections.contains_key(&conn.id) {
            return;
        }
        if selects(&self.topics, &mut self.filter, &conn) {
            self.selected.insert(conn.id);
        }
        trace!(
            conn = conn.id,
            topic = %conn.topic,
            data_type = %conn.data_type,
            md5sum = %conn.md5sum,
            definition_len = conn.message_definition.len(),
            caller_id = ?conn.caller_id,
            latching = conn.latching,
            "Discovered connection"
        );
        self.bag.connections.insert(conn.id, Arc::new(conn));
    }

    fn advance(&mut self) -> Result<Option<BagMessage>, BagError> {
        loop {
            if let Some(message) = self.next_in_chunk()? {
                return Ok(Some(message));
            }
            match self.load_next_chunk()? {
                Some(data) => self.chunk = Some(ChunkCursor { data, pos: 0 }),
                None => return Ok(None),
            }
        }
    }
}

impl<'a, F> Iterator for Messages<'a, F>
where
    F: FnMut(&Connection) -> bool,
{
    type Item = Result<BagMessage, BagError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.advance() {
            Ok(Some(message)) => Some(Ok(message)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                self.chunk = None;
                Some(Err(e))
            }
        }
    }
}

impl<'a, F> FusedIterator for Messages<'a, F> where F: FnMut(&Connection) -> bool {}

fn selects<F>(topics: &HashSet<String>, filter: &mut F, conn: &Connection) -> bool
where
    F: FnMut(&Connection) -> bool,
{
    (topics.is_empty() || topics.contains(&conn.topic)) && filter(conn)
}

/// Parsed `name=value` fields of a record header.
#[derive(Debug, Default)]
pub(crate) struct RecordHeader {
    fields: HashMap<String, Vec<u8>>,
}

impl RecordHeader {
    pub(crate) fn parse(bytes: &[u8]) -> Result<Self, BagError> {
        let mut fields = HashMap::new();
        let mut pos = 0;

        while pos < bytes.len() {
            let len = take_u32(bytes, &mut pos, "header field length")? as usize;
            let field = take(bytes, &mut pos, len, "header field")?;
            let eq = field
                .iter()
                .position(|&b| b == b'=')
                .ok_or_else(|| BagError::InvalidField {
                    field: "header",
                    message: "field has no '=' separator".to_string(),
                })?;
            fields.insert(
                String::from_utf8_lossy(&field[..eq]).into_owned(),
                field[eq + 1..].to_vec(),
            );
        }

        Ok(Self { fields })
    }

    fn get(&self, name: &'static str) -> Result<&[u8], BagError> {
        self.fields
            .get(name)
            .map(Vec::as_slice)
            .ok_or(BagError::MissingField(name))
    }

    fn fixed<const N: usize>(&self, name: &'static str) -> Result<[u8; N], BagError> {
        let value = self.get(name)?;
        value.try_into().map_err(|_| BagError::InvalidField {
            field: name,
            message: format!("expected {} bytes, found {}", N, value.len()),
        })
    }

    fn op(&self) -> Result<u8, BagError> {
        Ok(self.fixed::<1>("op")?[0])
    }

    fn u32(&self, name: &'static str) -> Result<u32, BagError> {
        Ok(u32::from_le_bytes(self.fixed(name)?))
    }

    fn u64(&self, name: &'static str) -> Result<u64, BagError> {
        Ok(u64::from_le_bytes(self.fixed(name)?))
    }

    fn time(&self, name: &'static str) -> Result<RosTime, BagError> {
        Ok(RosTime::from_le_bytes(self.fixed(name)?))
    }

    fn string(&self, name: &'static str) -> Result<String, BagError> {
        String::from_utf8(self.get(name)?.to_vec()).map_err(|e| BagError::InvalidField {
            field: name,
            message: e.to_string(),
        })
    }

    fn optional_string(&self, name: &str) -> Option<String> {
        self.fields
            .get(name)
            .map(|value| String::from_utf8_lossy(value).into_owned())
    }
}

fn expect_op(header: &RecordHeader, expected: u8, what: &'static str) -> Result<(), BagError> {
    let found = header.op()?;
    if found != expected {
        return Err(BagError::UnexpectedOp {
            found,
            expected: what,
        });
    }
    Ok(())
}

fn parse_connection(header: &RecordHeader, data: &[u8]) -> Result<Connection, BagError> {
    let details = RecordHeader::parse(data)?;

    Ok(Connection {
        id: header.u32("conn")?,
        topic: header.string("topic")?,
        data_type: details.string("type")?,
        md5sum: details.string("md5sum")?,
        message_definition: details
            .optional_string("message_definition")
            .unwrap_or_default(),
        caller_id: details.optional_string("callerid"),
        latching: details.optional_string("latching").as_deref() == Some("1"),
    })
}

fn parse_chunk_info(header: &RecordHeader, data: &[u8]) -> Result<ChunkInfo, BagError> {
    let version = header.u32("ver")?;
    if version != 1 {
        return Err(BagError::InvalidField {
            field: "ver",
            message: format!("unsupported chunk info version {}", version),
        });
    }

    let count = header.u32("count")?;
    let mut pos = 0;
    let mut message_counts = Vec::with_capacity((count as usize).min(data.len() / 8));
    for _ in 0..count {
        let conn = take_u32(data, &mut pos, "chunk info entry")?;
        let messages = take_u32(data, &mut pos, "chunk info entry")?;
        message_counts.push((conn, messages));
    }

    Ok(ChunkInfo {
        chunk_pos: header.u64("chunk_pos")?,
        start_time: header.time("start_time")?,
        end_time: header.time("end_time")?,
        message_counts,
    })
}

fn read_chunk_at<R: Read + Seek>(reader: &mut R, pos: u64) -> Result<Vec<u8>, BagError> {
    reader.seek(SeekFrom::Start(pos))?;
    let (header, data_len) =
        read_record_header(reader)?.ok_or(BagError::Truncated("chunk record"))?;
    expect_op(&header, op::CHUNK, "chunk")?;
    let data = read_data(reader, data_len, "chunk data")?;
    decompress_chunk(&header, data)
}

fn decompress_chunk(header: &RecordHeader, data: Vec<u8>) -> Result<Vec<u8>, BagError> {
    let compression = header.string("compression")?;
    let size = header.u32("size")? as usize;

    let decompressed = match compression.as_str() {
        "none" => data,
        "bz2" => {
            let mut out = Vec::with_capacity(size.min(MAX_PREALLOC));
            bzip2_rs::DecoderReader::new(data.as_slice()).read_to_end(&mut out)?;
            out
        }
        "lz4" => {
            let mut out = Vec::with_capacity(size.min(MAX_PREALLOC));
            lz4_flex::frame::FrameDecoder::new(data.as_slice()).read_to_end(&mut out)?;
            out
        }
        other => return Err(BagError::UnsupportedCompression(other.to_string())),
    };

    if decompressed.len() != size {
        return Err(BagError::ChunkSizeMismatch {
            declared: size,
            actual: decompressed.len(),
        });
    }

    Ok(decompressed)
}

/// Read the next record's header and data length, or `None` at a clean end of file.
fn read_record_header<R: Read>(reader: &mut R) -> Result<Option<(RecordHeader, u32)>, BagError> {
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        match reader.read(&mut len_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(BagError::Truncated("record header length")),
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }

    let header_bytes = read_data(reader, u32::from_le_bytes(len_buf), "record header")?;
    let header = RecordHeader::parse(&header_bytes)?;

    let mut data_len = [0u8; 4];
    read_exact(reader, &mut data_len, "record data length")?;

    Ok(Some((header, u32::from_le_bytes(data_len))))
}

fn read_data<R: Read>(reader: &mut R, len: u32, what: &'static str) -> Result<Vec<u8>, BagError> {
    let mut buf = Vec::new();
    reader.by_ref().take(u64::from(len)).read_to_end(&mut buf)?;
    if buf.len() != len as usize {
        return Err(BagError::Truncated(what));
    }
    Ok(buf)
}

fn skip_data<R: Read>(reader: &mut R, len: u32, what: &'static str) -> Result<(), BagError> {
    let skipped = std::io::copy(&mut reader.by_ref().take(u64::from(len)), &mut std::io::sink())?;
    if skipped != u64::from(len) {
        return Err(BagError::Truncated(what));
    }
    Ok(())
}

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &'static str) -> Result<(), BagError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => BagError::Truncated(what),
        _ => BagError::Io(e),
    })
}

/// Next record inside a decompressed chunk, or `None` at its end.
fn next_record_in<'b>(
    buf: &'b [u8],
    pos: &mut usize,
) -> Result<Option<(RecordHeader, &'b [u8])>, BagError> {
    if *pos >= buf.len() {
        return Ok(None);
    }
    let header_len = take_u32(buf, pos, "chunk record header length")? as usize;
    let header = RecordHeader::parse(take(buf, pos, header_len, "chunk record header")?)?;
    let data_len = take_u32(buf, pos, "chunk record data length")? as usize;
    let data = take(buf, pos, data_len, "chunk record data")?;
    Ok(Some((header, data)))
}

fn take<'b>(
    buf: &'b [u8],
    pos: &mut usize,
    len: usize,
    what: &'static str,
) -> Result<&'b [u8], BagError> {
    let end = pos
        .checked_add(len)
        .filter(|end| *end <= buf.len())
        .ok_or(BagError::Truncated(what))?;
    let slice = &buf[*pos..end];
    *pos = end;
    Ok(slice)
}

fn take_u32(buf: &[u8], pos: &mut usize, what: &'static str) -> Result<u32, BagError> {
    let bytes = take(buf, pos, 4, what)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}
