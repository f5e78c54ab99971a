//! Incremental decoding of the stream into [`StreamRecord`]s

use crate::{
    Error,
    metadata::{MetadataDefinition, MetadataTable},
    reader::Reader,
    record::{EventData, FORMAT_ID, SERIALIZER_ID, StreamRecord, TraceHeader, TraceTime},
};
use std::{io::Read, sync::Arc};

/// Fast serialization tags
pub(crate) mod tag {
    pub const NULL_REFERENCE: u8 = 1;
    pub const BEGIN_PRIVATE_OBJECT: u8 = 5;
    pub const END_OBJECT: u8 = 6;
}

/// Type names of the objects in the stream
pub(crate) mod object {
    pub const TRACE: &str = "Trace";
    pub const EVENT_BLOCK: &str = "EventBlock";
    pub const METADATA_BLOCK: &str = "MetadataBlock";
    pub const STACK_BLOCK: &str = "StackBlock";
    pub const SEQUENCE_POINT_BLOCK: &str = "SPBlock";
}

/// Flags of a compressed event header, each one marks a field that differs
/// from the previous event in the block
pub(crate) mod header_flags {
    pub const METADATA_ID: u8 = 1 << 0;
    pub const CAPTURE_THREAD_AND_SEQUENCE: u8 = 1 << 1;
    pub const THREAD_ID: u8 = 1 << 2;
    pub const STACK_ID: u8 = 1 << 3;
    pub const ACTIVITY_ID: u8 = 1 << 4;
    pub const RELATED_ACTIVITY_ID: u8 = 1 << 5;
    pub const SORTED: u8 = 1 << 6;
    pub const DATA_LENGTH: u8 = 1 << 7;
}

/// Block header flag for compressed event headers
pub(crate) const COMPRESSED_HEADERS: u16 = 1;
/// Bit of the metadata id in uncompressed headers that marks sorted events
pub(crate) const SORTED_BIT: u32 = 1 << 31;
/// Size of an uncompressed event header, not counting the leading size field
pub(crate) const UNCOMPRESSED_HEADER_SIZE: usize = 76;
/// Size of the body of the `Trace` object
pub(crate) const TRACE_BODY_SIZE: usize = 48;

/// The newest format version that can be read
const READER_VERSION: i32 = 4;
const PREAMBLE_SIZE: usize = FORMAT_ID.len() + 4 + SERIALIZER_ID.len();
const MAX_NAME_LEN: usize = 256;
const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024;
const READ_CHUNK: usize = 64 * 1024;

/// Evaluates to the value, or bails with `Ok(None)` if more input is needed
macro_rules! need {
    ($e:expr) => {
        match $e {
            Some(v) => v,
            None => return Ok(None),
        }
    };
}

/// The header fields that compressed events inherit from the one before
#[derive(Clone, Debug, Default)]
pub(crate) struct HeaderState {
    pub(crate) metadata_id: u32,
    pub(crate) sequence_number: u32,
    pub(crate) capture_thread_id: u64,
    pub(crate) processor_number: u32,
    pub(crate) thread_id: u64,
    pub(crate) stack_id: u32,
    pub(crate) timestamp: u64,
    pub(crate) activity_id: uuid::Uuid,
    pub(crate) related_activity_id: uuid::Uuid,
    pub(crate) payload_size: u32,
}

impl HeaderState {
    fn read_compressed(&mut self, r: &mut Reader<'_>) -> Option<EventData> {
        use header_flags as hf;

        let flags = r.u8()?;

        if flags & hf::METADATA_ID != 0 {
            self.metadata_id = r.var_u32()?;
        }

        if flags & hf::CAPTURE_THREAD_AND_SEQUENCE != 0 {
            let delta = r.var_u32()?;
            self.sequence_number = self.sequence_number.wrapping_add(delta.wrapping_add(1));
            self.capture_thread_id = r.var_u64()?;
            self.processor_number = r.var_u32()?;
        } else if self.metadata_id != 0 {
            self.sequence_number = self.sequence_number.wrapping_add(1);
        }

        if flags & hf::THREAD_ID != 0 {
            self.thread_id = r.var_u64()?;
        }

        if flags & hf::STACK_ID != 0 {
            self.stack_id = r.var_u32()?;
        }

        self.timestamp = self.timestamp.wrapping_add(r.var_u64()?);

        if flags & hf::ACTIVITY_ID != 0 {
            self.activity_id = r.guid()?;
        }

        if flags & hf::RELATED_ACTIVITY_ID != 0 {
            self.related_activity_id = r.guid()?;
        }

        if flags & hf::DATA_LENGTH != 0 {
            self.payload_size = r.var_u32()?;
        }

        let payload = r.take(self.payload_size as usize)?.to_vec();

        Some(EventData {
            metadata_id: self.metadata_id,
            sequence_number: self.sequence_number,
            thread_id: self.thread_id,
            capture_thread_id: self.capture_thread_id,
            processor_number: self.processor_number,
            stack_id: self.stack_id,
            timestamp: self.timestamp,
            activity_id: self.activity_id,
            related_activity_id: self.related_activity_id,
            is_sorted: flags & hf::SORTED != 0,
            payload,
        })
    }
}

fn read_uncompressed(r: &mut Reader<'_>) -> Option<EventData> {
    let event_size = usize::try_from(r.read::<i32>()?).ok()?;
    if event_size < UNCOMPRESSED_HEADER_SIZE {
        return None;
    }

    let mut body = Reader::new(r.take(event_size)?);

    let raw_id: u32 = body.read()?;
    let sequence_number = body.read()?;
    let thread_id = body.read()?;
    let capture_thread_id = body.read()?;
    let processor_number = body.read()?;
    let stack_id = body.read()?;
    let timestamp = body.read()?;
    let activity_id = body.guid()?;
    let related_activity_id = body.guid()?;
    let payload_size: u32 = body.read()?;
    let payload = body.take(payload_size as usize)?.to_vec();

    Some(EventData {
        metadata_id: raw_id & !SORTED_BIT,
        sequence_number,
        thread_id,
        capture_thread_id,
        processor_number,
        stack_id,
        timestamp,
        activity_id,
        related_activity_id,
        is_sorted: raw_id & SORTED_BIT != 0,
        payload,
    })
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum BlockKind {
    Metadata,
    Event,
}

enum Entry {
    Metadata(MetadataDefinition),
    Event(EventData),
}

/// A fully buffered block that is drained one event at a time
struct BlockReader {
    kind: BlockKind,
    data: Vec<u8>,
    pos: usize,
    /// Stream offset of `data`
    offset: u64,
    compressed: bool,
    state: HeaderState,
}

impl BlockReader {
    fn new(kind: BlockKind, data: Vec<u8>, offset: u64) -> Result<Self, Error> {
        let mut r = Reader::new(&data);
        let (header_size, flags) = r
            .read::<u16>()
            .zip(r.read::<u16>())
            .ok_or_else(|| Error::parse(offset, "truncated block header"))?;

        let header_size = usize::from(header_size);
        if header_size < 4 || header_size > data.len() {
            return Err(Error::parse(
                offset,
                format!("invalid block header size {header_size}"),
            ));
        }

        Ok(Self {
            kind,
            data,
            pos: header_size,
            offset,
            compressed: flags & COMPRESSED_HEADERS != 0,
            state: HeaderState::default(),
        })
    }

    fn next_entry(&mut self) -> Result<Option<Entry>, Error> {
        if self.pos >= self.data.len() {
            return Ok(None);
        }

        let start = self.pos;
        let event_offset = self.offset + start as u64;
        let mut r = Reader::new(&self.data[start..]);

        let event = if self.compressed {
            self.state.read_compressed(&mut r)
        } else {
            read_uncompressed(&mut r)
        };
        let event = event.ok_or_else(|| Error::parse(event_offset, "truncated event"))?;
        let payload_offset = event_offset + (r.pos() - event.payload.len()) as u64;

        if !self.compressed {
            // Uncompressed events are aligned relative to the block
            let pad = (4 - (start + r.pos()) % 4) % 4;
            let _ = r.skip(pad.min(r.remaining()));
        }

        self.pos += r.pos();

        match self.kind {
            BlockKind::Metadata => {
                MetadataDefinition::parse(&event.payload, payload_offset)
                    .map(|def| Some(Entry::Metadata(def)))
            }
            BlockKind::Event => Ok(Some(Entry::Event(event))),
        }
    }
}

enum State {
    Preamble,
    TraceObject,
    Objects,
    Block(BlockReader),
    Finished,
    Failed { offset: u64, reason: String },
}

/// The next object after the trace object
enum Next {
    Block(BlockReader),
    Skipped,
    End,
}

struct ObjectHeader {
    name: String,
    version: i32,
    min_reader_version: i32,
}

fn object_header(r: &mut Reader<'_>, base: u64) -> Result<Option<ObjectHeader>, Error> {
    let fail = |r: &Reader<'_>, reason: String| Error::parse(base + r.pos() as u64, reason);

    for expected in [
        tag::BEGIN_PRIVATE_OBJECT,
        tag::BEGIN_PRIVATE_OBJECT,
        tag::NULL_REFERENCE,
    ] {
        let found = need!(r.u8());
        if found != expected {
            return Err(fail(
                r,
                format!("expected tag {expected} but found {found}"),
            ));
        }
    }

    let version: i32 = need!(r.read());
    let min_reader_version: i32 = need!(r.read());
    let name_len: i32 = need!(r.read());

    let name_len = usize::try_from(name_len)
        .ok()
        .filter(|len| *len <= MAX_NAME_LEN)
        .ok_or_else(|| fail(r, format!("invalid object name length {name_len}")))?;

    let name = need!(r.take(name_len));
    let name = std::str::from_utf8(name)
        .map_err(|_err| fail(r, "object name is not utf-8".to_owned()))?
        .to_owned();

    let end = need!(r.u8());
    if end != tag::END_OBJECT {
        return Err(fail(r, format!("type of '{name}' is not terminated")));
    }

    Ok(Some(ObjectHeader {
        name,
        version,
        min_reader_version,
    }))
}

fn trace_header(object: ObjectHeader, body: &[u8]) -> Option<TraceHeader> {
    let mut r = Reader::new(body);

    let start_time = TraceTime {
        year: r.read()?,
        month: r.read()?,
        day_of_week: r.read()?,
        day: r.read()?,
        hour: r.read()?,
        minute: r.read()?,
        second: r.read()?,
        milliseconds: r.read()?,
    };

    Some(TraceHeader {
        format_id: FORMAT_ID.to_owned(),
        serializer_id: SERIALIZER_ID.to_owned(),
        version: object.version,
        min_reader_version: object.min_reader_version,
        start_time,
        sync_time_qpc: r.read()?,
        qpc_frequency: r.read()?,
        pointer_size: r.read()?,
        process_id: r.read()?,
        num_processors: r.read()?,
        expected_cpu_sampling_rate: r.read()?,
    })
}

/// Push based parser for a single stream.
///
/// Bytes can be supplied in chunks of any size, a record is only produced
/// once all of its bytes are available, and chunk boundaries never change
/// the sequence of records that is produced.
pub struct StreamParser {
    buf: Vec<u8>,
    /// Start of the unconsumed bytes in `buf`
    start: usize,
    /// Stream offset of `buf[start]`
    offset: u64,
    state: State,
    metadata: MetadataTable,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            start: 0,
            offset: 0,
            state: State::Preamble,
            metadata: MetadataTable::default(),
        }
    }

    /// Appends the next chunk of the stream
    pub fn push(&mut self, chunk: &[u8]) {
        self.compact();
        self.buf.extend_from_slice(chunk);
    }

    /// Every definition seen so far
    #[inline]
    pub fn metadata_table(&self) -> &MetadataTable {
        &self.metadata
    }

    #[inline]
    pub fn metadata(&self, metadata_id: u32) -> Option<&Arc<MetadataDefinition>> {
        self.metadata.get(metadata_id)
    }

    /// The stream offset of the first byte that hasn't been consumed yet
    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Decodes the next record from the bytes pushed so far, or `None` if
    /// more bytes are needed to complete it.
    ///
    /// [`Error::DuplicateMetadataId`] and [`Error::UnknownMetadataId`] consume
    /// the event that caused them, polling again continues with the next one.
    /// After a [`Error::Parse`] the stream can't be resynchronized and every
    /// poll fails the same way.
    pub fn poll_record(&mut self) -> Result<Option<StreamRecord>, Error> {
        let res = self.advance();
        if let Err(Error::Parse { offset, reason }) = &res {
            self.state = State::Failed {
                offset: *offset,
                reason: reason.clone(),
            };
        }
        res
    }

    /// Reads from `source` until the next record is complete.
    ///
    /// The source reaching EOF between records ends the stream, reaching it
    /// in the middle of a record is [`Error::TransportClosed`].
    pub fn next_record<R: Read + ?Sized>(&mut self, source: &mut R) -> Result<StreamRecord, Error> {
        loop {
            if let Some(record) = self.poll_record()? {
                return Ok(record);
            }

            self.compact();
            let len = self.buf.len();
            self.buf.resize(len + READ_CHUNK, 0);

            let read = source.read(&mut self.buf[len..]);
            self.buf.truncate(len + read.as_ref().map_or(0, |read| *read));

            match read {
                Ok(0) => {
                    if self.start == self.buf.len()
                        && matches!(self.state, State::Preamble | State::Objects)
                    {
                        log::debug!("stream ended without an end marker at {}", self.offset);
                        self.state = State::Finished;
                        return Ok(StreamRecord::EndOfStream);
                    }

                    return Err(Error::TransportClosed {
                        offset: self.offset,
                    });
                }
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn advance(&mut self) -> Result<Option<StreamRecord>, Error> {
        loop {
            match self.state {
                State::Preamble => {
                    need!(self.preamble()?);
                    self.state = State::TraceObject;
                }
                State::TraceObject => {
                    let header = need!(self.trace_object()?);
                    self.state = State::Objects;
                    return Ok(Some(StreamRecord::Header(header)));
                }
                State::Objects => match need!(self.next_object()?) {
                    Next::Block(block) => self.state = State::Block(block),
                    Next::Skipped => {}
                    Next::End => {
                        self.state = State::Finished;
                        return Ok(Some(StreamRecord::EndOfStream));
                    }
                },
                State::Block(ref mut block) => match block.next_entry()? {
                    Some(Entry::Metadata(def)) => {
                        let def = self.metadata.insert(def)?;
                        return Ok(Some(StreamRecord::MetadataDefinition(def)));
                    }
                    Some(Entry::Event(event)) => {
                        if self.metadata.get(event.metadata_id).is_none() {
                            return Err(Error::UnknownMetadataId(event.metadata_id));
                        }
                        return Ok(Some(StreamRecord::EventData(event)));
                    }
                    None => self.state = State::Objects,
                },
                State::Finished => return Ok(Some(StreamRecord::EndOfStream)),
                State::Failed {
                    offset,
                    ref reason,
                } => return Err(Error::parse(offset, reason.clone())),
            }
        }
    }

    #[inline]
    fn pending(&self) -> &[u8] {
        &self.buf[self.start..]
    }

    #[inline]
    fn consume(&mut self, len: usize) {
        self.start += len;
        self.offset += len as u64;
    }

    fn compact(&mut self) {
        if self.start > 0 {
            self.buf.drain(..self.start);
            self.start = 0;
        }
    }

    fn preamble(&mut self) -> Result<Option<()>, Error> {
        let pending = self.pending();

        // Reject garbage as soon as it can be told apart
        let magic_len = pending.len().min(FORMAT_ID.len());
        if pending[..magic_len] != FORMAT_ID.as_bytes()[..magic_len] {
            return Err(Error::parse(0, "stream does not start with 'Nettrace'"));
        }

        if pending.len() < PREAMBLE_SIZE {
            return Ok(None);
        }

        let mut r = Reader::new(pending);
        need!(r.skip(FORMAT_ID.len()));
        let len: i32 = need!(r.read());
        let serializer = need!(r.take(SERIALIZER_ID.len()));

        if usize::try_from(len).ok() != Some(SERIALIZER_ID.len())
            || serializer != SERIALIZER_ID.as_bytes()
        {
            return Err(Error::parse(
                FORMAT_ID.len() as u64,
                "unsupported serializer",
            ));
        }

        self.consume(PREAMBLE_SIZE);
        Ok(Some(()))
    }

    fn trace_object(&mut self) -> Result<Option<TraceHeader>, Error> {
        let base = self.offset;
        let mut r = Reader::new(self.pending());

        let object = need!(object_header(&mut r, base)?);
        if object.name != object::TRACE {
            return Err(Error::parse(
                base,
                format!("expected the Trace object but found '{}'", object.name),
            ));
        }

        if object.min_reader_version > READER_VERSION {
            return Err(Error::parse(
                base,
                format!(
                    "trace requires reader version {} but only {READER_VERSION} is supported",
                    object.min_reader_version
                ),
            ));
        }

        let body = need!(r.take(TRACE_BODY_SIZE));
        let end = need!(r.u8());
        if end != tag::END_OBJECT {
            return Err(Error::parse(base + r.pos() as u64 - 1, "unterminated Trace object"));
        }

        let used = r.pos();
        let header = trace_header(object, body)
            .ok_or_else(|| Error::parse(base, "truncated Trace object"))?;

        self.consume(used);
        Ok(Some(header))
    }

    fn next_object(&mut self) -> Result<Option<Next>, Error> {
        let base = self.offset;

        match need!(self.pending().first().copied()) {
            tag::NULL_REFERENCE => {
                self.consume(1);
                return Ok(Some(Next::End));
            }
            tag::BEGIN_PRIVATE_OBJECT => {}
            other => {
                return Err(Error::parse(
                    base,
                    format!("unexpected tag {other} at object position"),
                ));
            }
        }

        let mut r = Reader::new(self.pending());
        let object = need!(object_header(&mut r, base)?);

        let size: i32 = need!(r.read());
        let size = usize::try_from(size)
            .ok()
            .filter(|size| *size <= MAX_BLOCK_SIZE)
            .ok_or_else(|| {
                Error::parse(
                    base + r.pos() as u64 - 4,
                    format!("invalid size {size} for block '{}'", object.name),
                )
            })?;

        // Block contents are aligned in the stream, not the object
        let pad = ((4 - (base + r.pos() as u64) % 4) % 4) as usize;
        need!(r.skip(pad));

        let data_offset = base + r.pos() as u64;
        let data = need!(r.take(size));

        let end = need!(r.u8());
        if end != tag::END_OBJECT {
            return Err(Error::parse(
                base + r.pos() as u64 - 1,
                format!("block '{}' is not terminated", object.name),
            ));
        }

        let used = r.pos();
        let kind = match object.name.as_str() {
            object::EVENT_BLOCK => Some(BlockKind::Event),
            object::METADATA_BLOCK => Some(BlockKind::Metadata),
            object::STACK_BLOCK | object::SEQUENCE_POINT_BLOCK => None,
            name => {
                log::debug!("skipping unknown object '{name}' at {base}");
                None
            }
        };

        let next = match kind {
            Some(kind) => Next::Block(BlockReader::new(kind, data.to_vec(), data_offset)?),
            None => Next::Skipped,
        };

        self.consume(used);
        Ok(Some(next))
    }
}
