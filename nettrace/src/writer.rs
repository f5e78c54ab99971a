//! Serialization of streams, for runtimes that are simulated rather than real
//! and for exercising the parser

use crate::{
    metadata::{FieldDefinition, FieldType, MetadataDefinition},
    parser::{
        COMPRESSED_HEADERS, HeaderState, SORTED_BIT, TRACE_BODY_SIZE, UNCOMPRESSED_HEADER_SIZE,
        header_flags as hf, object, tag,
    },
    record::{EventData, TraceHeader},
};

const BLOCK_VERSION: i32 = 2;
const BLOCK_HEADER_SIZE: u16 = 20;

/// Builds a stream one block at a time
pub struct NettraceWriter {
    buf: Vec<u8>,
    compressed: bool,
}

impl NettraceWriter {
    /// Starts a stream with the preamble and the `Trace` object
    pub fn new(header: &TraceHeader) -> Self {
        let mut w = Self {
            buf: Vec::new(),
            compressed: true,
        };

        w.buf.extend_from_slice(header.format_id.as_bytes());
        w.i32(header.serializer_id.len() as i32);
        w.buf.extend_from_slice(header.serializer_id.as_bytes());

        w.begin_object(object::TRACE, header.version, header.min_reader_version);
        let body_start = w.buf.len();

        let t = &header.start_time;
        for part in [
            t.year,
            t.month,
            t.day_of_week,
            t.day,
            t.hour,
            t.minute,
            t.second,
            t.milliseconds,
        ] {
            w.buf.extend_from_slice(&part.to_le_bytes());
        }
        w.buf.extend_from_slice(&header.sync_time_qpc.to_le_bytes());
        w.buf.extend_from_slice(&header.qpc_frequency.to_le_bytes());
        w.i32(header.pointer_size);
        w.i32(header.process_id);
        w.i32(header.num_processors);
        w.i32(header.expected_cpu_sampling_rate);

        debug_assert_eq!(w.buf.len() - body_start, TRACE_BODY_SIZE);
        w.buf.push(tag::END_OBJECT);
        w
    }

    /// Writes event headers in their fixed size form rather than the default
    /// compressed form
    pub fn uncompressed_headers(mut self) -> Self {
        self.compressed = false;
        self
    }

    pub fn metadata_block(&mut self, defs: &[MetadataDefinition]) -> &mut Self {
        let events: Vec<_> = defs
            .iter()
            .map(|def| EventData {
                payload: encode_metadata(def),
                ..Default::default()
            })
            .collect();

        let content = self.block_content(&events);
        self.block(object::METADATA_BLOCK, &content);
        self
    }

    pub fn event_block(&mut self, events: &[EventData]) -> &mut Self {
        let content = self.block_content(events);
        self.block(object::EVENT_BLOCK, &content);
        self
    }

    /// A block of stacks, each one the raw bytes of its frames
    pub fn stack_block(&mut self, stacks: &[&[u8]]) -> &mut Self {
        let mut content = Vec::new();
        content.extend_from_slice(&1i32.to_le_bytes());
        content.extend_from_slice(&(stacks.len() as i32).to_le_bytes());
        for stack in stacks {
            content.extend_from_slice(&(stack.len() as i32).to_le_bytes());
            content.extend_from_slice(stack);
        }

        self.block(object::STACK_BLOCK, &content);
        self
    }

    /// A sequence point without any thread sequence numbers
    pub fn sequence_point_block(&mut self, timestamp: u64) -> &mut Self {
        let mut content = Vec::new();
        content.extend_from_slice(&timestamp.to_le_bytes());
        content.extend_from_slice(&0i32.to_le_bytes());

        self.block(object::SEQUENCE_POINT_BLOCK, &content);
        self
    }

    /// Terminates the stream with the end marker
    pub fn finish(mut self) -> Vec<u8> {
        self.buf.push(tag::NULL_REFERENCE);
        self.buf
    }

    /// The stream so far, without an end marker
    #[inline]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    #[inline]
    fn i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn begin_object(&mut self, name: &str, version: i32, min_reader_version: i32) {
        self.buf.extend_from_slice(&[
            tag::BEGIN_PRIVATE_OBJECT,
            tag::BEGIN_PRIVATE_OBJECT,
            tag::NULL_REFERENCE,
        ]);
        self.i32(version);
        self.i32(min_reader_version);
        self.i32(name.len() as i32);
        self.buf.extend_from_slice(name.as_bytes());
        self.buf.push(tag::END_OBJECT);
    }

    fn block(&mut self, name: &str, content: &[u8]) {
        self.begin_object(name, BLOCK_VERSION, BLOCK_VERSION);
        self.i32(content.len() as i32);

        while self.buf.len() % 4 != 0 {
            self.buf.push(0);
        }

        self.buf.extend_from_slice(content);
        self.buf.push(tag::END_OBJECT);
    }

    fn block_content(&self, events: &[EventData]) -> Vec<u8> {
        let min = events.iter().map(|ev| ev.timestamp).min().unwrap_or_default();
        let max = events.iter().map(|ev| ev.timestamp).max().unwrap_or_default();

        let mut content = Vec::new();
        content.extend_from_slice(&BLOCK_HEADER_SIZE.to_le_bytes());
        let flags = if self.compressed { COMPRESSED_HEADERS } else { 0 };
        content.extend_from_slice(&flags.to_le_bytes());
        content.extend_from_slice(&min.to_le_bytes());
        content.extend_from_slice(&max.to_le_bytes());

        let mut prev = HeaderState::default();
        for event in events {
            if self.compressed {
                write_compressed(&mut prev, event, &mut content);
            } else {
                write_uncompressed(event, &mut content);
            }
        }

        content
    }
}

fn var_u64(mut v: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (v & 0x7f) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

#[inline]
fn var_u32(v: u32, out: &mut Vec<u8>) {
    var_u64(u64::from(v), out);
}

fn write_compressed(prev: &mut HeaderState, ev: &EventData, out: &mut Vec<u8>) {
    let mut flags = 0;
    let mut fields = Vec::new();

    if ev.metadata_id != prev.metadata_id {
        flags |= hf::METADATA_ID;
        var_u32(ev.metadata_id, &mut fields);
    }

    let implied_sequence = if ev.metadata_id != 0 {
        prev.sequence_number.wrapping_add(1)
    } else {
        prev.sequence_number
    };

    if ev.sequence_number != implied_sequence
        || ev.capture_thread_id != prev.capture_thread_id
        || ev.processor_number != prev.processor_number
    {
        flags |= hf::CAPTURE_THREAD_AND_SEQUENCE;
        var_u32(
            ev.sequence_number
                .wrapping_sub(prev.sequence_number)
                .wrapping_sub(1),
            &mut fields,
        );
        var_u64(ev.capture_thread_id, &mut fields);
        var_u32(ev.processor_number, &mut fields);
    }

    if ev.thread_id != prev.thread_id {
        flags |= hf::THREAD_ID;
        var_u64(ev.thread_id, &mut fields);
    }

    if ev.stack_id != prev.stack_id {
        flags |= hf::STACK_ID;
        var_u32(ev.stack_id, &mut fields);
    }

    var_u64(ev.timestamp.wrapping_sub(prev.timestamp), &mut fields);

    if ev.activity_id != prev.activity_id {
        flags |= hf::ACTIVITY_ID;
        fields.extend_from_slice(&ev.activity_id.to_bytes_le());
    }

    if ev.related_activity_id != prev.related_activity_id {
        flags |= hf::RELATED_ACTIVITY_ID;
        fields.extend_from_slice(&ev.related_activity_id.to_bytes_le());
    }

    if ev.is_sorted {
        flags |= hf::SORTED;
    }

    let payload_size = ev.payload.len() as u32;
    if payload_size != prev.payload_size {
        flags |= hf::DATA_LENGTH;
        var_u32(payload_size, &mut fields);
    }

    out.push(flags);
    out.extend_from_slice(&fields);
    out.extend_from_slice(&ev.payload);

    *prev = HeaderState {
        metadata_id: ev.metadata_id,
        sequence_number: ev.sequence_number,
        capture_thread_id: ev.capture_thread_id,
        processor_number: ev.processor_number,
        thread_id: ev.thread_id,
        stack_id: ev.stack_id,
        timestamp: ev.timestamp,
        activity_id: ev.activity_id,
        related_activity_id: ev.related_activity_id,
        payload_size,
    };
}

fn write_uncompressed(ev: &EventData, out: &mut Vec<u8>) {
    let event_size = (UNCOMPRESSED_HEADER_SIZE + ev.payload.len()) as i32;
    let raw_id = if ev.is_sorted {
        ev.metadata_id | SORTED_BIT
    } else {
        ev.metadata_id
    };

    out.extend_from_slice(&event_size.to_le_bytes());
    out.extend_from_slice(&raw_id.to_le_bytes());
    out.extend_from_slice(&ev.sequence_number.to_le_bytes());
    out.extend_from_slice(&ev.thread_id.to_le_bytes());
    out.extend_from_slice(&ev.capture_thread_id.to_le_bytes());
    out.extend_from_slice(&ev.processor_number.to_le_bytes());
    out.extend_from_slice(&ev.stack_id.to_le_bytes());
    out.extend_from_slice(&ev.timestamp.to_le_bytes());
    out.extend_from_slice(&ev.activity_id.to_bytes_le());
    out.extend_from_slice(&ev.related_activity_id.to_bytes_le());
    out.extend_from_slice(&(ev.payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&ev.payload);

    // The block content starts aligned, so aligning the content aligns the
    // stream as well
    while out.len() % 4 != 0 {
        out.push(0);
    }
}

fn utf16z(s: &str, out: &mut Vec<u8>) {
    for unit in s.encode_utf16().chain([0]) {
        out.extend_from_slice(&unit.to_le_bytes());
    }
}

fn write_fields(fields: &[FieldDefinition], out: &mut Vec<u8>) {
    out.extend_from_slice(&(fields.len() as i32).to_le_bytes());
    for field in fields {
        write_type(&field.ty, out);
        utf16z(&field.name, out);
    }
}

fn write_type(ty: &FieldType, out: &mut Vec<u8>) {
    out.extend_from_slice(&ty.code().to_le_bytes());
    match ty {
        FieldType::Array(element) => write_type(element, out),
        FieldType::Struct(fields) => write_fields(fields, out),
        _ => {}
    }
}

/// Encodes a definition as the payload of an event in a metadata block
pub fn encode_metadata(def: &MetadataDefinition) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&def.metadata_id.to_le_bytes());
    utf16z(&def.provider_name, &mut out);
    out.extend_from_slice(&def.event_id.to_le_bytes());
    utf16z(&def.event_name, &mut out);
    out.extend_from_slice(&def.keywords.to_le_bytes());
    out.extend_from_slice(&def.version.to_le_bytes());
    out.extend_from_slice(&def.level.to_le_bytes());

    // Runtime events omit the field list entirely
    if !def.fields.is_empty() || def.opcode.is_some() {
        write_fields(&def.fields, &mut out);
    }

    if let Some(opcode) = def.opcode {
        out.extend_from_slice(&1u32.to_le_bytes());
        out.push(1);
        out.push(opcode);
    }

    out
}
