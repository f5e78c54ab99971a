use crate::metadata::MetadataDefinition;
use std::sync::Arc;

/// The magic every stream starts with
pub const FORMAT_ID: &str = "Nettrace";
/// The serializer the object graph is written with
pub const SERIALIZER_ID: &str = "!FastSerialization.1";

/// A Win32 `SYSTEMTIME`, the wall clock time the trace was started at
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceTime {
    pub year: u16,
    pub month: u16,
    pub day_of_week: u16,
    pub day: u16,
    pub hour: u16,
    pub minute: u16,
    pub second: u16,
    pub milliseconds: u16,
}

/// The contents of the `Trace` object that precedes all blocks
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceHeader {
    pub format_id: String,
    pub serializer_id: String,
    /// Version of the `Trace` object
    pub version: i32,
    /// The oldest reader version that can understand the stream
    pub min_reader_version: i32,
    pub start_time: TraceTime,
    /// The QPC value at `start_time`
    pub sync_time_qpc: i64,
    /// QPC ticks per second
    pub qpc_frequency: i64,
    pub pointer_size: i32,
    pub process_id: i32,
    pub num_processors: i32,
    pub expected_cpu_sampling_rate: i32,
}

impl Default for TraceHeader {
    fn default() -> Self {
        Self {
            format_id: FORMAT_ID.to_owned(),
            serializer_id: SERIALIZER_ID.to_owned(),
            version: 4,
            min_reader_version: 4,
            start_time: TraceTime::default(),
            sync_time_qpc: 0,
            qpc_frequency: 1_000_000_000,
            pointer_size: 8,
            process_id: 0,
            num_processors: 1,
            expected_cpu_sampling_rate: 1_000_000,
        }
    }
}

/// A single occurrence of an event
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EventData {
    /// The [`MetadataDefinition`] that describes the payload
    pub metadata_id: u32,
    pub sequence_number: u32,
    pub thread_id: u64,
    pub capture_thread_id: u64,
    pub processor_number: u32,
    pub stack_id: u32,
    /// Absolute QPC timestamp
    pub timestamp: u64,
    pub activity_id: uuid::Uuid,
    pub related_activity_id: uuid::Uuid,
    pub is_sorted: bool,
    pub payload: Vec<u8>,
}

/// A single unit decoded from the stream
#[derive(Clone, Debug, PartialEq)]
pub enum StreamRecord {
    Header(TraceHeader),
    MetadataDefinition(Arc<MetadataDefinition>),
    EventData(EventData),
    /// The stream ended cleanly, no further records will be produced
    EndOfStream,
}
