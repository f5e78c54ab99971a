use eventpiper::{ExceptionEvent, ExceptionHandler, LoopAction};
use nettrace::{
    EventData, FieldDefinition, FieldType, MetadataDefinition, NettraceWriter, TraceHeader,
};
use std::path::PathBuf;

/// The metadata id the fake runtime defines `ExceptionThrown_V1` as
pub const EXCEPTION_METADATA_ID: u32 = 7;
/// The session id the fake runtime hands out
pub const SESSION_ID: u64 = 0x5e55_1011;

/// Parses `<type>:<message>`
pub fn parse_thrown(s: &str) -> Result<(String, String), String> {
    let (ty, msg) = s
        .split_once(':')
        .ok_or_else(|| format!("'{s}' is not <type>:<message>"))?;
    Ok((ty.to_owned(), msg.to_owned()))
}

fn utf16z(s: &str, buf: &mut Vec<u8>) {
    for unit in s.encode_utf16().chain([0]) {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
}

/// The layout of `ExceptionThrown_V1`, which the runtime itself never declares
fn exception_fields() -> Vec<FieldDefinition> {
    vec![
        FieldDefinition::new("exceptionType", FieldType::String),
        FieldDefinition::new("exceptionMessage", FieldType::String),
        FieldDefinition::new("ExceptionEIP", FieldType::U64),
        FieldDefinition::new("ExceptionHRESULT", FieldType::U32),
        FieldDefinition::new("ExceptionFlags", FieldType::U16),
        FieldDefinition::new("ClrInstanceID", FieldType::U16),
    ]
}

/// A trace as the runtime would produce it for a session that only has
/// exceptions enabled. The caller decides if the stream ends or not.
pub fn exception_trace(
    pid: u32,
    thrown: &[(String, String)],
    declare_fields: bool,
) -> NettraceWriter {
    let header = TraceHeader {
        process_id: pid as i32,
        ..Default::default()
    };

    let mut w = NettraceWriter::new(&header);
    w.metadata_block(&[MetadataDefinition {
        metadata_id: EXCEPTION_METADATA_ID,
        provider_name: "Microsoft-Windows-DotNETRuntime".into(),
        event_id: 80,
        event_name: String::new(),
        keywords: 0x8000,
        version: 1,
        level: 2,
        opcode: None,
        fields: if declare_fields {
            exception_fields()
        } else {
            Vec::new()
        },
    }]);

    let events: Vec<_> = thrown
        .iter()
        .zip(1u32..)
        .map(|((ty, msg), seq)| {
            let mut payload = Vec::new();
            utf16z(ty, &mut payload);
            utf16z(msg, &mut payload);
            // ExceptionEIP, ExceptionHRESULT, ExceptionFlags, ClrInstanceID
            payload.extend_from_slice(&0u64.to_le_bytes());
            payload.extend_from_slice(&0x8013_1509u32.to_le_bytes());
            payload.extend_from_slice(&0x10u16.to_le_bytes());
            payload.extend_from_slice(&0u16.to_le_bytes());

            EventData {
                metadata_id: EXCEPTION_METADATA_ID,
                sequence_number: seq,
                thread_id: u64::from(pid),
                capture_thread_id: u64::from(pid),
                timestamp: u64::from(seq) * 1000,
                payload,
                ..Default::default()
            }
        })
        .collect();

    w.event_block(&events);
    w
}

/// Collects every exception, exiting once `exit_after` have been seen
pub struct Collect {
    pub seen: Vec<ExceptionEvent>,
    pub exit_after: usize,
    /// Notified of each exception
    pub tx: Option<std::sync::mpsc::Sender<ExceptionEvent>>,
}

impl Default for Collect {
    fn default() -> Self {
        Self {
            seen: Vec::new(),
            exit_after: usize::MAX,
            tx: None,
        }
    }
}

impl ExceptionHandler for Collect {
    fn on_exception(&mut self, exception: &ExceptionEvent) -> LoopAction {
        self.seen.push(exception.clone());
        if let Some(tx) = &self.tx {
            let _ = tx.send(exception.clone());
        }

        if self.seen.len() >= self.exit_after {
            LoopAction::Exit
        } else {
            LoopAction::Continue
        }
    }
}

impl Collect {
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        self.seen
            .iter()
            .map(|ex| (ex.type_name.as_str(), ex.message.as_str()))
            .collect()
    }
}

/// The path of the fake runtime binary, next to the test executable
pub fn fake_runtime_exe() -> PathBuf {
    use std::env;

    // Adapted from
    // https://github.com/rust-lang/cargo/blob/485670b3983b52289a2f353d589c57fae2f60f82/tests/testsuite/support/mod.rs#L507
    let mut cmd_path = env::current_exe().expect("failed to get exe path");
    cmd_path.pop();
    if cmd_path.ends_with("deps") {
        cmd_path.pop();
    }

    cmd_path.push("fake-runtime");
    if !env::consts::EXE_EXTENSION.is_empty() {
        cmd_path.set_extension(env::consts::EXE_EXTENSION);
    }

    cmd_path
}

#[inline]
pub fn capture_output() {
    static SUB: std::sync::Once = std::sync::Once::new();

    SUB.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_env("EVENTPIPER_LOG"))
            .with_test_writer()
            .init();
    });
}
