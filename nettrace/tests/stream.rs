use nettrace::{
    EventData, MetadataDefinition, NettraceWriter, StreamParser, StreamRecord, TraceHeader,
    try_decode,
};
use std::io::Read;

/// Hands out the stream a few bytes at a time
struct Trickle {
    data: Vec<u8>,
    pos: usize,
    step: usize,
}

impl Read for Trickle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.step = self.step % 7 + 1;
        let len = self.step.min(buf.len()).min(self.data.len() - self.pos);
        buf[..len].copy_from_slice(&self.data[self.pos..self.pos + len]);
        self.pos += len;
        Ok(len)
    }
}

fn utf16z(s: &str, buf: &mut Vec<u8>) {
    for unit in s.encode_utf16().chain([0]) {
        buf.extend_from_slice(&unit.to_le_bytes());
    }
}

fn runtime_metadata(metadata_id: u32, event_id: u32) -> MetadataDefinition {
    MetadataDefinition {
        metadata_id,
        provider_name: "Microsoft-Windows-DotNETRuntime".into(),
        event_id,
        event_name: String::new(),
        keywords: 0x8000,
        version: 1,
        level: 2,
        opcode: None,
        fields: Vec::new(),
    }
}

fn exception(metadata_id: u32, sequence_number: u32, ty: &str, msg: &str) -> EventData {
    let mut payload = Vec::new();
    utf16z(ty, &mut payload);
    utf16z(msg, &mut payload);
    payload.extend_from_slice(&0u64.to_le_bytes());
    payload.extend_from_slice(&0x8000_4005u32.to_le_bytes());
    payload.extend_from_slice(&[0; 4]);

    EventData {
        metadata_id,
        sequence_number,
        thread_id: 77,
        capture_thread_id: 77,
        timestamp: u64::from(sequence_number) * 100,
        payload,
        ..Default::default()
    }
}

/// Exceptions come out of a stream that is read in small pieces, in the
/// order they were thrown, and other runtime events are ignored
#[test]
fn exceptions_in_order() {
    let header = TraceHeader {
        process_id: 1234,
        ..Default::default()
    };

    let mut w = NettraceWriter::new(&header);
    w.metadata_block(&[runtime_metadata(7, 80), runtime_metadata(8, 250)]);
    w.event_block(&[
        exception(7, 1, "System.InvalidOperationException", "bad state"),
        exception(8, 2, "System.Ignored", "not an exception event"),
    ]);
    w.sequence_point_block(200);
    w.event_block(&[exception(7, 3, "System.Exception", "boom")]);

    let mut source = Trickle {
        data: w.finish(),
        pos: 0,
        step: 0,
    };

    let mut parser = StreamParser::new();
    let mut thrown = Vec::new();
    let mut pid = None;

    loop {
        match parser.next_record(&mut source).unwrap() {
            StreamRecord::Header(header) => pid = Some(header.process_id),
            StreamRecord::MetadataDefinition(_) => {}
            StreamRecord::EventData(event) => {
                let def = parser.metadata(event.metadata_id).unwrap().clone();
                if let Some(ex) = try_decode(&def, &event) {
                    thrown.push((ex.type_name, ex.message));
                }
            }
            StreamRecord::EndOfStream => break,
        }
    }

    assert_eq!(pid, Some(1234));
    assert_eq!(
        thrown,
        [
            (
                "System.InvalidOperationException".to_owned(),
                "bad state".to_owned()
            ),
            ("System.Exception".to_owned(), "boom".to_owned()),
        ]
    );
}

/// A stream that's cut off in the middle of a block
#[test]
fn truncated_stream() {
    let mut w = NettraceWriter::new(&TraceHeader::default());
    w.metadata_block(&[runtime_metadata(7, 80)]);
    w.event_block(&[exception(7, 1, "System.Exception", "cut")]);
    let mut data = w.into_bytes();
    data.truncate(data.len() - 10);

    let mut source = Trickle {
        data,
        pos: 0,
        step: 0,
    };

    let mut parser = StreamParser::new();
    let err = loop {
        match parser.next_record(&mut source) {
            Ok(StreamRecord::EndOfStream) => panic!("stream should not end cleanly"),
            Ok(_) => {}
            Err(err) => break err,
        }
    };

    assert!(matches!(err, nettrace::Error::TransportClosed { .. }));
}
