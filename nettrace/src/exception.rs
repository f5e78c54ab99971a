//! Recognition of the runtime's `ExceptionThrown_V1` event

use crate::{
    metadata::{FieldDefinition, FieldType, MetadataDefinition},
    payload::PayloadReader,
    record::EventData,
};

/// The provider the runtime emits its own events with
pub const RUNTIME_PROVIDER: &str = "Microsoft-Windows-DotNETRuntime";
/// `ExceptionThrown_V1`
pub const EXCEPTION_THROWN_EVENT_ID: u32 = 80;
pub const EXCEPTION_THROWN_VERSION: u32 = 1;

const TYPE_FIELD: &str = "ExceptionType";
const MESSAGE_FIELD: &str = "ExceptionMessage";

/// A managed exception that was thrown in the target
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExceptionEvent {
    /// The fully qualified type name, eg. `System.InvalidOperationException`
    pub type_name: String,
    pub message: String,
}

/// True if the definition describes `ExceptionThrown_V1`
pub fn is_exception_thrown(def: &MetadataDefinition) -> bool {
    def.event_id == EXCEPTION_THROWN_EVENT_ID
        && def.version == EXCEPTION_THROWN_VERSION
        && def.provider_name.eq_ignore_ascii_case(RUNTIME_PROVIDER)
}

/// Decodes the type and message of a thrown exception, or `None` if the event
/// is some other event or its payload doesn't hold them
pub fn try_decode(def: &MetadataDefinition, event: &EventData) -> Option<ExceptionEvent> {
    if !is_exception_thrown(def) {
        return None;
    }

    let decoded = if def.fields.is_empty() {
        // The runtime doesn't describe the layout of its own events
        decode_fields(&well_known_fields(), &event.payload)
    } else {
        decode_fields(&def.fields, &event.payload)
    };

    if decoded.is_none() {
        log::debug!(
            "unable to decode exception payload of {} bytes (metadata {})",
            event.payload.len(),
            def.metadata_id
        );
    }

    decoded
}

fn well_known_fields() -> [FieldDefinition; 2] {
    [
        FieldDefinition::new(TYPE_FIELD, FieldType::String),
        FieldDefinition::new(MESSAGE_FIELD, FieldType::String),
    ]
}

fn decode_fields(fields: &[FieldDefinition], payload: &[u8]) -> Option<ExceptionEvent> {
    let mut reader = PayloadReader::new(payload);
    let mut type_name = None;
    let mut message = None;

    for field in fields {
        let value = reader.read(&field.ty)?;

        if field.name.eq_ignore_ascii_case(TYPE_FIELD) {
            type_name = Some(value.into_string()?);
        } else if field.name.eq_ignore_ascii_case(MESSAGE_FIELD) {
            message = Some(value.into_string()?);
        }

        if type_name.is_some() && message.is_some() {
            break;
        }
    }

    Some(ExceptionEvent {
        type_name: type_name?,
        message: message?,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn utf16z(s: &str, buf: &mut Vec<u8>) {
        for unit in s.encode_utf16().chain([0]) {
            buf.extend_from_slice(&unit.to_le_bytes());
        }
    }

    fn runtime_def(fields: Vec<FieldDefinition>) -> MetadataDefinition {
        MetadataDefinition {
            metadata_id: 1,
            provider_name: "microsoft-windows-dotnetruntime".into(),
            event_id: 80,
            event_name: String::new(),
            keywords: 0x8000,
            version: 1,
            level: 2,
            opcode: None,
            fields,
        }
    }

    fn native_payload(ty: &str, msg: &str) -> EventData {
        let mut payload = Vec::new();
        utf16z(ty, &mut payload);
        utf16z(msg, &mut payload);
        // ExceptionEIP, ExceptionHRESULT, ExceptionFlags, ClrInstanceID
        payload.extend_from_slice(&0x7fff_0000u64.to_le_bytes());
        payload.extend_from_slice(&0x8013_1509u32.to_le_bytes());
        payload.extend_from_slice(&0x10u16.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());

        EventData {
            metadata_id: 1,
            payload,
            ..Default::default()
        }
    }

    #[test]
    fn native_layout() {
        let event = native_payload("System.Exception", "boom");
        assert_eq!(
            try_decode(&runtime_def(Vec::new()), &event),
            Some(ExceptionEvent {
                type_name: "System.Exception".into(),
                message: "boom".into(),
            })
        );
    }

    #[test]
    fn declared_layout() {
        let def = runtime_def(vec![
            FieldDefinition::new("ClrInstanceID", FieldType::U16),
            FieldDefinition::new("exceptionmessage", FieldType::String),
            FieldDefinition::new("ExceptionType", FieldType::String),
            FieldDefinition::new("Trailing", FieldType::Guid),
        ]);

        let mut payload = Vec::new();
        payload.extend_from_slice(&7u16.to_le_bytes());
        utf16z("", &mut payload);
        utf16z("System.ArgumentException", &mut payload);

        let event = EventData {
            payload,
            ..Default::default()
        };

        // Both fields are found before the (missing) trailing guid
        assert_eq!(
            try_decode(&def, &event),
            Some(ExceptionEvent {
                type_name: "System.ArgumentException".into(),
                message: String::new(),
            })
        );
    }

    #[test]
    fn other_events() {
        let event = native_payload("System.Exception", "boom");

        let mut def = runtime_def(Vec::new());
        def.event_id = 250;
        assert_eq!(try_decode(&def, &event), None);

        let mut def = runtime_def(Vec::new());
        def.version = 0;
        assert_eq!(try_decode(&def, &event), None);

        let mut def = runtime_def(Vec::new());
        def.provider_name = "Microsoft-Windows-DotNETRuntimeRundown".into();
        assert_eq!(try_decode(&def, &event), None);
    }

    #[test]
    fn malformed_payload() {
        let mut event = native_payload("System.Exception", "boom");
        // Cut into the middle of the message
        event.payload.truncate(36);
        assert_eq!(try_decode(&runtime_def(Vec::new()), &event), None);

        // A declared layout that lacks the message entirely
        let def = runtime_def(vec![FieldDefinition::new(
            "ExceptionType",
            FieldType::String,
        )]);
        let event = native_payload("System.Exception", "boom");
        assert_eq!(try_decode(&def, &event), None);
    }
}
