//! Event metadata, ie. the identity and payload layout of an event.

use crate::{Error, reader::Reader};
use std::{collections::HashMap, sync::Arc};

/// Type codes used by the field declarations of a metadata payload
pub mod type_code {
    pub const OBJECT: i32 = 1;
    pub const BOOLEAN: i32 = 3;
    pub const CHAR: i32 = 4;
    pub const SBYTE: i32 = 5;
    pub const BYTE: i32 = 6;
    pub const INT16: i32 = 7;
    pub const UINT16: i32 = 8;
    pub const INT32: i32 = 9;
    pub const UINT32: i32 = 10;
    pub const INT64: i32 = 11;
    pub const UINT64: i32 = 12;
    pub const SINGLE: i32 = 13;
    pub const DOUBLE: i32 = 14;
    pub const DECIMAL: i32 = 15;
    pub const DATE_TIME: i32 = 16;
    pub const GUID: i32 = 17;
    pub const STRING: i32 = 18;
    pub const ARRAY: i32 = 19;
}

/// Tag kinds that can follow the field list
mod tag {
    pub const OPCODE: u8 = 1;
}

/// Nested structs deeper than this are rejected
const MAX_DEPTH: usize = 16;

/// The type of a single payload field
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldType {
    /// 4 bytes, as in Win32 `BOOL`
    Boolean,
    /// A single UTF-16 code unit
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    /// 16 byte blob
    Decimal,
    /// 8 byte `FILETIME`
    DateTime,
    Guid,
    /// NUL terminated UTF-16
    String,
    /// A u16 element count followed by the elements
    Array(Box<FieldType>),
    Struct(Vec<FieldDefinition>),
}

impl FieldType {
    fn from_code(code: i32) -> Option<Self> {
        use type_code as tc;

        Some(match code {
            tc::BOOLEAN => Self::Boolean,
            tc::CHAR => Self::Char,
            tc::SBYTE => Self::I8,
            tc::BYTE => Self::U8,
            tc::INT16 => Self::I16,
            tc::UINT16 => Self::U16,
            tc::INT32 => Self::I32,
            tc::UINT32 => Self::U32,
            tc::INT64 => Self::I64,
            tc::UINT64 => Self::U64,
            tc::SINGLE => Self::F32,
            tc::DOUBLE => Self::F64,
            tc::DECIMAL => Self::Decimal,
            tc::DATE_TIME => Self::DateTime,
            tc::GUID => Self::Guid,
            tc::STRING => Self::String,
            _ => return None,
        })
    }

    /// The type code this type is declared with
    pub fn code(&self) -> i32 {
        use type_code as tc;

        match self {
            Self::Boolean => tc::BOOLEAN,
            Self::Char => tc::CHAR,
            Self::I8 => tc::SBYTE,
            Self::U8 => tc::BYTE,
            Self::I16 => tc::INT16,
            Self::U16 => tc::UINT16,
            Self::I32 => tc::INT32,
            Self::U32 => tc::UINT32,
            Self::I64 => tc::INT64,
            Self::U64 => tc::UINT64,
            Self::F32 => tc::SINGLE,
            Self::F64 => tc::DOUBLE,
            Self::Decimal => tc::DECIMAL,
            Self::DateTime => tc::DATE_TIME,
            Self::Guid => tc::GUID,
            Self::String => tc::STRING,
            Self::Array(_) => tc::ARRAY,
            Self::Struct(_) => tc::OBJECT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldDefinition {
    pub name: String,
    pub ty: FieldType,
}

impl FieldDefinition {
    #[inline]
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }
}

/// Describes one kind of event in the stream
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataDefinition {
    /// The stream local id events refer to this definition by
    pub metadata_id: u32,
    pub provider_name: String,
    pub event_id: u32,
    pub event_name: String,
    pub keywords: u64,
    pub version: u32,
    pub level: u32,
    pub opcode: Option<u8>,
    /// The payload layout, in declaration order. Events of the runtime's own
    /// provider don't declare their fields.
    pub fields: Vec<FieldDefinition>,
}

impl MetadataDefinition {
    /// Parses the payload of an event in a metadata block, `offset` is only
    /// used to report errors
    pub fn parse(payload: &[u8], offset: u64) -> Result<Self, Error> {
        let mut r = Reader::new(payload);
        let fail = |r: &Reader<'_>, reason: &str| Error::parse(offset + r.pos() as u64, reason);

        let metadata_id: u32 = r.read().ok_or_else(|| fail(&r, "missing metadata id"))?;
        let provider_name = r
            .utf16z()
            .ok_or_else(|| fail(&r, "missing provider name"))?;
        let event_id: u32 = r.read().ok_or_else(|| fail(&r, "missing event id"))?;
        let event_name = r.utf16z().ok_or_else(|| fail(&r, "missing event name"))?;
        let keywords: u64 = r.read().ok_or_else(|| fail(&r, "missing keywords"))?;
        let version: u32 = r.read().ok_or_else(|| fail(&r, "missing version"))?;
        let level: u32 = r.read().ok_or_else(|| fail(&r, "missing level"))?;

        if metadata_id == 0 {
            return Err(fail(&r, "metadata id 0 is reserved"));
        }

        // Older runtimes end the payload here for events without fields
        let fields = if r.remaining() == 0 {
            Vec::new()
        } else {
            let count: i32 = r.read().ok_or_else(|| fail(&r, "missing field count"))?;
            parse_fields(&mut r, count, 0).map_err(|reason| fail(&r, reason))?
        };

        let mut opcode = None;
        while r.remaining() > 0 {
            let Some((kind, data)) = r.read::<u32>().and_then(|len| {
                let kind = r.u8()?;
                Some((kind, r.take(len as usize)?))
            }) else {
                log::debug!("ignoring truncated metadata tag of event {event_id}");
                break;
            };

            if kind == tag::OPCODE {
                opcode = data.first().copied();
            }
        }

        Ok(Self {
            metadata_id,
            provider_name,
            event_id,
            event_name,
            keywords,
            version,
            level,
            opcode,
            fields,
        })
    }
}

fn parse_fields(
    r: &mut Reader<'_>,
    count: i32,
    depth: usize,
) -> Result<Vec<FieldDefinition>, &'static str> {
    if depth > MAX_DEPTH {
        return Err("fields are nested too deeply");
    }

    // Every field needs at least a type code and a terminator
    let count = usize::try_from(count).map_err(|_err| "negative field count")?;
    if count > r.remaining() / 6 {
        return Err("field count exceeds the metadata size");
    }

    let mut fields = Vec::with_capacity(count);
    for _ in 0..count {
        let code: i32 = r.read().ok_or("missing field type")?;

        let ty = match code {
            type_code::OBJECT => parse_struct(r, depth)?,
            type_code::ARRAY => {
                let element: i32 = r.read().ok_or("missing array element type")?;
                let element = if element == type_code::OBJECT {
                    parse_struct(r, depth)?
                } else {
                    FieldType::from_code(element).ok_or("unknown array element type")?
                };
                FieldType::Array(Box::new(element))
            }
            code => FieldType::from_code(code).ok_or("unknown field type")?,
        };

        let name = r.utf16z().ok_or("missing field name")?;
        fields.push(FieldDefinition { name, ty });
    }

    Ok(fields)
}

fn parse_struct(r: &mut Reader<'_>, depth: usize) -> Result<FieldType, &'static str> {
    let count: i32 = r.read().ok_or("missing nested field count")?;
    Ok(FieldType::Struct(parse_fields(r, count, depth + 1)?))
}

/// Every metadata definition seen in a stream, definitions live as long as
/// the stream does
#[derive(Default, Debug)]
pub struct MetadataTable {
    entries: HashMap<u32, Arc<MetadataDefinition>>,
}

impl MetadataTable {
    /// Adds a definition, ids may only be defined once
    pub fn insert(&mut self, def: MetadataDefinition) -> Result<Arc<MetadataDefinition>, Error> {
        use std::collections::hash_map::Entry;

        match self.entries.entry(def.metadata_id) {
            Entry::Occupied(_) => Err(Error::DuplicateMetadataId(def.metadata_id)),
            Entry::Vacant(slot) => Ok(slot.insert(Arc::new(def)).clone()),
        }
    }

    #[inline]
    pub fn get(&self, metadata_id: u32) -> Option<&Arc<MetadataDefinition>> {
        self.entries.get(&metadata_id)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
