//! Decoding of event payloads according to their declared field layout

use crate::{metadata::FieldType, reader::Reader};

/// A single decoded payload value
#[derive(Clone, Debug, PartialEq)]
pub enum FieldValue {
    Bool(bool),
    Char(char),
    I8(i8),
    U8(u8),
    I16(i16),
    U16(u16),
    I32(i32),
    U32(u32),
    I64(i64),
    U64(u64),
    F32(f32),
    F64(f64),
    /// The raw .NET `decimal` representation
    Decimal([u8; 16]),
    /// 100ns intervals since 1601-01-01 UTC
    DateTime(i64),
    Guid(uuid::Uuid),
    String(String),
    Array(Vec<FieldValue>),
    Struct(Vec<FieldValue>),
}

impl FieldValue {
    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn into_string(self) -> Option<String> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Reads the fields of a payload one at a time. Fields are tightly packed,
/// there is no alignment between them.
pub struct PayloadReader<'buf> {
    inner: Reader<'buf>,
}

impl<'buf> PayloadReader<'buf> {
    #[inline]
    pub fn new(payload: &'buf [u8]) -> Self {
        Self {
            inner: Reader::new(payload),
        }
    }

    /// The number of payload bytes not yet read
    #[inline]
    pub fn remaining(&self) -> usize {
        self.inner.remaining()
    }

    /// Reads the next value, `None` if the payload is too short for it
    pub fn read(&mut self, ty: &FieldType) -> Option<FieldValue> {
        let r = &mut self.inner;

        let value = match ty {
            FieldType::Boolean => FieldValue::Bool(r.read::<u32>()? != 0),
            FieldType::Char => FieldValue::Char(
                char::from_u32(u32::from(r.read::<u16>()?)).unwrap_or(char::REPLACEMENT_CHARACTER),
            ),
            FieldType::I8 => FieldValue::I8(r.read()?),
            FieldType::U8 => FieldValue::U8(r.read()?),
            FieldType::I16 => FieldValue::I16(r.read()?),
            FieldType::U16 => FieldValue::U16(r.read()?),
            FieldType::I32 => FieldValue::I32(r.read()?),
            FieldType::U32 => FieldValue::U32(r.read()?),
            FieldType::I64 => FieldValue::I64(r.read()?),
            FieldType::U64 => FieldValue::U64(r.read()?),
            FieldType::F32 => FieldValue::F32(r.read()?),
            FieldType::F64 => FieldValue::F64(r.read()?),
            FieldType::Decimal => FieldValue::Decimal(r.take(16)?.try_into().ok()?),
            FieldType::DateTime => FieldValue::DateTime(r.read()?),
            FieldType::Guid => FieldValue::Guid(r.guid()?),
            FieldType::String => FieldValue::String(r.utf16z()?),
            FieldType::Array(element) => {
                let count: u16 = r.read()?;
                let mut values = Vec::with_capacity(usize::from(count).min(r.remaining()));
                for _ in 0..count {
                    values.push(self.read(element)?);
                }
                FieldValue::Array(values)
            }
            FieldType::Struct(fields) => {
                let mut values = Vec::with_capacity(fields.len());
                for field in fields {
                    values.push(self.read(&field.ty)?);
                }
                FieldValue::Struct(values)
            }
        };

        Some(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metadata::FieldDefinition;

    fn utf16z(s: &str, buf: &mut Vec<u8>) {
        for unit in s.encode_utf16().chain([0]) {
            buf.extend_from_slice(&unit.to_le_bytes());
        }
    }

    #[test]
    fn packed_fields() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.push(0xfe);
        buf.extend_from_slice(&(-2i64).to_le_bytes());
        utf16z("hi", &mut buf);
        buf.extend_from_slice(&0.5f64.to_le_bytes());

        let mut r = PayloadReader::new(&buf);
        assert_eq!(r.read(&FieldType::Boolean), Some(FieldValue::Bool(true)));
        assert_eq!(r.read(&FieldType::U8), Some(FieldValue::U8(0xfe)));
        assert_eq!(r.read(&FieldType::I64), Some(FieldValue::I64(-2)));
        let text = r.read(&FieldType::String).unwrap();
        assert_eq!(text.as_str(), Some("hi"));
        let float = r.read(&FieldType::F64).unwrap();
        assert_eq!(float, FieldValue::F64(0.5));
        assert_eq!(float.as_str(), None);
        assert_eq!(r.remaining(), 0);
        assert_eq!(r.read(&FieldType::U8), None);
    }

    #[test]
    fn arrays_of_structs() {
        let point = FieldType::Struct(vec![
            FieldDefinition::new("X", FieldType::U16),
            FieldDefinition::new("Y", FieldType::U16),
        ]);

        let mut buf = Vec::new();
        buf.extend_from_slice(&2u16.to_le_bytes());
        for v in [1u16, 2, 3, 4] {
            buf.extend_from_slice(&v.to_le_bytes());
        }

        let mut r = PayloadReader::new(&buf);
        assert_eq!(
            r.read(&FieldType::Array(Box::new(point.clone()))),
            Some(FieldValue::Array(vec![
                FieldValue::Struct(vec![FieldValue::U16(1), FieldValue::U16(2)]),
                FieldValue::Struct(vec![FieldValue::U16(3), FieldValue::U16(4)]),
            ]))
        );

        // The count claims more elements than there are
        let mut r = PayloadReader::new(&[9, 0, 1, 0]);
        assert_eq!(r.read(&FieldType::Array(Box::new(FieldType::U16))), None);
    }
}
