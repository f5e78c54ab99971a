use scroll::{LE, Pread, ctx::TryFromCtx};

/// Little endian cursor over a byte slice.
///
/// Every read returns `None` if there aren't enough bytes left, in which case
/// the position is left untouched.
pub(crate) struct Reader<'buf> {
    buf: &'buf [u8],
    pos: usize,
}

impl<'buf> Reader<'buf> {
    #[inline]
    pub(crate) fn new(buf: &'buf [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    #[inline]
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    #[inline]
    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub(crate) fn read<T>(&mut self) -> Option<T>
    where
        T: TryFromCtx<'buf, scroll::Endian, Error = scroll::Error>,
    {
        self.buf.gread_with(&mut self.pos, LE).ok()
    }

    #[inline]
    pub(crate) fn u8(&mut self) -> Option<u8> {
        self.read()
    }

    pub(crate) fn take(&mut self, len: usize) -> Option<&'buf [u8]> {
        let end = self.pos.checked_add(len)?;
        let bytes = self.buf.get(self.pos..end)?;
        self.pos = end;
        Some(bytes)
    }

    #[inline]
    pub(crate) fn skip(&mut self, len: usize) -> Option<()> {
        self.take(len).map(|_| ())
    }

    pub(crate) fn guid(&mut self) -> Option<uuid::Uuid> {
        let bytes: [u8; 16] = self.take(16)?.try_into().ok()?;
        Some(uuid::Uuid::from_bytes_le(bytes))
    }

    /// LEB128 style variable length integer
    pub(crate) fn var_u64(&mut self) -> Option<u64> {
        let start = self.pos;
        let mut value = 0u64;
        let mut shift = 0;

        loop {
            let Some(byte) = self.u8() else {
                self.pos = start;
                return None;
            };

            // The tenth byte only has room for the top bit
            if shift >= 64 || (shift == 63 && byte & 0x7e != 0) {
                self.pos = start;
                return None;
            }

            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Some(value);
            }

            shift += 7;
        }
    }

    pub(crate) fn var_u32(&mut self) -> Option<u32> {
        let start = self.pos;
        let value = self.var_u64()?;
        match u32::try_from(value) {
            Ok(value) => Some(value),
            Err(_) => {
                self.pos = start;
                None
            }
        }
    }

    /// NUL terminated UTF-16
    pub(crate) fn utf16z(&mut self) -> Option<String> {
        let rest = self.buf.get(self.pos..)?;
        let units = rest.chunks_exact(2).position(|unit| unit == [0, 0])?;

        let chars: Vec<u16> = rest[..units * 2]
            .chunks_exact(2)
            .map(|unit| u16::from_le_bytes([unit[0], unit[1]]))
            .collect();

        self.pos += units * 2 + 2;
        Some(String::from_utf16_lossy(&chars))
    }
}

#[cfg(test)]
mod test {
    use super::Reader;

    #[test]
    fn var_ints() {
        let mut r = Reader::new(&[0x00, 0x7f, 0x80, 0x01, 0xff, 0xff, 0xff, 0xff, 0x0f]);
        assert_eq!(r.var_u32(), Some(0));
        assert_eq!(r.var_u32(), Some(0x7f));
        assert_eq!(r.var_u32(), Some(0x80));
        assert_eq!(r.var_u32(), Some(u32::MAX));
        assert_eq!(r.remaining(), 0);

        // Truncated, the position is restored
        let mut r = Reader::new(&[0x80, 0x80]);
        assert_eq!(r.var_u64(), None);
        assert_eq!(r.pos(), 0);

        // Ten bytes hold exactly 64 bits
        let mut max = [0xff; 10];
        max[9] = 0x01;
        assert_eq!(Reader::new(&max).var_u64(), Some(u64::MAX));

        // Bits past the 64th are rejected rather than dropped
        let mut overlong = [0xff; 10];
        overlong[9] = 0x03;
        let mut r = Reader::new(&overlong);
        assert_eq!(r.var_u64(), None);
        assert_eq!(r.pos(), 0);

        // As is an eleventh byte
        let mut eleven = [0x80; 11];
        eleven[10] = 0x00;
        let mut r = Reader::new(&eleven);
        assert_eq!(r.var_u64(), None);
    }

    #[test]
    fn strings() {
        let mut buf = Vec::new();
        for unit in "héllo".encode_utf16().chain([0]) {
            buf.extend_from_slice(&unit.to_le_bytes());
        }
        buf.push(0xaa);

        let mut r = Reader::new(&buf);
        assert_eq!(r.utf16z().as_deref(), Some("héllo"));
        assert_eq!(r.remaining(), 1);

        // No terminator
        let mut r = Reader::new(&buf[..4]);
        assert_eq!(r.utf16z(), None);
        assert_eq!(r.pos(), 0);
    }
}
