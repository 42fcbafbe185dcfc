// Binary streams compatible with Java's `DataOutputStream`/`DataInputStream`.
//
// Channel payloads (see `GlobalClient.playerProperties`) are exchanged with
// nodes that encode them with the JVM stream classes, so these types follow
// those encodings exactly:
// - integers are big-endian two's complement;
// - a boolean is one byte, written as 0/1 and read as "non-zero is true";
// - a UUID is its most significant 64 bits followed by the least significant
//   64 bits, which is the same as its 16 big-endian bytes;
// - strings use `writeUTF`: a u16 byte length, then "modified UTF-8". That is
//   UTF-8 applied to UTF-16 code units, except U+0000 takes two bytes
//   (0xC0 0x80) and characters outside the BMP are written as two 3-byte
//   surrogates instead of one 4-byte sequence.

use thiserror::Error;
use uuid::Uuid;

/// Maximum encoded length of a `writeUTF` string.
pub const MAX_UTF_LEN: usize = u16::MAX as usize;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DataError {
    #[error("unexpected end of data: needed {needed} bytes, {remaining} left")]
    UnexpectedEof { needed: usize, remaining: usize },
    #[error("string encodes to {len} bytes (max {MAX_UTF_LEN})")]
    StringTooLong { len: usize },
    #[error("malformed modified UTF-8 at byte {offset}")]
    MalformedUtf { offset: usize },
}

/// Number of bytes `s` occupies in modified UTF-8 (excluding the length
/// prefix).
pub fn modified_utf8_len(s: &str) -> usize {
    s.encode_utf16()
        .map(|unit| match unit {
            0x0001..=0x007F => 1,
            0x0000 | 0x0080..=0x07FF => 2,
            _ => 3,
        })
        .sum()
}

/// Growable output buffer.
#[derive(Debug, Default)]
pub struct DataWriter {
    buf: Vec<u8>,
}

impl DataWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    pub fn write_uuid(&mut self, value: &Uuid) {
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Append a `writeUTF` string. On error nothing is written.
    pub fn write_utf(&mut self, value: &str) -> Result<(), DataError> {
        let len = modified_utf8_len(value);
        let short_len = u16::try_from(len)
            .ok()
            .filter(|_| len <= MAX_UTF_LEN)
            .ok_or(DataError::StringTooLong { len })?;
        let len_bytes = short_len.to_be_bytes();
        self.buf.reserve(2 + len);
        self.buf.extend_from_slice(&len_bytes);
        for unit in value.encode_utf16() {
            match unit {
                0x0001..=0x007F => self.buf.push(unit as u8),
                0x0000 | 0x0080..=0x07FF => {
                    self.buf.push(0xC0 | (unit >> 6) as u8);
                    self.buf.push(0x80 | (unit & 0x3F) as u8);
                }
                _ => {
                    self.buf.push(0xE0 | (unit >> 12) as u8);
                    self.buf.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                    self.buf.push(0x80 | (unit & 0x3F) as u8);
                }
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a received payload.
#[derive(Debug)]
pub struct DataReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> DataReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DataError> {
        if self.remaining() < n {
            return Err(DataError::UnexpectedEof {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DataError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DataError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, DataError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32, DataError> {
        Ok(i32::from_be_bytes(self.take_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, DataError> {
        Ok(i64::from_be_bytes(self.take_array()?))
    }

    pub fn read_uuid(&mut self) -> Result<Uuid, DataError> {
        Ok(Uuid::from_bytes(self.take_array()?))
    }

    pub fn read_utf(&mut self) -> Result<String, DataError> {
        let len = usize::from(u16::from_be_bytes(self.take_array()?));
        let start = self.pos;
        let bytes = self.take(len)?;

        let mut units = Vec::with_capacity(len);
        let mut i = 0;
        while i < bytes.len() {
            let malformed = DataError::MalformedUtf { offset: start + i };
            let b = bytes[i];
            let (unit, width) = if b & 0x80 == 0 {
                (u16::from(b), 1)
            } else if b & 0xE0 == 0xC0 {
                let b2 = continuation(bytes, i + 1).ok_or(malformed)?;
                ((u16::from(b & 0x1F) << 6) | b2, 2)
            } else if b & 0xF0 == 0xE0 {
                let b2 = continuation(bytes, i + 1).ok_or(malformed.clone())?;
                let b3 = continuation(bytes, i + 2).ok_or(malformed)?;
                ((u16::from(b & 0x0F) << 12) | (b2 << 6) | b3, 3)
            } else {
                return Err(malformed);
            };
            units.push(unit);
            i += width;
        }
        // Unpaired surrogates are representable in Java strings but not in
        // Rust ones; treat them as malformed input.
        String::from_utf16(&units).map_err(|_| DataError::MalformedUtf { offset: start })
    }
}

/// The low six bits of a continuation byte, if `bytes[i]` is one.
fn continuation(bytes: &[u8], i: usize) -> Option<u16> {
    match bytes.get(i) {
        Some(&b) if b & 0xC0 == 0x80 => Some(u16::from(b & 0x3F)),
        _ => None,
    }
}
