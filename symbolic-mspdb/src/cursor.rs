//! A bounds-tracked reader over a growable byte buffer.

use std::io::Read;

use uuid::Uuid;

use crate::error::{PdbError, PdbErrorKind, Result};

/// A 128-bit decimal number as stored in managed constant records.
///
/// The value is `(-1)^negative * mantissa / 10^scale`, where the mantissa is a 96-bit unsigned
/// integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct Decimal {
    /// Whether the value is negative.
    pub negative: bool,
    /// The power of ten the mantissa is divided by, in `0..=28`.
    pub scale: u8,
    /// Bits 64..96 of the mantissa.
    pub hi: u32,
    /// Bits 32..64 of the mantissa.
    pub mid: u32,
    /// Bits 0..32 of the mantissa.
    pub lo: u32,
}

impl Decimal {
    /// Returns the 96-bit mantissa.
    pub fn mantissa(&self) -> u128 {
        (u128::from(self.hi) << 64) | (u128::from(self.mid) << 32) | u128::from(self.lo)
    }
}

/// A cursor over a byte buffer that is staged from a PDB stream.
///
/// The backing buffer only ever grows, so that repeatedly staging streams of different sizes
/// does not reallocate. The valid content is tracked separately from the buffer capacity, and
/// every read past the content fails with [`PdbErrorKind::UnexpectedEof`].
#[derive(Debug, Clone, Default)]
pub struct ByteCursor {
    buf: Vec<u8>,
    len: usize,
    pos: usize,
}

impl ByteCursor {
    /// Creates an empty cursor.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty cursor with a preallocated backing buffer.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            len: 0,
            pos: 0,
        }
    }

    /// Creates a cursor over the given bytes, positioned at the start.
    pub fn from_vec(buf: Vec<u8>) -> Self {
        let len = buf.len();
        Self { buf, len, pos: 0 }
    }

    /// Grows the backing buffer to at least `capacity` bytes.
    fn grow(&mut self, capacity: usize) {
        if self.buf.len() < capacity {
            self.buf.resize(capacity, 0);
        }
    }

    /// Prepares the cursor to hold `len` bytes of new content and returns the writable region.
    ///
    /// The position is reset to the start.
    pub fn stage(&mut self, len: usize) -> &mut [u8] {
        self.grow(len);
        self.len = len;
        self.pos = 0;
        &mut self.buf[..len]
    }

    /// Replaces the content with `len` bytes read from `reader`.
    pub fn fill<R: Read>(&mut self, reader: &mut R, len: usize) -> Result<()> {
        reader.read_exact(self.stage(len))?;
        Ok(())
    }

    /// Lets `read` fill `count` bytes at the current position, growing the buffer and the content
    /// as needed, and advances past them.
    pub fn append<F>(&mut self, count: usize, read: F) -> Result<()>
    where
        F: FnOnce(&mut [u8]) -> Result<()>,
    {
        let end = self.pos + count;
        self.grow(end);
        read(&mut self.buf[self.pos..end])?;
        self.pos = end;
        self.len = self.len.max(end);
        Ok(())
    }

    /// Clears the content without releasing the buffer.
    pub fn clear(&mut self) {
        self.len = 0;
        self.pos = 0;
    }

    /// The length of the valid content.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the cursor holds no content.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The valid content as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    /// The current read position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// The number of content bytes after the current position.
    pub fn remaining(&self) -> usize {
        self.len.saturating_sub(self.pos)
    }

    /// Moves the read position. The position may equal, but not exceed, the content length.
    pub fn set_position(&mut self, pos: usize) -> Result<()> {
        if pos > self.len {
            return Err(PdbError::from(PdbErrorKind::UnexpectedEof).at(pos));
        }
        self.pos = pos;
        Ok(())
    }

    /// Advances the position by `count` bytes without reading them.
    pub fn skip(&mut self, count: usize) -> Result<()> {
        self.take(count).map(|_| ())
    }

    /// Advances the position to the next multiple of `alignment`, which must be a power of two.
    ///
    /// Padding bytes are skipped, never read.
    pub fn align(&mut self, alignment: usize) -> Result<()> {
        debug_assert!(alignment.is_power_of_two());
        let aligned = (self.pos + alignment - 1) & !(alignment - 1);
        self.set_position(aligned)
    }

    fn take(&mut self, count: usize) -> Result<&[u8]> {
        let start = self.pos;
        let end = start
            .checked_add(count)
            .filter(|end| *end <= self.len)
            .ok_or_else(|| PdbError::from(PdbErrorKind::UnexpectedEof).at(start))?;
        self.pos = end;
        Ok(&self.buf[start..end])
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut array = [0; N];
        array.copy_from_slice(self.take(N)?);
        Ok(array)
    }

    /// Reads `count` raw bytes.
    pub fn read_bytes(&mut self, count: usize) -> Result<&[u8]> {
        self.take(count)
    }

    /// Reads an unsigned 8-bit integer.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    /// Reads a signed 8-bit integer.
    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    /// Reads a little-endian unsigned 16-bit integer.
    pub fn read_u16(&mut self) -> Result<u16> {
        self.take_array().map(u16::from_le_bytes)
    }

    /// Reads a little-endian signed 16-bit integer.
    pub fn read_i16(&mut self) -> Result<i16> {
        self.take_array().map(i16::from_le_bytes)
    }

    /// Reads a little-endian unsigned 32-bit integer.
    pub fn read_u32(&mut self) -> Result<u32> {
        self.take_array().map(u32::from_le_bytes)
    }

    /// Reads a little-endian signed 32-bit integer.
    pub fn read_i32(&mut self) -> Result<i32> {
        self.take_array().map(i32::from_le_bytes)
    }

    /// Reads a little-endian unsigned 64-bit integer.
    pub fn read_u64(&mut self) -> Result<u64> {
        self.take_array().map(u64::from_le_bytes)
    }

    /// Reads a little-endian signed 64-bit integer.
    pub fn read_i64(&mut self) -> Result<i64> {
        self.take_array().map(i64::from_le_bytes)
    }

    /// Reads a little-endian 32-bit float.
    pub fn read_f32(&mut self) -> Result<f32> {
        self.take_array().map(f32::from_le_bytes)
    }

    /// Reads a little-endian 64-bit float.
    pub fn read_f64(&mut self) -> Result<f64> {
        self.take_array().map(f64::from_le_bytes)
    }

    /// Reads `count` consecutive unsigned 32-bit integers.
    pub fn read_u32_vec(&mut self, count: usize) -> Result<Vec<u32>> {
        let bytes = count
            .checked_mul(4)
            .ok_or_else(|| PdbError::from(PdbErrorKind::UnexpectedEof).at(self.pos))?;
        let data = self.take(bytes)?;
        Ok(data
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect())
    }

    /// Reads a GUID in its mixed-endian on-disk layout.
    pub fn read_guid(&mut self) -> Result<Uuid> {
        self.take_array().map(Uuid::from_bytes_le)
    }

    /// Reads a 16-byte decimal value.
    pub fn read_decimal(&mut self) -> Result<Decimal> {
        let flags = self.read_u32()?;
        let hi = self.read_u32()?;
        let lo = self.read_u32()?;
        let mid = self.read_u32()?;
        Ok(Decimal {
            negative: flags & 0x8000_0000 != 0,
            scale: ((flags & 0x00ff_0000) >> 16) as u8,
            hi,
            mid,
            lo,
        })
    }

    /// Reads a UTF-8 string prefixed by its 16-bit byte length.
    pub fn read_bstring(&mut self) -> Result<String> {
        let len = self.read_u16()? as usize;
        let start = self.pos;
        let bytes = self.take(len)?;
        decode_utf8(bytes, start)
    }

    /// Reads a null-terminated UTF-8 string.
    pub fn read_cstring(&mut self) -> Result<String> {
        let start = self.pos;
        let bytes = self.cstring_bytes()?;
        decode_utf8(bytes, start)
    }

    /// Skips over a null-terminated string without decoding it.
    pub fn skip_cstring(&mut self) -> Result<()> {
        self.cstring_bytes().map(|_| ())
    }

    fn cstring_bytes(&mut self) -> Result<&[u8]> {
        let start = self.pos;
        let rest = self
            .buf
            .get(start..self.len)
            .ok_or_else(|| PdbError::from(PdbErrorKind::UnexpectedEof).at(start))?;
        let len = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or_else(|| PdbError::from(PdbErrorKind::UnexpectedEof).at(start))?;
        self.pos = start + len + 1;
        Ok(&self.buf[start..start + len])
    }

    /// Reads the null-terminated UTF-8 string at `offset` without moving the position.
    pub fn read_cstring_at(&mut self, offset: usize) -> Result<String> {
        let saved = self.pos;
        self.set_position(offset)?;
        let result = self.read_cstring();
        self.pos = saved;
        result
    }

    /// Reads a null-terminated UTF-16LE string.
    pub fn read_utf16_string(&mut self) -> Result<String> {
        let start = self.pos;
        let mut units = Vec::new();
        loop {
            let unit = self.read_u16()?;
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        String::from_utf16(&units)
            .map_err(|e| PdbError::new(PdbErrorKind::InvalidString, e).at(start))
    }
}

fn decode_utf8(bytes: &[u8], offset: usize) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|e| PdbError::new(PdbErrorKind::InvalidString, e).at(offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives_advance_by_width() {
        let mut bytes = Vec::new();
        bytes.push(0xfe);
        bytes.extend_from_slice(&0xbeefu16.to_le_bytes());
        bytes.extend_from_slice(&(-2i16).to_le_bytes());
        bytes.extend_from_slice(&0xdead_beefu32.to_le_bytes());
        bytes.extend_from_slice(&(-7i32).to_le_bytes());
        bytes.extend_from_slice(&0x0123_4567_89ab_cdefu64.to_le_bytes());
        bytes.extend_from_slice(&(-9i64).to_le_bytes());
        bytes.extend_from_slice(&1.5f32.to_le_bytes());
        bytes.extend_from_slice(&(-0.25f64).to_le_bytes());

        let mut cursor = ByteCursor::from_vec(bytes);
        assert_eq!(cursor.read_i8().unwrap(), -2);
        assert_eq!(cursor.position(), 1);
        assert_eq!(cursor.read_u16().unwrap(), 0xbeef);
        assert_eq!(cursor.position(), 3);
        assert_eq!(cursor.read_i16().unwrap(), -2);
        assert_eq!(cursor.position(), 5);
        assert_eq!(cursor.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(cursor.position(), 9);
        assert_eq!(cursor.read_i32().unwrap(), -7);
        assert_eq!(cursor.position(), 13);
        assert_eq!(cursor.read_u64().unwrap(), 0x0123_4567_89ab_cdef);
        assert_eq!(cursor.position(), 21);
        assert_eq!(cursor.read_i64().unwrap(), -9);
        assert_eq!(cursor.position(), 29);
        assert_eq!(cursor.read_f32().unwrap(), 1.5);
        assert_eq!(cursor.position(), 33);
        assert_eq!(cursor.read_f64().unwrap(), -0.25);
        assert_eq!(cursor.position(), 41);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn test_read_past_end_fails() {
        let mut cursor = ByteCursor::from_vec(vec![1, 2, 3]);
        let err = cursor.read_u32().unwrap_err();
        assert_eq!(err.kind(), PdbErrorKind::UnexpectedEof);
        assert_eq!(err.offset(), Some(0));
        // a failed read does not move the cursor
        assert_eq!(cursor.position(), 0);
        assert_eq!(cursor.read_u16().unwrap(), 0x0201);
    }

    #[test]
    fn test_content_length_bounds_reads() {
        let mut cursor = ByteCursor::with_capacity(64);
        cursor.stage(2).copy_from_slice(&[1, 2]);
        assert_eq!(cursor.len(), 2);
        assert!(cursor.read_u32().is_err());

        // staging less content keeps the buffer but shrinks the readable region
        cursor.stage(1);
        assert!(cursor.read_u16().is_err());
    }

    #[test]
    fn test_align() {
        let mut cursor = ByteCursor::from_vec(vec![0; 16]);
        cursor.align(4).unwrap();
        assert_eq!(cursor.position(), 0);

        cursor.set_position(8).unwrap();
        cursor.align(4).unwrap();
        assert_eq!(cursor.position(), 8);

        cursor.set_position(5).unwrap();
        cursor.align(4).unwrap();
        assert_eq!(cursor.position(), 8);

        cursor.set_position(9).unwrap();
        cursor.align(8).unwrap();
        assert_eq!(cursor.position(), 16);

        cursor.set_position(15).unwrap();
        assert!(cursor.align(32).is_err());
    }

    #[test]
    fn test_strings() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3u16.to_le_bytes());
        bytes.extend_from_slice(b"abc");
        bytes.extend_from_slice(b"hello\0");
        for unit in "MD2".encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(b"skip\0tail");

        let mut cursor = ByteCursor::from_vec(bytes);
        assert_eq!(cursor.read_bstring().unwrap(), "abc");
        assert_eq!(cursor.read_cstring().unwrap(), "hello");
        assert_eq!(cursor.read_utf16_string().unwrap(), "MD2");
        cursor.skip_cstring().unwrap();
        assert_eq!(cursor.remaining(), 4);
    }

    #[test]
    fn test_unterminated_cstring() {
        let mut cursor = ByteCursor::from_vec(b"xabc".to_vec());
        cursor.set_position(1).unwrap();
        let err = cursor.read_cstring().unwrap_err();
        assert_eq!(err.kind(), PdbErrorKind::UnexpectedEof);
        assert_eq!(err.offset(), Some(1));
        assert!(cursor.skip_cstring().is_err());
        assert_eq!(cursor.position(), 1);

        let mut cursor = ByteCursor::from_vec(b"hello\0tail".to_vec());
        assert_eq!(cursor.read_cstring_at(6).unwrap_err().kind(), PdbErrorKind::UnexpectedEof);
        assert_eq!(cursor.read_cstring().unwrap(), "hello");
    }

    #[test]
    fn test_cstring_at_keeps_position() {
        let mut cursor = ByteCursor::from_vec(b"\0first\0second\0".to_vec());
        cursor.set_position(1).unwrap();
        assert_eq!(cursor.read_cstring_at(7).unwrap(), "second");
        assert_eq!(cursor.position(), 1);
    }

    #[test]
    fn test_guid_and_decimal() {
        let guid = uuid::uuid!("c6ea3fc9-59b3-49d6-bc25-0902bbabb460");
        let mut bytes = guid.to_bytes_le().to_vec();
        bytes.extend_from_slice(&0x8002_0000u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&12345u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());

        let mut cursor = ByteCursor::from_vec(bytes);
        assert_eq!(cursor.read_guid().unwrap(), guid);
        let decimal = cursor.read_decimal().unwrap();
        assert!(decimal.negative);
        assert_eq!(decimal.scale, 2);
        assert_eq!(decimal.mantissa(), 12345);
        assert_eq!(cursor.position(), 32);
    }

    #[test]
    fn test_append_grows_content() {
        let mut cursor = ByteCursor::new();
        let mut source: &[u8] = &[1, 0, 0, 0, 2, 0, 0, 0];
        cursor
            .append(4, |buf| Ok(source.read_exact(buf)?))
            .unwrap();
        cursor
            .append(4, |buf| Ok(source.read_exact(buf)?))
            .unwrap();
        assert_eq!(cursor.len(), 8);
        cursor.set_position(0).unwrap();
        assert_eq!(cursor.read_u32_vec(2).unwrap(), vec![1, 2]);
    }
}
