//! Bounds-checked little-endian cursor over container bytes.
//!
//! Every read checks the remaining length first and reports
//! [`Error::UnexpectedEof`] instead of panicking, so corrupt sizes surface
//! as parse errors.

use byteorder::{ByteOrder, LittleEndian};

use super::constants::TAG_SIZE;
use crate::util::{Aabb, Error, Result};

/// A `(type, size)` sub-container header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerTag {
    pub kind: u32,
    pub size: u32,
}

/// Byte range inside a container, relative to the container start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DataSpan {
    pub offset: usize,
    pub len: usize,
}

impl DataSpan {
    #[inline]
    pub const fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    #[inline]
    pub const fn end(&self) -> usize {
        self.offset + self.len
    }

    /// Slice `data` by this span, checking bounds.
    pub fn slice<'a>(&self, data: &'a [u8]) -> Result<&'a [u8]> {
        data.get(self.offset..self.end())
            .ok_or_else(|| Error::eof(self.offset, self.len, data.len()))
    }
}

/// Cursor over a byte slice. `base` is the slice's offset inside the
/// enclosing container, so spans produced from nested readers stay
/// container-relative.
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    base: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, base: 0 }
    }

    /// Container-relative offset of the cursor.
    #[inline]
    pub fn offset(&self) -> usize {
        self.base + self.pos
    }

    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(Error::eof(self.offset(), n, self.remaining()));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }

    pub fn u32(&mut self) -> Result<u32> {
        self.take(4).map(LittleEndian::read_u32)
    }

    pub fn i32(&mut self) -> Result<i32> {
        self.take(4).map(LittleEndian::read_i32)
    }

    pub fn u64(&mut self) -> Result<u64> {
        self.take(8).map(LittleEndian::read_u64)
    }

    pub fn f32(&mut self) -> Result<f32> {
        self.take(4).map(LittleEndian::read_f32)
    }

    pub fn f32_array<const N: usize>(&mut self) -> Result<[f32; N]> {
        let bytes = self.take(N * 4)?;
        let mut out = [0f32; N];
        LittleEndian::read_f32_into(bytes, &mut out);
        Ok(out)
    }

    /// Read `min[3]` followed by `max[3]`.
    pub fn aabb(&mut self) -> Result<Aabb> {
        self.f32_array::<6>().map(Aabb::from_floats)
    }

    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    /// Span of the next `n` bytes, advancing past them.
    pub fn span(&mut self, n: usize) -> Result<DataSpan> {
        let offset = self.offset();
        self.skip(n)?;
        Ok(DataSpan::new(offset, n))
    }

    /// Span of everything left in this reader.
    pub fn rest_span(&mut self) -> DataSpan {
        let span = DataSpan::new(self.offset(), self.remaining());
        self.pos = self.buf.len();
        span
    }

    /// Read a `(type, size)` tag and return it with a reader over its payload.
    pub fn container(&mut self) -> Result<(ContainerTag, ByteReader<'a>)> {
        let start = self.offset();
        let kind = self.u32()?;
        let size = self.u32()?;
        let size_bytes = size as usize;
        if size_bytes > self.remaining() {
            return Err(Error::invalid(format!(
                "sub-container {kind:#x} at offset {start} advertises {size} bytes, {} remain",
                self.remaining()
            )));
        }
        let base = self.offset();
        let payload = self.take(size_bytes)?;
        Ok((
            ContainerTag { kind, size },
            ByteReader {
                buf: payload,
                pos: 0,
                base,
            },
        ))
    }

    /// Read a count and check that `count * elem_size` bytes are available.
    pub fn counted(&mut self, elem_size: usize) -> Result<u32> {
        let count = self.u32()?;
        let needed = (count as usize)
            .checked_mul(elem_size)
            .ok_or_else(|| Error::invalid(format!("count {count} overflows")))?;
        if needed > self.remaining() {
            return Err(Error::eof(self.offset(), needed, self.remaining()));
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn test_primitives() {
        let mut data = le(&[7, 0xFFFF_FFFF]);
        data.extend_from_slice(&1.5f32.to_le_bytes());
        let mut r = ByteReader::new(&data);
        assert_eq!(r.u32().unwrap(), 7);
        assert_eq!(r.i32().unwrap(), -1);
        assert_eq!(r.f32().unwrap(), 1.5);
        assert!(r.is_empty());
        assert!(matches!(r.u32(), Err(Error::UnexpectedEof { .. })));
    }

    #[test]
    fn test_nested_container_offsets() {
        // 4 bytes of prefix, then tag(kind=9, size=8) + payload
        let data = le(&[0, 9, 8, 1, 2]);
        let mut r = ByteReader::new(&data);
        r.skip(4).unwrap();
        let (tag, mut inner) = r.container().unwrap();
        assert_eq!(tag, ContainerTag { kind: 9, size: 8 });
        assert_eq!(inner.offset(), 12);
        inner.u32().unwrap();
        let span = inner.rest_span();
        assert_eq!(span, DataSpan::new(16, 4));
        assert_eq!(span.slice(&data).unwrap(), &2u32.to_le_bytes());
    }

    #[test]
    fn test_container_past_end() {
        let data = le(&[9, 100, 0]);
        let mut r = ByteReader::new(&data);
        assert!(matches!(r.container(), Err(Error::InvalidStructure(_))));
    }

    #[test]
    fn test_counted_checks_length() {
        let data = le(&[3, 1, 2]);
        let mut r = ByteReader::new(&data);
        assert!(r.counted(4).is_err());
        let mut r = ByteReader::new(&data);
        assert_eq!(r.counted(2).unwrap(), 3);
    }
}
