use bytes::{BufMut, BytesMut};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("Buffer too short")]
    BufTooShort,

    #[error("Invalid data")]
    InvalidData,
}

/// Cursor over a received byte slice. All multi-byte reads are big-endian,
/// as required on the SOME/IP wire.
pub struct ReadBuffer<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ReadBuffer<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Number of bytes not yet consumed.
    pub fn len(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Offset of the read cursor from the start of the underlying slice.
    pub fn offset(&self) -> usize {
        self.pos
    }

    pub fn pop(&mut self) -> Result<u8, BufferError> {
        if self.is_empty() {
            return Err(BufferError::BufTooShort);
        }
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self) -> Result<u16, BufferError> {
        let b = self.read_slice(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Reads a 24-bit big-endian value into the low bits of a `u32`.
    pub fn read_u24(&mut self) -> Result<u32, BufferError> {
        let b = self.read_slice(3)?;
        Ok(u32::from_be_bytes([0, b[0], b[1], b[2]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, BufferError> {
        let b = self.read_slice(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_slice(&mut self, n: usize) -> Result<&'a [u8], BufferError> {
        if self.len() < n {
            return Err(BufferError::BufTooShort);
        }
        let s = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    pub fn read_vec(&mut self, n: usize) -> Result<Vec<u8>, BufferError> {
        Ok(self.read_slice(n)?.to_vec())
    }

    pub fn peekn<const N: usize>(&self) -> Option<[u8; N]> {
        if self.len() < N {
            return None;
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..self.pos + N]);
        Some(out)
    }

    pub fn skipn(&mut self, n: usize) -> Result<(), BufferError> {
        if self.len() < n {
            return Err(BufferError::BufTooShort);
        }
        self.pos += n;
        Ok(())
    }
}

/// Write buffer for outgoing messages, backed by [`BytesMut`].
#[derive(Default)]
pub struct WriteBuffer {
    inner: BytesMut,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self {
            inner: BytesMut::new(),
        }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            inner: BytesMut::with_capacity(n),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn push(&mut self, b: u8) {
        self.inner.put_u8(b);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.inner.put_u16(v);
    }

    /// Writes the low 24 bits of `v` big-endian.
    pub fn write_u24(&mut self, v: u32) {
        let b = v.to_be_bytes();
        self.inner.put_slice(&b[1..4]);
    }

    pub fn write_u32(&mut self, v: u32) {
        self.inner.put_u32(v);
    }

    pub fn write_u64(&mut self, v: u64) {
        self.inner.put_u64(v);
    }

    pub fn write_slice(&mut self, s: &[u8]) {
        self.inner.put_slice(s);
    }

    pub fn bytes(&self) -> &[u8] {
        &self.inner
    }

    /// Overwrites previously written bytes, used to patch length fields
    /// once the final size is known.
    pub fn patch_u32(&mut self, offset: usize, v: u32) {
        self.inner[offset..offset + 4].copy_from_slice(&v.to_be_bytes());
    }

    pub fn into_bytes(self) -> BytesMut {
        self.inner
    }

    pub fn freeze(self) -> bytes::Bytes {
        self.inner.freeze()
    }
}

pub trait Readable: Sized {
    type Error: From<BufferError>;

    fn read(buf: &mut ReadBuffer<'_>) -> Result<Self, Self::Error>;
}

pub trait Writeable {
    type Error;

    fn write(&self, buf: &mut WriteBuffer) -> Result<usize, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_primitives() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07];
        let mut buf = ReadBuffer::new(&data);

        assert_eq!(buf.pop().unwrap(), 0x01);
        assert_eq!(buf.read_u16().unwrap(), 0x0203);
        assert_eq!(buf.read_u24().unwrap(), 0x040506);
        assert_eq!(buf.len(), 1);
        assert_eq!(buf.read_u32(), Err(BufferError::BufTooShort));
    }

    #[test]
    fn peek_does_not_consume() {
        let data = [0xde, 0xad, 0xbe, 0xef];
        let mut buf = ReadBuffer::new(&data);

        assert_eq!(buf.peekn::<2>(), Some([0xde, 0xad]));
        assert_eq!(buf.read_u32().unwrap(), 0xdeadbeef);
        assert_eq!(buf.peekn::<1>(), None);
    }

    #[test]
    fn write_and_patch() {
        let mut buf = WriteBuffer::new();
        buf.write_u32(0);
        buf.write_u24(0xaabbcc);
        buf.patch_u32(0, 3);

        assert_eq!(buf.bytes(), &[0x00, 0x00, 0x00, 0x03, 0xaa, 0xbb, 0xcc]);
    }
}
