use crate::wire::{BufferError, Readable, ReadBuffer, Writeable, WriteBuffer};

/// The 4-byte SOME/IP-TP header following the base header in segmented
/// messages. The offset is carried in the upper 28 bits and is always a
/// multiple of 16 bytes; the lowest bit flags further segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TpHeader {
    pub offset: u32,
    pub more_segments: bool,
}

pub const TP_HEADER_SIZE: usize = 4;

/// Segment payloads must be multiples of this, except for the last one.
pub const TP_SEGMENT_ALIGNMENT: u32 = 16;

impl TpHeader {
    pub fn new(offset: u32, more_segments: bool) -> Self {
        Self {
            offset,
            more_segments,
        }
    }
}

impl Readable for TpHeader {
    type Error = BufferError;

    fn read(buf: &mut ReadBuffer<'_>) -> Result<Self, BufferError> {
        let word = buf.read_u32()?;
        Ok(Self {
            offset: word & 0xFFFF_FFF0,
            more_segments: word & 0x01 != 0,
        })
    }
}

impl Writeable for TpHeader {
    type Error = BufferError;

    fn write(&self, buf: &mut WriteBuffer) -> Result<usize, BufferError> {
        let word = (self.offset & 0xFFFF_FFF0) | u32::from(self.more_segments);
        buf.write_u32(word);
        Ok(TP_HEADER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let header = TpHeader::new(4096, true);
        let mut out = WriteBuffer::new();
        header.write(&mut out).unwrap();
        assert_eq!(out.bytes(), &[0x00, 0x00, 0x10, 0x01]);

        let mut buf = ReadBuffer::new(out.bytes());
        assert_eq!(TpHeader::read(&mut buf).unwrap(), header);
    }

    #[test]
    fn masks_reserved_bits() {
        let raw = [0x00, 0x00, 0x10, 0x0e];
        let mut buf = ReadBuffer::new(&raw);
        let header = TpHeader::read(&mut buf).unwrap();
        assert_eq!(header.offset, 4096);
        assert!(!header.more_segments);
    }
}
