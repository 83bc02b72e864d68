use bytes::{Bytes, BytesMut};
use thiserror::Error;

use crate::constants::{SOMEIP_FULL_HEADER_SIZE, SOMEIP_HEADER_SIZE};
use crate::types::is_magic_cookie;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("Frame of {0} bytes exceeds the maximum message size")]
    Oversized(usize),

    #[error("Lost frame synchronization and magic cookies are disabled")]
    LostSync,
}

/// Incremental frame extraction for a TCP byte stream. Bytes are appended
/// as they arrive; complete SOME/IP messages are split off. After a
/// malformed length field the scanner skips forward to the next magic
/// cookie; without cookies the stream cannot be trusted and the
/// connection must be reset.
pub struct FrameBuffer {
    buffer: BytesMut,
    max_message_size: usize,
    magic_cookies: bool,
}

impl FrameBuffer {
    pub fn new(max_message_size: usize, magic_cookies: bool) -> Self {
        Self {
            buffer: BytesMut::new(),
            max_message_size,
            magic_cookies,
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Extracts the next complete message, skipping any magic cookies.
    /// `Ok(None)` means more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FramingError> {
        loop {
            if self.buffer.len() < SOMEIP_FULL_HEADER_SIZE {
                return Ok(None);
            }

            if is_magic_cookie(&self.buffer) {
                let _ = self.buffer.split_to(SOMEIP_FULL_HEADER_SIZE);
                continue;
            }

            let length = u32::from_be_bytes([
                self.buffer[4],
                self.buffer[5],
                self.buffer[6],
                self.buffer[7],
            ]) as usize;

            if length < SOMEIP_HEADER_SIZE
                || length + SOMEIP_HEADER_SIZE > self.max_message_size
            {
                self.resync()?;
                continue;
            }

            let total = length + SOMEIP_HEADER_SIZE;
            if self.buffer.len() < total {
                return Ok(None);
            }

            return Ok(Some(self.buffer.split_to(total).freeze()));
        }
    }

    /// Drops bytes up to the next magic cookie.
    fn resync(&mut self) -> Result<(), FramingError> {
        if !self.magic_cookies {
            return Err(FramingError::LostSync);
        }

        // The cookie itself is consumed by the next next_frame() pass.
        for start in 1..self.buffer.len() {
            if is_magic_cookie(&self.buffer[start..]) {
                let _ = self.buffer.split_to(start);
                return Ok(());
            }
        }

        // No cookie yet: keep the tail that could be a cookie prefix.
        let keep = self.buffer.len().min(15);
        let tail_start = self.buffer.len() - keep;
        let _ = self.buffer.split_to(tail_start);
        Ok(())
    }
}

/// Splits a received UDP datagram into the SOME/IP messages it carries.
/// Trailing garbage or a bad length field invalidates only the rest of
/// the datagram.
pub fn split_datagram(data: Bytes, max_message_size: usize) -> Vec<Bytes> {
    let mut messages = Vec::new();
    let mut rest = data;

    while rest.len() >= SOMEIP_FULL_HEADER_SIZE {
        let length =
            u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        if length < SOMEIP_HEADER_SIZE || length + SOMEIP_HEADER_SIZE > max_message_size {
            break;
        }
        let total = length + SOMEIP_HEADER_SIZE;
        if rest.len() < total {
            break;
        }
        messages.push(rest.split_to(total));
    }

    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::CLIENT_COOKIE;

    fn frame(service: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&service.to_be_bytes());
        out.extend_from_slice(&0x0001u16.to_be_bytes());
        out.extend_from_slice(&((8 + payload.len()) as u32).to_be_bytes());
        out.extend_from_slice(&[0, 0, 0, 0, 0x01, 0x01, 0x00, 0x00]);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn extracts_complete_frames() {
        let mut fb = FrameBuffer::new(1024, true);
        let msg = frame(0x1234, &[1, 2, 3]);

        fb.push(&msg[..10]);
        assert_eq!(fb.next_frame().unwrap(), None);

        fb.push(&msg[10..]);
        let out = fb.next_frame().unwrap().unwrap();
        assert_eq!(&out[..], &msg[..]);
        assert_eq!(fb.next_frame().unwrap(), None);
    }

    #[test]
    fn skips_magic_cookies() {
        let mut fb = FrameBuffer::new(1024, true);
        fb.push(&CLIENT_COOKIE);
        let msg = frame(0x1234, &[]);
        fb.push(&msg);

        let out = fb.next_frame().unwrap().unwrap();
        assert_eq!(&out[..], &msg[..]);
    }

    #[test]
    fn resynchronizes_after_garbage() {
        let mut fb = FrameBuffer::new(1024, true);
        let first = frame(0x1234, &[1, 2, 3]);
        let second = frame(0x5678, &[4, 5]);

        fb.push(&first);
        // a bogus "length" of 0 forces a resync
        fb.push(&[0xAA, 0xBB, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        fb.push(&CLIENT_COOKIE);
        fb.push(&second);

        assert_eq!(&fb.next_frame().unwrap().unwrap()[..], &first[..]);
        let out = fb.next_frame().unwrap().unwrap();
        assert_eq!(&out[..], &second[..]);
    }

    #[test]
    fn reset_without_cookies() {
        let mut fb = FrameBuffer::new(1024, false);
        fb.push(&[0xAA, 0xBB, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00]);
        fb.push(&[0u8; 16]);
        assert_eq!(fb.next_frame(), Err(FramingError::LostSync));
    }

    #[test]
    fn splits_concatenated_datagram() {
        let mut data = frame(0x1111, &[1]);
        data.extend_from_slice(&frame(0x2222, &[2, 3]));

        let messages = split_datagram(Bytes::from(data), 1024);
        assert_eq!(messages.len(), 2);
        assert_eq!(u16::from_be_bytes([messages[1][0], messages[1][1]]), 0x2222);
    }

    #[test]
    fn truncated_tail_is_dropped() {
        let mut data = frame(0x1111, &[1]);
        data.extend_from_slice(&frame(0x2222, &[2, 3])[..10]);

        let messages = split_datagram(Bytes::from(data), 1024);
        assert_eq!(messages.len(), 1);
    }
}
