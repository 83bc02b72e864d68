use bytes::Bytes;

use crate::constants;
use crate::types::{MessageType, ReturnCode, SomeIpHeader};
use crate::wire::{BufferError, Readable, ReadBuffer, Writeable, WriteBuffer};
use crate::ProtocolError;

/// A complete SOME/IP message: header plus payload. The payload is kept as
/// [`Bytes`] so that fan-out to several subscribers shares one allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SomeIpMessage {
    pub header: SomeIpHeader,
    pub payload: Bytes,
}

impl SomeIpMessage {
    pub fn new(header: SomeIpHeader, payload: Bytes) -> Self {
        let mut header = header;
        header.set_payload_len(payload.len());
        Self { header, payload }
    }

    /// Total size of the message on the wire.
    pub fn wire_size(&self) -> usize {
        constants::SOMEIP_FULL_HEADER_SIZE + self.payload.len()
    }

    /// Builds the error reply for a failed request, echoing the request id
    /// block of the offending message.
    pub fn error_reply(request: &SomeIpHeader, return_code: ReturnCode) -> Self {
        let mut header = SomeIpHeader::new(request.service, request.method);
        header.client = request.client;
        header.session = request.session;
        header.interface_version = request.interface_version;
        header.message_type = MessageType::Error;
        header.return_code = return_code;
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = WriteBuffer::with_capacity(self.wire_size());
        // The header write only fails on exotic buffer states, not here.
        let _ = self.header.write(&mut buf);
        buf.write_slice(&self.payload);
        buf.freeze()
    }
}

impl Readable for SomeIpMessage {
    type Error = ProtocolError;

    fn read(buf: &mut ReadBuffer<'_>) -> Result<Self, ProtocolError> {
        let header = SomeIpHeader::read(buf)?;

        let payload_len = header.payload_len();
        if (header.length as usize) < constants::SOMEIP_HEADER_SIZE || buf.len() < payload_len {
            return Err(ProtocolError::LengthMismatch(
                header.length,
                constants::SOMEIP_FULL_HEADER_SIZE + buf.len(),
            ));
        }

        let payload = Bytes::copy_from_slice(buf.read_slice(payload_len)?);
        Ok(Self { header, payload })
    }
}

impl Writeable for SomeIpMessage {
    type Error = BufferError;

    fn write(&self, buf: &mut WriteBuffer) -> Result<usize, BufferError> {
        self.header.write(buf)?;
        buf.write_slice(&self.payload);
        Ok(self.wire_size())
    }
}

/// Checks whether the 16 bytes at the current read position form a magic
/// cookie, in either direction.
pub fn is_magic_cookie(data: &[u8]) -> bool {
    data.len() >= 16
        && (data[..16] == constants::CLIENT_COOKIE || data[..16] == constants::SERVICE_COOKIE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_identity() {
        let header = SomeIpHeader {
            service: 0x1234,
            method: 0x0421,
            length: 0,
            client: 0x0012,
            session: 0x0001,
            protocol_version: constants::PROTOCOL_VERSION,
            interface_version: 0x01,
            message_type: MessageType::Request,
            return_code: ReturnCode::Ok,
        };
        let msg = SomeIpMessage::new(header, Bytes::from_static(&[1, 2, 3, 4, 5]));

        let bytes = msg.to_bytes();
        assert_eq!(bytes.len(), 21);

        let mut buf = ReadBuffer::new(&bytes);
        let parsed = SomeIpMessage::read(&mut buf).unwrap();
        assert_eq!(parsed, msg);
        assert_eq!(parsed.to_bytes(), bytes);
    }

    #[test]
    fn rejects_length_mismatch() {
        let header = SomeIpHeader {
            length: 100,
            ..SomeIpHeader::new(0x1234, 0x0001)
        };
        let mut out = WriteBuffer::new();
        header.write(&mut out).unwrap();

        let mut buf = ReadBuffer::new(out.bytes());
        assert!(matches!(
            SomeIpMessage::read(&mut buf),
            Err(ProtocolError::LengthMismatch(100, _))
        ));
    }

    #[test]
    fn recognizes_magic_cookies() {
        assert!(is_magic_cookie(&constants::CLIENT_COOKIE));
        assert!(is_magic_cookie(&constants::SERVICE_COOKIE));
        assert!(!is_magic_cookie(&[0u8; 16]));
    }

    #[test]
    fn error_reply_echoes_request_id() {
        let mut request = SomeIpHeader::new(0x2277, 0x0042);
        request.client = 0x1111;
        request.session = 0x2222;

        let reply = SomeIpMessage::error_reply(&request, ReturnCode::UnknownService);
        assert_eq!(reply.header.client, 0x1111);
        assert_eq!(reply.header.session, 0x2222);
        assert_eq!(reply.header.message_type, MessageType::Error);
        assert_eq!(reply.header.return_code, ReturnCode::UnknownService);
        assert_eq!(reply.header.length, 8);
    }
}
