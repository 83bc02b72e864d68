use std::fmt::Display;

use crate::constants;
use crate::types::{ClientId, MessageType, MethodId, ReturnCode, ServiceId, SessionId};
use crate::wire::{BufferError, Readable, ReadBuffer, Writeable, WriteBuffer};
use crate::ProtocolError;

/// The 16-byte SOME/IP message header.
///
/// The length field covers everything *after* itself, i.e. the request id,
/// the version/type/return-code block and the payload. A message therefore
/// occupies `length + 8` bytes on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SomeIpHeader {
    pub service: ServiceId,
    pub method: MethodId,
    pub length: u32,
    pub client: ClientId,
    pub session: SessionId,
    pub protocol_version: u8,
    pub interface_version: u8,
    pub message_type: MessageType,
    pub return_code: ReturnCode,
}

impl SomeIpHeader {
    pub fn new(service: ServiceId, method: MethodId) -> Self {
        Self {
            service,
            method,
            length: constants::SOMEIP_HEADER_SIZE as u32,
            client: 0,
            session: 0,
            protocol_version: constants::PROTOCOL_VERSION,
            interface_version: constants::ANY_MAJOR,
            message_type: MessageType::Request,
            return_code: ReturnCode::Ok,
        }
    }

    /// Whether the method field addresses an event rather than a method.
    pub fn is_event(&self) -> bool {
        self.method & constants::EVENT_ID_FLAG != 0
    }

    /// Payload size derived from the length field.
    pub fn payload_len(&self) -> usize {
        (self.length as usize).saturating_sub(constants::SOMEIP_HEADER_SIZE)
    }

    /// Patches the length field for a payload of `n` bytes.
    pub fn set_payload_len(&mut self, n: usize) {
        self.length = (constants::SOMEIP_HEADER_SIZE + n) as u32;
    }
}

impl Display for SomeIpHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{:04x}.{:04x}] {} client {:04x} session {:04x} ({})",
            self.service, self.method, self.message_type, self.client, self.session,
            self.return_code
        )
    }
}

impl Readable for SomeIpHeader {
    type Error = ProtocolError;

    fn read(buf: &mut ReadBuffer<'_>) -> Result<Self, ProtocolError> {
        let service = buf.read_u16()?;
        let method = buf.read_u16()?;
        let length = buf.read_u32()?;
        let client = buf.read_u16()?;
        let session = buf.read_u16()?;
        let protocol_version = buf.pop()?;
        let interface_version = buf.pop()?;
        let message_type = MessageType::read(buf)?;
        let return_code = ReturnCode::read(buf)?;

        Ok(Self {
            service,
            method,
            length,
            client,
            session,
            protocol_version,
            interface_version,
            message_type,
            return_code,
        })
    }
}

impl Writeable for SomeIpHeader {
    type Error = BufferError;

    fn write(&self, buf: &mut WriteBuffer) -> Result<usize, BufferError> {
        buf.write_u16(self.service);
        buf.write_u16(self.method);
        buf.write_u32(self.length);
        buf.write_u16(self.client);
        buf.write_u16(self.session);
        buf.push(self.protocol_version);
        buf.push(self.interface_version);
        self.message_type.write(buf)?;
        self.return_code.write(buf)?;

        Ok(crate::constants::SOMEIP_FULL_HEADER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let header = SomeIpHeader {
            service: 0x1234,
            method: 0x8001,
            length: 13,
            client: 0x0043,
            session: 0x0001,
            protocol_version: 0x01,
            interface_version: 0x02,
            message_type: MessageType::Notification,
            return_code: ReturnCode::Ok,
        };

        let mut out = WriteBuffer::new();
        header.write(&mut out).unwrap();
        assert_eq!(out.len(), 16);

        let mut buf = ReadBuffer::new(out.bytes());
        let parsed = SomeIpHeader::read(&mut buf).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_event());
    }

    #[test]
    fn rejects_unknown_message_type() {
        let mut raw = vec![0u8; 16];
        raw[14] = 0x55;
        let mut buf = ReadBuffer::new(&raw);
        assert!(matches!(
            SomeIpHeader::read(&mut buf),
            Err(ProtocolError::InvalidMessageType(0x55))
        ));
    }
}
