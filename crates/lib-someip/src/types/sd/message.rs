use bytes::Bytes;

use crate::constants;
use crate::types::{
    MessageType, ReturnCode, SdEntry, SdOption, SessionId, SomeIpHeader, SomeIpMessage,
    SD_ENTRY_SIZE,
};
use crate::wire::{BufferError, Readable, ReadBuffer, Writeable, WriteBuffer};
use crate::ProtocolError;

const FLAG_REBOOT: u8 = 0x80;
const FLAG_UNICAST: u8 = 0x40;
const FLAG_EXPLICIT_INITIAL_DATA: u8 = 0x20;

/// The flags byte of an SD message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SdFlags {
    pub reboot: bool,
    pub unicast: bool,
    pub explicit_initial_data: bool,
}

impl Default for SdFlags {
    fn default() -> Self {
        Self {
            reboot: true,
            unicast: true,
            explicit_initial_data: false,
        }
    }
}

/// The payload of a SOME/IP-SD message: flags, entries and options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SdMessage {
    pub flags: SdFlags,
    pub entries: Vec<SdEntry>,
    pub options: Vec<SdOption>,
}

impl SdMessage {
    pub fn new(flags: SdFlags) -> Self {
        Self {
            flags,
            entries: Vec::new(),
            options: Vec::new(),
        }
    }

    /// Appends an option, reusing an identical existing one, and returns
    /// its index.
    pub fn add_option(&mut self, option: SdOption) -> u8 {
        if let Some(pos) = self.options.iter().position(|o| *o == option) {
            return pos as u8;
        }
        self.options.push(option);
        (self.options.len() - 1) as u8
    }

    /// Resolves the options referenced by both runs of `entry`. Indices
    /// past the end of the option array are ignored, as are options a
    /// consumer cannot interpret.
    pub fn options_for(&self, entry: &SdEntry) -> Vec<&SdOption> {
        let mut out = Vec::new();
        let runs = [
            (entry.index_first as usize, entry.options_first as usize),
            (entry.index_second as usize, entry.options_second as usize),
        ];
        for (index, count) in runs {
            for option in self.options.iter().skip(index).take(count) {
                out.push(option);
            }
        }
        out
    }

    /// Size of the serialized payload.
    pub fn payload_size(&self) -> usize {
        let options: usize = {
            let mut buf = WriteBuffer::new();
            for option in &self.options {
                let _ = option.write(&mut buf);
            }
            buf.len()
        };
        12 + self.entries.len() * SD_ENTRY_SIZE + options
    }

    /// Wraps the SD payload into a full SOME/IP message addressed to the
    /// SD service.
    pub fn into_message(self, session: SessionId) -> Result<SomeIpMessage, BufferError> {
        let mut payload = WriteBuffer::with_capacity(self.payload_size());
        self.write(&mut payload)?;

        let mut header = SomeIpHeader::new(constants::SD_SERVICE, constants::SD_METHOD);
        header.client = constants::SD_CLIENT;
        header.session = session;
        header.interface_version = 0x01;
        header.message_type = MessageType::Notification;
        header.return_code = ReturnCode::Ok;

        Ok(SomeIpMessage::new(header, payload.freeze()))
    }
}

impl Readable for SdMessage {
    type Error = ProtocolError;

    fn read(buf: &mut ReadBuffer<'_>) -> Result<Self, ProtocolError> {
        let flags_byte = buf.pop()?;
        buf.skipn(3)?;

        let flags = SdFlags {
            reboot: flags_byte & FLAG_REBOOT != 0,
            unicast: flags_byte & FLAG_UNICAST != 0,
            explicit_initial_data: flags_byte & FLAG_EXPLICIT_INITIAL_DATA != 0,
        };

        let entries_length = buf.read_u32()? as usize;
        if entries_length % SD_ENTRY_SIZE != 0 || buf.len() < entries_length {
            return Err(ProtocolError::LengthMismatch(
                entries_length as u32,
                buf.len(),
            ));
        }

        let mut entries = Vec::with_capacity(entries_length / SD_ENTRY_SIZE);
        for _ in 0..entries_length / SD_ENTRY_SIZE {
            entries.push(SdEntry::read(buf)?);
        }

        let options_length = buf.read_u32()? as usize;
        if buf.len() < options_length {
            return Err(ProtocolError::LengthMismatch(
                options_length as u32,
                buf.len(),
            ));
        }

        let mut options = Vec::new();
        let options_end = buf.offset() + options_length;
        while buf.offset() < options_end {
            options.push(SdOption::read(buf)?);
        }
        if buf.offset() != options_end {
            return Err(ProtocolError::LengthMismatch(
                options_length as u32,
                buf.offset(),
            ));
        }

        Ok(Self {
            flags,
            entries,
            options,
        })
    }
}

impl Writeable for SdMessage {
    type Error = BufferError;

    fn write(&self, buf: &mut WriteBuffer) -> Result<usize, BufferError> {
        let start = buf.len();

        let mut flags_byte = 0u8;
        if self.flags.reboot {
            flags_byte |= FLAG_REBOOT;
        }
        if self.flags.unicast {
            flags_byte |= FLAG_UNICAST;
        }
        if self.flags.explicit_initial_data {
            flags_byte |= FLAG_EXPLICIT_INITIAL_DATA;
        }
        buf.push(flags_byte);
        buf.write_slice(&[0, 0, 0]);

        buf.write_u32((self.entries.len() * SD_ENTRY_SIZE) as u32);
        for entry in &self.entries {
            entry.write(buf)?;
        }

        let options_length_at = buf.len();
        buf.write_u32(0);
        let options_start = buf.len();
        for option in &self.options {
            option.write(buf)?;
        }
        buf.patch_u32(options_length_at, (buf.len() - options_start) as u32);

        Ok(buf.len() - start)
    }
}

/// Parses the SD payload out of a SOME/IP message addressed to the SD
/// service.
pub fn sd_from_message(message: &SomeIpMessage) -> Result<SdMessage, ProtocolError> {
    let mut buf = ReadBuffer::new(&message.payload);
    SdMessage::read(&mut buf)
}

/// Whether the header addresses the SD service itself.
pub fn is_sd_message(header: &SomeIpHeader) -> bool {
    header.service == constants::SD_SERVICE && header.method == constants::SD_METHOD
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::types::L4Protocol;

    fn sample() -> SdMessage {
        let mut msg = SdMessage::new(SdFlags::default());
        let index = msg.add_option(SdOption::Ipv4Endpoint {
            address: Ipv4Addr::new(10, 0, 0, 1),
            protocol: L4Protocol::Udp,
            port: 30509,
        });
        msg.entries
            .push(SdEntry::offer(0x1234, 0x5678, 1, 0, 0xFF_FFFF).with_options(index, 1));
        msg
    }

    #[test]
    fn round_trip() {
        let msg = sample();

        let mut out = WriteBuffer::new();
        let n = msg.write(&mut out).unwrap();
        assert_eq!(n, msg.payload_size());

        let mut buf = ReadBuffer::new(out.bytes());
        let parsed = SdMessage::read(&mut buf).unwrap();
        assert_eq!(parsed, msg);

        // Re-encoding reproduces the original bytes, lengths included.
        let mut again = WriteBuffer::new();
        parsed.write(&mut again).unwrap();
        assert_eq!(again.bytes(), out.bytes());
    }

    #[test]
    fn option_dedup() {
        let mut msg = SdMessage::default();
        let a = msg.add_option(SdOption::multicast(Ipv4Addr::new(224, 224, 224, 0).into(), 30490));
        let b = msg.add_option(SdOption::multicast(Ipv4Addr::new(224, 224, 224, 0).into(), 30490));
        assert_eq!(a, b);
        assert_eq!(msg.options.len(), 1);
    }

    #[test]
    fn option_resolution_skips_out_of_range() {
        let msg = sample();
        let mut entry = msg.entries[0].clone();
        entry.index_first = 7;
        assert!(msg.options_for(&entry).is_empty());
    }

    #[test]
    fn into_message_addresses_sd_service() {
        let msg = sample().into_message(0x0001).unwrap();
        assert!(is_sd_message(&msg.header));
        assert_eq!(msg.header.message_type, MessageType::Notification);

        let parsed = sd_from_message(&msg).unwrap();
        assert_eq!(parsed.entries.len(), 1);
    }

    #[test]
    fn unknown_option_between_entries_is_tolerated() {
        let mut msg = sample();
        msg.options.push(SdOption::Unknown {
            ty: 0xFF,
            data: vec![0x01],
        });
        let mut entry = msg.entries[0].clone();
        entry.options_first = 2;
        msg.entries[0] = entry;

        let mut out = WriteBuffer::new();
        msg.write(&mut out).unwrap();
        let mut buf = ReadBuffer::new(out.bytes());
        let parsed = SdMessage::read(&mut buf).unwrap();

        let resolved = parsed.options_for(&parsed.entries[0]);
        assert_eq!(resolved.len(), 2);
        assert!(resolved[1].is_unknown());
    }

    #[test]
    fn payload_with_bytes_round_trip() {
        let msg = sample();
        let wrapped = msg.clone().into_message(7).unwrap();
        let bytes = wrapped.to_bytes();

        let mut buf = ReadBuffer::new(&bytes);
        let reparsed = SomeIpMessage::read(&mut buf).unwrap();
        assert_eq!(reparsed.to_bytes(), Bytes::from(bytes.to_vec()));
        assert_eq!(sd_from_message(&reparsed).unwrap(), msg);
    }
}
