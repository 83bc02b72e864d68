use std::fmt::Display;

use crate::types::{EventgroupId, InstanceId, MajorVersion, MinorVersion, ServiceId, Ttl};
use crate::wire::{BufferError, Readable, ReadBuffer, Writeable, WriteBuffer};
use crate::ProtocolError;

pub const SD_ENTRY_SIZE: usize = 16;

const INITIAL_DATA_REQUESTED_FLAG: u8 = 0x80;

/// Wire type of an SD entry. Stop-offer, stop-subscribe and nack are not
/// separate types; they are the same entries carrying TTL 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdEntryType {
    FindService,
    OfferService,
    SubscribeEventgroup,
    SubscribeEventgroupAck,
}

impl SdEntryType {
    pub fn is_eventgroup_entry(&self) -> bool {
        matches!(
            self,
            SdEntryType::SubscribeEventgroup | SdEntryType::SubscribeEventgroupAck
        )
    }
}

impl TryFrom<u8> for SdEntryType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::FindService),
            0x01 => Ok(Self::OfferService),
            0x06 => Ok(Self::SubscribeEventgroup),
            0x07 => Ok(Self::SubscribeEventgroupAck),
            _ => Err(ProtocolError::InvalidEntryType(value)),
        }
    }
}

impl From<SdEntryType> for u8 {
    fn from(value: SdEntryType) -> Self {
        match value {
            SdEntryType::FindService => 0x00,
            SdEntryType::OfferService => 0x01,
            SdEntryType::SubscribeEventgroup => 0x06,
            SdEntryType::SubscribeEventgroupAck => 0x07,
        }
    }
}

impl Display for SdEntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SdEntryType::FindService => write!(f, "FIND"),
            SdEntryType::OfferService => write!(f, "OFFER"),
            SdEntryType::SubscribeEventgroup => write!(f, "SUBSCRIBE"),
            SdEntryType::SubscribeEventgroupAck => write!(f, "SUBSCRIBE_ACK"),
        }
    }
}

/// The last word of an entry is interpreted by entry type: service entries
/// carry the minor version, eventgroup entries the eventgroup id plus
/// counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdEntryDetail {
    Service {
        minor: MinorVersion,
    },
    Eventgroup {
        initial_data_requested: bool,
        counter: u8,
        eventgroup: EventgroupId,
    },
}

/// One 16-byte entry of an SD message. The index/count fields reference
/// runs inside the enclosing message's option array.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdEntry {
    pub entry_type: SdEntryType,
    pub index_first: u8,
    pub index_second: u8,
    pub options_first: u8,
    pub options_second: u8,
    pub service: ServiceId,
    pub instance: InstanceId,
    pub major: MajorVersion,
    pub ttl: Ttl,
    pub detail: SdEntryDetail,
}

impl SdEntry {
    pub fn find(service: ServiceId, instance: InstanceId, major: MajorVersion, minor: MinorVersion, ttl: Ttl) -> Self {
        Self::service_entry(SdEntryType::FindService, service, instance, major, minor, ttl)
    }

    pub fn offer(service: ServiceId, instance: InstanceId, major: MajorVersion, minor: MinorVersion, ttl: Ttl) -> Self {
        Self::service_entry(SdEntryType::OfferService, service, instance, major, minor, ttl)
    }

    /// An offer with TTL 0 withdraws the service.
    pub fn stop_offer(service: ServiceId, instance: InstanceId, major: MajorVersion, minor: MinorVersion) -> Self {
        Self::service_entry(SdEntryType::OfferService, service, instance, major, minor, 0)
    }

    pub fn subscribe(
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        counter: u8,
        ttl: Ttl,
    ) -> Self {
        Self::eventgroup_entry(
            SdEntryType::SubscribeEventgroup,
            service,
            instance,
            eventgroup,
            major,
            counter,
            ttl,
        )
    }

    pub fn subscribe_ack(
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        counter: u8,
        ttl: Ttl,
    ) -> Self {
        Self::eventgroup_entry(
            SdEntryType::SubscribeEventgroupAck,
            service,
            instance,
            eventgroup,
            major,
            counter,
            ttl,
        )
    }

    /// An ack with TTL 0 is the nack.
    pub fn subscribe_nack(
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        counter: u8,
    ) -> Self {
        Self::subscribe_ack(service, instance, eventgroup, major, counter, 0)
    }

    fn service_entry(
        entry_type: SdEntryType,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: Ttl,
    ) -> Self {
        Self {
            entry_type,
            index_first: 0,
            index_second: 0,
            options_first: 0,
            options_second: 0,
            service,
            instance,
            major,
            ttl,
            detail: SdEntryDetail::Service { minor },
        }
    }

    fn eventgroup_entry(
        entry_type: SdEntryType,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        counter: u8,
        ttl: Ttl,
    ) -> Self {
        Self {
            entry_type,
            index_first: 0,
            index_second: 0,
            options_first: 0,
            options_second: 0,
            service,
            instance,
            major,
            ttl,
            detail: SdEntryDetail::Eventgroup {
                initial_data_requested: false,
                counter,
                eventgroup,
            },
        }
    }

    /// Attaches the first option run: `count` options starting at `index`.
    pub fn with_options(mut self, index: u8, count: u8) -> Self {
        self.index_first = index;
        self.options_first = count;
        self
    }

    pub fn eventgroup(&self) -> Option<EventgroupId> {
        match self.detail {
            SdEntryDetail::Eventgroup { eventgroup, .. } => Some(eventgroup),
            SdEntryDetail::Service { .. } => None,
        }
    }

    pub fn minor(&self) -> Option<MinorVersion> {
        match self.detail {
            SdEntryDetail::Service { minor } => Some(minor),
            SdEntryDetail::Eventgroup { .. } => None,
        }
    }

    pub fn counter(&self) -> u8 {
        match self.detail {
            SdEntryDetail::Eventgroup { counter, .. } => counter,
            SdEntryDetail::Service { .. } => 0,
        }
    }
}

impl Readable for SdEntry {
    type Error = ProtocolError;

    fn read(buf: &mut ReadBuffer<'_>) -> Result<Self, ProtocolError> {
        let entry_type = SdEntryType::try_from(buf.pop()?)?;
        let index_first = buf.pop()?;
        let index_second = buf.pop()?;
        let counts = buf.pop()?;
        let service = buf.read_u16()?;
        let instance = buf.read_u16()?;
        let major = buf.pop()?;
        let ttl = buf.read_u24()?;

        let detail = if entry_type.is_eventgroup_entry() {
            let flags = buf.pop()?;
            let counter = buf.pop()? & 0x0F;
            let eventgroup = buf.read_u16()?;
            SdEntryDetail::Eventgroup {
                initial_data_requested: flags & INITIAL_DATA_REQUESTED_FLAG != 0,
                counter,
                eventgroup,
            }
        } else {
            SdEntryDetail::Service {
                minor: buf.read_u32()?,
            }
        };

        Ok(Self {
            entry_type,
            index_first,
            index_second,
            options_first: counts >> 4,
            options_second: counts & 0x0F,
            service,
            instance,
            major,
            ttl,
            detail,
        })
    }
}

impl Writeable for SdEntry {
    type Error = BufferError;

    fn write(&self, buf: &mut WriteBuffer) -> Result<usize, BufferError> {
        buf.push(u8::from(self.entry_type));
        buf.push(self.index_first);
        buf.push(self.index_second);
        buf.push((self.options_first << 4) | (self.options_second & 0x0F));
        buf.write_u16(self.service);
        buf.write_u16(self.instance);
        buf.push(self.major);
        buf.write_u24(self.ttl);

        match self.detail {
            SdEntryDetail::Service { minor } => buf.write_u32(minor),
            SdEntryDetail::Eventgroup {
                initial_data_requested,
                counter,
                eventgroup,
            } => {
                buf.push(if initial_data_requested {
                    INITIAL_DATA_REQUESTED_FLAG
                } else {
                    0
                });
                buf.push(counter & 0x0F);
                buf.write_u16(eventgroup);
            }
        }

        Ok(SD_ENTRY_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_round_trip() {
        let entry = SdEntry::offer(0x1234, 0x5678, 1, 0x0002_0003, 0xFF_FFFF).with_options(2, 1);

        let mut out = WriteBuffer::new();
        entry.write(&mut out).unwrap();
        assert_eq!(out.len(), SD_ENTRY_SIZE);
        assert_eq!(out.bytes()[0], 0x01);
        assert_eq!(out.bytes()[1], 2);
        assert_eq!(out.bytes()[3], 0x10);

        let mut buf = ReadBuffer::new(out.bytes());
        assert_eq!(SdEntry::read(&mut buf).unwrap(), entry);
    }

    #[test]
    fn subscribe_round_trip() {
        let entry = SdEntry::subscribe(0x1122, 0x0001, 0x1000, 2, 5, 3);

        let mut out = WriteBuffer::new();
        entry.write(&mut out).unwrap();

        let mut buf = ReadBuffer::new(out.bytes());
        let parsed = SdEntry::read(&mut buf).unwrap();
        assert_eq!(parsed, entry);
        assert_eq!(parsed.eventgroup(), Some(0x1000));
        assert_eq!(parsed.counter(), 5);
        assert_eq!(parsed.ttl, 3);
    }

    #[test]
    fn nack_is_ack_with_zero_ttl() {
        let entry = SdEntry::subscribe_nack(0x1122, 0x0001, 0x1000, 2, 0);
        assert_eq!(entry.entry_type, SdEntryType::SubscribeEventgroupAck);
        assert_eq!(entry.ttl, 0);
    }

    #[test]
    fn rejects_unknown_entry_type() {
        let raw = [0x05u8; 16];
        let mut buf = ReadBuffer::new(&raw);
        assert!(matches!(
            SdEntry::read(&mut buf),
            Err(ProtocolError::InvalidEntryType(0x05))
        ));
    }
}
