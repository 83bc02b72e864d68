use bytes::Bytes;

use crate::types::{ClientId, EventgroupId, EventId, InstanceId, MajorVersion, MinorVersion, ServiceId, Ttl};
use crate::wire::{BufferError, Readable, ReadBuffer, Writeable, WriteBuffer};

use super::TransportError;

/// Correlation id for subscription decisions travelling broker → provider
/// application → broker.
pub type PendingId = u32;

/// One frame of the broker ↔ application channel: either a control
/// command or a wrapped SOME/IP message. Frames are length-prefixed on
/// the socket; boundaries and per-connection ordering are preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// First frame on every connection. `client` 0 requests dynamic
    /// assignment.
    RegisterApplication { client: ClientId, name: String },
    /// Broker reply carrying the assigned id.
    RegisterAck { client: ClientId },
    DeregisterApplication { client: ClientId },
    OfferService {
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    },
    StopOfferService {
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    },
    RequestService {
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    },
    ReleaseService {
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
    },
    Subscribe {
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        event: EventId,
        pending: PendingId,
    },
    Unsubscribe {
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
    },
    SubscribeAck {
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
        pending: PendingId,
    },
    SubscribeNack {
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
        pending: PendingId,
    },
    /// Subscription result pushed to the subscribing application.
    SubscriptionStatus {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
        accepted: bool,
    },
    Availability {
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        available: bool,
    },
    Ping,
    Pong { client: ClientId },
    Suspend,
    Resume,
    ResendProvidedEvents { client: ClientId },
    /// A wrapped SOME/IP message. The payload is the full wire message;
    /// instance and flags travel beside it.
    Send {
        instance: InstanceId,
        reliable: bool,
        flush: bool,
        payload: Bytes,
    },
    /// Ttl update for an expired remote service, pushed to requesters.
    Expired {
        service: ServiceId,
        instance: InstanceId,
        ttl: Ttl,
    },
}

const CMD_REGISTER: u8 = 0x00;
const CMD_REGISTER_ACK: u8 = 0x01;
const CMD_DEREGISTER: u8 = 0x02;
const CMD_OFFER: u8 = 0x10;
const CMD_STOP_OFFER: u8 = 0x11;
const CMD_REQUEST: u8 = 0x12;
const CMD_RELEASE: u8 = 0x13;
const CMD_SUBSCRIBE: u8 = 0x14;
const CMD_UNSUBSCRIBE: u8 = 0x15;
const CMD_SUBSCRIBE_ACK: u8 = 0x16;
const CMD_SUBSCRIBE_NACK: u8 = 0x17;
const CMD_SUBSCRIPTION_STATUS: u8 = 0x18;
const CMD_AVAILABILITY: u8 = 0x19;
const CMD_PING: u8 = 0x1a;
const CMD_PONG: u8 = 0x1b;
const CMD_SUSPEND: u8 = 0x1c;
const CMD_RESUME: u8 = 0x1d;
const CMD_RESEND_PROVIDED_EVENTS: u8 = 0x1e;
const CMD_SEND: u8 = 0x20;
const CMD_EXPIRED: u8 = 0x21;

impl Command {
    /// Encodes the command as one length-prefixed frame.
    pub fn to_frame(&self) -> Bytes {
        let mut body = WriteBuffer::new();
        // The frame length is patched once the body size is known.
        body.write_u32(0);
        let _ = self.write(&mut body);
        let length = (body.len() - 4) as u32;
        body.patch_u32(0, length);
        body.freeze()
    }

    /// Decodes the body of a frame (without the length prefix).
    pub fn from_body(body: &[u8]) -> Result<Self, TransportError> {
        let mut buf = ReadBuffer::new(body);
        Ok(Self::read(&mut buf)?)
    }
}

fn read_service_block(
    buf: &mut ReadBuffer<'_>,
) -> Result<(ClientId, ServiceId, InstanceId, MajorVersion, MinorVersion), BufferError> {
    Ok((
        buf.read_u16()?,
        buf.read_u16()?,
        buf.read_u16()?,
        buf.pop()?,
        buf.read_u32()?,
    ))
}

fn read_eventgroup_block(
    buf: &mut ReadBuffer<'_>,
) -> Result<(ClientId, ServiceId, InstanceId, EventgroupId, EventId), BufferError> {
    Ok((
        buf.read_u16()?,
        buf.read_u16()?,
        buf.read_u16()?,
        buf.read_u16()?,
        buf.read_u16()?,
    ))
}

impl Readable for Command {
    type Error = BufferError;

    fn read(buf: &mut ReadBuffer<'_>) -> Result<Self, BufferError> {
        let id = buf.pop()?;
        let command = match id {
            CMD_REGISTER => {
                let client = buf.read_u16()?;
                let name_len = buf.read_u16()? as usize;
                let name = String::from_utf8(buf.read_vec(name_len)?)
                    .map_err(|_| BufferError::InvalidData)?;
                Command::RegisterApplication { client, name }
            }
            CMD_REGISTER_ACK => Command::RegisterAck {
                client: buf.read_u16()?,
            },
            CMD_DEREGISTER => Command::DeregisterApplication {
                client: buf.read_u16()?,
            },
            CMD_OFFER | CMD_STOP_OFFER | CMD_REQUEST => {
                let (client, service, instance, major, minor) = read_service_block(buf)?;
                match id {
                    CMD_OFFER => Command::OfferService {
                        client,
                        service,
                        instance,
                        major,
                        minor,
                    },
                    CMD_STOP_OFFER => Command::StopOfferService {
                        client,
                        service,
                        instance,
                        major,
                        minor,
                    },
                    _ => Command::RequestService {
                        client,
                        service,
                        instance,
                        major,
                        minor,
                    },
                }
            }
            CMD_RELEASE => Command::ReleaseService {
                client: buf.read_u16()?,
                service: buf.read_u16()?,
                instance: buf.read_u16()?,
            },
            CMD_SUBSCRIBE => {
                let client = buf.read_u16()?;
                let service = buf.read_u16()?;
                let instance = buf.read_u16()?;
                let eventgroup = buf.read_u16()?;
                let major = buf.pop()?;
                let event = buf.read_u16()?;
                let pending = buf.read_u32()?;
                Command::Subscribe {
                    client,
                    service,
                    instance,
                    eventgroup,
                    major,
                    event,
                    pending,
                }
            }
            CMD_UNSUBSCRIBE => {
                let (client, service, instance, eventgroup, event) = read_eventgroup_block(buf)?;
                Command::Unsubscribe {
                    client,
                    service,
                    instance,
                    eventgroup,
                    event,
                }
            }
            CMD_SUBSCRIBE_ACK | CMD_SUBSCRIBE_NACK => {
                let (client, service, instance, eventgroup, event) = read_eventgroup_block(buf)?;
                let pending = buf.read_u32()?;
                if id == CMD_SUBSCRIBE_ACK {
                    Command::SubscribeAck {
                        client,
                        service,
                        instance,
                        eventgroup,
                        event,
                        pending,
                    }
                } else {
                    Command::SubscribeNack {
                        client,
                        service,
                        instance,
                        eventgroup,
                        event,
                        pending,
                    }
                }
            }
            CMD_SUBSCRIPTION_STATUS => Command::SubscriptionStatus {
                service: buf.read_u16()?,
                instance: buf.read_u16()?,
                eventgroup: buf.read_u16()?,
                event: buf.read_u16()?,
                accepted: buf.pop()? != 0,
            },
            CMD_AVAILABILITY => Command::Availability {
                service: buf.read_u16()?,
                instance: buf.read_u16()?,
                major: buf.pop()?,
                minor: buf.read_u32()?,
                available: buf.pop()? != 0,
            },
            CMD_PING => Command::Ping,
            CMD_PONG => Command::Pong {
                client: buf.read_u16()?,
            },
            CMD_SUSPEND => Command::Suspend,
            CMD_RESUME => Command::Resume,
            CMD_RESEND_PROVIDED_EVENTS => Command::ResendProvidedEvents {
                client: buf.read_u16()?,
            },
            CMD_SEND => {
                let instance = buf.read_u16()?;
                let flags = buf.pop()?;
                let payload = Bytes::copy_from_slice(buf.read_slice(buf.len())?);
                Command::Send {
                    instance,
                    reliable: flags & 0x01 != 0,
                    flush: flags & 0x02 != 0,
                    payload,
                }
            }
            CMD_EXPIRED => Command::Expired {
                service: buf.read_u16()?,
                instance: buf.read_u16()?,
                ttl: buf.read_u24()?,
            },
            _ => return Err(BufferError::InvalidData),
        };
        Ok(command)
    }
}

impl Writeable for Command {
    type Error = BufferError;

    fn write(&self, buf: &mut WriteBuffer) -> Result<usize, BufferError> {
        let start = buf.len();
        match self {
            Command::RegisterApplication { client, name } => {
                buf.push(CMD_REGISTER);
                buf.write_u16(*client);
                buf.write_u16(name.len() as u16);
                buf.write_slice(name.as_bytes());
            }
            Command::RegisterAck { client } => {
                buf.push(CMD_REGISTER_ACK);
                buf.write_u16(*client);
            }
            Command::DeregisterApplication { client } => {
                buf.push(CMD_DEREGISTER);
                buf.write_u16(*client);
            }
            Command::OfferService {
                client,
                service,
                instance,
                major,
                minor,
            } => {
                buf.push(CMD_OFFER);
                write_service_block(buf, *client, *service, *instance, *major, *minor);
            }
            Command::StopOfferService {
                client,
                service,
                instance,
                major,
                minor,
            } => {
                buf.push(CMD_STOP_OFFER);
                write_service_block(buf, *client, *service, *instance, *major, *minor);
            }
            Command::RequestService {
                client,
                service,
                instance,
                major,
                minor,
            } => {
                buf.push(CMD_REQUEST);
                write_service_block(buf, *client, *service, *instance, *major, *minor);
            }
            Command::ReleaseService {
                client,
                service,
                instance,
            } => {
                buf.push(CMD_RELEASE);
                buf.write_u16(*client);
                buf.write_u16(*service);
                buf.write_u16(*instance);
            }
            Command::Subscribe {
                client,
                service,
                instance,
                eventgroup,
                major,
                event,
                pending,
            } => {
                buf.push(CMD_SUBSCRIBE);
                buf.write_u16(*client);
                buf.write_u16(*service);
                buf.write_u16(*instance);
                buf.write_u16(*eventgroup);
                buf.push(*major);
                buf.write_u16(*event);
                buf.write_u32(*pending);
            }
            Command::Unsubscribe {
                client,
                service,
                instance,
                eventgroup,
                event,
            } => {
                buf.push(CMD_UNSUBSCRIBE);
                write_eventgroup_block(buf, *client, *service, *instance, *eventgroup, *event);
            }
            Command::SubscribeAck {
                client,
                service,
                instance,
                eventgroup,
                event,
                pending,
            } => {
                buf.push(CMD_SUBSCRIBE_ACK);
                write_eventgroup_block(buf, *client, *service, *instance, *eventgroup, *event);
                buf.write_u32(*pending);
            }
            Command::SubscribeNack {
                client,
                service,
                instance,
                eventgroup,
                event,
                pending,
            } => {
                buf.push(CMD_SUBSCRIBE_NACK);
                write_eventgroup_block(buf, *client, *service, *instance, *eventgroup, *event);
                buf.write_u32(*pending);
            }
            Command::SubscriptionStatus {
                service,
                instance,
                eventgroup,
                event,
                accepted,
            } => {
                buf.push(CMD_SUBSCRIPTION_STATUS);
                buf.write_u16(*service);
                buf.write_u16(*instance);
                buf.write_u16(*eventgroup);
                buf.write_u16(*event);
                buf.push(u8::from(*accepted));
            }
            Command::Availability {
                service,
                instance,
                major,
                minor,
                available,
            } => {
                buf.push(CMD_AVAILABILITY);
                buf.write_u16(*service);
                buf.write_u16(*instance);
                buf.push(*major);
                buf.write_u32(*minor);
                buf.push(u8::from(*available));
            }
            Command::Ping => buf.push(CMD_PING),
            Command::Pong { client } => {
                buf.push(CMD_PONG);
                buf.write_u16(*client);
            }
            Command::Suspend => buf.push(CMD_SUSPEND),
            Command::Resume => buf.push(CMD_RESUME),
            Command::ResendProvidedEvents { client } => {
                buf.push(CMD_RESEND_PROVIDED_EVENTS);
                buf.write_u16(*client);
            }
            Command::Send {
                instance,
                reliable,
                flush,
                payload,
            } => {
                buf.push(CMD_SEND);
                buf.write_u16(*instance);
                let mut flags = 0u8;
                if *reliable {
                    flags |= 0x01;
                }
                if *flush {
                    flags |= 0x02;
                }
                buf.push(flags);
                buf.write_slice(payload);
            }
            Command::Expired {
                service,
                instance,
                ttl,
            } => {
                buf.push(CMD_EXPIRED);
                buf.write_u16(*service);
                buf.write_u16(*instance);
                buf.write_u24(*ttl);
            }
        }
        Ok(buf.len() - start)
    }
}

fn write_service_block(
    buf: &mut WriteBuffer,
    client: ClientId,
    service: ServiceId,
    instance: InstanceId,
    major: MajorVersion,
    minor: MinorVersion,
) {
    buf.write_u16(client);
    buf.write_u16(service);
    buf.write_u16(instance);
    buf.push(major);
    buf.write_u32(minor);
}

fn write_eventgroup_block(
    buf: &mut WriteBuffer,
    client: ClientId,
    service: ServiceId,
    instance: InstanceId,
    eventgroup: EventgroupId,
    event: EventId,
) {
    buf.write_u16(client);
    buf.write_u16(service);
    buf.write_u16(instance);
    buf.write_u16(eventgroup);
    buf.write_u16(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(command: Command) {
        let frame = command.to_frame();
        let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(length, frame.len() - 4);
        assert_eq!(Command::from_body(&frame[4..]).unwrap(), command);
    }

    #[test]
    fn control_commands_round_trip() {
        round_trip(Command::RegisterApplication {
            client: 0,
            name: "climate".into(),
        });
        round_trip(Command::RegisterAck { client: 0x0101 });
        round_trip(Command::OfferService {
            client: 0x0101,
            service: 0x1234,
            instance: 0x5678,
            major: 1,
            minor: 3,
        });
        round_trip(Command::Subscribe {
            client: 0x0101,
            service: 0x1234,
            instance: 0x5678,
            eventgroup: 0x4465,
            major: 1,
            event: 0x8001,
            pending: 77,
        });
        round_trip(Command::SubscribeNack {
            client: 0x0101,
            service: 0x1234,
            instance: 0x5678,
            eventgroup: 0x4465,
            event: 0x8001,
            pending: 77,
        });
        round_trip(Command::Ping);
        round_trip(Command::Pong { client: 0x0101 });
        round_trip(Command::Expired {
            service: 0x1234,
            instance: 0x5678,
            ttl: 0,
        });
    }

    #[test]
    fn send_preserves_payload() {
        round_trip(Command::Send {
            instance: 0x5678,
            reliable: true,
            flush: true,
            payload: Bytes::from_static(&[0xDE, 0xAD, 0xBE, 0xEF]),
        });
    }

    #[test]
    fn unknown_command_is_rejected() {
        assert!(Command::from_body(&[0xEE]).is_err());
    }
}
