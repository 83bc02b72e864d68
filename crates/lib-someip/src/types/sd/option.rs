use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::wire::{BufferError, Readable, ReadBuffer, Writeable, WriteBuffer};
use crate::ProtocolError;

pub const OPTION_TYPE_CONFIGURATION: u8 = 0x01;
pub const OPTION_TYPE_LOAD_BALANCING: u8 = 0x02;
pub const OPTION_TYPE_PROTECTION: u8 = 0x03;
pub const OPTION_TYPE_IPV4_ENDPOINT: u8 = 0x04;
pub const OPTION_TYPE_IPV6_ENDPOINT: u8 = 0x06;
pub const OPTION_TYPE_IPV4_MULTICAST: u8 = 0x14;
pub const OPTION_TYPE_IPV6_MULTICAST: u8 = 0x16;

/// Layer-4 protocol field of endpoint options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L4Protocol {
    Tcp,
    Udp,
}

impl L4Protocol {
    pub fn is_reliable(&self) -> bool {
        matches!(self, L4Protocol::Tcp)
    }

    pub fn from_reliable(reliable: bool) -> Self {
        if reliable {
            L4Protocol::Tcp
        } else {
            L4Protocol::Udp
        }
    }
}

impl TryFrom<u8> for L4Protocol {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x06 => Ok(Self::Tcp),
            0x11 => Ok(Self::Udp),
            _ => Err(ProtocolError::InvalidOption {
                ty: value,
                len: 0,
            }),
        }
    }
}

impl From<L4Protocol> for u8 {
    fn from(value: L4Protocol) -> Self {
        match value {
            L4Protocol::Tcp => 0x06,
            L4Protocol::Udp => 0x11,
        }
    }
}

impl Display for L4Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            L4Protocol::Tcp => write!(f, "tcp"),
            L4Protocol::Udp => write!(f, "udp"),
        }
    }
}

/// One SD option. Unknown option types are preserved opaquely so that the
/// enclosing message still round-trips; entry processing skips them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SdOption {
    Ipv4Endpoint {
        address: Ipv4Addr,
        protocol: L4Protocol,
        port: u16,
    },
    Ipv6Endpoint {
        address: Ipv6Addr,
        protocol: L4Protocol,
        port: u16,
    },
    Ipv4Multicast {
        address: Ipv4Addr,
        port: u16,
    },
    Ipv6Multicast {
        address: Ipv6Addr,
        port: u16,
    },
    Configuration {
        items: Vec<u8>,
    },
    LoadBalancing {
        priority: u16,
        weight: u16,
    },
    Unknown {
        ty: u8,
        data: Vec<u8>,
    },
}

impl SdOption {
    pub fn endpoint(address: IpAddr, protocol: L4Protocol, port: u16) -> Self {
        match address {
            IpAddr::V4(address) => SdOption::Ipv4Endpoint {
                address,
                protocol,
                port,
            },
            IpAddr::V6(address) => SdOption::Ipv6Endpoint {
                address,
                protocol,
                port,
            },
        }
    }

    pub fn multicast(address: IpAddr, port: u16) -> Self {
        match address {
            IpAddr::V4(address) => SdOption::Ipv4Multicast { address, port },
            IpAddr::V6(address) => SdOption::Ipv6Multicast { address, port },
        }
    }

    /// Socket address and reliability for endpoint-carrying options.
    pub fn to_target(&self) -> Option<(SocketAddr, bool)> {
        match self {
            SdOption::Ipv4Endpoint {
                address,
                protocol,
                port,
            } => Some((SocketAddr::new(IpAddr::V4(*address), *port), protocol.is_reliable())),
            SdOption::Ipv6Endpoint {
                address,
                protocol,
                port,
            } => Some((SocketAddr::new(IpAddr::V6(*address), *port), protocol.is_reliable())),
            SdOption::Ipv4Multicast { address, port } => {
                Some((SocketAddr::new(IpAddr::V4(*address), *port), false))
            }
            SdOption::Ipv6Multicast { address, port } => {
                Some((SocketAddr::new(IpAddr::V6(*address), *port), false))
            }
            _ => None,
        }
    }

    pub fn is_multicast(&self) -> bool {
        matches!(
            self,
            SdOption::Ipv4Multicast { .. } | SdOption::Ipv6Multicast { .. }
        )
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, SdOption::Unknown { .. })
    }
}

impl Readable for SdOption {
    type Error = ProtocolError;

    fn read(buf: &mut ReadBuffer<'_>) -> Result<Self, ProtocolError> {
        let length = buf.read_u16()?;
        let ty = buf.pop()?;
        if length == 0 {
            return Err(ProtocolError::InvalidOption { ty, len: length });
        }
        // The length covers the reserved byte and the payload.
        let _reserved = buf.pop()?;
        let body_len = (length - 1) as usize;

        let option = match ty {
            OPTION_TYPE_IPV4_ENDPOINT => {
                if body_len != 8 {
                    return Err(ProtocolError::InvalidOption { ty, len: length });
                }
                let addr = buf.read_slice(4)?;
                let address = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
                let _reserved = buf.pop()?;
                let protocol = L4Protocol::try_from(buf.pop()?)?;
                let port = buf.read_u16()?;
                SdOption::Ipv4Endpoint {
                    address,
                    protocol,
                    port,
                }
            }
            OPTION_TYPE_IPV6_ENDPOINT => {
                if body_len != 20 {
                    return Err(ProtocolError::InvalidOption { ty, len: length });
                }
                let mut addr = [0u8; 16];
                addr.copy_from_slice(buf.read_slice(16)?);
                let address = Ipv6Addr::from(addr);
                let _reserved = buf.pop()?;
                let protocol = L4Protocol::try_from(buf.pop()?)?;
                let port = buf.read_u16()?;
                SdOption::Ipv6Endpoint {
                    address,
                    protocol,
                    port,
                }
            }
            OPTION_TYPE_IPV4_MULTICAST => {
                if body_len != 8 {
                    return Err(ProtocolError::InvalidOption { ty, len: length });
                }
                let addr = buf.read_slice(4)?;
                let address = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
                let _reserved = buf.pop()?;
                let protocol = L4Protocol::try_from(buf.pop()?)?;
                if protocol != L4Protocol::Udp {
                    return Err(ProtocolError::InvalidOption { ty, len: length });
                }
                let port = buf.read_u16()?;
                SdOption::Ipv4Multicast { address, port }
            }
            OPTION_TYPE_IPV6_MULTICAST => {
                if body_len != 20 {
                    return Err(ProtocolError::InvalidOption { ty, len: length });
                }
                let mut addr = [0u8; 16];
                addr.copy_from_slice(buf.read_slice(16)?);
                let address = Ipv6Addr::from(addr);
                let _reserved = buf.pop()?;
                let protocol = L4Protocol::try_from(buf.pop()?)?;
                if protocol != L4Protocol::Udp {
                    return Err(ProtocolError::InvalidOption { ty, len: length });
                }
                let port = buf.read_u16()?;
                SdOption::Ipv6Multicast { address, port }
            }
            OPTION_TYPE_CONFIGURATION => SdOption::Configuration {
                items: buf.read_vec(body_len)?,
            },
            OPTION_TYPE_LOAD_BALANCING => {
                if body_len != 4 {
                    return Err(ProtocolError::InvalidOption { ty, len: length });
                }
                SdOption::LoadBalancing {
                    priority: buf.read_u16()?,
                    weight: buf.read_u16()?,
                }
            }
            // Anything else (including the protection option we do not
            // interpret) is carried opaquely and skipped by consumers.
            _ => SdOption::Unknown {
                ty,
                data: buf.read_vec(body_len)?,
            },
        };

        Ok(option)
    }
}

impl Writeable for SdOption {
    type Error = BufferError;

    fn write(&self, buf: &mut WriteBuffer) -> Result<usize, BufferError> {
        let start = buf.len();
        match self {
            SdOption::Ipv4Endpoint {
                address,
                protocol,
                port,
            } => {
                buf.write_u16(0x0009);
                buf.push(OPTION_TYPE_IPV4_ENDPOINT);
                buf.push(0x00);
                buf.write_slice(&address.octets());
                buf.push(0x00);
                buf.push(u8::from(*protocol));
                buf.write_u16(*port);
            }
            SdOption::Ipv6Endpoint {
                address,
                protocol,
                port,
            } => {
                buf.write_u16(0x0015);
                buf.push(OPTION_TYPE_IPV6_ENDPOINT);
                buf.push(0x00);
                buf.write_slice(&address.octets());
                buf.push(0x00);
                buf.push(u8::from(*protocol));
                buf.write_u16(*port);
            }
            SdOption::Ipv4Multicast { address, port } => {
                buf.write_u16(0x0009);
                buf.push(OPTION_TYPE_IPV4_MULTICAST);
                buf.push(0x00);
                buf.write_slice(&address.octets());
                buf.push(0x00);
                buf.push(u8::from(L4Protocol::Udp));
                buf.write_u16(*port);
            }
            SdOption::Ipv6Multicast { address, port } => {
                buf.write_u16(0x0015);
                buf.push(OPTION_TYPE_IPV6_MULTICAST);
                buf.push(0x00);
                buf.write_slice(&address.octets());
                buf.push(0x00);
                buf.push(u8::from(L4Protocol::Udp));
                buf.write_u16(*port);
            }
            SdOption::Configuration { items } => {
                buf.write_u16((items.len() + 1) as u16);
                buf.push(OPTION_TYPE_CONFIGURATION);
                buf.push(0x00);
                buf.write_slice(items);
            }
            SdOption::LoadBalancing { priority, weight } => {
                buf.write_u16(0x0005);
                buf.push(OPTION_TYPE_LOAD_BALANCING);
                buf.push(0x00);
                buf.write_u16(*priority);
                buf.write_u16(*weight);
            }
            SdOption::Unknown { ty, data } => {
                buf.write_u16((data.len() + 1) as u16);
                buf.push(*ty);
                buf.push(0x00);
                buf.write_slice(data);
            }
        }

        Ok(buf.len() - start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ipv4_endpoint_round_trip() {
        let option = SdOption::Ipv4Endpoint {
            address: Ipv4Addr::new(192, 168, 0, 1),
            protocol: L4Protocol::Tcp,
            port: 30509,
        };

        let mut out = WriteBuffer::new();
        let n = option.write(&mut out).unwrap();
        assert_eq!(n, 12);

        let mut buf = ReadBuffer::new(out.bytes());
        assert_eq!(SdOption::read(&mut buf).unwrap(), option);
        assert!(buf.is_empty());
    }

    #[test]
    fn ipv6_multicast_round_trip() {
        let option = SdOption::Ipv6Multicast {
            address: "ff02::1".parse().unwrap(),
            port: 30490,
        };

        let mut out = WriteBuffer::new();
        let n = option.write(&mut out).unwrap();
        assert_eq!(n, 24);

        let mut buf = ReadBuffer::new(out.bytes());
        assert_eq!(SdOption::read(&mut buf).unwrap(), option);
    }

    #[test]
    fn unknown_option_is_preserved() {
        let raw = [0x00, 0x03, 0xFF, 0x00, 0xAB, 0xCD];
        let mut buf = ReadBuffer::new(&raw);
        let option = SdOption::read(&mut buf).unwrap();
        assert_eq!(
            option,
            SdOption::Unknown {
                ty: 0xFF,
                data: vec![0xAB, 0xCD]
            }
        );
        assert!(option.is_unknown());

        let mut out = WriteBuffer::new();
        option.write(&mut out).unwrap();
        assert_eq!(out.bytes(), &raw);
    }

    #[test]
    fn rejects_bad_endpoint_length() {
        let raw = [0x00, 0x05, 0x04, 0x00, 0x01, 0x02, 0x03, 0x04];
        let mut buf = ReadBuffer::new(&raw);
        assert!(matches!(
            SdOption::read(&mut buf),
            Err(ProtocolError::InvalidOption { ty: 0x04, .. })
        ));
    }
}
