use std::fmt::Display;

use crate::wire::{BufferError, Readable, ReadBuffer, Writeable, WriteBuffer};
use crate::ProtocolError;

/// The return code field of the SOME/IP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnCode {
    Ok,
    NotOk,
    UnknownService,
    UnknownMethod,
    NotReady,
    NotReachable,
    Timeout,
    WrongProtocolVersion,
    WrongInterfaceVersion,
    MalformedMessage,
    WrongMessageType,
}

impl TryFrom<u8> for ReturnCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::Ok),
            0x01 => Ok(Self::NotOk),
            0x02 => Ok(Self::UnknownService),
            0x03 => Ok(Self::UnknownMethod),
            0x04 => Ok(Self::NotReady),
            0x05 => Ok(Self::NotReachable),
            0x06 => Ok(Self::Timeout),
            0x07 => Ok(Self::WrongProtocolVersion),
            0x08 => Ok(Self::WrongInterfaceVersion),
            0x09 => Ok(Self::MalformedMessage),
            0x0a => Ok(Self::WrongMessageType),
            _ => Err(ProtocolError::InvalidReturnCode(value)),
        }
    }
}

impl From<ReturnCode> for u8 {
    fn from(value: ReturnCode) -> Self {
        match value {
            ReturnCode::Ok => 0x00,
            ReturnCode::NotOk => 0x01,
            ReturnCode::UnknownService => 0x02,
            ReturnCode::UnknownMethod => 0x03,
            ReturnCode::NotReady => 0x04,
            ReturnCode::NotReachable => 0x05,
            ReturnCode::Timeout => 0x06,
            ReturnCode::WrongProtocolVersion => 0x07,
            ReturnCode::WrongInterfaceVersion => 0x08,
            ReturnCode::MalformedMessage => 0x09,
            ReturnCode::WrongMessageType => 0x0a,
        }
    }
}

impl Display for ReturnCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReturnCode::Ok => write!(f, "E_OK"),
            ReturnCode::NotOk => write!(f, "E_NOT_OK"),
            ReturnCode::UnknownService => write!(f, "E_UNKNOWN_SERVICE"),
            ReturnCode::UnknownMethod => write!(f, "E_UNKNOWN_METHOD"),
            ReturnCode::NotReady => write!(f, "E_NOT_READY"),
            ReturnCode::NotReachable => write!(f, "E_NOT_REACHABLE"),
            ReturnCode::Timeout => write!(f, "E_TIMEOUT"),
            ReturnCode::WrongProtocolVersion => write!(f, "E_WRONG_PROTOCOL_VERSION"),
            ReturnCode::WrongInterfaceVersion => write!(f, "E_WRONG_INTERFACE_VERSION"),
            ReturnCode::MalformedMessage => write!(f, "E_MALFORMED_MESSAGE"),
            ReturnCode::WrongMessageType => write!(f, "E_WRONG_MESSAGE_TYPE"),
        }
    }
}

impl Readable for ReturnCode {
    type Error = ProtocolError;

    fn read(buf: &mut ReadBuffer<'_>) -> Result<Self, ProtocolError> {
        Self::try_from(buf.pop()?)
    }
}

impl Writeable for ReturnCode {
    type Error = BufferError;

    fn write(&self, buf: &mut WriteBuffer) -> Result<usize, BufferError> {
        buf.push(u8::from(*self));
        Ok(1)
    }
}
