use std::fmt::Display;

use crate::wire::{BufferError, Readable, ReadBuffer, Writeable, WriteBuffer};
use crate::ProtocolError;

/// The message type field of the SOME/IP header. The `0x20` bit marks a
/// segmented (SOME/IP-TP) variant of the base type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request,
    RequestNoReturn,
    Notification,
    Response,
    Error,
    RequestTp,
    RequestNoReturnTp,
    NotificationTp,
    ResponseTp,
    ErrorTp,
}

pub const TP_FLAG: u8 = 0x20;

impl MessageType {
    /// Whether a failure while processing this message warrants an error
    /// reply instead of a silent drop.
    pub fn expects_reply(&self) -> bool {
        matches!(self, MessageType::Request | MessageType::RequestTp)
    }

    pub fn is_tp(&self) -> bool {
        matches!(
            self,
            MessageType::RequestTp
                | MessageType::RequestNoReturnTp
                | MessageType::NotificationTp
                | MessageType::ResponseTp
                | MessageType::ErrorTp
        )
    }

    /// The equivalent non-segmented type.
    pub fn without_tp(&self) -> MessageType {
        match self {
            MessageType::RequestTp => MessageType::Request,
            MessageType::RequestNoReturnTp => MessageType::RequestNoReturn,
            MessageType::NotificationTp => MessageType::Notification,
            MessageType::ResponseTp => MessageType::Response,
            MessageType::ErrorTp => MessageType::Error,
            other => *other,
        }
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::Request),
            0x01 => Ok(Self::RequestNoReturn),
            0x02 => Ok(Self::Notification),
            0x80 => Ok(Self::Response),
            0x81 => Ok(Self::Error),
            0x20 => Ok(Self::RequestTp),
            0x21 => Ok(Self::RequestNoReturnTp),
            0x22 => Ok(Self::NotificationTp),
            0xa0 => Ok(Self::ResponseTp),
            0xa1 => Ok(Self::ErrorTp),
            _ => Err(ProtocolError::InvalidMessageType(value)),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Request => 0x00,
            MessageType::RequestNoReturn => 0x01,
            MessageType::Notification => 0x02,
            MessageType::Response => 0x80,
            MessageType::Error => 0x81,
            MessageType::RequestTp => 0x20,
            MessageType::RequestNoReturnTp => 0x21,
            MessageType::NotificationTp => 0x22,
            MessageType::ResponseTp => 0xa0,
            MessageType::ErrorTp => 0xa1,
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageType::Request => write!(f, "REQUEST"),
            MessageType::RequestNoReturn => write!(f, "REQUEST_NO_RETURN"),
            MessageType::Notification => write!(f, "NOTIFICATION"),
            MessageType::Response => write!(f, "RESPONSE"),
            MessageType::Error => write!(f, "ERROR"),
            MessageType::RequestTp => write!(f, "REQUEST (TP)"),
            MessageType::RequestNoReturnTp => write!(f, "REQUEST_NO_RETURN (TP)"),
            MessageType::NotificationTp => write!(f, "NOTIFICATION (TP)"),
            MessageType::ResponseTp => write!(f, "RESPONSE (TP)"),
            MessageType::ErrorTp => write!(f, "ERROR (TP)"),
        }
    }
}

impl Readable for MessageType {
    type Error = ProtocolError;

    fn read(buf: &mut ReadBuffer<'_>) -> Result<Self, ProtocolError> {
        Self::try_from(buf.pop()?)
    }
}

impl Writeable for MessageType {
    type Error = BufferError;

    fn write(&self, buf: &mut WriteBuffer) -> Result<usize, BufferError> {
        buf.push(u8::from(*self));
        Ok(1)
    }
}
