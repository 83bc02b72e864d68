use thiserror::Error;

use crate::wire::BufferError;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid message type ({0:#04x})")]
    InvalidMessageType(u8),

    #[error("Invalid return code ({0:#04x})")]
    InvalidReturnCode(u8),

    #[error("Invalid SD entry type ({0:#04x})")]
    InvalidEntryType(u8),

    #[error("Invalid SD option of type {ty:#04x} with length {len}")]
    InvalidOption { ty: u8, len: u16 },

    #[error("Message length field ({0}) does not match buffer size ({1})")]
    LengthMismatch(u32, usize),

    #[error("Unsupported protocol version ({0:#04x})")]
    WrongProtocolVersion(u8),

    #[error("Message too short to carry a SOME/IP header")]
    TooShort,

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),
}
