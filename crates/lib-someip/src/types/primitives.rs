//! Fixed-width identifier types used throughout the protocol. All of them
//! travel big-endian on the wire.

pub type ServiceId = u16;
pub type InstanceId = u16;
pub type MethodId = u16;
pub type EventId = u16;
pub type EventgroupId = u16;
pub type ClientId = u16;
pub type SessionId = u16;
pub type MajorVersion = u8;
pub type MinorVersion = u32;

/// Time-to-live of an SD announcement in seconds. Only the low 24 bits are
/// representable on the wire; [`crate::TTL_INFINITE`] means "forever".
pub type Ttl = u32;

/// (service, instance), the unit of addressing for routing decisions.
pub type ServiceInstance = (ServiceId, InstanceId);
