use crate::types::{ClientId, EventgroupId, InstanceId, MajorVersion, MethodId, MinorVersion, ServiceId};

/// Protocol version carried in every SOME/IP header.
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Size of the part of the SOME/IP header that precedes the length field,
/// plus the length field itself. The length field covers everything after
/// it, so a full message occupies `SOMEIP_HEADER_SIZE + length` bytes.
pub const SOMEIP_HEADER_SIZE: usize = 8;

/// Full size of the SOME/IP header including the fields covered by length.
pub const SOMEIP_FULL_HEADER_SIZE: usize = 16;

pub const ANY_SERVICE: ServiceId = 0xFFFF;
pub const ANY_INSTANCE: InstanceId = 0xFFFF;
pub const ANY_METHOD: MethodId = 0xFFFF;
pub const ANY_EVENTGROUP: EventgroupId = 0xFFFF;
pub const ANY_MAJOR: MajorVersion = 0xFF;
pub const ANY_MINOR: MinorVersion = 0xFFFF_FFFF;

pub const ILLEGAL_PORT: u16 = 0xFFFF;

/// Broker-internal client id.
pub const ROUTING_CLIENT: ClientId = 0x0000;

/// TTL value meaning "valid until explicitly withdrawn".
pub const TTL_INFINITE: u32 = 0xFF_FFFF;

/// Events carry the top bit of the method field.
pub const EVENT_ID_FLAG: MethodId = 0x8000;

// Service discovery addressing
pub const SD_SERVICE: ServiceId = 0xFFFF;
pub const SD_INSTANCE: InstanceId = 0x0000;
pub const SD_METHOD: MethodId = 0x8100;
pub const SD_CLIENT: ClientId = 0x0000;

pub const SD_DEFAULT_MULTICAST: &str = "224.224.224.0";
pub const SD_DEFAULT_PORT: u16 = 30490;
pub const SD_DEFAULT_INITIAL_DELAY_MIN: u32 = 0;
pub const SD_DEFAULT_INITIAL_DELAY_MAX: u32 = 3000;
pub const SD_DEFAULT_REPETITIONS_BASE_DELAY: u32 = 10;
pub const SD_DEFAULT_REPETITIONS_MAX: u8 = 3;
pub const SD_DEFAULT_CYCLIC_OFFER_DELAY: u32 = 1000;
pub const SD_DEFAULT_REQUEST_RESPONSE_DELAY: u32 = 2000;
pub const SD_DEFAULT_OFFER_DEBOUNCE_TIME: u32 = 500;
pub const SD_DEFAULT_FIND_DEBOUNCE_TIME: u32 = 500;

/// Payload space available for SD entries and options in one datagram.
pub const SD_MAX_UDP_PAYLOAD: usize = 1380;

pub const MAX_MESSAGE_SIZE_UNRELIABLE: usize = 1400;
pub const MAX_LOCAL_MESSAGE_SIZE: usize = 1024 * 1024;

/// The magic cookie a client inserts into its TCP stream.
pub const CLIENT_COOKIE: [u8; 16] = [
    0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x08, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x01, 0x01,
    0x00,
];

/// The magic cookie a service inserts into its TCP stream.
pub const SERVICE_COOKIE: [u8; 16] = [
    0xFF, 0xFF, 0x80, 0x00, 0x00, 0x00, 0x00, 0x08, 0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x01, 0x02,
    0x00,
];
