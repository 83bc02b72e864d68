use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::warn;

use crate::constants::{SOMEIP_FULL_HEADER_SIZE, SOMEIP_HEADER_SIZE};
use crate::types::{SomeIpHeader, TpHeader, TP_HEADER_SIZE};
use crate::wire::{Readable, ReadBuffer, Writeable, WriteBuffer};

/// Segments are matched by sender and request identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct TpKey {
    sender: SocketAddr,
    service: u16,
    method: u16,
    client: u16,
    session: u16,
}

struct TpSession {
    header: SomeIpHeader,
    segments: BTreeMap<u32, Bytes>,
    total: Option<u32>,
    last_update: Instant,
}

impl TpSession {
    /// Returns the reassembled payload once all bytes up to the final
    /// segment are present and contiguous.
    fn try_assemble(&self) -> Option<Bytes> {
        let total = self.total?;
        let mut expected = 0u32;
        for (offset, segment) in &self.segments {
            if *offset != expected {
                return None;
            }
            expected += segment.len() as u32;
        }
        if expected != total {
            return None;
        }

        let mut payload = BytesMut::with_capacity(total as usize);
        for segment in self.segments.values() {
            payload.extend_from_slice(segment);
        }
        Some(payload.freeze())
    }
}

/// Reassembles SOME/IP-TP segmented messages arriving over UDP. Sessions
/// that see no segment for the configured timeout are discarded.
pub struct TpReassembler {
    sessions: Mutex<HashMap<TpKey, TpSession>>,
    timeout: Duration,
    max_message_size: usize,
}

impl TpReassembler {
    pub fn new(timeout: Duration, max_message_size: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            timeout,
            max_message_size,
        }
    }

    /// Feeds one TP segment (a full wire message with the TP flag set).
    /// Returns the reassembled, unsegmented wire message when complete.
    pub fn on_segment(&self, data: &Bytes, sender: SocketAddr) -> Option<Bytes> {
        if data.len() < SOMEIP_FULL_HEADER_SIZE + TP_HEADER_SIZE {
            return None;
        }

        let mut buf = ReadBuffer::new(data);
        let header = SomeIpHeader::read(&mut buf).ok()?;
        let tp = TpHeader::read(&mut buf).ok()?;
        let segment = data.slice(SOMEIP_FULL_HEADER_SIZE + TP_HEADER_SIZE..);

        let key = TpKey {
            sender,
            service: header.service,
            method: header.method,
            client: header.client,
            session: header.session,
        };

        let mut sessions = self.sessions.lock().expect("tp session lock");
        if tp.offset as usize + segment.len() > self.max_message_size {
            warn!(
                service = header.service,
                method = header.method,
                "dropping oversized TP reassembly"
            );
            sessions.remove(&key);
            return None;
        }

        let session = sessions.entry(key).or_insert_with(|| TpSession {
            header: header.clone(),
            segments: BTreeMap::new(),
            total: None,
            last_update: Instant::now(),
        });

        session.last_update = Instant::now();
        if !tp.more_segments {
            session.total = Some(tp.offset + segment.len() as u32);
        }
        session.segments.insert(tp.offset, segment);

        let payload = session.try_assemble()?;
        let stored = sessions.remove(&key)?.header;
        drop(sessions);

        let mut full = SomeIpHeader {
            message_type: stored.message_type.without_tp(),
            ..stored
        };
        full.set_payload_len(payload.len());

        let mut out = WriteBuffer::with_capacity(SOMEIP_FULL_HEADER_SIZE + payload.len());
        full.write(&mut out).ok()?;
        out.write_slice(&payload);
        Some(out.freeze())
    }

    /// Drops sessions that have not progressed within the timeout.
    pub fn purge(&self) {
        let mut sessions = self.sessions.lock().expect("tp session lock");
        let timeout = self.timeout;
        sessions.retain(|key, session| {
            let keep = session.last_update.elapsed() < timeout;
            if !keep {
                warn!(
                    service = key.service,
                    method = key.method,
                    "TP reassembly timed out"
                );
            }
            keep
        });
    }

    pub fn pending(&self) -> usize {
        self.sessions.lock().expect("tp session lock").len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageType;

    fn segment(session: u16, offset: u32, more: bool, payload: &[u8]) -> Bytes {
        let mut header = SomeIpHeader::new(0x1234, 0x0421);
        header.session = session;
        header.message_type = MessageType::RequestTp;
        header.length = (SOMEIP_HEADER_SIZE + TP_HEADER_SIZE + payload.len()) as u32;

        let mut out = WriteBuffer::new();
        header.write(&mut out).unwrap();
        TpHeader::new(offset, more).write(&mut out).unwrap();
        out.write_slice(payload);
        out.freeze()
    }

    fn sender() -> SocketAddr {
        "10.0.0.2:30509".parse().unwrap()
    }

    #[test]
    fn reassembles_in_order() {
        let tp = TpReassembler::new(Duration::from_secs(5), 4096);
        let first = vec![0xAA; 16];
        let second = vec![0xBB; 4];

        assert!(tp.on_segment(&segment(1, 0, true, &first), sender()).is_none());
        let full = tp
            .on_segment(&segment(1, 16, false, &second), sender())
            .unwrap();

        let mut buf = ReadBuffer::new(&full);
        let header = SomeIpHeader::read(&mut buf).unwrap();
        assert_eq!(header.message_type, MessageType::Request);
        assert_eq!(header.payload_len(), 20);
        assert_eq!(&full[16..32], &first[..]);
        assert_eq!(&full[32..], &second[..]);
        assert_eq!(tp.pending(), 0);
    }

    #[test]
    fn reassembles_out_of_order() {
        let tp = TpReassembler::new(Duration::from_secs(5), 4096);
        assert!(tp
            .on_segment(&segment(2, 16, false, &[2u8; 8]), sender())
            .is_none());
        assert!(tp
            .on_segment(&segment(2, 0, true, &[1u8; 16]), sender())
            .is_some());
    }

    #[test]
    fn sessions_are_separate_per_session_id() {
        let tp = TpReassembler::new(Duration::from_secs(5), 4096);
        assert!(tp.on_segment(&segment(1, 0, true, &[0u8; 16]), sender()).is_none());
        assert!(tp.on_segment(&segment(2, 0, true, &[0u8; 16]), sender()).is_none());
        assert_eq!(tp.pending(), 2);
    }

    #[test]
    fn purge_drops_stale_sessions() {
        let tp = TpReassembler::new(Duration::from_millis(0), 4096);
        assert!(tp.on_segment(&segment(1, 0, true, &[0u8; 16]), sender()).is_none());
        tp.purge();
        assert_eq!(tp.pending(), 0);
    }
}
