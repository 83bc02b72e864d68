use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::constants::TTL_INFINITE;
use crate::endpoint::Endpoint;
use crate::types::{ClientId, InstanceId, MajorVersion, MinorVersion, ServiceId, Ttl};

/// One known service instance, local or remote. At most one reliable and
/// one unreliable endpoint may be attached; the instance is either local
/// or remote for its entire lifetime.
pub struct ServiceInfo {
    service: ServiceId,
    instance: InstanceId,
    major: MajorVersion,
    minor: MinorVersion,
    /// Remaining validity; infinite offers never decrease.
    precise_ttl: Mutex<Duration>,
    reliable: Mutex<Option<Arc<dyn Endpoint>>>,
    unreliable: Mutex<Option<Arc<dyn Endpoint>>>,
    requesters: Mutex<HashSet<ClientId>>,
    is_local: AtomicBool,
    in_mainphase: AtomicBool,
}

impl ServiceInfo {
    pub fn new(
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: Ttl,
        is_local: bool,
    ) -> Self {
        Self {
            service,
            instance,
            major,
            minor,
            precise_ttl: Mutex::new(ttl_to_duration(ttl)),
            reliable: Mutex::new(None),
            unreliable: Mutex::new(None),
            requesters: Mutex::new(HashSet::new()),
            is_local: AtomicBool::new(is_local),
            in_mainphase: AtomicBool::new(false),
        }
    }

    pub fn service(&self) -> ServiceId {
        self.service
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn major(&self) -> MajorVersion {
        self.major
    }

    pub fn minor(&self) -> MinorVersion {
        self.minor
    }

    pub fn is_local(&self) -> bool {
        self.is_local.load(Ordering::SeqCst)
    }

    pub fn is_in_mainphase(&self) -> bool {
        self.in_mainphase.load(Ordering::SeqCst)
    }

    pub fn set_in_mainphase(&self, value: bool) {
        self.in_mainphase.store(value, Ordering::SeqCst);
    }

    pub fn precise_ttl(&self) -> Duration {
        *self.precise_ttl.lock().expect("ttl lock")
    }

    pub fn set_ttl(&self, ttl: Ttl) {
        *self.precise_ttl.lock().expect("ttl lock") = ttl_to_duration(ttl);
    }

    pub fn set_precise_ttl(&self, ttl: Duration) {
        *self.precise_ttl.lock().expect("ttl lock") = ttl;
    }

    /// Decrements the remaining TTL by `elapsed`; returns `true` when the
    /// instance has expired. Infinite offers never expire.
    pub fn consume_ttl(&self, elapsed: Duration) -> bool {
        let mut ttl = self.precise_ttl.lock().expect("ttl lock");
        if *ttl == ttl_to_duration(TTL_INFINITE) {
            return false;
        }
        *ttl = ttl.saturating_sub(elapsed);
        ttl.is_zero()
    }

    pub fn endpoint(&self, reliable: bool) -> Option<Arc<dyn Endpoint>> {
        if reliable {
            self.reliable.lock().expect("endpoint lock").clone()
        } else {
            self.unreliable.lock().expect("endpoint lock").clone()
        }
    }

    pub fn set_endpoint(&self, endpoint: Arc<dyn Endpoint>, reliable: bool) {
        let slot = if reliable {
            &self.reliable
        } else {
            &self.unreliable
        };
        let mut slot = slot.lock().expect("endpoint lock");
        if slot.is_none() {
            endpoint.increment_use_count();
        }
        *slot = Some(endpoint);
    }

    pub fn clear_endpoint(&self, reliable: bool) -> Option<Arc<dyn Endpoint>> {
        let slot = if reliable {
            &self.reliable
        } else {
            &self.unreliable
        };
        let endpoint = slot.lock().expect("endpoint lock").take();
        if let Some(endpoint) = &endpoint {
            endpoint.decrement_use_count();
        }
        endpoint
    }

    pub fn add_client(&self, client: ClientId) {
        self.requesters.lock().expect("requester lock").insert(client);
    }

    pub fn remove_client(&self, client: ClientId) {
        self.requesters.lock().expect("requester lock").remove(&client);
    }

    pub fn has_client(&self, client: ClientId) -> bool {
        self.requesters.lock().expect("requester lock").contains(&client)
    }

    pub fn requesters(&self) -> Vec<ClientId> {
        self.requesters
            .lock()
            .expect("requester lock")
            .iter()
            .copied()
            .collect()
    }

    pub fn requesters_size(&self) -> usize {
        self.requesters.lock().expect("requester lock").len()
    }
}

/// Seconds on the wire, milliseconds in the record. The infinite TTL maps
/// to the maximum representable span so refreshes keep it infinite.
pub fn ttl_to_duration(ttl: Ttl) -> Duration {
    if ttl >= TTL_INFINITE {
        Duration::MAX
    } else {
        Duration::from_secs(u64::from(ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_countdown() {
        let info = ServiceInfo::new(0x1234, 0x0001, 1, 0, 3, false);
        assert!(!info.consume_ttl(Duration::from_secs(1)));
        assert!(!info.consume_ttl(Duration::from_secs(1)));
        assert!(info.consume_ttl(Duration::from_secs(1)));
    }

    #[test]
    fn infinite_ttl_never_expires() {
        let info = ServiceInfo::new(0x1234, 0x0001, 1, 0, TTL_INFINITE, false);
        assert!(!info.consume_ttl(Duration::from_secs(1_000_000)));
    }

    #[test]
    fn requester_set() {
        let info = ServiceInfo::new(0x1234, 0x0001, 1, 0, TTL_INFINITE, true);
        info.add_client(0x10);
        info.add_client(0x11);
        info.add_client(0x10);
        assert_eq!(info.requesters_size(), 2);

        info.remove_client(0x10);
        assert_eq!(info.requesters_size(), 1);
        assert!(info.has_client(0x11));
    }
}
