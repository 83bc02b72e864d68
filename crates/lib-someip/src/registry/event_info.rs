use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::types::{ClientId, EventgroupId, EventId, InstanceId, ServiceId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Plain event: fire-and-forget, nothing cached.
    Event,
    /// Field: the last value is cached and replayed to new subscribers.
    Field,
    /// Selective event: subscribers are addressed individually.
    Selective,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reliability {
    Reliable,
    Unreliable,
    Both,
    Unknown,
}

/// Notification filters applied before fan-out.
pub struct UpdatePolicy {
    /// Minimum time between notifications.
    pub cycle: Option<Duration>,
    /// A changed value restarts the cycle instead of being suppressed.
    pub change_resets_cycle: bool,
    /// Only notify when the payload actually changed.
    pub update_on_change: bool,
    /// Change predicate; returns `true` when the difference between old
    /// and new payload is significant enough to notify.
    pub epsilon: Option<Box<dyn Fn(&[u8], &[u8]) -> bool + Send + Sync>>,
}

impl Default for UpdatePolicy {
    fn default() -> Self {
        Self {
            cycle: None,
            change_resets_cycle: false,
            update_on_change: true,
            epsilon: None,
        }
    }
}

/// One event or field of a service instance.
pub struct EventInfo {
    service: ServiceId,
    instance: InstanceId,
    event: EventId,
    kind: EventKind,
    reliability: Reliability,
    /// Provider-side events distribute; shadow events mirror a remote
    /// provider's cache on the consumer side.
    is_provided: bool,
    /// Placeholder created for a subscription before the provider
    /// registered the event.
    is_placeholder: bool,
    payload: Mutex<Option<Bytes>>,
    subscribers: Mutex<HashSet<ClientId>>,
    /// Back-references by id; the eventgroup table owns the records.
    eventgroups: Mutex<HashSet<EventgroupId>>,
    policy: Mutex<UpdatePolicy>,
    last_notified: Mutex<Option<Instant>>,
}

impl EventInfo {
    pub fn new(
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        kind: EventKind,
        reliability: Reliability,
        is_provided: bool,
    ) -> Self {
        Self {
            service,
            instance,
            event,
            kind,
            reliability,
            is_provided,
            is_placeholder: false,
            payload: Mutex::new(None),
            subscribers: Mutex::new(HashSet::new()),
            eventgroups: Mutex::new(HashSet::new()),
            policy: Mutex::new(UpdatePolicy::default()),
            last_notified: Mutex::new(None),
        }
    }

    pub fn placeholder(
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        eventgroup: EventgroupId,
    ) -> Self {
        let info = Self {
            is_placeholder: true,
            ..Self::new(
                service,
                instance,
                event,
                EventKind::Event,
                Reliability::Unknown,
                false,
            )
        };
        info.add_eventgroup(eventgroup);
        info
    }

    pub fn service(&self) -> ServiceId {
        self.service
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn event(&self) -> EventId {
        self.event
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn reliability(&self) -> Reliability {
        self.reliability
    }

    pub fn is_provided(&self) -> bool {
        self.is_provided
    }

    pub fn is_placeholder(&self) -> bool {
        self.is_placeholder
    }

    pub fn is_field(&self) -> bool {
        self.kind == EventKind::Field
    }

    pub fn is_selective(&self) -> bool {
        self.kind == EventKind::Selective
    }

    pub fn set_policy(&self, policy: UpdatePolicy) {
        *self.policy.lock().expect("policy lock") = policy;
    }

    pub fn cached_payload(&self) -> Option<Bytes> {
        self.payload.lock().expect("payload lock").clone()
    }

    pub fn clear_payload(&self) {
        *self.payload.lock().expect("payload lock") = None;
        *self.last_notified.lock().expect("notify lock") = None;
    }

    pub fn add_subscriber(&self, client: ClientId) {
        self.subscribers.lock().expect("subscriber lock").insert(client);
    }

    pub fn remove_subscriber(&self, client: ClientId) {
        self.subscribers.lock().expect("subscriber lock").remove(&client);
    }

    pub fn subscribers(&self) -> Vec<ClientId> {
        self.subscribers
            .lock()
            .expect("subscriber lock")
            .iter()
            .copied()
            .collect()
    }

    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.lock().expect("subscriber lock").is_empty()
    }

    pub fn add_eventgroup(&self, eventgroup: EventgroupId) {
        self.eventgroups
            .lock()
            .expect("eventgroup lock")
            .insert(eventgroup);
    }

    pub fn eventgroups(&self) -> Vec<EventgroupId> {
        self.eventgroups
            .lock()
            .expect("eventgroup lock")
            .iter()
            .copied()
            .collect()
    }

    /// Stores `payload` and decides whether subscribers must be notified,
    /// applying the update-on-change, epsilon and cycle filters. `None`
    /// means the update was filtered out entirely; `Some` carries the
    /// local subscribers to notify.
    pub fn update_and_filter(&self, payload: &Bytes) -> Option<Vec<ClientId>> {
        let changed = {
            let mut cached = self.payload.lock().expect("payload lock");
            let changed = match cached.as_ref() {
                Some(old) => {
                    let policy = self.policy.lock().expect("policy lock");
                    match policy.epsilon.as_ref() {
                        Some(significant) => significant(old, payload),
                        None => old != payload,
                    }
                }
                None => true,
            };
            if self.kind != EventKind::Event || changed {
                *cached = Some(payload.clone());
            }
            changed
        };

        let policy = self.policy.lock().expect("policy lock");
        if policy.update_on_change && !changed {
            return None;
        }

        if let Some(cycle) = policy.cycle {
            let mut last = self.last_notified.lock().expect("notify lock");
            let within_cycle = last
                .map(|at| at.elapsed() < cycle)
                .unwrap_or(false);
            if within_cycle && !(changed && policy.change_resets_cycle) {
                return None;
            }
            *last = Some(Instant::now());
        } else {
            *self.last_notified.lock().expect("notify lock") = Some(Instant::now());
        }

        Some(self.subscribers())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> EventInfo {
        EventInfo::new(0x1234, 0x0001, 0x8001, EventKind::Field, Reliability::Unreliable, true)
    }

    #[test]
    fn update_on_change_filters_duplicates() {
        let info = event();
        info.add_subscriber(0x10);

        let payload = Bytes::from_static(&[1, 2, 3]);
        assert_eq!(info.update_and_filter(&payload), Some(vec![0x10]));
        assert_eq!(info.update_and_filter(&payload), None);

        let changed = Bytes::from_static(&[1, 2, 4]);
        assert_eq!(info.update_and_filter(&changed), Some(vec![0x10]));
    }

    #[test]
    fn epsilon_suppresses_insignificant_change() {
        let info = event();
        info.add_subscriber(0x10);
        info.set_policy(UpdatePolicy {
            // significant only when the first byte moves by more than 1
            epsilon: Some(Box::new(|old, new| {
                old.first()
                    .zip(new.first())
                    .map(|(a, b)| a.abs_diff(*b) > 1)
                    .unwrap_or(true)
            })),
            ..UpdatePolicy::default()
        });

        assert_eq!(info.update_and_filter(&Bytes::from_static(&[10])), Some(vec![0x10]));
        assert_eq!(info.update_and_filter(&Bytes::from_static(&[11])), None);
        assert_eq!(info.update_and_filter(&Bytes::from_static(&[13])), Some(vec![0x10]));
    }

    #[test]
    fn cycle_suppresses_until_elapsed() {
        let info = event();
        info.add_subscriber(0x10);
        info.set_policy(UpdatePolicy {
            cycle: Some(Duration::from_secs(3600)),
            update_on_change: false,
            ..UpdatePolicy::default()
        });

        assert_eq!(info.update_and_filter(&Bytes::from_static(&[1])), Some(vec![0x10]));
        assert_eq!(info.update_and_filter(&Bytes::from_static(&[2])), None);
    }

    #[test]
    fn change_resets_cycle() {
        let info = event();
        info.add_subscriber(0x10);
        info.set_policy(UpdatePolicy {
            cycle: Some(Duration::from_secs(3600)),
            change_resets_cycle: true,
            update_on_change: false,
            ..UpdatePolicy::default()
        });

        assert_eq!(info.update_and_filter(&Bytes::from_static(&[1])), Some(vec![0x10]));
        assert_eq!(info.update_and_filter(&Bytes::from_static(&[2])), Some(vec![0x10]));
        assert_eq!(info.update_and_filter(&Bytes::from_static(&[2])), None);
    }

    #[test]
    fn field_caches_payload() {
        let info = event();
        let payload = Bytes::from_static(&[9, 9]);
        info.update_and_filter(&payload);
        assert_eq!(info.cached_payload(), Some(payload));

        info.clear_payload();
        assert_eq!(info.cached_payload(), None);
    }
}
