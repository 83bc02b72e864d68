use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use tracing::debug;

use crate::routing::SubscriptionState;
use crate::types::{
    ClientId, EventgroupId, EventId, InstanceId, MajorVersion, MinorVersion, ServiceId,
    ServiceInstance, Ttl,
};

mod event_info;
mod eventgroup_info;
mod service_info;

pub use event_info::*;
pub use eventgroup_info::*;
pub use service_info::*;

/// The broker's view of every known service, eventgroup and event.
/// Each table has its own lock; the registry is shared between the
/// routing manager and the SD engine.
pub struct ServiceRegistry {
    services: Mutex<HashMap<ServiceInstance, Arc<ServiceInfo>>>,
    eventgroups: Mutex<HashMap<(ServiceId, InstanceId, EventgroupId), Arc<EventgroupInfo>>>,
    events: Mutex<HashMap<(ServiceId, InstanceId, EventId), Arc<EventInfo>>>,
    subscription_states:
        Mutex<HashMap<(ServiceId, InstanceId, EventgroupId, ClientId), SubscriptionState>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            services: Mutex::new(HashMap::new()),
            eventgroups: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            subscription_states: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the record for (service, instance). Fails when the pair is
    /// already known with a conflicting locality, enforcing that an
    /// instance is local or remote but never both.
    pub fn create_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: Ttl,
        is_local: bool,
    ) -> Option<Arc<ServiceInfo>> {
        let mut services = self.services.lock().expect("service lock");
        if let Some(existing) = services.get(&(service, instance)) {
            if existing.is_local() != is_local {
                return None;
            }
            return Some(existing.clone());
        }

        let info = Arc::new(ServiceInfo::new(
            service, instance, major, minor, ttl, is_local,
        ));
        services.insert((service, instance), info.clone());
        debug!(service, instance, is_local, "created service record");
        Some(info)
    }

    pub fn find_service(&self, service: ServiceId, instance: InstanceId) -> Option<Arc<ServiceInfo>> {
        let services = self.services.lock().expect("service lock");
        services.get(&(service, instance)).cloned()
    }

    /// All instances of `service`.
    pub fn find_instances(&self, service: ServiceId) -> Vec<Arc<ServiceInfo>> {
        let services = self.services.lock().expect("service lock");
        services
            .iter()
            .filter(|((s, _), _)| *s == service)
            .map(|(_, info)| info.clone())
            .collect()
    }

    pub fn remove_service(&self, service: ServiceId, instance: InstanceId) -> Option<Arc<ServiceInfo>> {
        let mut services = self.services.lock().expect("service lock");
        services.remove(&(service, instance))
    }

    pub fn services(&self) -> Vec<Arc<ServiceInfo>> {
        let services = self.services.lock().expect("service lock");
        services.values().cloned().collect()
    }

    pub fn local_services(&self) -> Vec<Arc<ServiceInfo>> {
        self.services()
            .into_iter()
            .filter(|info| info.is_local())
            .collect()
    }

    pub fn remote_services(&self) -> Vec<Arc<ServiceInfo>> {
        self.services()
            .into_iter()
            .filter(|info| !info.is_local())
            .collect()
    }

    pub fn create_eventgroup(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
    ) -> Arc<EventgroupInfo> {
        let mut eventgroups = self.eventgroups.lock().expect("eventgroup lock");
        eventgroups
            .entry((service, instance, eventgroup))
            .or_insert_with(|| {
                Arc::new(EventgroupInfo::new(service, instance, eventgroup, major))
            })
            .clone()
    }

    pub fn find_eventgroup(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> Option<Arc<EventgroupInfo>> {
        let eventgroups = self.eventgroups.lock().expect("eventgroup lock");
        eventgroups.get(&(service, instance, eventgroup)).cloned()
    }

    pub fn eventgroups_of(&self, service: ServiceId, instance: InstanceId) -> Vec<Arc<EventgroupInfo>> {
        let eventgroups = self.eventgroups.lock().expect("eventgroup lock");
        eventgroups
            .iter()
            .filter(|((s, i, _), _)| *s == service && *i == instance)
            .map(|(_, info)| info.clone())
            .collect()
    }

    /// Registers an event and links it into its eventgroups.
    pub fn register_event(
        &self,
        info: EventInfo,
        eventgroups: &[EventgroupId],
        major: MajorVersion,
    ) -> Arc<EventInfo> {
        let key = (info.service(), info.instance(), info.event());
        let event = {
            let mut events = self.events.lock().expect("event lock");
            // A placeholder created by an early subscription is replaced
            // by the real registration; its subscribers carry over.
            if let Some(existing) = events.get(&key) {
                if !existing.is_placeholder() {
                    return existing.clone();
                }
                for client in existing.subscribers() {
                    info.add_subscriber(client);
                }
                for eventgroup in existing.eventgroups() {
                    info.add_eventgroup(eventgroup);
                }
            }
            let event = Arc::new(info);
            events.insert(key, event.clone());
            event
        };

        for eventgroup in eventgroups {
            event.add_eventgroup(*eventgroup);
            let group = self.create_eventgroup(key.0, key.1, *eventgroup, major);
            group.add_event(key.2);
        }
        event
    }

    pub fn unregister_event(&self, service: ServiceId, instance: InstanceId, event: EventId) {
        let removed = {
            let mut events = self.events.lock().expect("event lock");
            events.remove(&(service, instance, event))
        };
        if let Some(removed) = removed {
            for eventgroup in removed.eventgroups() {
                if let Some(group) = self.find_eventgroup(service, instance, eventgroup) {
                    group.remove_event(event);
                }
            }
        }
    }

    pub fn find_event(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
    ) -> Option<Arc<EventInfo>> {
        let events = self.events.lock().expect("event lock");
        events.get(&(service, instance, event)).cloned()
    }

    pub fn events_of(&self, service: ServiceId, instance: InstanceId) -> Vec<Arc<EventInfo>> {
        let events = self.events.lock().expect("event lock");
        events
            .iter()
            .filter(|((s, i, _), _)| *s == service && *i == instance)
            .map(|(_, info)| info.clone())
            .collect()
    }

    /// Subscribes `client` to every event of the eventgroup, creating a
    /// placeholder when the event is not registered yet.
    pub fn subscribe(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        event_filter: Option<EventId>,
    ) {
        let group = self.create_eventgroup(service, instance, eventgroup, major);
        let members = group.events();

        match event_filter {
            Some(event) => {
                self.subscribe_event(client, service, instance, eventgroup, event);
            }
            None if members.is_empty() => {
                // Nothing registered yet; remember the intent through a
                // placeholder keyed by the eventgroup id.
                self.subscribe_event(client, service, instance, eventgroup, eventgroup);
            }
            None => {
                for event in members {
                    self.subscribe_event(client, service, instance, eventgroup, event);
                }
            }
        }

        self.set_subscription_state(
            service,
            instance,
            eventgroup,
            client,
            SubscriptionState::Subscribing,
        );
    }

    fn subscribe_event(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
    ) {
        let mut events = self.events.lock().expect("event lock");
        let info = events
            .entry((service, instance, event))
            .or_insert_with(|| {
                Arc::new(EventInfo::placeholder(service, instance, event, eventgroup))
            });
        info.add_subscriber(client);
    }

    /// Removes `client` from the eventgroup; returns `true` when the
    /// eventgroup has no local subscribers left.
    pub fn unsubscribe(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) -> bool {
        let mut last = true;
        if let Some(group) = self.find_eventgroup(service, instance, eventgroup) {
            for event in group.events() {
                if let Some(info) = self.find_event(service, instance, event) {
                    info.remove_subscriber(client);
                    last &= !info.has_subscribers();
                }
            }
        }
        // Placeholder subscriptions are keyed by the eventgroup id.
        if let Some(info) = self.find_event(service, instance, eventgroup) {
            info.remove_subscriber(client);
            last &= !info.has_subscribers();
        }

        self.clear_subscription_state(service, instance, eventgroup, client);
        last
    }

    /// Applies the event's filters to `payload`. `None` means the update
    /// is suppressed; `Some` carries the local subscribers to notify.
    pub fn update_and_get_filtered_subscribers(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: &Bytes,
    ) -> Option<Vec<ClientId>> {
        match self.find_event(service, instance, event) {
            Some(info) => info.update_and_filter(payload),
            None => Some(Vec::new()),
        }
    }

    /// Clears cached payloads of every event of (service, instance).
    pub fn clear_cached_payloads(&self, service: ServiceId, instance: InstanceId) {
        for event in self.events_of(service, instance) {
            event.clear_payload();
        }
    }

    pub fn set_subscription_state(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        client: ClientId,
        state: SubscriptionState,
    ) {
        let mut states = self.subscription_states.lock().expect("subscription state lock");
        states.insert((service, instance, eventgroup, client), state);
    }

    pub fn subscription_state(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        client: ClientId,
    ) -> SubscriptionState {
        let states = self.subscription_states.lock().expect("subscription state lock");
        states
            .get(&(service, instance, eventgroup, client))
            .copied()
            .unwrap_or(SubscriptionState::NotSubscribed)
    }

    pub fn clear_subscription_state(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        client: ClientId,
    ) {
        let mut states = self.subscription_states.lock().expect("subscription state lock");
        states.remove(&(service, instance, eventgroup, client));
    }

    /// Expires remote subscriptions across all eventgroups. Returns the
    /// eventgroups that lost subscribers.
    pub fn expire_remote_subscriptions(&self, now: Instant) -> Vec<Arc<EventgroupInfo>> {
        let snapshot: Vec<Arc<EventgroupInfo>> = {
            let eventgroups = self.eventgroups.lock().expect("eventgroup lock");
            eventgroups.values().cloned().collect()
        };
        snapshot
            .into_iter()
            .filter(|group| group.expire_remote_subscriptions(now))
            .collect()
    }

    /// Removes every trace of (service, instance): events, eventgroups,
    /// subscription states and the service record itself.
    pub fn purge_instance(&self, service: ServiceId, instance: InstanceId) {
        {
            let mut events = self.events.lock().expect("event lock");
            events.retain(|(s, i, _), _| !(*s == service && *i == instance));
        }
        {
            let mut eventgroups = self.eventgroups.lock().expect("eventgroup lock");
            eventgroups.retain(|(s, i, _), _| !(*s == service && *i == instance));
        }
        {
            let mut states = self.subscription_states.lock().expect("subscription state lock");
            states.retain(|(s, i, _, _), _| !(*s == service && *i == instance));
        }
        self.remove_service(service, instance);
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::TTL_INFINITE;

    #[test]
    fn local_remote_conflict_is_rejected() {
        let registry = ServiceRegistry::new();
        assert!(registry
            .create_service(0x1234, 0x0001, 1, 0, TTL_INFINITE, true)
            .is_some());
        assert!(registry
            .create_service(0x1234, 0x0001, 1, 0, TTL_INFINITE, false)
            .is_none());
        assert!(registry
            .create_service(0x1234, 0x0001, 1, 0, TTL_INFINITE, true)
            .is_some());
    }

    #[test]
    fn placeholder_subscribers_carry_over() {
        let registry = ServiceRegistry::new();
        registry.subscribe(0x10, 0x1234, 0x0001, 0x4465, 1, Some(0x8001));

        let info = EventInfo::new(
            0x1234,
            0x0001,
            0x8001,
            EventKind::Field,
            Reliability::Unreliable,
            true,
        );
        let event = registry.register_event(info, &[0x4465], 1);
        assert_eq!(event.subscribers(), vec![0x10]);
        assert!(!event.is_placeholder());

        let group = registry.find_eventgroup(0x1234, 0x0001, 0x4465).unwrap();
        assert!(group.contains_event(0x8001));
    }

    #[test]
    fn unsubscribe_reports_last() {
        let registry = ServiceRegistry::new();
        let info = EventInfo::new(
            0x1234,
            0x0001,
            0x8001,
            EventKind::Event,
            Reliability::Unreliable,
            true,
        );
        registry.register_event(info, &[0x4465], 1);

        registry.subscribe(0x10, 0x1234, 0x0001, 0x4465, 1, None);
        registry.subscribe(0x11, 0x1234, 0x0001, 0x4465, 1, None);

        assert!(!registry.unsubscribe(0x10, 0x1234, 0x0001, 0x4465));
        assert!(registry.unsubscribe(0x11, 0x1234, 0x0001, 0x4465));
    }

    #[test]
    fn subscription_state_transitions() {
        let registry = ServiceRegistry::new();
        assert_eq!(
            registry.subscription_state(1, 1, 1, 0x10),
            SubscriptionState::NotSubscribed
        );

        registry.subscribe(0x10, 1, 1, 1, 1, None);
        assert_eq!(
            registry.subscription_state(1, 1, 1, 0x10),
            SubscriptionState::Subscribing
        );

        registry.set_subscription_state(1, 1, 1, 0x10, SubscriptionState::Acknowledged);
        assert_eq!(
            registry.subscription_state(1, 1, 1, 0x10),
            SubscriptionState::Acknowledged
        );

        registry.unsubscribe(0x10, 1, 1, 1);
        assert_eq!(
            registry.subscription_state(1, 1, 1, 0x10),
            SubscriptionState::NotSubscribed
        );
    }

    #[test]
    fn purge_removes_everything() {
        let registry = ServiceRegistry::new();
        registry.create_service(0x1234, 0x0001, 1, 0, TTL_INFINITE, false);
        registry.subscribe(0x10, 0x1234, 0x0001, 0x4465, 1, None);

        registry.purge_instance(0x1234, 0x0001);
        assert!(registry.find_service(0x1234, 0x0001).is_none());
        assert!(registry.find_eventgroup(0x1234, 0x0001, 0x4465).is_none());
        assert!(registry.find_event(0x1234, 0x0001, 0x4465).is_none());
    }
}
