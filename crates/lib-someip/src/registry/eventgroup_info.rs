use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::Instant;

use tracing::warn;

use crate::endpoint::EndpointDefinition;
use crate::types::{EventgroupId, EventId, InstanceId, MajorVersion, ServiceId};

/// A remote subscriber of an eventgroup, identified by its endpoint
/// definitions. Either transport may be absent; both present means the
/// eventgroup carries events of mixed reliability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSubscription {
    pub reliable: Option<EndpointDefinition>,
    pub unreliable: Option<EndpointDefinition>,
    pub counter: u8,
}

impl RemoteSubscription {
    /// Subscriptions are the same subscriber when they share any target.
    fn matches(&self, other: &RemoteSubscription) -> bool {
        (self.reliable.is_some() && self.reliable == other.reliable)
            || (self.unreliable.is_some() && self.unreliable == other.unreliable)
    }
}

/// Outcome of merging a received SubscribeEventgroup into the current
/// subscriber set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionUpdate {
    /// First subscription of this subscriber.
    New,
    /// Known subscriber, expiration refreshed.
    Refreshed,
    /// Known subscriber adding a transport it did not have before.
    Extended,
}

struct RemoteEntry {
    subscription: RemoteSubscription,
    /// `None` for infinite TTL.
    expires_at: Option<Instant>,
}

/// One eventgroup of a service instance: the set of member events plus
/// the current remote subscriber list.
pub struct EventgroupInfo {
    service: ServiceId,
    instance: InstanceId,
    eventgroup: EventgroupId,
    major: MajorVersion,
    selective: bool,
    /// Multicast distribution address once the threshold is reached.
    multicast: Mutex<Option<(IpAddr, u16)>>,
    /// Upper bound on concurrent remote subscribers; 0 means unlimited.
    max_remote_subscribers: usize,
    events: Mutex<HashSet<EventId>>,
    remote: Mutex<Vec<RemoteEntry>>,
}

impl EventgroupInfo {
    pub fn new(
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
    ) -> Self {
        Self {
            service,
            instance,
            eventgroup,
            major,
            selective: false,
            multicast: Mutex::new(None),
            max_remote_subscribers: 0,
            events: Mutex::new(HashSet::new()),
            remote: Mutex::new(Vec::new()),
        }
    }

    pub fn with_limit(mut self, max_remote_subscribers: usize) -> Self {
        self.max_remote_subscribers = max_remote_subscribers;
        self
    }

    pub fn with_selective(mut self) -> Self {
        self.selective = true;
        self
    }

    pub fn service(&self) -> ServiceId {
        self.service
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn eventgroup(&self) -> EventgroupId {
        self.eventgroup
    }

    pub fn major(&self) -> MajorVersion {
        self.major
    }

    pub fn is_selective(&self) -> bool {
        self.selective
    }

    pub fn set_multicast(&self, address: IpAddr, port: u16) {
        *self.multicast.lock().expect("multicast lock") = Some((address, port));
    }

    pub fn multicast(&self) -> Option<(IpAddr, u16)> {
        *self.multicast.lock().expect("multicast lock")
    }

    pub fn add_event(&self, event: EventId) {
        self.events.lock().expect("event lock").insert(event);
    }

    pub fn remove_event(&self, event: EventId) {
        self.events.lock().expect("event lock").remove(&event);
    }

    pub fn events(&self) -> Vec<EventId> {
        self.events.lock().expect("event lock").iter().copied().collect()
    }

    pub fn contains_event(&self, event: EventId) -> bool {
        self.events.lock().expect("event lock").contains(&event)
    }

    /// Merges a received subscription, refreshing a known subscriber or
    /// admitting a new one subject to the subscriber limit.
    pub fn update_remote_subscription(
        &self,
        subscription: RemoteSubscription,
        expires_at: Option<Instant>,
    ) -> Option<SubscriptionUpdate> {
        let mut remote = self.remote.lock().expect("remote subscription lock");

        for entry in remote.iter_mut() {
            if entry.subscription.matches(&subscription) {
                entry.expires_at = expires_at;
                entry.subscription.counter = subscription.counter;

                let mut extended = false;
                if entry.subscription.reliable.is_none() && subscription.reliable.is_some() {
                    entry.subscription.reliable = subscription.reliable;
                    extended = true;
                }
                if entry.subscription.unreliable.is_none() && subscription.unreliable.is_some() {
                    entry.subscription.unreliable = subscription.unreliable;
                    extended = true;
                }
                return Some(if extended {
                    SubscriptionUpdate::Extended
                } else {
                    SubscriptionUpdate::Refreshed
                });
            }
        }

        if self.max_remote_subscribers > 0 && remote.len() >= self.max_remote_subscribers {
            warn!(
                service = self.service,
                eventgroup = self.eventgroup,
                limit = self.max_remote_subscribers,
                "rejecting remote subscription, limit reached"
            );
            return None;
        }

        remote.push(RemoteEntry {
            subscription,
            expires_at,
        });
        Some(SubscriptionUpdate::New)
    }

    /// Removes the subscriber matching `subscription`; returns whether
    /// something was removed.
    pub fn remove_remote_subscription(&self, subscription: &RemoteSubscription) -> bool {
        let mut remote = self.remote.lock().expect("remote subscription lock");
        let before = remote.len();
        remote.retain(|entry| !entry.subscription.matches(subscription));
        remote.len() != before
    }

    /// Drops expired subscriptions; returns whether any were removed.
    pub fn expire_remote_subscriptions(&self, now: Instant) -> bool {
        let mut remote = self.remote.lock().expect("remote subscription lock");
        let before = remote.len();
        remote.retain(|entry| match entry.expires_at {
            Some(at) => at > now,
            None => true,
        });
        remote.len() != before
    }

    pub fn clear_remote_subscriptions(&self) {
        self.remote.lock().expect("remote subscription lock").clear();
    }

    pub fn remote_subscriptions(&self) -> Vec<RemoteSubscription> {
        self.remote
            .lock()
            .expect("remote subscription lock")
            .iter()
            .map(|entry| entry.subscription.clone())
            .collect()
    }

    pub fn has_remote_subscriptions(&self) -> bool {
        !self.remote.lock().expect("remote subscription lock").is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn definition(port: u16, reliable: bool) -> EndpointDefinition {
        EndpointDefinition::new(format!("10.0.0.7:{port}").parse().unwrap(), reliable)
    }

    fn group() -> EventgroupInfo {
        EventgroupInfo::new(0x1122, 0x0001, 0x1000, 1)
    }

    #[test]
    fn new_then_refresh() {
        let group = group();
        let sub = RemoteSubscription {
            reliable: None,
            unreliable: Some(definition(40000, false)),
            counter: 0,
        };

        assert_eq!(
            group.update_remote_subscription(sub.clone(), None),
            Some(SubscriptionUpdate::New)
        );
        assert_eq!(
            group.update_remote_subscription(sub, None),
            Some(SubscriptionUpdate::Refreshed)
        );
        assert_eq!(group.remote_subscriptions().len(), 1);
    }

    #[test]
    fn adding_second_transport_extends() {
        let group = group();
        let unreliable = RemoteSubscription {
            reliable: None,
            unreliable: Some(definition(40000, false)),
            counter: 0,
        };
        let both = RemoteSubscription {
            reliable: Some(definition(40001, true)),
            unreliable: Some(definition(40000, false)),
            counter: 0,
        };

        group.update_remote_subscription(unreliable, None);
        assert_eq!(
            group.update_remote_subscription(both, None),
            Some(SubscriptionUpdate::Extended)
        );
        assert_eq!(group.remote_subscriptions().len(), 1);
    }

    #[test]
    fn limit_rejects() {
        let group = EventgroupInfo::new(0x1122, 0x0001, 0x1000, 1).with_limit(1);
        let first = RemoteSubscription {
            reliable: None,
            unreliable: Some(definition(40000, false)),
            counter: 0,
        };
        let second = RemoteSubscription {
            reliable: None,
            unreliable: Some(definition(40001, false)),
            counter: 0,
        };

        assert!(group.update_remote_subscription(first, None).is_some());
        assert!(group.update_remote_subscription(second, None).is_none());
    }

    #[test]
    fn expiry() {
        let group = group();
        let sub = RemoteSubscription {
            reliable: None,
            unreliable: Some(definition(40000, false)),
            counter: 0,
        };
        let now = Instant::now();
        group.update_remote_subscription(sub, Some(now + Duration::from_secs(3)));

        assert!(!group.expire_remote_subscriptions(now + Duration::from_secs(1)));
        assert!(group.expire_remote_subscriptions(now + Duration::from_secs(4)));
        assert!(!group.has_remote_subscriptions());
    }
}
