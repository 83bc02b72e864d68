use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::registry::RemoteSubscription;
use crate::transport::Command;
use crate::types::{
    ClientId, EventgroupId, InstanceId, MajorVersion, MinorVersion, ServiceId, Ttl,
};

use super::{Availability, PendingReply, RoutingManager, SubscriberRef, SubscriptionState};

impl RoutingManager {
    /// A remote OfferService was learned (or refreshed) by SD: update
    /// the registry, wire up client endpoints for interested requesters
    /// and publish availability.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_routing_info(
        self: &Arc<Self>,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        ttl: Ttl,
        origin: IpAddr,
        reliable_target: Option<SocketAddr>,
        unreliable_target: Option<SocketAddr>,
    ) {
        if self.routing_state() == super::RoutingState::Suspended {
            return;
        }

        let known = self.registry.find_service(service, instance);
        let refresh = known.is_some();

        let Some(info) =
            self.registry
                .create_service(service, instance, major, minor, ttl, false)
        else {
            warn!(
                service,
                instance, "ignoring remote offer, instance is offered locally"
            );
            return;
        };
        info.set_ttl(ttl);

        {
            let mut origins = self.remote_origins.lock().expect("origin lock");
            origins.insert((service, instance), origin);
        }

        // Requesters waiting for this service move onto its record.
        self.adopt_pending_requests(service, instance, major);

        let has_requesters = info.requesters_size() > 0;
        if has_requesters {
            for (reliable, target) in [(true, reliable_target), (false, unreliable_target)] {
                let Some(target) = target else { continue };
                if info.endpoint(reliable).is_some() {
                    continue;
                }
                match self.endpoints.find_or_create_client(target, reliable).await {
                    Ok(endpoint) => {
                        let this = self.clone();
                        endpoint.as_endpoint().register_error_handler(Box::new(move || {
                            this.on_remote_endpoint_error(service, instance);
                        }));
                        info.set_endpoint(endpoint.as_endpoint(), reliable);
                    }
                    Err(err) => {
                        warn!(service, instance, %target, %err, "remote client endpoint failed");
                    }
                }
            }
        }

        if !refresh {
            info!(service, instance, major, minor, ttl, %origin, "remote service available");
            self.notify_availability(service, instance, Availability::Available, major, minor);
        }

        // Subscriptions that waited for the offer go out now.
        let waiting: Vec<super::PendingSubscription> = {
            let mut pending = self
                .pending_subscriptions
                .lock()
                .expect("pending subscription lock");
            let (matching, rest): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(|entry| entry.service == service && entry.instance == instance);
            *pending = rest;
            matching
        };
        if let Some(discovery) = self.discovery() {
            for entry in waiting {
                self.registry.subscribe(
                    entry.client,
                    service,
                    instance,
                    entry.eventgroup,
                    entry.major,
                    None,
                );
                discovery.subscribe(service, instance, entry.eventgroup, entry.major, entry.event);
            }
        }
    }

    /// A remote service disappeared (stop-offer, TTL expiry or reboot):
    /// tear down client-side state and publish unavailability. Open
    /// subscriptions fall back into the pending set so a re-offer
    /// renews them.
    pub fn del_routing_info(self: &Arc<Self>, service: ServiceId, instance: InstanceId) {
        let Some(info) = self.registry.find_service(service, instance) else {
            return;
        };
        if info.is_local() {
            return;
        }

        info!(service, instance, "remote service unavailable");
        self.notify_availability(
            service,
            instance,
            Availability::Unavailable,
            info.major(),
            info.minor(),
        );

        // Requesters are preserved so a later offer finds them again.
        {
            let mut pending = self.pending_requests.lock().expect("pending request lock");
            for client in info.requesters() {
                pending.insert((
                    client,
                    service,
                    instance,
                    crate::constants::ANY_MAJOR,
                    crate::constants::ANY_MINOR,
                ));
            }
        }

        for group in self.registry.eventgroups_of(service, instance) {
            let eventgroup = group.eventgroup();
            for event in group.events() {
                if let Some(event_info) = self.registry.find_event(service, instance, event) {
                    for client in event_info.subscribers() {
                        let state = self
                            .registry
                            .subscription_state(service, instance, eventgroup, client);
                        if state != SubscriptionState::NotSubscribed {
                            self.registry.set_subscription_state(
                                service,
                                instance,
                                eventgroup,
                                client,
                                SubscriptionState::Subscribing,
                            );
                            let mut pending = self
                                .pending_subscriptions
                                .lock()
                                .expect("pending subscription lock");
                            let entry = super::PendingSubscription {
                                client,
                                service,
                                instance,
                                eventgroup,
                                major: group.major(),
                                event: 0,
                            };
                            if !pending.contains(&entry) {
                                pending.push(entry);
                            }
                        }
                    }
                }
            }
        }

        self.registry.clear_cached_payloads(service, instance);

        {
            let mut origins = self.remote_origins.lock().expect("origin lock");
            origins.remove(&(service, instance));
        }

        let this = self.clone();
        tokio::spawn(async move {
            for reliable in [true, false] {
                if let Some(endpoint) = info.clear_endpoint(reliable) {
                    if endpoint.use_count() == 0 {
                        endpoint.stop().await;
                    }
                }
            }
            this.registry.remove_service(service, instance);
        });
    }

    /// Ticks remote TTLs; expired instances are withdrawn exactly as a
    /// stop-offer would.
    pub fn expire_services(self: &Arc<Self>, elapsed: Duration) {
        for info in self.registry.remote_services() {
            if info.consume_ttl(elapsed) {
                let service = info.service();
                let instance = info.instance();
                warn!(service, instance, "remote service TTL expired");
                for client in info.requesters() {
                    if let Some(handle) = self.endpoints.find_local(client) {
                        handle.send_command(&Command::Expired {
                            service,
                            instance,
                            ttl: 0,
                        });
                    }
                }
                self.del_routing_info(service, instance);
            }
        }
    }

    /// Reboot detected for `origin`: every service learned from it is
    /// stale and gets invalidated.
    pub fn invalidate_remote_origin(self: &Arc<Self>, origin: IpAddr) {
        let stale: Vec<(ServiceId, InstanceId)> = {
            let origins = self.remote_origins.lock().expect("origin lock");
            origins
                .iter()
                .filter(|(_, o)| **o == origin)
                .map(|(key, _)| *key)
                .collect()
        };
        for (service, instance) in stale {
            warn!(service, instance, %origin, "invalidating state after reboot");
            self.del_routing_info(service, instance);
        }
    }

    /// A remote peer wants to subscribe one of our eventgroups. The
    /// provider application decides; the answer travels back through SD.
    #[allow(clippy::too_many_arguments)]
    pub fn on_remote_subscribe(
        self: &Arc<Self>,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        counter: u8,
        ttl: Ttl,
        subscription: RemoteSubscription,
        sender: SocketAddr,
    ) {
        let Some(provider) = self.find_local_client(service, instance) else {
            debug!(service, instance, eventgroup, "remote subscribe for unknown service");
            if let Some(discovery) = self.discovery() {
                discovery.answer_subscription(
                    service, instance, eventgroup, counter, ttl, false, sender,
                );
            }
            return;
        };

        if ttl == 0 {
            // Unsubscribe; for an unknown subscriber this is a no-op.
            if let Some(group) = self.registry.find_eventgroup(service, instance, eventgroup) {
                group.remove_remote_subscription(&subscription);
            }
            debug!(service, instance, eventgroup, "remote unsubscribe");
            return;
        }

        self.registry.create_eventgroup(service, instance, eventgroup, major);

        let pending = self.next_pending_id();
        {
            let mut replies = self.pending_replies.lock().expect("pending reply lock");
            replies.insert(
                pending,
                PendingReply {
                    subscriber: SubscriberRef::Remote {
                        subscription,
                        counter,
                        ttl,
                        sender,
                    },
                    service,
                    instance,
                    eventgroup,
                    event: 0,
                },
            );
        }

        let sec_client = crate::security::SecClient::default();
        self.ask_provider(
            provider,
            0,
            &sec_client,
            service,
            instance,
            eventgroup,
            major,
            0,
            pending,
        );
    }

    /// Ack/nack received for a subscription we sent to a remote provider.
    pub fn on_remote_subscription_answer(
        self: &Arc<Self>,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        accepted: bool,
    ) {
        let Some(group) = self.registry.find_eventgroup(service, instance, eventgroup) else {
            return;
        };

        let mut clients: Vec<ClientId> = Vec::new();
        for event in group.events() {
            if let Some(event_info) = self.registry.find_event(service, instance, event) {
                for client in event_info.subscribers() {
                    if !clients.contains(&client) {
                        clients.push(client);
                    }
                }
            }
        }

        for client in clients {
            let state = self
                .registry
                .subscription_state(service, instance, eventgroup, client);
            if state != SubscriptionState::Subscribing {
                continue;
            }
            self.registry.set_subscription_state(
                service,
                instance,
                eventgroup,
                client,
                if accepted {
                    SubscriptionState::Acknowledged
                } else {
                    SubscriptionState::Nacked
                },
            );
            self.notify_subscription_status(client, service, instance, eventgroup, 0, accepted);
        }
    }

    /// A remote client endpoint reported a transport error.
    pub(crate) fn on_remote_endpoint_error(self: &Arc<Self>, service: ServiceId, instance: InstanceId) {
        debug!(service, instance, "remote endpoint error");
    }

    /// Publishes availability to the host and to every local requester.
    pub(crate) fn notify_availability(
        &self,
        service: ServiceId,
        instance: InstanceId,
        availability: Availability,
        major: MajorVersion,
        minor: MinorVersion,
    ) {
        self.host
            .on_availability(service, instance, availability, major, minor);

        let available = availability == Availability::Available;
        let mut interested: Vec<ClientId> = self
            .registry
            .find_service(service, instance)
            .map(|info| info.requesters())
            .unwrap_or_default();
        {
            let pending = self.pending_requests.lock().expect("pending request lock");
            for (client, s, i, _, _) in pending.iter() {
                if *s == service && *i == instance && !interested.contains(client) {
                    interested.push(*client);
                }
            }
        }

        for client in interested {
            self.send_availability_to(client, service, instance, major, minor, available);
        }
    }
}
