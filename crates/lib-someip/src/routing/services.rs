use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::endpoint::Endpoint;
use crate::security::{PolicyDecision, SecClient};
use crate::transport::{Command, PendingId};
use crate::types::{
    ClientId, EventgroupId, EventId, InstanceId, MajorVersion, MinorVersion, ServiceId,
};

use super::{PendingReply, PendingSubscription, RoutingManager, SubscriberRef, SubscriptionState};

impl RoutingManager {
    /// Records `client` as requester of (service, instance). Unknown
    /// remote services are searched through SD.
    pub async fn request_service(
        self: &Arc<Self>,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) {
        match self.registry.find_service(service, instance) {
            Some(info) => {
                info.add_client(client);
                debug!(client, service, instance, "request for known service");
                self.send_availability_to(
                    client,
                    service,
                    instance,
                    info.major(),
                    info.minor(),
                    true,
                );
            }
            None => {
                {
                    let mut pending = self.pending_requests.lock().expect("pending request lock");
                    pending.insert((client, service, instance, major, minor));
                }
                if let Some(discovery) = self.discovery() {
                    discovery.request_service(service, instance);
                }
                debug!(client, service, instance, "request recorded, service unknown");
            }
        }
    }

    /// Removes the requester; the last one releasing tears down the
    /// client-side state of a remote service.
    pub fn release_service(self: &Arc<Self>, client: ClientId, service: ServiceId, instance: InstanceId) {
        {
            let mut pending = self.pending_requests.lock().expect("pending request lock");
            pending.retain(|(c, s, i, _, _)| !(*c == client && *s == service && *i == instance));
        }

        let Some(info) = self.registry.find_service(service, instance) else {
            return;
        };
        info.remove_client(client);

        for group in self.registry.eventgroups_of(service, instance) {
            self.unsubscribe(client, service, instance, group.eventgroup(), 0);
        }

        if info.requesters_size() == 0 && !info.is_local() {
            debug!(service, instance, "last requester gone, clearing remote client state");
            if let Some(discovery) = self.discovery() {
                discovery.release_service(service, instance);
            }
            self.registry.clear_cached_payloads(service, instance);

            let this = self.clone();
            tokio::spawn(async move {
                if let Some(info) = this.registry.find_service(service, instance) {
                    for reliable in [true, false] {
                        if let Some(endpoint) = info.clear_endpoint(reliable) {
                            if endpoint.use_count() == 0 {
                                endpoint.stop().await;
                            }
                        }
                    }
                }
            });
        }
    }

    /// Subscribes a local client. Local providers decide asynchronously
    /// through their subscription handler; remote subscriptions go out
    /// through SD once the service is available.
    #[allow(clippy::too_many_arguments)]
    pub fn subscribe(
        self: &Arc<Self>,
        client: ClientId,
        sec_client: &SecClient,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        event: EventId,
    ) {
        if self.config.security_enabled
            && self
                .security
                .is_client_allowed_to_access_member(sec_client, service, instance, event)
                == PolicyDecision::Denied
        {
            warn!(client, service, instance, eventgroup, "security: subscribe denied");
            return;
        }

        match self.find_local_client(service, instance) {
            Some(provider) => {
                let pending = self.next_pending_id();
                {
                    let mut replies = self.pending_replies.lock().expect("pending reply lock");
                    replies.insert(
                        pending,
                        PendingReply {
                            subscriber: SubscriberRef::Local(client),
                            service,
                            instance,
                            eventgroup,
                            event,
                        },
                    );
                }
                self.ask_provider(provider, client, sec_client, service, instance, eventgroup, major, event, pending);
            }
            None => {
                self.registry.subscribe(
                    client,
                    service,
                    instance,
                    eventgroup,
                    major,
                    filter_event(event),
                );

                let available = self
                    .registry
                    .find_service(service, instance)
                    .map(|info| !info.is_local())
                    .unwrap_or(false);
                if available {
                    if let Some(discovery) = self.discovery() {
                        discovery.subscribe(service, instance, eventgroup, major, event);
                    }
                } else {
                    let mut pending = self
                        .pending_subscriptions
                        .lock()
                        .expect("pending subscription lock");
                    let entry = PendingSubscription {
                        client,
                        service,
                        instance,
                        eventgroup,
                        major,
                        event,
                    };
                    if !pending.contains(&entry) {
                        pending.push(entry);
                    }
                }
            }
        }
    }

    /// Forwards the subscription question to the providing application,
    /// or answers it through the host when the broker itself provides.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn ask_provider(
        self: &Arc<Self>,
        provider: ClientId,
        subscriber: ClientId,
        sec_client: &SecClient,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        event: EventId,
        pending: PendingId,
    ) {
        if let Some(handle) = self.endpoints.find_local(provider) {
            let forwarded = handle.send_command(&Command::Subscribe {
                client: subscriber,
                service,
                instance,
                eventgroup,
                major,
                event,
                pending,
            });
            if !forwarded {
                warn!(provider, service, instance, "provider unreachable, nacking subscription");
                self.on_subscription_reply(pending, false);
            }
        } else {
            // Hosted by the broker process itself.
            let this = self.arc();
            self.host.on_subscription(
                service,
                instance,
                eventgroup,
                subscriber,
                sec_client,
                true,
                Box::new(move |accepted| {
                    this.on_subscription_reply(pending, accepted);
                }),
            );
        }
    }

    /// Completion of a provider-side subscription decision.
    pub fn on_subscription_reply(self: &Arc<Self>, pending: PendingId, accepted: bool) {
        let Some(reply) = ({
            let mut replies = self.pending_replies.lock().expect("pending reply lock");
            replies.remove(&pending)
        }) else {
            debug!(pending, "subscription reply without pending entry");
            return;
        };

        match reply.subscriber {
            SubscriberRef::Local(client) => {
                if accepted {
                    self.registry.subscribe(
                        client,
                        reply.service,
                        reply.instance,
                        reply.eventgroup,
                        0,
                        filter_event(reply.event),
                    );
                    self.registry.set_subscription_state(
                        reply.service,
                        reply.instance,
                        reply.eventgroup,
                        client,
                        SubscriptionState::Acknowledged,
                    );
                    self.replay_cached_fields(client, reply.service, reply.instance, reply.eventgroup);
                } else {
                    self.registry.set_subscription_state(
                        reply.service,
                        reply.instance,
                        reply.eventgroup,
                        client,
                        SubscriptionState::Nacked,
                    );
                }

                self.notify_subscription_status(
                    client,
                    reply.service,
                    reply.instance,
                    reply.eventgroup,
                    reply.event,
                    accepted,
                );
            }
            SubscriberRef::Remote {
                subscription,
                counter,
                ttl,
                sender,
            } => {
                if accepted {
                    if let Some(group) = self.registry.find_eventgroup(
                        reply.service,
                        reply.instance,
                        reply.eventgroup,
                    ) {
                        let expires_at = if ttl >= crate::constants::TTL_INFINITE {
                            None
                        } else {
                            Some(
                                std::time::Instant::now()
                                    + std::time::Duration::from_secs(u64::from(ttl)),
                            )
                        };
                        group.update_remote_subscription(subscription, expires_at);
                    }
                }
                if let Some(discovery) = self.discovery() {
                    discovery.answer_subscription(
                        reply.service,
                        reply.instance,
                        reply.eventgroup,
                        counter,
                        ttl,
                        accepted,
                        sender,
                    );
                }
            }
        }
    }

    /// Removes the subscriber; the last local subscriber of a remote
    /// eventgroup triggers the SD stop-subscribe.
    pub fn unsubscribe(
        self: &Arc<Self>,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
    ) {
        let was_subscribed = self
            .registry
            .subscription_state(service, instance, eventgroup, client)
            != SubscriptionState::NotSubscribed;
        if !was_subscribed && event == 0 {
            // Release-path cleanup for clients that never subscribed.
            return;
        }

        let last = self.registry.unsubscribe(client, service, instance, eventgroup);

        if let Some(provider) = self.find_local_client(service, instance) {
            if let Some(handle) = self.endpoints.find_local(provider) {
                handle.send_command(&Command::Unsubscribe {
                    client,
                    service,
                    instance,
                    eventgroup,
                    event,
                });
            } else {
                let sec_client = SecClient {
                    client,
                    ..SecClient::default()
                };
                self.host.on_subscription(
                    service,
                    instance,
                    eventgroup,
                    client,
                    &sec_client,
                    false,
                    Box::new(|_| {}),
                );
            }
        }

        if last {
            for group_event in self
                .registry
                .find_eventgroup(service, instance, eventgroup)
                .map(|group| group.events())
                .unwrap_or_default()
            {
                if let Some(info) = self.registry.find_event(service, instance, group_event) {
                    info.clear_payload();
                }
            }

            let is_remote = self
                .registry
                .find_service(service, instance)
                .map(|info| !info.is_local())
                .unwrap_or(false);
            if is_remote {
                if let Some(discovery) = self.discovery() {
                    discovery.unsubscribe(service, instance, eventgroup);
                }
            }
        }

        {
            let mut pending = self
                .pending_subscriptions
                .lock()
                .expect("pending subscription lock");
            pending.retain(|entry| {
                !(entry.client == client
                    && entry.service == service
                    && entry.instance == instance
                    && entry.eventgroup == eventgroup)
            });
        }

        info!(client, service, instance, eventgroup, "unsubscribed");
    }

    /// Requests recorded before the service existed become requesters
    /// once the offer lands.
    pub(crate) fn adopt_pending_requests(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
    ) {
        let adopted: Vec<ClientId> = {
            let mut pending = self.pending_requests.lock().expect("pending request lock");
            let (matching, rest): (Vec<_>, Vec<_>) =
                pending.drain().partition(|(_, s, i, m, _)| {
                    *s == service
                        && *i == instance
                        && (*m == crate::constants::ANY_MAJOR || *m == major)
                });
            *pending = rest.into_iter().collect();
            matching.into_iter().map(|(client, ..)| client).collect()
        };
        if let Some(info) = self.registry.find_service(service, instance) {
            for client in adopted {
                info.add_client(client);
            }
        }
    }

    /// Subscriptions that waited for (service, instance) to be offered.
    pub(crate) fn replay_pending_subscriptions(
        self: &Arc<Self>,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
    ) {
        let matching: Vec<PendingSubscription> = {
            let mut pending = self
                .pending_subscriptions
                .lock()
                .expect("pending subscription lock");
            let (matching, rest): (Vec<_>, Vec<_>) = pending
                .drain(..)
                .partition(|entry| {
                    entry.service == service && entry.instance == instance && entry.major == major
                });
            *pending = rest;
            matching
        };

        for entry in matching {
            let sec_client = SecClient {
                client: entry.client,
                ..SecClient::default()
            };
            self.subscribe(
                entry.client,
                &sec_client,
                entry.service,
                entry.instance,
                entry.eventgroup,
                entry.major,
                entry.event,
            );
        }
    }

    /// Replays cached field values of an eventgroup to a new subscriber.
    pub(crate) fn replay_cached_fields(
        self: &Arc<Self>,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    ) {
        let Some(group) = self.registry.find_eventgroup(service, instance, eventgroup) else {
            return;
        };
        for event in group.events() {
            let Some(info) = self.registry.find_event(service, instance, event) else {
                continue;
            };
            if !info.is_field() {
                continue;
            }
            if let Some(payload) = info.cached_payload() {
                self.deliver_notification_to_local(client, service, instance, event, payload);
            }
        }
    }

    /// Push the current value of every provided field again; used after
    /// resume and by providers recovering state.
    pub fn resend_provided_events(self: &Arc<Self>, provider: ClientId) {
        for (service, instance, _, _, client) in self.offered_services() {
            if client != provider {
                continue;
            }
            for info in self.registry.events_of(service, instance) {
                if !info.is_provided() {
                    continue;
                }
                if let Some(payload) = info.cached_payload() {
                    for subscriber in info.subscribers() {
                        self.deliver_notification_to_local(
                            subscriber,
                            service,
                            instance,
                            info.event(),
                            payload.clone(),
                        );
                    }
                }
            }
        }
    }

    pub(crate) fn notify_subscription_status(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
        accepted: bool,
    ) {
        if let Some(handle) = self.endpoints.find_local(client) {
            handle.send_command(&Command::SubscriptionStatus {
                service,
                instance,
                eventgroup,
                event,
                accepted,
            });
        } else {
            self.host.on_subscription_status(
                service,
                instance,
                eventgroup,
                event,
                if accepted {
                    crate::host::SubscriptionStatus::Acknowledged
                } else {
                    crate::host::SubscriptionStatus::Nacked
                },
            );
        }
    }

    pub(crate) fn send_availability_to(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        available: bool,
    ) {
        if let Some(handle) = self.endpoints.find_local(client) {
            handle.send_command(&Command::Availability {
                service,
                instance,
                major,
                minor,
                available,
            });
        }
    }
}

/// `0` on the wire means "whole eventgroup".
fn filter_event(event: EventId) -> Option<EventId> {
    if event == 0 || event == crate::constants::ANY_METHOD {
        None
    } else {
        Some(event)
    }
}
