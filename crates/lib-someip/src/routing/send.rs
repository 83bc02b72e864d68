use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace, warn};

use crate::constants::{self, PROTOCOL_VERSION, ROUTING_CLIENT, SOMEIP_FULL_HEADER_SIZE};
use crate::e2e::CheckStatus;
use crate::endpoint::{Endpoint, EndpointDefinition, Receiver};
use crate::security::{PolicyDecision, SecClient};
use crate::transport::Command;
use crate::types::{
    is_sd_message, ClientId, EventId, InstanceId, MessageType, ReturnCode, ServiceId,
    SomeIpHeader, SomeIpMessage,
};
use crate::wire::{Readable, ReadBuffer};

use super::RoutingManager;

impl RoutingManager {
    /// The central demultiplexer for locally originated messages: routes
    /// by message type to a local application, the host, or the matching
    /// remote endpoint. Returns the admission result.
    pub fn send(
        self: &Arc<Self>,
        client: ClientId,
        data: Bytes,
        instance: InstanceId,
        reliable: bool,
        flush: bool,
        _sec_client: &SecClient,
        from_remote: bool,
    ) -> bool {
        let mut buf = ReadBuffer::new(&data);
        let header = match SomeIpHeader::read(&mut buf) {
            Ok(header) => header,
            Err(err) => {
                warn!(client, %err, "dropping malformed local send");
                self.count_dropped();
                return false;
            }
        };

        match header.message_type {
            MessageType::Request
            | MessageType::RequestNoReturn
            | MessageType::RequestTp
            | MessageType::RequestNoReturnTp => {
                self.route_request(&header, data, instance, reliable, flush, from_remote)
            }
            MessageType::Response | MessageType::Error | MessageType::ResponseTp
            | MessageType::ErrorTp => {
                self.route_response(&header, data, instance, reliable, flush)
            }
            MessageType::Notification | MessageType::NotificationTp => {
                self.route_notification(&header, data, instance, reliable, flush, from_remote)
            }
        }
    }

    fn route_request(
        self: &Arc<Self>,
        header: &SomeIpHeader,
        data: Bytes,
        instance: InstanceId,
        reliable: bool,
        flush: bool,
        from_remote: bool,
    ) -> bool {
        let service = header.service;

        if let Some(provider) = self.find_local_client(service, instance) {
            return self.deliver_to_client(provider, instance, data, reliable, flush);
        }

        if from_remote {
            debug!(service, instance, "request for unknown local service");
            self.count_dropped();
            return false;
        }

        // Outgoing request towards a remote provider.
        let Some(info) = self.registry.find_service(service, instance) else {
            debug!(service, instance, "request for unknown service");
            self.count_dropped();
            return false;
        };
        let Some(endpoint) = info.endpoint(reliable) else {
            debug!(service, instance, reliable, "no endpoint towards remote service");
            self.count_dropped();
            return false;
        };

        let data = self.apply_protection(header, data, instance);
        let admitted = endpoint.send(data);
        if admitted {
            self.count_sent();
            if flush {
                endpoint.flush();
            }
        } else {
            self.count_dropped();
        }
        admitted
    }

    fn route_response(
        self: &Arc<Self>,
        header: &SomeIpHeader,
        data: Bytes,
        instance: InstanceId,
        reliable: bool,
        flush: bool,
    ) -> bool {
        let target = header.client;

        if self.endpoints.find_local(target).is_some() || target == ROUTING_CLIENT {
            return self.deliver_to_client(target, instance, data, reliable, flush);
        }

        // Response to a remote requester; route over the server endpoint
        // the request arrived on.
        let remote = {
            let clients = self.remote_clients.lock().expect("remote client lock");
            clients.get(&target).copied()
        };
        let Some((address, reliable)) = remote else {
            debug!(target, "dropping response for unknown client");
            self.count_dropped();
            return false;
        };

        let Some(server) = self
            .config
            .service(header.service, instance)
            .and_then(|cfg| {
                if reliable {
                    cfg.reliable_port
                } else {
                    cfg.unreliable_port
                }
            })
            .and_then(|port| self.endpoints.find_server(port, reliable))
        else {
            debug!(target, "no server endpoint for response");
            self.count_dropped();
            return false;
        };

        let data = self.apply_protection(header, data, instance);
        let admitted = server
            .as_endpoint()
            .send_to(&EndpointDefinition::new(address, reliable), data);
        if admitted {
            self.count_sent();
        } else {
            self.count_dropped();
        }
        admitted
    }

    fn route_notification(
        self: &Arc<Self>,
        header: &SomeIpHeader,
        data: Bytes,
        instance: InstanceId,
        reliable: bool,
        flush: bool,
        from_remote: bool,
    ) -> bool {
        let service = header.service;
        let event = header.method;
        let payload = data.slice(SOMEIP_FULL_HEADER_SIZE.min(data.len())..);

        let Some(local_subscribers) = self
            .registry
            .update_and_get_filtered_subscribers(service, instance, event, &payload)
        else {
            trace!(service, instance, event, "notification suppressed by filter");
            return true;
        };

        for subscriber in local_subscribers {
            self.deliver_to_client(subscriber, instance, data.clone(), reliable, flush);
        }

        if from_remote {
            return true;
        }

        // Fan out to remote subscribers of every eventgroup the event
        // belongs to.
        let protected = self.apply_protection(header, data, instance);
        let Some(event_info) = self.registry.find_event(service, instance, event) else {
            return true;
        };

        let mut sent_multicast = false;
        for eventgroup in event_info.eventgroups() {
            let Some(group) = self.registry.find_eventgroup(service, instance, eventgroup) else {
                continue;
            };

            if let Some((address, port)) = group.multicast() {
                if group.has_remote_subscriptions() && !sent_multicast {
                    self.send_to_remote_target(
                        service,
                        instance,
                        SocketAddr::new(address, port),
                        false,
                        protected.clone(),
                    );
                    sent_multicast = true;
                }
                continue;
            }

            for subscription in group.remote_subscriptions() {
                let target = if reliable {
                    subscription.reliable.or(subscription.unreliable)
                } else {
                    subscription.unreliable.or(subscription.reliable)
                };
                if let Some(definition) = target {
                    self.send_to_remote_target(
                        service,
                        instance,
                        definition.address,
                        definition.reliable,
                        protected.clone(),
                    );
                }
            }
        }

        true
    }

    fn send_to_remote_target(
        &self,
        service: ServiceId,
        instance: InstanceId,
        address: SocketAddr,
        reliable: bool,
        data: Bytes,
    ) {
        let server = self
            .config
            .service(service, instance)
            .and_then(|cfg| {
                if reliable {
                    cfg.reliable_port
                } else {
                    cfg.unreliable_port
                }
            })
            .and_then(|port| self.endpoints.find_server(port, reliable));

        match server {
            Some(server) => {
                if server
                    .as_endpoint()
                    .send_to(&EndpointDefinition::new(address, reliable), data)
                {
                    self.count_sent();
                } else {
                    self.count_dropped();
                }
            }
            None => {
                debug!(service, instance, %address, "no server endpoint for notification");
                self.count_dropped();
            }
        }
    }

    /// Applies E2E protection and SecOC authentication when the method
    /// is configured for either.
    pub(crate) fn apply_protection(
        &self,
        header: &SomeIpHeader,
        data: Bytes,
        instance: InstanceId,
    ) -> Bytes {
        let key = (header.service, header.method);
        let mut data = data;

        if self.config.e2e_enabled && self.e2e.is_protected(&key) {
            let mut buffer = BytesMut::from(&data[..]);
            self.e2e.protect(&key, &mut buffer[..], instance);
            data = buffer.freeze();
        }

        if let Some(secoc) = self.secoc() {
            if secoc.is_secured(header.service, instance, header.method) {
                let context = secoc.create_context(header.service, instance, header.method);
                data = secoc.authenticate(data, &context);
            }
        }

        data
    }

    /// Hands a wire message to a local application or to the host.
    pub(crate) fn deliver_to_client(
        &self,
        client: ClientId,
        instance: InstanceId,
        data: Bytes,
        reliable: bool,
        flush: bool,
    ) -> bool {
        if let Some(handle) = self.endpoints.find_local(client) {
            let admitted = handle.send_command(&Command::Send {
                instance,
                reliable,
                flush,
                payload: data,
            });
            if admitted {
                self.count_sent();
            } else {
                warn!(client, "local delivery rejected, queue full or client gone");
                self.count_dropped();
            }
            return admitted;
        }

        if client == ROUTING_CLIENT {
            let mut buf = ReadBuffer::new(&data);
            if let Ok(message) = SomeIpMessage::read(&mut buf) {
                self.host.on_message(instance, message);
                self.count_sent();
                return true;
            }
            return false;
        }

        debug!(client, "no local endpoint for delivery");
        self.count_dropped();
        false
    }

    /// Selective notification: delivers the current or given payload of
    /// an event to exactly one subscriber.
    pub fn notify_one(
        &self,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: Bytes,
        client: ClientId,
    ) -> bool {
        let Some(info) = self.registry.find_event(service, instance, event) else {
            debug!(service, instance, event, "notify_one for unknown event");
            return false;
        };
        if !info.subscribers().contains(&client) {
            debug!(service, instance, event, client, "notify_one for non-subscriber");
            return false;
        }
        self.deliver_notification_to_local(client, service, instance, event, payload);
        true
    }

    /// Builds and delivers a notification message to one local
    /// subscriber; used for field replay and selective notifies.
    pub(crate) fn deliver_notification_to_local(
        &self,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        event: EventId,
        payload: Bytes,
    ) {
        let mut header = SomeIpHeader::new(service, event);
        header.message_type = MessageType::Notification;
        let message = SomeIpMessage::new(header, payload);
        self.deliver_to_client(client, instance, message.to_bytes(), false, true);
    }

    /// Network ingress: decode, resolve the instance, validate, check
    /// policies and integrity, then deliver.
    pub(crate) fn on_network_message(
        &self,
        data: Bytes,
        receiver: Receiver,
        remote: SocketAddr,
        is_multicast: bool,
    ) {
        self.count_received();

        if data.len() < SOMEIP_FULL_HEADER_SIZE {
            self.count_dropped();
            return;
        }
        if crate::types::is_magic_cookie(&data) {
            return;
        }

        let mut buf = ReadBuffer::new(&data);
        let header = match SomeIpHeader::read(&mut buf) {
            Ok(header) => header,
            Err(err) => {
                warn!(%remote, %err, "dropping undecodable message");
                self.count_dropped();
                return;
            }
        };

        if is_sd_message(&header) {
            if let Some(discovery) = self.discovery() {
                discovery.on_message(data, remote, is_multicast);
            }
            return;
        }

        // Full-length validation: the wire promises length + 8 bytes.
        if data.len() != header.length as usize + constants::SOMEIP_HEADER_SIZE {
            self.reject(&header, ReturnCode::MalformedMessage, receiver, remote);
            return;
        }

        let instance = self
            .endpoints
            .find_instance(header.service, receiver.local_port, receiver.reliable)
            .or_else(|| {
                if is_multicast {
                    self.find_multicast_instance(header.service)
                } else {
                    None
                }
            })
            .or_else(|| {
                // Remote notifications and responses address instances
                // resolved when the remote service was learned via SD.
                self.registry
                    .find_instances(header.service)
                    .into_iter()
                    .find(|info| !info.is_local())
                    .map(|info| info.instance())
            });

        let Some(instance) = instance else {
            debug!(service = header.service, %remote, "unknown instance on receive");
            self.reject(&header, ReturnCode::UnknownService, receiver, remote);
            return;
        };

        if header.message_type.expects_reply() && header.protocol_version != PROTOCOL_VERSION {
            self.reject(&header, ReturnCode::WrongProtocolVersion, receiver, remote);
            return;
        }

        if let Some(info) = self.registry.find_service(header.service, instance) {
            if header.message_type.expects_reply()
                && header.interface_version != constants::ANY_MAJOR
                && header.interface_version != info.major()
            {
                self.reject(&header, ReturnCode::WrongInterfaceVersion, receiver, remote);
                return;
            }
        }

        if header.message_type.expects_reply() && header.return_code != ReturnCode::Ok {
            self.reject(&header, ReturnCode::MalformedMessage, receiver, remote);
            return;
        }

        if self.config.security_enabled {
            let sec_client = SecClient::default();
            if self.security.is_client_allowed_to_access_member(
                &sec_client,
                header.service,
                instance,
                header.method,
            ) == PolicyDecision::Denied
            {
                warn!(service = header.service, method = header.method, %remote, "security: remote access denied");
                self.count_dropped();
                return;
            }
        }

        let data = if let Some(secoc) = self.secoc() {
            if secoc.is_secured(header.service, instance, header.method) {
                let context = secoc.create_context(header.service, instance, header.method);
                match secoc.verify(data, &context) {
                    Ok(plaintext) => plaintext,
                    Err(err) => {
                        warn!(%err, "SecOC verification failed");
                        self.count_integrity_failure();
                        self.count_dropped();
                        return;
                    }
                }
            } else {
                data
            }
        } else {
            data
        };

        if self.config.e2e_enabled {
            let key = (header.service, header.method);
            if self.e2e.is_protected(&key)
                && self.e2e.check(&key, &data, instance) == CheckStatus::Error
            {
                warn!(service = header.service, method = header.method, "E2E check failed");
                self.count_integrity_failure();
                self.count_dropped();
                return;
            }
        }

        match header.message_type {
            MessageType::Request | MessageType::RequestNoReturn | MessageType::RequestTp
            | MessageType::RequestNoReturnTp => {
                {
                    let mut clients = self.remote_clients.lock().expect("remote client lock");
                    clients.insert(header.client, (remote, receiver.reliable));
                }
                match self.find_local_client(header.service, instance) {
                    Some(provider) => {
                        self.deliver_to_client(provider, instance, data, receiver.reliable, true);
                    }
                    None => {
                        self.reject(&header, ReturnCode::UnknownService, receiver, remote);
                    }
                }
            }
            MessageType::Response | MessageType::Error | MessageType::ResponseTp
            | MessageType::ErrorTp => {
                self.deliver_to_client(header.client, instance, data, receiver.reliable, true);
            }
            MessageType::Notification | MessageType::NotificationTp => {
                let payload = data.slice(SOMEIP_FULL_HEADER_SIZE..);
                if let Some(subscribers) = self.registry.update_and_get_filtered_subscribers(
                    header.service,
                    instance,
                    header.method,
                    &payload,
                ) {
                    for subscriber in subscribers {
                        self.deliver_to_client(
                            subscriber,
                            instance,
                            data.clone(),
                            receiver.reliable,
                            true,
                        );
                    }
                }
            }
        }
    }

    fn find_multicast_instance(&self, service: ServiceId) -> Option<InstanceId> {
        // A multicast datagram carries no destination group here; any
        // instance of the service with a registered membership matches.
        self.registry
            .find_instances(service)
            .into_iter()
            .map(|info| info.instance())
            .next()
    }

    /// Error replies go out for failed requests only; everything else is
    /// dropped quietly.
    fn reject(
        &self,
        header: &SomeIpHeader,
        return_code: ReturnCode,
        receiver: Receiver,
        remote: SocketAddr,
    ) {
        self.count_dropped();
        if !header.message_type.expects_reply() {
            return;
        }

        let reply = SomeIpMessage::error_reply(header, return_code);
        if let Some(server) = self.endpoints.find_server(receiver.local_port, receiver.reliable) {
            server.as_endpoint().send_to(
                &EndpointDefinition::new(remote, receiver.reliable),
                reply.to_bytes(),
            );
            debug!(service = header.service, %return_code, %remote, "sent error reply");
        }
    }
}
