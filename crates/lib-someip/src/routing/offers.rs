use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{error, info, warn};

use crate::constants::ILLEGAL_PORT;
use crate::endpoint::{Endpoint, ServerEndpoint};
use crate::security::{PolicyDecision, SecClient};
use crate::transport::Command;
use crate::types::{ClientId, InstanceId, MajorVersion, MinorVersion, ServiceId};

use super::{
    Availability, OfferCommand, OfferKind, PendingOffer, RoutingManager,
};

impl RoutingManager {
    /// Claims (service, instance) for a local client. Serialized against
    /// concurrent offer/stop-offer commands for the same pair through the
    /// offer command queue.
    pub async fn offer_service(
        self: &Arc<Self>,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        must_queue: bool,
    ) -> bool {
        if must_queue {
            let must_process = {
                let mut commands = self.offer_commands.lock().expect("offer command lock");
                commands.insert(
                    service,
                    instance,
                    OfferCommand {
                        kind: OfferKind::Offer,
                        client,
                        major,
                        minor,
                    },
                )
            };
            if !must_process {
                info!(
                    client,
                    service, instance, "offer queued behind an in-flight command"
                );
                return false;
            }
        }

        if self.config.security_enabled {
            let sec_client = SecClient {
                client,
                ..SecClient::default()
            };
            if self
                .security
                .is_client_allowed_to_offer(&sec_client, service, instance)
                == PolicyDecision::Denied
            {
                warn!(
                    client,
                    service, instance, "security: client is not allowed to offer, skipping"
                );
                self.erase_offer_command_and_continue(service, instance);
                return false;
            }
        }

        if !self.handle_local_offer_service(client, service, instance, major, minor) {
            self.erase_offer_command_and_continue(service, instance);
            return false;
        }

        let network_up = {
            let mut pending = self.pending_sd_offers.lock().expect("pending sd offer lock");
            if self.if_state_running.load(Ordering::SeqCst) {
                true
            } else {
                pending.push((service, instance));
                false
            }
        };
        if network_up {
            self.init_service_endpoints(service, instance).await;
        }

        if let Some(discovery) = self.discovery() {
            discovery.offer_service(service, instance);
        }

        self.adopt_pending_requests(service, instance, major);
        self.replay_pending_subscriptions(service, instance, major);
        self.notify_availability(service, instance, Availability::Available, major, minor);
        self.erase_offer_command_and_continue(service, instance);

        info!(client, service, instance, major, minor, "OFFER");
        true
    }

    /// Checks a local offer against already-known offers: rejects the
    /// duplicate of a live owner (after a ping probe), version conflicts
    /// and remotely offered instances.
    fn handle_local_offer_service(
        self: &Arc<Self>,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) -> bool {
        let mut local = self.local_services.lock().expect("local services lock");

        if let Some((stored_major, stored_minor, stored_client)) = local
            .get(&service)
            .and_then(|instances| instances.get(&instance))
            .copied()
        {
            if stored_major == major && stored_minor == minor && stored_client == client {
                warn!(
                    client,
                    service, instance, "instance offered previously by the same application"
                );
                return false;
            }

            if stored_major == major && stored_minor == minor {
                // Another client claims the instance; probe the current
                // owner before deciding.
                let mut pending = self.pending_offers.lock().expect("pending offer lock");
                if let Some(existing) = pending.get(service, instance) {
                    if existing.claimant == client {
                        info!(client, service, instance, "owner already pinged");
                    } else {
                        error!(
                            client,
                            service,
                            instance,
                            pending_claimant = existing.claimant,
                            "rejecting offer, another claim is already pending"
                        );
                    }
                    return false;
                }

                match self.endpoints.find_local(stored_client) {
                    Some(owner) => {
                        if owner.send_command(&Command::Ping) {
                            pending.insert(
                                service,
                                instance,
                                PendingOffer {
                                    major,
                                    minor,
                                    claimant: client,
                                    pinged: stored_client,
                                    deadline: Instant::now()
                                        + self.config.sd.request_response_delay,
                                },
                            );
                            warn!(
                                client,
                                service,
                                instance,
                                owner = stored_client,
                                "offer is now pending, waiting for pong"
                            );
                        }
                    }
                    None => {
                        error!(
                            client,
                            service,
                            instance,
                            owner = stored_client,
                            "rejecting offer, instance offered previously and owner has no endpoint"
                        );
                    }
                }
                return false;
            }

            error!(
                client,
                service,
                instance,
                owner = stored_client,
                stored_major,
                stored_minor,
                "rejecting offer, instance offered previously with different version"
            );
            return false;
        }

        // An instance known as remote must not be claimed locally.
        let info = self.registry.create_service(
            service,
            instance,
            major,
            minor,
            crate::constants::TTL_INFINITE,
            true,
        );
        if info.is_none() {
            error!(
                client,
                service, instance, "rejecting offer, instance already offered remotely"
            );
            return false;
        }

        local
            .entry(service)
            .or_default()
            .insert(instance, (major, minor, client));
        true
    }

    /// A pong from `client` proves it alive; claims against it lose.
    pub fn on_pong(&self, client: ClientId) {
        let rejected = {
            let mut pending = self.pending_offers.lock().expect("pending offer lock");
            pending.reject_claims_against(client)
        };
        for ((service, instance), offer) in rejected {
            warn!(
                claimant = offer.claimant,
                service, instance, owner = client, "offer rejected, offered previously and owner is still alive"
            );
        }
    }

    /// Periodic sweep over ping probes whose deadline passed. A silent
    /// owner fails the probe; the pending claim is rejected (its death is
    /// handled separately through the connection loss path).
    pub(crate) fn expire_offer_probes(&self) {
        let expired = {
            let mut pending = self.pending_offers.lock().expect("pending offer lock");
            pending.expired(Instant::now())
        };
        for ((service, instance), offer) in expired {
            warn!(
                claimant = offer.claimant,
                owner = offer.pinged,
                service,
                instance,
                "ping probe timed out, rejecting pending offer"
            );
        }
    }

    /// Withdraws a local offer. Availability and the SD stop-offer are
    /// emitted right away; endpoint teardown runs behind prepare-stop
    /// fences and only then the command queue advances.
    pub async fn stop_offer_service(
        self: &Arc<Self>,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
        must_queue: bool,
    ) {
        info!(client, service, instance, major, minor, "STOP OFFER");

        if must_queue {
            let must_process = {
                let mut commands = self.offer_commands.lock().expect("offer command lock");
                commands.insert(
                    service,
                    instance,
                    OfferCommand {
                        kind: OfferKind::StopOffer,
                        client,
                        major,
                        minor,
                    },
                )
            };
            if !must_process {
                info!(
                    client,
                    service, instance, "stop-offer queued behind an in-flight command"
                );
                return;
            }
        }

        let is_local = self
            .registry
            .find_service(service, instance)
            .map(|info| info.is_local())
            .unwrap_or(false);
        if !is_local {
            self.erase_offer_command_and_continue(service, instance);
            return;
        }

        {
            let mut pending = self.pending_sd_offers.lock().expect("pending sd offer lock");
            pending.retain(|entry| *entry != (service, instance));
        }

        // Availability goes out before the teardown races the registry.
        self.notify_availability(service, instance, Availability::Unavailable, major, minor);
        self.on_stop_offer_service(client, service, instance, major, minor);
    }

    /// Removes the local bookkeeping and arms the prepare-stop fences.
    /// The offer command queue advances once all existing endpoints have
    /// completed their prepare-stop.
    fn on_stop_offer_service(
        self: &Arc<Self>,
        client: ClientId,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) {
        {
            let mut local = self.local_services.lock().expect("local services lock");
            if let Some(instances) = local.get_mut(&service) {
                if let Some((stored_major, stored_minor, stored_client)) =
                    instances.get(&instance).copied()
                {
                    if stored_major != major || stored_minor != minor || stored_client != client {
                        warn!(
                            client,
                            service,
                            instance,
                            stored_client,
                            "stop-offer does not match the stored offer exactly"
                        );
                    }
                    if stored_client == client {
                        instances.remove(&instance);
                        if instances.is_empty() {
                            local.remove(&service);
                        }
                    }
                }
            }
        }

        let Some(info) = self.registry.find_service(service, instance) else {
            self.erase_offer_command_and_continue(service, instance);
            return;
        };

        let fences: Vec<(bool, Arc<dyn crate::endpoint::Endpoint>)> = [true, false]
            .into_iter()
            .filter_map(|reliable| info.endpoint(reliable).map(|ep| (reliable, ep)))
            .collect();

        if fences.is_empty() {
            self.finish_stop_offer(service, instance, major, minor);
            return;
        }

        let remaining = Arc::new(AtomicUsize::new(fences.len()));
        let completion: Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>> = {
            let this = self.clone();
            Arc::new(Mutex::new(Some(Box::new(move || {
                this.finish_stop_offer(service, instance, major, minor);
            }) as Box<dyn FnOnce() + Send>)))
        };

        for (_, endpoint) in fences {
            let remaining = remaining.clone();
            let completion = completion.clone();
            endpoint.prepare_stop(
                Box::new(move || {
                    if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                        if let Some(done) = completion.lock().expect("fence lock").take() {
                            done();
                        }
                    }
                }),
                service,
            );
        }
    }

    /// Final stage of a stop-offer, entered once the fences completed:
    /// SD stop-offer, registry teardown and endpoint release.
    fn finish_stop_offer(
        self: &Arc<Self>,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) {
        if let Some(discovery) = self.discovery() {
            discovery.stop_offer_service(service, instance, major, minor);
        }

        let this = self.clone();
        tokio::spawn(async move {
            if let Some(info) = this.registry.find_service(service, instance) {
                for reliable in [true, false] {
                    if let Some(endpoint) = info.clear_endpoint(reliable) {
                        let port = endpoint.local_port();
                        if port != ILLEGAL_PORT
                            && this.endpoints.remove_instance(service, port, reliable)
                        {
                            if let Some(server) = this.endpoints.remove_server(port, reliable) {
                                server.as_endpoint().stop().await;
                            }
                        }
                    }
                }
            }

            for group in this.registry.eventgroups_of(service, instance) {
                group.clear_remote_subscriptions();
            }
            this.registry.clear_cached_payloads(service, instance);
            this.registry.remove_service(service, instance);

            this.erase_offer_command_and_continue(service, instance);
            info!(service, instance, major, minor, "stop-offer complete");
        });
    }

    /// Pops the processed command and schedules the next queued one.
    pub(crate) fn erase_offer_command_and_continue(
        self: &Arc<Self>,
        service: ServiceId,
        instance: InstanceId,
    ) {
        let next = {
            let mut commands = self.offer_commands.lock().expect("offer command lock");
            commands.erase(service, instance)
        };
        if let Some(command) = next {
            let this = self.clone();
            tokio::spawn(async move {
                match command.kind {
                    OfferKind::Offer => {
                        this.offer_service(
                            command.client,
                            service,
                            instance,
                            command.major,
                            command.minor,
                            false,
                        )
                        .await;
                    }
                    OfferKind::StopOffer => {
                        this.stop_offer_service(
                            command.client,
                            service,
                            instance,
                            command.major,
                            command.minor,
                            false,
                        )
                        .await;
                    }
                }
            });
        }
    }

    /// Creates the server endpoints of a freshly offered service, or a
    /// virtual endpoint when no ports are configured.
    pub(crate) async fn init_service_endpoints(
        self: &Arc<Self>,
        service: ServiceId,
        instance: InstanceId,
    ) {
        let Some(info) = self.registry.find_service(service, instance) else {
            return;
        };
        let service_config = self.config.service(service, instance).cloned();

        let reliable_port = service_config.as_ref().and_then(|cfg| cfg.reliable_port);
        let unreliable_port = service_config.as_ref().and_then(|cfg| cfg.unreliable_port);

        for (reliable, port) in [(true, reliable_port), (false, unreliable_port)] {
            if let Some(port) = port {
                match self.endpoints.find_or_create_server(port, reliable).await {
                    Ok(endpoint) => {
                        info.set_endpoint(endpoint.as_endpoint(), reliable);
                        self.endpoints.set_instance(service, port, reliable, instance);
                    }
                    Err(err) => {
                        error!(service, instance, port, reliable, %err, "server endpoint init failed");
                    }
                }
            }
        }

        if reliable_port.is_none() && unreliable_port.is_none() {
            // No network access configured; a virtual endpoint keeps the
            // bookkeeping uniform while the service stays local-only.
            if let Ok(endpoint) = self
                .endpoints
                .find_or_create_server(ILLEGAL_PORT, false)
                .await
            {
                if let ServerEndpoint::Virtual(_) = &endpoint {
                    info.set_endpoint(endpoint.as_endpoint(), false);
                }
            }
        }

        if let Some((address, port)) = service_config.as_ref().and_then(|cfg| cfg.multicast) {
            if let Some(udp_port) = unreliable_port {
                for group in self.registry.eventgroups_of(service, instance) {
                    group.set_multicast(address, port);
                }
                if let Err(err) = self
                    .endpoints
                    .register_multicast(service, instance, udp_port, address)
                    .await
                {
                    error!(service, instance, %address, %err, "multicast registration failed");
                }
            }
        }
    }

    /// Offers queued while the network was down are initialized when it
    /// comes up.
    pub(crate) async fn flush_pending_sd_offers(self: &Arc<Self>) {
        let pending: Vec<(ServiceId, InstanceId)> = {
            let mut queue = self.pending_sd_offers.lock().expect("pending sd offer lock");
            queue.drain(..).collect()
        };
        for (service, instance) in pending {
            self.init_service_endpoints(service, instance).await;
            if let Some(discovery) = self.discovery() {
                discovery.offer_service(service, instance);
            }
        }
    }
}
