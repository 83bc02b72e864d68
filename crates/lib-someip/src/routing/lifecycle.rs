use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::endpoint::EndpointError;
use crate::sd::ServiceDiscovery;
use crate::transport::{Command, TransportError};
use crate::types::ClientId;

use super::{RoutingManager, RoutingState};

#[derive(Debug, Error)]
pub enum RoutingError {
    #[error("Local transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Endpoint error: {0}")]
    Endpoint(#[from] EndpointError),

    #[error("Service discovery initialization failed: {0}")]
    DiscoveryInit(String),
}

impl RoutingManager {
    /// Brings the broker up: local transport, service discovery and the
    /// periodic maintenance tasks. A failing SD initialization is fatal
    /// when SD is enabled.
    pub async fn start(self: &Arc<Self>) -> Result<(), RoutingError> {
        self.endpoints.set_sink(self.arc());
        self.transport.set_handler(self.arc());
        self.transport.start().await?;

        if self.config.sd.enabled {
            let discovery = ServiceDiscovery::new(&self.config, Arc::downgrade(&self.arc()));
            discovery
                .start()
                .await
                .map_err(|err| RoutingError::DiscoveryInit(err.to_string()))?;
            self.set_discovery(discovery);
        }

        self.if_state_running.store(true, Ordering::SeqCst);
        self.flush_pending_sd_offers().await;
        self.spawn_background_tasks();

        self.host.on_state(RoutingState::Running);
        info!(
            network = %self.config.network,
            unicast = %self.config.unicast,
            sd = self.config.sd.enabled,
            "routing manager started"
        );
        Ok(())
    }

    pub async fn shutdown(self: &Arc<Self>) {
        if let Some(discovery) = self.discovery() {
            discovery.stop();
        }
        self.transport.stop();
        self.endpoints.stop_all().await;
        self.id_pool.release_all();
        info!("routing manager stopped");
    }

    /// External routing-state command. Suspension withdraws every local
    /// offer and marks all remote services offline; resuming runs a
    /// fresh announce cycle for everything still offered.
    pub async fn set_routing_state(self: &Arc<Self>, state: RoutingState) {
        {
            let mut current = self.routing_state.lock().expect("routing state lock");
            if *current == state {
                debug!(%state, "routing state unchanged");
                return;
            }
            *current = state;
        }
        info!(%state, "routing state changed");

        match state {
            RoutingState::Suspended => {
                if let Some(discovery) = self.discovery() {
                    // Stop-offer burst for everything we announce, then
                    // silence the SD engine.
                    for (service, instance, major, minor, _) in self.offered_services() {
                        discovery.stop_offer_service(service, instance, major, minor);
                        let mut commands = self.offer_commands.lock().expect("offer command lock");
                        commands.clear(service, instance);
                    }
                    discovery.set_network_up(false);
                }

                for info in self.registry.local_services() {
                    for group in self
                        .registry
                        .eventgroups_of(info.service(), info.instance())
                    {
                        group.clear_remote_subscriptions();
                    }
                }

                for info in self.registry.remote_services() {
                    self.registry
                        .clear_cached_payloads(info.service(), info.instance());
                    self.del_routing_info(info.service(), info.instance());
                }
            }
            RoutingState::Resumed => {
                for info in self.registry.local_services() {
                    info.set_ttl(self.config.sd.ttl);
                    info.set_in_mainphase(false);
                }
                if let Some(discovery) = self.discovery() {
                    discovery.set_network_up(true);
                    for (service, instance, _, _, _) in self.offered_services() {
                        discovery.offer_service(service, instance);
                    }
                }
            }
            RoutingState::Diagnosis | RoutingState::Running => {}
        }

        self.host.on_state(state);
    }

    /// Loss of a local application: all its offers, requests and
    /// subscriptions disappear; claims it was being probed for are
    /// promoted.
    pub fn handle_client_error(self: &Arc<Self>, client: ClientId) {
        info!(client, "cleaning up after client");

        self.endpoints.remove_local(client);
        self.id_pool.release(client);

        // Its offers. Claims the dead client was probed for must run
        // after the stop-offer, so both are inserted into the offer
        // command queue here, in order, and only the head is spawned.
        let promoted = {
            let mut pending = self.pending_offers.lock().expect("pending offer lock");
            pending.promote_claims_against(client)
        };

        let owned: Vec<(u16, u16, u8, u32)> = self
            .offered_services()
            .into_iter()
            .filter(|(_, _, _, _, offering)| *offering == client)
            .map(|(service, instance, major, minor, _)| (service, instance, major, minor))
            .collect();
        for (service, instance, major, minor) in owned {
            let must_process = {
                let mut commands = self.offer_commands.lock().expect("offer command lock");
                commands.insert(
                    service,
                    instance,
                    super::OfferCommand {
                        kind: super::OfferKind::StopOffer,
                        client,
                        major,
                        minor,
                    },
                )
            };
            if must_process {
                let this = self.clone();
                tokio::spawn(async move {
                    this.stop_offer_service(client, service, instance, major, minor, false)
                        .await;
                });
            }
        }

        for ((service, instance), offer) in promoted {
            warn!(
                claimant = offer.claimant,
                service, instance, dead = client, "pending offer promoted, previous owner is dead"
            );
            let must_process = {
                let mut commands = self.offer_commands.lock().expect("offer command lock");
                commands.insert(
                    service,
                    instance,
                    super::OfferCommand {
                        kind: super::OfferKind::Offer,
                        client: offer.claimant,
                        major: offer.major,
                        minor: offer.minor,
                    },
                )
            };
            if must_process {
                let this = self.clone();
                tokio::spawn(async move {
                    this.offer_service(
                        offer.claimant,
                        service,
                        instance,
                        offer.major,
                        offer.minor,
                        false,
                    )
                    .await;
                });
            }
        }

        // Its requests and subscriptions.
        {
            let mut pending = self.pending_requests.lock().expect("pending request lock");
            pending.retain(|(c, ..)| *c != client);
        }
        for info in self.registry.services() {
            if info.has_client(client) {
                self.release_service(client, info.service(), info.instance());
            }
        }
        {
            let mut pending = self
                .pending_subscriptions
                .lock()
                .expect("pending subscription lock");
            pending.retain(|entry| entry.client != client);
        }

        // Claims made by the dead client are void.
        {
            let mut pending = self.pending_offers.lock().expect("pending offer lock");
            pending.drop_claims_by(client);
        }
    }

    /// Interface state transitions from the platform: offers queued
    /// while the network was down go out when it comes up.
    pub async fn on_net_state_changed(self: &Arc<Self>, up: bool) {
        let previous = self.if_state_running.swap(up, Ordering::SeqCst);
        if previous == up {
            return;
        }
        info!(up, "network interface state changed");

        if let Some(discovery) = self.discovery() {
            discovery.set_network_up(up);
        }
        if up {
            self.flush_pending_sd_offers().await;
        }
    }

    fn spawn_background_tasks(self: &Arc<Self>) {
        // Probe expiry and liveness pings.
        {
            let this = self.clone();
            tokio::spawn(async move {
                let mut ticks: u64 = 0;
                let mut timer = tokio::time::interval(Duration::from_secs(1));
                loop {
                    timer.tick().await;
                    this.expire_offer_probes();
                    ticks += 1;
                    if ticks % 5 == 0 {
                        for client in this.endpoints.local_clients() {
                            if let Some(handle) = this.endpoints.find_local(client) {
                                handle.send_command(&Command::Ping);
                            }
                        }
                    }
                }
            });
        }

        if let Some(interval) = self.config.logging.status_interval {
            let this = self.clone();
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);
                loop {
                    timer.tick().await;
                    let queues = this.endpoints.queue_statistics();
                    let queued: usize = queues.iter().map(|(_, len)| len).sum();
                    info!(
                        state = %this.routing_state(),
                        clients = this.endpoints.local_clients().len(),
                        offered = this.offered_services().len(),
                        known = this.registry.services().len(),
                        queued,
                        "status"
                    );
                }
            });
        }

        if let Some(interval) = self.config.logging.statistics_interval {
            let this = self.clone();
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);
                loop {
                    timer.tick().await;
                    let stats = this.statistics();
                    info!(
                        received = stats.received,
                        sent = stats.sent,
                        dropped = stats.dropped,
                        integrity_failures = stats.integrity_failures,
                        "statistics"
                    );
                }
            });
        }

        if let Some(interval) = self.config.logging.memory_interval {
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);
                let page_size = 4096u64;
                loop {
                    timer.tick().await;
                    if let Ok(statm) = tokio::fs::read_to_string("/proc/self/statm").await {
                        let mut fields = statm.split_whitespace();
                        let virtual_pages: u64 =
                            fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                        let resident_pages: u64 =
                            fields.next().and_then(|v| v.parse().ok()).unwrap_or(0);
                        info!(
                            virtual_kb = virtual_pages * page_size / 1024,
                            resident_kb = resident_pages * page_size / 1024,
                            "memory"
                        );
                    }
                }
            });
        }

        if let Some(interval) = self.config.logging.version_interval {
            tokio::spawn(async move {
                let mut timer = tokio::time::interval(interval);
                loop {
                    timer.tick().await;
                    info!(version = env!("CARGO_PKG_VERSION"), "someip routing");
                }
            });
        }
    }
}
