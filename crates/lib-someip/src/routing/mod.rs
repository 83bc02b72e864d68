use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tracing::{debug, info};

use crate::config::Config;
use crate::e2e::E2eProvider;
use crate::endpoint::{EndpointManager, MessageSink, Receiver};
use crate::host::Host;
use crate::registry::ServiceRegistry;
use crate::sd::ServiceDiscovery;
use crate::security::{SecClient, SecurityPolicy};
use crate::transport::{
    ClientIdPool, Command, LocalClientHandle, LocalTransportServer, PendingId, TransportError,
    TransportHandler,
};
use crate::types::{ClientId, InstanceId, MajorVersion, MinorVersion, ServiceId, ServiceInstance};

mod lifecycle;
mod offers;
mod pending;
mod remote;
mod send;
mod services;
mod state;

pub use lifecycle::*;
pub use pending::*;
pub use state::*;

/// Message counters behind the statistics lock; snapshotted by the
/// statistics log task.
#[derive(Debug, Default, Clone)]
pub struct Statistics {
    pub received: u64,
    pub sent: u64,
    pub dropped: u64,
    pub integrity_failures: u64,
}

/// An outstanding ask to a providing application whether a subscription
/// is accepted.
pub(crate) struct PendingReply {
    pub subscriber: SubscriberRef,
    pub service: ServiceId,
    pub instance: InstanceId,
    pub eventgroup: u16,
    pub event: u16,
}

/// Who asked for a subscription: a local application or a remote peer
/// whose ack/nack entry must go back over SD.
pub(crate) enum SubscriberRef {
    Local(ClientId),
    Remote {
        subscription: crate::registry::RemoteSubscription,
        counter: u8,
        ttl: u32,
        /// SD endpoint of the subscriber; the ack entry goes back here.
        sender: SocketAddr,
    },
}

/// The per-host broker: owns the endpoint manager and the registry,
/// multiplexes remote traffic to local applications and local sends to
/// remote endpoints.
pub struct RoutingManager {
    self_ref: Weak<RoutingManager>,
    pub(crate) config: Config,
    pub(crate) registry: Arc<ServiceRegistry>,
    pub(crate) endpoints: Arc<EndpointManager>,
    pub(crate) host: Arc<dyn Host>,
    pub(crate) security: Arc<dyn SecurityPolicy>,
    pub(crate) e2e: Arc<dyn E2eProvider>,
    pub(crate) transport: Arc<LocalTransportServer>,
    pub(crate) id_pool: Arc<ClientIdPool>,
    pub(crate) discovery: Mutex<Option<Arc<ServiceDiscovery>>>,
    pub(crate) secoc: Mutex<Option<Arc<dyn crate::SecocRuntime>>>,

    // Lock order between these tables follows their declaration order;
    // no lock is held across an endpoint or local-transport send.
    /// service → instance → (major, minor, offering client)
    pub(crate) local_services:
        Mutex<HashMap<ServiceId, HashMap<InstanceId, (MajorVersion, MinorVersion, ClientId)>>>,
    pub(crate) offer_commands: Mutex<OfferCommandQueue>,
    pub(crate) pending_offers: Mutex<PendingOfferTable>,
    pub(crate) pending_subscriptions: Mutex<Vec<PendingSubscription>>,
    pub(crate) pending_replies: Mutex<HashMap<PendingId, PendingReply>>,
    pub(crate) routing_state: Mutex<RoutingState>,
    /// Offers waiting for the network interface to come up.
    pub(crate) pending_sd_offers: Mutex<Vec<ServiceInstance>>,
    pub(crate) statistics: Mutex<Statistics>,
    /// Requests for services not (yet) known, kept until an offer shows
    /// up or the requester releases.
    pub(crate) pending_requests:
        Mutex<HashSet<(ClientId, ServiceId, InstanceId, MajorVersion, MinorVersion)>>,
    /// Remote requesters learned on ingress, for routing responses back.
    pub(crate) remote_clients: Mutex<HashMap<ClientId, (SocketAddr, bool)>>,
    /// Which host a remote service was learned from; reboot detection
    /// invalidates by origin.
    pub(crate) remote_origins: Mutex<HashMap<ServiceInstance, std::net::IpAddr>>,

    pub(crate) if_state_running: AtomicBool,
    pub(crate) next_pending_id: AtomicU32,
}

impl RoutingManager {
    pub fn new(
        config: Config,
        host: Arc<dyn Host>,
        security: Arc<dyn SecurityPolicy>,
        e2e: Arc<dyn E2eProvider>,
    ) -> Arc<Self> {
        let endpoints = Arc::new(EndpointManager::new(config.unicast, &config.endpoints));
        let transport = Arc::new(LocalTransportServer::new(
            config.routing_socket(),
            config.endpoints.max_message_size_local,
            config.endpoints.send_queue_capacity,
        ));
        let id_pool = Arc::new(ClientIdPool::new(config.lockfile(), config.diagnosis_address));

        Arc::new_cyclic(|self_ref| Self {
            self_ref: self_ref.clone(),
            config,
            registry: Arc::new(ServiceRegistry::new()),
            endpoints,
            host,
            security,
            e2e,
            transport,
            id_pool,
            discovery: Mutex::new(None),
            secoc: Mutex::new(None),
            local_services: Mutex::new(HashMap::new()),
            offer_commands: Mutex::new(OfferCommandQueue::default()),
            pending_offers: Mutex::new(PendingOfferTable::default()),
            pending_subscriptions: Mutex::new(Vec::new()),
            pending_replies: Mutex::new(HashMap::new()),
            routing_state: Mutex::new(RoutingState::Running),
            pending_sd_offers: Mutex::new(Vec::new()),
            statistics: Mutex::new(Statistics::default()),
            pending_requests: Mutex::new(HashSet::new()),
            remote_clients: Mutex::new(HashMap::new()),
            remote_origins: Mutex::new(HashMap::new()),
            if_state_running: AtomicBool::new(false),
            next_pending_id: AtomicU32::new(1),
        })
    }

    pub(crate) fn arc(&self) -> Arc<Self> {
        self.self_ref.upgrade().expect("routing manager alive")
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    pub fn endpoint_manager(&self) -> &Arc<EndpointManager> {
        &self.endpoints
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn discovery(&self) -> Option<Arc<ServiceDiscovery>> {
        self.discovery.lock().expect("discovery lock").clone()
    }

    pub fn set_discovery(&self, discovery: Arc<ServiceDiscovery>) {
        let mut slot = self.discovery.lock().expect("discovery lock");
        *slot = Some(discovery);
    }

    /// Plugs in a SecOC engine; secured PDUs are authenticated on egress
    /// and verified on ingress.
    pub fn set_secoc(&self, secoc: Arc<dyn crate::SecocRuntime>) {
        let mut slot = self.secoc.lock().expect("secoc lock");
        *slot = Some(secoc);
    }

    pub(crate) fn secoc(&self) -> Option<Arc<dyn crate::SecocRuntime>> {
        self.secoc.lock().expect("secoc lock").clone()
    }

    pub fn routing_state(&self) -> RoutingState {
        *self.routing_state.lock().expect("routing state lock")
    }

    pub fn statistics(&self) -> Statistics {
        self.statistics.lock().expect("statistics lock").clone()
    }

    pub(crate) fn count_received(&self) {
        self.statistics.lock().expect("statistics lock").received += 1;
    }

    pub(crate) fn count_sent(&self) {
        self.statistics.lock().expect("statistics lock").sent += 1;
    }

    pub(crate) fn count_dropped(&self) {
        self.statistics.lock().expect("statistics lock").dropped += 1;
    }

    pub(crate) fn count_integrity_failure(&self) {
        self.statistics.lock().expect("statistics lock").integrity_failures += 1;
    }

    pub(crate) fn next_pending_id(&self) -> PendingId {
        self.next_pending_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Where a remote service was learned from.
    pub fn remote_origin(&self, service: ServiceId, instance: InstanceId) -> Option<std::net::IpAddr> {
        let origins = self.remote_origins.lock().expect("origin lock");
        origins.get(&(service, instance)).copied()
    }

    /// The client offering (service, instance) on this host, if any.
    pub fn find_local_client(&self, service: ServiceId, instance: InstanceId) -> Option<ClientId> {
        let local = self.local_services.lock().expect("local services lock");
        local
            .get(&service)
            .and_then(|instances| instances.get(&instance))
            .map(|(_, _, client)| *client)
    }

    /// All (service, instance, major, minor, client) offered locally.
    pub fn offered_services(
        &self,
    ) -> Vec<(ServiceId, InstanceId, MajorVersion, MinorVersion, ClientId)> {
        let local = self.local_services.lock().expect("local services lock");
        local
            .iter()
            .flat_map(|(service, instances)| {
                instances.iter().map(|(instance, (major, minor, client))| {
                    (*service, *instance, *major, *minor, *client)
                })
            })
            .collect()
    }
}

impl TransportHandler for RoutingManager {
    fn on_register(
        &self,
        requested: ClientId,
        name: &str,
        handle: &Arc<LocalClientHandle>,
    ) -> Result<ClientId, TransportError> {
        let client = self.id_pool.assign(requested)?;
        self.endpoints.add_local(client, handle.clone());
        debug!(client, name, "local client registered");
        Ok(client)
    }

    fn on_command(&self, handle: &Arc<LocalClientHandle>, command: Command) {
        let client = handle.client();
        let this = self.arc();

        match command {
            Command::OfferService {
                client: cmd_client,
                service,
                instance,
                major,
                minor,
            } => {
                let client = if cmd_client != 0 { cmd_client } else { client };
                tokio::spawn(async move {
                    this.offer_service(client, service, instance, major, minor, true)
                        .await;
                });
            }
            Command::StopOfferService {
                client: cmd_client,
                service,
                instance,
                major,
                minor,
            } => {
                let client = if cmd_client != 0 { cmd_client } else { client };
                tokio::spawn(async move {
                    this.stop_offer_service(client, service, instance, major, minor, true)
                        .await;
                });
            }
            Command::RequestService {
                service,
                instance,
                major,
                minor,
                ..
            } => {
                tokio::spawn(async move {
                    this.request_service(client, service, instance, major, minor).await;
                });
            }
            Command::ReleaseService {
                service, instance, ..
            } => {
                this.release_service(client, service, instance);
            }
            Command::Subscribe {
                service,
                instance,
                eventgroup,
                major,
                event,
                ..
            } => {
                let sec_client = SecClient {
                    client,
                    ..SecClient::default()
                };
                this.subscribe(client, &sec_client, service, instance, eventgroup, major, event);
            }
            Command::Unsubscribe {
                service,
                instance,
                eventgroup,
                event,
                ..
            } => {
                this.unsubscribe(client, service, instance, eventgroup, event);
            }
            Command::SubscribeAck { pending, .. } => {
                this.on_subscription_reply(pending, true);
            }
            Command::SubscribeNack { pending, .. } => {
                this.on_subscription_reply(pending, false);
            }
            Command::Pong { .. } => {
                handle.record_pong();
                this.on_pong(client);
            }
            Command::Send {
                instance,
                reliable,
                flush,
                payload,
            } => {
                let sec_client = SecClient {
                    client,
                    ..SecClient::default()
                };
                this.send(client, payload, instance, reliable, flush, &sec_client, false);
            }
            Command::Suspend => {
                tokio::spawn(async move {
                    this.set_routing_state(RoutingState::Suspended).await;
                });
            }
            Command::Resume => {
                tokio::spawn(async move {
                    this.set_routing_state(RoutingState::Resumed).await;
                });
            }
            Command::ResendProvidedEvents { client: provider } => {
                this.resend_provided_events(provider);
            }
            Command::DeregisterApplication { .. } => {
                this.handle_client_error(client);
            }
            other => {
                debug!(client, ?other, "unhandled local transport command");
            }
        }
    }

    fn on_disconnect(&self, client: ClientId) {
        if client == 0 {
            return;
        }
        info!(client, "local client disconnected");
        self.arc().handle_client_error(client);
    }
}

impl MessageSink for RoutingManager {
    fn on_message(
        &self,
        data: Bytes,
        receiver: Receiver,
        remote: SocketAddr,
        is_multicast: bool,
    ) {
        self.on_network_message(data, receiver, remote, is_multicast);
    }
}

impl Drop for RoutingManager {
    fn drop(&mut self) {
        self.id_pool.release_all();
    }
}
