use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Mutex, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::constants::{ANY_INSTANCE, ANY_MAJOR, ANY_MINOR};
use crate::endpoint::{Endpoint, EndpointDefinition, EndpointError, ServerEndpoint};
use crate::registry::RemoteSubscription;
use crate::routing::RoutingManager;
use crate::types::{
    sd_from_message, EventgroupId, EventId, InstanceId, L4Protocol, MajorVersion, MinorVersion,
    SdEntry, SdEntryType, SdFlags, SdMessage, SdOption, ServiceId, ServiceInstance, SomeIpMessage,
    Ttl,
};
use crate::wire::{Readable, ReadBuffer};

mod fsm;
mod reboot;

pub use fsm::*;
pub use reboot::*;

/// Commands and inputs consumed by the engine task. Everything the SD
/// machine does is serialized through this channel, which keeps offer
/// and stop-offer ordering per sender intact.
enum SdEvent {
    Offer(ServiceId, InstanceId),
    StopOffer(ServiceId, InstanceId, MajorVersion, MinorVersion),
    Request(ServiceId, InstanceId),
    Release(ServiceId, InstanceId),
    Subscribe {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        event: EventId,
    },
    Unsubscribe {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
    },
    AnswerSubscription {
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        counter: u8,
        ttl: Ttl,
        accepted: bool,
        to: SocketAddr,
    },
    DelayedUnicastOffer {
        service: ServiceId,
        instance: InstanceId,
        to: SocketAddr,
    },
    Message {
        data: Bytes,
        sender: SocketAddr,
        is_multicast: bool,
    },
    NetworkState(bool),
}

/// The SOME/IP-SD engine. The public surface enqueues events; one task
/// owns all state and drives the announce/find machines.
pub struct ServiceDiscovery {
    tx: mpsc::UnboundedSender<SdEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<SdEvent>>>,
    routing: Weak<RoutingManager>,
    config: Config,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceDiscovery {
    pub fn new(config: &Config, routing: Weak<RoutingManager>) -> std::sync::Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        std::sync::Arc::new(Self {
            tx,
            rx: Mutex::new(Some(rx)),
            routing,
            config: config.clone(),
            task: Mutex::new(None),
        })
    }

    /// Binds the SD endpoint, joins the configured multicast group and
    /// starts the engine.
    pub async fn start(self: &std::sync::Arc<Self>) -> Result<(), EndpointError> {
        let routing = self.routing.upgrade().ok_or(EndpointError::NotConnected)?;

        let endpoint = routing
            .endpoint_manager()
            .find_or_create_server(self.config.sd.port, false)
            .await?;
        if let Some(udp) = endpoint.as_udp() {
            udp.join_group(self.config.sd.multicast).await?;
        }

        let rx = {
            let mut slot = self.rx.lock().expect("sd receiver lock");
            slot.take().ok_or(EndpointError::AlreadyRunning)?
        };

        let engine = Engine::new(self.config.clone(), self.routing.clone(), endpoint, self.tx.clone());
        let mut slot = self.task.lock().expect("sd task lock");
        *slot = Some(tokio::spawn(engine.run(rx)));
        info!(
            multicast = %self.config.sd.multicast,
            port = self.config.sd.port,
            "service discovery started"
        );
        Ok(())
    }

    pub fn stop(&self) {
        let task = {
            let mut slot = self.task.lock().expect("sd task lock");
            slot.take()
        };
        if let Some(task) = task {
            task.abort();
        }
    }

    pub fn offer_service(&self, service: ServiceId, instance: InstanceId) {
        let _ = self.tx.send(SdEvent::Offer(service, instance));
    }

    pub fn stop_offer_service(
        &self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) {
        let _ = self
            .tx
            .send(SdEvent::StopOffer(service, instance, major, minor));
    }

    pub fn request_service(&self, service: ServiceId, instance: InstanceId) {
        let _ = self.tx.send(SdEvent::Request(service, instance));
    }

    pub fn release_service(&self, service: ServiceId, instance: InstanceId) {
        let _ = self.tx.send(SdEvent::Release(service, instance));
    }

    pub fn subscribe(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        event: EventId,
    ) {
        let _ = self.tx.send(SdEvent::Subscribe {
            service,
            instance,
            eventgroup,
            major,
            event,
        });
    }

    pub fn unsubscribe(&self, service: ServiceId, instance: InstanceId, eventgroup: EventgroupId) {
        let _ = self.tx.send(SdEvent::Unsubscribe {
            service,
            instance,
            eventgroup,
        });
    }

    /// Outcome of a remote subscription ask, to be answered on the wire.
    #[allow(clippy::too_many_arguments)]
    pub fn answer_subscription(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        counter: u8,
        ttl: Ttl,
        accepted: bool,
        to: SocketAddr,
    ) {
        let _ = self.tx.send(SdEvent::AnswerSubscription {
            service,
            instance,
            eventgroup,
            counter,
            ttl,
            accepted,
            to,
        });
    }

    /// Raw SD traffic handed over by the routing manager's ingress path.
    pub fn on_message(&self, data: Bytes, sender: SocketAddr, is_multicast: bool) {
        let _ = self.tx.send(SdEvent::Message {
            data,
            sender,
            is_multicast,
        });
    }

    pub fn set_network_up(&self, up: bool) {
        let _ = self.tx.send(SdEvent::NetworkState(up));
    }
}

/// Task-owned engine state.
struct Engine {
    config: Config,
    routing: Weak<RoutingManager>,
    endpoint: ServerEndpoint,
    self_tx: mpsc::UnboundedSender<SdEvent>,
    announce: AnnounceFsm,
    find: FindFsm,
    offered: HashSet<ServiceInstance>,
    /// Services we are still looking for.
    wanted: HashSet<ServiceInstance>,
    /// Outgoing subscriptions to refresh whenever the offer shows up.
    subscriptions: HashMap<(ServiceId, InstanceId, EventgroupId), (MajorVersion, EventId)>,
    sessions: SessionCounters,
    reboots: RebootTracker,
    last_ttl_tick: Instant,
}

impl Engine {
    fn new(
        config: Config,
        routing: Weak<RoutingManager>,
        endpoint: ServerEndpoint,
        self_tx: mpsc::UnboundedSender<SdEvent>,
    ) -> Self {
        let announce = AnnounceFsm::new(&config.sd);
        let find = FindFsm::new(&config.sd);
        Self {
            config,
            routing,
            endpoint,
            self_tx,
            announce,
            find,
            offered: HashSet::new(),
            wanted: HashSet::new(),
            subscriptions: HashMap::new(),
            sessions: SessionCounters::default(),
            reboots: RebootTracker::default(),
            last_ttl_tick: Instant::now(),
        }
    }

    fn ttl_tick_period(&self) -> Duration {
        (self.config.sd.cyclic_offer_delay / 2).max(Duration::from_millis(100))
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SdEvent>) {
        // The network is considered up once the endpoint is bound.
        self.announce.activate(Instant::now());

        loop {
            let now = Instant::now();
            let mut deadline = now + self.ttl_tick_period();
            for candidate in [self.announce.deadline(), self.find.deadline()] {
                if let Some(candidate) = candidate {
                    deadline = deadline.min(candidate);
                }
            }

            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { return };
                    self.handle_event(event).await;
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    self.on_timer(Instant::now()).await;
                }
            }
        }
    }

    async fn on_timer(&mut self, now: Instant) {
        if self
            .announce
            .deadline()
            .map(|at| at <= now)
            .unwrap_or(false)
            && self.announce.on_timeout(now) == AnnounceAction::SendOffers
        {
            self.send_offers(None).await;
        }

        if self.find.deadline().map(|at| at <= now).unwrap_or(false)
            && self.find.on_timeout(now)
            && !self.wanted.is_empty()
        {
            self.send_finds().await;
        }

        let elapsed = now.duration_since(self.last_ttl_tick);
        if elapsed >= self.ttl_tick_period() {
            self.last_ttl_tick = now;
            if let Some(routing) = self.routing.upgrade() {
                routing.expire_services(elapsed);
                routing.registry().expire_remote_subscriptions(now);
            }
        }
    }

    async fn handle_event(&mut self, event: SdEvent) {
        match event {
            SdEvent::Offer(service, instance) => {
                self.offered.insert((service, instance));
                if !self.announce.is_active() {
                    return;
                }
                if self.announce.phase() == AnnouncePhase::Main {
                    // Announce the newcomer right away inside the cycle.
                    self.send_offers(Some((service, instance))).await;
                }
            }
            SdEvent::StopOffer(service, instance, major, minor) => {
                if self.offered.remove(&(service, instance)) && self.announce.is_active() {
                    self.send_stop_offer(service, instance, major, minor).await;
                }
            }
            SdEvent::Request(service, instance) => {
                self.wanted.insert((service, instance));
                self.find.activate(Instant::now());
            }
            SdEvent::Release(service, instance) => {
                self.wanted.remove(&(service, instance));
            }
            SdEvent::Subscribe {
                service,
                instance,
                eventgroup,
                major,
                event,
            } => {
                self.subscriptions
                    .insert((service, instance, eventgroup), (major, event));
                self.send_subscribe(service, instance, eventgroup, major, self.config.sd.ttl)
                    .await;
            }
            SdEvent::Unsubscribe {
                service,
                instance,
                eventgroup,
            } => {
                if let Some((major, _)) = self.subscriptions.remove(&(service, instance, eventgroup))
                {
                    self.send_subscribe(service, instance, eventgroup, major, 0).await;
                }
            }
            SdEvent::AnswerSubscription {
                service,
                instance,
                eventgroup,
                counter,
                ttl,
                accepted,
                to,
            } => {
                self.send_subscribe_answer(service, instance, eventgroup, counter, ttl, accepted, to)
                    .await;
            }
            SdEvent::DelayedUnicastOffer {
                service,
                instance,
                to,
            } => {
                if self.offered.contains(&(service, instance)) {
                    self.send_unicast_offer(service, instance, to).await;
                }
            }
            SdEvent::Message {
                data,
                sender,
                is_multicast,
            } => {
                self.on_sd_message(data, sender, is_multicast).await;
            }
            SdEvent::NetworkState(up) => {
                let now = Instant::now();
                if up {
                    if !self.announce.is_active() {
                        self.announce.activate(now);
                        self.find.activate(now);
                    }
                } else {
                    self.announce.deactivate();
                    self.find.deactivate();
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Outgoing messages
    // ------------------------------------------------------------------

    fn multicast_target(&self) -> EndpointDefinition {
        EndpointDefinition::new(
            SocketAddr::new(self.config.sd.multicast, self.config.sd.port),
            false,
        )
    }

    async fn dispatch(&mut self, mut message: SdMessage, to: Option<SocketAddr>) {
        let (session, reboot) = match to {
            Some(peer) => self.sessions.next_unicast(peer),
            None => self.sessions.next_multicast(),
        };
        message.flags.reboot = reboot;
        message.flags.unicast = true;

        let Ok(wire) = message.into_message(session) else {
            return;
        };
        let target = match to {
            Some(peer) => EndpointDefinition::new(peer, false),
            None => self.multicast_target(),
        };
        if !self
            .endpoint
            .as_endpoint()
            .send_to(&target, wire.to_bytes())
        {
            warn!(target = %target.address, "SD send rejected");
        }
    }

    /// Endpoint options for one of our offered services.
    fn offer_options(&self, service: ServiceId, instance: InstanceId, message: &mut SdMessage, entry: &mut SdEntry) {
        let Some(cfg) = self.config.service(service, instance) else {
            return;
        };
        let mut count = 0u8;
        let mut index = 0u8;
        if let Some(port) = cfg.reliable_port {
            index = message.add_option(SdOption::endpoint(
                self.config.unicast,
                L4Protocol::Tcp,
                port,
            ));
            count += 1;
        }
        if let Some(port) = cfg.unreliable_port {
            let unreliable_index = message.add_option(SdOption::endpoint(
                self.config.unicast,
                L4Protocol::Udp,
                port,
            ));
            if count == 0 {
                index = unreliable_index;
            }
            count += 1;
        }
        if count > 0 {
            entry.index_first = index;
            entry.options_first = count;
        }
    }

    fn offer_entry(&self, service: ServiceId, instance: InstanceId) -> Option<SdEntry> {
        let routing = self.routing.upgrade()?;
        let (major, minor) = routing
            .registry()
            .find_service(service, instance)
            .map(|info| (info.major(), info.minor()))
            .unwrap_or((ANY_MAJOR, ANY_MINOR));
        Some(SdEntry::offer(
            service,
            instance,
            major,
            minor,
            self.config.sd.ttl,
        ))
    }

    /// One multicast message carrying every offered instance, or only
    /// `only` when a single service is announced out of cycle.
    async fn send_offers(&mut self, only: Option<ServiceInstance>) {
        let offered: Vec<ServiceInstance> = match only {
            Some(single) => vec![single],
            None => self.offered.iter().copied().collect(),
        };
        if offered.is_empty() {
            return;
        }

        let mut message = SdMessage::new(SdFlags::default());
        for (service, instance) in offered {
            let Some(mut entry) = self.offer_entry(service, instance) else {
                continue;
            };
            self.offer_options(service, instance, &mut message, &mut entry);
            message.entries.push(entry);
        }
        if message.entries.is_empty() {
            return;
        }

        trace!(entries = message.entries.len(), "sending offers");
        self.announce.note_multicast_offer(Instant::now());
        self.dispatch(message, None).await;
    }

    async fn send_unicast_offer(&mut self, service: ServiceId, instance: InstanceId, to: SocketAddr) {
        let Some(mut entry) = self.offer_entry(service, instance) else {
            return;
        };
        let mut message = SdMessage::new(SdFlags::default());
        self.offer_options(service, instance, &mut message, &mut entry);
        message.entries.push(entry);
        self.dispatch(message, Some(to)).await;
    }

    async fn send_stop_offer(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        major: MajorVersion,
        minor: MinorVersion,
    ) {
        let mut message = SdMessage::new(SdFlags::default());
        message
            .entries
            .push(SdEntry::stop_offer(service, instance, major, minor));
        self.dispatch(message, None).await;
    }

    async fn send_finds(&mut self) {
        let mut message = SdMessage::new(SdFlags::default());
        for (service, instance) in self.wanted.iter() {
            message.entries.push(SdEntry::find(
                *service,
                *instance,
                ANY_MAJOR,
                ANY_MINOR,
                self.config.sd.ttl,
            ));
        }
        if message.entries.is_empty() {
            return;
        }
        trace!(entries = message.entries.len(), "sending finds");
        self.dispatch(message, None).await;
    }

    /// SubscribeEventgroup towards the provider's SD endpoint, carrying
    /// our receive endpoints as options. TTL 0 unsubscribes.
    async fn send_subscribe(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        major: MajorVersion,
        ttl: Ttl,
    ) {
        let Some(routing) = self.routing.upgrade() else {
            return;
        };
        let Some(origin) = routing.remote_origin(service, instance) else {
            debug!(service, instance, eventgroup, "subscribe deferred, provider unknown");
            return;
        };

        let mut message = SdMessage::new(SdFlags::default());
        let mut entry = SdEntry::subscribe(service, instance, eventgroup, major, 0, ttl);

        if let Some(info) = routing.registry().find_service(service, instance) {
            let mut count = 0u8;
            let mut index = 0u8;
            for reliable in [true, false] {
                if let Some(endpoint) = info.endpoint(reliable) {
                    let port = endpoint.local_port();
                    if port == 0 || port == crate::constants::ILLEGAL_PORT {
                        continue;
                    }
                    let option_index = message.add_option(SdOption::endpoint(
                        self.config.unicast,
                        L4Protocol::from_reliable(reliable),
                        port,
                    ));
                    if count == 0 {
                        index = option_index;
                    }
                    count += 1;
                }
            }
            if count > 0 {
                entry.index_first = index;
                entry.options_first = count;
            }
        }

        message.entries.push(entry);
        self.dispatch(message, Some(SocketAddr::new(origin, self.config.sd.port)))
            .await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_subscribe_answer(
        &mut self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        counter: u8,
        ttl: Ttl,
        accepted: bool,
        to: SocketAddr,
    ) {
        let major = self
            .routing
            .upgrade()
            .and_then(|routing| routing.registry().find_service(service, instance))
            .map(|info| info.major())
            .unwrap_or(ANY_MAJOR);

        let mut message = SdMessage::new(SdFlags::default());
        let mut entry = if accepted {
            SdEntry::subscribe_ack(service, instance, eventgroup, major, counter, ttl)
        } else {
            SdEntry::subscribe_nack(service, instance, eventgroup, major, counter)
        };

        if accepted {
            if let Some(routing) = self.routing.upgrade() {
                if let Some(group) = routing
                    .registry()
                    .find_eventgroup(service, instance, eventgroup)
                {
                    if let Some((address, port)) = group.multicast() {
                        let index = message.add_option(SdOption::multicast(address, port));
                        entry.index_first = index;
                        entry.options_first = 1;
                    }
                }
            }
        }

        message.entries.push(entry);
        self.dispatch(message, Some(to)).await;
    }

    // ------------------------------------------------------------------
    // Incoming messages
    // ------------------------------------------------------------------

    async fn on_sd_message(&mut self, data: Bytes, sender: SocketAddr, is_multicast: bool) {
        let mut buf = ReadBuffer::new(&data);
        let Ok(wire) = SomeIpMessage::read(&mut buf) else {
            warn!(%sender, "undecodable SD message");
            return;
        };
        let sd = match sd_from_message(&wire) {
            Ok(sd) => sd,
            Err(err) => {
                warn!(%sender, %err, "malformed SD payload");
                return;
            }
        };

        match self.reboots.check(
            sender.ip(),
            is_multicast,
            sd.flags.reboot,
            wire.header.session,
        ) {
            SessionCheck::Ok => {}
            SessionCheck::Loss => {
                warn!(%sender, is_multicast, "SD session gap, messages lost");
            }
            SessionCheck::Reboot => {
                warn!(%sender, "SD peer rebooted");
                self.reboots.forget(sender.ip());
                if let Some(routing) = self.routing.upgrade() {
                    routing.invalidate_remote_origin(sender.ip());
                }
            }
        }

        for entry in &sd.entries {
            match entry.entry_type {
                SdEntryType::FindService => {
                    self.on_find_service(entry, sender, is_multicast, sd.flags.unicast)
                        .await;
                }
                SdEntryType::OfferService => {
                    self.on_offer_service(entry, &sd, sender).await;
                }
                SdEntryType::SubscribeEventgroup => {
                    self.on_subscribe(entry, &sd, sender).await;
                }
                SdEntryType::SubscribeEventgroupAck => {
                    self.on_subscribe_answer(entry, &sd).await;
                }
            }
        }
    }

    async fn on_find_service(
        &mut self,
        entry: &SdEntry,
        sender: SocketAddr,
        via_multicast: bool,
        unicast_supported: bool,
    ) {
        let matching: Vec<ServiceInstance> = self
            .offered
            .iter()
            .copied()
            .filter(|(service, instance)| {
                *service == entry.service
                    && (entry.instance == ANY_INSTANCE || *instance == entry.instance)
            })
            .collect();
        if matching.is_empty() {
            return;
        }

        let now = Instant::now();
        for (service, instance) in matching {
            match self.announce.phase() {
                AnnouncePhase::Repetition => {
                    // Finds during repetition are answered directly via
                    // unicast.
                    self.send_unicast_offer(service, instance, sender).await;
                }
                AnnouncePhase::Main => {
                    if self.announce.answer_by_multicast(now) || !unicast_supported {
                        self.announce.note_multicast_offer(now);
                        self.send_offers(Some((service, instance))).await;
                    } else if via_multicast {
                        // Delay the unicast answer within the configured
                        // request-response window.
                        let delay_max =
                            self.config.sd.request_response_delay.as_millis() as u64;
                        let delay = Duration::from_millis(
                            rand::thread_rng().gen_range(0..=delay_max),
                        );
                        let tx = self.self_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = tx.send(SdEvent::DelayedUnicastOffer {
                                service,
                                instance,
                                to: sender,
                            });
                        });
                    } else {
                        self.send_unicast_offer(service, instance, sender).await;
                    }
                }
                _ => {}
            }
        }
    }

    async fn on_offer_service(&mut self, entry: &SdEntry, sd: &SdMessage, sender: SocketAddr) {
        let Some(routing) = self.routing.upgrade() else {
            return;
        };
        let service = entry.service;
        let instance = entry.instance;

        if entry.ttl == 0 {
            debug!(service, instance, %sender, "remote stop-offer");
            routing.del_routing_info(service, instance);
            return;
        }

        let mut reliable_target = None;
        let mut unreliable_target = None;
        for option in sd.options_for(entry) {
            if option.is_unknown() || option.is_multicast() {
                continue;
            }
            if let Some((address, reliable)) = option.to_target() {
                if reliable {
                    reliable_target = Some(address);
                } else {
                    unreliable_target = Some(address);
                }
            }
        }

        self.wanted.remove(&(service, instance));
        routing
            .add_routing_info(
                service,
                instance,
                entry.major,
                entry.minor().unwrap_or(ANY_MINOR),
                entry.ttl,
                sender.ip(),
                reliable_target,
                unreliable_target,
            )
            .await;

        // Renew the subscriptions riding on this offer.
        let renewals: Vec<(EventgroupId, MajorVersion)> = self
            .subscriptions
            .iter()
            .filter(|((s, i, _), _)| *s == service && *i == instance)
            .map(|((_, _, eventgroup), (major, _))| (*eventgroup, *major))
            .collect();
        for (eventgroup, major) in renewals {
            self.send_subscribe(service, instance, eventgroup, major, self.config.sd.ttl)
                .await;
        }
    }

    async fn on_subscribe(&mut self, entry: &SdEntry, sd: &SdMessage, sender: SocketAddr) {
        let Some(routing) = self.routing.upgrade() else {
            return;
        };
        let Some(eventgroup) = entry.eventgroup() else {
            return;
        };

        let mut reliable = None;
        let mut unreliable = None;
        for option in sd.options_for(entry) {
            // Unknown option types are skipped, the rest of the entry
            // stays valid.
            if option.is_unknown() || option.is_multicast() {
                continue;
            }
            if let Some((address, is_reliable)) = option.to_target() {
                let definition = EndpointDefinition::new(address, is_reliable);
                if is_reliable {
                    reliable = Some(definition);
                } else {
                    unreliable = Some(definition);
                }
            }
        }

        if reliable.is_none() && unreliable.is_none() && entry.ttl > 0 {
            debug!(
                service = entry.service,
                eventgroup, %sender, "subscribe without endpoint options"
            );
            let _ = self.self_tx.send(SdEvent::AnswerSubscription {
                service: entry.service,
                instance: entry.instance,
                eventgroup,
                counter: entry.counter(),
                ttl: entry.ttl,
                accepted: false,
                to: sender,
            });
            return;
        }

        routing.on_remote_subscribe(
            entry.service,
            entry.instance,
            eventgroup,
            entry.major,
            entry.counter(),
            entry.ttl,
            RemoteSubscription {
                reliable,
                unreliable,
                counter: entry.counter(),
            },
            sender,
        );
    }

    async fn on_subscribe_answer(&mut self, entry: &SdEntry, sd: &SdMessage) {
        let Some(routing) = self.routing.upgrade() else {
            return;
        };
        let Some(eventgroup) = entry.eventgroup() else {
            return;
        };
        let accepted = entry.ttl > 0;

        if accepted {
            // A multicast option redirects event reception to a group.
            for option in sd.options_for(entry) {
                if let SdOption::Ipv4Multicast { address, port } = option {
                    let _ = routing
                        .endpoint_manager()
                        .register_multicast(
                            entry.service,
                            entry.instance,
                            *port,
                            IpAddr::V4(*address),
                        )
                        .await;
                }
                if let SdOption::Ipv6Multicast { address, port } = option {
                    let _ = routing
                        .endpoint_manager()
                        .register_multicast(
                            entry.service,
                            entry.instance,
                            *port,
                            IpAddr::V6(*address),
                        )
                        .await;
                }
            }
        } else {
            debug!(
                service = entry.service,
                instance = entry.instance,
                eventgroup,
                "subscription nacked"
            );
        }

        routing.on_remote_subscription_answer(entry.service, entry.instance, eventgroup, accepted);
    }
}
