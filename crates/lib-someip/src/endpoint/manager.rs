use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use crate::config::EndpointConfig;
use crate::constants::ILLEGAL_PORT;
use crate::transport::LocalClientHandle;
use crate::types::{ClientId, InstanceId, ServiceId};

use super::{
    Endpoint, EndpointError, MessageSink, TcpClientEndpoint, TcpServerEndpoint,
    UdpClientEndpoint, UdpServerEndpoint, VirtualServerEndpoint,
};

/// Server endpoints as stored in the registry; the concrete type is kept
/// so callers can reach variant-specific operations (multicast joins).
#[derive(Clone)]
pub enum ServerEndpoint {
    Udp(Arc<UdpServerEndpoint>),
    Tcp(Arc<TcpServerEndpoint>),
    Virtual(Arc<VirtualServerEndpoint>),
}

impl ServerEndpoint {
    pub fn as_endpoint(&self) -> Arc<dyn Endpoint> {
        match self {
            ServerEndpoint::Udp(endpoint) => endpoint.clone(),
            ServerEndpoint::Tcp(endpoint) => endpoint.clone(),
            ServerEndpoint::Virtual(endpoint) => endpoint.clone(),
        }
    }

    pub fn as_udp(&self) -> Option<Arc<UdpServerEndpoint>> {
        match self {
            ServerEndpoint::Udp(endpoint) => Some(endpoint.clone()),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub enum ClientEndpoint {
    Udp(Arc<UdpClientEndpoint>),
    Tcp(Arc<TcpClientEndpoint>),
}

impl ClientEndpoint {
    pub fn as_endpoint(&self) -> Arc<dyn Endpoint> {
        match self {
            ClientEndpoint::Udp(endpoint) => endpoint.clone(),
            ClientEndpoint::Tcp(endpoint) => endpoint.clone(),
        }
    }
}

/// Registry of every endpoint the broker owns. `find_or_create` is
/// atomic per key: concurrent callers observe the same endpoint.
pub struct EndpointManager {
    unicast: IpAddr,
    config: EndpointConfig,
    sink: Mutex<Option<Arc<dyn MessageSink>>>,
    server_endpoints: Mutex<HashMap<(u16, bool), ServerEndpoint>>,
    client_endpoints: Mutex<HashMap<(SocketAddr, bool), ClientEndpoint>>,
    local_endpoints: Mutex<HashMap<ClientId, Arc<LocalClientHandle>>>,
    /// (service, receiver port, reliable) → instance, for receive-side
    /// instance resolution.
    instances: Mutex<HashMap<(ServiceId, u16, bool), InstanceId>>,
    /// (service, instance) → joined group, plus the reverse lookup used
    /// for multicast receive attribution.
    multicast_groups: Mutex<HashMap<(ServiceId, InstanceId), IpAddr>>,
}

impl EndpointManager {
    pub fn new(unicast: IpAddr, config: &EndpointConfig) -> Self {
        Self {
            unicast,
            config: config.clone(),
            sink: Mutex::new(None),
            server_endpoints: Mutex::new(HashMap::new()),
            client_endpoints: Mutex::new(HashMap::new()),
            local_endpoints: Mutex::new(HashMap::new()),
            instances: Mutex::new(HashMap::new()),
            multicast_groups: Mutex::new(HashMap::new()),
        }
    }

    /// Must be called once before any endpoint is created.
    pub fn set_sink(&self, sink: Arc<dyn MessageSink>) {
        let mut slot = self.sink.lock().expect("sink lock");
        *slot = Some(sink);
    }

    fn sink(&self) -> Arc<dyn MessageSink> {
        self.sink
            .lock()
            .expect("sink lock")
            .clone()
            .expect("endpoint manager used before set_sink")
    }

    /// Server endpoint for (port, reliable), creating and starting it on
    /// first use. `ILLEGAL_PORT` yields a virtual endpoint for services
    /// reachable only via local transport.
    pub async fn find_or_create_server(
        &self,
        port: u16,
        reliable: bool,
    ) -> Result<ServerEndpoint, EndpointError> {
        let (endpoint, created) = {
            let mut map = self.server_endpoints.lock().expect("server endpoint lock");
            match map.entry((port, reliable)) {
                Entry::Occupied(entry) => (entry.get().clone(), false),
                Entry::Vacant(entry) => {
                    let endpoint = if port == ILLEGAL_PORT {
                        ServerEndpoint::Virtual(Arc::new(VirtualServerEndpoint::new(
                            port, reliable,
                        )))
                    } else if reliable {
                        ServerEndpoint::Tcp(Arc::new(TcpServerEndpoint::new(
                            SocketAddr::new(self.unicast, port),
                            &self.config,
                            self.sink(),
                        )))
                    } else {
                        ServerEndpoint::Udp(Arc::new(UdpServerEndpoint::new(
                            SocketAddr::new(self.unicast, port),
                            &self.config,
                            self.sink(),
                        )))
                    };
                    entry.insert(endpoint.clone());
                    (endpoint, true)
                }
            }
        };

        if created {
            if let Err(err) = endpoint.as_endpoint().start().await {
                warn!(port, reliable, %err, "server endpoint start failed");
                let mut map = self.server_endpoints.lock().expect("server endpoint lock");
                map.remove(&(port, reliable));
                return Err(err);
            }
            debug!(port, reliable, "created server endpoint");
        }
        Ok(endpoint)
    }

    pub fn find_server(&self, port: u16, reliable: bool) -> Option<ServerEndpoint> {
        let map = self.server_endpoints.lock().expect("server endpoint lock");
        map.get(&(port, reliable)).cloned()
    }

    /// Removes the server endpoint when nothing references it anymore.
    /// Returns the removed endpoint so the caller can stop it.
    pub fn remove_server(&self, port: u16, reliable: bool) -> Option<ServerEndpoint> {
        let mut map = self.server_endpoints.lock().expect("server endpoint lock");
        if let Some(endpoint) = map.get(&(port, reliable)) {
            if endpoint.as_endpoint().use_count() > 0 {
                return None;
            }
        }
        map.remove(&(port, reliable))
    }

    /// Client endpoint towards `remote`, creating and starting it on
    /// first use.
    pub async fn find_or_create_client(
        &self,
        remote: SocketAddr,
        reliable: bool,
    ) -> Result<ClientEndpoint, EndpointError> {
        let (endpoint, created) = {
            let mut map = self.client_endpoints.lock().expect("client endpoint lock");
            match map.entry((remote, reliable)) {
                Entry::Occupied(entry) => (entry.get().clone(), false),
                Entry::Vacant(entry) => {
                    let endpoint = if reliable {
                        ClientEndpoint::Tcp(Arc::new(TcpClientEndpoint::new(
                            remote,
                            &self.config,
                            self.sink(),
                        )))
                    } else {
                        ClientEndpoint::Udp(Arc::new(UdpClientEndpoint::new(
                            remote,
                            &self.config,
                            self.sink(),
                        )))
                    };
                    entry.insert(endpoint.clone());
                    (endpoint, true)
                }
            }
        };

        if created {
            if let Err(err) = endpoint.as_endpoint().start().await {
                warn!(%remote, reliable, %err, "client endpoint start failed");
                let mut map = self.client_endpoints.lock().expect("client endpoint lock");
                map.remove(&(remote, reliable));
                return Err(err);
            }
            debug!(%remote, reliable, "created client endpoint");
        }
        Ok(endpoint)
    }

    pub fn find_client(&self, remote: SocketAddr, reliable: bool) -> Option<ClientEndpoint> {
        let map = self.client_endpoints.lock().expect("client endpoint lock");
        map.get(&(remote, reliable)).cloned()
    }

    pub async fn remove_client(&self, remote: SocketAddr, reliable: bool) {
        let endpoint = {
            let mut map = self.client_endpoints.lock().expect("client endpoint lock");
            map.remove(&(remote, reliable))
        };
        if let Some(endpoint) = endpoint {
            endpoint.as_endpoint().stop().await;
        }
    }

    pub fn add_local(&self, client: ClientId, handle: Arc<LocalClientHandle>) {
        let mut map = self.local_endpoints.lock().expect("local endpoint lock");
        map.insert(client, handle);
    }

    pub fn remove_local(&self, client: ClientId) -> Option<Arc<LocalClientHandle>> {
        let mut map = self.local_endpoints.lock().expect("local endpoint lock");
        map.remove(&client)
    }

    pub fn find_local(&self, client: ClientId) -> Option<Arc<LocalClientHandle>> {
        let map = self.local_endpoints.lock().expect("local endpoint lock");
        map.get(&client).cloned()
    }

    pub fn local_clients(&self) -> Vec<ClientId> {
        let map = self.local_endpoints.lock().expect("local endpoint lock");
        map.keys().copied().collect()
    }

    pub fn set_instance(
        &self,
        service: ServiceId,
        port: u16,
        reliable: bool,
        instance: InstanceId,
    ) {
        let mut map = self.instances.lock().expect("instance lock");
        map.insert((service, port, reliable), instance);
    }

    /// Removes the binding; returns `true` when no service uses the
    /// endpoint at (port, reliable) anymore.
    pub fn remove_instance(&self, service: ServiceId, port: u16, reliable: bool) -> bool {
        let mut map = self.instances.lock().expect("instance lock");
        map.remove(&(service, port, reliable));
        !map.keys().any(|(_, p, r)| *p == port && *r == reliable)
    }

    pub fn find_instance(&self, service: ServiceId, port: u16, reliable: bool) -> Option<InstanceId> {
        let map = self.instances.lock().expect("instance lock");
        map.get(&(service, port, reliable)).copied()
    }

    /// Joins the eventgroup multicast group on the service's unreliable
    /// server endpoint and records the membership.
    pub async fn register_multicast(
        &self,
        service: ServiceId,
        instance: InstanceId,
        port: u16,
        group: IpAddr,
    ) -> Result<(), EndpointError> {
        let endpoint = self.find_or_create_server(port, false).await?;
        if let Some(udp) = endpoint.as_udp() {
            udp.join_group(group).await?;
        }
        let mut map = self.multicast_groups.lock().expect("multicast lock");
        map.insert((service, instance), group);
        info!(service, instance, %group, "registered multicast membership");
        Ok(())
    }

    pub fn unregister_multicast(&self, service: ServiceId, instance: InstanceId, port: u16) {
        let group = {
            let mut map = self.multicast_groups.lock().expect("multicast lock");
            map.remove(&(service, instance))
        };
        if let Some(group) = group {
            // Leave only when no other instance of any service still uses
            // the same group on this port.
            let still_used = {
                let map = self.multicast_groups.lock().expect("multicast lock");
                map.values().any(|g| *g == group)
            };
            if !still_used {
                if let Some(ServerEndpoint::Udp(udp)) = self.find_server(port, false) {
                    udp.leave_group(group);
                }
            }
        }
    }

    /// Resolves the instance a multicast datagram belongs to.
    pub fn find_instance_by_group(&self, service: ServiceId, group: IpAddr) -> Option<InstanceId> {
        let map = self.multicast_groups.lock().expect("multicast lock");
        map.iter()
            .find(|((s, _), g)| *s == service && **g == group)
            .map(|((_, instance), _)| *instance)
    }

    /// Queue sizes of all endpoints, for the status log.
    pub fn queue_statistics(&self) -> Vec<(String, usize)> {
        let mut stats = Vec::new();
        {
            let map = self.server_endpoints.lock().expect("server endpoint lock");
            for ((port, reliable), endpoint) in map.iter() {
                stats.push((
                    format!("server:{port}/{}", if *reliable { "tcp" } else { "udp" }),
                    endpoint.as_endpoint().queue_size(),
                ));
            }
        }
        {
            let map = self.client_endpoints.lock().expect("client endpoint lock");
            for ((remote, reliable), endpoint) in map.iter() {
                stats.push((
                    format!("client:{remote}/{}", if *reliable { "tcp" } else { "udp" }),
                    endpoint.as_endpoint().queue_size(),
                ));
            }
        }
        stats
    }

    /// Stops every network endpoint. Used on shutdown.
    pub async fn stop_all(&self) {
        let servers: Vec<ServerEndpoint> = {
            let mut map = self.server_endpoints.lock().expect("server endpoint lock");
            map.drain().map(|(_, endpoint)| endpoint).collect()
        };
        for endpoint in servers {
            endpoint.as_endpoint().stop().await;
        }

        let clients: Vec<ClientEndpoint> = {
            let mut map = self.client_endpoints.lock().expect("client endpoint lock");
            map.drain().map(|(_, endpoint)| endpoint).collect()
        };
        for endpoint in clients {
            endpoint.as_endpoint().stop().await;
        }
    }
}
