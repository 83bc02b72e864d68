use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EndpointConfig;
use crate::types::ServiceId;

use super::{
    split_datagram, Endpoint, EndpointDefinition, EndpointError, ErrorHandler, MessageSink,
    PrepareStopHandler, Receiver, SendQueue, TpReassembler,
};

/// Connectionless server endpoint bound to a fixed local port. Can join
/// multicast groups; traffic received through a joined group is flagged
/// so that routing can attribute it to the right instance.
pub struct UdpServerEndpoint {
    state: Arc<UdpServerState>,
}

struct UdpServerState {
    local: SocketAddr,
    config: EndpointConfig,
    sink: Arc<dyn MessageSink>,
    queue: Arc<SendQueue>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    /// One additional socket per joined group, bound to the group address.
    groups: Mutex<HashMap<IpAddr, GroupMembership>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Targets for queued unicast sends travel alongside the buffers.
    targets: Mutex<std::collections::VecDeque<SocketAddr>>,
    reassembler: Arc<TpReassembler>,
    established: AtomicBool,
    use_count: AtomicU32,
    error_handler: Mutex<Option<ErrorHandler>>,
}

struct GroupMembership {
    socket: Arc<UdpSocket>,
    task: JoinHandle<()>,
}

impl UdpServerEndpoint {
    pub fn new(local: SocketAddr, config: &EndpointConfig, sink: Arc<dyn MessageSink>) -> Self {
        let queue = Arc::new(SendQueue::new(
            config.send_queue_capacity,
            config.max_message_size_unreliable,
        ));
        let reassembler = Arc::new(TpReassembler::new(
            config.tp_reassembly_timeout,
            config.max_message_size_unreliable * 64,
        ));
        Self {
            state: Arc::new(UdpServerState {
                local,
                config: config.clone(),
                sink,
                queue,
                socket: Mutex::new(None),
                groups: Mutex::new(HashMap::new()),
                tasks: Mutex::new(Vec::new()),
                targets: Mutex::new(std::collections::VecDeque::new()),
                reassembler,
                established: AtomicBool::new(false),
                use_count: AtomicU32::new(0),
                error_handler: Mutex::new(None),
            }),
        }
    }

    /// Joins `group` and starts delivering its traffic flagged as
    /// multicast. Joining twice is a no-op.
    pub async fn join_group(&self, group: IpAddr) -> Result<(), EndpointError> {
        {
            let groups = self.state.groups.lock().expect("group lock");
            if groups.contains_key(&group) {
                return Ok(());
            }
        }

        let bind: SocketAddr = SocketAddr::new(group, self.state.local.port());
        let socket = Arc::new(bind_reusable(bind).await?);
        match (group, self.state.local.ip()) {
            (IpAddr::V4(group), IpAddr::V4(interface)) => {
                socket.join_multicast_v4(group, interface)?;
            }
            (IpAddr::V6(group), _) => {
                socket.join_multicast_v6(&group, 0)?;
            }
            _ => return Err(EndpointError::NotConnected),
        }

        let task = tokio::spawn(receive_loop(self.state.clone(), socket.clone(), true));
        let mut groups = self.state.groups.lock().expect("group lock");
        groups.insert(group, GroupMembership { socket, task });
        info!(%group, port = self.state.local.port(), "joined multicast group");
        Ok(())
    }

    pub fn leave_group(&self, group: IpAddr) {
        let mut groups = self.state.groups.lock().expect("group lock");
        if let Some(membership) = groups.remove(&group) {
            if let (IpAddr::V4(group), IpAddr::V4(interface)) = (group, self.state.local.ip()) {
                let _ = membership.socket.leave_multicast_v4(group, interface);
            }
            membership.task.abort();
            info!(%group, "left multicast group");
        }
    }
}

async fn bind_reusable(addr: SocketAddr) -> Result<UdpSocket, std::io::Error> {
    // Group sockets must coexist with the unicast socket on the same port.
    UdpSocket::bind(addr).await
}

async fn receive_loop(state: Arc<UdpServerState>, socket: Arc<UdpSocket>, is_multicast: bool) {
    let receiver = Receiver {
        local_port: state.local.port(),
        reliable: false,
    };
    let mut buf = vec![0u8; state.config.max_message_size_unreliable];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(result) => result,
            Err(err) => {
                warn!(local = %state.local, %err, "UDP receive failed");
                state.fire_error();
                return;
            }
        };

        let datagram = Bytes::copy_from_slice(&buf[..len]);
        for message in split_datagram(datagram, state.config.max_message_size_unreliable) {
            if is_tp_segment(&message) {
                if let Some(full) = state.reassembler.on_segment(&message, from) {
                    state.sink.on_message(full, receiver, from, is_multicast);
                }
            } else {
                state.sink.on_message(message, receiver, from, is_multicast);
            }
        }
    }
}

fn is_tp_segment(message: &Bytes) -> bool {
    message.len() > 14 && message[14] & crate::types::TP_FLAG != 0
}

async fn writer(state: Arc<UdpServerState>, socket: Arc<UdpSocket>) {
    while let Some(data) = state.queue.dequeue().await {
        let target = {
            let mut targets = state.targets.lock().expect("target lock");
            targets.pop_front()
        };
        let Some(target) = target else {
            continue;
        };
        if let Err(err) = socket.send_to(&data, target).await {
            warn!(%target, %err, "UDP send failed");
            state.fire_error();
        }
    }
}

async fn purge_loop(state: Arc<UdpServerState>) {
    let period = state.config.tp_reassembly_timeout.max(Duration::from_secs(1));
    loop {
        tokio::time::sleep(period).await;
        state.reassembler.purge();
    }
}

impl UdpServerState {
    fn fire_error(&self) {
        let handler = self.error_handler.lock().expect("error handler lock");
        if let Some(handler) = handler.as_ref() {
            handler();
        }
    }
}

#[async_trait]
impl Endpoint for UdpServerEndpoint {
    async fn start(&self) -> Result<(), EndpointError> {
        {
            let socket = self.state.socket.lock().expect("socket lock");
            if socket.is_some() {
                return Err(EndpointError::AlreadyRunning);
            }
        }

        let socket = Arc::new(UdpSocket::bind(self.state.local).await?);
        {
            let mut slot = self.state.socket.lock().expect("socket lock");
            *slot = Some(socket.clone());
        }

        let mut tasks = self.state.tasks.lock().expect("task lock");
        tasks.push(tokio::spawn(writer(self.state.clone(), socket.clone())));
        tasks.push(tokio::spawn(receive_loop(
            self.state.clone(),
            socket,
            false,
        )));
        tasks.push(tokio::spawn(purge_loop(self.state.clone())));

        self.state.established.store(true, Ordering::SeqCst);
        debug!(local = %self.state.local, "UDP server endpoint started");
        Ok(())
    }

    async fn stop(&self) {
        self.state.established.store(false, Ordering::SeqCst);
        self.state.queue.close();

        {
            let mut groups = self.state.groups.lock().expect("group lock");
            for (_, membership) in groups.drain() {
                membership.task.abort();
            }
        }

        let tasks: Vec<_> = {
            let mut tasks = self.state.tasks.lock().expect("task lock");
            tasks.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }

        let mut socket = self.state.socket.lock().expect("socket lock");
        *socket = None;
    }

    fn prepare_stop(&self, handler: PrepareStopHandler, _service: ServiceId) {
        self.state.queue.prepare_stop(handler);
    }

    fn send(&self, _data: Bytes) -> bool {
        // Server endpoints need an explicit target.
        false
    }

    fn send_to(&self, target: &EndpointDefinition, data: Bytes) -> bool {
        // The target is pushed first so the writer never observes a buffer
        // without its destination.
        let mut targets = self.state.targets.lock().expect("target lock");
        targets.push_back(target.address);
        if !self.state.queue.enqueue(data, true) {
            targets.pop_back();
            return false;
        }
        true
    }

    fn flush(&self) {
        self.state.queue.flush();
    }

    fn is_established(&self) -> bool {
        self.state.established.load(Ordering::SeqCst)
    }

    fn is_reliable(&self) -> bool {
        false
    }

    fn is_local(&self) -> bool {
        false
    }

    fn local_port(&self) -> u16 {
        self.state.local.port()
    }

    fn register_error_handler(&self, handler: ErrorHandler) {
        let mut slot = self.state.error_handler.lock().expect("error handler lock");
        *slot = Some(handler);
    }

    async fn restart(&self) {
        self.stop().await;
        self.state.queue.reopen();
        if let Err(err) = self.start().await {
            warn!(local = %self.state.local, %err, "UDP server restart failed");
        }
    }

    fn increment_use_count(&self) {
        self.state.use_count.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_use_count(&self) {
        let previous = self.state.use_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0);
    }

    fn use_count(&self) -> u32 {
        self.state.use_count.load(Ordering::SeqCst)
    }

    fn queue_size(&self) -> usize {
        self.state.queue.len()
    }
}
