use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::EndpointConfig;
use crate::types::ServiceId;

use super::{
    split_datagram, Endpoint, EndpointDefinition, EndpointError, ErrorHandler, MessageSink,
    PrepareStopHandler, Receiver, SendQueue,
};

/// Connectionless client endpoint: sends to a fixed remote (service) and
/// receives responses on the same socket.
pub struct UdpClientEndpoint {
    state: Arc<UdpClientState>,
}

struct UdpClientState {
    remote: SocketAddr,
    config: EndpointConfig,
    sink: Arc<dyn MessageSink>,
    queue: Arc<SendQueue>,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    established: AtomicBool,
    local_port: AtomicU16,
    use_count: AtomicU32,
    error_handler: Mutex<Option<ErrorHandler>>,
}

impl UdpClientEndpoint {
    pub fn new(remote: SocketAddr, config: &EndpointConfig, sink: Arc<dyn MessageSink>) -> Self {
        let queue = Arc::new(SendQueue::new(
            config.send_queue_capacity,
            config.max_message_size_unreliable,
        ));
        Self {
            state: Arc::new(UdpClientState {
                remote,
                config: config.clone(),
                sink,
                queue,
                socket: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
                established: AtomicBool::new(false),
                local_port: AtomicU16::new(0),
                use_count: AtomicU32::new(0),
                error_handler: Mutex::new(None),
            }),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.state.remote
    }
}

impl UdpClientState {
    fn fire_error(&self) {
        let handler = self.error_handler.lock().expect("error handler lock");
        if let Some(handler) = handler.as_ref() {
            handler();
        }
    }
}

async fn writer(state: Arc<UdpClientState>, socket: Arc<UdpSocket>) {
    while let Some(data) = state.queue.dequeue().await {
        if let Err(err) = socket.send_to(&data, state.remote).await {
            warn!(remote = %state.remote, %err, "UDP send failed");
            state.fire_error();
        }
    }
}

async fn reader(state: Arc<UdpClientState>, socket: Arc<UdpSocket>) {
    let receiver = Receiver {
        local_port: state.local_port.load(Ordering::SeqCst),
        reliable: false,
    };
    let mut buf = vec![0u8; state.config.max_message_size_unreliable];
    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(result) => result,
            Err(err) => {
                warn!(remote = %state.remote, %err, "UDP receive failed");
                state.fire_error();
                return;
            }
        };

        let datagram = Bytes::copy_from_slice(&buf[..len]);
        for message in split_datagram(datagram, state.config.max_message_size_unreliable) {
            state.sink.on_message(message, receiver, from, false);
        }
    }
}

#[async_trait]
impl Endpoint for UdpClientEndpoint {
    async fn start(&self) -> Result<(), EndpointError> {
        {
            let socket = self.state.socket.lock().expect("socket lock");
            if socket.is_some() {
                return Err(EndpointError::AlreadyRunning);
            }
        }

        let bind_addr: SocketAddr = if self.state.remote.is_ipv4() {
            "0.0.0.0:0".parse().unwrap()
        } else {
            "[::]:0".parse().unwrap()
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        self.state
            .local_port
            .store(socket.local_addr()?.port(), Ordering::SeqCst);

        {
            let mut slot = self.state.socket.lock().expect("socket lock");
            *slot = Some(socket.clone());
        }

        let mut tasks = self.state.tasks.lock().expect("task lock");
        tasks.push(tokio::spawn(writer(self.state.clone(), socket.clone())));
        tasks.push(tokio::spawn(reader(self.state.clone(), socket)));

        self.state.established.store(true, Ordering::SeqCst);
        debug!(remote = %self.state.remote, "UDP client endpoint started");
        Ok(())
    }

    async fn stop(&self) {
        self.state.established.store(false, Ordering::SeqCst);
        self.state.queue.close();

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

    fn send(&self, data: Bytes) -> bool {
        self.state.queue.enqueue(data, true)
    }

    fn send_to(&self, _target: &EndpointDefinition, data: Bytes) -> bool {
        // Client endpoints have a fixed remote.
        self.send(data)
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
        self.state.local_port.load(Ordering::SeqCst)
    }

    fn register_error_handler(&self, handler: ErrorHandler) {
        let mut slot = self.state.error_handler.lock().expect("error handler lock");
        *slot = Some(handler);
    }

    async fn restart(&self) {
        self.stop().await;
        self.state.queue.reopen();
        if let Err(err) = self.start().await {
            warn!(remote = %self.state.remote, %err, "UDP client restart failed");
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
