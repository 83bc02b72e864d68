use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EndpointConfig;
use crate::constants::SERVICE_COOKIE;
use crate::types::ServiceId;

use super::{
    Endpoint, EndpointDefinition, EndpointError, ErrorHandler, FrameBuffer, FramingError,
    MessageSink, PrepareStopHandler, Receiver, SendQueue,
};

/// Connection-oriented server endpoint accepting any number of client
/// connections. Each connection has its own send queue; `send_to` routes
/// by the peer address recorded in the subscription.
pub struct TcpServerEndpoint {
    state: Arc<TcpServerState>,
}

struct TcpServerState {
    local: SocketAddr,
    config: EndpointConfig,
    sink: Arc<dyn MessageSink>,
    connections: Mutex<HashMap<SocketAddr, Arc<Connection>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    established: AtomicBool,
    use_count: AtomicU32,
    error_handler: Mutex<Option<ErrorHandler>>,
}

struct Connection {
    queue: Arc<SendQueue>,
    task: JoinHandle<()>,
}

impl TcpServerEndpoint {
    pub fn new(local: SocketAddr, config: &EndpointConfig, sink: Arc<dyn MessageSink>) -> Self {
        Self {
            state: Arc::new(TcpServerState {
                local,
                config: config.clone(),
                sink,
                connections: Mutex::new(HashMap::new()),
                accept_task: Mutex::new(None),
                established: AtomicBool::new(false),
                use_count: AtomicU32::new(0),
                error_handler: Mutex::new(None),
            }),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.state.connections.lock().expect("connection lock").len()
    }
}

impl TcpServerState {
    fn fire_error(&self) {
        let handler = self.error_handler.lock().expect("error handler lock");
        if let Some(handler) = handler.as_ref() {
            handler();
        }
    }

    fn remove_connection(&self, peer: SocketAddr) {
        let mut connections = self.connections.lock().expect("connection lock");
        if let Some(connection) = connections.remove(&peer) {
            connection.queue.close();
            connection.task.abort();
        }
    }
}

async fn accept_loop(state: Arc<TcpServerState>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                debug!(local = %state.local, %peer, "accepted TCP connection");
                let queue = Arc::new(SendQueue::new(
                    state.config.send_queue_capacity,
                    state.config.max_message_size_reliable,
                ));
                let task = tokio::spawn(serve_connection(
                    state.clone(),
                    stream,
                    peer,
                    queue.clone(),
                ));
                let connection = Arc::new(Connection { queue, task });
                let mut connections = state.connections.lock().expect("connection lock");
                connections.insert(peer, connection);
            }
            Err(err) => {
                warn!(local = %state.local, %err, "TCP accept failed");
                state.fire_error();
                return;
            }
        }
    }
}

async fn serve_connection(
    state: Arc<TcpServerState>,
    stream: TcpStream,
    peer: SocketAddr,
    queue: Arc<SendQueue>,
) {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();

    let writer_config = state.config.clone();
    let writer_queue = queue.clone();
    let writer: JoinHandle<()> = tokio::spawn(async move {
        let mut cookie_timer = tokio::time::interval(writer_config.magic_cookie_interval);
        cookie_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        cookie_timer.reset();

        loop {
            tokio::select! {
                data = writer_queue.dequeue() => {
                    let Some(data) = data else { return };
                    if write_half.write_all(&data).await.is_err() {
                        return;
                    }
                }
                _ = cookie_timer.tick(), if writer_config.magic_cookies => {
                    if write_half.write_all(&SERVICE_COOKIE).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    let receiver = Receiver {
        local_port: state.local.port(),
        reliable: true,
    };
    let mut frames = FrameBuffer::new(
        state.config.max_message_size_reliable,
        state.config.magic_cookies,
    );
    let mut buf = vec![0u8; 16 * 1024];

    'receive: loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                frames.push(&buf[..n]);
                loop {
                    match frames.next_frame() {
                        Ok(Some(message)) => {
                            state.sink.on_message(message, receiver, peer, false);
                        }
                        Ok(None) => break,
                        Err(FramingError::LostSync) | Err(FramingError::Oversized(_)) => {
                            warn!(%peer, "closing TCP session after framing error");
                            break 'receive;
                        }
                    }
                }
            }
        }
    }

    writer.abort();
    debug!(%peer, "TCP session closed");
    let mut connections = state.connections.lock().expect("connection lock");
    connections.remove(&peer);
}

#[async_trait]
impl Endpoint for TcpServerEndpoint {
    async fn start(&self) -> Result<(), EndpointError> {
        {
            let task = self.state.accept_task.lock().expect("accept task lock");
            if task.is_some() {
                return Err(EndpointError::AlreadyRunning);
            }
        }

        let listener = TcpListener::bind(self.state.local).await?;
        info!(local = %self.state.local, "TCP server endpoint listening");

        let mut task = self.state.accept_task.lock().expect("accept task lock");
        *task = Some(tokio::spawn(accept_loop(self.state.clone(), listener)));
        self.state.established.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.state.established.store(false, Ordering::SeqCst);

        let task = {
            let mut slot = self.state.accept_task.lock().expect("accept task lock");
            slot.take()
        };
        if let Some(task) = task {
            task.abort();
        }

        let peers: Vec<SocketAddr> = {
            let connections = self.state.connections.lock().expect("connection lock");
            connections.keys().copied().collect()
        };
        for peer in peers {
            self.state.remove_connection(peer);
        }
    }

    /// The fence completes once every live session has drained its queue.
    fn prepare_stop(&self, handler: PrepareStopHandler, _service: ServiceId) {
        let queues: Vec<Arc<SendQueue>> = {
            let connections = self.state.connections.lock().expect("connection lock");
            connections.values().map(|c| c.queue.clone()).collect()
        };

        if queues.is_empty() {
            handler();
            return;
        }

        let pending = Arc::new(AtomicUsize::new(queues.len()));
        let handler = Arc::new(Mutex::new(Some(handler)));
        for queue in queues {
            let pending = pending.clone();
            let handler = handler.clone();
            queue.prepare_stop(Box::new(move || {
                if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                    if let Some(handler) = handler.lock().expect("fence lock").take() {
                        handler();
                    }
                }
            }));
        }
    }

    fn send(&self, _data: Bytes) -> bool {
        false
    }

    fn send_to(&self, target: &EndpointDefinition, data: Bytes) -> bool {
        let connection = {
            let connections = self.state.connections.lock().expect("connection lock");
            connections.get(&target.address).cloned()
        };
        match connection {
            Some(connection) => connection.queue.enqueue(data, true),
            None => {
                debug!(target = %target.address, "no TCP session for target");
                false
            }
        }
    }

    fn flush(&self) {
        let connections = self.state.connections.lock().expect("connection lock");
        for connection in connections.values() {
            connection.queue.flush();
        }
    }

    fn is_established(&self) -> bool {
        self.state.established.load(Ordering::SeqCst)
    }

    fn is_reliable(&self) -> bool {
        true
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
        if let Err(err) = self.start().await {
            warn!(local = %self.state.local, %err, "TCP server restart failed");
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
        let connections = self.state.connections.lock().expect("connection lock");
        connections.values().map(|c| c.queue.len()).sum()
    }
}
