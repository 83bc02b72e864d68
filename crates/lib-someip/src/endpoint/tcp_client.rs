use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::EndpointConfig;
use crate::constants::CLIENT_COOKIE;
use crate::types::ServiceId;

use super::{
    Endpoint, EndpointDefinition, EndpointError, ErrorHandler, FrameBuffer, FramingError,
    MessageSink, PrepareStopHandler, Receiver, SendQueue,
};

/// Connection-oriented client endpoint with exponential-backoff
/// reconnects. The send queue survives connection losses until the
/// reconnect attempts are exhausted.
pub struct TcpClientEndpoint {
    state: Arc<TcpClientState>,
}

struct TcpClientState {
    remote: SocketAddr,
    config: EndpointConfig,
    sink: Arc<dyn MessageSink>,
    queue: Arc<SendQueue>,
    connected: AtomicBool,
    shutdown: AtomicBool,
    local_port: AtomicU16,
    use_count: AtomicU32,
    error_handler: Mutex<Option<ErrorHandler>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpClientEndpoint {
    pub fn new(remote: SocketAddr, config: &EndpointConfig, sink: Arc<dyn MessageSink>) -> Self {
        let queue = Arc::new(SendQueue::new(
            config.send_queue_capacity,
            config.max_message_size_reliable,
        ));
        Self {
            state: Arc::new(TcpClientState {
                remote,
                config: config.clone(),
                sink,
                queue,
                connected: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                local_port: AtomicU16::new(0),
                use_count: AtomicU32::new(0),
                error_handler: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.state.remote
    }
}

impl TcpClientState {
    fn fire_error(&self) {
        let handler = self.error_handler.lock().expect("error handler lock");
        if let Some(handler) = handler.as_ref() {
            handler();
        }
    }

    async fn connect(&self) -> Result<TcpStream, std::io::Error> {
        let socket = if self.remote.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        let previous_port = self.local_port.load(Ordering::SeqCst);
        if self.config.reconnect_rebind_port && previous_port != 0 {
            socket.set_reuseaddr(true)?;
            let bind: SocketAddr = if self.remote.is_ipv4() {
                SocketAddr::new("0.0.0.0".parse().unwrap(), previous_port)
            } else {
                SocketAddr::new("::".parse().unwrap(), previous_port)
            };
            socket.bind(bind)?;
        }

        let stream = socket.connect(self.remote).await?;
        stream.set_nodelay(true)?;
        self.local_port
            .store(stream.local_addr()?.port(), Ordering::SeqCst);
        Ok(stream)
    }
}

async fn connection_loop(state: Arc<TcpClientState>) {
    let mut attempt: u32 = 0;

    loop {
        if state.shutdown.load(Ordering::SeqCst) {
            return;
        }

        match state.connect().await {
            Ok(stream) => {
                attempt = 0;
                state.connected.store(true, Ordering::SeqCst);
                info!(remote = %state.remote, "TCP connection established");

                run_connection(&state, stream).await;

                state.connected.store(false, Ordering::SeqCst);
                if state.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                warn!(remote = %state.remote, "TCP connection lost");
                state.fire_error();
            }
            Err(err) => {
                debug!(remote = %state.remote, %err, attempt, "TCP connect failed");
                state.fire_error();
            }
        }

        attempt += 1;
        if attempt > state.config.max_reconnect_attempts {
            warn!(
                remote = %state.remote,
                attempts = attempt,
                queued = state.queue.len(),
                "giving up on TCP reconnects, dropping queued messages"
            );
            state.queue.close();
            state.fire_error();
            return;
        }

        let backoff = state
            .config
            .reconnect_base_delay
            .saturating_mul(1u32 << attempt.min(16))
            .min(state.config.reconnect_max_delay);
        tokio::time::sleep(backoff).await;
    }
}

/// Drives one established connection until it fails. The writer half
/// drains the send queue and emits periodic magic cookies; the reader
/// half re-frames the stream and feeds the sink.
async fn run_connection(state: &Arc<TcpClientState>, stream: TcpStream) {
    let (mut read_half, mut write_half) = stream.into_split();

    let writer_state = state.clone();
    let writer: JoinHandle<()> = tokio::spawn(async move {
        let mut cookie_timer = tokio::time::interval(writer_state.config.magic_cookie_interval);
        cookie_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        cookie_timer.reset();

        loop {
            tokio::select! {
                data = writer_state.queue.dequeue() => {
                    let Some(data) = data else { return };
                    if write_half.write_all(&data).await.is_err() {
                        return;
                    }
                }
                _ = cookie_timer.tick(), if writer_state.config.magic_cookies => {
                    if write_half.write_all(&CLIENT_COOKIE).await.is_err() {
                        return;
                    }
                }
            }
        }
    });

    let receiver = Receiver {
        local_port: state.local_port.load(Ordering::SeqCst),
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
                            state
                                .sink
                                .on_message(message, receiver, state.remote, false);
                        }
                        Ok(None) => break,
                        Err(FramingError::LostSync) | Err(FramingError::Oversized(_)) => {
                            warn!(remote = %state.remote, "resetting TCP connection after framing error");
                            break 'receive;
                        }
                    }
                }
            }
        }
    }

    writer.abort();
}

#[async_trait]
impl Endpoint for TcpClientEndpoint {
    async fn start(&self) -> Result<(), EndpointError> {
        let mut task = self.state.task.lock().expect("task lock");
        if task.is_some() {
            return Err(EndpointError::AlreadyRunning);
        }
        self.state.shutdown.store(false, Ordering::SeqCst);
        *task = Some(tokio::spawn(connection_loop(self.state.clone())));
        Ok(())
    }

    async fn stop(&self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        self.state.queue.close();
        let task = {
            let mut slot = self.state.task.lock().expect("task lock");
            slot.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        self.state.connected.store(false, Ordering::SeqCst);
    }

    fn prepare_stop(&self, handler: PrepareStopHandler, _service: ServiceId) {
        self.state.queue.prepare_stop(handler);
    }

    fn send(&self, data: Bytes) -> bool {
        self.state.queue.enqueue(data, true)
    }

    fn send_to(&self, _target: &EndpointDefinition, data: Bytes) -> bool {
        self.send(data)
    }

    fn flush(&self) {
        self.state.queue.flush();
    }

    fn is_established(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    fn is_reliable(&self) -> bool {
        true
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
            warn!(remote = %self.state.remote, %err, "TCP client restart failed");
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
