use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::ClientId;
use crate::wire::BufferError;

mod client_id;
mod command;

pub use client_id::*;
pub use command::*;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed command: {0}")]
    Malformed(#[from] BufferError),

    #[error("Frame of {0} bytes exceeds the local message limit")]
    Oversized(usize),

    #[error("Connection closed")]
    Closed,

    #[error("First frame was not a registration")]
    NotRegistered,

    #[error("No free client id in the pool")]
    NoFreeClientId,

    #[error("Client id pool is locked by another process")]
    PoolLocked,
}

/// Broker-side handle to one connected application. Frames pushed here
/// are written by the connection's writer task in order.
pub struct LocalClientHandle {
    client: AtomicU16,
    name: Mutex<String>,
    tx: mpsc::Sender<Bytes>,
    connected: AtomicBool,
    last_pong: Mutex<Instant>,
}

impl LocalClientHandle {
    fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            client: AtomicU16::new(0),
            name: Mutex::new(String::new()),
            tx,
            connected: AtomicBool::new(true),
            last_pong: Mutex::new(Instant::now()),
        }
    }

    pub fn client(&self) -> ClientId {
        self.client.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> String {
        self.name.lock().expect("name lock").clone()
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Non-blocking admission, mirroring the network endpoints.
    pub fn send_command(&self, command: &Command) -> bool {
        if !self.is_connected() {
            return false;
        }
        self.tx.try_send(command.to_frame()).is_ok()
    }

    pub fn record_pong(&self) {
        *self.last_pong.lock().expect("pong lock") = Instant::now();
    }

    pub fn last_pong(&self) -> Instant {
        *self.last_pong.lock().expect("pong lock")
    }
}

/// Receiver of everything arriving over the local transport; implemented
/// by the routing manager.
pub trait TransportHandler: Send + Sync {
    /// Registration; the returned id is acknowledged to the application.
    fn on_register(
        &self,
        requested: ClientId,
        name: &str,
        handle: &Arc<LocalClientHandle>,
    ) -> Result<ClientId, TransportError>;

    fn on_command(&self, handle: &Arc<LocalClientHandle>, command: Command);

    fn on_disconnect(&self, client: ClientId);
}

/// The broker end of the local transport: a Unix socket every local
/// application connects to. Message boundaries and per-connection order
/// are guaranteed by the frame protocol; a lost connection is the death
/// of the peer.
pub struct LocalTransportServer {
    path: PathBuf,
    max_frame: usize,
    queue_depth: usize,
    handler: Mutex<Option<Arc<dyn TransportHandler>>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl LocalTransportServer {
    pub fn new<P: AsRef<Path>>(path: P, max_frame: usize, queue_depth: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_frame,
            queue_depth,
            handler: Mutex::new(None),
            accept_task: Mutex::new(None),
        }
    }

    pub fn set_handler(&self, handler: Arc<dyn TransportHandler>) {
        let mut slot = self.handler.lock().expect("handler lock");
        *slot = Some(handler);
    }

    fn handler(&self) -> Arc<dyn TransportHandler> {
        self.handler
            .lock()
            .expect("handler lock")
            .clone()
            .expect("local transport used before set_handler")
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), TransportError> {
        // A stale socket from a dead broker would fail the bind.
        let _ = std::fs::remove_file(&self.path);
        let listener = UnixListener::bind(&self.path)?;
        info!(path = %self.path.display(), "local transport listening");

        let this = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let this = this.clone();
                        tokio::spawn(async move {
                            this.serve_connection(stream).await;
                        });
                    }
                    Err(err) => {
                        warn!(%err, "local transport accept failed");
                        return;
                    }
                }
            }
        });

        let mut slot = self.accept_task.lock().expect("accept task lock");
        *slot = Some(task);
        Ok(())
    }

    pub fn stop(&self) {
        let task = {
            let mut slot = self.accept_task.lock().expect("accept task lock");
            slot.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        let _ = std::fs::remove_file(&self.path);
    }

    async fn serve_connection(&self, stream: UnixStream) {
        let (mut read_half, mut write_half) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Bytes>(self.queue_depth);
        let handle = Arc::new(LocalClientHandle::new(tx));
        let handler = self.handler();

        let writer: JoinHandle<()> = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if write_half.write_all(&frame).await.is_err() {
                    return;
                }
            }
        });

        // The first frame must register the application.
        match read_frame(&mut read_half, self.max_frame).await {
            Ok(Command::RegisterApplication { client, name }) => {
                match handler.on_register(client, &name, &handle) {
                    Ok(assigned) => {
                        handle.client.store(assigned, Ordering::SeqCst);
                        *handle.name.lock().expect("name lock") = name.clone();
                        handle.send_command(&Command::RegisterAck { client: assigned });
                        info!(client = assigned, name, "application registered");
                    }
                    Err(err) => {
                        warn!(%err, "registration rejected");
                        writer.abort();
                        return;
                    }
                }
            }
            Ok(_) | Err(_) => {
                debug!("connection closed before registration");
                writer.abort();
                return;
            }
        }

        loop {
            match read_frame(&mut read_half, self.max_frame).await {
                Ok(command) => handler.on_command(&handle, command),
                Err(TransportError::Closed) => break,
                Err(err) => {
                    warn!(client = handle.client(), %err, "local transport receive failed");
                    break;
                }
            }
        }

        handle.connected.store(false, Ordering::SeqCst);
        writer.abort();
        handler.on_disconnect(handle.client());
    }
}

/// Application-side connector. The per-application client library is a
/// separate concern; this thin client is what the broker's own host
/// process and the test harnesses use.
pub struct LocalTransportClient {
    client: ClientId,
    tx: mpsc::Sender<Bytes>,
    tasks: Vec<JoinHandle<()>>,
}

impl LocalTransportClient {
    /// Connects, registers and returns the command stream from the
    /// broker.
    pub async fn connect<P: AsRef<Path>>(
        path: P,
        requested: ClientId,
        name: &str,
        max_frame: usize,
    ) -> Result<(Self, mpsc::Receiver<Command>), TransportError> {
        let stream = UnixStream::connect(path.as_ref()).await?;
        let (mut read_half, mut write_half) = stream.into_split();

        let register = Command::RegisterApplication {
            client: requested,
            name: name.into(),
        };
        write_half.write_all(&register.to_frame()).await?;

        let client = match read_frame(&mut read_half, max_frame).await? {
            Command::RegisterAck { client } => client,
            _ => return Err(TransportError::NotRegistered),
        };

        let (tx, mut out_rx) = mpsc::channel::<Bytes>(64);
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if write_half.write_all(&frame).await.is_err() {
                    return;
                }
            }
        });

        let (in_tx, in_rx) = mpsc::channel::<Command>(64);
        let reader = tokio::spawn(async move {
            loop {
                match read_frame(&mut read_half, max_frame).await {
                    Ok(command) => {
                        if in_tx.send(command).await.is_err() {
                            return;
                        }
                    }
                    Err(_) => return,
                }
            }
        });

        Ok((
            Self {
                client,
                tx,
                tasks: vec![writer, reader],
            },
            in_rx,
        ))
    }

    pub fn client(&self) -> ClientId {
        self.client
    }

    pub async fn send(&self, command: &Command) -> Result<(), TransportError> {
        self.tx
            .send(command.to_frame())
            .await
            .map_err(|_| TransportError::Closed)
    }

    pub fn try_send(&self, command: &Command) -> bool {
        self.tx.try_send(command.to_frame()).is_ok()
    }
}

impl Drop for LocalTransportClient {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame: usize,
) -> Result<Command, TransportError> {
    let mut length_bytes = [0u8; 4];
    if reader.read_exact(&mut length_bytes).await.is_err() {
        return Err(TransportError::Closed);
    }
    let length = u32::from_be_bytes(length_bytes) as usize;
    if length == 0 || length > max_frame {
        return Err(TransportError::Oversized(length));
    }

    let mut body = vec![0u8; length];
    if reader.read_exact(&mut body).await.is_err() {
        return Err(TransportError::Closed);
    }
    Command::from_body(&body)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    impl TransportHandler for EchoHandler {
        fn on_register(
            &self,
            requested: ClientId,
            _name: &str,
            _handle: &Arc<LocalClientHandle>,
        ) -> Result<ClientId, TransportError> {
            Ok(if requested != 0 { requested } else { 0x0101 })
        }

        fn on_command(&self, handle: &Arc<LocalClientHandle>, command: Command) {
            if let Command::Ping = command {
                handle.send_command(&Command::Pong {
                    client: handle.client(),
                });
            }
        }

        fn on_disconnect(&self, _client: ClientId) {}
    }

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("someip-test-transport-{name}"))
    }

    #[tokio::test]
    async fn register_and_ping_pong() {
        let path = socket_path("ping");
        let server = Arc::new(LocalTransportServer::new(&path, 1024 * 1024, 16));
        server.set_handler(Arc::new(EchoHandler));
        server.start().await.unwrap();

        let (client, mut rx) =
            LocalTransportClient::connect(&path, 0, "tester", 1024 * 1024)
                .await
                .unwrap();
        assert_eq!(client.client(), 0x0101);

        client.send(&Command::Ping).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply, Command::Pong { client: 0x0101 });

        server.stop();
    }

    #[tokio::test]
    async fn requested_id_is_honored() {
        let path = socket_path("fixed-id");
        let server = Arc::new(LocalTransportServer::new(&path, 1024 * 1024, 16));
        server.set_handler(Arc::new(EchoHandler));
        server.start().await.unwrap();

        let (client, _rx) =
            LocalTransportClient::connect(&path, 0x0777, "fixed", 1024 * 1024)
                .await
                .unwrap();
        assert_eq!(client.client(), 0x0777);

        server.stop();
    }
}
