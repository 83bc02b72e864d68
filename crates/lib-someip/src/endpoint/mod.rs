use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::types::ServiceId;

mod framing;
mod manager;
mod queue;
mod tcp_client;
mod tcp_server;
mod tp;
mod udp_client;
mod udp_server;
mod virtual_server;

pub use framing::*;
pub use manager::*;
pub use queue::*;
pub use tcp_client::*;
pub use tcp_server::*;
pub use tp::*;
pub use udp_client::*;
pub use udp_server::*;
pub use virtual_server::*;

#[derive(Debug, Error)]
pub enum EndpointError {
    #[error("Endpoint is already running")]
    AlreadyRunning,

    #[error("Endpoint is not connected")]
    NotConnected,

    #[error("Maximum reconnect attempts reached ({0})")]
    ReconnectsExhausted(u32),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Remote target of a send, used as a value type inside subscription
/// records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointDefinition {
    pub address: SocketAddr,
    pub reliable: bool,
}

impl EndpointDefinition {
    pub fn new(address: SocketAddr, reliable: bool) -> Self {
        Self { address, reliable }
    }
}

/// Where a message entered the process; routing resolves the instance
/// by (service, receiver port).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Receiver {
    pub local_port: u16,
    pub reliable: bool,
}

/// Consumer of decoded frames delivered by endpoints. The routing manager
/// is the only production implementation.
pub trait MessageSink: Send + Sync {
    fn on_message(
        &self,
        data: Bytes,
        receiver: Receiver,
        remote: SocketAddr,
        is_multicast: bool,
    );
}

pub type ErrorHandler = Box<dyn Fn() + Send + Sync>;
pub type PrepareStopHandler = Box<dyn FnOnce() + Send>;

/// The endpoint capability set. Server endpoints address peers through
/// [`Endpoint::send_to`]; client endpoints have a fixed remote and use
/// [`Endpoint::send`]. Send admission never blocks: `false` means the
/// queue rejected the buffer.
#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn start(&self) -> Result<(), EndpointError>;

    async fn stop(&self);

    /// Requests a graceful shutdown. The handler fires once the last
    /// queued buffer has been handed to the wire, letting callers unwind
    /// dependent state deterministically.
    fn prepare_stop(&self, handler: PrepareStopHandler, service: ServiceId);

    fn send(&self, data: Bytes) -> bool;

    fn send_to(&self, target: &EndpointDefinition, data: Bytes) -> bool;

    /// Seals the current coalescing train so it goes out with the next
    /// writer wakeup.
    fn flush(&self);

    fn is_established(&self) -> bool;

    fn is_reliable(&self) -> bool;

    fn is_local(&self) -> bool;

    fn local_port(&self) -> u16;

    fn register_error_handler(&self, handler: ErrorHandler);

    async fn restart(&self);

    fn increment_use_count(&self);

    fn decrement_use_count(&self);

    fn use_count(&self) -> u32;

    fn queue_size(&self) -> usize;
}
