use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use crate::types::ServiceId;

use super::{
    Endpoint, EndpointDefinition, EndpointError, ErrorHandler, PrepareStopHandler,
};

/// Endpoint stand-in for services without configured ports. Such services
/// are reachable over the local transport only; every network operation
/// is accepted and discarded.
pub struct VirtualServerEndpoint {
    port: u16,
    reliable: bool,
    use_count: AtomicU32,
}

impl VirtualServerEndpoint {
    pub fn new(port: u16, reliable: bool) -> Self {
        Self {
            port,
            reliable,
            use_count: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Endpoint for VirtualServerEndpoint {
    async fn start(&self) -> Result<(), EndpointError> {
        Ok(())
    }

    async fn stop(&self) {}

    fn prepare_stop(&self, handler: PrepareStopHandler, _service: ServiceId) {
        // Nothing can be in flight.
        handler();
    }

    fn send(&self, _data: Bytes) -> bool {
        true
    }

    fn send_to(&self, _target: &EndpointDefinition, _data: Bytes) -> bool {
        true
    }

    fn flush(&self) {}

    fn is_established(&self) -> bool {
        true
    }

    fn is_reliable(&self) -> bool {
        self.reliable
    }

    fn is_local(&self) -> bool {
        true
    }

    fn local_port(&self) -> u16 {
        self.port
    }

    fn register_error_handler(&self, _handler: ErrorHandler) {}

    async fn restart(&self) {}

    fn increment_use_count(&self) {
        self.use_count.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_use_count(&self) {
        let previous = self.use_count.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0);
    }

    fn use_count(&self) -> u32 {
        self.use_count.load(Ordering::SeqCst)
    }

    fn queue_size(&self) -> usize {
        0
    }
}
