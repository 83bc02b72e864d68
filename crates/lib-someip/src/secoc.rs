use bytes::Bytes;
use thiserror::Error;

use crate::types::{InstanceId, MethodId, ServiceId};

/// Opaque per-PDU state handed back by the runtime on context creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduContext {
    pub service: ServiceId,
    pub instance: InstanceId,
    pub method: MethodId,
    pub freshness: u64,
}

#[derive(Debug, Error)]
pub enum SecocError {
    #[error("Verification failed for [{0:04x}.{1:04x}.{2:04x}]")]
    VerificationFailed(ServiceId, InstanceId, MethodId),

    #[error("No context for [{0:04x}.{1:04x}.{2:04x}]")]
    NoContext(ServiceId, InstanceId, MethodId),
}

/// Pluggable SecOC MAC engine. The endpoint layer calls `authenticate` on
/// egress and `verify` on ingress for configured PDUs; the shipped default
/// passes traffic through untouched.
pub trait SecocRuntime: Send + Sync {
    fn create_context(
        &self,
        service: ServiceId,
        instance: InstanceId,
        method: MethodId,
    ) -> PduContext;

    fn is_secured(&self, service: ServiceId, instance: InstanceId, method: MethodId) -> bool;

    fn authenticate(&self, plaintext: Bytes, context: &PduContext) -> Bytes;

    fn verify(&self, secured: Bytes, context: &PduContext) -> Result<Bytes, SecocError>;
}

/// Runtime used when no SecOC engine is plugged in.
#[derive(Debug, Default)]
pub struct PassThroughSecoc;

impl SecocRuntime for PassThroughSecoc {
    fn create_context(
        &self,
        service: ServiceId,
        instance: InstanceId,
        method: MethodId,
    ) -> PduContext {
        PduContext {
            service,
            instance,
            method,
            freshness: 0,
        }
    }

    fn is_secured(&self, _service: ServiceId, _instance: InstanceId, _method: MethodId) -> bool {
        false
    }

    fn authenticate(&self, plaintext: Bytes, _context: &PduContext) -> Bytes {
        plaintext
    }

    fn verify(&self, secured: Bytes, _context: &PduContext) -> Result<Bytes, SecocError> {
        Ok(secured)
    }
}
