use crate::types::{ClientId, InstanceId, MethodId, ServiceId};

/// Identity of a peer as established by the local transport, used for
/// policy decisions. On Unix sockets this is filled from peer credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SecClient {
    pub uid: u32,
    pub gid: u32,
    pub client: ClientId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyDecision {
    Ok,
    Denied,
}

/// Pluggable security policy decision point. Denials are enforced by the
/// routing manager; the wire never reveals the policy outcome.
pub trait SecurityPolicy: Send + Sync {
    fn is_client_allowed_to_offer(
        &self,
        sec_client: &SecClient,
        service: ServiceId,
        instance: InstanceId,
    ) -> PolicyDecision;

    fn is_client_allowed_to_access_member(
        &self,
        sec_client: &SecClient,
        service: ServiceId,
        instance: InstanceId,
        method: MethodId,
    ) -> PolicyDecision;
}

/// Policy used when `security_enabled` is off.
#[derive(Debug, Default)]
pub struct AllowAll;

impl SecurityPolicy for AllowAll {
    fn is_client_allowed_to_offer(
        &self,
        _sec_client: &SecClient,
        _service: ServiceId,
        _instance: InstanceId,
    ) -> PolicyDecision {
        PolicyDecision::Ok
    }

    fn is_client_allowed_to_access_member(
        &self,
        _sec_client: &SecClient,
        _service: ServiceId,
        _instance: InstanceId,
        _method: MethodId,
    ) -> PolicyDecision {
        PolicyDecision::Ok
    }
}
