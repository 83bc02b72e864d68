use crate::routing::{Availability, RoutingState};
use crate::security::SecClient;
use crate::types::{
    ClientId, EventgroupId, EventId, InstanceId, MajorVersion, MinorVersion, ServiceId,
    SomeIpMessage,
};

/// Callback handed to [`Host::on_subscription`]; the application answers
/// asynchronously with accept (`true`) or reject (`false`).
pub type SubscriptionReply = Box<dyn FnOnce(bool) + Send>;

/// Status reported back to subscribers once the remote side answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Acknowledged,
    Nacked,
}

/// The application embedding the routing manager. The daemon implements
/// this with logging stubs; test harnesses implement it to observe the
/// broker.
pub trait Host: Send + Sync {
    /// A message destined for the host application itself.
    fn on_message(&self, instance: InstanceId, message: SomeIpMessage);

    fn on_availability(
        &self,
        service: ServiceId,
        instance: InstanceId,
        availability: Availability,
        major: MajorVersion,
        minor: MinorVersion,
    );

    /// A remote or local peer wants to (un)subscribe to an eventgroup the
    /// host provides. The decision is returned through `reply`.
    fn on_subscription(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        client: ClientId,
        sec_client: &SecClient,
        is_subscribe: bool,
        reply: SubscriptionReply,
    );

    fn on_state(&self, state: RoutingState);

    fn on_subscription_status(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
        status: SubscriptionStatus,
    );
}

/// Host that accepts every subscription and logs everything else. Used by
/// the daemon, which hosts no services of its own.
#[derive(Debug, Default)]
pub struct DefaultHost;

impl Host for DefaultHost {
    fn on_message(&self, instance: InstanceId, message: SomeIpMessage) {
        tracing::debug!(instance, header = %message.header, "message for routing host");
    }

    fn on_availability(
        &self,
        service: ServiceId,
        instance: InstanceId,
        availability: Availability,
        _major: MajorVersion,
        _minor: MinorVersion,
    ) {
        tracing::debug!(service, instance, ?availability, "availability");
    }

    fn on_subscription(
        &self,
        _service: ServiceId,
        _instance: InstanceId,
        _eventgroup: EventgroupId,
        _client: ClientId,
        _sec_client: &SecClient,
        _is_subscribe: bool,
        reply: SubscriptionReply,
    ) {
        reply(true);
    }

    fn on_state(&self, state: RoutingState) {
        tracing::info!(%state, "routing state");
    }

    fn on_subscription_status(
        &self,
        service: ServiceId,
        instance: InstanceId,
        eventgroup: EventgroupId,
        event: EventId,
        status: SubscriptionStatus,
    ) {
        tracing::debug!(service, instance, eventgroup, event, ?status, "subscription status");
    }
}
