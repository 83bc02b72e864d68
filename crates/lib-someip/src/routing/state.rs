use std::fmt::Display;

/// Lifecycle state of the routing manager. Transitions are driven by
/// external commands (daemon signals or the local transport).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingState {
    /// Normal operation.
    Running,
    /// SD stopped, all local offers withdrawn, remote state expired.
    Suspended,
    /// Transitional state while re-offering after a suspend.
    Resumed,
    /// Only diagnosis-flagged services are served.
    Diagnosis,
}

impl Display for RoutingState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingState::Running => write!(f, "RUNNING"),
            RoutingState::Suspended => write!(f, "SUSPENDED"),
            RoutingState::Resumed => write!(f, "RESUMED"),
            RoutingState::Diagnosis => write!(f, "DIAGNOSIS"),
        }
    }
}

/// Availability of a service instance as seen by requesters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    Available,
    Unavailable,
}

/// Subscription state of one subscriber towards one eventgroup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    NotSubscribed,
    Subscribing,
    Acknowledged,
    Nacked,
}
