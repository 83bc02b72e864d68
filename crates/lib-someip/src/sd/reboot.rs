use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use crate::types::SessionId;

/// Outgoing SD session counters, kept per unicast peer plus one for the
/// multicast channel. Sessions start at 1; on wrap the reboot flag is
/// cleared for good.
#[derive(Debug, Default)]
pub struct SessionCounters {
    multicast: Counter,
    unicast: HashMap<SocketAddr, Counter>,
}

#[derive(Debug)]
struct Counter {
    next: SessionId,
    reboot: bool,
}

impl Default for Counter {
    fn default() -> Self {
        Self {
            next: 1,
            reboot: true,
        }
    }
}

impl Counter {
    fn advance(&mut self) -> (SessionId, bool) {
        let session = self.next;
        let reboot = self.reboot;
        self.next = self.next.wrapping_add(1);
        if self.next == 0 {
            // Wrapped; the reboot epoch is over.
            self.next = 1;
            self.reboot = false;
        }
        (session, reboot)
    }
}

impl SessionCounters {
    pub fn next_multicast(&mut self) -> (SessionId, bool) {
        self.multicast.advance()
    }

    pub fn next_unicast(&mut self, peer: SocketAddr) -> (SessionId, bool) {
        self.unicast.entry(peer).or_default().advance()
    }
}

/// Incoming session bookkeeping per (sender, channel). Detects peer
/// reboots and lost messages from the session/reboot-flag sequence.
#[derive(Debug, Default)]
pub struct RebootTracker {
    peers: HashMap<(IpAddr, bool), PeerSession>,
}

#[derive(Debug)]
struct PeerSession {
    reboot: bool,
    session: SessionId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCheck {
    Ok,
    /// Out-of-order session at the same reboot epoch.
    Loss,
    /// The sender restarted; all state learned from it is stale.
    Reboot,
}

impl RebootTracker {
    pub fn check(
        &mut self,
        sender: IpAddr,
        multicast: bool,
        reboot: bool,
        session: SessionId,
    ) -> SessionCheck {
        let key = (sender, multicast);
        let result = match self.peers.get(&key) {
            None => SessionCheck::Ok,
            Some(previous) => {
                if reboot && (!previous.reboot || session <= previous.session) {
                    // Reboot flag newly set, or a session regression
                    // while the flag is still set.
                    SessionCheck::Reboot
                } else if !reboot && previous.reboot {
                    // Flag cleared: normal wrap of the reboot epoch.
                    SessionCheck::Ok
                } else if session != previous.session.wrapping_add(1)
                    && !(previous.session == SessionId::MAX && session == 1)
                {
                    SessionCheck::Loss
                } else {
                    SessionCheck::Ok
                }
            }
        };

        self.peers.insert(key, PeerSession { reboot, session });
        result
    }

    /// Forgets a sender, e.g. after its services were invalidated.
    pub fn forget(&mut self, sender: IpAddr) {
        self.peers.retain(|(ip, _), _| *ip != sender);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip() -> IpAddr {
        "10.0.0.2".parse().unwrap()
    }

    #[test]
    fn session_counter_wraps_and_clears_reboot() {
        let mut counter = Counter::default();
        let (first, reboot) = counter.advance();
        assert_eq!(first, 1);
        assert!(reboot);

        counter.next = SessionId::MAX;
        let (last, _) = counter.advance();
        assert_eq!(last, SessionId::MAX);
        let (wrapped, reboot) = counter.advance();
        assert_eq!(wrapped, 1);
        assert!(!reboot);
    }

    #[test]
    fn detects_reboot_on_session_regression() {
        let mut tracker = RebootTracker::default();
        assert_eq!(tracker.check(ip(), true, true, 5), SessionCheck::Ok);
        assert_eq!(tracker.check(ip(), true, true, 6), SessionCheck::Ok);
        // restart: reboot flag set with a low session again
        assert_eq!(tracker.check(ip(), true, true, 1), SessionCheck::Reboot);
    }

    #[test]
    fn detects_loss_within_epoch() {
        let mut tracker = RebootTracker::default();
        assert_eq!(tracker.check(ip(), false, false, 1), SessionCheck::Ok);
        assert_eq!(tracker.check(ip(), false, false, 4), SessionCheck::Loss);
        assert_eq!(tracker.check(ip(), false, false, 5), SessionCheck::Ok);
    }

    #[test]
    fn channels_are_tracked_separately() {
        let mut tracker = RebootTracker::default();
        assert_eq!(tracker.check(ip(), true, false, 1), SessionCheck::Ok);
        assert_eq!(tracker.check(ip(), false, false, 1), SessionCheck::Ok);
    }
}
