use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::types::{ClientId, InstanceId, MajorVersion, MinorVersion, ServiceId, ServiceInstance};

/// Offer / stop-offer commands are serialized per (service, instance):
/// only the queue head may be processed, followers wait until the head
/// completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferKind {
    Offer,
    StopOffer,
}

#[derive(Debug, Clone)]
pub struct OfferCommand {
    pub kind: OfferKind,
    pub client: ClientId,
    pub major: MajorVersion,
    pub minor: MinorVersion,
}

/// The per-instance command queues of §"pending-offer arbitration".
#[derive(Debug, Default)]
pub struct OfferCommandQueue {
    queues: HashMap<ServiceInstance, VecDeque<OfferCommand>>,
}

impl OfferCommandQueue {
    /// Appends a command. Returns `true` when the caller may process it
    /// immediately, `false` when it is queued behind an in-flight one.
    pub fn insert(&mut self, service: ServiceId, instance: InstanceId, command: OfferCommand) -> bool {
        let queue = self.queues.entry((service, instance)).or_default();
        let must_process = queue.is_empty();
        queue.push_back(command);
        must_process
    }

    /// Removes the processed head and returns the next command to run,
    /// if any.
    pub fn erase(&mut self, service: ServiceId, instance: InstanceId) -> Option<OfferCommand> {
        let queue = self.queues.get_mut(&(service, instance))?;
        queue.pop_front();
        let next = queue.front().cloned();
        if queue.is_empty() {
            self.queues.remove(&(service, instance));
        }
        next
    }

    /// Drops a whole queue; used when a suspend forcibly clears offers.
    pub fn clear(&mut self, service: ServiceId, instance: InstanceId) {
        self.queues.remove(&(service, instance));
    }

    pub fn in_flight(&self, service: ServiceId, instance: InstanceId) -> bool {
        self.queues
            .get(&(service, instance))
            .map(|queue| !queue.is_empty())
            .unwrap_or(false)
    }
}

/// A second process claimed an instance already owned by another live
/// client; the owner is being pinged.
#[derive(Debug, Clone)]
pub struct PendingOffer {
    pub major: MajorVersion,
    pub minor: MinorVersion,
    /// The client that wants to take over.
    pub claimant: ClientId,
    /// The current owner being probed.
    pub pinged: ClientId,
    pub deadline: Instant,
}

#[derive(Debug, Default)]
pub struct PendingOfferTable {
    offers: HashMap<ServiceInstance, PendingOffer>,
}

impl PendingOfferTable {
    pub fn insert(&mut self, service: ServiceId, instance: InstanceId, offer: PendingOffer) {
        self.offers.insert((service, instance), offer);
    }

    pub fn get(&self, service: ServiceId, instance: InstanceId) -> Option<&PendingOffer> {
        self.offers.get(&(service, instance))
    }

    pub fn remove(&mut self, service: ServiceId, instance: InstanceId) -> Option<PendingOffer> {
        self.offers.remove(&(service, instance))
    }

    /// A pong from `client` proves it alive: every claim against it is
    /// rejected. Returns the rejected claims for logging.
    pub fn reject_claims_against(
        &mut self,
        client: ClientId,
    ) -> Vec<(ServiceInstance, PendingOffer)> {
        let rejected: Vec<ServiceInstance> = self
            .offers
            .iter()
            .filter(|(_, offer)| offer.pinged == client)
            .map(|(key, _)| *key)
            .collect();
        rejected
            .into_iter()
            .filter_map(|key| self.offers.remove(&key).map(|offer| (key, offer)))
            .collect()
    }

    /// The probed owner died or the probe timed out: its claims are
    /// promoted. Returns the offers to replay.
    pub fn promote_claims_against(
        &mut self,
        client: ClientId,
    ) -> Vec<(ServiceInstance, PendingOffer)> {
        let promoted: Vec<ServiceInstance> = self
            .offers
            .iter()
            .filter(|(_, offer)| offer.pinged == client)
            .map(|(key, _)| *key)
            .collect();
        promoted
            .into_iter()
            .filter_map(|key| self.offers.remove(&key).map(|offer| (key, offer)))
            .collect()
    }

    /// Drops every claim made by `client`; used when the claimant itself
    /// dies while its probe is outstanding.
    pub fn drop_claims_by(&mut self, client: ClientId) {
        self.offers.retain(|_, offer| offer.claimant != client);
    }

    /// Probes whose deadline passed without a pong. The claims are
    /// rejected, matching the "probe failed" semantics.
    pub fn expired(&mut self, now: Instant) -> Vec<(ServiceInstance, PendingOffer)> {
        let expired: Vec<ServiceInstance> = self
            .offers
            .iter()
            .filter(|(_, offer)| offer.deadline <= now)
            .map(|(key, _)| *key)
            .collect();
        expired
            .into_iter()
            .filter_map(|key| self.offers.remove(&key).map(|offer| (key, offer)))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.offers.is_empty()
    }
}

/// A local subscription waiting for its remote service to appear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSubscription {
    pub client: ClientId,
    pub service: ServiceId,
    pub instance: InstanceId,
    pub eventgroup: u16,
    pub major: MajorVersion,
    pub event: u16,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn offer(client: ClientId) -> OfferCommand {
        OfferCommand {
            kind: OfferKind::Offer,
            client,
            major: 1,
            minor: 0,
        }
    }

    #[test]
    fn only_head_is_processed() {
        let mut queue = OfferCommandQueue::default();
        assert!(queue.insert(1, 1, offer(0x10)));
        assert!(!queue.insert(1, 1, offer(0x11)));
        assert!(queue.insert(1, 2, offer(0x12)));

        // completing the head surfaces the queued command
        let next = queue.erase(1, 1).unwrap();
        assert_eq!(next.client, 0x11);
        assert!(queue.erase(1, 1).is_none());
        assert!(!queue.in_flight(1, 1));
    }

    #[test]
    fn pong_rejects_claims() {
        let mut table = PendingOfferTable::default();
        table.insert(
            1,
            1,
            PendingOffer {
                major: 1,
                minor: 0,
                claimant: 0x11,
                pinged: 0x10,
                deadline: Instant::now() + Duration::from_secs(5),
            },
        );

        let rejected = table.reject_claims_against(0x10);
        assert_eq!(rejected.len(), 1);
        assert_eq!(rejected[0].1.claimant, 0x11);
        assert!(table.is_empty());
    }

    #[test]
    fn timeout_rejects_probe() {
        let mut table = PendingOfferTable::default();
        let now = Instant::now();
        table.insert(
            1,
            1,
            PendingOffer {
                major: 1,
                minor: 0,
                claimant: 0x11,
                pinged: 0x10,
                deadline: now,
            },
        );

        assert_eq!(table.expired(now + Duration::from_millis(1)).len(), 1);
        assert!(table.is_empty());
    }
}
