//! Duplicate-offer arbitration: a second claim on a live instance is
//! probed via ping/pong and rejected while the owner answers; a dead
//! owner's claim is promoted.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use someip::e2e::NoProtection;
use someip::routing::RoutingManager;
use someip::transport::{Command, LocalTransportClient};
use someip::{AllowAll, Config, DefaultHost};

const SERVICE: u16 = 0xABCD;
const INSTANCE: u16 = 0x0001;

fn test_config(name: &str) -> Config {
    let mut cfg = Config::default();
    cfg.network = format!("test-{}-{}", name, std::process::id());
    cfg.sd.enabled = false;
    cfg
}

async fn offer(client: &LocalTransportClient) {
    client
        .send(&Command::OfferService {
            client: 0,
            service: SERVICE,
            instance: INSTANCE,
            major: 1,
            minor: 0,
        })
        .await
        .unwrap();
}

#[tokio::test]
async fn duplicate_offer_is_rejected_while_owner_lives() {
    let routing = RoutingManager::new(
        test_config("arbitration"),
        Arc::new(DefaultHost),
        Arc::new(AllowAll),
        Arc::new(NoProtection),
    );
    routing.start().await.unwrap();
    let socket = routing.config().routing_socket();

    let (owner, mut owner_rx) = LocalTransportClient::connect(&socket, 0, "owner", 1 << 20)
        .await
        .unwrap();
    let (claimant, _claimant_rx) = LocalTransportClient::connect(&socket, 0, "claimant", 1 << 20)
        .await
        .unwrap();

    offer(&owner).await;
    // Give the first offer time to land before the conflicting one.
    tokio::time::sleep(Duration::from_millis(100)).await;
    offer(&claimant).await;

    // The broker probes the current owner; answering keeps ownership.
    let ping = timeout(Duration::from_secs(5), async {
        loop {
            match owner_rx.recv().await {
                Some(Command::Ping) => break true,
                Some(_) => continue,
                None => break false,
            }
        }
    })
    .await
    .expect("no ping within timeout");
    assert!(ping);

    owner
        .send(&Command::Pong {
            client: owner.client(),
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let offered = routing.offered_services();
    assert_eq!(offered.len(), 1);
    assert_eq!(offered[0].0, SERVICE);
    assert_eq!(offered[0].4, owner.client());

    routing.shutdown().await;
}

#[tokio::test]
async fn claim_is_promoted_when_owner_dies() {
    let routing = RoutingManager::new(
        test_config("promotion"),
        Arc::new(DefaultHost),
        Arc::new(AllowAll),
        Arc::new(NoProtection),
    );
    routing.start().await.unwrap();
    let socket = routing.config().routing_socket();

    let (owner, mut owner_rx) = LocalTransportClient::connect(&socket, 0, "owner", 1 << 20)
        .await
        .unwrap();
    let (claimant, _claimant_rx) = LocalTransportClient::connect(&socket, 0, "claimant", 1 << 20)
        .await
        .unwrap();
    let claimant_id = claimant.client();

    offer(&owner).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    offer(&claimant).await;

    // Wait for the probe, then die instead of answering.
    timeout(Duration::from_secs(5), async {
        loop {
            match owner_rx.recv().await {
                Some(Command::Ping) | None => break,
                Some(_) => continue,
            }
        }
    })
    .await
    .unwrap();
    drop(owner);
    drop(owner_rx);

    // The disconnect promotes the pending claim.
    let promoted = timeout(Duration::from_secs(5), async {
        loop {
            let offered = routing.offered_services();
            if offered.len() == 1 && offered[0].4 == claimant_id {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(promoted.is_ok(), "claim was not promoted to an offer");

    routing.shutdown().await;
}
