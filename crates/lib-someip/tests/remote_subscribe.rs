//! Remote SubscribeEventgroup processing at the providing host: the
//! owning application decides, subscriber endpoints are recorded, and a
//! TTL-0 entry for an unknown subscriber stays a no-op.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use someip::e2e::NoProtection;
use someip::endpoint::EndpointDefinition;
use someip::registry::RemoteSubscription;
use someip::routing::RoutingManager;
use someip::transport::{Command, LocalTransportClient};
use someip::{AllowAll, Config, DefaultHost};

const SERVICE: u16 = 0x1122;
const INSTANCE: u16 = 0x0001;
const EVENTGROUP: u16 = 0x1000;

fn test_config(name: &str) -> Config {
    let mut cfg = Config::default();
    cfg.network = format!("test-{}-{}", name, std::process::id());
    cfg.sd.enabled = false;
    cfg
}

fn subscriber() -> RemoteSubscription {
    RemoteSubscription {
        reliable: None,
        unreliable: Some(EndpointDefinition::new(
            "10.0.0.9:40002".parse().unwrap(),
            false,
        )),
        counter: 0,
    }
}

#[tokio::test]
async fn provider_decides_remote_subscription() {
    let routing = RoutingManager::new(
        test_config("remote-sub"),
        Arc::new(DefaultHost),
        Arc::new(AllowAll),
        Arc::new(NoProtection),
    );
    routing.start().await.unwrap();

    let (provider, mut provider_rx) =
        LocalTransportClient::connect(routing.config().routing_socket(), 0, "provider", 1 << 20)
            .await
            .unwrap();
    provider
        .send(&Command::OfferService {
            client: 0,
            service: SERVICE,
            instance: INSTANCE,
            major: 1,
            minor: 0,
        })
        .await
        .unwrap();

    // Wait until the offer is processed.
    timeout(Duration::from_secs(5), async {
        while routing.offered_services().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    routing.on_remote_subscribe(
        SERVICE,
        INSTANCE,
        EVENTGROUP,
        1,
        0,
        3,
        subscriber(),
        "10.0.0.9:30490".parse().unwrap(),
    );

    // The provider application is asked and accepts.
    let ask = timeout(Duration::from_secs(5), async {
        loop {
            match provider_rx.recv().await {
                Some(Command::Subscribe { pending, .. }) => break pending,
                Some(_) => continue,
                None => panic!("transport closed"),
            }
        }
    })
    .await
    .unwrap();
    provider
        .send(&Command::SubscribeAck {
            client: 0,
            service: SERVICE,
            instance: INSTANCE,
            eventgroup: EVENTGROUP,
            event: 0,
            pending: ask,
        })
        .await
        .unwrap();

    timeout(Duration::from_secs(5), async {
        loop {
            let subscribed = routing
                .registry()
                .find_eventgroup(SERVICE, INSTANCE, EVENTGROUP)
                .map(|group| group.has_remote_subscriptions())
                .unwrap_or(false);
            if subscribed {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("remote subscription should be recorded");

    routing.shutdown().await;
}

#[tokio::test]
async fn ttl_zero_for_unknown_subscriber_is_a_noop() {
    let routing = RoutingManager::new(
        test_config("remote-unsub"),
        Arc::new(DefaultHost),
        Arc::new(AllowAll),
        Arc::new(NoProtection),
    );
    routing.start().await.unwrap();

    let (provider, _provider_rx) =
        LocalTransportClient::connect(routing.config().routing_socket(), 0, "provider", 1 << 20)
            .await
            .unwrap();
    provider
        .send(&Command::OfferService {
            client: 0,
            service: SERVICE,
            instance: INSTANCE,
            major: 1,
            minor: 0,
        })
        .await
        .unwrap();
    timeout(Duration::from_secs(5), async {
        while routing.offered_services().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    routing.on_remote_subscribe(
        SERVICE,
        INSTANCE,
        EVENTGROUP,
        1,
        0,
        0,
        subscriber(),
        "10.0.0.9:30490".parse().unwrap(),
    );

    tokio::time::sleep(Duration::from_millis(100)).await;
    let has_subscription = routing
        .registry()
        .find_eventgroup(SERVICE, INSTANCE, EVENTGROUP)
        .map(|group| group.has_remote_subscriptions())
        .unwrap_or(false);
    assert!(!has_subscription);

    routing.shutdown().await;
}
