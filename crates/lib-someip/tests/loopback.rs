//! Same-host routing through the broker: offer, subscribe, notify and
//! availability handling over the local transport.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::timeout;

use someip::e2e::NoProtection;
use someip::registry::{EventInfo, EventKind, Reliability};
use someip::routing::RoutingManager;
use someip::transport::{Command, LocalTransportClient};
use someip::types::{MessageType, SomeIpHeader, SomeIpMessage};
use someip::{AllowAll, Config, DefaultHost, Readable, ReadBuffer};

const SERVICE: u16 = 0x1234;
const INSTANCE: u16 = 0x5678;
const EVENT: u16 = 0x8001;
const EVENTGROUP: u16 = 0x4465;

fn test_config(name: &str) -> Config {
    let mut cfg = Config::default();
    cfg.network = format!("test-{}-{}", name, std::process::id());
    cfg.sd.enabled = false;
    cfg
}

async fn broker(name: &str) -> Arc<RoutingManager> {
    let routing = RoutingManager::new(
        test_config(name),
        Arc::new(DefaultHost),
        Arc::new(AllowAll),
        Arc::new(NoProtection),
    );
    routing.start().await.expect("broker start");
    routing
}

async fn connect(routing: &Arc<RoutingManager>, name: &str) -> (LocalTransportClient, tokio::sync::mpsc::Receiver<Command>) {
    LocalTransportClient::connect(routing.config().routing_socket(), 0, name, 1024 * 1024)
        .await
        .expect("transport connect")
}

async fn recv(rx: &mut tokio::sync::mpsc::Receiver<Command>) -> Command {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for command")
        .expect("transport closed")
}

/// Waits for the next command matching `predicate`, skipping others
/// (pings, version noise).
async fn recv_matching<F>(rx: &mut tokio::sync::mpsc::Receiver<Command>, predicate: F) -> Command
where
    F: Fn(&Command) -> bool,
{
    loop {
        let command = recv(rx).await;
        if predicate(&command) {
            return command;
        }
    }
}

fn notification(payload: &'static [u8]) -> Bytes {
    let mut header = SomeIpHeader::new(SERVICE, EVENT);
    header.message_type = MessageType::Notification;
    SomeIpMessage::new(header, Bytes::from_static(payload)).to_bytes()
}

#[tokio::test]
async fn loopback_notification_reaches_local_subscriber() {
    let routing = broker("loopback").await;

    routing.registry().register_event(
        EventInfo::new(SERVICE, INSTANCE, EVENT, EventKind::Field, Reliability::Unreliable, true),
        &[EVENTGROUP],
        1,
    );

    let (provider, mut provider_rx) = connect(&routing, "provider").await;
    let (consumer, mut consumer_rx) = connect(&routing, "consumer").await;

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

    consumer
        .send(&Command::RequestService {
            client: 0,
            service: SERVICE,
            instance: INSTANCE,
            major: 1,
            minor: 0,
        })
        .await
        .unwrap();
    let availability = recv_matching(&mut consumer_rx, |command| {
        matches!(command, Command::Availability { .. })
    })
    .await;
    assert!(matches!(
        availability,
        Command::Availability {
            service: SERVICE,
            instance: INSTANCE,
            available: true,
            ..
        }
    ));

    consumer
        .send(&Command::Subscribe {
            client: 0,
            service: SERVICE,
            instance: INSTANCE,
            eventgroup: EVENTGROUP,
            major: 1,
            event: 0,
            pending: 0,
        })
        .await
        .unwrap();

    // The provider application decides on the subscription.
    let ask = recv_matching(&mut provider_rx, |command| {
        matches!(command, Command::Subscribe { .. })
    })
    .await;
    let Command::Subscribe { client: subscriber, pending, .. } = ask else {
        unreachable!()
    };
    assert_eq!(subscriber, consumer.client());
    provider
        .send(&Command::SubscribeAck {
            client: subscriber,
            service: SERVICE,
            instance: INSTANCE,
            eventgroup: EVENTGROUP,
            event: 0,
            pending,
        })
        .await
        .unwrap();

    let status = recv_matching(&mut consumer_rx, |command| {
        matches!(command, Command::SubscriptionStatus { .. })
    })
    .await;
    assert!(matches!(
        status,
        Command::SubscriptionStatus { accepted: true, .. }
    ));

    // Publish and observe the fan-out.
    provider
        .send(&Command::Send {
            instance: INSTANCE,
            reliable: false,
            flush: true,
            payload: notification(&[0x00, 0x01, 0x02, 0x03, 0x04]),
        })
        .await
        .unwrap();

    let delivery = recv_matching(&mut consumer_rx, |command| {
        matches!(command, Command::Send { .. })
    })
    .await;
    let Command::Send { instance, payload, .. } = delivery else {
        unreachable!()
    };
    assert_eq!(instance, INSTANCE);

    let mut buf = ReadBuffer::new(&payload);
    let message = SomeIpMessage::read(&mut buf).unwrap();
    assert_eq!(message.header.service, SERVICE);
    assert_eq!(message.header.method, EVENT);
    assert_eq!(message.header.message_type, MessageType::Notification);
    assert_eq!(message.payload.len(), 5);
    assert_eq!(&message.payload[..], &[0x00, 0x01, 0x02, 0x03, 0x04]);

    routing.shutdown().await;
}

#[tokio::test]
async fn stop_offer_notifies_every_requester_once() {
    let routing = broker("stop-offer").await;

    let (provider, _provider_rx) = connect(&routing, "provider").await;
    let (first, mut first_rx) = connect(&routing, "first").await;
    let (second, mut second_rx) = connect(&routing, "second").await;

    provider
        .send(&Command::OfferService {
            client: 0,
            service: 0x2277,
            instance: 0x0022,
            major: 1,
            minor: 0,
        })
        .await
        .unwrap();

    for client in [&first, &second] {
        client
            .send(&Command::RequestService {
                client: 0,
                service: 0x2277,
                instance: 0x0022,
                major: 1,
                minor: 0,
            })
            .await
            .unwrap();
    }
    for rx in [&mut first_rx, &mut second_rx] {
        let availability = recv_matching(rx, |command| {
            matches!(command, Command::Availability { .. })
        })
        .await;
        assert!(matches!(availability, Command::Availability { available: true, .. }));
    }

    provider
        .send(&Command::StopOfferService {
            client: 0,
            service: 0x2277,
            instance: 0x0022,
            major: 1,
            minor: 0,
        })
        .await
        .unwrap();

    for rx in [&mut first_rx, &mut second_rx] {
        let availability = recv_matching(rx, |command| {
            matches!(command, Command::Availability { .. })
        })
        .await;
        assert!(matches!(
            availability,
            Command::Availability {
                service: 0x2277,
                available: false,
                ..
            }
        ));
    }

    // A renewed request must not observe the service as available.
    first
        .send(&Command::RequestService {
            client: 0,
            service: 0x2277,
            instance: 0x0022,
            major: 1,
            minor: 0,
        })
        .await
        .unwrap();
    let unexpected = timeout(Duration::from_millis(500), async {
        recv_matching(&mut first_rx, |command| {
            matches!(command, Command::Availability { available: true, .. })
        })
        .await
    })
    .await;
    assert!(unexpected.is_err(), "availability=true without a new offer");

    routing.shutdown().await;
}
