//! Magic-cookie resynchronization on a live TCP server endpoint.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use someip::endpoint::{Endpoint, MessageSink, Receiver, TcpServerEndpoint};
use someip::types::{MessageType, SomeIpHeader, SomeIpMessage};
use someip::{Config, CLIENT_COOKIE};

struct Capture {
    messages: Mutex<Vec<Bytes>>,
    notify: tokio::sync::Notify,
}

impl MessageSink for Capture {
    fn on_message(&self, data: Bytes, _receiver: Receiver, _remote: SocketAddr, _multicast: bool) {
        self.messages.lock().unwrap().push(data);
        self.notify.notify_waiters();
    }
}

fn request(service: u16, payload: &'static [u8]) -> Bytes {
    let mut header = SomeIpHeader::new(service, 0x0001);
    header.message_type = MessageType::RequestNoReturn;
    SomeIpMessage::new(header, Bytes::from_static(payload)).to_bytes()
}

#[tokio::test]
async fn garbage_between_frames_is_skipped_via_magic_cookie() {
    let sink = Arc::new(Capture {
        messages: Mutex::new(Vec::new()),
        notify: tokio::sync::Notify::new(),
    });

    let config = Config::default().endpoints;
    let local: SocketAddr = "127.0.0.1:0".parse().unwrap();
    // Bind an ephemeral port by probing; the endpoint itself needs a
    // fixed address, so reserve one first.
    let probe = tokio::net::TcpListener::bind(local).await.unwrap();
    let addr = probe.local_addr().unwrap();
    drop(probe);

    let endpoint = TcpServerEndpoint::new(addr, &config, sink.clone());
    endpoint.start().await.expect("endpoint start");

    let mut stream = TcpStream::connect(addr).await.unwrap();

    let first = request(0x1111, &[1, 2, 3]);
    let second = request(0x2222, &[4, 5]);

    stream.write_all(&first).await.unwrap();
    stream.write_all(&[0xDE, 0xAD, 0x00, 0x00]).await.unwrap();
    stream.write_all(&CLIENT_COOKIE).await.unwrap();
    stream.write_all(&second).await.unwrap();
    stream.flush().await.unwrap();

    timeout(Duration::from_secs(5), async {
        loop {
            if sink.messages.lock().unwrap().len() >= 2 {
                break;
            }
            let _ = timeout(Duration::from_millis(100), sink.notify.notified()).await;
        }
    })
    .await
    .expect("both frames should be delivered");

    let messages = sink.messages.lock().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(&messages[0][..], &first[..]);
    assert_eq!(&messages[1][..], &second[..]);

    endpoint.stop().await;
}
