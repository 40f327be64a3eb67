//! Integration Tests for the VibeMQ core broker
//!
//! These tests run the real TCP accept loop and drive it with raw MQTT
//! clients built on the crate's own codec.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use pretty_assertions::assert_eq;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use vibemq_core::auth::AuthProvider;
use vibemq_core::broker::{Broker, BrokerConfig};
use vibemq_core::codec::{Decoder, Encoder};
use vibemq_core::config::{AuthConfig, UserConfig};
use vibemq_core::hooks::Hooks;
use vibemq_core::protocol::{
    ConnAck, Connect, ConnectReturnCode, Packet, ProtocolVersion, PubAck, PubComp, PubRec,
    PubRel, Publish, QoS, SubAck, SubAckReturnCode, Subscribe, Subscription, Unsubscribe, Will,
};
use vibemq_core::transport;

/// Start a broker on an ephemeral port
async fn start(config: BrokerConfig) -> (SocketAddr, Arc<Broker>) {
    start_with(Broker::new(config)).await
}

async fn start_with(broker: Broker) -> (SocketAddr, Arc<Broker>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let broker = Arc::new(broker);
    tokio::spawn(transport::serve(listener, Arc::clone(&broker)));
    (addr, broker)
}

/// Helper struct for MQTT client operations in tests
struct TestClient {
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    buf: BytesMut,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("Failed to connect");
        Self {
            stream,
            encoder: Encoder::new(),
            decoder: Decoder::new(),
            buf: BytesMut::with_capacity(4096),
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let mut buf = BytesMut::new();
        self.encoder
            .encode(packet, &mut buf)
            .expect("Failed to encode");
        self.stream.write_all(&buf).await.expect("Failed to write");
    }

    /// Next packet, or None on timeout or EOF
    async fn recv_within(&mut self, limit: Duration) -> Option<Packet> {
        loop {
            if let Some((packet, consumed)) = self.decoder.decode(&self.buf).expect("Bad packet") {
                self.buf.advance(consumed);
                return Some(packet);
            }
            match timeout(limit, self.stream.read_buf(&mut self.buf)).await {
                Ok(Ok(n)) if n > 0 => {}
                _ => return None,
            }
        }
    }

    async fn recv(&mut self) -> Option<Packet> {
        self.recv_within(Duration::from_secs(5)).await
    }

    async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Some(Packet::Publish(publish)) => publish,
            other => panic!("Expected PUBLISH, got {:?}", other),
        }
    }

    async fn connect_with(&mut self, connect: Connect) -> ConnAck {
        self.send(&Packet::Connect(Box::new(connect))).await;
        match self.recv().await {
            Some(Packet::ConnAck(ack)) => ack,
            other => panic!("Expected CONNACK, got {:?}", other),
        }
    }

    async fn mqtt_connect(&mut self, client_id: &str, clean_session: bool) -> ConnAck {
        self.connect_with(Connect {
            client_id: client_id.to_string(),
            clean_session,
            ..Default::default()
        })
        .await
    }

    async fn subscribe(&mut self, packet_id: u16, filter: &str, qos: QoS) -> SubAck {
        self.send(&Packet::Subscribe(Subscribe {
            packet_id,
            subscriptions: vec![Subscription {
                filter: filter.to_string(),
                qos,
            }],
        }))
        .await;

        match self.recv().await {
            Some(Packet::SubAck(ack)) => ack,
            other => panic!("Expected SUBACK, got {:?}", other),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS, packet_id: u16) {
        self.send(&Packet::Publish(Publish {
            qos,
            topic: Arc::from(topic),
            packet_id: (qos != QoS::AtMostOnce).then_some(packet_id),
            payload: Bytes::copy_from_slice(payload),
            ..Default::default()
        }))
        .await;
    }
}

// ============================================================================
// CONNECT/CONNACK
// ============================================================================

#[tokio::test]
async fn test_connect_success() {
    let (addr, broker) = start(BrokerConfig::default()).await;

    let mut client = TestClient::connect(addr).await;
    let connack = client.mqtt_connect("test-client", true).await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
    assert!(!connack.session_present);
    assert!(broker.is_connected("test-client"));
}

#[tokio::test]
async fn test_connect_v31_protocol_name() {
    let (addr, _broker) = start(BrokerConfig::default()).await;

    let mut client = TestClient::connect(addr).await;
    let connack = client
        .connect_with(Connect {
            protocol_version: ProtocolVersion::V31,
            client_id: "legacy".to_string(),
            ..Default::default()
        })
        .await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
}

#[tokio::test]
async fn test_connect_empty_client_id() {
    let (addr, broker) = start(BrokerConfig::default()).await;

    // Allowed with clean session; the broker assigns an ID
    let mut client = TestClient::connect(addr).await;
    let connack = client.mqtt_connect("", true).await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
    assert_eq!(broker.connection_count(), 1);

    // Rejected without clean session
    let mut client = TestClient::connect(addr).await;
    let connack = client.mqtt_connect("", false).await;
    assert_eq!(connack.return_code, ConnectReturnCode::IdentifierRejected);
    assert!(client.recv_within(Duration::from_secs(2)).await.is_none());
}

#[tokio::test]
async fn test_first_packet_must_be_connect() {
    let (addr, _broker) = start(BrokerConfig::default()).await;

    let mut client = TestClient::connect(addr).await;
    client.send(&Packet::PingReq).await;
    assert!(client.recv_within(Duration::from_secs(2)).await.is_none());
}

#[tokio::test]
async fn test_connect_bad_credentials() {
    let auth = AuthConfig {
        enabled: true,
        allow_anonymous: false,
        users: vec![UserConfig {
            username: "alice".to_string(),
            password: Some("secret".to_string()),
            password_hash: None,
            role: None,
        }],
    };
    let hooks: Arc<dyn Hooks> = Arc::new(AuthProvider::new(&auth));
    let (addr, _broker) = start_with(Broker::with_hooks(BrokerConfig::default(), hooks)).await;

    let mut client = TestClient::connect(addr).await;
    let connack = client
        .connect_with(Connect {
            client_id: "intruder".to_string(),
            username: Some("alice".to_string()),
            password: Some(Bytes::from_static(b"wrong")),
            ..Default::default()
        })
        .await;
    assert_eq!(connack.return_code, ConnectReturnCode::BadUsernameOrPassword);

    let mut client = TestClient::connect(addr).await;
    let connack = client
        .connect_with(Connect {
            client_id: "alice-1".to_string(),
            username: Some("alice".to_string()),
            password: Some(Bytes::from_static(b"secret")),
            ..Default::default()
        })
        .await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);
}

#[tokio::test]
async fn test_session_takeover_closes_previous() {
    let (addr, broker) = start(BrokerConfig::default()).await;

    let mut first = TestClient::connect(addr).await;
    first.mqtt_connect("duplicate-id", true).await;

    let mut second = TestClient::connect(addr).await;
    let connack = second.mqtt_connect("duplicate-id", true).await;
    assert_eq!(connack.return_code, ConnectReturnCode::Accepted);

    assert!(first.recv_within(Duration::from_secs(2)).await.is_none());
    assert_eq!(broker.connection_count(), 1);

    second.send(&Packet::PingReq).await;
    assert_eq!(second.recv().await, Some(Packet::PingResp));
}

// ============================================================================
// PUBLISH/SUBSCRIBE
// ============================================================================

#[tokio::test]
async fn test_wildcard_subscription_downgrades_qos() {
    let (addr, _broker) = start(BrokerConfig::default()).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("thermostat", true).await;
    let suback = subscriber.subscribe(1, "sensors/+/temp", QoS::AtLeastOnce).await;
    assert_eq!(suback.return_codes, vec![SubAckReturnCode::GrantedQoS1]);

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("sensor", true).await;
    publisher
        .publish("sensors/kitchen/temp", b"21.5", QoS::ExactlyOnce, 7)
        .await;
    assert_eq!(publisher.recv().await, Some(Packet::PubRec(PubRec::new(7))));

    let delivered = subscriber.recv_publish().await;
    assert_eq!(&*delivered.topic, "sensors/kitchen/temp");
    assert_eq!(delivered.qos, QoS::AtLeastOnce);
    assert_eq!(&delivered.payload[..], b"21.5");
    assert!(!delivered.retain);
    let packet_id = delivered.packet_id.expect("QoS 1 delivery has a packet id");
    subscriber
        .send(&Packet::PubAck(PubAck::new(packet_id)))
        .await;

    // Exactly one delivery
    assert!(subscriber
        .recv_within(Duration::from_millis(200))
        .await
        .is_none());

    publisher.send(&Packet::PubRel(PubRel::new(7))).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubComp(PubComp::new(7))));
}

#[tokio::test]
async fn test_qos0_flow() {
    let (addr, _broker) = start(BrokerConfig::default()).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("subscriber", true).await;
    subscriber.subscribe(1, "test/#", QoS::ExactlyOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("publisher", true).await;
    publisher.publish("test/topic", b"hello", QoS::AtMostOnce, 0).await;

    let delivered = subscriber.recv_publish().await;
    assert_eq!(delivered.qos, QoS::AtMostOnce);
    assert_eq!(delivered.packet_id, None);
    assert_eq!(&delivered.payload[..], b"hello");
}

#[tokio::test]
async fn test_qos2_outbound_flow() {
    let (addr, broker) = start(BrokerConfig::default()).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("q2-sub", true).await;
    subscriber.subscribe(1, "q2", QoS::ExactlyOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("q2-pub", true).await;
    publisher.publish("q2", b"once", QoS::ExactlyOnce, 1).await;

    let delivered = subscriber.recv_publish().await;
    assert_eq!(delivered.qos, QoS::ExactlyOnce);
    let packet_id = delivered.packet_id.unwrap();

    subscriber.send(&Packet::PubRec(PubRec::new(packet_id))).await;
    assert_eq!(
        subscriber.recv().await,
        Some(Packet::PubRel(PubRel::new(packet_id)))
    );
    subscriber
        .send(&Packet::PubComp(PubComp::new(packet_id)))
        .await;
    subscriber.send(&Packet::PingReq).await;
    assert_eq!(subscriber.recv().await, Some(Packet::PingResp));

    // PUBREC released the message; only the publisher's half is left
    let session = broker.sessions().get("q2-sub").unwrap();
    assert_eq!(session.lock().delivery.in_flight_len(), 0);
    assert!(session.lock().delivery.second_phase_ids().is_empty());
}

#[tokio::test]
async fn test_qos2_inbound_duplicate_routed_once() {
    let (addr, _broker) = start(BrokerConfig::default()).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("dedup-sub", true).await;
    subscriber.subscribe(1, "dedup", QoS::AtMostOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("dedup-pub", true).await;
    publisher.publish("dedup", b"1", QoS::ExactlyOnce, 9).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubRec(PubRec::new(9))));
    publisher.publish("dedup", b"1", QoS::ExactlyOnce, 9).await;
    assert_eq!(publisher.recv().await, Some(Packet::PubRec(PubRec::new(9))));

    subscriber.recv_publish().await;
    assert!(subscriber
        .recv_within(Duration::from_millis(200))
        .await
        .is_none());
}

#[tokio::test]
async fn test_subscribe_rejects_invalid_filter_and_caps_qos() {
    let config = BrokerConfig {
        max_qos: QoS::AtLeastOnce,
        ..Default::default()
    };
    let (addr, _broker) = start(config).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("filters", true).await;
    client
        .send(&Packet::Subscribe(Subscribe {
            packet_id: 3,
            subscriptions: vec![
                Subscription {
                    filter: "a/#/b".to_string(),
                    qos: QoS::AtLeastOnce,
                },
                Subscription {
                    filter: "a/+".to_string(),
                    qos: QoS::ExactlyOnce,
                },
            ],
        }))
        .await;

    match client.recv().await {
        Some(Packet::SubAck(ack)) => {
            assert_eq!(ack.packet_id, 3);
            assert_eq!(
                ack.return_codes,
                vec![SubAckReturnCode::Failure, SubAckReturnCode::GrantedQoS1]
            );
        }
        other => panic!("Expected SUBACK, got {:?}", other),
    }
}

#[tokio::test]
async fn test_unsubscribe() {
    let (addr, _broker) = start(BrokerConfig::default()).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("unsub", true).await;
    client.subscribe(1, "news", QoS::AtMostOnce).await;

    client
        .send(&Packet::Unsubscribe(Unsubscribe {
            packet_id: 2,
            filters: vec!["news".to_string()],
        }))
        .await;
    assert!(matches!(client.recv().await, Some(Packet::UnsubAck(ack)) if ack.packet_id == 2));

    client.publish("news", b"nobody listens", QoS::AtMostOnce, 0).await;
    assert!(client
        .recv_within(Duration::from_millis(200))
        .await
        .is_none());
}

#[tokio::test]
async fn test_ping_pong() {
    let (addr, _broker) = start(BrokerConfig::default()).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("pinger", true).await;
    client.send(&Packet::PingReq).await;
    assert_eq!(client.recv().await, Some(Packet::PingResp));
}

#[tokio::test]
async fn test_max_inflight_window() {
    let config = BrokerConfig {
        max_inflight: 1,
        ..Default::default()
    };
    let (addr, _broker) = start(config).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("slow", true).await;
    subscriber.subscribe(1, "work", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("fast", true).await;
    for (i, payload) in [b"1", b"2", b"3"].iter().enumerate() {
        publisher
            .publish("work", *payload, QoS::AtLeastOnce, i as u16 + 1)
            .await;
    }

    for expected in [b"1", b"2", b"3"] {
        let delivered = subscriber.recv_publish().await;
        assert_eq!(&delivered.payload[..], expected);
        // Nothing else until this one is acknowledged
        assert!(subscriber
            .recv_within(Duration::from_millis(100))
            .await
            .is_none());
        subscriber
            .send(&Packet::PubAck(PubAck::new(delivered.packet_id.unwrap())))
            .await;
    }
}

// ============================================================================
// Sessions and wills
// ============================================================================

#[tokio::test]
async fn test_persistent_session_queues_while_offline() {
    let (addr, _broker) = start(BrokerConfig::default()).await;

    let mut subscriber = TestClient::connect(addr).await;
    let connack = subscriber.mqtt_connect("durable", false).await;
    assert!(!connack.session_present);
    subscriber.subscribe(1, "orders/#", QoS::AtLeastOnce).await;
    subscriber.send(&Packet::Disconnect).await;
    drop(subscriber);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("shop", true).await;
    publisher.publish("orders/1", b"first", QoS::AtLeastOnce, 1).await;
    publisher.publish("orders/2", b"dropped", QoS::AtMostOnce, 0).await;
    publisher.publish("orders/3", b"second", QoS::ExactlyOnce, 2).await;
    assert!(matches!(publisher.recv().await, Some(Packet::PubAck(_))));
    assert!(matches!(publisher.recv().await, Some(Packet::PubRec(_))));

    let mut subscriber = TestClient::connect(addr).await;
    let connack = subscriber.mqtt_connect("durable", false).await;
    assert!(connack.session_present);

    let first = subscriber.recv_publish().await;
    assert_eq!(&first.payload[..], b"first");
    let second = subscriber.recv_publish().await;
    assert_eq!(&second.payload[..], b"second");
    assert_eq!(second.qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn test_unacknowledged_delivery_resent_with_dup() {
    let (addr, _broker) = start(BrokerConfig::default()).await;

    let mut subscriber = TestClient::connect(addr).await;
    subscriber.mqtt_connect("flaky", false).await;
    subscriber.subscribe(1, "jobs", QoS::AtLeastOnce).await;

    let mut publisher = TestClient::connect(addr).await;
    publisher.mqtt_connect("producer", true).await;
    publisher.publish("jobs", b"job-1", QoS::AtLeastOnce, 1).await;

    let original = subscriber.recv_publish().await;
    assert!(!original.dup);
    drop(subscriber);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut subscriber = TestClient::connect(addr).await;
    let connack = subscriber.mqtt_connect("flaky", false).await;
    assert!(connack.session_present);

    let resent = subscriber.recv_publish().await;
    assert!(resent.dup);
    assert_eq!(resent.packet_id, original.packet_id);
    assert_eq!(&resent.payload[..], b"job-1");
}

#[tokio::test]
async fn test_clean_session_discards_state() {
    let (addr, broker) = start(BrokerConfig::default()).await;

    let mut client = TestClient::connect(addr).await;
    client.mqtt_connect("forgetful", false).await;
    client.subscribe(1, "x", QoS::AtLeastOnce).await;
    client.send(&Packet::Disconnect).await;
    drop(client);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = TestClient::connect(addr).await;
    let connack = client.mqtt_connect("forgetful", true).await;
    assert!(!connack.session_present);
    assert!(broker.subscriptions().matches("x").is_empty());
}

#[tokio::test]
async fn test_will_published_on_abrupt_close() {
    let (addr, _broker) = start(BrokerConfig::default()).await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("watcher", true).await;
    watcher.subscribe(1, "status/+", QoS::AtLeastOnce).await;

    let mut device = TestClient::connect(addr).await;
    device
        .connect_with(Connect {
            client_id: "device".to_string(),
            will: Some(Will {
                topic: "status/device".to_string(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
            ..Default::default()
        })
        .await;
    drop(device);

    let will = watcher.recv_publish().await;
    assert_eq!(&*will.topic, "status/device");
    assert_eq!(&will.payload[..], b"offline");
    assert!(!will.retain);
}

#[tokio::test]
async fn test_will_discarded_on_graceful_disconnect() {
    let (addr, _broker) = start(BrokerConfig::default()).await;

    let mut watcher = TestClient::connect(addr).await;
    watcher.mqtt_connect("watcher", true).await;
    watcher.subscribe(1, "status/+", QoS::AtMostOnce).await;

    let mut device = TestClient::connect(addr).await;
    device
        .connect_with(Connect {
            client_id: "polite".to_string(),
            will: Some(Will {
                topic: "status/polite".to_string(),
                payload: Bytes::from_static(b"offline"),
                qos: QoS::AtMostOnce,
                retain: false,
            }),
            ..Default::default()
        })
        .await;
    device.send(&Packet::Disconnect).await;

    assert!(watcher
        .recv_within(Duration::from_millis(300))
        .await
        .is_none());
}
