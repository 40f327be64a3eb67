//! Connection state machine against scripted streams

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio_test::io::Builder;

use super::*;
use crate::broker::Message;
use crate::protocol::{
    ConnAck, Connect, ConnectReturnCode, QoS, SubAck, SubAckReturnCode, Subscribe, Subscription,
};

fn addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 40000))
}

fn encode(packets: &[Packet]) -> Vec<u8> {
    let encoder = Encoder::new();
    let mut buf = BytesMut::new();
    for packet in packets {
        encoder.encode(packet, &mut buf).unwrap();
    }
    buf.to_vec()
}

fn connect(client_id: &str, clean_session: bool) -> Packet {
    Packet::Connect(Box::new(Connect {
        client_id: client_id.to_string(),
        clean_session,
        ..Default::default()
    }))
}

#[tokio::test]
async fn test_accept_then_eof() {
    let broker = Arc::new(Broker::default());
    let stream = Builder::new()
        .read(&encode(&[connect("c1", true)]))
        .write(&encode(&[Packet::ConnAck(ConnAck::accepted(false))]))
        .build();

    let mut conn = Connection::new(stream, addr(), Arc::clone(&broker));
    let result = conn.run().await;

    assert!(matches!(result, Err(ConnectionError::Io(_))));
    assert!(!broker.is_connected("c1"));
    assert!(broker.sessions().get("c1").is_none());
}

#[tokio::test]
async fn test_packets_pipelined_after_connect() {
    let broker = Arc::new(Broker::default());
    let stream = Builder::new()
        .read(&encode(&[connect("c1", true), Packet::PingReq]))
        .write(&encode(&[Packet::ConnAck(ConnAck::accepted(false))]))
        .write(&encode(&[Packet::PingResp]))
        .build();

    let mut conn = Connection::new(stream, addr(), broker);
    assert!(conn.run().await.is_err());
}

#[tokio::test]
async fn test_subscribe_then_disconnect() {
    let broker = Arc::new(Broker::default());
    let subscribe = Packet::Subscribe(Subscribe {
        packet_id: 1,
        subscriptions: vec![Subscription {
            filter: "a/+".to_string(),
            qos: QoS::AtLeastOnce,
        }],
    });
    let stream = Builder::new()
        .read(&encode(&[connect("keeper", false)]))
        .write(&encode(&[Packet::ConnAck(ConnAck::accepted(false))]))
        .read(&encode(&[subscribe, Packet::Disconnect]))
        .write(&encode(&[Packet::SubAck(SubAck {
            packet_id: 1,
            return_codes: vec![SubAckReturnCode::GrantedQoS1],
        })]))
        .build();

    let mut conn = Connection::new(stream, addr(), Arc::clone(&broker));
    assert!(conn.run().await.is_ok());

    // Persistent session outlives the connection
    assert!(!broker.is_connected("keeper"));
    let matches = broker.subscriptions().matches("a/b");
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].qos, QoS::AtLeastOnce);
}

#[tokio::test]
async fn test_empty_client_id_needs_clean_session() {
    let broker = Arc::new(Broker::default());
    let stream = Builder::new()
        .read(&encode(&[connect("", false)]))
        .write(&encode(&[Packet::ConnAck(ConnAck::refused(
            ConnectReturnCode::IdentifierRejected,
        ))]))
        .build();

    let mut conn = Connection::new(stream, addr(), Arc::clone(&broker));
    assert!(conn.run().await.is_err());
    assert_eq!(broker.session_count(), 0);
}

#[tokio::test]
async fn test_unsupported_protocol_level_refused() {
    let broker = Arc::new(Broker::default());
    // CONNECT "MQTT" level 5, clean session, keep alive 60, client id "x"
    let connect = [
        0x10, 13, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, 0x02, 0x00, 0x3C, 0x00, 0x01, b'x',
    ];
    let stream = Builder::new()
        .read(&connect)
        .write(&encode(&[Packet::ConnAck(ConnAck::refused(
            ConnectReturnCode::UnacceptableProtocolVersion,
        ))]))
        .build();

    let mut conn = Connection::new(stream, addr(), broker);
    assert!(matches!(
        conn.run().await,
        Err(ConnectionError::Protocol(ProtocolError::Decode(
            DecodeError::InvalidProtocolVersion(5)
        )))
    ));
}

#[tokio::test]
async fn test_first_packet_not_connect() {
    let broker = Arc::new(Broker::default());
    let stream = Builder::new().read(&encode(&[Packet::PingReq])).build();

    let mut conn = Connection::new(stream, addr(), broker);
    assert!(matches!(
        conn.run().await,
        Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(_)))
    ));
}

#[tokio::test]
async fn test_second_connect_is_violation() {
    let broker = Arc::new(Broker::default());
    let stream = Builder::new()
        .read(&encode(&[connect("twice", true)]))
        .write(&encode(&[Packet::ConnAck(ConnAck::accepted(false))]))
        .read(&encode(&[connect("twice", true)]))
        .build();

    let mut conn = Connection::new(stream, addr(), broker);
    assert!(matches!(
        conn.run().await,
        Err(ConnectionError::Protocol(ProtocolError::ProtocolViolation(_)))
    ));
}

#[tokio::test]
async fn test_queue_drained_on_next_outbound_wakeup() {
    let broker = Arc::new(Broker::default());
    let queued = Message {
        topic: Arc::from("q/1"),
        payload: bytes::Bytes::from_static(b"late"),
        qos: QoS::AtLeastOnce,
        retain: false,
    };
    let wakeup = Message {
        topic: Arc::from("z"),
        payload: bytes::Bytes::from_static(b"now"),
        qos: QoS::AtMostOnce,
        retain: false,
    };

    let stream = Builder::new()
        .read(&encode(&[connect("lag", false)]))
        .write(&encode(&[Packet::ConnAck(ConnAck::accepted(false))]))
        .wait(Duration::from_millis(200))
        .write(&encode(&[
            Packet::Publish(wakeup.to_publish(QoS::AtMostOnce, None, false)),
            Packet::Publish(queued.to_publish(QoS::AtLeastOnce, Some(1), false)),
        ]))
        .build();

    // Once connected: park a QoS 1 delivery in the session queue the way the
    // broker does for a full channel, then route an unrelated QoS 0 message
    let injector = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move {
            while !broker.is_connected("lag") {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            broker.sessions().add_subscription("lag", "q/#", QoS::AtLeastOnce);
            broker.sessions().add_subscription("lag", "z", QoS::AtMostOnce);
            broker
                .subscriptions()
                .add(&crate::topic::ClientTopic::new("lag", "z"))
                .unwrap();

            let message_ref = broker.messages().insert(queued, 1);
            assert!(broker.sessions().enqueue("lag", message_ref).is_none());
            broker.publish("z", wakeup.payload.clone(), QoS::AtMostOnce);
        })
    };

    let mut conn = Connection::new(stream, addr(), Arc::clone(&broker));
    assert!(matches!(conn.run().await, Err(ConnectionError::Io(_))));
    injector.await.unwrap();

    let session = broker.sessions().get("lag").unwrap();
    let s = session.lock();
    assert_eq!(s.delivery.queue_len(), 0);
    assert!(s.delivery.is_in_flight(1));
}

#[tokio::test]
async fn test_resume_drops_and_persists_in_flight_without_message() {
    use crate::hooks::DefaultHooks;
    use crate::persistence::{Collection, MemoryBackend, PersistenceManager, StorageBackend};
    use crate::session::MessageRef;

    let backend = Arc::new(MemoryBackend::new());
    let manager = Arc::new(PersistenceManager::new(
        backend.clone(),
        Duration::from_millis(10),
        1,
    ));
    let broker = Arc::new(Broker::with_persistence(
        Default::default(),
        Arc::new(DefaultHooks),
        manager,
    ));

    // In flight from a previous connection, but its message is gone
    broker.sessions().get_or_create("r", false);
    broker
        .sessions()
        .mark_in_flight("r", 5, MessageRef::from("gone".to_string()));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(backend.get(Collection::Inflight, "r").await.unwrap().is_some());

    let stream = Builder::new()
        .read(&encode(&[connect("r", false)]))
        .write(&encode(&[Packet::ConnAck(ConnAck::accepted(true))]))
        .build();
    let mut conn = Connection::new(stream, addr(), Arc::clone(&broker));
    assert!(matches!(conn.run().await, Err(ConnectionError::Io(_))));

    let session = broker.sessions().get("r").unwrap();
    assert!(!session.lock().delivery.is_in_flight(5));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(backend.get(Collection::Inflight, "r").await.unwrap().is_none());
}
