//! End-to-end negotiation flows through `SfuManager` with the loopback engine

use huddle_sfu::engine::{EngineConfig, LoopbackEngine, RtpCapabilities};
use huddle_sfu::protocol::{ConsumeParams, ConsumerParams, InboundEnvelope};
use huddle_sfu::{
    ClientRequest, ConsumerId, MediaKind, OutboundEnvelope, PeerChannel, PeerId, ProducerId,
    Result, ServerMessage, SfuConfig, SfuManager, SignalError, TransportId,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

struct TestPeer {
    id: PeerId,
    rx: mpsc::Receiver<OutboundEnvelope>,
}

impl TestPeer {
    async fn connect(manager: &SfuManager) -> Self {
        let (channel, mut rx) = PeerChannel::bounded(32);
        let id = manager.connect(channel).unwrap();
        let greeting = rx.recv().await.unwrap();
        assert!(matches!(greeting.message, ServerMessage::ConnectionSuccess { .. }));
        Self { id, rx }
    }

    async fn next_notification(&mut self) -> ServerMessage {
        tokio::time::timeout(Duration::from_secs(1), self.rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("channel closed")
            .message
    }

    fn assert_no_notification(&mut self) {
        assert!(self.rx.try_recv().is_err(), "unexpected notification");
    }
}

struct Harness {
    manager: Arc<SfuManager>,
    engine: LoopbackEngine,
}

fn request(event: &str, data: Value) -> ClientRequest {
    let envelope = InboundEnvelope {
        event: event.to_string(),
        data,
        request_id: None,
    };
    ClientRequest::from_envelope(&envelope).unwrap()
}

fn dtls() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD:EF" }]
    })
}

impl Harness {
    fn new() -> Self {
        Self::with_config(SfuConfig::default())
    }

    fn with_config(config: SfuConfig) -> Self {
        let engine = LoopbackEngine::new(EngineConfig::default());
        let manager = SfuManager::new(config, Arc::new(engine.clone()));
        Self { manager, engine }
    }

    async fn call(&self, peer: &TestPeer, event: &str, data: Value) -> Result<ServerMessage> {
        self.manager.handle_request(&peer.id, request(event, data)).await
    }

    async fn join(&self, peer: &TestPeer, room: &str) -> (RtpCapabilities, bool) {
        match self.call(peer, "join-room", json!({ "roomName": room })).await.unwrap() {
            ServerMessage::JoinRoomCallback {
                rtp_capabilities,
                is_admin,
            } => (rtp_capabilities, is_admin),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    async fn send_transport(&self, peer: &TestPeer) -> TransportId {
        let reply = self
            .call(peer, "create-web-rtc-transport", json!({ "consumer": false }))
            .await
            .unwrap();
        let ServerMessage::CreateWebRtcTransportCallback { params } = reply else {
            panic!("unexpected reply {reply:?}");
        };
        self.call(peer, "transport-connect", json!({ "dtlsParameters": dtls() }))
            .await
            .unwrap();
        params.id
    }

    async fn produce(&self, peer: &TestPeer, kind: MediaKind) -> (ProducerId, bool) {
        let reply = self
            .call(
                peer,
                "transport-produce",
                json!({ "kind": kind, "rtpParameters": { "mid": "0" }, "appData": {} }),
            )
            .await
            .unwrap();
        match reply {
            ServerMessage::TransportProduceCallback {
                id,
                producers_exist,
            } => (id, producers_exist),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    async fn create_recv_transport(&self, peer: &TestPeer, producer_id: &ProducerId) -> Result<TransportId> {
        let reply = self
            .call(
                peer,
                "create-web-rtc-transport",
                json!({ "consumer": true, "remoteProducerId": producer_id }),
            )
            .await?;
        match reply {
            ServerMessage::WebRtcTransportConsumerCallback {
                params,
                remote_producer_id,
            } => {
                assert_eq!(&remote_producer_id, producer_id);
                Ok(params.id)
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    async fn recv_transport(&self, peer: &TestPeer, producer_id: &ProducerId) -> TransportId {
        let transport_id = self.create_recv_transport(peer, producer_id).await.unwrap();
        self.call(
            peer,
            "transport-recv-connect",
            json!({ "dtlsParameters": dtls(), "serverConsumerTransportId": transport_id }),
        )
        .await
        .unwrap();
        transport_id
    }

    async fn consume(
        &self,
        peer: &TestPeer,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        caps: &RtpCapabilities,
    ) -> Result<ConsumerParams> {
        let reply = self
            .call(
                peer,
                "consume",
                json!({
                    "rtpCapabilities": caps,
                    "remoteProducerId": producer_id,
                    "serverConsumerTransportId": transport_id,
                }),
            )
            .await?;
        match reply {
            ServerMessage::ConsumeCallback {
                params: ConsumeParams::Consumer(params),
            } => Ok(params),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    async fn resume(&self, peer: &TestPeer, consumer_id: &ConsumerId) -> Result<ServerMessage> {
        self.call(peer, "consumer-resume", json!({ "serverConsumerId": consumer_id }))
            .await
    }
}

#[tokio::test]
async fn test_peers_in_same_room_share_capabilities() {
    let h = Harness::new();
    let a = TestPeer::connect(&h.manager).await;
    let b = TestPeer::connect(&h.manager).await;

    let (caps_a, admin_a) = h.join(&a, "r1").await;
    let (caps_b, admin_b) = h.join(&b, " r1 ").await;

    assert_eq!(caps_a, caps_b);
    assert!(admin_a);
    assert!(!admin_b);
    assert_eq!(h.manager.stats().rooms, 1);
    assert_eq!(h.engine.stats().routers_created, 1);
}

#[tokio::test]
async fn test_join_twice_is_rejected() {
    let h = Harness::new();
    let a = TestPeer::connect(&h.manager).await;
    h.join(&a, "r1").await;

    let err = h
        .call(&a, "join-room", json!({ "roomName": "r2" }))
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::AlreadyJoined(room) if room == "r1"));
    assert_eq!(h.manager.stats().rooms, 1);
}

#[tokio::test]
async fn test_produce_without_room_fails() {
    let h = Harness::new();
    let a = TestPeer::connect(&h.manager).await;

    let err = h
        .call(
            &a,
            "transport-produce",
            json!({ "kind": "video", "rtpParameters": {} }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::InvalidState(_)));

    let err = h
        .call(&a, "create-web-rtc-transport", json!({ "consumer": false }))
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::InvalidState(_)));

    assert_eq!(h.manager.stats().producers, 0);
    assert_eq!(h.engine.stats().producers_created, 0);
}

#[tokio::test]
async fn test_produce_requires_connected_send_transport() {
    let h = Harness::new();
    let a = TestPeer::connect(&h.manager).await;
    h.join(&a, "r1").await;
    h.call(&a, "create-web-rtc-transport", json!({ "consumer": false }))
        .await
        .unwrap();

    let err = h
        .call(&a, "transport-produce", json!({ "kind": "audio", "rtpParameters": {} }))
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::InvalidState(_)));

    let err = h
        .call(&a, "create-web-rtc-transport", json!({ "consumer": false }))
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::InvalidState(_)));
}

#[tokio::test]
async fn test_transport_connect_only_once() {
    let h = Harness::new();
    let a = TestPeer::connect(&h.manager).await;
    h.join(&a, "r1").await;
    let transport_id = h.send_transport(&a).await;

    let err = h
        .call(
            &a,
            "transport-connect",
            json!({ "dtlsParameters": dtls(), "transportId": transport_id }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::InvalidState(_)));
    assert_eq!(h.engine.stats().transports_connected, 1);

    // Another peer cannot see the transport at all
    let b = TestPeer::connect(&h.manager).await;
    h.join(&b, "r1").await;
    let err = h
        .call(
            &b,
            "transport-connect",
            json!({ "dtlsParameters": dtls(), "transportId": transport_id }),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::NotFound(_)));
}

#[tokio::test]
async fn test_new_producer_reaches_only_same_room() {
    let h = Harness::new();
    let mut a = TestPeer::connect(&h.manager).await;
    let mut b = TestPeer::connect(&h.manager).await;
    let mut c = TestPeer::connect(&h.manager).await;
    h.join(&a, "r1").await;
    h.join(&b, "r1").await;
    h.join(&c, "r2").await;

    h.send_transport(&a).await;
    let (producer_id, producers_exist) = h.produce(&a, MediaKind::Video).await;
    assert!(!producers_exist);

    assert_eq!(
        b.next_notification().await,
        ServerMessage::NewProducer {
            producer_id: producer_id.clone()
        }
    );
    b.assert_no_notification();
    a.assert_no_notification();
    c.assert_no_notification();

    h.send_transport(&b).await;
    let (_, producers_exist) = h.produce(&b, MediaKind::Audio).await;
    assert!(producers_exist);
}

#[tokio::test]
async fn test_consume_unknown_producer_not_found() {
    let h = Harness::new();
    let a = TestPeer::connect(&h.manager).await;
    let b = TestPeer::connect(&h.manager).await;
    let c = TestPeer::connect(&h.manager).await;
    h.join(&a, "r1").await;
    let (caps, _) = h.join(&b, "r1").await;
    h.join(&c, "r2").await;

    h.send_transport(&a).await;
    let (producer_id, _) = h.produce(&a, MediaKind::Video).await;
    let transport_id = h.recv_transport(&b, &producer_id).await;

    let err = h
        .consume(&b, &transport_id, &ProducerId::from("missing"), &caps)
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::NotFound(_)));

    // Producers in other rooms are invisible
    let err = h.create_recv_transport(&c, &producer_id).await.unwrap_err();
    assert!(matches!(err, SignalError::NotFound(_)));

    assert_eq!(h.manager.stats().consumers, 0);
    assert_eq!(h.engine.stats().consumers_created, 0);
}

#[tokio::test]
async fn test_consume_with_incompatible_capabilities() {
    let h = Harness::new();
    let a = TestPeer::connect(&h.manager).await;
    let b = TestPeer::connect(&h.manager).await;
    h.join(&a, "r1").await;
    h.join(&b, "r1").await;
    h.send_transport(&a).await;
    let (producer_id, _) = h.produce(&a, MediaKind::Video).await;
    let transport_id = h.recv_transport(&b, &producer_id).await;

    let audio_only = RtpCapabilities {
        codecs: EngineConfig::default()
            .media_codecs
            .into_iter()
            .filter(|codec| codec.kind == MediaKind::Audio)
            .collect(),
        header_extensions: Vec::new(),
    };
    let raw = json!({
        "event": "consume",
        "data": {
            "rtpCapabilities": audio_only,
            "remoteProducerId": producer_id,
            "serverConsumerTransportId": transport_id,
        },
        "requestId": 11
    })
    .to_string();

    let reply = h.manager.handle_message(&b.id, &raw).await;
    let value: Value = serde_json::from_str(&reply.to_json().unwrap()).unwrap();
    assert_eq!(value["event"], "consume-callback");
    assert!(value["data"]["params"]["error"].is_string());
    assert_eq!(value["requestId"], 11);
    assert_eq!(h.manager.stats().consumers, 0);
}

#[tokio::test]
async fn test_concurrent_consumer_negotiation_is_deduplicated() {
    let h = Harness::new();
    let a = TestPeer::connect(&h.manager).await;
    let b = TestPeer::connect(&h.manager).await;
    h.join(&a, "r1").await;
    let (caps, _) = h.join(&b, "r1").await;
    h.send_transport(&a).await;
    let (producer_id, _) = h.produce(&a, MediaKind::Video).await;

    let (first, second) = tokio::join!(
        h.create_recv_transport(&b, &producer_id),
        h.create_recv_transport(&b, &producer_id)
    );
    let transport_id = match (first, second) {
        (Ok(id), Err(SignalError::InvalidState(_))) | (Err(SignalError::InvalidState(_)), Ok(id)) => id,
        other => panic!("expected exactly one transport, got {other:?}"),
    };
    h.call(
        &b,
        "transport-recv-connect",
        json!({ "dtlsParameters": dtls(), "serverConsumerTransportId": transport_id }),
    )
    .await
    .unwrap();

    let (first, second) = tokio::join!(
        h.consume(&b, &transport_id, &producer_id, &caps),
        h.consume(&b, &transport_id, &producer_id, &caps)
    );
    assert!(first.is_ok() != second.is_ok());

    let stats = h.manager.stats();
    assert_eq!(stats.transports, 2);
    assert_eq!(stats.consumers, 1);
    assert_eq!(h.engine.stats().consumers_created, 1);
}

#[tokio::test]
async fn test_consumer_starts_paused_and_resumes_once() {
    let h = Harness::new();
    let a = TestPeer::connect(&h.manager).await;
    let b = TestPeer::connect(&h.manager).await;
    h.join(&a, "r1").await;
    let (caps, _) = h.join(&b, "r1").await;
    h.send_transport(&a).await;
    let (producer_id, _) = h.produce(&a, MediaKind::Video).await;
    let transport_id = h.recv_transport(&b, &producer_id).await;

    let params = h.consume(&b, &transport_id, &producer_id, &caps).await.unwrap();
    assert!(params.paused);
    assert_eq!(params.id, params.server_consumer_id);
    assert_eq!(params.kind, MediaKind::Video);
    assert_eq!(h.engine.stats().consumer_resumes, 0);

    let err = h.resume(&b, &ConsumerId::from("unknown")).await.unwrap_err();
    assert!(matches!(err, SignalError::NotFound(_)));

    // Only the owner may resume
    let err = h.resume(&a, &params.id).await.unwrap_err();
    assert!(matches!(err, SignalError::NotFound(_)));

    let reply = h.resume(&b, &params.id).await.unwrap();
    assert_eq!(
        reply,
        ServerMessage::ConsumerResumeCallback {
            server_consumer_id: params.id.clone()
        }
    );
    assert_eq!(h.engine.stats().consumer_resumes, 1);

    let err = h.resume(&b, &params.id).await.unwrap_err();
    assert!(matches!(err, SignalError::InvalidState(_)));
    assert_eq!(h.engine.stats().consumer_resumes, 1);
}

#[tokio::test]
async fn test_consume_before_recv_connect_is_rejected() {
    let h = Harness::new();
    let a = TestPeer::connect(&h.manager).await;
    let b = TestPeer::connect(&h.manager).await;
    h.join(&a, "r1").await;
    let (caps, _) = h.join(&b, "r1").await;
    h.send_transport(&a).await;
    let (producer_id, _) = h.produce(&a, MediaKind::Video).await;
    let transport_id = h.create_recv_transport(&b, &producer_id).await.unwrap();

    let err = h
        .consume(&b, &transport_id, &producer_id, &caps)
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::InvalidState(_)));
}

#[tokio::test]
async fn test_disconnect_cascades_to_consumers() {
    let h = Harness::new();
    let a = TestPeer::connect(&h.manager).await;
    let mut b = TestPeer::connect(&h.manager).await;
    h.join(&a, "r1").await;
    let (caps, _) = h.join(&b, "r1").await;
    h.send_transport(&a).await;
    let (producer_id, _) = h.produce(&a, MediaKind::Video).await;
    assert!(matches!(b.next_notification().await, ServerMessage::NewProducer { .. }));

    let transport_id = h.recv_transport(&b, &producer_id).await;
    h.consume(&b, &transport_id, &producer_id, &caps).await.unwrap();

    assert!(h.manager.disconnect(&a.id));

    assert_eq!(
        b.next_notification().await,
        ServerMessage::ProducerClosed {
            remote_producer_id: producer_id.clone()
        }
    );

    let stats = h.manager.stats();
    assert_eq!(stats.peers, 1);
    assert_eq!(stats.rooms, 1);
    assert_eq!(stats.transports, 0);
    assert_eq!(stats.producers, 0);
    assert_eq!(stats.consumers, 0);

    let engine = h.engine.stats();
    assert_eq!(engine.producers_closed, 1);
    assert_eq!(engine.consumers_closed, 1);
    assert_eq!(engine.transports_closed, 2);

    // Second disconnect is a no-op
    assert!(!h.manager.disconnect(&a.id));
    let reply = h.call(&b, "get-producers", Value::Null).await.unwrap();
    assert_eq!(
        reply,
        ServerMessage::GetProducersCallback {
            producer_list: Vec::new()
        }
    );

    // Engine-driven close arrives after the cascade and finds nothing left
    tokio::time::sleep(Duration::from_millis(20)).await;
    b.assert_no_notification();
}

#[tokio::test]
async fn test_empty_room_is_closed() {
    let h = Harness::new();
    let a = TestPeer::connect(&h.manager).await;
    h.join(&a, "r1").await;
    h.send_transport(&a).await;

    h.manager.disconnect(&a.id);
    assert_eq!(h.manager.stats().rooms, 0);
    assert_eq!(h.engine.stats().routers_closed, 1);

    let b = TestPeer::connect(&h.manager).await;
    let (_, is_admin) = h.join(&b, "r1").await;
    assert!(is_admin);
    assert_eq!(h.engine.stats().routers_created, 2);
}

#[tokio::test]
async fn test_room_capacity() {
    let h = Harness::with_config(SfuConfig {
        max_peers_per_room: 1,
        ..SfuConfig::default()
    });
    let a = TestPeer::connect(&h.manager).await;
    let b = TestPeer::connect(&h.manager).await;
    h.join(&a, "r1").await;

    let err = h
        .call(&b, "join-room", json!({ "roomName": "r1" }))
        .await
        .unwrap_err();
    assert!(matches!(err, SignalError::CapacityExceeded(_)));

    // The rejected peer can still join elsewhere
    h.join(&b, "r2").await;
}

#[tokio::test]
async fn test_two_peer_room_scenario() {
    let h = Harness::new();
    let p1 = TestPeer::connect(&h.manager).await;
    let (caps_p1, _) = h.join(&p1, "r1").await;
    h.send_transport(&p1).await;
    let (producer_id, _) = h.produce(&p1, MediaKind::Video).await;

    let p2 = TestPeer::connect(&h.manager).await;
    let (caps_p2, _) = h.join(&p2, "r1").await;
    assert_eq!(caps_p1, caps_p2);

    let reply = h.call(&p2, "get-producers", json!({})).await.unwrap();
    assert_eq!(
        reply,
        ServerMessage::GetProducersCallback {
            producer_list: vec![producer_id.clone()]
        }
    );

    let transport_id = h.recv_transport(&p2, &producer_id).await;
    let params = h
        .consume(&p2, &transport_id, &producer_id, &caps_p2)
        .await
        .unwrap();
    assert!(params.paused);
    assert_eq!(params.producer_id, producer_id);

    h.resume(&p2, &params.id).await.unwrap();
    assert_eq!(h.engine.stats().consumer_resumes, 1);
}
