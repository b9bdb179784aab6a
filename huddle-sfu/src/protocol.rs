//! Signaling wire protocol
//!
//! One message is one JSON object: `{ "event": string, "data": object }`, with
//! an optional `requestId` that the reply to that message echoes back.
//! Notifications (`new-producer`, `producer-closed`) never carry one.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::engine::{DtlsParameters, RtpCapabilities, RtpParameters, TransportParams};
use crate::error::{Result, SignalError};
use crate::types::{ConsumerId, MediaKind, PeerId, ProducerId, TransportId};

/// Event names on the wire
pub mod event {
    pub const CONNECTION_SUCCESS: &str = "connection-success";
    pub const JOIN_ROOM: &str = "join-room";
    pub const JOIN_ROOM_CALLBACK: &str = "join-room-callback";
    pub const CREATE_WEB_RTC_TRANSPORT: &str = "create-web-rtc-transport";
    pub const CREATE_WEB_RTC_TRANSPORT_CALLBACK: &str = "create-web-rtc-transport-callback";
    pub const WEB_RTC_TRANSPORT_CONSUMER_CALLBACK: &str = "web-rtc-consumer-callback";
    pub const TRANSPORT_CONNECT: &str = "transport-connect";
    pub const TRANSPORT_CONNECT_CALLBACK: &str = "transport-connect-callback";
    pub const TRANSPORT_RECV_CONNECT: &str = "transport-recv-connect";
    pub const TRANSPORT_RECV_CONNECT_CALLBACK: &str = "transport-recv-connect-callback";
    pub const TRANSPORT_PRODUCE: &str = "transport-produce";
    pub const TRANSPORT_PRODUCE_CALLBACK: &str = "transport-produce-callback";
    pub const GET_PRODUCERS: &str = "get-producers";
    /// Misspelling still sent by older clients
    pub const GET_PRODUCERS_ALIAS: &str = "get-proucers";
    pub const GET_PRODUCERS_CALLBACK: &str = "get-producers-callback";
    pub const CONSUME: &str = "consume";
    pub const CONSUME_CALLBACK: &str = "consume-callback";
    pub const CONSUMER_RESUME: &str = "consumer-resume";
    /// Short form used by some clients
    pub const CONSUMER_RESUME_ALIAS: &str = "resume";
    pub const CONSUMER_RESUME_CALLBACK: &str = "consumer-resume-callback";
    pub const NEW_PRODUCER: &str = "new-producer";
    pub const PRODUCER_CLOSED: &str = "producer-closed";
    pub const ERROR: &str = "error";
}

/// Raw inbound message before event-specific decoding
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InboundEnvelope {
    pub event: String,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub request_id: Option<Value>,
}

impl InboundEnvelope {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| SignalError::Protocol(format!("malformed envelope: {e}")))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoomRequest {
    pub room_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest {
    /// `true` allocates a recv transport for `remote_producer_id`
    #[serde(default)]
    pub consumer: bool,
    #[serde(default)]
    pub remote_producer_id: Option<ProducerId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConnectRequest {
    pub dtls_parameters: DtlsParameters,
    /// Defaults to the caller's send transport
    #[serde(default)]
    pub transport_id: Option<TransportId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportRecvConnectRequest {
    pub dtls_parameters: DtlsParameters,
    pub server_consumer_transport_id: TransportId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest {
    pub rtp_capabilities: RtpCapabilities,
    pub remote_producer_id: ProducerId,
    pub server_consumer_transport_id: TransportId,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerResumeRequest {
    pub server_consumer_id: ConsumerId,
}

/// A decoded client request
#[derive(Debug, Clone)]
pub enum ClientRequest {
    JoinRoom(JoinRoomRequest),
    CreateTransport(CreateTransportRequest),
    TransportConnect(TransportConnectRequest),
    TransportRecvConnect(TransportRecvConnectRequest),
    Produce(ProduceRequest),
    GetProducers,
    Consume(ConsumeRequest),
    ConsumerResume(ConsumerResumeRequest),
}

impl ClientRequest {
    pub fn from_envelope(envelope: &InboundEnvelope) -> Result<Self> {
        let data = &envelope.data;
        match envelope.event.as_str() {
            event::JOIN_ROOM => Ok(Self::JoinRoom(decode(event::JOIN_ROOM, data)?)),
            event::CREATE_WEB_RTC_TRANSPORT => Ok(Self::CreateTransport(decode(
                event::CREATE_WEB_RTC_TRANSPORT,
                data,
            )?)),
            event::TRANSPORT_CONNECT => Ok(Self::TransportConnect(decode(
                event::TRANSPORT_CONNECT,
                data,
            )?)),
            event::TRANSPORT_RECV_CONNECT => Ok(Self::TransportRecvConnect(decode(
                event::TRANSPORT_RECV_CONNECT,
                data,
            )?)),
            event::TRANSPORT_PRODUCE => Ok(Self::Produce(decode(event::TRANSPORT_PRODUCE, data)?)),
            event::GET_PRODUCERS | event::GET_PRODUCERS_ALIAS => Ok(Self::GetProducers),
            event::CONSUME => Ok(Self::Consume(decode(event::CONSUME, data)?)),
            event::CONSUMER_RESUME | event::CONSUMER_RESUME_ALIAS => Ok(Self::ConsumerResume(decode(
                event::CONSUMER_RESUME,
                data,
            )?)),
            other => Err(SignalError::Protocol(format!("unknown event `{other}`"))),
        }
    }

    #[must_use]
    pub const fn event(&self) -> &'static str {
        match self {
            Self::JoinRoom(_) => event::JOIN_ROOM,
            Self::CreateTransport(_) => event::CREATE_WEB_RTC_TRANSPORT,
            Self::TransportConnect(_) => event::TRANSPORT_CONNECT,
            Self::TransportRecvConnect(_) => event::TRANSPORT_RECV_CONNECT,
            Self::Produce(_) => event::TRANSPORT_PRODUCE,
            Self::GetProducers => event::GET_PRODUCERS,
            Self::Consume(_) => event::CONSUME,
            Self::ConsumerResume(_) => event::CONSUMER_RESUME,
        }
    }
}

fn decode<T: DeserializeOwned>(event: &str, data: &Value) -> Result<T> {
    let data = if data.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        data.clone()
    };
    serde_json::from_value(data)
        .map_err(|e| SignalError::Protocol(format!("invalid `{event}` payload: {e}")))
}

/// Negotiation parameters for a freshly created consumer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub server_consumer_id: ConsumerId,
    pub paused: bool,
}

/// `consume-callback` params: either the consumer or an error tag
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ConsumeParams {
    Consumer(ConsumerParams),
    Rejected { error: String },
}

/// Every message the server sends
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerMessage {
    #[serde(rename = "connection-success", rename_all = "camelCase")]
    ConnectionSuccess { peer_id: PeerId },

    #[serde(rename = "join-room-callback", rename_all = "camelCase")]
    JoinRoomCallback {
        rtp_capabilities: RtpCapabilities,
        is_admin: bool,
    },

    #[serde(rename = "create-web-rtc-transport-callback")]
    CreateWebRtcTransportCallback { params: TransportParams },

    #[serde(rename = "web-rtc-consumer-callback", rename_all = "camelCase")]
    WebRtcTransportConsumerCallback {
        params: TransportParams,
        remote_producer_id: ProducerId,
    },

    #[serde(rename = "transport-connect-callback", rename_all = "camelCase")]
    TransportConnectCallback { transport_id: TransportId },

    #[serde(rename = "transport-recv-connect-callback", rename_all = "camelCase")]
    TransportRecvConnectCallback { transport_id: TransportId },

    #[serde(rename = "transport-produce-callback", rename_all = "camelCase")]
    TransportProduceCallback {
        id: ProducerId,
        producers_exist: bool,
    },

    #[serde(rename = "get-producers-callback", rename_all = "camelCase")]
    GetProducersCallback { producer_list: Vec<ProducerId> },

    #[serde(rename = "consume-callback")]
    ConsumeCallback { params: ConsumeParams },

    #[serde(rename = "consumer-resume-callback", rename_all = "camelCase")]
    ConsumerResumeCallback { server_consumer_id: ConsumerId },

    #[serde(rename = "new-producer", rename_all = "camelCase")]
    NewProducer { producer_id: ProducerId },

    #[serde(rename = "producer-closed", rename_all = "camelCase")]
    ProducerClosed { remote_producer_id: ProducerId },

    #[serde(rename = "error")]
    Error {
        code: String,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        event: Option<String>,
    },
}

impl ServerMessage {
    /// Reply for a failed request.
    ///
    /// A capability mismatch on CONSUME is answered with error-tagged consume
    /// params; everything else becomes an `error` envelope.
    #[must_use]
    pub fn from_error(err: &SignalError, event: Option<&str>) -> Self {
        match err {
            SignalError::Incompatible(_) => Self::ConsumeCallback {
                params: ConsumeParams::Rejected {
                    error: err.to_string(),
                },
            },
            _ => Self::Error {
                code: err.code().to_string(),
                message: err.to_string(),
                event: event.map(str::to_string),
            },
        }
    }

    #[must_use]
    pub const fn event(&self) -> &'static str {
        match self {
            Self::ConnectionSuccess { .. } => event::CONNECTION_SUCCESS,
            Self::JoinRoomCallback { .. } => event::JOIN_ROOM_CALLBACK,
            Self::CreateWebRtcTransportCallback { .. } => event::CREATE_WEB_RTC_TRANSPORT_CALLBACK,
            Self::WebRtcTransportConsumerCallback { .. } => {
                event::WEB_RTC_TRANSPORT_CONSUMER_CALLBACK
            }
            Self::TransportConnectCallback { .. } => event::TRANSPORT_CONNECT_CALLBACK,
            Self::TransportRecvConnectCallback { .. } => event::TRANSPORT_RECV_CONNECT_CALLBACK,
            Self::TransportProduceCallback { .. } => event::TRANSPORT_PRODUCE_CALLBACK,
            Self::GetProducersCallback { .. } => event::GET_PRODUCERS_CALLBACK,
            Self::ConsumeCallback { .. } => event::CONSUME_CALLBACK,
            Self::ConsumerResumeCallback { .. } => event::CONSUMER_RESUME_CALLBACK,
            Self::NewProducer { .. } => event::NEW_PRODUCER,
            Self::ProducerClosed { .. } => event::PRODUCER_CLOSED,
            Self::Error { .. } => event::ERROR,
        }
    }
}

/// A server message ready for delivery on a peer channel
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboundEnvelope {
    pub message: ServerMessage,
    pub request_id: Option<Value>,
}

impl OutboundEnvelope {
    #[must_use]
    pub const fn notification(message: ServerMessage) -> Self {
        Self {
            message,
            request_id: None,
        }
    }

    #[must_use]
    pub const fn reply(message: ServerMessage, request_id: Option<Value>) -> Self {
        Self {
            message,
            request_id,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        let mut value = serde_json::to_value(&self.message)?;
        if let (Some(request_id), Value::Object(map)) = (&self.request_id, &mut value) {
            map.insert("requestId".to_string(), request_id.clone());
        }
        serde_json::to_string(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_join_room() {
        let envelope = InboundEnvelope::parse(
            r#"{"event":"join-room","data":{"roomName":"r1"},"requestId":7}"#,
        )
        .unwrap();
        assert_eq!(envelope.request_id, Some(json!(7)));

        let ClientRequest::JoinRoom(request) = ClientRequest::from_envelope(&envelope).unwrap()
        else {
            panic!("expected join-room");
        };
        assert_eq!(request.room_name, "r1");
        assert!(request.display_name.is_none());
    }

    #[test]
    fn test_get_producers_alias_and_missing_data() {
        for name in [event::GET_PRODUCERS, event::GET_PRODUCERS_ALIAS] {
            let raw = json!({ "event": name }).to_string();
            let envelope = InboundEnvelope::parse(&raw).unwrap();
            assert!(matches!(
                ClientRequest::from_envelope(&envelope),
                Ok(ClientRequest::GetProducers)
            ));
        }
    }

    #[test]
    fn test_resume_short_form() {
        for name in [event::CONSUMER_RESUME, event::CONSUMER_RESUME_ALIAS] {
            let raw = json!({ "event": name, "data": { "serverConsumerId": "c1" } }).to_string();
            let envelope = InboundEnvelope::parse(&raw).unwrap();
            let Ok(ClientRequest::ConsumerResume(request)) = ClientRequest::from_envelope(&envelope)
            else {
                panic!("expected consumer-resume for {name}");
            };
            assert_eq!(request.server_consumer_id, ConsumerId::from("c1"));
        }
    }

    #[test]
    fn test_unknown_event_and_bad_payload_are_protocol_errors() {
        let envelope = InboundEnvelope::parse(r#"{"event":"dance"}"#).unwrap();
        assert!(matches!(
            ClientRequest::from_envelope(&envelope),
            Err(SignalError::Protocol(_))
        ));

        let envelope =
            InboundEnvelope::parse(r#"{"event":"consumer-resume","data":{}}"#).unwrap();
        assert!(matches!(
            ClientRequest::from_envelope(&envelope),
            Err(SignalError::Protocol(_))
        ));

        assert!(matches!(
            InboundEnvelope::parse("not json"),
            Err(SignalError::Protocol(_))
        ));
    }

    #[test]
    fn test_server_message_shape() {
        let message = ServerMessage::TransportProduceCallback {
            id: ProducerId::from("p1"),
            producers_exist: true,
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({
                "event": "transport-produce-callback",
                "data": { "id": "p1", "producersExist": true }
            })
        );

        let message = ServerMessage::ProducerClosed {
            remote_producer_id: ProducerId::from("p1"),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({ "event": "producer-closed", "data": { "remoteProducerId": "p1" } })
        );
    }

    #[test]
    fn test_reply_echoes_request_id() {
        let reply = OutboundEnvelope::reply(
            ServerMessage::GetProducersCallback {
                producer_list: vec![ProducerId::from("p1")],
            },
            Some(json!("req-1")),
        );
        let value: Value = serde_json::from_str(&reply.to_json().unwrap()).unwrap();
        assert_eq!(value["requestId"], json!("req-1"));
        assert_eq!(value["data"]["producerList"], json!(["p1"]));

        let notification = OutboundEnvelope::notification(ServerMessage::NewProducer {
            producer_id: ProducerId::from("p2"),
        });
        let value: Value = serde_json::from_str(&notification.to_json().unwrap()).unwrap();
        assert!(value.get("requestId").is_none());
    }

    #[test]
    fn test_error_mapping() {
        let reply = ServerMessage::from_error(
            &SignalError::Incompatible("no common codec".into()),
            Some(event::CONSUME),
        );
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({
                "event": "consume-callback",
                "data": { "params": { "error": "Incompatible: no common codec" } }
            })
        );

        let reply = ServerMessage::from_error(
            &SignalError::NotFound("consumer c1".into()),
            Some(event::CONSUMER_RESUME),
        );
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({
                "event": "error",
                "data": {
                    "code": "not_found",
                    "message": "Not found: consumer c1",
                    "event": "consumer-resume"
                }
            })
        );
    }
}
