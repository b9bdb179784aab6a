//! Media engine capability boundary
//!
//! The signaling layer never touches RTP, ICE or DTLS itself. Everything it
//! needs from the SFU engine goes through the traits below:
//!
//! - **`MediaEngine`**: creates routers and publishes asynchronous engine events
//! - **`Router`**: one per room; capabilities and `can_consume` checks
//! - **`WebRtcTransport`**: connect, produce and consume on a negotiated path
//! - **`Producer`** / **`Consumer`**: handles on individual media streams
//!
//! `LoopbackEngine` is an in-process implementation used for development and tests.

mod loopback;

pub use loopback::{EngineStats, LoopbackEngine};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::error::EngineError;
use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId};

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Asynchronous notifications raised by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A producer was closed, either explicitly or because its transport closed
    ProducerClosed { producer_id: ProducerId },
    /// The engine's worker terminated unexpectedly
    WorkerDied { reason: String },
}

#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_router(&self) -> EngineResult<Arc<dyn Router>>;

    /// Subscribe to engine events. Events raised before subscribing are not replayed.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

#[async_trait]
pub trait Router: Send + Sync {
    fn id(&self) -> &RouterId;

    fn rtp_capabilities(&self) -> &RtpCapabilities;

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn WebRtcTransport>>;

    /// Close the router and every transport created on it
    fn close(&self);
}

#[async_trait]
pub trait WebRtcTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    /// Parameters the client needs to build its side of the transport
    fn params(&self) -> TransportParams;

    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn Producer>>;

    async fn consume(
        &self,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn Consumer>>;

    /// Close the transport together with its producers and consumers
    fn close(&self);
}

pub trait Producer: Send + Sync {
    fn id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    fn close(&self);
}

#[async_trait]
pub trait Consumer: Send + Sync {
    fn id(&self) -> &ConsumerId;

    fn producer_id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn paused(&self) -> bool;

    async fn resume(&self) -> EngineResult<()>;

    fn close(&self);
}

/// A codec the router (or a client device) supports
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub parameters: serde_json::Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<Value>,
}

impl RtpCodecCapability {
    /// Case-insensitive codec identity (kind + mime type)
    #[must_use]
    pub fn same_codec(&self, other: &Self) -> bool {
        self.kind == other.kind && self.mime_type.eq_ignore_ascii_case(&other.mime_type)
    }
}

/// Codec/format capability set exchanged for producer/consumer compatibility
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

/// Producer/consumer RTP parameters; opaque to signaling
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub Value);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    #[default]
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS handshake parameters relayed between client and engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default)]
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    pub ice_lite: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IceProtocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: IpAddr,
    pub protocol: IceProtocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

/// What the client receives in `create-web-rtc-transport-callback`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Listen options for every WebRTC transport the signaling layer allocates
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcTransportOptions {
    pub listen_ip: IpAddr,
    /// Address advertised in ICE candidates (defaults to `listen_ip`)
    pub announced_ip: Option<IpAddr>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for WebRtcTransportOptions {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

impl WebRtcTransportOptions {
    #[must_use]
    pub fn advertised_ip(&self) -> IpAddr {
        self.announced_ip.unwrap_or(self.listen_ip)
    }
}

/// Worker and router settings for the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    /// Codecs every router is created with
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let mut vp8_parameters = serde_json::Map::new();
        vp8_parameters.insert("x-google-start-bitrate".to_string(), Value::from(1000));

        Self {
            rtc_min_port: 2000,
            rtc_max_port: 2020,
            media_codecs: vec![
                RtpCodecCapability {
                    kind: MediaKind::Audio,
                    mime_type: "audio/opus".to_string(),
                    clock_rate: 48000,
                    channels: Some(2),
                    preferred_payload_type: None,
                    parameters: serde_json::Map::new(),
                    rtcp_feedback: Vec::new(),
                },
                RtpCodecCapability {
                    kind: MediaKind::Video,
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    channels: None,
                    preferred_payload_type: None,
                    parameters: vp8_parameters,
                    rtcp_feedback: Vec::new(),
                },
            ],
        }
    }
}

impl EngineConfig {
    /// Collect every configuration problem instead of stopping at the first
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.rtc_min_port == 0 {
            errors.push("engine.rtc_min_port must be non-zero".to_string());
        }
        if self.rtc_min_port > self.rtc_max_port {
            errors.push(format!(
                "engine.rtc_min_port ({}) is greater than engine.rtc_max_port ({})",
                self.rtc_min_port, self.rtc_max_port
            ));
        }
        if self.media_codecs.is_empty() {
            errors.push("engine.media_codecs must list at least one codec".to_string());
        }
        errors
    }
}
