//! In-process media engine
//!
//! Implements the full capability interface without carrying any media:
//! routers advertise the configured codecs, transports hand out host ICE
//! candidates and a DTLS fingerprint, producers and consumers are bookkept so
//! `can_consume` and the close callbacks behave like a real SFU worker.

use async_trait::async_trait;
use nanoid::nanoid;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tracing::{debug, error};
use uuid::Uuid;

use super::{
    Consumer, DtlsFingerprint, DtlsParameters, DtlsRole, EngineConfig, EngineEvent,
    EngineResult, IceCandidate, IceParameters, IceProtocol, MediaEngine, Producer,
    Router, RtpCapabilities, RtpParameters, TransportParams, WebRtcTransport,
    WebRtcTransportOptions,
};
use crate::error::EngineError;
use crate::types::{ConsumerId, MediaKind, ProducerId, RouterId, TransportId};

/// Capacity of the engine event broadcast.
/// Slow subscribers observe `Lagged` rather than blocking the engine.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// First dynamic payload type handed to router codecs
const FIRST_PAYLOAD_TYPE: u8 = 100;

const UDP_HOST_PRIORITY: u32 = 1_076_302_079;
const TCP_HOST_PRIORITY: u32 = 1_076_276_479;

/// Snapshot of engine call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub routers_created: u64,
    pub routers_closed: u64,
    pub transports_created: u64,
    pub transports_connected: u64,
    pub transports_closed: u64,
    pub producers_created: u64,
    pub producers_closed: u64,
    pub consumers_created: u64,
    pub consumers_closed: u64,
    pub consumer_resumes: u64,
}

#[derive(Default)]
struct Counters {
    routers_created: AtomicU64,
    routers_closed: AtomicU64,
    transports_created: AtomicU64,
    transports_connected: AtomicU64,
    transports_closed: AtomicU64,
    producers_created: AtomicU64,
    producers_closed: AtomicU64,
    consumers_created: AtomicU64,
    consumers_closed: AtomicU64,
    consumer_resumes: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

struct ProducerEntry {
    router_id: RouterId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

struct EngineShared {
    config: EngineConfig,
    events: broadcast::Sender<EngineEvent>,
    /// Live producers across every router, for `can_consume` and `consume`
    producers: RwLock<HashMap<ProducerId, ProducerEntry>>,
    port_cursor: AtomicU64,
    counters: Counters,
    death_reason: RwLock<Option<String>>,
}

impl EngineShared {
    fn ensure_alive(&self) -> EngineResult<()> {
        match self.death_reason.read().as_ref() {
            Some(reason) => Err(EngineError::Fatal(reason.clone())),
            None => Ok(()),
        }
    }

    fn emit(&self, event: EngineEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn next_port(&self) -> u16 {
        let min = self.config.rtc_min_port;
        let span = u64::from(self.config.rtc_max_port.saturating_sub(min)) + 1;
        let offset = self.port_cursor.fetch_add(1, Ordering::Relaxed) % span;
        min.saturating_add(u16::try_from(offset).unwrap_or(0))
    }
}

/// In-process engine; cheap to clone, all clones share one worker
#[derive(Clone)]
pub struct LoopbackEngine {
    shared: Arc<EngineShared>,
}

impl LoopbackEngine {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(EngineShared {
                config,
                events,
                producers: RwLock::new(HashMap::new()),
                port_cursor: AtomicU64::new(0),
                counters: Counters::default(),
                death_reason: RwLock::new(None),
            }),
        }
    }

    #[must_use]
    pub fn stats(&self) -> EngineStats {
        let c = &self.shared.counters;
        EngineStats {
            routers_created: c.routers_created.load(Ordering::Relaxed),
            routers_closed: c.routers_closed.load(Ordering::Relaxed),
            transports_created: c.transports_created.load(Ordering::Relaxed),
            transports_connected: c.transports_connected.load(Ordering::Relaxed),
            transports_closed: c.transports_closed.load(Ordering::Relaxed),
            producers_created: c.producers_created.load(Ordering::Relaxed),
            producers_closed: c.producers_closed.load(Ordering::Relaxed),
            consumers_created: c.consumers_created.load(Ordering::Relaxed),
            consumers_closed: c.consumers_closed.load(Ordering::Relaxed),
            consumer_resumes: c.consumer_resumes.load(Ordering::Relaxed),
        }
    }

    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.shared.death_reason.read().is_none()
    }

    /// Terminate the worker. Every later call fails with `EngineError::Fatal`.
    pub fn terminate(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            let mut death = self.shared.death_reason.write();
            if death.is_some() {
                return;
            }
            *death = Some(reason.clone());
        }
        error!(reason = %reason, "Loopback engine worker died");
        self.shared.emit(EngineEvent::WorkerDied { reason });
    }

    fn router_capabilities(&self) -> RtpCapabilities {
        let codecs = self
            .shared
            .config
            .media_codecs
            .iter()
            .zip(FIRST_PAYLOAD_TYPE..)
            .map(|(codec, payload_type)| {
                let mut codec = codec.clone();
                codec.preferred_payload_type.get_or_insert(payload_type);
                codec
            })
            .collect();
        RtpCapabilities {
            codecs,
            header_extensions: Vec::new(),
        }
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_router(&self) -> EngineResult<Arc<dyn Router>> {
        self.shared.ensure_alive()?;

        let router = LoopbackRouter {
            id: RouterId::new(Uuid::new_v4().to_string()),
            rtp_capabilities: self.router_capabilities(),
            shared: Arc::clone(&self.shared),
            transports: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
        };
        bump(&self.shared.counters.routers_created);
        debug!(router_id = %router.id, "Loopback router created");

        Ok(Arc::new(router))
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }
}

type TransportTable = Mutex<HashMap<TransportId, Arc<LoopbackTransport>>>;

struct LoopbackRouter {
    id: RouterId,
    rtp_capabilities: RtpCapabilities,
    shared: Arc<EngineShared>,
    transports: Arc<TransportTable>,
    closed: AtomicBool,
}

#[async_trait]
impl Router for LoopbackRouter {
    fn id(&self) -> &RouterId {
        &self.id
    }

    fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.rtp_capabilities
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let producers = self.shared.producers.read();
        let Some(entry) = producers.get(producer_id) else {
            return false;
        };
        if entry.router_id != self.id {
            return false;
        }

        self.rtp_capabilities
            .codecs
            .iter()
            .filter(|codec| codec.kind == entry.kind)
            .any(|codec| rtp_capabilities.codecs.iter().any(|c| c.same_codec(codec)))
    }

    async fn create_webrtc_transport(
        &self,
        options: &WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn WebRtcTransport>> {
        self.shared.ensure_alive()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed(format!("router {}", self.id)));
        }
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::Failure(
                "at least one of UDP and TCP must be enabled".to_string(),
            ));
        }

        let id = TransportId::new(Uuid::new_v4().to_string());
        let params = transport_params(&id, options, self.shared.next_port());
        let transport = Arc::new(LoopbackTransport {
            id: id.clone(),
            router_id: self.id.clone(),
            params,
            shared: Arc::clone(&self.shared),
            table: Arc::downgrade(&self.transports),
            connected: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
        });
        self.transports.lock().insert(id, Arc::clone(&transport));
        bump(&self.shared.counters.transports_created);

        Ok(transport)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let transports: Vec<_> = self.transports.lock().drain().map(|(_, t)| t).collect();
        for transport in transports {
            transport.close();
        }
        bump(&self.shared.counters.routers_closed);
        debug!(router_id = %self.id, "Loopback router closed");
    }
}

fn transport_params(id: &TransportId, options: &WebRtcTransportOptions, port: u16) -> TransportParams {
    let ip = options.advertised_ip();
    let (udp_priority, tcp_priority) = if options.prefer_udp {
        (UDP_HOST_PRIORITY, TCP_HOST_PRIORITY)
    } else {
        (TCP_HOST_PRIORITY, UDP_HOST_PRIORITY)
    };

    let mut ice_candidates = Vec::with_capacity(2);
    if options.enable_udp {
        ice_candidates.push(IceCandidate {
            foundation: "udpcandidate".to_string(),
            priority: udp_priority,
            ip,
            protocol: IceProtocol::Udp,
            port,
            candidate_type: "host".to_string(),
            tcp_type: None,
        });
    }
    if options.enable_tcp {
        ice_candidates.push(IceCandidate {
            foundation: "tcpcandidate".to_string(),
            priority: tcp_priority,
            ip,
            protocol: IceProtocol::Tcp,
            port,
            candidate_type: "host".to_string(),
            tcp_type: Some("passive".to_string()),
        });
    }

    TransportParams {
        id: id.clone(),
        ice_parameters: IceParameters {
            username_fragment: nanoid!(16),
            password: nanoid!(32),
            ice_lite: true,
        },
        ice_candidates,
        dtls_parameters: DtlsParameters {
            role: DtlsRole::Auto,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: fingerprint(id),
            }],
        },
    }
}

fn fingerprint(id: &TransportId) -> String {
    let digest = Sha256::new()
        .chain_update(id.as_str())
        .chain_update(nanoid!())
        .finalize();
    digest
        .iter()
        .map(|byte| format!("{byte:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

struct LoopbackTransport {
    id: TransportId,
    router_id: RouterId,
    params: TransportParams,
    shared: Arc<EngineShared>,
    table: Weak<TransportTable>,
    connected: AtomicBool,
    closed: AtomicBool,
    producers: Mutex<Vec<Arc<LoopbackProducer>>>,
    consumers: Mutex<Vec<Arc<LoopbackConsumer>>>,
}

impl LoopbackTransport {
    fn ensure_open(&self) -> EngineResult<()> {
        self.shared.ensure_alive()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed(format!("transport {}", self.id)));
        }
        Ok(())
    }
}

#[async_trait]
impl WebRtcTransport for LoopbackTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn params(&self) -> TransportParams {
        self.params.clone()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()> {
        self.ensure_open()?;
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::Failure(
                "dtlsParameters carry no fingerprints".to_string(),
            ));
        }
        if self.connected.swap(true, Ordering::AcqRel) {
            return Err(EngineError::Failure(format!(
                "connect() already called on transport {}",
                self.id
            )));
        }
        bump(&self.shared.counters.transports_connected);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn Producer>> {
        self.ensure_open()?;

        let producer = Arc::new(LoopbackProducer {
            id: ProducerId::new(Uuid::new_v4().to_string()),
            kind,
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        });
        self.shared.producers.write().insert(
            producer.id.clone(),
            ProducerEntry {
                router_id: self.router_id.clone(),
                kind,
                rtp_parameters,
            },
        );
        self.producers.lock().push(Arc::clone(&producer));
        bump(&self.shared.counters.producers_created);

        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &ProducerId,
        _rtp_capabilities: &RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn Consumer>> {
        self.ensure_open()?;

        let (kind, rtp_parameters) = {
            let producers = self.shared.producers.read();
            match producers.get(producer_id) {
                Some(entry) if entry.router_id == self.router_id => {
                    (entry.kind, entry.rtp_parameters.clone())
                }
                _ => {
                    return Err(EngineError::Failure(format!(
                        "producer {producer_id} not found on router {}",
                        self.router_id
                    )))
                }
            }
        };

        let consumer = Arc::new(LoopbackConsumer {
            id: ConsumerId::new(Uuid::new_v4().to_string()),
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
            paused: AtomicBool::new(paused),
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        });
        self.consumers.lock().push(Arc::clone(&consumer));
        bump(&self.shared.counters.consumers_created);

        Ok(consumer)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers {
            consumer.close();
        }
        let producers = std::mem::take(&mut *self.producers.lock());
        for producer in producers {
            producer.close();
        }
        if let Some(table) = self.table.upgrade() {
            table.lock().remove(&self.id);
        }
        bump(&self.shared.counters.transports_closed);
    }
}

struct LoopbackProducer {
    id: ProducerId,
    kind: MediaKind,
    shared: Arc<EngineShared>,
    closed: AtomicBool,
}

impl Producer for LoopbackProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.producers.write().remove(&self.id);
        bump(&self.shared.counters.producers_closed);
        self.shared.emit(EngineEvent::ProducerClosed {
            producer_id: self.id.clone(),
        });
    }
}

struct LoopbackConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    shared: Arc<EngineShared>,
    closed: AtomicBool,
}

#[async_trait]
impl Consumer for LoopbackConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    async fn resume(&self) -> EngineResult<()> {
        self.shared.ensure_alive()?;
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed(format!("consumer {}", self.id)));
        }
        self.paused.store(false, Ordering::Release);
        bump(&self.shared.counters.consumer_resumes);
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        bump(&self.shared.counters.consumers_closed);
    }
}
