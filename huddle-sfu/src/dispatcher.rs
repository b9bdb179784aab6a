//! Negotiation dispatcher
//!
//! Interprets decoded client requests against the registries and the media
//! engine. State is tracked per resource: a peer can be producing on its send
//! transport while several recv negotiations are in flight.
//!
//! Every engine call follows the same shape: lock, validate and reserve,
//! release, call the engine, re-lock, re-validate and commit. When the peer or
//! the resource it depended on vanished while the call was in flight, the new
//! engine resource is closed instead of committed.

use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::SfuConfig;
use crate::engine::{
    Consumer, DtlsParameters, MediaEngine, Producer, Router, RtpCapabilities, WebRtcTransport,
};
use crate::error::{Result, SignalError};
use crate::notifier::FanoutNotifier;
use crate::protocol::{
    ClientRequest, ConsumeParams, ConsumeRequest, ConsumerParams, ConsumerResumeRequest,
    CreateTransportRequest, JoinRoomRequest, ProduceRequest, ServerMessage,
};
use crate::resources::{ConsumerRecord, ProducerRecord, TransportRecord, TransportState};
use crate::state::{SharedState, SignalState};
use crate::types::{PeerId, ProducerId, RoomName, TransportDirection, TransportId};

pub struct Dispatcher {
    state: SharedState,
    engine: Arc<dyn MediaEngine>,
    notifier: FanoutNotifier,
    config: SfuConfig,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        state: SharedState,
        engine: Arc<dyn MediaEngine>,
        notifier: FanoutNotifier,
        config: SfuConfig,
    ) -> Self {
        Self {
            state,
            engine,
            notifier,
            config,
        }
    }

    /// Run one request to completion and produce the reply for the caller
    pub async fn dispatch(&self, peer_id: &PeerId, request: ClientRequest) -> Result<ServerMessage> {
        match request {
            ClientRequest::JoinRoom(req) => self.join_room(peer_id, req).await,
            ClientRequest::CreateTransport(req) => self.create_transport(peer_id, req).await,
            ClientRequest::TransportConnect(req) => {
                let transport_id = match req.transport_id {
                    Some(id) => id,
                    None => self.send_transport_of(peer_id)?,
                };
                self.connect_transport(peer_id, &transport_id, TransportDirection::Send, req.dtls_parameters)
                    .await?;
                Ok(ServerMessage::TransportConnectCallback { transport_id })
            }
            ClientRequest::TransportRecvConnect(req) => {
                let transport_id = req.server_consumer_transport_id;
                self.connect_transport(peer_id, &transport_id, TransportDirection::Recv, req.dtls_parameters)
                    .await?;
                Ok(ServerMessage::TransportRecvConnectCallback { transport_id })
            }
            ClientRequest::Produce(req) => self.produce(peer_id, req).await,
            ClientRequest::GetProducers => self.get_producers(peer_id),
            ClientRequest::Consume(req) => self.consume(peer_id, req).await,
            ClientRequest::ConsumerResume(req) => self.resume_consumer(peer_id, req).await,
        }
    }

    fn send_transport_of(&self, peer_id: &PeerId) -> Result<TransportId> {
        let state = self.state.lock();
        state.sessions.room_of(peer_id)?;
        state
            .resources
            .send_transport_id(peer_id)
            .cloned()
            .ok_or_else(|| SignalError::InvalidState(format!("peer {peer_id} has no send transport")))
    }

    async fn join_room(&self, peer_id: &PeerId, req: JoinRoomRequest) -> Result<ServerMessage> {
        let room = RoomName::parse(&req.room_name)?;
        let display_name = req
            .display_name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty());

        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if let Some(current) = &state.sessions.get(peer_id)?.room {
                return Err(SignalError::AlreadyJoined(current.to_string()));
            }
            if let Some(router) = state.rooms.try_attach(&room, peer_id)? {
                state
                    .sessions
                    .assign_room(peer_id, room.clone(), display_name, false)?;
                info!(peer_id = %peer_id, room = %room, "Peer joined room");
                return Ok(ServerMessage::JoinRoomCallback {
                    rtp_capabilities: router.rtp_capabilities().clone(),
                    is_admin: false,
                });
            }
            state.rooms.ensure_room_capacity()?;
        }

        let router = self.engine.create_router().await.map_err(|e| {
            error!(room = %room, error = %e, "Failed to create router");
            SignalError::from(e)
        })?;

        let committed = {
            let mut guard = self.state.lock();
            Self::commit_join(&mut guard, peer_id, &room, display_name, Arc::clone(&router))
        };
        match committed {
            Ok((active, created)) => {
                if created {
                    info!(peer_id = %peer_id, room = %room, router_id = %router.id(), "Room created");
                } else {
                    // Another JOIN created the room while our router was being allocated
                    router.close();
                    info!(peer_id = %peer_id, room = %room, "Peer joined room");
                }
                Ok(ServerMessage::JoinRoomCallback {
                    rtp_capabilities: active.rtp_capabilities().clone(),
                    is_admin: created,
                })
            }
            Err(e) => {
                router.close();
                Err(e)
            }
        }
    }

    fn commit_join(
        state: &mut SignalState,
        peer_id: &PeerId,
        room: &RoomName,
        display_name: Option<String>,
        router: Arc<dyn Router>,
    ) -> Result<(Arc<dyn Router>, bool)> {
        if let Some(current) = &state.sessions.get(peer_id)?.room {
            return Err(SignalError::AlreadyJoined(current.to_string()));
        }
        let (active, created) = state.rooms.attach_or_create(room, peer_id, router)?;
        state
            .sessions
            .assign_room(peer_id, room.clone(), display_name, created)?;
        Ok((active, created))
    }

    async fn create_transport(&self, peer_id: &PeerId, req: CreateTransportRequest) -> Result<ServerMessage> {
        let direction = if req.consumer {
            TransportDirection::Recv
        } else {
            TransportDirection::Send
        };

        let (room, router) = {
            let mut guard = self.state.lock();
            Self::reserve_transport(&mut guard, peer_id, direction, req.remote_producer_id.as_ref())?
        };

        let created = router
            .create_webrtc_transport(&self.config.webrtc_transport)
            .await;
        let handle = match created {
            Ok(handle) => handle,
            Err(e) => {
                Self::release_reservation(
                    &mut self.state.lock(),
                    peer_id,
                    direction,
                    req.remote_producer_id.as_ref(),
                );
                error!(peer_id = %peer_id, direction = %direction, error = %e, "Failed to create transport");
                return Err(e.into());
            }
        };

        let committed = {
            let mut guard = self.state.lock();
            let committed = Self::commit_transport(
                &mut guard,
                peer_id,
                &room,
                direction,
                req.remote_producer_id.clone(),
                Arc::clone(&handle),
            );
            if committed.is_err() {
                Self::release_reservation(&mut guard, peer_id, direction, req.remote_producer_id.as_ref());
            }
            committed
        };
        if let Err(e) = committed {
            handle.close();
            return Err(e);
        }

        debug!(peer_id = %peer_id, transport_id = %handle.id(), direction = %direction, "Transport created");

        let params = handle.params();
        Ok(match req.remote_producer_id {
            Some(remote_producer_id) if direction == TransportDirection::Recv => {
                ServerMessage::WebRtcTransportConsumerCallback {
                    params,
                    remote_producer_id,
                }
            }
            _ => ServerMessage::CreateWebRtcTransportCallback { params },
        })
    }

    fn reserve_transport(
        state: &mut SignalState,
        peer_id: &PeerId,
        direction: TransportDirection,
        remote_producer_id: Option<&ProducerId>,
    ) -> Result<(RoomName, Arc<dyn Router>)> {
        let room = state.sessions.room_of(peer_id)?.clone();
        let router = state.rooms.router_of(&room)?;

        match direction {
            TransportDirection::Send => {
                if state.resources.send_transport_id(peer_id).is_some() {
                    return Err(SignalError::InvalidState(format!(
                        "peer {peer_id} already has a send transport"
                    )));
                }
                let peer = state.sessions.get_mut(peer_id)?;
                if peer.send_transport_pending {
                    return Err(SignalError::InvalidState(format!(
                        "send transport for peer {peer_id} is already being created"
                    )));
                }
                peer.send_transport_pending = true;
            }
            TransportDirection::Recv => {
                let producer_id = remote_producer_id.ok_or_else(|| {
                    SignalError::Protocol("remoteProducerId is required for a consumer transport".to_string())
                })?;
                let producer = state.resources.producer_in_room(producer_id, &room)?;
                if &producer.peer_id == peer_id {
                    return Err(SignalError::InvalidState(format!(
                        "peer {peer_id} cannot consume its own producer {producer_id}"
                    )));
                }
                let peer = state.sessions.get_mut(peer_id)?;
                if !peer.consuming.insert(producer_id.clone()) {
                    return Err(SignalError::InvalidState(format!(
                        "peer {peer_id} is already consuming producer {producer_id}"
                    )));
                }
            }
        }
        Ok((room, router))
    }

    fn release_reservation(
        state: &mut SignalState,
        peer_id: &PeerId,
        direction: TransportDirection,
        remote_producer_id: Option<&ProducerId>,
    ) {
        let Ok(peer) = state.sessions.get_mut(peer_id) else {
            return;
        };
        match (direction, remote_producer_id) {
            (TransportDirection::Send, _) => peer.send_transport_pending = false,
            (TransportDirection::Recv, Some(producer_id)) => {
                peer.consuming.remove(producer_id);
            }
            (TransportDirection::Recv, None) => {}
        }
    }

    fn commit_transport(
        state: &mut SignalState,
        peer_id: &PeerId,
        room: &RoomName,
        direction: TransportDirection,
        remote_producer_id: Option<ProducerId>,
        handle: Arc<dyn WebRtcTransport>,
    ) -> Result<()> {
        if state.sessions.room_of(peer_id)? != room {
            return Err(SignalError::InvalidState(format!(
                "peer {peer_id} left room {room} during transport creation"
            )));
        }
        if let Some(producer_id) = &remote_producer_id {
            // The producer may have closed while the transport was being allocated
            state.resources.producer_in_room(producer_id, room)?;
        }

        let record = TransportRecord {
            id: handle.id().clone(),
            peer_id: peer_id.clone(),
            room: room.clone(),
            direction,
            state: TransportState::New,
            remote_producer_id,
            consumer_id: None,
            consumer_pending: false,
            handle,
        };
        let peer = state.sessions.get_mut(peer_id)?;
        peer.transport_ids.push(record.id.clone());
        if direction == TransportDirection::Send {
            peer.send_transport_pending = false;
        }
        state.resources.insert_transport(record);
        Ok(())
    }

    async fn connect_transport(
        &self,
        peer_id: &PeerId,
        transport_id: &TransportId,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
    ) -> Result<()> {
        let handle = {
            let mut state = self.state.lock();
            let record = state.resources.transport_owned_mut(transport_id, peer_id)?;
            if record.direction != direction {
                return Err(SignalError::InvalidState(format!(
                    "transport {transport_id} is a {} transport",
                    record.direction
                )));
            }
            if record.state != TransportState::New {
                return Err(SignalError::InvalidState(format!(
                    "transport {transport_id} is already connected"
                )));
            }
            record.state = TransportState::Connecting;
            Arc::clone(&record.handle)
        };

        let result = handle.connect(dtls_parameters).await;

        let mut state = self.state.lock();
        let Ok(record) = state.resources.transport_owned_mut(transport_id, peer_id) else {
            return Err(SignalError::NotFound(format!(
                "transport {transport_id} closed during connect"
            )));
        };
        match result {
            Ok(()) => {
                record.state = TransportState::Connected;
                debug!(peer_id = %peer_id, transport_id = %transport_id, "Transport connected");
                Ok(())
            }
            Err(e) => {
                record.state = TransportState::New;
                error!(peer_id = %peer_id, transport_id = %transport_id, error = %e, "Transport connect failed");
                Err(e.into())
            }
        }
    }

    async fn produce(&self, peer_id: &PeerId, req: ProduceRequest) -> Result<ServerMessage> {
        let (room, transport_id, handle) = {
            let state = self.state.lock();
            let room = state.sessions.room_of(peer_id)?.clone();
            let transport_id = state
                .resources
                .send_transport_id(peer_id)
                .cloned()
                .ok_or_else(|| SignalError::InvalidState(format!("peer {peer_id} has no send transport")))?;
            let record = state.resources.transport_owned(&transport_id, peer_id)?;
            if record.state != TransportState::Connected {
                return Err(SignalError::InvalidState(format!(
                    "send transport {transport_id} is not connected"
                )));
            }
            (room, transport_id, Arc::clone(&record.handle))
        };

        let kind = req.kind;
        let producer = handle.produce(kind, req.rtp_parameters).await.map_err(|e| {
            error!(peer_id = %peer_id, kind = %kind, error = %e, "Produce failed");
            SignalError::from(e)
        })?;

        let committed = {
            let mut guard = self.state.lock();
            Self::commit_producer(&mut guard, peer_id, &room, &transport_id, Arc::clone(&producer))
        };
        let producers_exist = match committed {
            Ok(exist) => exist,
            Err(e) => {
                producer.close();
                return Err(e);
            }
        };

        let producer_id = producer.id().clone();
        info!(peer_id = %peer_id, room = %room, producer_id = %producer_id, kind = %kind, "Producer created");

        let notified = self.notifier.notify_room_except(
            &room,
            peer_id,
            &ServerMessage::NewProducer {
                producer_id: producer_id.clone(),
            },
        );
        debug!(producer_id = %producer_id, notified, "New producer announced");

        Ok(ServerMessage::TransportProduceCallback {
            id: producer_id,
            producers_exist,
        })
    }

    /// Returns whether another peer's producer already exists in the room
    fn commit_producer(
        state: &mut SignalState,
        peer_id: &PeerId,
        room: &RoomName,
        transport_id: &TransportId,
        handle: Arc<dyn Producer>,
    ) -> Result<bool> {
        if state.sessions.room_of(peer_id)? != room {
            return Err(SignalError::InvalidState(format!(
                "peer {peer_id} left room {room} while producing"
            )));
        }
        state.resources.transport_owned(transport_id, peer_id)?;

        let record = ProducerRecord {
            id: handle.id().clone(),
            peer_id: peer_id.clone(),
            room: room.clone(),
            kind: handle.kind(),
            transport_id: transport_id.clone(),
            handle,
        };
        state.sessions.get_mut(peer_id)?.producer_ids.push(record.id.clone());
        state.resources.insert_producer(record);
        Ok(state.resources.has_other_producer(room, peer_id))
    }

    fn get_producers(&self, peer_id: &PeerId) -> Result<ServerMessage> {
        let state = self.state.lock();
        let room = state.sessions.room_of(peer_id)?;
        Ok(ServerMessage::GetProducersCallback {
            producer_list: state.resources.producer_ids_in_room_except(room, peer_id),
        })
    }

    async fn consume(&self, peer_id: &PeerId, req: ConsumeRequest) -> Result<ServerMessage> {
        let ConsumeRequest {
            rtp_capabilities,
            remote_producer_id: producer_id,
            server_consumer_transport_id: transport_id,
        } = req;

        let (room, handle) = {
            let mut guard = self.state.lock();
            self.reserve_consumer(&mut guard, peer_id, &transport_id, &producer_id, &rtp_capabilities)?
        };

        let created = handle.consume(&producer_id, &rtp_capabilities, true).await;

        let mut guard = self.state.lock();
        if let Ok(record) = guard.resources.transport_owned_mut(&transport_id, peer_id) {
            record.consumer_pending = false;
        }
        let consumer = match created {
            Ok(consumer) => consumer,
            Err(e) => {
                drop(guard);
                error!(peer_id = %peer_id, producer_id = %producer_id, error = %e, "Consume failed");
                return Err(e.into());
            }
        };
        let committed = Self::commit_consumer(&mut guard, peer_id, &room, &transport_id, Arc::clone(&consumer));
        drop(guard);
        if let Err(e) = committed {
            consumer.close();
            return Err(e);
        }

        debug!(peer_id = %peer_id, consumer_id = %consumer.id(), producer_id = %producer_id, "Consumer created");

        Ok(ServerMessage::ConsumeCallback {
            params: ConsumeParams::Consumer(ConsumerParams {
                id: consumer.id().clone(),
                producer_id,
                kind: consumer.kind(),
                rtp_parameters: consumer.rtp_parameters(),
                server_consumer_id: consumer.id().clone(),
                paused: consumer.paused(),
            }),
        })
    }

    fn reserve_consumer(
        &self,
        state: &mut SignalState,
        peer_id: &PeerId,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<(RoomName, Arc<dyn WebRtcTransport>)> {
        let room = state.sessions.room_of(peer_id)?.clone();

        let transport = state.resources.transport_owned(transport_id, peer_id)?;
        let producer = state.resources.producer_in_room(producer_id, &room)?;
        if &producer.peer_id == peer_id {
            return Err(SignalError::InvalidState(format!(
                "peer {peer_id} cannot consume its own producer {producer_id}"
            )));
        }

        if transport.direction != TransportDirection::Recv {
            return Err(SignalError::InvalidState(format!(
                "transport {transport_id} is not a recv transport"
            )));
        }
        if self.config.consume_requires_connected_transport
            && transport.state != TransportState::Connected
        {
            return Err(SignalError::InvalidState(format!(
                "recv transport {transport_id} is not connected"
            )));
        }
        if transport.consumer_id.is_some() || transport.consumer_pending {
            return Err(SignalError::InvalidState(format!(
                "recv transport {transport_id} already carries a consumer"
            )));
        }
        if let Some(bound) = &transport.remote_producer_id {
            if bound != producer_id {
                return Err(SignalError::InvalidState(format!(
                    "recv transport {transport_id} was created for producer {bound}"
                )));
            }
        }

        let router = state.rooms.router_of(&room)?;
        if !router.can_consume(producer_id, rtp_capabilities) {
            return Err(SignalError::Incompatible(format!(
                "cannot consume producer {producer_id} with the supplied rtpCapabilities"
            )));
        }

        let transport = state.resources.transport_owned_mut(transport_id, peer_id)?;
        transport.consumer_pending = true;
        Ok((room, Arc::clone(&transport.handle)))
    }

    fn commit_consumer(
        state: &mut SignalState,
        peer_id: &PeerId,
        room: &RoomName,
        transport_id: &TransportId,
        handle: Arc<dyn Consumer>,
    ) -> Result<()> {
        if state.sessions.room_of(peer_id)? != room {
            return Err(SignalError::InvalidState(format!(
                "peer {peer_id} left room {room} while consuming"
            )));
        }
        let producer_id = handle.producer_id().clone();
        state.resources.producer_in_room(&producer_id, room)?;

        let consumer_id = handle.id().clone();
        let transport = state.resources.transport_owned_mut(transport_id, peer_id)?;
        transport.consumer_id = Some(consumer_id.clone());

        state.sessions.get_mut(peer_id)?.consumer_ids.push(consumer_id.clone());
        state.resources.insert_consumer(ConsumerRecord {
            id: consumer_id,
            peer_id: peer_id.clone(),
            room: room.clone(),
            producer_id,
            transport_id: transport_id.clone(),
            paused: true,
            handle,
        });
        Ok(())
    }

    async fn resume_consumer(&self, peer_id: &PeerId, req: ConsumerResumeRequest) -> Result<ServerMessage> {
        let consumer_id = req.server_consumer_id;
        let handle = {
            let mut state = self.state.lock();
            let record = state.resources.consumer_owned_mut(&consumer_id, peer_id)?;
            if !record.paused {
                return Err(SignalError::InvalidState(format!(
                    "consumer {consumer_id} is already active"
                )));
            }
            record.paused = false;
            Arc::clone(&record.handle)
        };

        if let Err(e) = handle.resume().await {
            if let Ok(record) = self.state.lock().resources.consumer_owned_mut(&consumer_id, peer_id) {
                record.paused = true;
            }
            error!(peer_id = %peer_id, consumer_id = %consumer_id, error = %e, "Consumer resume failed");
            return Err(e.into());
        }

        debug!(peer_id = %peer_id, consumer_id = %consumer_id, "Consumer resumed");
        Ok(ServerMessage::ConsumerResumeCallback {
            server_consumer_id: consumer_id,
        })
    }
}
