pub mod event;
pub mod state;

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Instant;

use bytes::BytesMut;
use log::{debug, warn};

use media::packetizer::{Packetizer, PacketizerInit, PayloadFormat};
use media::report::{ReportEvent, ReportingSession, ReportingSessionConfig};
use media::rtcp::{marshal_compound, PictureLoss, ReceiverEstimate, RtcpPacket};
use mux::{Association, AssociationEvent, MuxRole, Reliability, TransportTuning};
use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext};

use crate::channel::message::{
    channel_type_and_parameter, ChannelMessage, ChannelOpen, CHANNEL_PRIORITY_NORMAL,
};
use crate::channel::{Channel, ChannelId, ChannelInit, ChannelInner};
use crate::configuration::Config;
use crate::connection::event::{ChannelEvent, Event, TrackEvent};
use crate::connection::state::{
    ChannelState, ConnectionState, ConnectivityState, GatheringState, SignalingState,
};
use crate::description::{DescriptionKind, SessionDescription, SetupRole, TransportParams};
use crate::description::CandidateInit;
use crate::handler::channel::ChannelNotice;
use crate::handler::media::MediaNotice;
use crate::handler::message::{
    AppMessage, EngineMessage, MediaMessage, SecureMessage, TaggedEngineMessage,
};
use crate::handler::PipelineContext;
use crate::settings;
use crate::track::{Codec, Track, TrackId, TrackInit, TrackInner, TrackPacketizerInit};
use crate::transport::candidate::{AgentEvent, CandidateAgent, DirectAgent};
use crate::transport::secure::{
    HandshakeEngine, PlainHandshake, SecureEvent, SecureRole, SecureState, SecureTransport,
};

/// Overhead reserved below the path MTU for the secure record and
/// association framing around one data chunk.
const MUX_FRAMING_OVERHEAD: usize = 80;

/// A peer-to-peer transport session: one connectivity transport, one
/// secure transport, one reliable-message transport, plus the owned sets
/// of channels and tracks.
///
/// The connection is sans-I/O and single-actor: feed datagrams with
/// [handle_read](Self::handle_read), drain datagrams with
/// [poll_write](Self::poll_write), drive timers with
/// [handle_timeout](Self::handle_timeout) /
/// [poll_timeout](Self::poll_timeout), and consume notifications with
/// [poll_event](Self::poll_event). All mutation happens through
/// `&mut self`, so one cooperative loop (or one worker task) owns the
/// whole connection; see the `driver` module for a ready-made actor.
pub struct Connection {
    config: Config,
    tuning: TransportTuning,

    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,

    signaling_state: SignalingState,
    connectivity_state: ConnectivityState,
    gathering_state: GatheringState,
    state: ConnectionState,
    closed: bool,
    negotiation_started: bool,
    negotiation_needed: bool,

    secure_role: Option<SecureRole>,
    selected_pair: Option<(SocketAddr, SocketAddr)>,

    engine_seed: Option<Box<dyn HandshakeEngine>>,

    pub(crate) pipeline: PipelineContext,
    pub(crate) channels: HashMap<ChannelId, ChannelInner>,
    pub(crate) stream_index: HashMap<u16, ChannelId>,
    next_channel_id: ChannelId,
    pub(crate) tracks: HashMap<TrackId, TrackInner>,
    pub(crate) ssrc_index: HashMap<u32, TrackId>,
    next_track_id: TrackId,

    events: VecDeque<Event>,
    last_now: Instant,
}

impl Connection {
    /// Create a connection with the bundled direct candidate agent and
    /// plain handshake engine.
    pub fn new(config: Config) -> Result<Self> {
        let local_addr = config
            .bind_address
            .unwrap_or_else(|| SocketAddr::from_str("0.0.0.0:0").unwrap());
        let agent = Box::new(DirectAgent::new(local_addr));
        let engine = Box::new(PlainHandshake::new());
        Self::with_transports(config, agent, engine)
    }

    /// Create a connection with collaborator-supplied connectivity and
    /// handshake implementations.
    pub fn with_transports(
        config: Config,
        agent: Box<dyn CandidateAgent>,
        engine: Box<dyn HandshakeEngine>,
    ) -> Result<Self> {
        if config.mtu <= MUX_FRAMING_OVERHEAD {
            return Err(Error::Other(format!("mtu {} too small", config.mtu)));
        }
        let mut tuning = settings::association_tuning();
        tuning.max_message_size = config.max_message_size as u32;
        tuning.fragment_size = config.mtu - MUX_FRAMING_OVERHEAD;

        let mut pipeline = PipelineContext::default();
        pipeline.candidate.agent = Some(agent);

        Ok(Self {
            config,
            tuning,
            local_description: None,
            remote_description: None,
            signaling_state: SignalingState::Stable,
            connectivity_state: ConnectivityState::New,
            gathering_state: GatheringState::New,
            state: ConnectionState::New,
            closed: false,
            negotiation_started: false,
            negotiation_needed: false,
            secure_role: None,
            selected_pair: None,
            engine_seed: Some(engine),
            pipeline,
            channels: HashMap::new(),
            stream_index: HashMap::new(),
            next_channel_id: 0,
            tracks: HashMap::new(),
            ssrc_index: HashMap::new(),
            next_track_id: 0,
            events: VecDeque::new(),
            last_now: Instant::now(),
        })
    }

    //////////////////////////////////////////////////
    // Observable state
    //////////////////////////////////////////////////

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.connectivity_state
    }

    pub fn gathering_state(&self) -> GatheringState {
        self.gathering_state
    }

    pub fn signaling_state(&self) -> SignalingState {
        self.signaling_state
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_description.as_ref()
    }

    pub fn remote_description(&self) -> Option<&SessionDescription> {
        self.remote_description.as_ref()
    }

    pub fn selected_candidate_pair(&self) -> Option<(SocketAddr, SocketAddr)> {
        self.selected_pair
    }

    pub fn negotiation_needed(&self) -> bool {
        self.negotiation_needed
    }

    /// Stream capacity of the reliable-message transport.
    pub fn max_channel_streams(&self) -> u16 {
        self.pipeline
            .mux
            .association
            .as_ref()
            .map(|a| a.max_streams())
            .unwrap_or(self.tuning.max_streams)
    }

    /// Message-size cap advertised by the peer, once negotiated.
    pub fn remote_max_message_size(&self) -> usize {
        self.pipeline
            .mux
            .association
            .as_ref()
            .map(|a| a.remote_max_message_size() as usize)
            .filter(|size| *size > 0)
            .unwrap_or(self.config.max_message_size)
    }

    /// Largest message accepted by both endpoints.
    pub fn max_message_size(&self) -> usize {
        self.config
            .max_message_size
            .min(self.remote_max_message_size())
    }

    //////////////////////////////////////////////////
    // Negotiation
    //////////////////////////////////////////////////

    pub fn create_offer(&mut self) -> Result<SessionDescription> {
        if self.closed {
            return Err(Error::ErrConnectionClosed);
        }
        Ok(SessionDescription::offer(TransportParams {
            setup: SetupRole::Auto,
            max_message_size: self.config.max_message_size as u32,
            candidates: Vec::new(),
        }))
    }

    pub fn create_answer(&mut self) -> Result<SessionDescription> {
        if self.closed {
            return Err(Error::ErrConnectionClosed);
        }
        if self.remote_description.is_none() {
            return Err(Error::ErrNoRemoteDescription);
        }
        if !matches!(
            self.signaling_state,
            SignalingState::HaveRemoteOffer | SignalingState::HaveLocalPranswer
        ) {
            return Err(Error::ErrIncorrectSignalingState);
        }
        Ok(SessionDescription::answer(TransportParams {
            setup: SetupRole::Active,
            max_message_size: self.config.max_message_size as u32,
            candidates: Vec::new(),
        }))
    }

    /// Apply a local description, advancing the signaling state and
    /// starting candidate gathering.
    pub fn set_local_description(&mut self, description: SessionDescription) -> Result<()> {
        if self.closed {
            return Err(Error::ErrConnectionClosed);
        }
        let next = match (description.kind, self.signaling_state) {
            (DescriptionKind::Offer, SignalingState::Stable)
            | (DescriptionKind::Offer, SignalingState::HaveLocalOffer) => {
                SignalingState::HaveLocalOffer
            }
            (DescriptionKind::Answer, SignalingState::HaveRemoteOffer)
            | (DescriptionKind::Answer, SignalingState::HaveLocalPranswer) => {
                SignalingState::Stable
            }
            (DescriptionKind::Pranswer, SignalingState::HaveRemoteOffer) => {
                SignalingState::HaveLocalPranswer
            }
            _ => return Err(Error::ErrIncorrectSignalingState),
        };
        self.set_signaling_state(next);
        self.negotiation_started = true;
        self.negotiation_needed = false;
        self.events
            .push_back(Event::LocalDescription(description.clone()));
        self.local_description = Some(description);

        if let Some(agent) = self.pipeline.candidate.agent.as_mut() {
            agent.start_gathering(&self.config.ice_servers)?;
        }
        self.process_events();
        self.update_connection_state();
        Ok(())
    }

    /// Apply a remote description; this is what triggers secure-transport
    /// creation once a candidate pair is selected.
    pub fn set_remote_description(&mut self, description: SessionDescription) -> Result<()> {
        if self.closed {
            return Err(Error::ErrConnectionClosed);
        }
        let next = match (description.kind, self.signaling_state) {
            (DescriptionKind::Offer, SignalingState::Stable)
            | (DescriptionKind::Offer, SignalingState::HaveRemoteOffer) => {
                SignalingState::HaveRemoteOffer
            }
            (DescriptionKind::Answer, SignalingState::HaveLocalOffer)
            | (DescriptionKind::Answer, SignalingState::HaveRemotePranswer) => {
                SignalingState::Stable
            }
            (DescriptionKind::Pranswer, SignalingState::HaveLocalOffer) => {
                SignalingState::HaveRemotePranswer
            }
            _ => return Err(Error::ErrIncorrectSignalingState),
        };
        self.set_signaling_state(next);
        self.negotiation_started = true;

        self.secure_role = Some(match description.transport.setup {
            SetupRole::Active => SecureRole::Server,
            SetupRole::Passive => SecureRole::Client,
            // The offerer leaves the choice open; the answerer takes the
            // active role
            SetupRole::Auto => {
                if description.kind == DescriptionKind::Offer {
                    SecureRole::Client
                } else {
                    SecureRole::Server
                }
            }
        });

        if self.pipeline.secure.transport.is_none() {
            if let Some(engine) = self.engine_seed.take() {
                self.pipeline.secure.transport = Some(SecureTransport::new(engine));
            }
        }

        let candidates = description.transport.candidates.clone();
        self.remote_description = Some(description);
        for candidate in &candidates {
            self.add_remote_candidate(candidate)?;
        }

        self.process_events();
        self.update_connection_state();
        Ok(())
    }

    pub fn add_remote_candidate(&mut self, candidate: &CandidateInit) -> Result<()> {
        if self.closed {
            return Err(Error::ErrConnectionClosed);
        }
        if self.remote_description.is_none() {
            return Err(Error::ErrNoRemoteDescription);
        }
        if let Some(agent) = self.pipeline.candidate.agent.as_mut() {
            agent.add_remote_candidate(candidate)?;
        }
        self.process_events();
        self.update_connection_state();
        Ok(())
    }

    //////////////////////////////////////////////////
    // Channels
    //////////////////////////////////////////////////

    /// Create a channel. Before the reliable-message transport is ready
    /// the channel is queued, not failed; it opens once negotiation and
    /// transports complete.
    pub fn create_channel(
        &mut self,
        label: &str,
        init: Option<ChannelInit>,
    ) -> Result<Channel<'_>> {
        if self.closed {
            return Err(Error::ErrConnectionClosed);
        }
        let init = init.unwrap_or_default();
        if init.protocol.len() > 65535 {
            return Err(Error::ErrProtocolTooLarge);
        }
        if let Some(stream_id) = init.stream_id {
            if self.stream_index.contains_key(&stream_id) {
                return Err(Error::ErrStreamAlreadyExists(stream_id));
            }
        }
        let id = self.next_channel_id;
        self.next_channel_id = self.next_channel_id.wrapping_add(1);
        self.channels
            .insert(id, ChannelInner::new(label.to_string(), init));
        self.negotiation_needed = self.local_description.is_some();

        if self
            .pipeline
            .mux
            .association
            .as_ref()
            .is_some_and(|a| a.is_established())
        {
            self.start_channel(id)?;
        }
        Ok(Channel {
            id,
            connection: self,
        })
    }

    pub fn channel(&mut self, id: ChannelId) -> Option<Channel<'_>> {
        if self.channels.contains_key(&id) {
            Some(Channel {
                id,
                connection: self,
            })
        } else {
            None
        }
    }

    /// Assign the stream, register it on the association and run the open
    /// handshake (or open immediately when pre-negotiated).
    fn start_channel(&mut self, id: ChannelId) -> Result<()> {
        let role = self.secure_role.unwrap_or(SecureRole::Client);
        let max_streams = self.max_channel_streams();
        let Some(association) = self.pipeline.mux.association.as_mut() else {
            return Err(Error::ErrAssociationNotEstablished);
        };
        let Some(inner) = self.channels.get_mut(&id) else {
            return Err(Error::ErrChannelNotFound(id));
        };
        if inner.state != ChannelState::Connecting {
            return Ok(());
        }

        let stream_id = match inner.stream_id {
            Some(stream_id) => stream_id,
            None => {
                // Even identifiers for the handshake client, odd for the
                // server
                let mut candidate = match role {
                    SecureRole::Client => 0u16,
                    SecureRole::Server => 1u16,
                };
                while self.stream_index.contains_key(&candidate) {
                    candidate = candidate
                        .checked_add(2)
                        .ok_or(Error::ErrStreamIdsExhausted)?;
                }
                if candidate >= max_streams {
                    return Err(Error::ErrStreamIdsExhausted);
                }
                candidate
            }
        };
        association.open_stream(stream_id, inner.reliability)?;
        association.set_buffered_amount_low_threshold(stream_id, inner.low_threshold);
        inner.stream_id = Some(stream_id);
        self.stream_index.insert(stream_id, id);

        if inner.negotiated {
            self.open_channel_now(id);
        } else {
            let open = ChannelMessage::Open(ChannelOpen {
                channel_type: channel_type_and_parameter(&inner.reliability).0,
                priority: CHANNEL_PRIORITY_NORMAL,
                reliability_parameter: channel_type_and_parameter(&inner.reliability).1,
                label: inner.label.clone(),
                protocol: inner.protocol.clone(),
            });
            let control = crate::handler::channel::control_message(stream_id, &open)?;
            self.pipeline.write_ins.push_back(TaggedEngineMessage {
                now: self.last_now,
                transport: TransportContext::default(),
                message: EngineMessage::Secure(SecureMessage::Stream(control)),
            });
        }
        Ok(())
    }

    /// Transition a channel to Open and flush sends queued while it was
    /// connecting.
    fn open_channel_now(&mut self, id: ChannelId) {
        let Some(inner) = self.channels.get_mut(&id) else {
            return;
        };
        if inner.state == ChannelState::Open {
            return;
        }
        inner.state = ChannelState::Open;
        let pending: Vec<(bool, BytesMut)> = inner.pending_sends.drain(..).collect();
        for (binary, data) in pending {
            self.pipeline.write_ins.push_back(TaggedEngineMessage {
                now: self.last_now,
                transport: TransportContext::default(),
                message: EngineMessage::Secure(SecureMessage::Application(AppMessage {
                    channel_id: id,
                    binary,
                    data,
                })),
            });
        }
        self.events.push_back(Event::Channel(ChannelEvent::Open(id)));
    }

    pub(crate) fn channel_send(
        &mut self,
        id: ChannelId,
        binary: bool,
        data: BytesMut,
    ) -> Result<()> {
        let max_message_size = self.max_message_size();
        let send_ceiling = self.tuning.send_buffer_size as usize;
        let assoc_buffered = self
            .channels
            .get(&id)
            .and_then(|c| c.stream_id)
            .map(|stream_id| self.stream_buffered_amount(stream_id))
            .unwrap_or(0);
        let Some(inner) = self.channels.get_mut(&id) else {
            return Err(Error::ErrChannelNotFound(id));
        };
        match inner.state {
            ChannelState::Closing | ChannelState::Closed => {
                return Err(Error::ErrChannelClosed);
            }
            ChannelState::Connecting | ChannelState::Open => {}
        }
        if data.len() > max_message_size {
            return Err(Error::ErrOutboundPacketTooLarge);
        }
        if inner.queued_bytes + assoc_buffered + data.len() > send_ceiling {
            return Err(Error::ErrSendBufferFull);
        }
        inner.queued_bytes += data.len();
        if inner.state == ChannelState::Open && inner.stream_id.is_some() {
            self.pipeline.write_ins.push_back(TaggedEngineMessage {
                now: self.last_now,
                transport: TransportContext::default(),
                message: EngineMessage::Secure(SecureMessage::Application(AppMessage {
                    channel_id: id,
                    binary,
                    data,
                })),
            });
        } else {
            inner.pending_sends.push_back((binary, data));
        }
        Ok(())
    }

    pub(crate) fn channel_set_low_threshold(
        &mut self,
        id: ChannelId,
        threshold: usize,
    ) -> Result<()> {
        let Some(inner) = self.channels.get_mut(&id) else {
            return Err(Error::ErrChannelNotFound(id));
        };
        inner.low_threshold = threshold;
        let stream_id = inner.stream_id;
        if let (Some(stream_id), Some(association)) =
            (stream_id, self.pipeline.mux.association.as_mut())
        {
            association.set_buffered_amount_low_threshold(stream_id, threshold);
        }
        Ok(())
    }

    pub(crate) fn channel_close(&mut self, id: ChannelId) -> Result<()> {
        let Some(inner) = self.channels.get_mut(&id) else {
            return Err(Error::ErrChannelNotFound(id));
        };
        if inner.state == ChannelState::Closed {
            return Ok(());
        }
        inner.state = ChannelState::Closed;
        inner.pending_sends.clear();
        inner.queued_bytes = 0;
        let stream_id = inner.stream_id;
        if let (Some(stream_id), Some(association)) =
            (stream_id, self.pipeline.mux.association.as_mut())
        {
            if association.is_established() {
                let _ = association.reset_stream(stream_id);
            }
        }
        self.events
            .push_back(Event::Channel(ChannelEvent::Closed(id)));
        Ok(())
    }

    pub(crate) fn stream_buffered_amount(&self, stream_id: u16) -> usize {
        self.pipeline
            .mux
            .association
            .as_ref()
            .map(|a| a.buffered_amount(stream_id))
            .unwrap_or(0)
    }

    //////////////////////////////////////////////////
    // Tracks
    //////////////////////////////////////////////////

    pub fn add_track(&mut self, init: TrackInit) -> Result<Track<'_>> {
        if self.closed {
            return Err(Error::ErrConnectionClosed);
        }
        if self.ssrc_index.contains_key(&init.ssrc) {
            return Err(Error::Other(format!("ssrc {} already in use", init.ssrc)));
        }
        let id = self.next_track_id;
        self.next_track_id = self.next_track_id.wrapping_add(1);
        let ssrc = init.ssrc;
        let mut inner = TrackInner::new(init);
        if self.pipeline.media.media_keys.is_some() {
            inner.open = true;
            self.events.push_back(Event::Track(TrackEvent::Open(id)));
        }
        self.tracks.insert(id, inner);
        self.ssrc_index.insert(ssrc, id);
        self.negotiation_needed = self.local_description.is_some();
        Ok(Track {
            id,
            connection: self,
        })
    }

    pub fn track(&mut self, id: TrackId) -> Option<Track<'_>> {
        if self.tracks.contains_key(&id) {
            Some(Track {
                id,
                connection: self,
            })
        } else {
            None
        }
    }

    pub(crate) fn track_set_packetizer(
        &mut self,
        id: TrackId,
        init: TrackPacketizerInit,
    ) -> Result<()> {
        let Some(inner) = self.tracks.get_mut(&id) else {
            return Err(Error::ErrTrackNotFound(id));
        };
        let format = match inner.codec {
            Codec::H264 | Codec::H265 => PayloadFormat::H264 {
                separator: init.nal_separator,
            },
            Codec::Av1 => PayloadFormat::Av1 {
                packetization: init.obu_packetization,
            },
            // Remaining codecs map one sample to one packet
            _ => PayloadFormat::Audio,
        };
        let mut packetizer_init =
            PacketizerInit::new(inner.ssrc, inner.payload_type, init.clock_rate, format);
        if let Some(sequence_number) = init.sequence_number {
            packetizer_init.sequence_number = sequence_number;
        }
        if let Some(timestamp) = init.timestamp {
            packetizer_init.timestamp = timestamp;
        }
        if init.max_fragment_size > 0 {
            packetizer_init.max_fragment_size = init.max_fragment_size;
        }
        inner.packetizer = Some(Packetizer::new(packetizer_init)?);
        Ok(())
    }

    pub(crate) fn track_chain_reporting_session(
        &mut self,
        id: TrackId,
        max_stored_packets: usize,
    ) -> Result<()> {
        let Some(inner) = self.tracks.get_mut(&id) else {
            return Err(Error::ErrTrackNotFound(id));
        };
        let Some(packetizer) = inner.packetizer.as_ref() else {
            return Err(Error::ErrNoPacketizer);
        };
        let cname = inner
            .name
            .clone()
            .unwrap_or_else(|| format!("peerlink-{}", inner.ssrc));
        let mut config = ReportingSessionConfig::new(inner.ssrc, cname, packetizer.clock_rate());
        config.max_stored_packets = max_stored_packets;
        inner.reporting = Some(ReportingSession::new(config));
        Ok(())
    }

    pub(crate) fn track_send_sample(&mut self, id: TrackId, sample: &[u8]) -> Result<()> {
        if self.pipeline.media.media_keys.is_none() {
            return Err(Error::ErrKeyingMaterialUnavailable);
        }
        let Some(inner) = self.tracks.get_mut(&id) else {
            return Err(Error::ErrTrackNotFound(id));
        };
        if inner.closed {
            return Err(Error::ErrTrackNotFound(id));
        }
        let Some(packetizer) = inner.packetizer.as_mut() else {
            return Err(Error::ErrNoPacketizer);
        };
        let timestamp = packetizer.timestamp();
        let packets = packetizer.packetize(sample, timestamp)?;
        for packet in packets {
            self.pipeline.write_ins.push_back(TaggedEngineMessage {
                now: self.last_now,
                transport: TransportContext::default(),
                message: EngineMessage::Media(MediaMessage::Packet(packet)),
            });
        }
        Ok(())
    }

    pub(crate) fn track_request_key_frame(&mut self, id: TrackId) -> Result<()> {
        let Some(inner) = self.tracks.get(&id) else {
            return Err(Error::ErrTrackNotFound(id));
        };
        let compound = marshal_compound(&[RtcpPacket::PictureLoss(PictureLoss {
            sender_ssrc: 0,
            media_ssrc: inner.ssrc,
        })])?;
        self.queue_media_control(compound)
    }

    pub(crate) fn track_request_bitrate(&mut self, id: TrackId, bitrate: u64) -> Result<()> {
        let Some(inner) = self.tracks.get(&id) else {
            return Err(Error::ErrTrackNotFound(id));
        };
        let compound = marshal_compound(&[RtcpPacket::ReceiverEstimate(ReceiverEstimate {
            sender_ssrc: 0,
            bitrate,
            ssrcs: vec![inner.ssrc],
        })])?;
        self.queue_media_control(compound)
    }

    fn queue_media_control(&mut self, compound: bytes::Bytes) -> Result<()> {
        if self.pipeline.media.media_keys.is_none() {
            return Err(Error::ErrKeyingMaterialUnavailable);
        }
        self.pipeline.write_ins.push_back(TaggedEngineMessage {
            now: self.last_now,
            transport: TransportContext::default(),
            message: EngineMessage::Media(MediaMessage::Raw(BytesMut::from(&compound[..]))),
        });
        Ok(())
    }

    pub(crate) fn track_close(&mut self, id: TrackId) -> Result<()> {
        let Some(inner) = self.tracks.get_mut(&id) else {
            return Err(Error::ErrTrackNotFound(id));
        };
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        inner.open = false;
        // The reporting session dies with the track
        inner.reporting = None;
        self.events.push_back(Event::Track(TrackEvent::Closed(id)));
        Ok(())
    }

    //////////////////////////////////////////////////
    // Sans-I/O surface
    //////////////////////////////////////////////////

    /// Feed one inbound datagram.
    pub fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<()> {
        self.last_now = msg.now;
        let result = self.pipeline_read(msg);
        self.process_events();
        self.update_connection_state();
        result
    }

    /// Drain the next outbound datagram, running queued application
    /// messages and layer output down the pipeline first.
    pub fn poll_write(&mut self) -> Option<TaggedBytesMut> {
        self.pipeline_write_flush();
        self.process_events();
        self.update_connection_state();
        self.pipeline.raw_outs.pop_front()
    }

    /// Drive every layer's timers.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        use shared::Protocol;
        self.last_now = now;
        {
            let mut handler = self.get_candidate_handler();
            handler.handle_timeout(now)?;
        }
        {
            let mut handler = self.get_secure_handler();
            handler.handle_timeout(now)?;
        }
        {
            let mut handler = self.get_mux_handler();
            handler.handle_timeout(now)?;
        }
        {
            let mut handler = self.get_media_handler();
            handler.handle_timeout(now)?;
        }
        self.process_events();
        self.update_connection_state();
        Ok(())
    }

    /// Earliest deadline across every layer.
    pub fn poll_timeout(&mut self) -> Option<Instant> {
        use shared::Protocol;
        let mut deadline: Option<Instant> = None;
        macro_rules! fold_timeout {
            ($getter:ident) => {{
                let mut handler = self.$getter();
                if let Some(next) = handler.poll_timeout() {
                    deadline = Some(match deadline {
                        Some(current) => current.min(next),
                        None => next,
                    });
                }
            }};
        }
        fold_timeout!(get_candidate_handler);
        fold_timeout!(get_secure_handler);
        fold_timeout!(get_mux_handler);
        fold_timeout!(get_media_handler);
        deadline
    }

    /// Drain the next notification.
    pub fn poll_event(&mut self) -> Option<Event> {
        self.process_events();
        self.update_connection_state();
        self.events.pop_front()
    }

    /// Close the connection: channels and tracks observe their closed
    /// transitions, transports tear down gracefully, pending timers are
    /// cancelled. Idempotent.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let channel_ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in channel_ids {
            let _ = self.channel_close(id);
        }
        let track_ids: Vec<TrackId> = self.tracks.keys().copied().collect();
        for id in track_ids {
            let _ = self.track_close(id);
        }

        if let Some(association) = self.pipeline.mux.association.as_mut() {
            association.close(self.last_now);
        }
        if let Some(transport) = self.pipeline.secure.transport.as_mut() {
            transport.close();
        }
        if let Some(agent) = self.pipeline.candidate.agent.as_mut() {
            let _ = agent.close();
        }

        self.set_signaling_state(SignalingState::Closed);
        if self.state != ConnectionState::Closed {
            self.state = ConnectionState::Closed;
            self.events
                .push_back(Event::StateChange(ConnectionState::Closed));
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    //////////////////////////////////////////////////
    // Orchestration
    //////////////////////////////////////////////////

    fn set_signaling_state(&mut self, next: SignalingState) {
        if self.signaling_state != next {
            self.signaling_state = next;
            self.events.push_back(Event::SignalingStateChange(next));
        }
    }

    fn process_events(&mut self) {
        for _ in 0..8 {
            if !self.process_events_once() {
                break;
            }
        }
    }

    fn process_events_once(&mut self) -> bool {
        let mut any = false;

        // Connectivity transport
        let mut agent_events = Vec::new();
        if let Some(agent) = self.pipeline.candidate.agent.as_mut() {
            while let Some(event) = agent.poll_event() {
                agent_events.push(event);
            }
        }
        for event in agent_events {
            any = true;
            match event {
                AgentEvent::StateChange(state) => {
                    self.connectivity_state = state;
                    self.events.push_back(Event::ConnectivityStateChange(state));
                    if state == ConnectivityState::Failed {
                        self.fail("connectivity failure");
                    }
                }
                AgentEvent::GatheringStateChange(state) => {
                    self.gathering_state = state;
                    self.events.push_back(Event::GatheringStateChange(state));
                }
                AgentEvent::Candidate(candidate) => {
                    self.events.push_back(Event::LocalCandidate(candidate));
                }
                AgentEvent::SelectedPair { local, remote } => {
                    self.selected_pair = Some((local, remote));
                    self.events.push_back(Event::SelectedPair { local, remote });
                    self.try_start_secure();
                }
            }
        }

        // Secure transport
        let mut secure_events = Vec::new();
        if let Some(transport) = self.pipeline.secure.transport.as_mut() {
            while let Some(event) = transport.poll_event() {
                secure_events.push(event);
            }
        }
        for event in secure_events {
            any = true;
            match event {
                SecureEvent::Established(keys) => {
                    debug!("secure transport established, creating association");
                    self.pipeline.media.media_keys = Some(keys.media);
                    self.start_association();
                    let track_ids: Vec<TrackId> = self
                        .tracks
                        .iter()
                        .filter(|(_, t)| !t.open && !t.closed)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in track_ids {
                        if let Some(track) = self.tracks.get_mut(&id) {
                            track.open = true;
                        }
                        self.events.push_back(Event::Track(TrackEvent::Open(id)));
                    }
                }
                SecureEvent::Failed(err) => {
                    self.fail(&format!("secure transport failure: {err}"));
                }
                SecureEvent::PeerClosed => {
                    let _ = self.close();
                }
            }
        }

        // Reliable-message transport
        let mut mux_events = Vec::new();
        while let Some(event) = self.pipeline.mux.event_outs.pop_front() {
            mux_events.push(event);
        }
        for event in mux_events {
            any = true;
            match event {
                AssociationEvent::Established { .. } => {
                    let ids: Vec<ChannelId> = self
                        .channels
                        .iter()
                        .filter(|(_, c)| c.state == ChannelState::Connecting)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in ids {
                        if let Err(err) = self.start_channel(id) {
                            warn!("channel {id} failed to start: {err}");
                            self.events.push_back(Event::Channel(ChannelEvent::Error(
                                id,
                                err.to_string(),
                            )));
                        }
                    }
                }
                AssociationEvent::BufferedAmountLow { stream_id } => {
                    if let Some(&id) = self.stream_index.get(&stream_id) {
                        self.events
                            .push_back(Event::Channel(ChannelEvent::BufferedAmountLow(id)));
                    }
                }
                AssociationEvent::StreamReset { stream_id } => {
                    if let Some(&id) = self.stream_index.get(&stream_id) {
                        let reset_back = {
                            let inner = self.channels.get_mut(&id);
                            match inner {
                                Some(inner) if inner.state != ChannelState::Closed => {
                                    inner.state = ChannelState::Closed;
                                    inner.pending_sends.clear();
                                    true
                                }
                                _ => false,
                            }
                        };
                        if reset_back {
                            // Complete the bidirectional close
                            if let Some(association) = self.pipeline.mux.association.as_mut() {
                                if association.is_established() {
                                    let _ = association.reset_stream(stream_id);
                                }
                            }
                            self.events
                                .push_back(Event::Channel(ChannelEvent::Closed(id)));
                        }
                    }
                }
                AssociationEvent::Error(err) => {
                    self.fail(&format!("association failure: {err}"));
                }
                AssociationEvent::Closed => {
                    let ids: Vec<ChannelId> = self
                        .channels
                        .iter()
                        .filter(|(_, c)| c.state != ChannelState::Closed)
                        .map(|(id, _)| *id)
                        .collect();
                    for id in ids {
                        if let Some(inner) = self.channels.get_mut(&id) {
                            inner.state = ChannelState::Closed;
                            inner.pending_sends.clear();
                        }
                        self.events
                            .push_back(Event::Channel(ChannelEvent::Closed(id)));
                    }
                }
                AssociationEvent::Data { .. } => unreachable!("data drained in the mux handler"),
            }
        }

        // Channel signaling
        let mut notices = Vec::new();
        while let Some(notice) = self.pipeline.channel.notices.pop_front() {
            notices.push(notice);
        }
        for notice in notices {
            any = true;
            match notice {
                ChannelNotice::RemoteOpen {
                    stream_id,
                    reliability,
                    label,
                    protocol,
                } => {
                    self.on_remote_open(stream_id, reliability, label, protocol);
                }
                ChannelNotice::AckReceived { stream_id } => {
                    if let Some(&id) = self.stream_index.get(&stream_id) {
                        self.open_channel_now(id);
                    } else {
                        warn!("ack for unknown stream {stream_id}");
                    }
                }
                ChannelNotice::Available { channel_id } => {
                    let available = self
                        .channels
                        .get(&channel_id)
                        .map(|c| c.available)
                        .unwrap_or(0);
                    self.events.push_back(Event::Channel(ChannelEvent::Available {
                        id: channel_id,
                        available,
                    }));
                }
            }
        }

        // Media feedback
        let mut media_notices = Vec::new();
        while let Some(notice) = self.pipeline.media.notices.pop_front() {
            media_notices.push(notice);
        }
        for notice in media_notices {
            any = true;
            match notice {
                MediaNotice::Available { track_id } => {
                    let available = self
                        .tracks
                        .get(&track_id)
                        .map(|t| t.available)
                        .unwrap_or(0);
                    self.events.push_back(Event::Track(TrackEvent::Available {
                        id: track_id,
                        available,
                    }));
                }
                MediaNotice::Feedback { track_id, event } => match event {
                    ReportEvent::KeyFrameRequested => {
                        self.events
                            .push_back(Event::Track(TrackEvent::KeyFrameRequested(track_id)));
                    }
                    ReportEvent::BitrateEstimate(bitrate) => {
                        self.events
                            .push_back(Event::Track(TrackEvent::BitrateRequested(
                                track_id, bitrate,
                            )));
                    }
                },
            }
        }

        any
    }

    fn try_start_secure(&mut self) {
        let Some(role) = self.secure_role else {
            return;
        };
        if self.selected_pair.is_none() {
            return;
        }
        let now = self.last_now;
        if let Some(transport) = self.pipeline.secure.transport.as_mut() {
            if transport.state() == SecureState::New {
                debug!("pair selected, opening secure transport as {role:?}");
                if let Err(err) = transport.open(role, now) {
                    warn!("secure transport open failed: {err}");
                }
            }
        }
    }

    fn start_association(&mut self) {
        if self.pipeline.mux.association.is_some() {
            return;
        }
        let role = match self.secure_role.unwrap_or(SecureRole::Client) {
            SecureRole::Client => MuxRole::Client,
            SecureRole::Server => MuxRole::Server,
        };
        self.pipeline.mux.association = Some(Association::new(
            role,
            self.tuning.clone(),
            self.last_now,
        ));
    }

    fn on_remote_open(
        &mut self,
        stream_id: u16,
        reliability: Reliability,
        label: String,
        protocol: String,
    ) {
        if let Some(&existing) = self.stream_index.get(&stream_id) {
            // Duplicate open for a channel we already track: re-ack
            debug!("duplicate open for stream {stream_id} (channel {existing})");
            self.queue_channel_ack(stream_id);
            return;
        }
        let id = self.next_channel_id;
        self.next_channel_id = self.next_channel_id.wrapping_add(1);
        let mut inner = ChannelInner::new(
            label,
            ChannelInit {
                reliability,
                protocol,
                negotiated: false,
                stream_id: Some(stream_id),
            },
        );
        inner.state = ChannelState::Open;
        self.channels.insert(id, inner);
        self.stream_index.insert(stream_id, id);
        if let Some(association) = self.pipeline.mux.association.as_mut() {
            // Register our outgoing half with the same policy
            let _ = association.open_stream(stream_id, reliability);
            let low = self
                .channels
                .get(&id)
                .map(|c| c.low_threshold)
                .unwrap_or(0);
            association.set_buffered_amount_low_threshold(stream_id, low);
        }
        self.queue_channel_ack(stream_id);
        self.events.push_back(Event::Channel(ChannelEvent::Open(id)));
    }

    fn queue_channel_ack(&mut self, stream_id: u16) {
        match crate::handler::channel::control_message(stream_id, &ChannelMessage::Ack) {
            Ok(control) => self.pipeline.write_ins.push_back(TaggedEngineMessage {
                now: self.last_now,
                transport: TransportContext::default(),
                message: EngineMessage::Secure(SecureMessage::Stream(control)),
            }),
            Err(err) => warn!("failed to marshal channel ack: {err}"),
        }
    }

    /// Unrecoverable failure: terminal for the connection, propagated to
    /// every channel and track.
    fn fail(&mut self, reason: &str) {
        if matches!(self.state, ConnectionState::Failed | ConnectionState::Closed) {
            return;
        }
        warn!("connection failed: {reason}");
        self.state = ConnectionState::Failed;
        self.events
            .push_back(Event::StateChange(ConnectionState::Failed));

        let channel_ids: Vec<ChannelId> = self.channels.keys().copied().collect();
        for id in channel_ids {
            if let Some(inner) = self.channels.get_mut(&id) {
                if inner.state != ChannelState::Closed {
                    inner.state = ChannelState::Closed;
                    inner.pending_sends.clear();
                    self.events.push_back(Event::Channel(ChannelEvent::Error(
                        id,
                        reason.to_string(),
                    )));
                    self.events
                        .push_back(Event::Channel(ChannelEvent::Closed(id)));
                }
            }
        }
        let track_ids: Vec<TrackId> = self.tracks.keys().copied().collect();
        for id in track_ids {
            if let Some(inner) = self.tracks.get_mut(&id) {
                if !inner.closed {
                    inner.closed = true;
                    self.events
                        .push_back(Event::Track(TrackEvent::Error(id, reason.to_string())));
                    self.events.push_back(Event::Track(TrackEvent::Closed(id)));
                }
            }
        }
    }

    /// Aggregate the transports into the publicly observable state.
    fn update_connection_state(&mut self) {
        if matches!(self.state, ConnectionState::Failed | ConnectionState::Closed) {
            return;
        }
        let secure_ready = self
            .pipeline
            .secure
            .transport
            .as_ref()
            .is_some_and(|t| t.state() == SecureState::Connected);
        let mux_ready = self
            .pipeline
            .mux
            .association
            .as_ref()
            .is_some_and(|a| a.is_established());

        let next = if secure_ready && (self.channels.is_empty() || mux_ready) {
            ConnectionState::Connected
        } else if self.connectivity_state == ConnectivityState::Disconnected {
            ConnectionState::Disconnected
        } else if self.negotiation_started {
            ConnectionState::Connecting
        } else {
            ConnectionState::New
        };

        // Connected may degrade to Disconnected and recover, never to
        // Connecting
        let next = match (self.state, next) {
            (ConnectionState::Connected, ConnectionState::Connecting) => ConnectionState::Connected,
            _ => next,
        };

        if self.state != next {
            self.state = next;
            self.events.push_back(Event::StateChange(next));
        }
    }
}
