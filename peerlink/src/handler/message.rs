//! Internal message taxonomy flowing through the handler pipeline.

use std::time::Instant;

use bytes::BytesMut;

use mux::PayloadKind;
use shared::TransportContext;

use crate::channel::ChannelId;

/// Connectivity-check traffic.
#[derive(Debug)]
pub(crate) enum CandidateMessage {
    Raw(BytesMut),
}

/// One association stream payload between the mux and channel layers.
#[derive(Debug)]
pub(crate) struct StreamMessage {
    pub(crate) stream_id: u16,
    pub(crate) kind: PayloadKind,
    pub(crate) payload: BytesMut,
}

/// Channel-level application traffic between the channel layer and the
/// public surface.
#[derive(Debug)]
pub(crate) struct AppMessage {
    pub(crate) channel_id: ChannelId,
    pub(crate) binary: bool,
    pub(crate) data: BytesMut,
}

/// Secure-transport traffic at its successive unwrapping stages.
#[derive(Debug)]
pub(crate) enum SecureMessage {
    /// Ciphertext records on the wire side
    Raw(BytesMut),
    /// Deprotected association packet bytes
    Plain(BytesMut),
    /// Demultiplexed stream payload
    Stream(StreamMessage),
    /// Channel application message
    Application(AppMessage),
}

/// Media-transport traffic.
#[derive(Debug)]
pub(crate) enum MediaMessage {
    /// Protected packet bytes on the wire side
    Raw(BytesMut),
    /// One outbound media packet
    Packet(media::Packet),
}

#[derive(Debug)]
pub(crate) enum EngineMessage {
    /// Raw datagram at the socket boundary
    Raw(BytesMut),
    Candidate(CandidateMessage),
    Secure(SecureMessage),
    Media(MediaMessage),
}

pub(crate) struct TaggedEngineMessage {
    pub(crate) now: Instant,
    pub(crate) transport: TransportContext,
    pub(crate) message: EngineMessage,
}
