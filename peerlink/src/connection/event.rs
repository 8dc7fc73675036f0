use std::net::SocketAddr;

use crate::channel::ChannelId;
use crate::connection::state::{
    ConnectionState, ConnectivityState, GatheringState, SignalingState,
};
use crate::description::{CandidateInit, SessionDescription};
use crate::track::TrackId;

/// Channel notifications. Message payloads stay queued on the channel
/// until pulled with [receive](crate::channel::Channel::receive); the
/// event only announces their arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open(ChannelId),
    Closed(ChannelId),
    Error(ChannelId, String),
    /// Inbound data is waiting; `available` is the queued byte total
    Available { id: ChannelId, available: usize },
    /// Outbound buffer drained to the configured low watermark
    BufferedAmountLow(ChannelId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackEvent {
    Open(TrackId),
    Closed(TrackId),
    Error(TrackId, String),
    /// A media packet is queued on the track
    Available { id: TrackId, available: usize },
    /// The peer asked for an immediate key frame
    KeyFrameRequested(TrackId),
    /// The peer reported a receiver-side bitrate estimate
    BitrateRequested(TrackId, u64),
}

/// Connection events, drained with
/// [poll_event](crate::connection::Connection::poll_event).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The local description is ready for the signaling channel
    LocalDescription(SessionDescription),
    /// A local candidate is ready for the signaling channel
    LocalCandidate(CandidateInit),
    StateChange(ConnectionState),
    ConnectivityStateChange(ConnectivityState),
    GatheringStateChange(GatheringState),
    SignalingStateChange(SignalingState),
    /// A working address pair was selected
    SelectedPair { local: SocketAddr, remote: SocketAddr },
    /// Renegotiation is required to reflect local changes
    NegotiationNeeded,
    Channel(ChannelEvent),
    Track(TrackEvent),
}
