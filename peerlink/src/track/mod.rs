use std::collections::VecDeque;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use media::packetizer::{NalSeparator, ObuPacketization, Packetizer};
use media::report::ReportingSession;
use shared::error::{Error, Result};

use crate::connection::Connection;

/// Identifier for a track within one connection.
pub type TrackId = u32;

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Unknown,
    SendOnly,
    RecvOnly,
    SendRecv,
    Inactive,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    // video
    H264,
    Vp8,
    Vp9,
    H265,
    Av1,
    // audio
    Opus,
    Pcmu,
    Pcma,
    Aac,
    G722,
}

impl Codec {
    pub fn is_video(&self) -> bool {
        matches!(
            self,
            Codec::H264 | Codec::Vp8 | Codec::Vp9 | Codec::H265 | Codec::Av1
        )
    }
}

/// Track creation options.
#[derive(Debug, Clone)]
pub struct TrackInit {
    pub direction: Direction,
    pub codec: Codec,
    pub payload_type: u8,
    pub ssrc: u32,
    pub mid: String,
    pub name: Option<String>,
    pub msid: Option<String>,
    pub profile: Option<String>,
}

/// Codec-specific packetizer options; unset cursors are randomized.
#[derive(Debug, Clone)]
pub struct TrackPacketizerInit {
    pub clock_rate: u32,
    pub sequence_number: Option<u16>,
    pub timestamp: Option<u32>,
    /// Zero means the engine default
    pub max_fragment_size: usize,
    /// Unit separator for the NAL-unit codec family
    pub nal_separator: NalSeparator,
    /// Unit grouping for the OBU codec family
    pub obu_packetization: ObuPacketization,
}

impl TrackPacketizerInit {
    pub fn new(clock_rate: u32) -> Self {
        Self {
            clock_rate,
            sequence_number: None,
            timestamp: None,
            max_fragment_size: 0,
            nal_separator: NalSeparator::default(),
            obu_packetization: ObuPacketization::default(),
        }
    }
}

pub(crate) struct TrackInner {
    pub(crate) direction: Direction,
    pub(crate) codec: Codec,
    pub(crate) payload_type: u8,
    pub(crate) ssrc: u32,
    pub(crate) mid: String,
    pub(crate) name: Option<String>,
    pub(crate) open: bool,
    pub(crate) closed: bool,
    pub(crate) packetizer: Option<Packetizer>,
    pub(crate) reporting: Option<ReportingSession>,
    /// RTP timestamp of the peer's most recent sender report
    pub(crate) last_remote_report: Option<u32>,
    pub(crate) inbound: VecDeque<Bytes>,
    pub(crate) available: usize,
}

impl TrackInner {
    pub(crate) fn new(init: TrackInit) -> Self {
        Self {
            direction: init.direction,
            codec: init.codec,
            payload_type: init.payload_type,
            ssrc: init.ssrc,
            mid: init.mid,
            name: init.name,
            open: false,
            closed: false,
            packetizer: None,
            reporting: None,
            last_remote_report: None,
            inbound: VecDeque::new(),
            available: 0,
        }
    }

    pub(crate) fn push_inbound(&mut self, packet: Bytes) {
        self.available += packet.len();
        self.inbound.push_back(packet);
    }
}

/// Handle to one media track, borrowed from its connection.
pub struct Track<'a> {
    pub(crate) id: TrackId,
    pub(crate) connection: &'a mut Connection,
}

impl Track<'_> {
    pub fn id(&self) -> TrackId {
        self.id
    }

    fn inner(&self) -> Result<&TrackInner> {
        self.connection
            .tracks
            .get(&self.id)
            .ok_or(Error::ErrTrackNotFound(self.id))
    }

    fn inner_mut(&mut self) -> Result<&mut TrackInner> {
        self.connection
            .tracks
            .get_mut(&self.id)
            .ok_or(Error::ErrTrackNotFound(self.id))
    }

    pub fn mid(&self) -> Result<String> {
        Ok(self.inner()?.mid.clone())
    }

    pub fn direction(&self) -> Result<Direction> {
        Ok(self.inner()?.direction)
    }

    pub fn codec(&self) -> Result<Codec> {
        Ok(self.inner()?.codec)
    }

    pub fn ssrc(&self) -> Result<u32> {
        Ok(self.inner()?.ssrc)
    }

    /// Human-readable media description line.
    pub fn description(&self) -> Result<String> {
        let inner = self.inner()?;
        Ok(format!(
            "{} {:?} pt={} ssrc={}",
            inner.mid, inner.codec, inner.payload_type, inner.ssrc
        ))
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner().map(|t| t.open && !t.closed), Ok(true))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.inner().map(|t| t.closed), Ok(true) | Err(_))
    }

    /// Attach a packetizer built from this track's codec family.
    pub fn set_packetizer(&mut self, init: TrackPacketizerInit) -> Result<()> {
        let id = self.id;
        self.connection.track_set_packetizer(id, init)
    }

    /// Chain the reporting session: periodic sender reports plus a
    /// retransmission cache holding `max_stored_packets` sent packets.
    pub fn chain_reporting_session(&mut self, max_stored_packets: usize) -> Result<()> {
        let id = self.id;
        self.connection
            .track_chain_reporting_session(id, max_stored_packets)
    }

    /// Packetize and queue one media sample at the packetizer's current
    /// timestamp.
    pub fn send_sample(&mut self, sample: &[u8]) -> Result<()> {
        let id = self.id;
        self.connection.track_send_sample(id, sample)
    }

    /// Ask the remote sender of this track for an immediate key frame.
    pub fn request_key_frame(&mut self) -> Result<()> {
        let id = self.id;
        self.connection.track_request_key_frame(id)
    }

    /// Report a receiver-side bitrate estimate to the remote sender.
    pub fn request_bitrate(&mut self, bits_per_second: u64) -> Result<()> {
        let id = self.id;
        self.connection.track_request_bitrate(id, bits_per_second)
    }

    fn packetizer(&self) -> Result<&Packetizer> {
        self.inner()?.packetizer.as_ref().ok_or(Error::ErrNoPacketizer)
    }

    /// Exact linear mapping by the track's clock rate.
    pub fn seconds_to_timestamp(&self, seconds: f64) -> Result<u32> {
        Ok(self.packetizer()?.seconds_to_timestamp(seconds))
    }

    pub fn timestamp_to_seconds(&self, timestamp: u32) -> Result<f64> {
        Ok(self.packetizer()?.timestamp_to_seconds(timestamp))
    }

    pub fn current_timestamp(&self) -> Result<u32> {
        Ok(self.packetizer()?.timestamp())
    }

    pub fn set_timestamp(&mut self, timestamp: u32) -> Result<()> {
        self.inner_mut()?
            .packetizer
            .as_mut()
            .ok_or(Error::ErrNoPacketizer)?
            .set_timestamp(timestamp);
        Ok(())
    }

    /// Media timestamp of the last sender report: ours on a sending
    /// track, the peer's on a receiving track.
    pub fn last_sender_report_timestamp(&self) -> Result<Option<u32>> {
        let inner = self.inner()?;
        if let Some(reporting) = &inner.reporting {
            if let Some(timestamp) = reporting.last_report_timestamp() {
                return Ok(Some(timestamp));
            }
        }
        Ok(inner.last_remote_report)
    }

    /// Payload types this track maps to the given codec.
    pub fn payload_types_for_codec(&self, codec: Codec) -> Result<Vec<u8>> {
        let inner = self.inner()?;
        Ok(if inner.codec == codec {
            vec![inner.payload_type]
        } else {
            Vec::new()
        })
    }

    /// Synchronization sources carried by this track.
    pub fn ssrcs(&self) -> Result<Vec<u32>> {
        Ok(vec![self.inner()?.ssrc])
    }

    /// Canonical name advertised for a synchronization source.
    pub fn cname_for_ssrc(&self, ssrc: u32) -> Result<Option<String>> {
        let inner = self.inner()?;
        if inner.ssrc != ssrc {
            return Ok(None);
        }
        if let Some(reporting) = &inner.reporting {
            return Ok(Some(reporting.cname().to_string()));
        }
        Ok(inner.name.clone())
    }

    /// Bytes of inbound media packets queued for
    /// [receive](Self::receive).
    pub fn available_amount(&self) -> Result<usize> {
        Ok(self.inner()?.available)
    }

    /// Pull the next queued inbound media packet (full packet bytes)
    /// into `buf`; same contract as the channel receive.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<Option<usize>> {
        let inner = self.inner_mut()?;
        let Some(packet) = inner.inbound.front() else {
            return Ok(None);
        };
        if packet.len() > buf.len() {
            return Err(Error::ErrBufferTooSmall {
                required: packet.len(),
                provided: buf.len(),
            });
        }
        let packet = inner.inbound.pop_front().expect("front exists");
        inner.available = inner.available.saturating_sub(packet.len());
        buf[..packet.len()].copy_from_slice(&packet);
        Ok(Some(packet.len()))
    }

    /// Remove the track from the connection.
    pub fn close(&mut self) -> Result<()> {
        let id = self.id;
        self.connection.track_close(id)
    }
}
