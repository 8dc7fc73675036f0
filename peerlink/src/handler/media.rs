use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use log::{debug, trace, warn};

use media::report::ReportEvent;
use media::rtcp::{unmarshal_compound, RtcpPacket};
use shared::error::Error;
use shared::marshal::{Marshal, Unmarshal};
use shared::Protocol;

use super::message::{EngineMessage, MediaMessage, TaggedEngineMessage};
use crate::track::{TrackId, TrackInner};

#[derive(Debug)]
pub(crate) enum MediaNotice {
    Available { track_id: TrackId },
    Feedback { track_id: TrackId, event: ReportEvent },
}

#[derive(Default)]
pub(crate) struct MediaContext {
    /// Media keying context from the secure transport; traffic is held
    /// back until it exists. Packet protection itself lives behind the
    /// handshake-engine seam.
    pub(crate) media_keys: Option<[u8; 32]>,
    pub(crate) read_outs: VecDeque<TaggedEngineMessage>,
    pub(crate) write_outs: VecDeque<TaggedEngineMessage>,
    pub(crate) notices: VecDeque<MediaNotice>,
}

/// MediaHandler routes media packets to tracks and feedback reports to
/// their reporting sessions.
pub(crate) struct MediaHandler<'a> {
    ctx: &'a mut MediaContext,
    tracks: &'a mut HashMap<TrackId, TrackInner>,
    ssrc_index: &'a mut HashMap<u32, TrackId>,
}

impl<'a> MediaHandler<'a> {
    pub(crate) fn new(
        ctx: &'a mut MediaContext,
        tracks: &'a mut HashMap<TrackId, TrackInner>,
        ssrc_index: &'a mut HashMap<u32, TrackId>,
    ) -> Self {
        MediaHandler {
            ctx,
            tracks,
            ssrc_index,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        "MediaHandler"
    }

    fn handle_control(&mut self, now: Instant, raw: &[u8]) -> Result<(), Error> {
        let packets = unmarshal_compound(raw)?;
        // Record the peer's timestamp mapping for receive tracks
        for packet in &packets {
            if let RtcpPacket::SenderReport(sr) = packet {
                if let Some(&track_id) = self.ssrc_index.get(&sr.ssrc) {
                    if let Some(track) = self.tracks.get_mut(&track_id) {
                        track.last_remote_report = Some(sr.rtp_time);
                    }
                }
            }
        }
        // Feedback addressed to our sending sources
        for (&track_id, track) in self.tracks.iter_mut() {
            let Some(reporting) = track.reporting.as_mut() else {
                continue;
            };
            let (retransmissions, events) = reporting.handle_feedback(&packets);
            for wire in retransmissions {
                debug!("retransmit cached packet on ssrc {}", track.ssrc);
                self.ctx.write_outs.push_back(TaggedEngineMessage {
                    now,
                    transport: Default::default(),
                    message: EngineMessage::Media(MediaMessage::Raw(BytesMut::from(&wire[..]))),
                });
            }
            for event in events {
                self.ctx
                    .notices
                    .push_back(MediaNotice::Feedback { track_id, event });
            }
        }
        Ok(())
    }

    fn handle_packet(&mut self, raw: BytesMut) -> Result<(), Error> {
        let mut buf = &raw[..];
        let header = media::Header::unmarshal(&mut buf)?;
        let Some(&track_id) = self.ssrc_index.get(&header.ssrc) else {
            trace!("drop media packet with unknown ssrc {}", header.ssrc);
            return Ok(());
        };
        let Some(track) = self.tracks.get_mut(&track_id) else {
            return Ok(());
        };
        track.push_inbound(Bytes::from(raw.to_vec()));
        self.ctx.notices.push_back(MediaNotice::Available { track_id });
        Ok(())
    }
}

/// True when the payload-type byte falls in the control-report range of
/// the shared media demultiplexing rules.
fn is_control(raw: &[u8]) -> bool {
    raw.len() >= 2 && (192..=223).contains(&raw[1])
}

impl Protocol<TaggedEngineMessage, TaggedEngineMessage, ()> for MediaHandler<'_> {
    type Rout = TaggedEngineMessage;
    type Wout = TaggedEngineMessage;
    type Eout = ();
    type Error = Error;

    fn handle_read(&mut self, msg: TaggedEngineMessage) -> Result<(), Self::Error> {
        if let EngineMessage::Media(MediaMessage::Raw(raw)) = msg.message {
            if self.ctx.media_keys.is_none() {
                warn!("drop media packet before keying material exists");
                return Ok(());
            }
            if is_control(&raw) {
                self.handle_control(msg.now, &raw)?;
            } else {
                self.handle_packet(raw)?;
            }
        } else {
            // Bypass
            self.ctx.read_outs.push_back(msg);
        }
        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.ctx.read_outs.pop_front()
    }

    fn handle_write(&mut self, msg: TaggedEngineMessage) -> Result<(), Self::Error> {
        if let EngineMessage::Media(MediaMessage::Packet(packet)) = msg.message {
            if self.ctx.media_keys.is_none() {
                return Err(Error::ErrKeyingMaterialUnavailable);
            }
            let wire = packet.marshal()?;
            if let Some(&track_id) = self.ssrc_index.get(&packet.header.ssrc) {
                if let Some(track) = self.tracks.get_mut(&track_id) {
                    if let Some(reporting) = track.reporting.as_mut() {
                        reporting.process_outgoing(
                            msg.now,
                            &packet.header,
                            Bytes::from(wire.to_vec()),
                        );
                    }
                }
            }
            self.ctx.write_outs.push_back(TaggedEngineMessage {
                now: msg.now,
                transport: msg.transport,
                message: EngineMessage::Media(MediaMessage::Raw(wire)),
            });
        } else {
            // Bypass
            self.ctx.write_outs.push_back(msg);
        }
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.ctx.write_outs.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<(), Self::Error> {
        for track in self.tracks.values_mut() {
            let Some(reporting) = track.reporting.as_mut() else {
                continue;
            };
            while let Some(compound) = reporting.poll_report(now) {
                self.ctx.write_outs.push_back(TaggedEngineMessage {
                    now,
                    transport: Default::default(),
                    message: EngineMessage::Media(MediaMessage::Raw(BytesMut::from(
                        &compound[..],
                    ))),
                });
            }
        }
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        for track in self.tracks.values() {
            if let Some(next) = track.reporting.as_ref().and_then(|r| r.poll_timeout()) {
                deadline = Some(match deadline {
                    Some(current) => current.min(next),
                    None => next,
                });
            }
        }
        deadline
    }
}
