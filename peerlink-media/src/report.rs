//! Periodic sender reports, retransmission serving and peer feedback.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::Bytes;
use log::{trace, warn};

use shared::time::SystemInstant;

use crate::packet::Header;
use crate::rtcp::{
    marshal_compound, RtcpPacket, SenderReport, SourceDescription,
};

/// Default capacity of the sent-packet cache.
pub const DEFAULT_MAX_STORED_PACKETS: usize = 512;

const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Pass-through notifications from peer feedback; reacting to them
/// (encoder key frame, bitrate target) is application policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportEvent {
    KeyFrameRequested,
    BitrateEstimate(u64),
}

#[derive(Debug, Clone)]
pub struct ReportingSessionConfig {
    pub ssrc: u32,
    pub cname: String,
    pub clock_rate: u32,
    pub report_interval: Duration,
    pub max_stored_packets: usize,
}

impl ReportingSessionConfig {
    pub fn new(ssrc: u32, cname: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            ssrc,
            cname: cname.into(),
            clock_rate,
            report_interval: DEFAULT_REPORT_INTERVAL,
            max_stored_packets: DEFAULT_MAX_STORED_PACKETS,
        }
    }
}

/// Bounded cache of marshaled packets keyed by sequence number.
/// Oldest-first eviction at exactly the configured capacity; replays are
/// byte-identical to the original transmission.
struct RetransmitCache {
    capacity: usize,
    order: VecDeque<u16>,
    packets: HashMap<u16, Bytes>,
}

impl RetransmitCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            order: VecDeque::with_capacity(capacity),
            packets: HashMap::with_capacity(capacity),
        }
    }

    fn put(&mut self, sequence_number: u16, wire: Bytes) {
        if self.capacity == 0 {
            return;
        }
        if self.packets.insert(sequence_number, wire).is_none() {
            self.order.push_back(sequence_number);
        }
        while self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.packets.remove(&evicted);
            }
        }
    }

    fn get(&self, sequence_number: u16) -> Option<Bytes> {
        self.packets.get(&sequence_number).cloned()
    }

    fn len(&self) -> usize {
        self.order.len()
    }
}

/// Companion session of one outbound media track: counts traffic, keeps
/// the timestamp↔wall-clock mapping, emits periodic sender reports,
/// serves retransmission requests and surfaces peer feedback.
pub struct ReportingSession {
    ssrc: u32,
    cname: String,
    clock_rate: f64,

    started: bool,
    last_sn: u16,
    last_rtp_time: u32,
    last_rtp_instant: Instant,
    time_baseline: SystemInstant,

    packet_count: u32,
    octet_count: u32,

    cache: RetransmitCache,

    report_interval: Duration,
    next_report: Option<Instant>,
    last_report_rtp_time: Option<u32>,
}

impl ReportingSession {
    pub fn new(config: ReportingSessionConfig) -> Self {
        Self {
            ssrc: config.ssrc,
            cname: config.cname,
            clock_rate: config.clock_rate as f64,
            started: false,
            last_sn: 0,
            last_rtp_time: 0,
            last_rtp_instant: Instant::now(),
            time_baseline: SystemInstant::now(),
            packet_count: 0,
            octet_count: 0,
            cache: RetransmitCache::new(config.max_stored_packets),
            report_interval: config.report_interval,
            next_report: None,
            last_report_rtp_time: None,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn cname(&self) -> &str {
        &self.cname
    }

    pub fn stored_packets(&self) -> usize {
        self.cache.len()
    }

    /// RTP timestamp of the most recent sender report, if one was emitted.
    pub fn last_report_timestamp(&self) -> Option<u32> {
        self.last_report_rtp_time
    }

    /// Record one outbound packet: traffic counters, the timestamp
    /// mapping, and the marshaled bytes for retransmission.
    pub fn process_outgoing(&mut self, now: Instant, header: &Header, wire: Bytes) {
        let seq = header.sequence_number;
        let diff = seq.wrapping_sub(self.last_sn);
        let in_order = !self.started || (diff > 0 && diff < 1 << 15);
        if in_order {
            self.started = true;
            self.last_sn = seq;
            // Only the first packet of a frame moves the mapping, so a
            // large frame spanning many packets does not skew it
            if header.timestamp != self.last_rtp_time {
                self.last_rtp_time = header.timestamp;
                self.last_rtp_instant = now;
            }
        }
        self.packet_count = self.packet_count.wrapping_add(1);
        let payload_octets = wire.len().saturating_sub(crate::packet::HEADER_LEN);
        self.octet_count = self
            .octet_count
            .wrapping_add(payload_octets.try_into().unwrap_or_else(|_| {
                warn!("packet payload larger than 32 bits");
                u32::MAX
            }));
        self.cache.put(seq, wire);
        if self.next_report.is_none() {
            self.next_report = Some(now + self.report_interval);
        }
    }

    /// Emit the periodic compound report when due.
    pub fn poll_report(&mut self, now: Instant) -> Option<Bytes> {
        let due = self.next_report?;
        if now < due {
            return None;
        }
        self.next_report = Some(now + self.report_interval);
        let rtp_time = self.current_rtp_time(now);
        self.last_report_rtp_time = Some(rtp_time);
        let compound = marshal_compound(&[
            RtcpPacket::SenderReport(SenderReport {
                ssrc: self.ssrc,
                ntp_time: self.time_baseline.ntp(now),
                rtp_time,
                packet_count: self.packet_count,
                octet_count: self.octet_count,
            }),
            RtcpPacket::SourceDescription(SourceDescription {
                ssrc: self.ssrc,
                cname: self.cname.clone(),
            }),
        ])
        .ok()?;
        Some(compound)
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        self.next_report
    }

    /// Extrapolate the media timestamp to `now` using the clock rate.
    pub fn current_rtp_time(&self, now: Instant) -> u32 {
        self.last_rtp_time.wrapping_add(
            (now.duration_since(self.last_rtp_instant).as_secs_f64() * self.clock_rate) as u32,
        )
    }

    /// React to peer feedback addressed to this source: retransmission
    /// requests are answered from the cache (byte-identical, silently
    /// skipped on a cache miss), key-frame and bitrate reports surface as
    /// events.
    pub fn handle_feedback(&mut self, packets: &[RtcpPacket]) -> (Vec<Bytes>, Vec<ReportEvent>) {
        let mut retransmissions = Vec::new();
        let mut events = Vec::new();
        for packet in packets {
            match packet {
                RtcpPacket::TransportNack(nack) => {
                    if nack.media_ssrc != self.ssrc {
                        continue;
                    }
                    for pair in &nack.nacks {
                        for seq in pair.sequence_numbers() {
                            match self.cache.get(seq) {
                                Some(wire) => retransmissions.push(wire),
                                // An evicted sequence is ignored; the peer
                                // recovers by other means
                                None => trace!("retransmit miss for seq {seq}"),
                            }
                        }
                    }
                }
                RtcpPacket::PictureLoss(pli) => {
                    if pli.media_ssrc == self.ssrc {
                        events.push(ReportEvent::KeyFrameRequested);
                    }
                }
                RtcpPacket::ReceiverEstimate(estimate) => {
                    if estimate.ssrcs.is_empty() || estimate.ssrcs.contains(&self.ssrc) {
                        events.push(ReportEvent::BitrateEstimate(estimate.bitrate));
                    }
                }
                _ => {}
            }
        }
        (retransmissions, events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtcp::{NackPair, PictureLoss, ReceiverEstimate, TransportNack};

    fn session(capacity: usize) -> ReportingSession {
        ReportingSession::new(ReportingSessionConfig {
            ssrc: 7,
            cname: "t".into(),
            clock_rate: 90000,
            report_interval: Duration::from_secs(1),
            max_stored_packets: capacity,
        })
    }

    fn packet(seq: u16) -> (Header, Bytes) {
        let header = Header {
            sequence_number: seq,
            timestamp: seq as u32 * 3000,
            ssrc: 7,
            payload_type: 96,
            marker: true,
        };
        use shared::marshal::Marshal;
        let wire = crate::packet::Packet {
            header: header.clone(),
            payload: Bytes::from(vec![seq as u8; 4]),
        }
        .marshal()
        .unwrap()
        .freeze();
        (header, wire)
    }

    fn nack(seq: u16) -> Vec<RtcpPacket> {
        vec![RtcpPacket::TransportNack(TransportNack {
            sender_ssrc: 1,
            media_ssrc: 7,
            nacks: vec![NackPair {
                packet_id: seq,
                lost_packets: 0,
            }],
        })]
    }

    #[test]
    fn test_cache_eviction_oldest_first() {
        let mut s = session(2);
        let now = Instant::now();
        let mut wires = Vec::new();
        for seq in [1u16, 2, 3] {
            let (header, wire) = packet(seq);
            wires.push(wire.clone());
            s.process_outgoing(now, &header, wire);
        }
        assert_eq!(s.stored_packets(), 2);

        // Evicted: silently ignored
        let (replayed, _) = s.handle_feedback(&nack(1));
        assert!(replayed.is_empty());

        // Cached: byte-identical replay
        let (replayed, _) = s.handle_feedback(&nack(2));
        assert_eq!(replayed, vec![wires[1].clone()]);
        let (replayed, _) = s.handle_feedback(&nack(3));
        assert_eq!(replayed, vec![wires[2].clone()]);
    }

    #[test]
    fn test_cache_never_exceeds_capacity() {
        let mut s = session(8);
        let now = Instant::now();
        for seq in 0..100u16 {
            let (header, wire) = packet(seq);
            s.process_outgoing(now, &header, wire);
            assert!(s.stored_packets() <= 8);
        }
    }

    #[test]
    fn test_nack_for_other_source_ignored() {
        let mut s = session(4);
        let now = Instant::now();
        let (header, wire) = packet(1);
        s.process_outgoing(now, &header, wire);
        let other = vec![RtcpPacket::TransportNack(TransportNack {
            sender_ssrc: 1,
            media_ssrc: 999,
            nacks: vec![NackPair {
                packet_id: 1,
                lost_packets: 0,
            }],
        })];
        let (replayed, _) = s.handle_feedback(&other);
        assert!(replayed.is_empty());
    }

    #[test]
    fn test_sender_report_counts_and_timing() {
        let mut s = session(4);
        let now = Instant::now();
        for seq in 0..3u16 {
            let (header, wire) = packet(seq);
            s.process_outgoing(now, &header, wire);
        }
        assert!(s.poll_report(now).is_none());
        let later = now + Duration::from_secs(2);
        let compound = s.poll_report(later).expect("report due");
        let parsed = crate::rtcp::unmarshal_compound(&compound).unwrap();
        match &parsed[0] {
            RtcpPacket::SenderReport(sr) => {
                assert_eq!(sr.ssrc, 7);
                assert_eq!(sr.packet_count, 3);
                assert_eq!(sr.octet_count, 12);
                // Timestamp extrapolated roughly two seconds past the
                // last packet
                let expected = 2 * 3000 + 2 * 90000;
                assert!((sr.rtp_time as i64 - expected as i64).abs() < 9000);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(&parsed[1], RtcpPacket::SourceDescription(sdes) if sdes.cname == "t"));
        assert_eq!(s.last_report_timestamp(), Some(parsed_rtp_time(&parsed)));
    }

    fn parsed_rtp_time(parsed: &[RtcpPacket]) -> u32 {
        match &parsed[0] {
            RtcpPacket::SenderReport(sr) => sr.rtp_time,
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_feedback_events() {
        let mut s = session(4);
        let packets = vec![
            RtcpPacket::PictureLoss(PictureLoss {
                sender_ssrc: 1,
                media_ssrc: 7,
            }),
            RtcpPacket::ReceiverEstimate(ReceiverEstimate {
                sender_ssrc: 1,
                bitrate: 1_000_000,
                ssrcs: vec![7],
            }),
        ];
        let (_, events) = s.handle_feedback(&packets);
        assert_eq!(
            events,
            vec![
                ReportEvent::KeyFrameRequested,
                ReportEvent::BitrateEstimate(1_000_000)
            ]
        );
    }

    #[test]
    fn test_pli_for_other_source_ignored() {
        let mut s = session(4);
        let packets = vec![RtcpPacket::PictureLoss(PictureLoss {
            sender_ssrc: 1,
            media_ssrc: 8,
        })];
        let (_, events) = s.handle_feedback(&packets);
        assert!(events.is_empty());
    }
}
