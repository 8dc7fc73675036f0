//! Control-report wire codec: sender reports, source descriptions,
//! retransmission requests, key-frame requests and receiver bitrate
//! estimates, bundled into compound packets.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};

const RTCP_HEADER_LEN: usize = 4;
const VERSION: u8 = 2;

const PT_SENDER_REPORT: u8 = 200;
const PT_SOURCE_DESCRIPTION: u8 = 202;
const PT_TRANSPORT_FEEDBACK: u8 = 205;
const PT_PAYLOAD_FEEDBACK: u8 = 206;

const FMT_NACK: u8 = 1;
const FMT_PLI: u8 = 1;
const FMT_APPLICATION_LAYER: u8 = 15;

const SDES_CNAME: u8 = 1;

const REMB_IDENTIFIER: [u8; 4] = *b"REMB";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_time: u64,
    pub rtp_time: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDescription {
    pub ssrc: u32,
    pub cname: String,
}

/// A lost-packet report: base sequence number plus a bitmask of the
/// sixteen following sequence numbers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NackPair {
    pub packet_id: u16,
    pub lost_packets: u16,
}

impl NackPair {
    /// Expand into every requested sequence number.
    pub fn sequence_numbers(&self) -> Vec<u16> {
        let mut seqs = vec![self.packet_id];
        for i in 0..16u16 {
            if self.lost_packets & (1 << i) != 0 {
                seqs.push(self.packet_id.wrapping_add(i + 1));
            }
        }
        seqs
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportNack {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
    pub nacks: Vec<NackPair>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PictureLoss {
    pub sender_ssrc: u32,
    pub media_ssrc: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiverEstimate {
    pub sender_ssrc: u32,
    /// Estimated available bitrate in bits per second
    pub bitrate: u64,
    pub ssrcs: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RtcpPacket {
    SenderReport(SenderReport),
    SourceDescription(SourceDescription),
    TransportNack(TransportNack),
    PictureLoss(PictureLoss),
    ReceiverEstimate(ReceiverEstimate),
    /// Recognized framing, unhandled type
    Unknown { payload_type: u8 },
}

fn put_header(buf: &mut BytesMut, count: u8, payload_type: u8, body_len: usize) {
    debug_assert_eq!(body_len % 4, 0);
    buf.put_u8(VERSION << 6 | (count & 0x1f));
    buf.put_u8(payload_type);
    buf.put_u16((body_len / 4) as u16);
}

impl RtcpPacket {
    pub fn marshal(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        match self {
            RtcpPacket::SenderReport(sr) => {
                put_header(&mut buf, 0, PT_SENDER_REPORT, 24);
                buf.put_u32(sr.ssrc);
                buf.put_u64(sr.ntp_time);
                buf.put_u32(sr.rtp_time);
                buf.put_u32(sr.packet_count);
                buf.put_u32(sr.octet_count);
            }
            RtcpPacket::SourceDescription(sdes) => {
                let item_len = 2 + sdes.cname.len();
                // chunk is ssrc + items + null terminator, padded to 32 bits
                let chunk_len = 4 + item_len + 1;
                let padded = (chunk_len + 3) & !3;
                put_header(&mut buf, 1, PT_SOURCE_DESCRIPTION, padded);
                buf.put_u32(sdes.ssrc);
                buf.put_u8(SDES_CNAME);
                buf.put_u8(sdes.cname.len() as u8);
                buf.put_slice(sdes.cname.as_bytes());
                for _ in chunk_len - 1..padded {
                    buf.put_u8(0);
                }
            }
            RtcpPacket::TransportNack(nack) => {
                let body_len = 8 + nack.nacks.len() * 4;
                buf.put_u8(VERSION << 6 | FMT_NACK);
                buf.put_u8(PT_TRANSPORT_FEEDBACK);
                buf.put_u16((body_len / 4) as u16);
                buf.put_u32(nack.sender_ssrc);
                buf.put_u32(nack.media_ssrc);
                for pair in &nack.nacks {
                    buf.put_u16(pair.packet_id);
                    buf.put_u16(pair.lost_packets);
                }
            }
            RtcpPacket::PictureLoss(pli) => {
                buf.put_u8(VERSION << 6 | FMT_PLI);
                buf.put_u8(PT_PAYLOAD_FEEDBACK);
                buf.put_u16(2);
                buf.put_u32(pli.sender_ssrc);
                buf.put_u32(pli.media_ssrc);
            }
            RtcpPacket::ReceiverEstimate(remb) => {
                let body_len = 16 + remb.ssrcs.len() * 4;
                buf.put_u8(VERSION << 6 | FMT_APPLICATION_LAYER);
                buf.put_u8(PT_PAYLOAD_FEEDBACK);
                buf.put_u16((body_len / 4) as u16);
                buf.put_u32(remb.sender_ssrc);
                buf.put_u32(0); // media ssrc is unused for this message
                buf.put_slice(&REMB_IDENTIFIER);
                let (exponent, mantissa) = encode_bitrate(remb.bitrate);
                buf.put_u8(remb.ssrcs.len() as u8);
                buf.put_u8((exponent << 2) | ((mantissa >> 16) as u8 & 0x03));
                buf.put_u16((mantissa & 0xffff) as u16);
                for ssrc in &remb.ssrcs {
                    buf.put_u32(*ssrc);
                }
            }
            RtcpPacket::Unknown { payload_type } => {
                return Err(Error::InvalidMessageType(*payload_type));
            }
        }
        Ok(buf.freeze())
    }
}

/// 18-bit mantissa with a 6-bit exponent.
fn encode_bitrate(bitrate: u64) -> (u8, u32) {
    let mut exponent = 0u8;
    let mut mantissa = bitrate;
    while mantissa >= 1 << 18 {
        mantissa >>= 1;
        exponent += 1;
    }
    (exponent.min(63), mantissa as u32)
}

fn decode_bitrate(exponent: u8, mantissa: u32) -> u64 {
    (mantissa as u64) << exponent
}

/// Serialize packets back-to-back into one compound payload.
pub fn marshal_compound(packets: &[RtcpPacket]) -> Result<Bytes> {
    let mut buf = BytesMut::new();
    for packet in packets {
        buf.extend_from_slice(&packet.marshal()?);
    }
    Ok(buf.freeze())
}

/// Parse a compound payload into its packets. Unrecognized payload types
/// are preserved as [RtcpPacket::Unknown] so callers can count them.
pub fn unmarshal_compound(mut buf: &[u8]) -> Result<Vec<RtcpPacket>> {
    let mut packets = Vec::new();
    while buf.remaining() >= RTCP_HEADER_LEN {
        let b0 = buf.get_u8();
        if b0 >> 6 != VERSION {
            return Err(Error::InvalidPacketVersion(b0 >> 6));
        }
        let count = b0 & 0x1f;
        let payload_type = buf.get_u8();
        let body_len = buf.get_u16() as usize * 4;
        if buf.remaining() < body_len {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: body_len,
                actual: buf.remaining(),
            });
        }
        let mut body = &buf[..body_len];
        buf.advance(body_len);

        let packet = match (payload_type, count) {
            (PT_SENDER_REPORT, _) => {
                if body.len() < 24 {
                    return Err(Error::ErrShortPacket);
                }
                RtcpPacket::SenderReport(SenderReport {
                    ssrc: body.get_u32(),
                    ntp_time: body.get_u64(),
                    rtp_time: body.get_u32(),
                    packet_count: body.get_u32(),
                    octet_count: body.get_u32(),
                })
            }
            (PT_SOURCE_DESCRIPTION, _) => {
                if body.len() < 6 {
                    return Err(Error::ErrShortPacket);
                }
                let ssrc = body.get_u32();
                let item_type = body.get_u8();
                let len = body.get_u8() as usize;
                if item_type != SDES_CNAME || body.len() < len {
                    RtcpPacket::Unknown { payload_type }
                } else {
                    let cname = String::from_utf8(body[..len].to_vec())?;
                    RtcpPacket::SourceDescription(SourceDescription { ssrc, cname })
                }
            }
            (PT_TRANSPORT_FEEDBACK, FMT_NACK) => {
                if body.len() < 8 {
                    return Err(Error::ErrShortPacket);
                }
                let sender_ssrc = body.get_u32();
                let media_ssrc = body.get_u32();
                let mut nacks = Vec::with_capacity(body.len() / 4);
                while body.remaining() >= 4 {
                    nacks.push(NackPair {
                        packet_id: body.get_u16(),
                        lost_packets: body.get_u16(),
                    });
                }
                RtcpPacket::TransportNack(TransportNack {
                    sender_ssrc,
                    media_ssrc,
                    nacks,
                })
            }
            (PT_PAYLOAD_FEEDBACK, FMT_PLI) => {
                if body.len() < 8 {
                    return Err(Error::ErrShortPacket);
                }
                RtcpPacket::PictureLoss(PictureLoss {
                    sender_ssrc: body.get_u32(),
                    media_ssrc: body.get_u32(),
                })
            }
            (PT_PAYLOAD_FEEDBACK, FMT_APPLICATION_LAYER) => {
                if body.len() < 16 {
                    return Err(Error::ErrShortPacket);
                }
                let sender_ssrc = body.get_u32();
                let _media_ssrc = body.get_u32();
                let mut identifier = [0u8; 4];
                body.copy_to_slice(&mut identifier);
                if identifier != REMB_IDENTIFIER {
                    RtcpPacket::Unknown { payload_type }
                } else {
                    let num_ssrcs = body.get_u8() as usize;
                    let b = body.get_u8();
                    let exponent = b >> 2;
                    let mantissa =
                        ((b as u32 & 0x03) << 16) | body.get_u16() as u32;
                    let mut ssrcs = Vec::with_capacity(num_ssrcs);
                    while body.remaining() >= 4 && ssrcs.len() < num_ssrcs {
                        ssrcs.push(body.get_u32());
                    }
                    RtcpPacket::ReceiverEstimate(ReceiverEstimate {
                        sender_ssrc,
                        bitrate: decode_bitrate(exponent, mantissa),
                        ssrcs,
                    })
                }
            }
            _ => RtcpPacket::Unknown { payload_type },
        };
        packets.push(packet);
    }
    Ok(packets)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sender_report_round_trip() {
        let sr = RtcpPacket::SenderReport(SenderReport {
            ssrc: 0x1111_2222,
            ntp_time: 0x0123_4567_89AB_CDEF,
            rtp_time: 90000,
            packet_count: 17,
            octet_count: 4242,
        });
        let raw = sr.marshal().unwrap();
        assert_eq!(unmarshal_compound(&raw).unwrap(), vec![sr]);
    }

    #[test]
    fn test_source_description_round_trip() {
        let sdes = RtcpPacket::SourceDescription(SourceDescription {
            ssrc: 5,
            cname: "peer@example".to_string(),
        });
        let raw = sdes.marshal().unwrap();
        assert_eq!(raw.len() % 4, 0);
        assert_eq!(unmarshal_compound(&raw).unwrap(), vec![sdes]);
    }

    #[test]
    fn test_nack_round_trip_and_expansion() {
        let nack = TransportNack {
            sender_ssrc: 1,
            media_ssrc: 2,
            nacks: vec![NackPair {
                packet_id: 100,
                lost_packets: 0b101,
            }],
        };
        let raw = RtcpPacket::TransportNack(nack.clone()).marshal().unwrap();
        let parsed = unmarshal_compound(&raw).unwrap();
        assert_eq!(parsed, vec![RtcpPacket::TransportNack(nack.clone())]);
        assert_eq!(nack.nacks[0].sequence_numbers(), vec![100, 101, 103]);
    }

    #[test]
    fn test_nack_expansion_wraps() {
        let pair = NackPair {
            packet_id: 65535,
            lost_packets: 0b1,
        };
        assert_eq!(pair.sequence_numbers(), vec![65535, 0]);
    }

    #[test]
    fn test_pli_round_trip() {
        let pli = RtcpPacket::PictureLoss(PictureLoss {
            sender_ssrc: 9,
            media_ssrc: 10,
        });
        let raw = pli.marshal().unwrap();
        assert_eq!(unmarshal_compound(&raw).unwrap(), vec![pli]);
    }

    #[test]
    fn test_receiver_estimate_round_trip() {
        let remb = RtcpPacket::ReceiverEstimate(ReceiverEstimate {
            sender_ssrc: 1,
            bitrate: 2_500_000,
            ssrcs: vec![0xAABB_CCDD],
        });
        let raw = remb.marshal().unwrap();
        let parsed = unmarshal_compound(&raw).unwrap();
        match &parsed[0] {
            RtcpPacket::ReceiverEstimate(parsed_remb) => {
                assert_eq!(parsed_remb.sender_ssrc, 1);
                assert_eq!(parsed_remb.ssrcs, vec![0xAABB_CCDD]);
                // Mantissa truncation loses at most the exponent's worth
                let delta = (parsed_remb.bitrate as i64 - 2_500_000i64).abs();
                assert!(delta < 1 << 6, "delta {delta}");
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_compound_round_trip() {
        let packets = vec![
            RtcpPacket::SenderReport(SenderReport {
                ssrc: 1,
                ntp_time: 2,
                rtp_time: 3,
                packet_count: 4,
                octet_count: 5,
            }),
            RtcpPacket::SourceDescription(SourceDescription {
                ssrc: 1,
                cname: "a".to_string(),
            }),
        ];
        let raw = marshal_compound(&packets).unwrap();
        assert_eq!(unmarshal_compound(&raw).unwrap(), packets);
    }

    #[test]
    fn test_unknown_type_preserved() {
        let mut raw = BytesMut::new();
        raw.put_u8(VERSION << 6);
        raw.put_u8(203); // BYE
        raw.put_u16(1);
        raw.put_u32(77);
        let parsed = unmarshal_compound(&raw).unwrap();
        assert_eq!(parsed, vec![RtcpPacket::Unknown { payload_type: 203 }]);
    }
}
