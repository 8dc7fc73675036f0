//! Association chunk wire codec.
//!
//! An association packet is a 4-byte verification tag followed by one or
//! more chunks. Each chunk is a type/flags/length header and a 4-byte
//! aligned body:
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |     Type      |     Flags     |         Length                |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                       Body (padded to 4)                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Length covers the header and body, excluding padding.

use bytes::{Buf, BufMut, BytesMut};
use shared::error::{Error, Result};
use shared::marshal::{padding_size, Marshal, MarshalSize, Unmarshal};

pub(crate) const CHUNK_HEADER_LEN: usize = 4;
pub(crate) const PACKET_HEADER_LEN: usize = 4;

/// Data chunk flags
pub(crate) const DATA_FLAG_END: u8 = 0x01;
pub(crate) const DATA_FLAG_BEGIN: u8 = 0x02;
pub(crate) const DATA_FLAG_UNORDERED: u8 = 0x04;

/// Kind of payload carried in a data chunk, mirroring the WebRTC payload
/// protocol identifiers.
#[repr(u32)]
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadKind {
    /// Channel signaling (open/ack/close)
    Control = 50,
    Text = 51,
    #[default]
    Binary = 53,
    TextEmpty = 56,
    BinaryEmpty = 57,
}

impl PayloadKind {
    pub fn from_u32(value: u32) -> Result<Self> {
        Ok(match value {
            50 => PayloadKind::Control,
            51 => PayloadKind::Text,
            53 => PayloadKind::Binary,
            56 => PayloadKind::TextEmpty,
            57 => PayloadKind::BinaryEmpty,
            _ => return Err(Error::InvalidPayloadKind((value & 0xff) as u8)),
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum ChunkType {
    Init = 1,
    InitAck = 2,
    Data = 3,
    Ack = 4,
    Heartbeat = 5,
    HeartbeatAck = 6,
    Shutdown = 7,
    ShutdownAck = 8,
    Forward = 9,
    Reset = 10,
    ResetAck = 11,
}

impl ChunkType {
    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            1 => ChunkType::Init,
            2 => ChunkType::InitAck,
            3 => ChunkType::Data,
            4 => ChunkType::Ack,
            5 => ChunkType::Heartbeat,
            6 => ChunkType::HeartbeatAck,
            7 => ChunkType::Shutdown,
            8 => ChunkType::ShutdownAck,
            9 => ChunkType::Forward,
            10 => ChunkType::Reset,
            11 => ChunkType::ResetAck,
            other => return Err(Error::InvalidChunkType(other)),
        })
    }
}

/// Body of Init and InitAck.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InitChunk {
    pub(crate) initiate_tag: u32,
    pub(crate) a_rwnd: u32,
    pub(crate) max_streams: u16,
    pub(crate) initial_tsn: u32,
    pub(crate) max_message_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct DataChunk {
    pub(crate) tsn: u32,
    pub(crate) stream_id: u16,
    pub(crate) stream_seq: u16,
    pub(crate) kind: PayloadKind,
    pub(crate) unordered: bool,
    pub(crate) begin: bool,
    pub(crate) end: bool,
    pub(crate) payload: BytesMut,
}

/// Gap block in an Ack, offsets relative to the cumulative TSN.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) struct GapBlock {
    pub(crate) start: u16,
    pub(crate) end: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AckChunk {
    pub(crate) cumulative_tsn: u32,
    pub(crate) a_rwnd: u32,
    pub(crate) gaps: Vec<GapBlock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ForwardChunk {
    pub(crate) new_cumulative_tsn: u32,
    /// Affected ordered streams with the highest abandoned stream sequence
    pub(crate) streams: Vec<(u16, u16)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Chunk {
    Init(InitChunk),
    InitAck(InitChunk),
    Data(DataChunk),
    Ack(AckChunk),
    Heartbeat(u64),
    HeartbeatAck(u64),
    Shutdown { cumulative_tsn: u32 },
    ShutdownAck,
    Forward(ForwardChunk),
    Reset { request_seq: u32, stream_id: u16 },
    ResetAck { request_seq: u32 },
}

impl Chunk {
    fn body_size(&self) -> usize {
        match self {
            Chunk::Init(_) | Chunk::InitAck(_) => 18,
            Chunk::Data(d) => 12 + d.payload.len(),
            Chunk::Ack(a) => 12 + a.gaps.len() * 4,
            Chunk::Heartbeat(_) | Chunk::HeartbeatAck(_) => 8,
            Chunk::Shutdown { .. } => 4,
            Chunk::ShutdownAck => 0,
            Chunk::Forward(f) => 4 + f.streams.len() * 4,
            Chunk::Reset { .. } => 8,
            Chunk::ResetAck { .. } => 4,
        }
    }

    fn chunk_type(&self) -> ChunkType {
        match self {
            Chunk::Init(_) => ChunkType::Init,
            Chunk::InitAck(_) => ChunkType::InitAck,
            Chunk::Data(_) => ChunkType::Data,
            Chunk::Ack(_) => ChunkType::Ack,
            Chunk::Heartbeat(_) => ChunkType::Heartbeat,
            Chunk::HeartbeatAck(_) => ChunkType::HeartbeatAck,
            Chunk::Shutdown { .. } => ChunkType::Shutdown,
            Chunk::ShutdownAck => ChunkType::ShutdownAck,
            Chunk::Forward(_) => ChunkType::Forward,
            Chunk::Reset { .. } => ChunkType::Reset,
            Chunk::ResetAck { .. } => ChunkType::ResetAck,
        }
    }

    fn flags(&self) -> u8 {
        match self {
            Chunk::Data(d) => {
                let mut flags = 0;
                if d.end {
                    flags |= DATA_FLAG_END;
                }
                if d.begin {
                    flags |= DATA_FLAG_BEGIN;
                }
                if d.unordered {
                    flags |= DATA_FLAG_UNORDERED;
                }
                flags
            }
            _ => 0,
        }
    }
}

impl MarshalSize for Chunk {
    fn marshal_size(&self) -> usize {
        let len = CHUNK_HEADER_LEN + self.body_size();
        len + padding_size(len)
    }
}

impl Marshal for Chunk {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let required = self.marshal_size();
        if buf.len() < required {
            return Err(Error::ErrBufferTooSmall {
                required,
                provided: buf.len(),
            });
        }
        let unpadded = CHUNK_HEADER_LEN + self.body_size();
        let mut writer = &mut buf[..];
        writer.put_u8(self.chunk_type() as u8);
        writer.put_u8(self.flags());
        writer.put_u16(unpadded as u16);

        match self {
            Chunk::Init(init) | Chunk::InitAck(init) => {
                writer.put_u32(init.initiate_tag);
                writer.put_u32(init.a_rwnd);
                writer.put_u16(init.max_streams);
                writer.put_u32(init.initial_tsn);
                writer.put_u32(init.max_message_size);
            }
            Chunk::Data(d) => {
                writer.put_u32(d.tsn);
                writer.put_u16(d.stream_id);
                writer.put_u16(d.stream_seq);
                writer.put_u32(d.kind as u32);
                writer.put_slice(&d.payload);
            }
            Chunk::Ack(a) => {
                writer.put_u32(a.cumulative_tsn);
                writer.put_u32(a.a_rwnd);
                writer.put_u16(a.gaps.len() as u16);
                writer.put_u16(0);
                for gap in &a.gaps {
                    writer.put_u16(gap.start);
                    writer.put_u16(gap.end);
                }
            }
            Chunk::Heartbeat(nonce) | Chunk::HeartbeatAck(nonce) => {
                writer.put_u64(*nonce);
            }
            Chunk::Shutdown { cumulative_tsn } => {
                writer.put_u32(*cumulative_tsn);
            }
            Chunk::ShutdownAck => {}
            Chunk::Forward(f) => {
                writer.put_u32(f.new_cumulative_tsn);
                for (stream_id, stream_seq) in &f.streams {
                    writer.put_u16(*stream_id);
                    writer.put_u16(*stream_seq);
                }
            }
            Chunk::Reset {
                request_seq,
                stream_id,
            } => {
                writer.put_u32(*request_seq);
                writer.put_u16(*stream_id);
                writer.put_u16(0);
            }
            Chunk::ResetAck { request_seq } => {
                writer.put_u32(*request_seq);
            }
        }
        for i in unpadded..required {
            buf[i] = 0;
        }
        Ok(required)
    }
}

impl Unmarshal for Chunk {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        if buf.remaining() < CHUNK_HEADER_LEN {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: CHUNK_HEADER_LEN,
                actual: buf.remaining(),
            });
        }
        let chunk_type = ChunkType::from_u8(buf.get_u8())?;
        let flags = buf.get_u8();
        let length = buf.get_u16() as usize;
        if length < CHUNK_HEADER_LEN {
            return Err(Error::ErrShortPacket);
        }
        let body_len = length - CHUNK_HEADER_LEN;
        let padded = body_len + padding_size(length);
        if buf.remaining() < padded {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: padded,
                actual: buf.remaining(),
            });
        }

        let chunk = match chunk_type {
            ChunkType::Init | ChunkType::InitAck => {
                if body_len != 18 {
                    return Err(Error::ErrShortPacket);
                }
                let init = InitChunk {
                    initiate_tag: buf.get_u32(),
                    a_rwnd: buf.get_u32(),
                    max_streams: buf.get_u16(),
                    initial_tsn: buf.get_u32(),
                    max_message_size: buf.get_u32(),
                };
                if chunk_type == ChunkType::Init {
                    Chunk::Init(init)
                } else {
                    Chunk::InitAck(init)
                }
            }
            ChunkType::Data => {
                if body_len < 12 {
                    return Err(Error::ErrShortPacket);
                }
                let tsn = buf.get_u32();
                let stream_id = buf.get_u16();
                let stream_seq = buf.get_u16();
                let kind = PayloadKind::from_u32(buf.get_u32())?;
                let mut payload = BytesMut::with_capacity(body_len - 12);
                payload.resize(body_len - 12, 0);
                buf.copy_to_slice(&mut payload);
                Chunk::Data(DataChunk {
                    tsn,
                    stream_id,
                    stream_seq,
                    kind,
                    unordered: flags & DATA_FLAG_UNORDERED != 0,
                    begin: flags & DATA_FLAG_BEGIN != 0,
                    end: flags & DATA_FLAG_END != 0,
                    payload,
                })
            }
            ChunkType::Ack => {
                if body_len < 12 {
                    return Err(Error::ErrShortPacket);
                }
                let cumulative_tsn = buf.get_u32();
                let a_rwnd = buf.get_u32();
                let num_gaps = buf.get_u16() as usize;
                let _reserved = buf.get_u16();
                if body_len != 12 + num_gaps * 4 {
                    return Err(Error::ErrShortPacket);
                }
                let mut gaps = Vec::with_capacity(num_gaps);
                for _ in 0..num_gaps {
                    gaps.push(GapBlock {
                        start: buf.get_u16(),
                        end: buf.get_u16(),
                    });
                }
                Chunk::Ack(AckChunk {
                    cumulative_tsn,
                    a_rwnd,
                    gaps,
                })
            }
            ChunkType::Heartbeat | ChunkType::HeartbeatAck => {
                if body_len != 8 {
                    return Err(Error::ErrShortPacket);
                }
                let nonce = buf.get_u64();
                if chunk_type == ChunkType::Heartbeat {
                    Chunk::Heartbeat(nonce)
                } else {
                    Chunk::HeartbeatAck(nonce)
                }
            }
            ChunkType::Shutdown => {
                if body_len != 4 {
                    return Err(Error::ErrShortPacket);
                }
                Chunk::Shutdown {
                    cumulative_tsn: buf.get_u32(),
                }
            }
            ChunkType::ShutdownAck => {
                if body_len != 0 {
                    return Err(Error::ErrShortPacket);
                }
                Chunk::ShutdownAck
            }
            ChunkType::Forward => {
                if body_len < 4 || (body_len - 4) % 4 != 0 {
                    return Err(Error::ErrShortPacket);
                }
                let new_cumulative_tsn = buf.get_u32();
                let count = (body_len - 4) / 4;
                let mut streams = Vec::with_capacity(count);
                for _ in 0..count {
                    streams.push((buf.get_u16(), buf.get_u16()));
                }
                Chunk::Forward(ForwardChunk {
                    new_cumulative_tsn,
                    streams,
                })
            }
            ChunkType::Reset => {
                if body_len != 8 {
                    return Err(Error::ErrShortPacket);
                }
                let request_seq = buf.get_u32();
                let stream_id = buf.get_u16();
                let _reserved = buf.get_u16();
                Chunk::Reset {
                    request_seq,
                    stream_id,
                }
            }
            ChunkType::ResetAck => {
                if body_len != 4 {
                    return Err(Error::ErrShortPacket);
                }
                Chunk::ResetAck {
                    request_seq: buf.get_u32(),
                }
            }
        };

        // Discard padding
        let consumed_padding = padding_size(length);
        if consumed_padding > 0 {
            buf.advance(consumed_padding);
        }

        Ok(chunk)
    }
}

/// Serialize a verification tag and chunk sequence into one packet.
pub(crate) fn marshal_packet(verification_tag: u32, chunks: &[Chunk]) -> Result<BytesMut> {
    let size = PACKET_HEADER_LEN + chunks.iter().map(|c| c.marshal_size()).sum::<usize>();
    let mut packet = BytesMut::with_capacity(size);
    packet.put_u32(verification_tag);
    for chunk in chunks {
        packet.extend_from_slice(&chunk.marshal()?);
    }
    Ok(packet)
}

/// Parse one packet into its verification tag and chunks.
pub(crate) fn unmarshal_packet<B: Buf>(buf: &mut B) -> Result<(u32, Vec<Chunk>)> {
    if buf.remaining() < PACKET_HEADER_LEN {
        return Err(Error::UnexpectedEndOfBuffer {
            expected: PACKET_HEADER_LEN,
            actual: buf.remaining(),
        });
    }
    let verification_tag = buf.get_u32();
    let mut chunks = Vec::new();
    while buf.has_remaining() {
        chunks.push(Chunk::unmarshal(buf)?);
    }
    Ok((verification_tag, chunks))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(chunk: Chunk) {
        let packet = marshal_packet(0xDEAD_BEEF, std::slice::from_ref(&chunk)).unwrap();
        let (tag, parsed) = unmarshal_packet(&mut packet.freeze()).unwrap();
        assert_eq!(tag, 0xDEAD_BEEF);
        assert_eq!(parsed, vec![chunk]);
    }

    #[test]
    fn test_init_round_trip() {
        round_trip(Chunk::Init(InitChunk {
            initiate_tag: 7,
            a_rwnd: 1 << 20,
            max_streams: 1024,
            initial_tsn: 42,
            max_message_size: 65536,
        }));
    }

    #[test]
    fn test_data_round_trip() {
        round_trip(Chunk::Data(DataChunk {
            tsn: 1000,
            stream_id: 3,
            stream_seq: 17,
            kind: PayloadKind::Text,
            unordered: true,
            begin: true,
            end: false,
            payload: BytesMut::from(&b"hello"[..]),
        }));
    }

    #[test]
    fn test_ack_with_gaps_round_trip() {
        round_trip(Chunk::Ack(AckChunk {
            cumulative_tsn: 55,
            a_rwnd: 4096,
            gaps: vec![
                GapBlock { start: 2, end: 3 },
                GapBlock { start: 7, end: 7 },
            ],
        }));
    }

    #[test]
    fn test_forward_round_trip() {
        round_trip(Chunk::Forward(ForwardChunk {
            new_cumulative_tsn: 88,
            streams: vec![(1, 4), (9, 0)],
        }));
    }

    #[test]
    fn test_control_chunks_round_trip() {
        round_trip(Chunk::Heartbeat(0x0102_0304_0506_0708));
        round_trip(Chunk::HeartbeatAck(1));
        round_trip(Chunk::Shutdown { cumulative_tsn: 9 });
        round_trip(Chunk::ShutdownAck);
        round_trip(Chunk::Reset {
            request_seq: 5,
            stream_id: 2,
        });
        round_trip(Chunk::ResetAck { request_seq: 5 });
    }

    #[test]
    fn test_bundled_chunks() {
        let chunks = vec![
            Chunk::Ack(AckChunk {
                cumulative_tsn: 1,
                a_rwnd: 100,
                gaps: vec![],
            }),
            Chunk::Data(DataChunk {
                tsn: 2,
                stream_id: 0,
                stream_seq: 0,
                kind: PayloadKind::Binary,
                unordered: false,
                begin: true,
                end: true,
                payload: BytesMut::from(&[1u8, 2, 3][..]),
            }),
        ];
        let packet = marshal_packet(1, &chunks).unwrap();
        let (_, parsed) = unmarshal_packet(&mut packet.freeze()).unwrap();
        assert_eq!(parsed, chunks);
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let packet = marshal_packet(
            1,
            &[Chunk::Data(DataChunk {
                tsn: 2,
                stream_id: 0,
                stream_seq: 0,
                kind: PayloadKind::Binary,
                unordered: false,
                begin: true,
                end: true,
                payload: BytesMut::from(&[1u8, 2, 3, 4, 5][..]),
            })],
        )
        .unwrap();
        let len = packet.len();
        let mut truncated = packet.freeze().slice(0..len - 4);
        assert!(unmarshal_packet(&mut truncated).is_err());
    }

    #[test]
    fn test_unknown_chunk_type_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u32(0);
        raw.put_u8(99);
        raw.put_u8(0);
        raw.put_u16(4);
        assert_eq!(
            unmarshal_packet(&mut raw.freeze()),
            Err(Error::InvalidChunkType(99))
        );
    }
}
