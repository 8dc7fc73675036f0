//! Media packet header codec.
//!
//! The fixed 12-byte header layout of RFC 3550, without contributing
//! sources or header extensions (neither is produced by the packetizers).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};

pub const HEADER_LEN: usize = 12;
const VERSION: u8 = 2;

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub marker: bool,
    pub payload_type: u8,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl MarshalSize for Header {
    fn marshal_size(&self) -> usize {
        HEADER_LEN
    }
}

impl Marshal for Header {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.len() < HEADER_LEN {
            return Err(Error::ErrBufferTooSmall {
                required: HEADER_LEN,
                provided: buf.len(),
            });
        }
        let mut writer = &mut buf[..];
        writer.put_u8(VERSION << 6);
        writer.put_u8((self.payload_type & 0x7f) | if self.marker { 0x80 } else { 0 });
        writer.put_u16(self.sequence_number);
        writer.put_u32(self.timestamp);
        writer.put_u32(self.ssrc);
        Ok(HEADER_LEN)
    }
}

impl Unmarshal for Header {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        if buf.remaining() < HEADER_LEN {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: HEADER_LEN,
                actual: buf.remaining(),
            });
        }
        let b0 = buf.get_u8();
        let version = b0 >> 6;
        if version != VERSION {
            return Err(Error::InvalidPacketVersion(version));
        }
        let csrc_count = (b0 & 0x0f) as usize;
        let has_extension = b0 & 0x10 != 0;
        let b1 = buf.get_u8();
        let header = Header {
            marker: b1 & 0x80 != 0,
            payload_type: b1 & 0x7f,
            sequence_number: buf.get_u16(),
            timestamp: buf.get_u32(),
            ssrc: buf.get_u32(),
        };
        // Tolerate but skip contributing sources and extensions from peers
        let csrc_len = csrc_count * 4;
        if buf.remaining() < csrc_len {
            return Err(Error::ErrShortPacket);
        }
        buf.advance(csrc_len);
        if has_extension {
            if buf.remaining() < 4 {
                return Err(Error::ErrShortPacket);
            }
            let _profile = buf.get_u16();
            let words = buf.get_u16() as usize;
            if buf.remaining() < words * 4 {
                return Err(Error::ErrShortPacket);
            }
            buf.advance(words * 4);
        }
        Ok(header)
    }
}

#[derive(Default, Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Bytes,
}

impl MarshalSize for Packet {
    fn marshal_size(&self) -> usize {
        self.header.marshal_size() + self.payload.len()
    }
}

impl Marshal for Packet {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.header.marshal_to(buf)?;
        let required = n + self.payload.len();
        if buf.len() < required {
            return Err(Error::ErrBufferTooSmall {
                required,
                provided: buf.len(),
            });
        }
        buf[n..required].copy_from_slice(&self.payload);
        Ok(required)
    }
}

impl Unmarshal for Packet {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        let header = Header::unmarshal(buf)?;
        let mut payload = BytesMut::with_capacity(buf.remaining());
        payload.resize(buf.remaining(), 0);
        buf.copy_to_slice(&mut payload);
        Ok(Packet {
            header,
            payload: payload.freeze(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip() {
        let header = Header {
            marker: true,
            payload_type: 96,
            sequence_number: 4321,
            timestamp: 0xDEAD_BEEF,
            ssrc: 0x1234_5678,
        };
        let raw = header.marshal().unwrap();
        assert_eq!(raw.len(), HEADER_LEN);
        let parsed = Header::unmarshal(&mut raw.freeze()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_packet_round_trip() {
        let packet = Packet {
            header: Header {
                payload_type: 111,
                sequence_number: 1,
                timestamp: 48000,
                ssrc: 7,
                marker: false,
            },
            payload: Bytes::from_static(&[0xAA, 0xBB, 0xCC]),
        };
        let raw = packet.marshal().unwrap();
        let parsed = Packet::unmarshal(&mut raw.freeze()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let raw = [0u8; 12];
        assert_eq!(
            Header::unmarshal(&mut &raw[..]),
            Err(Error::InvalidPacketVersion(0))
        );
    }
}
