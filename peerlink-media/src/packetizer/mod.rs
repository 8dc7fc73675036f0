//! Codec-specific sample fragmentation.

pub(crate) mod av1;
pub(crate) mod h264;

use bytes::Bytes;
use shared::error::{Error, Result};

use crate::packet::{Header, Packet, HEADER_LEN};

/// Default fragment budget: the IPv6 minimum MTU less media, UDP and IPv6
/// header overhead.
pub const DEFAULT_MAX_FRAGMENT_SIZE: usize = 1280 - HEADER_LEN - 8 - 40;

/// How units are separated inside an H.264/H.265 sample.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum NalSeparator {
    /// Each unit is preceded by its 4-byte big-endian length
    #[default]
    Length,
    /// 0x00 0x00 0x00 0x01
    LongStartSequence,
    /// 0x00 0x00 0x01
    ShortStartSequence,
    /// Long or short start sequence
    StartSequence,
}

/// How OBUs of one AV1 sample map onto packets.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum ObuPacketization {
    /// Each OBU is packetized on its own
    #[default]
    Obu,
    /// All OBUs of the sample aggregate into a temporal unit
    TemporalUnit,
}

/// Closed set of payload formats, matched exhaustively at packetization
/// time. Each variant carries only the fields that codec family needs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadFormat {
    /// One packet per sample: Opus, PCMU/PCMA, G.722, AAC frames
    Audio,
    H264 { separator: NalSeparator },
    Av1 { packetization: ObuPacketization },
}

#[derive(Debug, Clone)]
pub struct PacketizerInit {
    pub ssrc: u32,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub sequence_number: u16,
    pub timestamp: u32,
    pub max_fragment_size: usize,
    pub format: PayloadFormat,
}

impl PacketizerInit {
    pub fn new(ssrc: u32, payload_type: u8, clock_rate: u32, format: PayloadFormat) -> Self {
        Self {
            ssrc,
            payload_type,
            clock_rate,
            sequence_number: rand::random::<u16>(),
            timestamp: rand::random::<u32>(),
            max_fragment_size: DEFAULT_MAX_FRAGMENT_SIZE,
            format,
        }
    }
}

/// Fragments media samples into packets, advancing the sequence counter
/// monotonically (wrapping at its width) and stamping fragments with the
/// clock-rate-scaled timestamp supplied by the caller.
#[derive(Debug)]
pub struct Packetizer {
    format: PayloadFormat,
    ssrc: u32,
    payload_type: u8,
    clock_rate: u32,
    sequence_number: u16,
    timestamp: u32,
    max_fragment_size: usize,
}

impl Packetizer {
    pub fn new(init: PacketizerInit) -> Result<Self> {
        if init.clock_rate == 0 {
            return Err(Error::ErrZeroClockRate);
        }
        Ok(Self {
            format: init.format,
            ssrc: init.ssrc,
            payload_type: init.payload_type,
            clock_rate: init.clock_rate,
            sequence_number: init.sequence_number,
            timestamp: init.timestamp,
            max_fragment_size: init.max_fragment_size.max(2),
        })
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    pub fn payload_type(&self) -> u8 {
        self.payload_type
    }

    pub fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    pub fn timestamp(&self) -> u32 {
        self.timestamp
    }

    pub fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp = timestamp;
    }

    /// Exact linear mapping by the clock rate. Timestamp wraps are the
    /// caller's concern on long-lived tracks.
    pub fn seconds_to_timestamp(&self, seconds: f64) -> u32 {
        (seconds * self.clock_rate as f64) as u32
    }

    pub fn timestamp_to_seconds(&self, timestamp: u32) -> f64 {
        timestamp as f64 / self.clock_rate as f64
    }

    /// Fragment one sample into packets stamped with `timestamp`.
    pub fn packetize(&mut self, sample: &[u8], timestamp: u32) -> Result<Vec<Packet>> {
        if sample.is_empty() {
            return Ok(Vec::new());
        }
        self.timestamp = timestamp;
        let payloads = match self.format {
            PayloadFormat::Audio => vec![Bytes::copy_from_slice(sample)],
            PayloadFormat::H264 { separator } => {
                h264::payloads(separator, sample, self.max_fragment_size)?
            }
            PayloadFormat::Av1 { packetization } => {
                av1::payloads(packetization, sample, self.max_fragment_size)?
            }
        };

        let is_video = !matches!(self.format, PayloadFormat::Audio);
        let count = payloads.len();
        let mut packets = Vec::with_capacity(count);
        for (i, payload) in payloads.into_iter().enumerate() {
            let header = Header {
                // The marker closes a video frame; audio leaves it unset
                marker: is_video && i == count - 1,
                payload_type: self.payload_type,
                sequence_number: self.sequence_number,
                timestamp,
                ssrc: self.ssrc,
            };
            self.sequence_number = self.sequence_number.wrapping_add(1);
            packets.push(Packet { header, payload });
        }
        Ok(packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio_packetizer() -> Packetizer {
        Packetizer::new(PacketizerInit {
            ssrc: 42,
            payload_type: 111,
            clock_rate: 48000,
            sequence_number: 65534,
            timestamp: 0,
            max_fragment_size: 1200,
            format: PayloadFormat::Audio,
        })
        .unwrap()
    }

    #[test]
    fn test_audio_single_packet_and_wrapping_sequence() {
        let mut p = audio_packetizer();
        let first = p.packetize(&[1, 2, 3], 960).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].header.sequence_number, 65534);
        assert!(!first[0].header.marker);
        let second = p.packetize(&[4], 1920).unwrap();
        assert_eq!(second[0].header.sequence_number, 65535);
        let third = p.packetize(&[5], 2880).unwrap();
        assert_eq!(third[0].header.sequence_number, 0);
        assert_eq!(third[0].header.timestamp, 2880);
    }

    #[test]
    fn test_seconds_timestamp_round_trip() {
        let p = audio_packetizer();
        let seconds = 1.25f64;
        let timestamp = p.seconds_to_timestamp(seconds);
        assert_eq!(timestamp, 60000);
        let back = p.timestamp_to_seconds(timestamp);
        assert!((back - seconds).abs() < 1.0 / 48000.0);
    }

    #[test]
    fn test_zero_clock_rate_rejected() {
        let result = Packetizer::new(PacketizerInit {
            ssrc: 1,
            payload_type: 96,
            clock_rate: 0,
            sequence_number: 0,
            timestamp: 0,
            max_fragment_size: 1200,
            format: PayloadFormat::Audio,
        });
        assert!(matches!(result, Err(Error::ErrZeroClockRate)));
    }

    #[test]
    fn test_empty_sample_yields_nothing() {
        let mut p = audio_packetizer();
        assert!(p.packetize(&[], 0).unwrap().is_empty());
    }
}
