//! Stream-signaling wire messages carried as control payloads on the
//! reliable-message transport.

use bytes::{Buf, BufMut};

use mux::{Reliability, ReliabilityKind};
use shared::error::{Error, Result};
use shared::marshal::{Marshal, MarshalSize, Unmarshal};
use std::time::Duration;

const MESSAGE_TYPE_ACK: u8 = 0x02;
const MESSAGE_TYPE_OPEN: u8 = 0x03;

pub(crate) const CHANNEL_PRIORITY_NORMAL: u16 = 256;

const CHANNEL_TYPE_RELIABLE: u8 = 0x00;
const CHANNEL_TYPE_RELIABLE_UNORDERED: u8 = 0x80;
const CHANNEL_TYPE_PARTIAL_REXMIT: u8 = 0x01;
const CHANNEL_TYPE_PARTIAL_REXMIT_UNORDERED: u8 = 0x81;
const CHANNEL_TYPE_PARTIAL_TIMED: u8 = 0x02;
const CHANNEL_TYPE_PARTIAL_TIMED_UNORDERED: u8 = 0x82;

/// Map a reliability policy onto the wire channel type and parameter.
pub(crate) fn channel_type_and_parameter(reliability: &Reliability) -> (u8, u32) {
    match (reliability.ordered, reliability.kind) {
        (true, ReliabilityKind::Reliable) => (CHANNEL_TYPE_RELIABLE, 0),
        (false, ReliabilityKind::Reliable) => (CHANNEL_TYPE_RELIABLE_UNORDERED, 0),
        (true, ReliabilityKind::MaxRetransmits(n)) => (CHANNEL_TYPE_PARTIAL_REXMIT, n as u32),
        (false, ReliabilityKind::MaxRetransmits(n)) => {
            (CHANNEL_TYPE_PARTIAL_REXMIT_UNORDERED, n as u32)
        }
        (true, ReliabilityKind::MaxLifetime(d)) => {
            (CHANNEL_TYPE_PARTIAL_TIMED, d.as_millis() as u32)
        }
        (false, ReliabilityKind::MaxLifetime(d)) => {
            (CHANNEL_TYPE_PARTIAL_TIMED_UNORDERED, d.as_millis() as u32)
        }
    }
}

/// Inverse of [channel_type_and_parameter].
pub(crate) fn reliability_from_wire(channel_type: u8, parameter: u32) -> Result<Reliability> {
    let (ordered, kind) = match channel_type {
        CHANNEL_TYPE_RELIABLE => (true, ReliabilityKind::Reliable),
        CHANNEL_TYPE_RELIABLE_UNORDERED => (false, ReliabilityKind::Reliable),
        CHANNEL_TYPE_PARTIAL_REXMIT => (true, ReliabilityKind::MaxRetransmits(parameter as u16)),
        CHANNEL_TYPE_PARTIAL_REXMIT_UNORDERED => {
            (false, ReliabilityKind::MaxRetransmits(parameter as u16))
        }
        CHANNEL_TYPE_PARTIAL_TIMED => (
            true,
            ReliabilityKind::MaxLifetime(Duration::from_millis(parameter as u64)),
        ),
        CHANNEL_TYPE_PARTIAL_TIMED_UNORDERED => (
            false,
            ReliabilityKind::MaxLifetime(Duration::from_millis(parameter as u64)),
        ),
        other => return Err(Error::InvalidMessageType(other)),
    };
    Ok(Reliability { ordered, kind })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChannelOpen {
    pub(crate) channel_type: u8,
    pub(crate) priority: u16,
    pub(crate) reliability_parameter: u32,
    pub(crate) label: String,
    pub(crate) protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ChannelMessage {
    Ack,
    Open(ChannelOpen),
}

impl MarshalSize for ChannelMessage {
    fn marshal_size(&self) -> usize {
        match self {
            ChannelMessage::Ack => 1,
            ChannelMessage::Open(open) => 12 + open.label.len() + open.protocol.len(),
        }
    }
}

impl Marshal for ChannelMessage {
    fn marshal_to(&self, buf: &mut [u8]) -> Result<usize> {
        let required = self.marshal_size();
        if buf.len() < required {
            return Err(Error::ErrBufferTooSmall {
                required,
                provided: buf.len(),
            });
        }
        let mut writer = &mut buf[..];
        match self {
            ChannelMessage::Ack => {
                writer.put_u8(MESSAGE_TYPE_ACK);
            }
            ChannelMessage::Open(open) => {
                writer.put_u8(MESSAGE_TYPE_OPEN);
                writer.put_u8(open.channel_type);
                writer.put_u16(open.priority);
                writer.put_u32(open.reliability_parameter);
                writer.put_u16(open.label.len() as u16);
                writer.put_u16(open.protocol.len() as u16);
                writer.put_slice(open.label.as_bytes());
                writer.put_slice(open.protocol.as_bytes());
            }
        }
        Ok(required)
    }
}

impl Unmarshal for ChannelMessage {
    fn unmarshal<B>(buf: &mut B) -> Result<Self>
    where
        B: Buf,
    {
        if buf.remaining() < 1 {
            return Err(Error::UnexpectedEndOfBuffer {
                expected: 1,
                actual: 0,
            });
        }
        match buf.get_u8() {
            MESSAGE_TYPE_ACK => Ok(ChannelMessage::Ack),
            MESSAGE_TYPE_OPEN => {
                if buf.remaining() < 11 {
                    return Err(Error::UnexpectedEndOfBuffer {
                        expected: 11,
                        actual: buf.remaining(),
                    });
                }
                let channel_type = buf.get_u8();
                let priority = buf.get_u16();
                let reliability_parameter = buf.get_u32();
                let label_len = buf.get_u16() as usize;
                let protocol_len = buf.get_u16() as usize;
                if buf.remaining() < label_len + protocol_len {
                    return Err(Error::UnexpectedEndOfBuffer {
                        expected: label_len + protocol_len,
                        actual: buf.remaining(),
                    });
                }
                let mut label = vec![0u8; label_len];
                buf.copy_to_slice(&mut label);
                let mut protocol = vec![0u8; protocol_len];
                buf.copy_to_slice(&mut protocol);
                Ok(ChannelMessage::Open(ChannelOpen {
                    channel_type,
                    priority,
                    reliability_parameter,
                    label: String::from_utf8(label)?,
                    protocol: String::from_utf8(protocol)?,
                }))
            }
            other => Err(Error::InvalidMessageType(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_round_trip() {
        let open = ChannelMessage::Open(ChannelOpen {
            channel_type: CHANNEL_TYPE_PARTIAL_REXMIT,
            priority: CHANNEL_PRIORITY_NORMAL,
            reliability_parameter: 3,
            label: "chat".into(),
            protocol: "proto".into(),
        });
        let raw = open.marshal().unwrap();
        let parsed = ChannelMessage::unmarshal(&mut raw.freeze()).unwrap();
        assert_eq!(parsed, open);
    }

    #[test]
    fn test_ack_round_trip() {
        let raw = ChannelMessage::Ack.marshal().unwrap();
        assert_eq!(
            ChannelMessage::unmarshal(&mut raw.freeze()).unwrap(),
            ChannelMessage::Ack
        );
    }

    #[test]
    fn test_reliability_mapping_round_trip() {
        let policies = [
            Reliability::reliable_ordered(),
            Reliability {
                ordered: false,
                kind: ReliabilityKind::Reliable,
            },
            Reliability {
                ordered: true,
                kind: ReliabilityKind::MaxRetransmits(5),
            },
            Reliability {
                ordered: false,
                kind: ReliabilityKind::MaxLifetime(Duration::from_millis(250)),
            },
        ];
        for policy in policies {
            let (channel_type, parameter) = channel_type_and_parameter(&policy);
            assert_eq!(reliability_from_wire(channel_type, parameter).unwrap(), policy);
        }
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let raw = [0x7fu8];
        assert_eq!(
            ChannelMessage::unmarshal(&mut &raw[..]),
            Err(Error::InvalidMessageType(0x7f))
        );
    }
}
