use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use bytes::BytesMut;
use log::{debug, warn};

use mux::{PayloadKind, Reliability};
use shared::error::Error;
use shared::marshal::{Marshal, Unmarshal};
use shared::Protocol;

use super::message::{EngineMessage, SecureMessage, StreamMessage, TaggedEngineMessage};
use crate::channel::message::{reliability_from_wire, ChannelMessage};
use crate::channel::{ChannelId, ChannelInner};

/// Signaling outcomes for the connection to orchestrate.
#[derive(Debug)]
pub(crate) enum ChannelNotice {
    RemoteOpen {
        stream_id: u16,
        reliability: Reliability,
        label: String,
        protocol: String,
    },
    AckReceived {
        stream_id: u16,
    },
    Available {
        channel_id: ChannelId,
    },
}

#[derive(Default)]
pub(crate) struct ChannelContext {
    pub(crate) read_outs: VecDeque<TaggedEngineMessage>,
    pub(crate) write_outs: VecDeque<TaggedEngineMessage>,
    pub(crate) notices: VecDeque<ChannelNotice>,
}

/// ChannelHandler frames channel signaling and data onto association
/// streams.
pub(crate) struct ChannelHandler<'a> {
    ctx: &'a mut ChannelContext,
    channels: &'a mut HashMap<ChannelId, ChannelInner>,
    stream_index: &'a mut HashMap<u16, ChannelId>,
}

impl<'a> ChannelHandler<'a> {
    pub(crate) fn new(
        ctx: &'a mut ChannelContext,
        channels: &'a mut HashMap<ChannelId, ChannelInner>,
        stream_index: &'a mut HashMap<u16, ChannelId>,
    ) -> Self {
        ChannelHandler {
            ctx,
            channels,
            stream_index,
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        "ChannelHandler"
    }

    fn handle_control(&mut self, stream: StreamMessage) -> Result<(), Error> {
        let mut buf = &stream.payload[..];
        match ChannelMessage::unmarshal(&mut buf)? {
            ChannelMessage::Open(open) => {
                let reliability =
                    reliability_from_wire(open.channel_type, open.reliability_parameter)?;
                debug!(
                    "remote channel open on stream {} label {:?}",
                    stream.stream_id, open.label
                );
                self.ctx.notices.push_back(ChannelNotice::RemoteOpen {
                    stream_id: stream.stream_id,
                    reliability,
                    label: open.label,
                    protocol: open.protocol,
                });
            }
            ChannelMessage::Ack => {
                self.ctx.notices.push_back(ChannelNotice::AckReceived {
                    stream_id: stream.stream_id,
                });
            }
        }
        Ok(())
    }

    fn handle_data(&mut self, stream: StreamMessage) {
        let Some(&channel_id) = self.stream_index.get(&stream.stream_id) else {
            warn!("drop data on unknown stream {}", stream.stream_id);
            return;
        };
        let Some(channel) = self.channels.get_mut(&channel_id) else {
            warn!("stream {} maps to a deleted channel", stream.stream_id);
            return;
        };
        let (binary, data) = match stream.kind {
            PayloadKind::Binary => (true, stream.payload),
            PayloadKind::BinaryEmpty => (true, BytesMut::new()),
            PayloadKind::Text => (false, stream.payload),
            PayloadKind::TextEmpty => (false, BytesMut::new()),
            PayloadKind::Control => unreachable!("control handled above"),
        };
        channel.push_inbound(binary, data);
        self.ctx
            .notices
            .push_back(ChannelNotice::Available { channel_id });
    }
}

impl Protocol<TaggedEngineMessage, TaggedEngineMessage, ()> for ChannelHandler<'_> {
    type Rout = TaggedEngineMessage;
    type Wout = TaggedEngineMessage;
    type Eout = ();
    type Error = Error;

    fn handle_read(&mut self, msg: TaggedEngineMessage) -> Result<(), Self::Error> {
        if let EngineMessage::Secure(SecureMessage::Stream(stream)) = msg.message {
            if stream.kind == PayloadKind::Control {
                self.handle_control(stream)?;
            } else {
                self.handle_data(stream);
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
        if let EngineMessage::Secure(SecureMessage::Application(app)) = msg.message {
            let Some(channel) = self.channels.get_mut(&app.channel_id) else {
                return Err(Error::ErrChannelNotFound(app.channel_id));
            };
            let Some(stream_id) = channel.stream_id else {
                return Err(Error::ErrChannelClosed);
            };
            channel.queued_bytes = channel.queued_bytes.saturating_sub(app.data.len());
            let kind = match (app.binary, app.data.is_empty()) {
                (true, false) => PayloadKind::Binary,
                (true, true) => PayloadKind::BinaryEmpty,
                (false, false) => PayloadKind::Text,
                (false, true) => PayloadKind::TextEmpty,
            };
            self.ctx.write_outs.push_back(TaggedEngineMessage {
                now: msg.now,
                transport: msg.transport,
                message: EngineMessage::Secure(SecureMessage::Stream(StreamMessage {
                    stream_id,
                    kind,
                    payload: app.data,
                })),
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

    fn handle_timeout(&mut self, _now: Instant) -> Result<(), Self::Error> {
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        None
    }
}

/// Marshal one signaling message into a control payload for a stream.
pub(crate) fn control_message(
    stream_id: u16,
    message: &ChannelMessage,
) -> Result<StreamMessage, Error> {
    Ok(StreamMessage {
        stream_id,
        kind: PayloadKind::Control,
        payload: message.marshal()?,
    })
}
