use std::collections::VecDeque;
use std::time::Instant;

use log::debug;

use mux::{Association, AssociationEvent};
use shared::error::Error;
use shared::Protocol;

use super::message::{EngineMessage, SecureMessage, StreamMessage, TaggedEngineMessage};

#[derive(Default)]
pub(crate) struct MuxContext {
    pub(crate) association: Option<Association>,
    pub(crate) read_outs: VecDeque<TaggedEngineMessage>,
    pub(crate) write_outs: VecDeque<TaggedEngineMessage>,
    /// Association lifecycle events for the connection to orchestrate
    pub(crate) event_outs: VecDeque<AssociationEvent>,
}

impl MuxContext {
    /// Split association events: stream data continues up the pipeline,
    /// lifecycle events go to the connection.
    fn drain_events(&mut self, now: Instant) {
        let Some(association) = self.association.as_mut() else {
            return;
        };
        while let Some(event) = association.poll_event() {
            match event {
                AssociationEvent::Data {
                    stream_id,
                    kind,
                    payload,
                } => {
                    self.read_outs.push_back(TaggedEngineMessage {
                        now,
                        transport: Default::default(),
                        message: EngineMessage::Secure(SecureMessage::Stream(StreamMessage {
                            stream_id,
                            kind,
                            payload,
                        })),
                    });
                }
                other => self.event_outs.push_back(other),
            }
        }
    }

    fn drain_transmits(&mut self, now: Instant) {
        let Some(association) = self.association.as_mut() else {
            return;
        };
        while let Some(packet) = association.poll_transmit(now) {
            self.write_outs.push_back(TaggedEngineMessage {
                now,
                transport: Default::default(),
                message: EngineMessage::Secure(SecureMessage::Plain(packet)),
            });
        }
    }
}

/// MuxHandler drives the reliable-message association.
pub(crate) struct MuxHandler<'a> {
    ctx: &'a mut MuxContext,
}

impl<'a> MuxHandler<'a> {
    pub(crate) fn new(ctx: &'a mut MuxContext) -> Self {
        MuxHandler { ctx }
    }

    pub(crate) fn name(&self) -> &'static str {
        "MuxHandler"
    }
}

impl Protocol<TaggedEngineMessage, TaggedEngineMessage, ()> for MuxHandler<'_> {
    type Rout = TaggedEngineMessage;
    type Wout = TaggedEngineMessage;
    type Eout = ();
    type Error = Error;

    fn handle_read(&mut self, msg: TaggedEngineMessage) -> Result<(), Self::Error> {
        if let EngineMessage::Secure(SecureMessage::Plain(packet)) = msg.message {
            let Some(association) = self.ctx.association.as_mut() else {
                debug!("drop association packet before association creation");
                return Ok(());
            };
            association.handle_read(msg.now, packet)?;
            self.ctx.drain_events(msg.now);
            self.ctx.drain_transmits(msg.now);
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
        if let EngineMessage::Secure(SecureMessage::Stream(stream)) = msg.message {
            let Some(association) = self.ctx.association.as_mut() else {
                return Err(Error::ErrAssociationNotEstablished);
            };
            association.write(msg.now, stream.stream_id, stream.kind, stream.payload)?;
            self.ctx.drain_transmits(msg.now);
        } else {
            // Bypass
            self.ctx.write_outs.push_back(msg);
        }
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.ctx.drain_transmits(Instant::now());
        self.ctx.write_outs.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<(), Self::Error> {
        if let Some(association) = self.ctx.association.as_mut() {
            association.handle_timeout(now)?;
        }
        self.ctx.drain_events(now);
        self.ctx.drain_transmits(now);
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        self.ctx.association.as_ref().and_then(|a| a.poll_timeout())
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        let now = Instant::now();
        if let Some(association) = self.ctx.association.as_mut() {
            association.close(now);
        }
        self.ctx.drain_events(now);
        self.ctx.drain_transmits(now);
        Ok(())
    }
}
