use std::collections::VecDeque;
use std::time::Instant;

use log::debug;

use shared::error::Error;
use shared::Protocol;

use super::message::{EngineMessage, SecureMessage, TaggedEngineMessage};
use crate::transport::secure::SecureTransport;

#[derive(Default)]
pub(crate) struct SecureContext {
    pub(crate) transport: Option<SecureTransport>,
    pub(crate) read_outs: VecDeque<TaggedEngineMessage>,
    pub(crate) write_outs: VecDeque<TaggedEngineMessage>,
}

/// SecureHandler moves traffic through the secure-record transport:
/// ciphertext records up to plaintext association packets and back.
pub(crate) struct SecureHandler<'a> {
    ctx: &'a mut SecureContext,
}

impl<'a> SecureHandler<'a> {
    pub(crate) fn new(ctx: &'a mut SecureContext) -> Self {
        SecureHandler { ctx }
    }

    pub(crate) fn name(&self) -> &'static str {
        "SecureHandler"
    }

    fn drain_transport(&mut self, now: Instant) {
        let Some(transport) = self.ctx.transport.as_mut() else {
            return;
        };
        while let Some(record) = transport.poll_transmit() {
            self.ctx.write_outs.push_back(TaggedEngineMessage {
                now,
                transport: Default::default(),
                message: EngineMessage::Secure(SecureMessage::Raw(record)),
            });
        }
    }
}

impl Protocol<TaggedEngineMessage, TaggedEngineMessage, ()> for SecureHandler<'_> {
    type Rout = TaggedEngineMessage;
    type Wout = TaggedEngineMessage;
    type Eout = ();
    type Error = Error;

    fn handle_read(&mut self, msg: TaggedEngineMessage) -> Result<(), Self::Error> {
        if let EngineMessage::Secure(SecureMessage::Raw(record)) = msg.message {
            let Some(transport) = self.ctx.transport.as_mut() else {
                debug!("drop secure record before transport creation");
                return Ok(());
            };
            transport.handle_record_bytes(record)?;
            while let Some(plaintext) = transport.poll_read() {
                self.ctx.read_outs.push_back(TaggedEngineMessage {
                    now: msg.now,
                    transport: msg.transport,
                    message: EngineMessage::Secure(SecureMessage::Plain(plaintext)),
                });
            }
            self.drain_transport(msg.now);
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
        if let EngineMessage::Secure(SecureMessage::Plain(plaintext)) = msg.message {
            let Some(transport) = self.ctx.transport.as_mut() else {
                return Err(Error::ErrSecureTransportNotStarted);
            };
            transport.send(plaintext)?;
            self.drain_transport(msg.now);
        } else {
            // Bypass
            self.ctx.write_outs.push_back(msg);
        }
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        self.drain_transport(Instant::now());
        self.ctx.write_outs.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<(), Self::Error> {
        if let Some(transport) = self.ctx.transport.as_mut() {
            transport.handle_timeout(now)?;
        }
        self.drain_transport(now);
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        self.ctx.transport.as_ref().and_then(|t| t.poll_timeout())
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        if let Some(transport) = self.ctx.transport.as_mut() {
            transport.close();
        }
        self.drain_transport(Instant::now());
        Ok(())
    }
}
