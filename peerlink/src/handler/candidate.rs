use std::collections::VecDeque;
use std::time::Instant;

use log::{debug, trace};

use shared::error::Error;
use shared::{Protocol, TaggedBytesMut, TransportMessage};

use super::message::{CandidateMessage, EngineMessage, TaggedEngineMessage};
use crate::transport::candidate::CandidateAgent;

#[derive(Default)]
pub(crate) struct CandidateContext {
    pub(crate) agent: Option<Box<dyn CandidateAgent>>,
    pub(crate) read_outs: VecDeque<TaggedEngineMessage>,
    pub(crate) write_outs: VecDeque<TaggedEngineMessage>,
}

/// CandidateHandler feeds connectivity-check traffic to the agent and
/// stamps outbound messages with the selected address pair.
pub(crate) struct CandidateHandler<'a> {
    ctx: &'a mut CandidateContext,
}

impl<'a> CandidateHandler<'a> {
    pub(crate) fn new(ctx: &'a mut CandidateContext) -> Self {
        CandidateHandler { ctx }
    }

    pub(crate) fn name(&self) -> &'static str {
        "CandidateHandler"
    }
}

impl Protocol<TaggedEngineMessage, TaggedEngineMessage, ()> for CandidateHandler<'_> {
    type Rout = TaggedEngineMessage;
    type Wout = TaggedEngineMessage;
    type Eout = ();
    type Error = Error;

    fn handle_read(&mut self, msg: TaggedEngineMessage) -> Result<(), Self::Error> {
        if let EngineMessage::Candidate(CandidateMessage::Raw(message)) = msg.message {
            if let Some(agent) = self.ctx.agent.as_mut() {
                agent.handle_read(TransportMessage {
                    now: msg.now,
                    transport: msg.transport,
                    message,
                })?;
            } else {
                trace!("drop connectivity traffic before agent creation");
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

    fn handle_write(&mut self, mut msg: TaggedEngineMessage) -> Result<(), Self::Error> {
        let pair = self.ctx.agent.as_ref().and_then(|agent| agent.selected_pair());
        if let Some((local, remote)) = pair {
            // Stamp the selected address pair onto outbound traffic
            msg.transport.local_addr = local;
            msg.transport.peer_addr = remote;
            self.ctx.write_outs.push_back(msg);
        } else {
            trace!("drop outbound message before a candidate pair is selected");
        }
        Ok(())
    }

    fn poll_write(&mut self) -> Option<Self::Wout> {
        if let Some(agent) = self.ctx.agent.as_mut() {
            while let Some(transmit) = agent.poll_write() {
                debug!("send connectivity check to {}", transmit.transport.peer_addr);
                self.ctx.write_outs.push_back(TaggedEngineMessage {
                    now: transmit.now,
                    transport: transmit.transport,
                    message: EngineMessage::Candidate(CandidateMessage::Raw(transmit.message)),
                });
            }
        }
        self.ctx.write_outs.pop_front()
    }

    fn handle_timeout(&mut self, now: Instant) -> Result<(), Self::Error> {
        if let Some(agent) = self.ctx.agent.as_mut() {
            agent.handle_timeout(now)?;
        }
        Ok(())
    }

    fn poll_timeout(&mut self) -> Option<Instant> {
        self.ctx.agent.as_mut().and_then(|agent| agent.poll_timeout())
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        if let Some(agent) = self.ctx.agent.as_mut() {
            agent.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::candidate::DirectAgent;
    use bytes::BytesMut;

    #[test]
    fn test_outbound_dropped_without_pair() {
        let mut ctx = CandidateContext::default();
        ctx.agent = Some(Box::new(DirectAgent::new("127.0.0.1:1000".parse().unwrap())));
        let mut handler = CandidateHandler::new(&mut ctx);
        handler
            .handle_write(TaggedEngineMessage {
                now: Instant::now(),
                transport: Default::default(),
                message: EngineMessage::Raw(BytesMut::from(&[1u8][..])),
            })
            .unwrap();
        assert!(handler.poll_write().is_none());
    }

    #[test]
    fn test_outbound_stamped_with_selected_pair() {
        use crate::description::CandidateInit;
        use crate::transport::candidate::CandidateAgent as _;

        let mut agent = DirectAgent::new("127.0.0.1:1000".parse().unwrap());
        agent.start_gathering(&[]).unwrap();
        agent
            .add_remote_candidate(&CandidateInit {
                candidate: "127.0.0.1:2000".into(),
                mid: "0".into(),
            })
            .unwrap();
        let mut ctx = CandidateContext::default();
        ctx.agent = Some(Box::new(agent));
        let mut handler = CandidateHandler::new(&mut ctx);
        handler
            .handle_write(TaggedEngineMessage {
                now: Instant::now(),
                transport: Default::default(),
                message: EngineMessage::Raw(BytesMut::from(&[1u8][..])),
            })
            .unwrap();
        let out = handler.poll_write().unwrap();
        assert_eq!(out.transport.peer_addr, "127.0.0.1:2000".parse().unwrap());
        assert_eq!(out.transport.local_addr, "127.0.0.1:1000".parse().unwrap());
    }
}
