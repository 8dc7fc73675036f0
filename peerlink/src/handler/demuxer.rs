use std::collections::VecDeque;
use std::time::Instant;

use log::{debug, error};

use shared::error::Error;
use shared::{Protocol, TaggedBytesMut};

use super::message::{CandidateMessage, EngineMessage, MediaMessage, SecureMessage, TaggedEngineMessage};

/// match_range accepts packets with the first byte in [lower..upper]
fn match_range(lower: u8, upper: u8, buf: &[u8]) -> bool {
    if buf.is_empty() {
        return false;
    }
    let b = buf[0];
    b >= lower && b <= upper
}

/// First-byte classification per RFC 7983: [0..3] connectivity checks,
/// [20..63] secure records, [128..191] media packets.
fn match_secure(b: &[u8]) -> bool {
    match_range(20, 63, b)
}

fn match_media(b: &[u8]) -> bool {
    match_range(128, 191, b)
}

#[derive(Default)]
pub(crate) struct DemuxerContext {
    pub(crate) read_outs: VecDeque<TaggedEngineMessage>,
    pub(crate) write_outs: VecDeque<TaggedBytesMut>,
}

/// DemuxerHandler classifies inbound datagrams by header signature and
/// flattens outbound layer messages back to raw datagrams.
pub(crate) struct DemuxerHandler<'a> {
    ctx: &'a mut DemuxerContext,
}

impl<'a> DemuxerHandler<'a> {
    pub(crate) fn new(ctx: &'a mut DemuxerContext) -> Self {
        DemuxerHandler { ctx }
    }

    pub(crate) fn name(&self) -> &'static str {
        "DemuxerHandler"
    }
}

impl Protocol<TaggedBytesMut, TaggedEngineMessage, ()> for DemuxerHandler<'_> {
    type Rout = TaggedEngineMessage;
    type Wout = TaggedBytesMut;
    type Eout = ();
    type Error = Error;

    fn handle_read(&mut self, msg: TaggedBytesMut) -> Result<(), Self::Error> {
        if msg.message.is_empty() {
            error!("drop invalid packet due to zero length");
        } else if match_secure(&msg.message) {
            self.ctx.read_outs.push_back(TaggedEngineMessage {
                now: msg.now,
                transport: msg.transport,
                message: EngineMessage::Secure(SecureMessage::Raw(msg.message)),
            });
        } else if match_media(&msg.message) {
            self.ctx.read_outs.push_back(TaggedEngineMessage {
                now: msg.now,
                transport: msg.transport,
                message: EngineMessage::Media(MediaMessage::Raw(msg.message)),
            });
        } else {
            self.ctx.read_outs.push_back(TaggedEngineMessage {
                now: msg.now,
                transport: msg.transport,
                message: EngineMessage::Candidate(CandidateMessage::Raw(msg.message)),
            });
        }
        Ok(())
    }

    fn poll_read(&mut self) -> Option<Self::Rout> {
        self.ctx.read_outs.pop_front()
    }

    fn handle_write(&mut self, msg: TaggedEngineMessage) -> Result<(), Self::Error> {
        match msg.message {
            EngineMessage::Candidate(CandidateMessage::Raw(message))
            | EngineMessage::Secure(SecureMessage::Raw(message))
            | EngineMessage::Media(MediaMessage::Raw(message))
            | EngineMessage::Raw(message) => {
                self.ctx.write_outs.push_back(TaggedBytesMut {
                    now: msg.now,
                    transport: msg.transport,
                    message,
                });
            }
            _ => {
                debug!("drop non-raw outbound message {:?}", msg.message);
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn tagged(first_byte: u8) -> TaggedBytesMut {
        TaggedBytesMut {
            now: Instant::now(),
            transport: Default::default(),
            message: BytesMut::from(&[first_byte, 0, 0, 0][..]),
        }
    }

    #[test]
    fn test_classification_by_first_byte() {
        let mut ctx = DemuxerContext::default();
        let mut handler = DemuxerHandler::new(&mut ctx);
        handler.handle_read(tagged(0)).unwrap();
        handler.handle_read(tagged(22)).unwrap();
        handler.handle_read(tagged(144)).unwrap();

        assert!(matches!(
            handler.poll_read().unwrap().message,
            EngineMessage::Candidate(_)
        ));
        assert!(matches!(
            handler.poll_read().unwrap().message,
            EngineMessage::Secure(SecureMessage::Raw(_))
        ));
        assert!(matches!(
            handler.poll_read().unwrap().message,
            EngineMessage::Media(MediaMessage::Raw(_))
        ));
    }

    #[test]
    fn test_empty_datagram_dropped() {
        let mut ctx = DemuxerContext::default();
        let mut handler = DemuxerHandler::new(&mut ctx);
        handler
            .handle_read(TaggedBytesMut {
                now: Instant::now(),
                transport: Default::default(),
                message: BytesMut::new(),
            })
            .unwrap();
        assert!(handler.poll_read().is_none());
    }
}
