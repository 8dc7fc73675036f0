pub(crate) mod message;

use std::collections::VecDeque;

use bytes::BytesMut;

use mux::Reliability;
use shared::error::{Error, Result};

use crate::connection::state::ChannelState;
use crate::connection::Connection;

/// Identifier for a channel within one connection. Distinct from the
/// stream identifier, which may be assigned later in negotiation.
pub type ChannelId = u16;

/// Channel creation options.
#[derive(Default, Debug, Clone)]
pub struct ChannelInit {
    pub reliability: Reliability,
    pub protocol: String,
    /// Pre-negotiated out of band: no in-band open handshake; both peers
    /// must use the same manual stream identifier
    pub negotiated: bool,
    /// Caller-supplied stream identifier; `None` assigns the next free
    /// one consistent with the negotiation role
    pub stream_id: Option<u16>,
}

pub(crate) struct ChannelInner {
    pub(crate) label: String,
    pub(crate) protocol: String,
    pub(crate) reliability: Reliability,
    pub(crate) negotiated: bool,
    pub(crate) stream_id: Option<u16>,
    pub(crate) state: ChannelState,
    /// Sends queued before the stream is writable
    pub(crate) pending_sends: VecDeque<(bool, BytesMut)>,
    /// Bytes held in [pending_sends](Self::pending_sends) plus anything
    /// between the public send call and the association buffer
    pub(crate) queued_bytes: usize,
    pub(crate) low_threshold: usize,
    pub(crate) inbound: VecDeque<(bool, BytesMut)>,
    pub(crate) available: usize,
}

impl ChannelInner {
    pub(crate) fn new(label: String, init: ChannelInit) -> Self {
        Self {
            label,
            protocol: init.protocol,
            reliability: init.reliability,
            negotiated: init.negotiated,
            stream_id: init.stream_id,
            state: ChannelState::Connecting,
            pending_sends: VecDeque::new(),
            queued_bytes: 0,
            low_threshold: 0,
            inbound: VecDeque::new(),
            available: 0,
        }
    }

    pub(crate) fn push_inbound(&mut self, binary: bool, data: BytesMut) {
        self.available += data.len();
        self.inbound.push_back((binary, data));
    }
}

/// Handle to one channel, borrowed from its connection.
pub struct Channel<'a> {
    pub(crate) id: ChannelId,
    pub(crate) connection: &'a mut Connection,
}

impl Channel<'_> {
    pub fn id(&self) -> ChannelId {
        self.id
    }

    fn inner(&self) -> Result<&ChannelInner> {
        self.connection
            .channels
            .get(&self.id)
            .ok_or(Error::ErrChannelNotFound(self.id))
    }

    fn inner_mut(&mut self) -> Result<&mut ChannelInner> {
        self.connection
            .channels
            .get_mut(&self.id)
            .ok_or(Error::ErrChannelNotFound(self.id))
    }

    pub fn label(&self) -> Result<String> {
        Ok(self.inner()?.label.clone())
    }

    pub fn protocol(&self) -> Result<String> {
        Ok(self.inner()?.protocol.clone())
    }

    pub fn reliability(&self) -> Result<Reliability> {
        Ok(self.inner()?.reliability)
    }

    /// Stream identifier, once assigned.
    pub fn stream_id(&self) -> Result<Option<u16>> {
        Ok(self.inner()?.stream_id)
    }

    pub fn state(&self) -> Result<ChannelState> {
        Ok(self.inner()?.state)
    }

    pub fn is_open(&self) -> bool {
        matches!(self.inner().map(|c| c.state), Ok(ChannelState::Open))
    }

    pub fn is_closed(&self) -> bool {
        matches!(
            self.inner().map(|c| c.state),
            Ok(ChannelState::Closed) | Err(_)
        )
    }

    /// Largest message accepted by both peers.
    pub fn max_message_size(&self) -> usize {
        self.connection.max_message_size()
    }

    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        let id = self.id;
        self.connection
            .channel_send(id, true, BytesMut::from(data))
    }

    pub fn send_text(&mut self, text: impl Into<String>) -> Result<()> {
        let id = self.id;
        self.connection
            .channel_send(id, false, BytesMut::from(text.into().as_str()))
    }

    /// Bytes accepted by [send](Self::send) and not yet handed to the
    /// wire.
    pub fn buffered_amount(&self) -> Result<usize> {
        let inner = self.inner()?;
        let assoc_buffered = match inner.stream_id {
            Some(stream_id) => self.connection.stream_buffered_amount(stream_id),
            None => 0,
        };
        Ok(inner.queued_bytes + assoc_buffered)
    }

    pub fn buffered_amount_low_threshold(&self) -> Result<usize> {
        Ok(self.inner()?.low_threshold)
    }

    /// The buffered-amount-low notification fires when the buffered
    /// amount drains from above this threshold to at or below it.
    pub fn set_buffered_amount_low_threshold(&mut self, threshold: usize) -> Result<()> {
        let id = self.id;
        self.connection.channel_set_low_threshold(id, threshold)
    }

    /// Bytes queued for [receive](Self::receive).
    pub fn available_amount(&self) -> Result<usize> {
        Ok(self.inner()?.available)
    }

    /// Pull the next queued message into `buf`.
    ///
    /// Returns `None` when nothing is queued. A message larger than
    /// `buf` is left queued and reported as
    /// [BufferTooSmall](shared::error::ErrorKind::BufferTooSmall); retry
    /// with at least [available_amount](Self::available_amount) bytes.
    /// The flag in the result is true for binary messages.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<Option<(usize, bool)>> {
        let inner = self.inner_mut()?;
        let Some((binary, data)) = inner.inbound.front() else {
            return Ok(None);
        };
        if data.len() > buf.len() {
            return Err(Error::ErrBufferTooSmall {
                required: data.len(),
                provided: buf.len(),
            });
        }
        let binary = *binary;
        let (_, data) = inner.inbound.pop_front().expect("front exists");
        inner.available = inner.available.saturating_sub(data.len());
        buf[..data.len()].copy_from_slice(&data);
        Ok(Some((data.len(), binary)))
    }

    /// Close this channel, signaling a stream reset to the peer when the
    /// association is alive. Queued sends are discarded.
    pub fn close(&mut self) -> Result<()> {
        let id = self.id;
        self.connection.channel_close(id)
    }
}
