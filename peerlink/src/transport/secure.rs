//! Secure-record transport wrapper.
//!
//! [SecureTransport] owns record framing, handshake scheduling and
//! lifecycle; the cryptographic handshake itself is an external
//! collaborator consumed through [HandshakeEngine]. On completion the
//! engine exports two independent keying contexts: one for the
//! reliable-message transport, one for the media transport.
//!
//! Records are `type (u8) | length (u16) | payload`; partial records are
//! buffered and reassembled, never delivered incomplete.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, BytesMut};
use log::{debug, warn};

use shared::error::{Error, Result};

const RECORD_HEADER_LEN: usize = 3;

/// Record content types, kept inside the secure byte range of the
/// demultiplexer's classification.
const RECORD_ALERT: u8 = 21;
const RECORD_HANDSHAKE: u8 = 22;
const RECORD_APPLICATION: u8 = 23;

const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const INITIAL_RETRANSMIT_INTERVAL: Duration = Duration::from_secs(1);
const MAX_RETRANSMIT_INTERVAL: Duration = Duration::from_secs(8);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SecureRole {
    Client,
    Server,
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum SecureState {
    #[default]
    New,
    Connecting,
    Connected,
    Closed,
    Failed,
}

/// Two independent keying contexts derived at handshake completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    /// Keys the reliable-message transport context
    pub mux: [u8; 32],
    /// Keys the media transport context
    pub media: [u8; 32],
}

#[derive(Debug, PartialEq)]
pub enum SecureEvent {
    Established(KeyMaterial),
    Failed(Error),
    PeerClosed,
}

/// Handshake and record protection collaborator.
pub trait HandshakeEngine: Send {
    /// Start the handshake; returns the initial flight, if any.
    fn begin(&mut self, role: SecureRole) -> Result<Vec<BytesMut>>;

    /// Drive the handshake with one peer message. Returns response
    /// messages plus the exported keys once the handshake completes.
    fn handle_message(&mut self, message: &[u8])
        -> Result<(Vec<BytesMut>, Option<KeyMaterial>)>;

    /// Re-emit the current flight after a retransmission interval.
    fn retransmit(&mut self) -> Result<Vec<BytesMut>>;

    /// Protect one application record.
    fn seal(&mut self, plaintext: BytesMut) -> Result<BytesMut>;

    /// Deprotect one application record.
    fn open(&mut self, ciphertext: BytesMut) -> Result<BytesMut>;
}

pub struct SecureTransport {
    engine: Box<dyn HandshakeEngine>,
    state: SecureState,
    role: Option<SecureRole>,

    recv_buffer: BytesMut,
    read_outs: VecDeque<BytesMut>,
    write_outs: VecDeque<BytesMut>,
    events: VecDeque<SecureEvent>,

    handshake_deadline: Option<Instant>,
    retransmit_deadline: Option<Instant>,
    retransmit_interval: Duration,
}

impl SecureTransport {
    pub fn new(engine: Box<dyn HandshakeEngine>) -> Self {
        Self {
            engine,
            state: SecureState::New,
            role: None,
            recv_buffer: BytesMut::new(),
            read_outs: VecDeque::new(),
            write_outs: VecDeque::new(),
            events: VecDeque::new(),
            handshake_deadline: None,
            retransmit_deadline: None,
            retransmit_interval: INITIAL_RETRANSMIT_INTERVAL,
        }
    }

    pub fn state(&self) -> SecureState {
        self.state
    }

    pub fn role(&self) -> Option<SecureRole> {
        self.role
    }

    pub fn is_connected(&self) -> bool {
        self.state == SecureState::Connected
    }

    /// Begin the handshake asynchronously in the given role.
    pub fn open(&mut self, role: SecureRole, now: Instant) -> Result<()> {
        if self.state != SecureState::New {
            return Err(Error::ErrSecureTransportNotStarted);
        }
        self.state = SecureState::Connecting;
        self.role = Some(role);
        self.handshake_deadline = Some(now + DEFAULT_HANDSHAKE_TIMEOUT);
        self.retransmit_deadline = Some(now + self.retransmit_interval);
        let flight = self.engine.begin(role)?;
        for message in flight {
            self.queue_record(RECORD_HANDSHAKE, message);
        }
        Ok(())
    }

    /// Feed raw bytes from the wire; partial records accumulate until a
    /// complete record is available.
    pub fn handle_record_bytes(&mut self, bytes: BytesMut) -> Result<()> {
        if matches!(self.state, SecureState::New | SecureState::Failed) {
            return Err(Error::ErrSecureTransportNotStarted);
        }
        self.recv_buffer.extend_from_slice(&bytes);
        loop {
            if self.recv_buffer.len() < RECORD_HEADER_LEN {
                return Ok(());
            }
            let length = u16::from_be_bytes([self.recv_buffer[1], self.recv_buffer[2]]) as usize;
            if self.recv_buffer.len() < RECORD_HEADER_LEN + length {
                // Incomplete record stays buffered
                return Ok(());
            }
            let mut record = self.recv_buffer.split_to(RECORD_HEADER_LEN + length);
            let content_type = record[0];
            record.advance(RECORD_HEADER_LEN);
            self.dispatch_record(content_type, record)?;
        }
    }

    fn dispatch_record(&mut self, content_type: u8, payload: BytesMut) -> Result<()> {
        match content_type {
            RECORD_HANDSHAKE => {
                let (responses, keys) = match self.engine.handle_message(&payload) {
                    Ok(output) => output,
                    Err(err) => {
                        let reason = err.to_string();
                        self.fail(err);
                        return Err(Error::ErrHandshakeFailed(reason));
                    }
                };
                for message in responses {
                    self.queue_record(RECORD_HANDSHAKE, message);
                }
                if let Some(keys) = keys {
                    if self.state == SecureState::Connecting {
                        debug!("secure handshake complete");
                        self.state = SecureState::Connected;
                        self.handshake_deadline = None;
                        self.retransmit_deadline = None;
                        self.events.push_back(SecureEvent::Established(keys));
                    }
                }
            }
            RECORD_APPLICATION => {
                if self.state != SecureState::Connected {
                    warn!("drop application record before handshake completion");
                    return Ok(());
                }
                let plaintext = self.engine.open(payload)?;
                self.read_outs.push_back(plaintext);
            }
            RECORD_ALERT => {
                debug!("peer closed the secure transport");
                if self.state != SecureState::Closed {
                    self.state = SecureState::Closed;
                    self.events.push_back(SecureEvent::PeerClosed);
                }
            }
            other => {
                warn!("drop record with unknown content type {other}");
            }
        }
        Ok(())
    }

    /// Protect and queue one application payload.
    pub fn send(&mut self, plaintext: BytesMut) -> Result<()> {
        if self.state != SecureState::Connected {
            return Err(Error::ErrSecureTransportNotStarted);
        }
        let sealed = self.engine.seal(plaintext)?;
        self.queue_record(RECORD_APPLICATION, sealed);
        Ok(())
    }

    /// Next framed record for the wire.
    pub fn poll_transmit(&mut self) -> Option<BytesMut> {
        self.write_outs.pop_front()
    }

    /// Next deprotected application payload.
    pub fn poll_read(&mut self) -> Option<BytesMut> {
        self.read_outs.pop_front()
    }

    pub fn poll_event(&mut self) -> Option<SecureEvent> {
        self.events.pop_front()
    }

    pub fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if self.state != SecureState::Connecting {
            return Ok(());
        }
        if let Some(deadline) = self.handshake_deadline {
            if now >= deadline {
                self.fail(Error::ErrHandshakeTimeout);
                return Ok(());
            }
        }
        if let Some(deadline) = self.retransmit_deadline {
            if now >= deadline {
                let flight = self.engine.retransmit()?;
                for message in flight {
                    self.queue_record(RECORD_HANDSHAKE, message);
                }
                self.retransmit_interval =
                    (self.retransmit_interval * 2).min(MAX_RETRANSMIT_INTERVAL);
                self.retransmit_deadline = Some(now + self.retransmit_interval);
            }
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Option<Instant> {
        match (self.handshake_deadline, self.retransmit_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Graceful teardown: pending records flush through
    /// [poll_transmit](Self::poll_transmit), then the peer is told.
    pub fn close(&mut self) {
        match self.state {
            SecureState::Connecting | SecureState::Connected => {
                self.queue_record(RECORD_ALERT, BytesMut::from(&[0u8][..]));
                self.state = SecureState::Closed;
                self.handshake_deadline = None;
                self.retransmit_deadline = None;
            }
            _ => {}
        }
    }

    fn fail(&mut self, error: Error) {
        warn!("secure transport failure: {error}");
        self.state = SecureState::Failed;
        self.handshake_deadline = None;
        self.retransmit_deadline = None;
        self.events.push_back(SecureEvent::Failed(error));
    }

    fn queue_record(&mut self, content_type: u8, payload: BytesMut) {
        let mut record = BytesMut::with_capacity(RECORD_HEADER_LEN + payload.len());
        record.put_u8(content_type);
        record.put_u16(payload.len() as u16);
        record.extend_from_slice(&payload);
        self.write_outs.push_back(record);
    }
}

/// Pass-through handshake engine: one hello round trip, nonce-mixed key
/// material, identity record protection.
///
/// This engine provides no confidentiality or authentication; it exists
/// for controlled environments and tests. Production embedders supply an
/// engine backed by a real secure-record implementation.
pub struct PlainHandshake {
    role: Option<SecureRole>,
    local_nonce: [u8; 32],
    remote_nonce: Option<[u8; 32]>,
    completed: bool,
}

const PLAIN_HELLO: u8 = 0x01;
const PLAIN_HELLO_ACK: u8 = 0x02;

impl PlainHandshake {
    pub fn new() -> Self {
        Self {
            role: None,
            local_nonce: rand::random::<[u8; 32]>(),
            remote_nonce: None,
            completed: false,
        }
    }

    fn hello(&self, message_type: u8) -> BytesMut {
        let mut message = BytesMut::with_capacity(33);
        message.put_u8(message_type);
        message.extend_from_slice(&self.local_nonce);
        message
    }

    fn derive_keys(&self, client_nonce: &[u8; 32], server_nonce: &[u8; 32]) -> KeyMaterial {
        // Deterministic nonce mixing, identical on both peers. Not a key
        // derivation function: the plain engine offers no secrecy.
        let mix = |label: &[u8]| {
            let mut out = [0u8; 32];
            for (i, byte) in out.iter_mut().enumerate() {
                *byte = client_nonce[i]
                    ^ server_nonce[i].rotate_left(1)
                    ^ label[i % label.len()].wrapping_add(i as u8);
            }
            out
        };
        KeyMaterial {
            mux: mix(b"peerlink mux"),
            media: mix(b"peerlink media"),
        }
    }

    fn keys(&self) -> Result<KeyMaterial> {
        let remote = self
            .remote_nonce
            .as_ref()
            .ok_or(Error::ErrKeyingMaterialUnavailable)?;
        Ok(match self.role {
            Some(SecureRole::Client) => self.derive_keys(&self.local_nonce, remote),
            Some(SecureRole::Server) => self.derive_keys(remote, &self.local_nonce),
            None => return Err(Error::ErrKeyingMaterialUnavailable),
        })
    }
}

impl Default for PlainHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl HandshakeEngine for PlainHandshake {
    fn begin(&mut self, role: SecureRole) -> Result<Vec<BytesMut>> {
        self.role = Some(role);
        Ok(match role {
            SecureRole::Client => vec![self.hello(PLAIN_HELLO)],
            SecureRole::Server => Vec::new(),
        })
    }

    fn handle_message(
        &mut self,
        message: &[u8],
    ) -> Result<(Vec<BytesMut>, Option<KeyMaterial>)> {
        if message.len() != 33 {
            return Err(Error::ErrHandshakeFailed("malformed hello".into()));
        }
        let mut nonce = [0u8; 32];
        nonce.copy_from_slice(&message[1..]);
        match (message[0], self.role) {
            (PLAIN_HELLO, Some(SecureRole::Server)) => {
                self.remote_nonce = Some(nonce);
                let keys = if self.completed {
                    None
                } else {
                    self.completed = true;
                    Some(self.keys()?)
                };
                // Re-acknowledge retransmitted hellos either way
                Ok((vec![self.hello(PLAIN_HELLO_ACK)], keys))
            }
            (PLAIN_HELLO_ACK, Some(SecureRole::Client)) => {
                self.remote_nonce = Some(nonce);
                let keys = if self.completed {
                    None
                } else {
                    self.completed = true;
                    Some(self.keys()?)
                };
                Ok((Vec::new(), keys))
            }
            (other, _) => Err(Error::ErrHandshakeFailed(format!(
                "unexpected handshake message {other:#x}"
            ))),
        }
    }

    fn retransmit(&mut self) -> Result<Vec<BytesMut>> {
        if self.completed {
            return Ok(Vec::new());
        }
        Ok(match self.role {
            Some(SecureRole::Client) => vec![self.hello(PLAIN_HELLO)],
            _ => Vec::new(),
        })
    }

    fn seal(&mut self, plaintext: BytesMut) -> Result<BytesMut> {
        Ok(plaintext)
    }

    fn open(&mut self, ciphertext: BytesMut) -> Result<BytesMut> {
        Ok(ciphertext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SecureTransport, SecureTransport, Instant) {
        let now = Instant::now();
        let mut client = SecureTransport::new(Box::new(PlainHandshake::new()));
        let mut server = SecureTransport::new(Box::new(PlainHandshake::new()));
        client.open(SecureRole::Client, now).unwrap();
        server.open(SecureRole::Server, now).unwrap();
        (client, server, now)
    }

    fn shuttle(a: &mut SecureTransport, b: &mut SecureTransport) {
        loop {
            let mut any = false;
            while let Some(record) = a.poll_transmit() {
                b.handle_record_bytes(record).unwrap();
                any = true;
            }
            while let Some(record) = b.poll_transmit() {
                a.handle_record_bytes(record).unwrap();
                any = true;
            }
            if !any {
                break;
            }
        }
    }

    #[test]
    fn test_handshake_establishes_matching_keys() {
        let (mut client, mut server, _) = pair();
        shuttle(&mut client, &mut server);
        assert!(client.is_connected());
        assert!(server.is_connected());
        let client_keys = match client.poll_event() {
            Some(SecureEvent::Established(keys)) => keys,
            other => panic!("unexpected {other:?}"),
        };
        let server_keys = match server.poll_event() {
            Some(SecureEvent::Established(keys)) => keys,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(client_keys, server_keys);
        assert_ne!(client_keys.mux, client_keys.media);
    }

    #[test]
    fn test_application_data_after_handshake() {
        let (mut client, mut server, _) = pair();
        shuttle(&mut client, &mut server);
        client.send(BytesMut::from(&b"payload"[..])).unwrap();
        shuttle(&mut client, &mut server);
        assert_eq!(server.poll_read(), Some(BytesMut::from(&b"payload"[..])));
    }

    #[test]
    fn test_partial_records_reassembled() {
        let (mut client, mut server, _) = pair();
        shuttle(&mut client, &mut server);
        client.send(BytesMut::from(&b"split across reads"[..])).unwrap();
        let record = client.poll_transmit().unwrap();
        let (first, second) = record.split_at(5);
        server.handle_record_bytes(BytesMut::from(first)).unwrap();
        assert!(server.poll_read().is_none());
        server.handle_record_bytes(BytesMut::from(second)).unwrap();
        assert_eq!(
            server.poll_read(),
            Some(BytesMut::from(&b"split across reads"[..]))
        );
    }

    #[test]
    fn test_send_before_ready_rejected() {
        let (mut client, _server, _) = pair();
        assert_eq!(
            client.send(BytesMut::from(&b"x"[..])),
            Err(Error::ErrSecureTransportNotStarted)
        );
    }

    #[test]
    fn test_handshake_timeout_fails() {
        let now = Instant::now();
        let mut client = SecureTransport::new(Box::new(PlainHandshake::new()));
        client.open(SecureRole::Client, now).unwrap();
        client
            .handle_timeout(now + DEFAULT_HANDSHAKE_TIMEOUT + Duration::from_secs(1))
            .unwrap();
        assert_eq!(client.state(), SecureState::Failed);
        assert!(matches!(
            client.poll_event(),
            Some(SecureEvent::Failed(Error::ErrHandshakeTimeout))
        ));
    }

    #[test]
    fn test_close_notifies_peer() {
        let (mut client, mut server, _) = pair();
        shuttle(&mut client, &mut server);
        client.close();
        shuttle(&mut client, &mut server);
        assert_eq!(server.poll_event(), Some(SecureEvent::PeerClosed));
    }

    #[test]
    fn test_retransmitted_hello_recovers_lost_ack() {
        let (mut client, mut server, now) = pair();
        // Client hello reaches the server, the ack is lost
        while let Some(record) = client.poll_transmit() {
            server.handle_record_bytes(record).unwrap();
        }
        while server.poll_transmit().is_some() {}
        assert!(!client.is_connected());
        // Retransmission interval elapses, hello goes out again
        client.handle_timeout(now + Duration::from_secs(2)).unwrap();
        shuttle(&mut client, &mut server);
        assert!(client.is_connected());
    }
}
