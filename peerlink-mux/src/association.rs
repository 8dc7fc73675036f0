use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::{debug, trace, warn};

use shared::error::{Error, Result};
use shared::marshal::{padding_size, MarshalSize};

use crate::chunk::{
    marshal_packet, unmarshal_packet, AckChunk, Chunk, DataChunk, ForwardChunk, GapBlock,
    InitChunk, PayloadKind, CHUNK_HEADER_LEN,
};
use crate::config::TransportTuning;
use crate::reliability::{Reliability, ReliabilityKind};
use crate::stream::Stream;

/// Role the association takes during establishment. By convention this is
/// the secure-transport role: the client initiates.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MuxRole {
    Client,
    Server,
}

#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum AssociationState {
    #[default]
    Closed,
    Connecting,
    Established,
    /// Local close requested, flushing outstanding data
    Closing,
    /// Shutdown sent, awaiting acknowledgment
    ShutdownSent,
}

/// Events surfaced to the layer above.
#[derive(Debug, PartialEq)]
pub enum AssociationEvent {
    Established {
        max_streams: u16,
        max_message_size: u32,
    },
    Data {
        stream_id: u16,
        kind: PayloadKind,
        payload: BytesMut,
    },
    BufferedAmountLow {
        stream_id: u16,
    },
    /// The peer reset its outgoing stream
    StreamReset {
        stream_id: u16,
    },
    Closed,
    Error(Error),
}

/// True when `a` precedes `b` in wrapping 32-bit sequence space.
fn tsn_lt(a: u32, b: u32) -> bool {
    a != b && b.wrapping_sub(a) < 1 << 31
}

struct RtoCalculator {
    srtt: Option<Duration>,
    rttvar: Duration,
    rto: Duration,
    min: Duration,
    max: Duration,
}

impl RtoCalculator {
    fn new(tuning: &TransportTuning) -> Self {
        Self {
            srtt: None,
            rttvar: Duration::ZERO,
            rto: tuning.rto_initial,
            min: tuning.rto_min,
            max: tuning.rto_max,
        }
    }

    fn current(&self) -> Duration {
        self.rto
    }

    fn sample(&mut self, rtt: Duration) {
        match self.srtt {
            None => {
                self.srtt = Some(rtt);
                self.rttvar = rtt / 2;
            }
            Some(srtt) => {
                let delta = if srtt > rtt { srtt - rtt } else { rtt - srtt };
                self.rttvar = (self.rttvar * 3 + delta) / 4;
                self.srtt = Some((srtt * 7 + rtt) / 8);
            }
        }
        let srtt = self.srtt.unwrap_or(rtt);
        self.rto = (srtt + 4 * self.rttvar).clamp(self.min, self.max);
    }

    fn backoff(&mut self) {
        self.rto = (self.rto * 2).min(self.max);
    }
}

struct PendingChunk {
    chunk: DataChunk,
    reliability: Reliability,
    enqueued_at: Instant,
}

struct InflightChunk {
    chunk: DataChunk,
    reliability: Reliability,
    first_sent: Instant,
    /// Transmission count, including the first send
    attempts: u32,
    acked: bool,
    abandoned: bool,
    retransmit: bool,
    miss_count: u8,
}

impl InflightChunk {
    fn settled(&self) -> bool {
        self.acked || self.abandoned
    }
}

struct PartialMessage {
    ssn: u16,
    kind: PayloadKind,
    unordered: bool,
    data: BytesMut,
}

struct ReceivedChunk {
    chunk: DataChunk,
    delivered: bool,
}

/// One reliable-message association multiplexing many streams.
pub struct Association {
    state: AssociationState,
    role: MuxRole,
    tuning: TransportTuning,
    local_tag: u32,
    peer_tag: u32,
    local_initial_tsn: u32,
    remote_max_message_size: u32,
    remote_max_streams: u16,

    // send side
    next_tsn: u32,
    pending: VecDeque<PendingChunk>,
    in_flight: VecDeque<InflightChunk>,
    last_cum_acked: u32,
    peer_rwnd: u32,
    flight_size: usize,
    forward_due: bool,

    // receive side
    cum_tsn: u32,
    received: HashMap<u32, ReceivedChunk>,
    received_bytes: usize,
    partials: HashMap<u16, PartialMessage>,
    ack_due: bool,
    next_reset_seq: u32,

    streams: HashMap<u16, Stream>,

    // timers
    init_due: bool,
    init_deadline: Option<Instant>,
    init_attempts: u32,
    rto: RtoCalculator,
    t3_deadline: Option<Instant>,
    ack_deadline: Option<Instant>,
    heartbeat_deadline: Option<Instant>,
    shutdown_attempts: u32,

    control_queue: VecDeque<Chunk>,
    events: VecDeque<AssociationEvent>,
}

impl Association {
    pub fn new(role: MuxRole, tuning: TransportTuning, now: Instant) -> Self {
        let local_tag = rand::random::<u32>().max(1);
        let local_initial_tsn = rand::random::<u32>();
        let rto = RtoCalculator::new(&tuning);
        let (init_due, init_deadline) = match role {
            MuxRole::Client => (true, Some(now + tuning.rto_initial)),
            MuxRole::Server => (false, None),
        };
        let heartbeat_deadline = Some(now + tuning.heartbeat_interval);
        Self {
            state: AssociationState::Connecting,
            role,
            local_tag,
            peer_tag: 0,
            local_initial_tsn,
            remote_max_message_size: 0,
            remote_max_streams: 0,
            next_tsn: local_initial_tsn,
            pending: VecDeque::new(),
            in_flight: VecDeque::new(),
            last_cum_acked: local_initial_tsn.wrapping_sub(1),
            peer_rwnd: 0,
            flight_size: 0,
            forward_due: false,
            cum_tsn: 0,
            received: HashMap::new(),
            received_bytes: 0,
            partials: HashMap::new(),
            ack_due: false,
            next_reset_seq: 0,
            streams: HashMap::new(),
            init_due,
            init_deadline,
            init_attempts: 0,
            rto,
            t3_deadline: None,
            ack_deadline: None,
            heartbeat_deadline,
            shutdown_attempts: 0,
            control_queue: VecDeque::new(),
            events: VecDeque::new(),
            tuning,
        }
    }

    pub fn state(&self) -> AssociationState {
        self.state
    }

    pub fn is_established(&self) -> bool {
        self.state == AssociationState::Established
    }

    /// Stream count supported by both endpoints, meaningful once established.
    pub fn max_streams(&self) -> u16 {
        if self.remote_max_streams == 0 {
            self.tuning.max_streams
        } else {
            self.tuning.max_streams.min(self.remote_max_streams)
        }
    }

    pub fn remote_max_message_size(&self) -> u32 {
        self.remote_max_message_size
    }

    /// Register a stream's reliability policy before sending on it.
    pub fn open_stream(&mut self, stream_id: u16, reliability: Reliability) -> Result<()> {
        if self.streams.contains_key(&stream_id) {
            return Err(Error::ErrStreamAlreadyExists(stream_id));
        }
        self.streams.insert(stream_id, Stream::new(reliability));
        Ok(())
    }

    pub fn has_stream(&self, stream_id: u16) -> bool {
        self.streams.contains_key(&stream_id)
    }

    pub fn buffered_amount(&self, stream_id: u16) -> usize {
        self.streams
            .get(&stream_id)
            .map(|s| s.buffered_amount())
            .unwrap_or(0)
    }

    pub fn buffered_amount_low_threshold(&self, stream_id: u16) -> usize {
        self.streams
            .get(&stream_id)
            .map(|s| s.low_threshold())
            .unwrap_or(0)
    }

    pub fn set_buffered_amount_low_threshold(&mut self, stream_id: u16, threshold: usize) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.set_low_threshold(threshold);
        }
    }

    /// Enqueue one application message on a stream.
    pub fn write(
        &mut self,
        now: Instant,
        stream_id: u16,
        kind: PayloadKind,
        payload: BytesMut,
    ) -> Result<()> {
        match self.state {
            AssociationState::Established => {}
            AssociationState::Connecting => return Err(Error::ErrAssociationNotEstablished),
            _ => return Err(Error::ErrAssociationClosed),
        }
        let remote_cap = if self.remote_max_message_size == 0 {
            u32::MAX
        } else {
            self.remote_max_message_size
        };
        let max_message = self.tuning.max_message_size.min(remote_cap);
        if payload.len() > max_message as usize {
            return Err(Error::ErrOutboundPacketTooLarge);
        }
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::ErrStreamNotFound(stream_id))?;
        if stream.buffered_amount() + payload.len() > self.tuning.send_buffer_size as usize {
            return Err(Error::ErrSendBufferFull);
        }
        let reliability = stream.reliability;
        let ordered = reliability.ordered;
        let ssn = if ordered {
            let ssn = stream.next_ssn_out;
            stream.next_ssn_out = stream.next_ssn_out.wrapping_add(1);
            ssn
        } else {
            0
        };
        stream.on_enqueued(payload.len());

        // Fragment into chunks within the data budget; the buffered counter
        // drains chunk by chunk as acknowledgments arrive. An empty message
        // still produces one begin/end chunk.
        let fragment = self.tuning.fragment_size.max(1);
        let total = payload.len();
        let mut offset = 0;
        loop {
            let end_offset = (offset + fragment).min(total);
            let last = end_offset == total;
            let mut fragment_payload = BytesMut::with_capacity(end_offset - offset);
            fragment_payload.extend_from_slice(&payload[offset..end_offset]);
            let chunk = DataChunk {
                tsn: self.next_tsn,
                stream_id,
                stream_seq: ssn,
                kind,
                unordered: !ordered,
                begin: offset == 0,
                end: last,
                payload: fragment_payload,
            };
            self.next_tsn = self.next_tsn.wrapping_add(1);
            self.pending.push_back(PendingChunk {
                chunk,
                reliability,
                enqueued_at: now,
            });
            if last {
                break;
            }
            offset = end_offset;
        }
        Ok(())
    }

    /// Request a reset of our outgoing stream; the peer observes it as a
    /// stream-reset event.
    pub fn reset_stream(&mut self, stream_id: u16) -> Result<()> {
        let stream = self
            .streams
            .get_mut(&stream_id)
            .ok_or(Error::ErrStreamNotFound(stream_id))?;
        if stream.reset_sent {
            return Ok(());
        }
        stream.reset_sent = true;
        let request_seq = self.next_reset_seq;
        self.next_reset_seq = self.next_reset_seq.wrapping_add(1);
        self.control_queue.push_back(Chunk::Reset {
            request_seq,
            stream_id,
        });
        Ok(())
    }

    /// Graceful teardown: flush outstanding data, then signal shutdown.
    pub fn close(&mut self, now: Instant) {
        match self.state {
            AssociationState::Closed => {}
            AssociationState::Connecting => {
                self.state = AssociationState::Closed;
                self.init_deadline = None;
                self.events.push_back(AssociationEvent::Closed);
            }
            AssociationState::Established => {
                self.state = AssociationState::Closing;
                self.maybe_shutdown(now);
            }
            AssociationState::Closing | AssociationState::ShutdownSent => {}
        }
    }

    pub fn poll_event(&mut self) -> Option<AssociationEvent> {
        self.events.pop_front()
    }

    /// Feed one inbound association packet.
    pub fn handle_read(&mut self, now: Instant, packet: BytesMut) -> Result<()> {
        let mut buf = packet.freeze();
        let (tag, chunks) = unmarshal_packet(&mut buf)?;
        let carries_init = matches!(chunks.first(), Some(Chunk::Init(_)));
        if !carries_init && tag != self.local_tag {
            warn!("drop packet with unknown verification tag {tag:#x}");
            return Ok(());
        }
        for chunk in chunks {
            self.handle_chunk(now, chunk)?;
        }
        Ok(())
    }

    fn handle_chunk(&mut self, now: Instant, chunk: Chunk) -> Result<()> {
        match chunk {
            Chunk::Init(init) => self.handle_init(init),
            Chunk::InitAck(init) => self.handle_init_ack(now, init),
            Chunk::Data(data) => self.handle_data(now, data),
            Chunk::Ack(ack) => self.handle_ack(now, ack),
            Chunk::Heartbeat(nonce) => {
                self.control_queue.push_back(Chunk::HeartbeatAck(nonce));
                Ok(())
            }
            Chunk::HeartbeatAck(_) => Ok(()),
            Chunk::Shutdown { .. } => {
                self.control_queue.push_back(Chunk::ShutdownAck);
                if self.state != AssociationState::Closed {
                    self.state = AssociationState::Closed;
                    self.t3_deadline = None;
                    self.events.push_back(AssociationEvent::Closed);
                }
                Ok(())
            }
            Chunk::ShutdownAck => {
                if self.state == AssociationState::ShutdownSent {
                    self.state = AssociationState::Closed;
                    self.t3_deadline = None;
                    self.events.push_back(AssociationEvent::Closed);
                }
                Ok(())
            }
            Chunk::Forward(forward) => self.handle_forward(forward),
            Chunk::Reset {
                request_seq,
                stream_id,
            } => {
                self.control_queue.push_back(Chunk::ResetAck { request_seq });
                if let Some(stream) = self.streams.get_mut(&stream_id) {
                    stream.reset_receive_state();
                }
                self.partials.remove(&stream_id);
                self.events
                    .push_back(AssociationEvent::StreamReset { stream_id });
                Ok(())
            }
            Chunk::ResetAck { .. } => Ok(()),
        }
    }

    fn handle_init(&mut self, init: InitChunk) -> Result<()> {
        if self.role != MuxRole::Server {
            return Err(Error::ErrAssociationInitCollision);
        }
        let already_established = self.state == AssociationState::Established;
        self.peer_tag = init.initiate_tag;
        self.peer_rwnd = init.a_rwnd;
        self.remote_max_streams = init.max_streams;
        self.remote_max_message_size = init.max_message_size;
        if !already_established {
            self.cum_tsn = init.initial_tsn.wrapping_sub(1);
            self.state = AssociationState::Established;
            self.events.push_back(AssociationEvent::Established {
                max_streams: self.max_streams(),
                max_message_size: self.remote_max_message_size,
            });
        }
        // The ack is re-sent verbatim for a retransmitted init
        let init_ack = Chunk::InitAck(self.local_init_chunk());
        self.control_queue.push_back(init_ack);
        Ok(())
    }

    fn handle_init_ack(&mut self, now: Instant, init: InitChunk) -> Result<()> {
        if self.role != MuxRole::Client || self.state != AssociationState::Connecting {
            return Ok(());
        }
        self.peer_tag = init.initiate_tag;
        self.peer_rwnd = init.a_rwnd;
        self.remote_max_streams = init.max_streams;
        self.remote_max_message_size = init.max_message_size;
        self.cum_tsn = init.initial_tsn.wrapping_sub(1);
        self.init_deadline = None;
        self.init_due = false;
        self.state = AssociationState::Established;
        self.heartbeat_deadline = Some(now + self.tuning.heartbeat_interval);
        self.events.push_back(AssociationEvent::Established {
            max_streams: self.max_streams(),
            max_message_size: self.remote_max_message_size,
        });
        Ok(())
    }

    fn handle_data(&mut self, now: Instant, data: DataChunk) -> Result<()> {
        if !matches!(
            self.state,
            AssociationState::Established | AssociationState::Closing
        ) {
            return Ok(());
        }
        let tsn = data.tsn;
        let is_dup = !tsn_lt(self.cum_tsn, tsn) || self.received.contains_key(&tsn);
        if is_dup {
            trace!("duplicate data tsn {tsn}");
            self.ack_due = true;
            return Ok(());
        }
        if self.received.len() >= self.tuning.max_queued_chunks {
            // Receive queue protection: drop without acknowledging so the
            // peer retransmits once the queue drains.
            warn!("receive queue full, dropping tsn {tsn}");
            return Ok(());
        }

        self.received_bytes += data.payload.len();
        let mut delivered = false;
        if data.unordered && data.begin && data.end {
            // Complete unordered message: deliverable ahead of the
            // cumulative TSN, in arrival order.
            self.events.push_back(AssociationEvent::Data {
                stream_id: data.stream_id,
                kind: data.kind,
                payload: data.payload.clone(),
            });
            delivered = true;
        }
        self.received.insert(
            tsn,
            ReceivedChunk {
                chunk: data,
                delivered,
            },
        );

        self.advance_cumulative();

        if self.received.is_empty() {
            // In-order arrival: delayed acknowledgment
            if self.ack_deadline.is_none() && !self.ack_due {
                self.ack_deadline = Some(now + self.tuning.ack_delay);
            }
        } else {
            // Gap detected: acknowledge immediately so the sender can
            // fast-retransmit.
            self.ack_due = true;
        }
        Ok(())
    }

    /// Advance the cumulative TSN over any consecutive run, feeding newly
    /// in-order chunks to reassembly.
    fn advance_cumulative(&mut self) {
        while let Some(received) = self.received.remove(&self.cum_tsn.wrapping_add(1)) {
            self.cum_tsn = self.cum_tsn.wrapping_add(1);
            self.received_bytes = self
                .received_bytes
                .saturating_sub(received.chunk.payload.len());
            if !received.delivered {
                self.reassemble(received.chunk);
            }
        }
    }

    fn reassemble(&mut self, chunk: DataChunk) {
        let stream_id = chunk.stream_id;
        if chunk.begin {
            if self.partials.remove(&stream_id).is_some() {
                warn!("discarding incomplete message on stream {stream_id}");
            }
            self.partials.insert(
                stream_id,
                PartialMessage {
                    ssn: chunk.stream_seq,
                    kind: chunk.kind,
                    unordered: chunk.unordered,
                    data: BytesMut::new(),
                },
            );
        }
        let Some(partial) = self.partials.get_mut(&stream_id) else {
            warn!("fragment without a message start on stream {stream_id}");
            return;
        };
        partial.data.extend_from_slice(&chunk.payload);
        if !chunk.end {
            return;
        }
        let partial = self.partials.remove(&stream_id).expect("partial exists");
        if partial.unordered {
            self.events.push_back(AssociationEvent::Data {
                stream_id,
                kind: partial.kind,
                payload: partial.data,
            });
            return;
        }
        let stream = self
            .streams
            .entry(stream_id)
            .or_insert_with(|| Stream::new(Reliability::reliable_ordered()));
        let ready = stream.deliver_ordered(partial.ssn, partial.kind, partial.data);
        let overflowed = stream.pending_ordered() > self.tuning.max_queued_chunks;
        for (kind, payload) in ready {
            self.events.push_back(AssociationEvent::Data {
                stream_id,
                kind,
                payload,
            });
        }
        if overflowed {
            self.fail(Error::ErrReceiveQueueFull);
        }
    }

    fn handle_ack(&mut self, now: Instant, ack: AckChunk) -> Result<()> {
        self.peer_rwnd = ack.a_rwnd;

        // Cumulative acknowledgment
        while let Some(front) = self.in_flight.front() {
            if tsn_lt(ack.cumulative_tsn, front.chunk.tsn) {
                break;
            }
            self.settle_index(now, 0);
            self.in_flight.pop_front();
        }
        if tsn_lt(self.last_cum_acked, ack.cumulative_tsn) {
            self.last_cum_acked = ack.cumulative_tsn;
        }

        // Gap acknowledgments and miss counting
        if !ack.gaps.is_empty() {
            let mut highest_gap_acked = ack.cumulative_tsn;
            for gap in &ack.gaps {
                for offset in gap.start..=gap.end {
                    let tsn = ack.cumulative_tsn.wrapping_add(offset as u32);
                    if tsn_lt(highest_gap_acked, tsn) {
                        highest_gap_acked = tsn;
                    }
                    if let Some(idx) =
                        self.in_flight.iter().position(|c| c.chunk.tsn == tsn)
                    {
                        self.settle_index(now, idx);
                    }
                }
            }
            // Chunks below the highest gap-acked TSN that are still
            // unacknowledged were likely lost.
            let mut fast_retransmit = false;
            for inflight in self.in_flight.iter_mut() {
                if !inflight.settled() && tsn_lt(inflight.chunk.tsn, highest_gap_acked) {
                    inflight.miss_count = inflight.miss_count.saturating_add(1);
                    if inflight.miss_count >= 3 && !inflight.retransmit {
                        inflight.retransmit = true;
                        fast_retransmit = true;
                    }
                }
            }
            if fast_retransmit {
                debug!("fast retransmit triggered by gap reports");
            }
        }

        if self.in_flight.iter().any(|c| c.abandoned) {
            // The peer still needs a forward point to get past the holes
            self.forward_due = true;
        }
        if self.in_flight.is_empty() && self.pending.is_empty() {
            self.t3_deadline = None;
        } else {
            self.t3_deadline = Some(now + self.rto.current());
        }
        self.maybe_shutdown(now);
        Ok(())
    }

    /// Account for a chunk acknowledged by the peer.
    fn settle_index(&mut self, now: Instant, idx: usize) {
        let (len, stream_id, attempts, first_sent) = {
            let inflight = &mut self.in_flight[idx];
            if inflight.settled() {
                return;
            }
            inflight.acked = true;
            inflight.retransmit = false;
            (
                inflight.chunk.payload.len(),
                inflight.chunk.stream_id,
                inflight.attempts,
                inflight.first_sent,
            )
        };
        self.flight_size = self.flight_size.saturating_sub(len);
        if attempts == 1 {
            self.rto.sample(now.duration_since(first_sent));
        }
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            if stream.on_dequeued(len) {
                self.events
                    .push_back(AssociationEvent::BufferedAmountLow { stream_id });
            }
        }
    }

    fn handle_forward(&mut self, forward: ForwardChunk) -> Result<()> {
        if tsn_lt(self.cum_tsn, forward.new_cumulative_tsn) {
            // Drop anything the sender abandoned
            let mut tsn = self.cum_tsn.wrapping_add(1);
            while !tsn_lt(forward.new_cumulative_tsn, tsn) {
                if let Some(received) = self.received.remove(&tsn) {
                    self.received_bytes = self
                        .received_bytes
                        .saturating_sub(received.chunk.payload.len());
                }
                tsn = tsn.wrapping_add(1);
            }
            self.cum_tsn = forward.new_cumulative_tsn;
            self.ack_due = true;
            self.advance_cumulative();
        }
        for (stream_id, ssn) in forward.streams {
            // Abandoned fragments may have left a partial message behind
            self.partials.remove(&stream_id);
            let Some(stream) = self.streams.get_mut(&stream_id) else {
                continue;
            };
            let ready = stream.skip_past(ssn);
            for (kind, payload) in ready {
                self.events.push_back(AssociationEvent::Data {
                    stream_id,
                    kind,
                    payload,
                });
            }
        }
        Ok(())
    }

    /// Drive timers: init retransmission, data retransmission, delayed
    /// acknowledgment, lifetime expiry, heartbeats.
    pub fn handle_timeout(&mut self, now: Instant) -> Result<()> {
        if let Some(deadline) = self.init_deadline {
            if now >= deadline {
                self.init_attempts += 1;
                if self.init_attempts > self.tuning.max_retransmit_attempts {
                    self.init_deadline = None;
                    self.fail(Error::ErrRetransmitsExhausted);
                    return Ok(());
                }
                self.rto.backoff();
                self.init_due = true;
                self.init_deadline = Some(now + self.rto.current());
            }
        }

        if let Some(deadline) = self.ack_deadline {
            if now >= deadline {
                self.ack_deadline = None;
                self.ack_due = true;
            }
        }

        if let Some(deadline) = self.t3_deadline {
            if now >= deadline {
                self.on_retransmit_timeout(now);
            }
        }

        self.expire_lifetimes(now);

        if let Some(deadline) = self.heartbeat_deadline {
            if now >= deadline {
                if self.state == AssociationState::Established && self.in_flight.is_empty() {
                    self.control_queue
                        .push_back(Chunk::Heartbeat(rand::random::<u64>()));
                }
                self.heartbeat_deadline = Some(now + self.tuning.heartbeat_interval);
            }
        }
        Ok(())
    }

    fn on_retransmit_timeout(&mut self, now: Instant) {
        if self.state == AssociationState::ShutdownSent {
            self.shutdown_attempts += 1;
            if self.shutdown_attempts > self.tuning.max_retransmit_attempts {
                self.state = AssociationState::Closed;
                self.t3_deadline = None;
                self.events.push_back(AssociationEvent::Closed);
            } else {
                self.control_queue.push_back(Chunk::Shutdown {
                    cumulative_tsn: self.cum_tsn,
                });
                self.rto.backoff();
                self.t3_deadline = Some(now + self.rto.current());
            }
            return;
        }

        self.rto.backoff();
        let max_attempts = self.tuning.max_retransmit_attempts;
        let mut failed = false;
        let mut abandon: Vec<usize> = Vec::new();
        for (idx, inflight) in self.in_flight.iter_mut().enumerate() {
            if inflight.settled() {
                continue;
            }
            match inflight.reliability.kind {
                ReliabilityKind::Reliable => {
                    if inflight.attempts > max_attempts {
                        failed = true;
                        break;
                    }
                    inflight.retransmit = true;
                }
                ReliabilityKind::MaxRetransmits(max) => {
                    // attempts counts transmissions; retransmissions are
                    // one fewer
                    if inflight.attempts > max as u32 {
                        abandon.push(idx);
                    } else {
                        inflight.retransmit = true;
                    }
                }
                ReliabilityKind::MaxLifetime(lifetime) => {
                    if now.duration_since(inflight.first_sent) >= lifetime {
                        abandon.push(idx);
                    } else {
                        inflight.retransmit = true;
                    }
                }
            }
        }
        if failed {
            self.fail(Error::ErrRetransmitsExhausted);
            return;
        }
        for idx in abandon {
            self.abandon_in_flight(idx);
        }
        if self.in_flight.iter().any(|c| c.abandoned) {
            self.forward_due = true;
        }
        self.t3_deadline = if !self.in_flight.is_empty() || !self.pending.is_empty() {
            Some(now + self.rto.current())
        } else {
            None
        };
    }

    /// Abandon partially-reliable pending chunks whose lifetime expired
    /// before first transmission.
    fn expire_lifetimes(&mut self, now: Instant) {
        let mut i = 0;
        while i < self.pending.len() {
            let expired = match self.pending[i].reliability.kind {
                ReliabilityKind::MaxLifetime(lifetime) => {
                    now.duration_since(self.pending[i].enqueued_at) >= lifetime
                }
                _ => false,
            };
            if expired {
                let pending = self.pending.remove(i).expect("index in range");
                self.account_abandoned(&pending.chunk);
                // Keep a placeholder so the forward point can cover the
                // never-transmitted TSN.
                self.in_flight.push_back(InflightChunk {
                    chunk: pending.chunk,
                    reliability: pending.reliability,
                    first_sent: now,
                    attempts: 0,
                    acked: false,
                    abandoned: true,
                    retransmit: false,
                    miss_count: 0,
                });
            } else {
                i += 1;
            }
        }
    }

    fn abandon_in_flight(&mut self, idx: usize) {
        let chunk = {
            let inflight = &mut self.in_flight[idx];
            inflight.abandoned = true;
            inflight.retransmit = false;
            self.flight_size = self
                .flight_size
                .saturating_sub(inflight.chunk.payload.len());
            inflight.chunk.clone()
        };
        self.account_abandoned(&chunk);
        debug!(
            "abandoned tsn {} on stream {} after policy budget",
            chunk.tsn, chunk.stream_id
        );
    }

    fn account_abandoned(&mut self, chunk: &DataChunk) {
        self.forward_due = true;
        if let Some(stream) = self.streams.get_mut(&chunk.stream_id) {
            if stream.on_dequeued(chunk.payload.len()) {
                self.events.push_back(AssociationEvent::BufferedAmountLow {
                    stream_id: chunk.stream_id,
                });
            }
        }
    }

    fn fail(&mut self, error: Error) {
        warn!("association failure: {error}");
        self.state = AssociationState::Closed;
        self.init_deadline = None;
        self.t3_deadline = None;
        self.ack_deadline = None;
        self.heartbeat_deadline = None;
        self.events.push_back(AssociationEvent::Error(error));
        self.events.push_back(AssociationEvent::Closed);
    }

    fn maybe_shutdown(&mut self, now: Instant) {
        if self.state == AssociationState::Closing
            && self.pending.is_empty()
            && self.in_flight.iter().all(|c| c.settled())
        {
            self.control_queue.push_back(Chunk::Shutdown {
                cumulative_tsn: self.cum_tsn,
            });
            self.state = AssociationState::ShutdownSent;
            self.shutdown_attempts = 0;
            self.t3_deadline = Some(now + self.rto.current());
        }
    }

    fn local_init_chunk(&self) -> InitChunk {
        InitChunk {
            initiate_tag: self.local_tag,
            a_rwnd: self.tuning.recv_buffer_size,
            max_streams: self.tuning.max_streams,
            initial_tsn: self.local_initial_tsn,
            max_message_size: self.tuning.max_message_size,
        }
    }

    fn build_ack(&self) -> Chunk {
        let mut offsets: Vec<u32> = self
            .received
            .keys()
            .map(|tsn| tsn.wrapping_sub(self.cum_tsn))
            .filter(|offset| *offset <= u16::MAX as u32)
            .collect();
        offsets.sort_unstable();
        let mut gaps: Vec<GapBlock> = Vec::new();
        for offset in offsets {
            let offset = offset as u16;
            match gaps.last_mut() {
                Some(last) if last.end.wrapping_add(1) == offset => last.end = offset,
                _ => gaps.push(GapBlock {
                    start: offset,
                    end: offset,
                }),
            }
        }
        Chunk::Ack(AckChunk {
            cumulative_tsn: self.cum_tsn,
            a_rwnd: self
                .tuning
                .recv_buffer_size
                .saturating_sub(self.received_bytes as u32),
            gaps,
        })
    }

    /// Assemble the next outbound packet, bundling control and data chunks
    /// within the path budget. Call until it returns `None`.
    pub fn poll_transmit(&mut self, now: Instant) -> Option<BytesMut> {
        if self.init_due {
            self.init_due = false;
            let init = Chunk::Init(self.local_init_chunk());
            return marshal_packet(0, &[init]).ok();
        }

        let budget = self.tuning.fragment_size + 128;
        let mut chunks: Vec<Chunk> = Vec::new();
        let mut size = 0usize;

        while let Some(chunk) = self.control_queue.front() {
            let chunk_size = chunk.marshal_size();
            if !chunks.is_empty() && size + chunk_size > budget {
                break;
            }
            size += chunk_size;
            chunks.push(self.control_queue.pop_front().expect("front exists"));
        }

        if self.ack_due {
            let ack = self.build_ack();
            let ack_size = ack.marshal_size();
            if chunks.is_empty() || size + ack_size <= budget {
                self.ack_due = false;
                self.ack_deadline = None;
                size += ack_size;
                chunks.push(ack);
            }
        }

        // Retransmissions take priority over new data and ignore the
        // receive window.
        for inflight in self.in_flight.iter_mut() {
            if !inflight.retransmit {
                continue;
            }
            let chunk_size = data_wire_size(&inflight.chunk);
            if !chunks.is_empty() && size + chunk_size > budget {
                break;
            }
            inflight.retransmit = false;
            inflight.attempts += 1;
            inflight.miss_count = 0;
            size += chunk_size;
            chunks.push(Chunk::Data(inflight.chunk.clone()));
        }

        // New data within the peer's receive window
        while let Some(pending) = self.pending.front() {
            let payload_len = pending.chunk.payload.len();
            let window = (self.peer_rwnd as usize).saturating_sub(self.flight_size);
            let zero_window_probe = self.peer_rwnd as usize <= self.flight_size
                && self.in_flight.iter().all(|c| c.settled());
            if payload_len > window && !zero_window_probe {
                break;
            }
            let chunk_size = data_wire_size(&pending.chunk);
            if !chunks.is_empty() && size + chunk_size > budget {
                break;
            }
            let pending = self.pending.pop_front().expect("front exists");
            self.flight_size += payload_len;
            size += chunk_size;
            chunks.push(Chunk::Data(pending.chunk.clone()));
            self.in_flight.push_back(InflightChunk {
                chunk: pending.chunk,
                reliability: pending.reliability,
                first_sent: now,
                attempts: 1,
                acked: false,
                abandoned: false,
                retransmit: false,
                miss_count: 0,
            });
            if zero_window_probe {
                break;
            }
        }

        if self.forward_due {
            if let Some(forward) = self.build_forward() {
                let forward_size = forward.marshal_size();
                if chunks.is_empty() || size + forward_size <= budget {
                    self.forward_due = false;
                    chunks.push(forward);
                }
            } else if !self.in_flight.iter().any(|c| c.abandoned) {
                self.forward_due = false;
            }
        }

        if chunks.is_empty() {
            return None;
        }
        if chunks.iter().any(|c| matches!(c, Chunk::Data(_))) && self.t3_deadline.is_none() {
            self.t3_deadline = Some(now + self.rto.current());
        }
        marshal_packet(self.peer_tag, &chunks).ok()
    }

    fn build_forward(&mut self) -> Option<Chunk> {
        // Advance over the leading run of settled chunks to find the new
        // cumulative point the peer may skip to.
        let mut advanced = self.last_cum_acked;
        let mut streams: Vec<(u16, u16)> = Vec::new();
        let mut any_abandoned = false;
        for inflight in &self.in_flight {
            if inflight.chunk.tsn != advanced.wrapping_add(1) {
                break;
            }
            if inflight.abandoned {
                any_abandoned = true;
                if !inflight.chunk.unordered {
                    match streams
                        .iter_mut()
                        .find(|(id, _)| *id == inflight.chunk.stream_id)
                    {
                        Some(entry) => entry.1 = inflight.chunk.stream_seq,
                        None => {
                            streams.push((inflight.chunk.stream_id, inflight.chunk.stream_seq))
                        }
                    }
                }
            } else if !inflight.acked {
                break;
            }
            advanced = advanced.wrapping_add(1);
        }
        if !any_abandoned || advanced == self.last_cum_acked {
            return None;
        }
        Some(Chunk::Forward(ForwardChunk {
            new_cumulative_tsn: advanced,
            streams,
        }))
    }

    /// Earliest deadline requiring a [handle_timeout](Self::handle_timeout)
    /// call.
    pub fn poll_timeout(&self) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        for candidate in [
            self.init_deadline,
            self.t3_deadline,
            self.ack_deadline,
            self.heartbeat_deadline,
        ]
        .into_iter()
        .flatten()
        {
            deadline = Some(match deadline {
                Some(current) => current.min(candidate),
                None => candidate,
            });
        }
        deadline
    }
}

fn data_wire_size(data: &DataChunk) -> usize {
    let len = CHUNK_HEADER_LEN + 12 + data.payload.len();
    len + padding_size(len)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Pair {
        a: Association,
        b: Association,
        now: Instant,
    }

    impl Pair {
        fn new() -> Self {
            let now = Instant::now();
            let mut pair = Pair {
                a: Association::new(MuxRole::Client, TransportTuning::default(), now),
                b: Association::new(MuxRole::Server, TransportTuning::default(), now),
                now,
            };
            pair.pump();
            pair
        }

        /// Shuttle packets both ways until the wire is quiet.
        fn pump(&mut self) {
            loop {
                let mut any = false;
                while let Some(packet) = self.a.poll_transmit(self.now) {
                    self.b.handle_read(self.now, packet).unwrap();
                    any = true;
                }
                while let Some(packet) = self.b.poll_transmit(self.now) {
                    self.a.handle_read(self.now, packet).unwrap();
                    any = true;
                }
                if !any {
                    break;
                }
            }
        }

        fn advance(&mut self, delta: Duration) {
            self.now += delta;
            self.a.handle_timeout(self.now).unwrap();
            self.b.handle_timeout(self.now).unwrap();
        }

        /// Advance past the delayed-ack window and settle the wire.
        fn settle(&mut self) {
            self.advance(Duration::from_millis(250));
            self.pump();
        }
    }

    fn events(assoc: &mut Association) -> Vec<AssociationEvent> {
        let mut out = Vec::new();
        while let Some(event) = assoc.poll_event() {
            out.push(event);
        }
        out
    }

    fn data_events(assoc: &mut Association) -> Vec<(u16, BytesMut)> {
        events(assoc)
            .into_iter()
            .filter_map(|event| match event {
                AssociationEvent::Data {
                    stream_id, payload, ..
                } => Some((stream_id, payload)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_establishment() {
        let mut pair = Pair::new();
        assert!(pair.a.is_established());
        assert!(pair.b.is_established());
        assert!(events(&mut pair.a)
            .iter()
            .any(|e| matches!(e, AssociationEvent::Established { .. })));
        assert!(events(&mut pair.b)
            .iter()
            .any(|e| matches!(e, AssociationEvent::Established { .. })));
        assert_eq!(pair.a.remote_max_message_size(), 65536);
    }

    #[test]
    fn test_write_before_established() {
        let now = Instant::now();
        let mut a = Association::new(MuxRole::Client, TransportTuning::default(), now);
        a.open_stream(0, Reliability::reliable_ordered()).unwrap();
        assert_eq!(
            a.write(now, 0, PayloadKind::Binary, BytesMut::from(&b"x"[..])),
            Err(Error::ErrAssociationNotEstablished)
        );
    }

    #[test]
    fn test_ordered_round_trip() {
        let mut pair = Pair::new();
        events(&mut pair.a);
        events(&mut pair.b);
        pair.a.open_stream(1, Reliability::reliable_ordered()).unwrap();
        pair.a
            .write(pair.now, 1, PayloadKind::Text, BytesMut::from(&b"hi"[..]))
            .unwrap();
        pair.pump();
        let received = data_events(&mut pair.b);
        assert_eq!(received, vec![(1, BytesMut::from(&b"hi"[..]))]);
    }

    #[test]
    fn test_fragmented_message_reassembled() {
        let mut pair = Pair::new();
        events(&mut pair.b);
        pair.a.open_stream(0, Reliability::reliable_ordered()).unwrap();
        let big: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        pair.a
            .write(pair.now, 0, PayloadKind::Binary, BytesMut::from(&big[..]))
            .unwrap();
        pair.pump();
        let received = data_events(&mut pair.b);
        assert_eq!(received.len(), 1);
        assert_eq!(&received[0].1[..], &big[..]);
    }

    #[test]
    fn test_ordered_delivery_survives_loss() {
        let mut pair = Pair::new();
        events(&mut pair.b);
        pair.a.open_stream(0, Reliability::reliable_ordered()).unwrap();
        pair.a
            .write(pair.now, 0, PayloadKind::Binary, BytesMut::from(&b"first"[..]))
            .unwrap();
        // First transmission is lost
        let lost = pair.a.poll_transmit(pair.now);
        assert!(lost.is_some());
        pair.a
            .write(pair.now, 0, PayloadKind::Binary, BytesMut::from(&b"second"[..]))
            .unwrap();
        pair.pump();
        // Nothing deliverable yet on an ordered stream
        assert!(data_events(&mut pair.b).is_empty());
        // Retransmission timer recovers the hole
        pair.advance(Duration::from_secs(2));
        pair.pump();
        let received = data_events(&mut pair.b);
        assert_eq!(
            received,
            vec![
                (0, BytesMut::from(&b"first"[..])),
                (0, BytesMut::from(&b"second"[..]))
            ]
        );
    }

    #[test]
    fn test_unordered_delivered_in_arrival_order() {
        let mut pair = Pair::new();
        events(&mut pair.b);
        let unordered = Reliability {
            ordered: false,
            kind: ReliabilityKind::Reliable,
        };
        pair.a.open_stream(0, unordered).unwrap();
        pair.a
            .write(pair.now, 0, PayloadKind::Binary, BytesMut::from(&b"first"[..]))
            .unwrap();
        let _lost = pair.a.poll_transmit(pair.now);
        pair.a
            .write(pair.now, 0, PayloadKind::Binary, BytesMut::from(&b"second"[..]))
            .unwrap();
        pair.pump();
        // The second message does not wait for the first
        assert_eq!(
            data_events(&mut pair.b),
            vec![(0, BytesMut::from(&b"second"[..]))]
        );
        pair.advance(Duration::from_secs(2));
        pair.pump();
        assert_eq!(
            data_events(&mut pair.b),
            vec![(0, BytesMut::from(&b"first"[..]))]
        );
    }

    #[test]
    fn test_max_retransmits_zero_abandons_silently() {
        let mut pair = Pair::new();
        events(&mut pair.a);
        events(&mut pair.b);
        let lossy = Reliability {
            ordered: false,
            kind: ReliabilityKind::MaxRetransmits(0),
        };
        pair.a.open_stream(0, lossy).unwrap();
        pair.a
            .write(pair.now, 0, PayloadKind::Binary, BytesMut::from(&b"lost"[..]))
            .unwrap();
        // The only transmission attempt is lost
        let lost = pair.a.poll_transmit(pair.now);
        assert!(lost.is_some());
        pair.advance(Duration::from_secs(2));
        pair.pump();
        pair.settle();
        // No delivery, no error; sender buffer drained
        assert!(data_events(&mut pair.b).is_empty());
        assert!(!events(&mut pair.a)
            .iter()
            .any(|e| matches!(e, AssociationEvent::Error(_))));
        assert_eq!(pair.a.buffered_amount(0), 0);
        // The stream is still usable afterwards
        pair.a
            .write(pair.now, 0, PayloadKind::Binary, BytesMut::from(&b"after"[..]))
            .unwrap();
        pair.pump();
        assert_eq!(
            data_events(&mut pair.b),
            vec![(0, BytesMut::from(&b"after"[..]))]
        );
    }

    #[test]
    fn test_buffered_amount_low_after_drain() {
        let mut pair = Pair::new();
        events(&mut pair.a);
        pair.a.open_stream(0, Reliability::reliable_ordered()).unwrap();
        pair.a.set_buffered_amount_low_threshold(0, 4);
        pair.a
            .write(
                pair.now,
                0,
                PayloadKind::Binary,
                BytesMut::from(&b"0123456789"[..]),
            )
            .unwrap();
        assert_eq!(pair.a.buffered_amount(0), 10);
        pair.pump();
        pair.settle();
        assert_eq!(pair.a.buffered_amount(0), 0);
        let fired = events(&mut pair.a)
            .iter()
            .filter(|e| matches!(e, AssociationEvent::BufferedAmountLow { stream_id: 0 }))
            .count();
        assert_eq!(fired, 1);
    }

    #[test]
    fn test_stream_reset_signals_peer() {
        let mut pair = Pair::new();
        events(&mut pair.b);
        pair.a.open_stream(3, Reliability::reliable_ordered()).unwrap();
        pair.a.reset_stream(3).unwrap();
        pair.pump();
        assert!(events(&mut pair.b)
            .iter()
            .any(|e| matches!(e, AssociationEvent::StreamReset { stream_id: 3 })));
    }

    #[test]
    fn test_graceful_shutdown() {
        let mut pair = Pair::new();
        events(&mut pair.a);
        events(&mut pair.b);
        pair.a.close(pair.now);
        pair.pump();
        assert_eq!(pair.a.state(), AssociationState::Closed);
        assert_eq!(pair.b.state(), AssociationState::Closed);
        assert!(events(&mut pair.a)
            .iter()
            .any(|e| matches!(e, AssociationEvent::Closed)));
        assert!(events(&mut pair.b)
            .iter()
            .any(|e| matches!(e, AssociationEvent::Closed)));
    }

    #[test]
    fn test_init_retransmits_exhaust_to_failure() {
        let now = Instant::now();
        let tuning = TransportTuning {
            max_retransmit_attempts: 2,
            ..Default::default()
        };
        let mut a = Association::new(MuxRole::Client, tuning, now);
        // Drain and drop every init
        let mut now = now;
        for _ in 0..16 {
            while a.poll_transmit(now).is_some() {}
            now += Duration::from_secs(11);
            a.handle_timeout(now).unwrap();
        }
        let events = events(&mut a);
        assert!(events
            .iter()
            .any(|e| matches!(e, AssociationEvent::Error(Error::ErrRetransmitsExhausted))));
        assert_eq!(a.state(), AssociationState::Closed);
    }
}
