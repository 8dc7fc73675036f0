use std::time::Duration;

/// Congestion-control variant selector.
///
/// The engine applies window-based flow control; the variant is an
/// embedder-visible tuning knob reserved for congestion-control modules
/// layered on top and is carried through unchanged.
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq)]
pub enum CongestionVariant {
    #[default]
    Classic,
    HighSpeed,
    HamiltonTcp,
    RateControlled,
}

/// Association tuning, snapshotted at association creation.
///
/// Zero/None-like sentinel handling happens in the settings layer; every
/// field here is a concrete effective value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportTuning {
    /// Local receive window advertised to the peer, in bytes
    pub recv_buffer_size: u32,
    /// Hard ceiling on bytes buffered for sending per stream
    pub send_buffer_size: u32,
    /// Upper bound on queued chunks (pending plus early ordered arrivals)
    pub max_queued_chunks: usize,
    /// Congestion-control variant selector
    pub congestion_variant: CongestionVariant,
    /// Delay before acknowledging received data
    pub ack_delay: Duration,
    /// Lower bound for the retransmission timeout
    pub rto_min: Duration,
    /// Initial retransmission timeout before any RTT sample
    pub rto_initial: Duration,
    /// Upper bound for the retransmission timeout
    pub rto_max: Duration,
    /// Retransmission attempts after which a reliable chunk fails the
    /// association
    pub max_retransmit_attempts: u32,
    /// Interval between heartbeats on an idle association
    pub heartbeat_interval: Duration,
    /// Maximum application message size accepted locally
    pub max_message_size: u32,
    /// Number of streams supported by this endpoint
    pub max_streams: u16,
    /// Payload budget for one data chunk, derived from the path MTU
    pub fragment_size: usize,
}

impl Default for TransportTuning {
    fn default() -> Self {
        Self {
            recv_buffer_size: 1024 * 1024,
            send_buffer_size: 16 * 1024 * 1024,
            max_queued_chunks: 10_000,
            congestion_variant: CongestionVariant::default(),
            ack_delay: Duration::from_millis(200),
            rto_min: Duration::from_millis(200),
            rto_initial: Duration::from_secs(1),
            rto_max: Duration::from_secs(10),
            max_retransmit_attempts: 10,
            heartbeat_interval: Duration::from_secs(10),
            max_message_size: 65536,
            max_streams: 1024,
            fragment_size: 1200,
        }
    }
}
