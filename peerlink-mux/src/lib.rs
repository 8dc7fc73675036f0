#![warn(rust_2018_idioms)]

//! Reliable-message multiplexing transport.
//!
//! One [Association] carries many logical streams over a secured byte
//! channel. Each stream has its own ordering and reliability policy;
//! the association provides fragmentation, selective acknowledgment,
//! retransmission, partial-reliability abandonment and flow control.
//!
//! The implementation is sans-I/O: feed inbound packets with
//! [Association::handle_read], drain outbound packets with
//! [Association::poll_transmit], and drive timers through
//! [Association::handle_timeout] / [Association::poll_timeout].

pub mod association;
pub mod chunk;
pub mod config;
pub mod reliability;
pub(crate) mod stream;

pub use association::{Association, AssociationEvent, AssociationState, MuxRole};
pub use chunk::PayloadKind;
pub use config::{CongestionVariant, TransportTuning};
pub use reliability::{Reliability, ReliabilityKind};
