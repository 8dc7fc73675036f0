#![warn(rust_2018_idioms)]

//! Media packetization and the loss-resilient reporting pipeline.
//!
//! [packetizer::Packetizer] fragments codec samples into media packets;
//! [report::ReportingSession] emits periodic sender reports, serves
//! retransmission requests from a bounded cache and surfaces key-frame and
//! bitrate feedback from the peer.

pub mod packet;
pub mod packetizer;
pub mod report;
pub mod rtcp;

pub use packet::{Header, Packet};
pub use packetizer::{NalSeparator, ObuPacketization, Packetizer, PacketizerInit, PayloadFormat};
pub use report::{ReportEvent, ReportingSession, ReportingSessionConfig};
