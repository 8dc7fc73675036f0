#![warn(rust_2018_idioms)]

//! # peerlink — sans-I/O peer-to-peer real-time transport
//!
//! A standalone, browser-independent transport engine: it negotiates a
//! connection, secures it, and carries both arbitrary application
//! messages (ordered/unordered, reliable/unreliable) and real-time media
//! with loss-resilient feedback, multiplexed over a single UDP flow.
//!
//! The core is **sans-I/O**: protocol logic never touches sockets,
//! threads or clocks. You feed inbound datagrams, drain outbound
//! datagrams and dispatch timer deadlines — which gives runtime
//! independence, full scheduling control and protocol tests without a
//! network.
//!
//! ## Event loop
//!
//! ```no_run
//! use bytes::BytesMut;
//! use peerlink::configuration::ConfigBuilder;
//! use peerlink::connection::Connection;
//! use peerlink::connection::event::Event;
//! use peerlink::shared::{TaggedBytesMut, TransportContext, TransportProtocol};
//! use std::time::{Duration, Instant};
//! use tokio::net::UdpSocket;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigBuilder::new().build();
//! let mut connection = Connection::new(config)?;
//!
//! let socket = UdpSocket::bind("0.0.0.0:0").await?;
//! let local_addr = socket.local_addr()?;
//! let mut buf = vec![0u8; 2000];
//!
//! loop {
//!     // 1. Outgoing datagrams
//!     while let Some(msg) = connection.poll_write() {
//!         socket.send_to(&msg.message, msg.transport.peer_addr).await?;
//!     }
//!
//!     // 2. Notifications
//!     while let Some(event) = connection.poll_event() {
//!         if let Event::StateChange(state) = event {
//!             println!("state: {state}");
//!         }
//!     }
//!
//!     // 3. Next timer deadline
//!     let timeout = connection
//!         .poll_timeout()
//!         .unwrap_or(Instant::now() + Duration::from_secs(86400));
//!     let delay = timeout.saturating_duration_since(Instant::now());
//!
//!     let timer = tokio::time::sleep(delay);
//!     tokio::pin!(timer);
//!
//!     tokio::select! {
//!         _ = timer => {
//!             connection.handle_timeout(Instant::now())?;
//!         }
//!         Ok((n, peer_addr)) = socket.recv_from(&mut buf) => {
//!             connection.handle_read(TaggedBytesMut {
//!                 now: Instant::now(),
//!                 transport: TransportContext {
//!                     local_addr,
//!                     peer_addr,
//!                     protocol: TransportProtocol::UDP,
//!                 },
//!                 message: BytesMut::from(&buf[..n]),
//!             })?;
//!         }
//!     }
//! }
//! # }
//! ```
//!
//! ## Concurrency model
//!
//! One connection is one logical actor: every mutation flows through
//! `&mut Connection`, so network reads, timer firings and application
//! commands are serialized by construction. The optional `runtime`
//! feature provides a ready-made actor [driver] on a shared worker pool;
//! connections run independently in parallel, and a callback that blocks
//! stalls only its own connection.

pub mod channel;
pub mod configuration;
pub mod connection;
pub mod description;
#[cfg(feature = "runtime")]
pub mod driver;
pub(crate) mod handler;
pub mod settings;
pub mod track;
pub mod transport;

pub use {media, mux, shared};

pub use channel::{Channel, ChannelId, ChannelInit};
pub use configuration::{Config, ConfigBuilder};
pub use connection::event::Event;
pub use connection::Connection;
pub use description::{CandidateInit, DescriptionKind, SessionDescription};
pub use mux::{Reliability, ReliabilityKind};
pub use track::{Track, TrackId, TrackInit};
