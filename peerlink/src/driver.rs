//! Actor driver on a shared worker pool (feature `runtime`).
//!
//! Each connection becomes one task owning its `Connection`, its UDP
//! socket and a command mailbox: network reads, timer firings and
//! application commands are serialized onto that task, so no two events
//! of one connection ever run concurrently. Observer callbacks execute
//! on the actor task — a callback that blocks stalls only its own
//! connection's timers and I/O, never other connections; keep callbacks
//! short or hand work to your own executor.
//!
//! The pool is built once, sized by
//! [settings::set_thread_pool_size](crate::settings::set_thread_pool_size)
//! at first use; changing the setting afterwards affects nothing already
//! running.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use log::{debug, warn};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};

use shared::error::{Error, Result};
use shared::{TaggedBytesMut, TransportContext, TransportProtocol};

use crate::channel::{ChannelId, ChannelInit};
use crate::connection::event::{ChannelEvent, Event, TrackEvent};
use crate::connection::state::ConnectionState;
use crate::connection::Connection;
use crate::description::{CandidateInit, SessionDescription};
use crate::settings;

/// Callbacks delivered on the connection's actor task.
#[allow(unused_variables)]
pub trait ConnectionObserver: Send + 'static {
    /// Every event, before the specialized hooks below.
    fn on_event(&mut self, event: &Event) {}

    fn on_state_change(&mut self, state: ConnectionState) {}

    fn on_local_description(&mut self, description: &SessionDescription) {}

    fn on_local_candidate(&mut self, candidate: &CandidateInit) {}

    fn on_channel_open(&mut self, id: ChannelId) {}

    fn on_channel_closed(&mut self, id: ChannelId) {}

    fn on_channel_error(&mut self, id: ChannelId, reason: &str) {}

    fn on_channel_message(&mut self, id: ChannelId, binary: bool, data: &[u8]) {}

    fn on_buffered_amount_low(&mut self, id: ChannelId) {}

    fn on_key_frame_requested(&mut self, id: crate::track::TrackId) {}

    fn on_bitrate_requested(&mut self, id: crate::track::TrackId, bitrate: u64) {}
}

enum Command {
    SetLocalDescription(SessionDescription, oneshot::Sender<Result<()>>),
    SetRemoteDescription(SessionDescription, oneshot::Sender<Result<()>>),
    AddRemoteCandidate(CandidateInit, oneshot::Sender<Result<()>>),
    CreateChannel(String, Option<ChannelInit>, oneshot::Sender<Result<ChannelId>>),
    Send(ChannelId, bool, BytesMut, oneshot::Sender<Result<()>>),
    State(oneshot::Sender<ConnectionState>),
    Close(oneshot::Sender<Result<()>>),
    Delete(oneshot::Sender<Result<()>>),
}

/// Mailbox handle to a connection actor. Cloneable; commands are applied
/// in submission order.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
}

macro_rules! request {
    ($self:expr, $variant:ident $(, $arg:expr)*) => {{
        let (tx, rx) = oneshot::channel();
        $self
            .commands
            .send(Command::$variant($($arg,)* tx))
            .map_err(|_| Error::ErrConnectionClosed)?;
        rx.await.map_err(|_| Error::ErrConnectionClosed)?
    }};
}

impl ConnectionHandle {
    pub async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        request!(self, SetLocalDescription, description)
    }

    pub async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        request!(self, SetRemoteDescription, description)
    }

    pub async fn add_remote_candidate(&self, candidate: CandidateInit) -> Result<()> {
        request!(self, AddRemoteCandidate, candidate)
    }

    pub async fn create_channel(
        &self,
        label: impl Into<String>,
        init: Option<ChannelInit>,
    ) -> Result<ChannelId> {
        request!(self, CreateChannel, label.into(), init)
    }

    /// Sends are asynchronous: this enqueues on the actor and returns;
    /// transmission and backpressure accounting happen on the actor task.
    pub async fn send(&self, id: ChannelId, data: &[u8]) -> Result<()> {
        request!(self, Send, id, true, BytesMut::from(data))
    }

    pub async fn send_text(&self, id: ChannelId, text: impl Into<String>) -> Result<()> {
        request!(self, Send, id, false, BytesMut::from(text.into().as_str()))
    }

    pub async fn state(&self) -> Result<ConnectionState> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(Command::State(tx))
            .map_err(|_| Error::ErrConnectionClosed)?;
        rx.await.map_err(|_| Error::ErrConnectionClosed)
    }

    pub async fn close(&self) -> Result<()> {
        request!(self, Close)
    }

    /// Tear the actor down. Fails unless the connection was closed (or
    /// failed) first.
    pub async fn delete(&self) -> Result<()> {
        request!(self, Delete)
    }
}

fn runtime() -> &'static tokio::runtime::Runtime {
    static RUNTIME: OnceLock<tokio::runtime::Runtime> = OnceLock::new();
    RUNTIME.get_or_init(|| {
        let size = settings::thread_pool_size();
        let mut builder = tokio::runtime::Builder::new_multi_thread();
        if size > 0 {
            builder.worker_threads(size);
        }
        builder
            .enable_all()
            .build()
            .expect("driver runtime construction")
    })
}

/// Spawn a connection actor on the shared pool.
pub fn spawn(
    connection: Connection,
    observer: Box<dyn ConnectionObserver>,
) -> ConnectionHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    runtime().spawn(actor(connection, observer, rx));
    ConnectionHandle { commands: tx }
}

async fn actor(
    mut connection: Connection,
    mut observer: Box<dyn ConnectionObserver>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let bind_addr = connection
        .config()
        .bind_address
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "0.0.0.0:0".to_string());
    let socket = match UdpSocket::bind(&bind_addr).await {
        Ok(socket) => socket,
        Err(err) => {
            warn!("driver failed to bind {bind_addr}: {err}");
            return;
        }
    };
    let local_addr = match socket.local_addr() {
        Ok(addr) => addr,
        Err(err) => {
            warn!("driver local_addr: {err}");
            return;
        }
    };
    debug!("connection actor bound to {local_addr}");

    let mut buf = vec![0u8; 2048];
    let mut deleted = false;

    while !deleted {
        // Flush outbound datagrams
        while let Some(msg) = connection.poll_write() {
            if let Err(err) = socket.send_to(&msg.message, msg.transport.peer_addr).await {
                warn!("send_to {}: {err}", msg.transport.peer_addr);
            }
        }

        // Dispatch notifications on this task
        while let Some(event) = connection.poll_event() {
            dispatch(&mut connection, observer.as_mut(), &event);
        }

        let deadline = connection
            .poll_timeout()
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(86400));
        let delay = deadline.saturating_duration_since(Instant::now());
        let timer = tokio::time::sleep(delay);
        tokio::pin!(timer);

        tokio::select! {
            biased;

            command = commands.recv() => {
                match command {
                    Some(command) => {
                        deleted = apply(&mut connection, command);
                    }
                    None => {
                        // Every handle dropped: shut down cleanly
                        let _ = connection.close();
                        deleted = true;
                    }
                }
            }
            _ = timer => {
                if let Err(err) = connection.handle_timeout(Instant::now()) {
                    warn!("handle_timeout: {err}");
                }
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((n, peer_addr)) => {
                        let msg = TaggedBytesMut {
                            now: Instant::now(),
                            transport: TransportContext {
                                local_addr,
                                peer_addr,
                                protocol: TransportProtocol::UDP,
                            },
                            message: BytesMut::from(&buf[..n]),
                        };
                        if let Err(err) = connection.handle_read(msg) {
                            warn!("handle_read: {err}");
                        }
                    }
                    Err(err) => warn!("recv_from: {err}"),
                }
            }
        }
    }

    // Final drain so close/reset signals reach the wire
    while let Some(msg) = connection.poll_write() {
        let _ = socket.send_to(&msg.message, msg.transport.peer_addr).await;
    }
    while let Some(event) = connection.poll_event() {
        dispatch(&mut connection, observer.as_mut(), &event);
    }
}

/// Returns true when the actor should stop.
fn apply(connection: &mut Connection, command: Command) -> bool {
    match command {
        Command::SetLocalDescription(description, reply) => {
            let _ = reply.send(connection.set_local_description(description));
        }
        Command::SetRemoteDescription(description, reply) => {
            let _ = reply.send(connection.set_remote_description(description));
        }
        Command::AddRemoteCandidate(candidate, reply) => {
            let _ = reply.send(connection.add_remote_candidate(&candidate));
        }
        Command::CreateChannel(label, init, reply) => {
            let _ = reply.send(connection.create_channel(&label, init).map(|c| c.id()));
        }
        Command::Send(id, binary, data, reply) => {
            let _ = reply.send(connection.channel_send(id, binary, data));
        }
        Command::State(reply) => {
            let _ = reply.send(connection.state());
        }
        Command::Close(reply) => {
            let _ = reply.send(connection.close());
        }
        Command::Delete(reply) => {
            let deletable = matches!(
                connection.state(),
                ConnectionState::Closed | ConnectionState::Failed
            );
            if deletable {
                let _ = reply.send(Ok(()));
                return true;
            }
            let _ = reply.send(Err(Error::ErrConnectionNotClosed));
        }
    }
    false
}

fn dispatch(connection: &mut Connection, observer: &mut dyn ConnectionObserver, event: &Event) {
    observer.on_event(event);
    match event {
        Event::StateChange(state) => observer.on_state_change(*state),
        Event::LocalDescription(description) => observer.on_local_description(description),
        Event::LocalCandidate(candidate) => observer.on_local_candidate(candidate),
        Event::Channel(ChannelEvent::Open(id)) => observer.on_channel_open(*id),
        Event::Channel(ChannelEvent::Closed(id)) => observer.on_channel_closed(*id),
        Event::Channel(ChannelEvent::Error(id, reason)) => {
            observer.on_channel_error(*id, reason)
        }
        Event::Channel(ChannelEvent::BufferedAmountLow(id)) => {
            observer.on_buffered_amount_low(*id)
        }
        Event::Channel(ChannelEvent::Available { id, available }) => {
            // Pull queued messages and hand them to the observer
            let mut data = vec![0u8; *available];
            let id = *id;
            loop {
                let result = match connection.channel(id) {
                    Some(mut channel) => channel.receive(&mut data),
                    None => break,
                };
                match result {
                    Ok(Some((len, binary))) => {
                        observer.on_channel_message(id, binary, &data[..len]);
                    }
                    Ok(None) => break,
                    Err(Error::ErrBufferTooSmall { required, .. }) => {
                        data.resize(required, 0);
                    }
                    Err(err) => {
                        warn!("receive on channel {id}: {err}");
                        break;
                    }
                }
            }
        }
        Event::Track(TrackEvent::KeyFrameRequested(id)) => observer.on_key_frame_requested(*id),
        Event::Track(TrackEvent::BitrateRequested(id, bitrate)) => {
            observer.on_bitrate_requested(*id, *bitrate)
        }
        _ => {}
    }
}
