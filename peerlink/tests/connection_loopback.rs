//! Two in-memory connections wired back-to-back through the bundled
//! direct agent and plain handshake engine.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use bytes::BytesMut;

use peerlink::configuration::ConfigBuilder;
use peerlink::connection::event::{ChannelEvent, Event, TrackEvent};
use peerlink::connection::state::{ChannelState, ConnectionState};
use peerlink::connection::Connection;
use peerlink::description::CandidateInit;
use peerlink::shared::{TaggedBytesMut, TransportContext, TransportProtocol};
use peerlink::track::{Codec, Direction, TrackInit, TrackPacketizerInit};
use peerlink::{ChannelId, ChannelInit, Reliability, ReliabilityKind};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

struct Pair {
    a: Connection,
    b: Connection,
    a_addr: SocketAddr,
    b_addr: SocketAddr,
    now: Instant,
}

impl Pair {
    fn new() -> Self {
        let a_addr: SocketAddr = "127.0.0.1:41000".parse().unwrap();
        let b_addr: SocketAddr = "127.0.0.1:42000".parse().unwrap();
        let a = Connection::new(ConfigBuilder::new().with_bind_address(a_addr).build()).unwrap();
        let b = Connection::new(ConfigBuilder::new().with_bind_address(b_addr).build()).unwrap();
        Pair {
            a,
            b,
            a_addr,
            b_addr,
            now: Instant::now(),
        }
    }

    fn drain_candidates(connection: &mut Connection) -> Vec<CandidateInit> {
        let mut candidates = Vec::new();
        let mut leftover = Vec::new();
        while let Some(event) = connection.poll_event() {
            match event {
                Event::LocalCandidate(candidate) => candidates.push(candidate),
                other => leftover.push(other),
            }
        }
        // Events other than candidates are observed by the tests through
        // fresh polling after negotiation
        drop(leftover);
        candidates
    }

    /// Run the full offer/answer exchange with candidate trickling.
    fn negotiate(&mut self) {
        let offer = self.a.create_offer().unwrap();
        self.a.set_local_description(offer.clone()).unwrap();
        let a_candidates = Self::drain_candidates(&mut self.a);

        self.b.set_remote_description(offer).unwrap();
        for candidate in &a_candidates {
            self.b.add_remote_candidate(candidate).unwrap();
        }
        let answer = self.b.create_answer().unwrap();
        self.b.set_local_description(answer.clone()).unwrap();
        let b_candidates = Self::drain_candidates(&mut self.b);

        self.a.set_remote_description(answer).unwrap();
        for candidate in &b_candidates {
            self.a.add_remote_candidate(candidate).unwrap();
        }
    }

    /// Shuttle datagrams both ways until the wire is quiet.
    fn pump(&mut self) {
        for _ in 0..64 {
            let mut any = false;
            while let Some(msg) = self.a.poll_write() {
                any = true;
                self.b
                    .handle_read(TaggedBytesMut {
                        now: self.now,
                        transport: TransportContext {
                            local_addr: self.b_addr,
                            peer_addr: self.a_addr,
                            protocol: TransportProtocol::UDP,
                        },
                        message: msg.message,
                    })
                    .unwrap();
            }
            while let Some(msg) = self.b.poll_write() {
                any = true;
                self.a
                    .handle_read(TaggedBytesMut {
                        now: self.now,
                        transport: TransportContext {
                            local_addr: self.a_addr,
                            peer_addr: self.b_addr,
                            protocol: TransportProtocol::UDP,
                        },
                        message: msg.message,
                    })
                    .unwrap();
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

    /// Let delayed acknowledgments fire and settle the wire.
    fn settle(&mut self) {
        self.advance(Duration::from_millis(250));
        self.pump();
    }

    fn connect(&mut self) {
        self.negotiate();
        self.pump();
        self.settle();
    }

    fn drop_outbound(&mut self, connection: fn(&mut Pair) -> &mut Connection) {
        while connection(self).poll_write().is_some() {}
    }
}

fn events(connection: &mut Connection) -> Vec<Event> {
    let mut out = Vec::new();
    while let Some(event) = connection.poll_event() {
        out.push(event);
    }
    out
}

fn opened_channel(events: &[Event]) -> Option<ChannelId> {
    events.iter().find_map(|event| match event {
        Event::Channel(ChannelEvent::Open(id)) => Some(*id),
        _ => None,
    })
}

#[test]
fn test_connect_channel_and_round_trip() {
    init_logging();
    let mut pair = Pair::new();

    // Channel created before negotiation is queued, not failed
    let chat = pair.a.create_channel("chat", None).unwrap().id();
    assert_eq!(
        pair.a.channel(chat).unwrap().state().unwrap(),
        ChannelState::Connecting
    );

    pair.connect();

    assert_eq!(pair.a.state(), ConnectionState::Connected);
    assert_eq!(pair.b.state(), ConnectionState::Connected);

    let a_events = events(&mut pair.a);
    assert_eq!(opened_channel(&a_events), Some(chat));
    assert!(pair.a.channel(chat).unwrap().is_open());

    let b_events = events(&mut pair.b);
    let b_chat = opened_channel(&b_events).expect("remote channel open");
    assert_eq!(
        pair.b.channel(b_chat).unwrap().label().unwrap(),
        "chat".to_string()
    );

    // "hi" round trip
    pair.a.channel(chat).unwrap().send_text("hi").unwrap();
    pair.pump();
    pair.settle();

    let mut buf = [0u8; 16];
    let received = pair
        .b
        .channel(b_chat)
        .unwrap()
        .receive(&mut buf)
        .unwrap()
        .expect("message queued");
    assert_eq!(&buf[..received.0], b"hi");
    assert!(!received.1, "text message flagged as binary");
}

#[test]
fn test_close_before_connect() {
    init_logging();
    let mut pair = Pair::new();
    let chat = pair.a.create_channel("chat", None).unwrap().id();

    // Never receives a remote description
    let offer = pair.a.create_offer().unwrap();
    pair.a.set_local_description(offer).unwrap();
    pair.a.close().unwrap();

    let observed = events(&mut pair.a);
    assert!(!observed
        .iter()
        .any(|e| *e == Event::StateChange(ConnectionState::Connected)));
    assert!(observed
        .iter()
        .any(|e| *e == Event::StateChange(ConnectionState::Closed)));
    assert!(observed
        .iter()
        .any(|e| *e == Event::Channel(ChannelEvent::Closed(chat))));
    assert!(pair.a.channel(chat).unwrap().is_closed());
}

#[test]
fn test_send_on_closed_channel_rejected() {
    init_logging();
    let mut pair = Pair::new();
    let chat = pair.a.create_channel("chat", None).unwrap().id();
    pair.connect();
    events(&mut pair.a);

    pair.a.channel(chat).unwrap().close().unwrap();
    let result = pair.a.channel(chat).unwrap().send(b"late");
    assert!(result.is_err());
}

#[test]
fn test_unreliable_loss_is_silent() {
    init_logging();
    let mut pair = Pair::new();
    let lossy = pair
        .a
        .create_channel(
            "lossy",
            Some(ChannelInit {
                reliability: Reliability {
                    ordered: false,
                    kind: ReliabilityKind::MaxRetransmits(0),
                },
                ..Default::default()
            }),
        )
        .unwrap()
        .id();
    pair.connect();
    events(&mut pair.a);
    let b_id = opened_channel(&events(&mut pair.b)).expect("remote open");

    pair.a.channel(lossy).unwrap().send(b"doomed").unwrap();
    // The one transmission attempt is lost
    pair.drop_outbound(|p| &mut p.a);

    // Retransmission budget exhausts; the hole is forwarded past
    pair.advance(Duration::from_secs(2));
    pair.pump();
    pair.settle();

    // No error surfaced, nothing delivered
    let a_events = events(&mut pair.a);
    assert!(!a_events
        .iter()
        .any(|e| matches!(e, Event::Channel(ChannelEvent::Error(_, _)))));
    let b_events = events(&mut pair.b);
    assert!(!b_events
        .iter()
        .any(|e| matches!(e, Event::Channel(ChannelEvent::Available { .. }))));
    let mut buf = [0u8; 32];
    assert!(pair
        .b
        .channel(b_id)
        .unwrap()
        .receive(&mut buf)
        .unwrap()
        .is_none());

    // The channel still works for later traffic
    pair.a.channel(lossy).unwrap().send(b"alive").unwrap();
    pair.pump();
    pair.settle();
    let received = pair
        .b
        .channel(b_id)
        .unwrap()
        .receive(&mut buf)
        .unwrap()
        .expect("later message delivered");
    assert_eq!(&buf[..received.0], b"alive");
}

#[test]
fn test_buffered_amount_low_fires_once_per_crossing() {
    init_logging();
    let mut pair = Pair::new();
    let chat = pair.a.create_channel("chat", None).unwrap().id();
    pair.connect();
    events(&mut pair.a);
    events(&mut pair.b);

    pair.a
        .channel(chat)
        .unwrap()
        .set_buffered_amount_low_threshold(8)
        .unwrap();
    pair.a
        .channel(chat)
        .unwrap()
        .send(&[0u8; 4096])
        .unwrap();
    pair.pump();
    pair.settle();
    pair.settle();

    assert_eq!(pair.a.channel(chat).unwrap().buffered_amount().unwrap(), 0);
    let fired = events(&mut pair.a)
        .iter()
        .filter(|e| **e == Event::Channel(ChannelEvent::BufferedAmountLow(chat)))
        .count();
    assert_eq!(fired, 1);
}

#[test]
fn test_negotiated_channel_opens_with_association() {
    init_logging();
    let mut pair = Pair::new();
    let init = ChannelInit {
        reliability: Reliability::reliable_ordered(),
        negotiated: true,
        stream_id: Some(4),
        ..Default::default()
    };
    let a_id = pair
        .a
        .create_channel("negotiated", Some(init.clone()))
        .unwrap()
        .id();
    let b_id = pair
        .b
        .create_channel("negotiated", Some(init))
        .unwrap()
        .id();

    pair.connect();

    assert!(pair.a.channel(a_id).unwrap().is_open());
    assert!(pair.b.channel(b_id).unwrap().is_open());
    assert_eq!(pair.a.channel(a_id).unwrap().stream_id().unwrap(), Some(4));

    pair.b.channel(b_id).unwrap().send(b"pre-agreed").unwrap();
    pair.pump();
    pair.settle();
    let mut buf = [0u8; 32];
    let received = pair
        .a
        .channel(a_id)
        .unwrap()
        .receive(&mut buf)
        .unwrap()
        .expect("delivered");
    assert_eq!(&buf[..received.0], b"pre-agreed");
}

#[test]
fn test_receive_buffer_too_small_then_retry() {
    init_logging();
    let mut pair = Pair::new();
    let chat = pair.a.create_channel("chat", None).unwrap().id();
    pair.connect();
    events(&mut pair.a);
    let b_id = opened_channel(&events(&mut pair.b)).unwrap();

    pair.a.channel(chat).unwrap().send(b"0123456789").unwrap();
    pair.pump();
    pair.settle();

    let mut small = [0u8; 4];
    let err = pair
        .b
        .channel(b_id)
        .unwrap()
        .receive(&mut small)
        .unwrap_err();
    assert_eq!(
        err.kind(),
        peerlink::shared::error::ErrorKind::BufferTooSmall
    );

    // Message stays queued; a larger buffer succeeds
    assert_eq!(pair.b.channel(b_id).unwrap().available_amount().unwrap(), 10);
    let mut big = [0u8; 16];
    let received = pair
        .b
        .channel(b_id)
        .unwrap()
        .receive(&mut big)
        .unwrap()
        .expect("still queued");
    assert_eq!(&big[..received.0], b"0123456789");
}

#[test]
fn test_media_track_sample_and_feedback() {
    init_logging();
    let mut pair = Pair::new();

    let ssrc = 0x1234_5678;
    let a_track = pair
        .a
        .add_track(TrackInit {
            direction: Direction::SendOnly,
            codec: Codec::Opus,
            payload_type: 111,
            ssrc,
            mid: "audio0".into(),
            name: Some("mic".into()),
            msid: None,
            profile: None,
        })
        .unwrap()
        .id();
    let b_track = pair
        .b
        .add_track(TrackInit {
            direction: Direction::RecvOnly,
            codec: Codec::Opus,
            payload_type: 111,
            ssrc,
            mid: "audio0".into(),
            name: None,
            msid: None,
            profile: None,
        })
        .unwrap()
        .id();

    pair.connect();
    assert!(pair.a.track(a_track).unwrap().is_open());

    pair.a
        .track(a_track)
        .unwrap()
        .set_packetizer(TrackPacketizerInit::new(48000))
        .unwrap();
    pair.a
        .track(a_track)
        .unwrap()
        .chain_reporting_session(16)
        .unwrap();

    // Sample flows to the receive track
    pair.a
        .track(a_track)
        .unwrap()
        .send_sample(&[1, 2, 3, 4])
        .unwrap();
    pair.pump();
    let b_events = events(&mut pair.b);
    assert!(b_events
        .iter()
        .any(|e| matches!(e, Event::Track(TrackEvent::Available { id, .. }) if *id == b_track)));
    let mut buf = [0u8; 256];
    let packet_len = pair
        .b
        .track(b_track)
        .unwrap()
        .receive(&mut buf)
        .unwrap()
        .expect("packet queued");
    // Full packet: header plus the four payload bytes
    assert_eq!(packet_len, 12 + 4);
    assert_eq!(&buf[packet_len - 4..packet_len], &[1, 2, 3, 4]);

    // Periodic sender report reaches the receive track
    pair.advance(Duration::from_millis(1100));
    pair.pump();
    assert!(pair
        .b
        .track(b_track)
        .unwrap()
        .last_sender_report_timestamp()
        .unwrap()
        .is_some());

    // Key-frame request from the receiver surfaces on the sender
    pair.b.track(b_track).unwrap().request_key_frame().unwrap();
    pair.pump();
    let a_events = events(&mut pair.a);
    assert!(a_events
        .iter()
        .any(|e| matches!(e, Event::Track(TrackEvent::KeyFrameRequested(id)) if *id == a_track)));
}

#[test]
fn test_seconds_timestamp_round_trip_on_track() {
    init_logging();
    let mut pair = Pair::new();
    let track = pair
        .a
        .add_track(TrackInit {
            direction: Direction::SendOnly,
            codec: Codec::H264,
            payload_type: 96,
            ssrc: 42,
            mid: "video0".into(),
            name: None,
            msid: None,
            profile: None,
        })
        .unwrap()
        .id();
    pair.a
        .track(track)
        .unwrap()
        .set_packetizer(TrackPacketizerInit::new(90000))
        .unwrap();

    let seconds = 2.5f64;
    let timestamp = pair
        .a
        .track(track)
        .unwrap()
        .seconds_to_timestamp(seconds)
        .unwrap();
    let back = pair
        .a
        .track(track)
        .unwrap()
        .timestamp_to_seconds(timestamp)
        .unwrap();
    assert!((back - seconds).abs() <= 1.0 / 90000.0);
}

#[test]
fn test_signaling_state_rejects_bad_transitions() {
    init_logging();
    let mut pair = Pair::new();
    let answer = {
        // An answer out of nowhere is invalid
        let offer = pair.b.create_offer().unwrap();
        peerlink::SessionDescription {
            kind: peerlink::DescriptionKind::Answer,
            ..offer
        }
    };
    assert!(pair.a.set_remote_description(answer).is_err());
    assert!(pair.a.create_answer().is_err());
}
