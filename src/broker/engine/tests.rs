use std::time::{Duration, Instant};

use bytes::BytesMut;
use pretty_assertions::assert_eq;

use super::*;
use crate::broker::connection::mock::MockStream;
use crate::broker::registry::Sweep;
use crate::broker::{close_hung_up, read_inbound, write_outbound};
use crate::codec::Encoder;
use crate::protocol::{Connect, Publish, Subscribe, TopicRequest, Unsubscribe};

/// Registry plus engine, stepped through the same phases as the broker
struct Harness {
    engine: Engine,
    registry: Registry<MockStream>,
    now: Instant,
}

impl Harness {
    fn new(fanout: FanoutMode) -> Self {
        Self {
            engine: Engine::new(Decoder::new(), fanout),
            registry: Registry::new(),
            now: Instant::now(),
        }
    }

    fn accept(&mut self) -> (ConnectionId, MockStream) {
        let stream = MockStream::new();
        let port = 40000 + self.registry.len() as u16;
        let id = self.registry.insert(Connection::new(
            stream.clone(),
            format!("127.0.0.1:{}", port).parse().unwrap(),
            self.now,
        ));
        (id, stream)
    }

    /// Accept and complete a CONNECT for `client_id`
    fn client(&mut self, client_id: &str) -> (ConnectionId, MockStream) {
        let (id, stream) = self.accept();
        stream.push(&connect(client_id, 60));
        self.cycle();
        assert_eq!(stream.take_output(), vec![0x20, 0x02, 0x00, 0x00]);
        (id, stream)
    }

    fn cycle(&mut self) {
        for id in self.registry.ids() {
            let conn = self.registry.get_mut(id).unwrap();
            conn.set_readable();
            conn.set_writable();
        }
        close_hung_up(&mut self.registry);
        self.registry.sweep(Sweep::KeepLingering);
        read_inbound(&mut self.registry, self.engine.decoder());
        self.engine.process(&mut self.registry, self.now);
        write_outbound(&mut self.registry);
        self.engine.sweep_keep_alive(&mut self.registry, self.now);
        self.registry.sweep(Sweep::All);
    }

    fn cycles(&mut self, n: usize) {
        for _ in 0..n {
            self.cycle();
        }
    }

    fn alive(&self, id: ConnectionId) -> bool {
        self.registry.get(id).is_some()
    }
}

fn encode(packet: Packet) -> Vec<u8> {
    let mut buf = BytesMut::new();
    Encoder::new().encode(&packet, &mut buf).unwrap();
    buf.to_vec()
}

fn connect(client_id: &str, keep_alive: u16) -> Vec<u8> {
    encode(Packet::Connect(Connect {
        client_id: client_id.to_string(),
        keep_alive,
        ..Default::default()
    }))
}

fn subscribe(packet_id: u16, filters: &[&str]) -> Vec<u8> {
    encode(Packet::Subscribe(Subscribe {
        packet_id,
        topics: filters.iter().map(|f| TopicRequest::new(*f)).collect(),
    }))
}

fn unsubscribe(packet_id: u16, filters: &[&str]) -> Vec<u8> {
    encode(Packet::Unsubscribe(Unsubscribe {
        packet_id,
        topics: filters.iter().map(|f| TopicRequest::new(*f)).collect(),
    }))
}

fn publish(topic: &str, payload: &'static [u8]) -> Vec<u8> {
    encode(Packet::Publish(Publish::new(topic, payload)))
}

#[test]
fn test_connect_accepted() {
    let mut h = Harness::new(FanoutMode::default());
    let (id, _stream) = h.client("alpha");

    let conn = h.registry.get(id).unwrap();
    assert_eq!(conn.state(), State::Ready);
    assert_eq!(conn.client_id(), Some("alpha"));
    assert_eq!(conn.keep_alive(), 60);
}

#[test]
fn test_duplicate_identity_rejected() {
    let mut h = Harness::new(FanoutMode::default());
    let (first, first_stream) = h.accept();
    let (second, second_stream) = h.accept();
    first_stream.push(&connect("dup", 60));
    second_stream.push(&connect("dup", 60));

    h.cycle();

    assert_eq!(first_stream.take_output(), vec![0x20, 0x02, 0x00, 0x00]);
    assert_eq!(second_stream.take_output(), vec![0x20, 0x02, 0x00, 0x02]);
    assert!(h.alive(first));
    assert!(!h.alive(second));
    assert_eq!(h.registry.len(), 1);
}

#[test]
fn test_identity_reusable_after_close() {
    let mut h = Harness::new(FanoutMode::default());
    let (first, first_stream) = h.client("dup");
    first_stream.push(&encode(Packet::Disconnect));
    h.cycle();
    assert!(!h.alive(first));

    h.client("dup");
}

#[test]
fn test_empty_identity_rejected() {
    let mut h = Harness::new(FanoutMode::default());
    let (id, stream) = h.accept();
    stream.push(&connect("", 60));
    h.cycle();

    assert_eq!(stream.take_output(), vec![0x20, 0x02, 0x00, 0x02]);
    assert!(!h.alive(id));
}

#[test]
fn test_bad_protocol_level_refused() {
    let mut h = Harness::new(FanoutMode::default());
    let (id, stream) = h.accept();
    let mut frame = connect("c", 60);
    frame[8] = 3;
    stream.push(&frame);
    h.cycle();

    assert_eq!(stream.take_output(), vec![0x20, 0x02, 0x00, 0x01]);
    assert!(!h.alive(id));
}

#[test]
fn test_bad_protocol_name_closed_silently() {
    let mut h = Harness::new(FanoutMode::default());
    let (id, stream) = h.accept();
    let mut frame = connect("c", 60);
    frame[4] = b'X';
    stream.push(&frame);
    h.cycle();

    assert!(stream.take_output().is_empty());
    assert!(!h.alive(id));
}

#[test]
fn test_first_frame_must_be_connect() {
    let mut h = Harness::new(FanoutMode::default());
    let (id, stream) = h.accept();
    stream.push(&subscribe(1, &["a"]));
    h.cycle();

    assert!(stream.take_output().is_empty());
    assert!(!h.alive(id));
}

#[test]
fn test_second_connect_closes() {
    let mut h = Harness::new(FanoutMode::default());
    let (id, stream) = h.client("once");
    stream.push(&connect("twice", 60));
    h.cycle();

    assert!(stream.take_output().is_empty());
    assert!(!h.alive(id));
}

#[test]
fn test_unsupported_frame_closes() {
    let mut h = Harness::new(FanoutMode::default());
    let (id, stream) = h.client("c");
    stream.push(&[0xD0, 0x00]); // PINGRESP from a client
    h.cycle();
    assert!(!h.alive(id));

    let (id, stream) = h.client("d");
    stream.push(&[0x40, 0x02, 0x00, 0x01]); // PUBACK
    h.cycle();
    assert!(!h.alive(id));
}

#[test]
fn test_invalid_flags_close() {
    let mut h = Harness::new(FanoutMode::default());
    let (id, stream) = h.client("c");
    stream.push(&[0x80, 0x06, 0x00, 0x01, 0x00, 0x01, b'a', 0x00]);
    h.cycle();

    assert!(stream.take_output().is_empty());
    assert!(!h.alive(id));
}

#[test]
fn test_subscribe_acknowledged_in_order() {
    let mut h = Harness::new(FanoutMode::default());
    let (id, stream) = h.client("c");
    stream.push(&subscribe(10, &["a/b", "c/+", "#"]));
    h.cycle();

    assert_eq!(
        stream.take_output(),
        vec![0x90, 0x05, 0x00, 0x0A, 0x00, 0x00, 0x00]
    );
    let conn = h.registry.get(id).unwrap();
    assert_eq!(conn.packet_id(), 10);
    let filters: Vec<_> = conn.topics().iter().map(|f| f.filter()).collect();
    assert_eq!(filters, vec!["a/b", "c/+", "#"]);
}

#[test]
fn test_subscribe_granted_qos_zero() {
    let mut h = Harness::new(FanoutMode::default());
    let (_, stream) = h.client("c");
    let mut frame = subscribe(1, &["a"]);
    let last = frame.len() - 1;
    frame[last] = 2;
    stream.push(&frame);
    h.cycle();

    assert_eq!(stream.take_output(), vec![0x90, 0x03, 0x00, 0x01, 0x00]);
}

#[test]
fn test_unsuback_echoes_packet_id() {
    let mut h = Harness::new(FanoutMode::default());
    let (id, stream) = h.client("c");
    stream.push(&subscribe(1, &["a"]));
    h.cycle();
    stream.take_output();

    stream.push(&unsubscribe(0xBEEF, &["a", "never/subscribed"]));
    h.cycle();

    assert_eq!(stream.take_output(), vec![0xB0, 0x02, 0xBE, 0xEF]);
    assert!(h.registry.get(id).unwrap().topics().is_empty());
}

#[test]
fn test_publish_routed_to_matching_subscribers() {
    let mut h = Harness::new(FanoutMode::default());
    let (_, a) = h.client("A");
    let (_, b) = h.client("B");
    let (_, c) = h.client("C");

    a.push(&subscribe(1, &["room/1"]));
    c.push(&subscribe(1, &["room/2"]));
    h.cycle();
    a.take_output();
    c.take_output();

    b.push(&publish("room/1", b"hi"));
    h.cycle();

    let frame = a.take_output();
    let (packet, _) = Decoder::new().decode(&frame).unwrap().unwrap();
    assert_eq!(packet, Packet::Publish(Publish::new("room/1", &b"hi"[..])));
    assert!(b.take_output().is_empty());
    assert!(c.take_output().is_empty());
}

#[test]
fn test_sender_receives_own_publish() {
    let mut h = Harness::new(FanoutMode::default());
    let (_, a) = h.client("A");
    a.push(&subscribe(1, &["echo/#"]));
    h.cycle();
    a.take_output();

    a.push(&publish("echo/me", b"x"));
    h.cycle();
    assert_eq!(a.take_output(), publish("echo/me", b"x"));
}

#[test]
fn test_dollar_topics_skip_wildcard_subscribers() {
    let mut h = Harness::new(FanoutMode::default());
    let (_, a) = h.client("A");
    let (_, b) = h.client("B");
    a.push(&subscribe(1, &["#"]));
    h.cycle();
    a.take_output();

    b.push(&publish("$SYS/x", b"x"));
    h.cycle();
    assert!(a.take_output().is_empty());
}

#[test]
fn test_per_filter_fanout() {
    let mut h = Harness::new(FanoutMode::PerFilter);
    let (id, a) = h.client("A");
    let (_, b) = h.client("B");
    a.push(&subscribe(1, &["a/#", "a/+", "a/b"]));
    h.cycle();
    a.take_output();

    b.push(&publish("a/b", b"x"));
    h.cycle();
    // One frame goes out per cycle
    assert_eq!(h.registry.get(id).unwrap().queued(), 2);
    h.cycles(2);

    let expected = publish("a/b", b"x").repeat(3);
    assert_eq!(a.take_output(), expected);
}

#[test]
fn test_per_connection_fanout_sends_once() {
    let mut h = Harness::new(FanoutMode::PerConnection);
    let (id, a) = h.client("A");
    let (_, b) = h.client("B");
    a.push(&subscribe(1, &["a/#", "a/+"]));
    h.cycle();
    a.take_output();

    b.push(&publish("a/b", b"x"));
    h.cycle();
    assert_eq!(a.take_output(), publish("a/b", b"x"));
    assert_eq!(h.registry.get(id).unwrap().queued(), 0);
}

#[test]
fn test_fanout_modes_with_backlog() {
    // Two publishes in one cycle while the subscriber can only take one frame
    let run = |mode| {
        let mut h = Harness::new(mode);
        let (_, a) = h.client("A");
        let (_, b) = h.client("B");
        let (_, c) = h.client("C");
        a.push(&subscribe(1, &["t"]));
        h.cycle();
        a.take_output();

        b.push(&publish("t", b"1"));
        c.push(&publish("t", b"2"));
        h.cycles(3);
        a.take_output()
    };

    let mut both = publish("t", b"1");
    both.extend(publish("t", b"2"));
    assert_eq!(run(FanoutMode::PerConnection), both);
    assert_eq!(run(FanoutMode::LastMatch), publish("t", b"2"));
}

#[test]
fn test_outbound_queue_capped_under_sustained_publish() {
    let mut h = Harness::new(FanoutMode::PerConnection);
    h.engine = h.engine.clone().with_max_queued(4);
    let (id, a) = h.client("A");
    let (_, b) = h.client("B");
    let (_, c) = h.client("C");
    a.push(&subscribe(1, &["t"]));
    h.cycle();
    a.take_output();

    // Two publishes arrive per cycle but only one frame goes out
    for _ in 0..200 {
        a.push(&[0xC0, 0x00]);
        b.push(&publish("t", b"1"));
        c.push(&publish("t", b"2"));
        h.cycle();
        assert!(h.registry.get(id).unwrap().queued() <= 4);
    }

    assert!(h.alive(id));
    let output = a.take_output();
    assert!(output.windows(2).any(|w| w == [0xD0, 0x00]));
}

#[test]
fn test_unbounded_queue_when_limit_is_zero() {
    let mut h = Harness::new(FanoutMode::PerFilter);
    h.engine = h.engine.clone().with_max_queued(0);
    let (id, a) = h.client("A");
    let (_, b) = h.client("B");
    a.push(&subscribe(1, &["t", "t", "t"]));
    h.cycle();
    a.take_output();

    b.push(&publish("t", b"x"));
    h.cycle();
    assert_eq!(h.registry.get(id).unwrap().queued(), 2);
}

#[test]
fn test_per_filter_copies_stop_at_queue_limit() {
    let mut h = Harness::new(FanoutMode::PerFilter);
    h.engine = h.engine.clone().with_max_queued(2);
    let (_, a) = h.client("A");
    let (_, b) = h.client("B");
    a.push(&subscribe(1, &["t", "t", "t"]));
    h.cycle();
    a.take_output();

    b.push(&publish("t", b"x"));
    h.cycles(4);
    assert_eq!(a.take_output(), publish("t", b"x").repeat(2));
}

#[test]
fn test_publish_topic_longer_than_frame_closes() {
    let mut h = Harness::new(FanoutMode::default());
    let (id, stream) = h.client("c");
    stream.push(&[0x30, 0x03, 0x00, 0x05, b'a']);
    h.cycle();

    assert!(stream.take_output().is_empty());
    assert!(!h.alive(id));
}

#[test]
fn test_pingreq() {
    let mut h = Harness::new(FanoutMode::default());
    let (id, stream) = h.client("c");
    stream.push(&[0xC0, 0x00]);
    h.cycle();

    assert_eq!(stream.take_output(), vec![0xD0, 0x00]);
    assert!(h.alive(id));
}

#[test]
fn test_disconnect_closes_without_reply() {
    let mut h = Harness::new(FanoutMode::default());
    let (id, stream) = h.client("c");
    stream.push(&[0xE0, 0x00]);
    h.cycle();

    assert!(stream.take_output().is_empty());
    assert!(!h.alive(id));
}

#[test]
fn test_peer_close_and_short_read() {
    let mut h = Harness::new(FanoutMode::default());
    let (clean, clean_stream) = h.client("clean");
    let (short, short_stream) = h.client("short");

    clean_stream.close();
    short_stream.push(&[0x30, 0x0A, 0x00, 0x01]);
    short_stream.close();
    h.cycle();

    assert!(!h.alive(clean));
    assert!(!h.alive(short));
}

#[test]
fn test_hangup_closes() {
    let mut h = Harness::new(FanoutMode::default());
    let (id, _stream) = h.client("c");
    h.registry.get_mut(id).unwrap().set_hangup();
    h.cycle();
    assert!(!h.alive(id));
}

#[test]
fn test_keep_alive_eviction() {
    let mut h = Harness::new(FanoutMode::default());
    let (id, stream) = h.accept();
    stream.push(&connect("sleepy", 2));
    h.cycle();
    stream.take_output();

    let seen = h.now;
    assert_eq!(
        h.engine
            .sweep_keep_alive(&mut h.registry, seen + Duration::from_secs(3)),
        0
    );
    assert!(!h.registry.get(id).unwrap().is_closing());

    assert_eq!(
        h.engine
            .sweep_keep_alive(&mut h.registry, seen + Duration::from_millis(3100)),
        1
    );
    assert!(h.registry.get(id).unwrap().is_closing());
}

#[test]
fn test_keep_alive_zero_never_evicted() {
    let mut h = Harness::new(FanoutMode::default());
    let (id, stream) = h.accept();
    stream.push(&connect("forever", 0));
    h.cycle();

    let later = h.now + Duration::from_secs(24 * 3600);
    assert_eq!(h.engine.sweep_keep_alive(&mut h.registry, later), 0);
    assert!(h.alive(id));
}

#[test]
fn test_activity_resets_keep_alive() {
    let mut h = Harness::new(FanoutMode::default());
    let (id, stream) = h.accept();
    stream.push(&connect("busy", 2));
    h.cycle();

    h.now += Duration::from_secs(2);
    stream.push(&[0xC0, 0x00]);
    h.cycle();

    let check = h.now + Duration::from_secs(2);
    assert_eq!(h.engine.sweep_keep_alive(&mut h.registry, check), 0);
    assert!(h.alive(id));
}

#[test]
fn test_one_frame_per_connection_per_cycle() {
    let mut h = Harness::new(FanoutMode::default());
    let (_, stream) = h.client("c");
    let mut frames = vec![0xC0, 0x00];
    frames.extend([0xC0, 0x00]);
    stream.push(&frames);

    h.cycle();
    assert_eq!(stream.take_output(), vec![0xD0, 0x00]);
    h.cycle();
    assert_eq!(stream.take_output(), vec![0xD0, 0x00]);
}
