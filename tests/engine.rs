//! End-to-end protocol scenarios driven through a scripted transport.
//!
//! The mock transport records what the engine writes, serves bytes the
//! test queues, and exposes the timer table and a controllable clock, so
//! each scenario can assert on exact wire bytes and timer behavior.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use yawe::{
    accept_key, apply_mask, Base, CloseCode, ConnState, Connection, DeliveryMode, FrameHeader,
    Handler, OpCode, Options, PingResponse, RateLimits, TimerKind, TlsMode, Transport,
    TransportEvent,
};

// ================== Mock transport ==================

#[derive(Default)]
struct TransportState {
    connect: Option<(String, u16, TlsMode)>,
    written: Vec<u8>,
    inbound: BytesMut,
    closed: bool,
    timers: HashMap<TimerKind, Duration>,
    /// Cap on how many bytes a single `write` accepts; `None` is
    /// unlimited.
    write_cap: Option<usize>,
    now: Option<Instant>,
}

#[derive(Clone)]
struct MockTransport(Rc<RefCell<TransportState>>);

impl MockTransport {
    fn new() -> Self {
        let state = TransportState {
            now: Some(Instant::now()),
            ..TransportState::default()
        };
        Self(Rc::new(RefCell::new(state)))
    }
}

impl Transport for MockTransport {
    fn connect(&mut self, host: &str, port: u16, tls: TlsMode) -> io::Result<()> {
        self.0.borrow_mut().connect = Some((host.to_owned(), port, tls));
        Ok(())
    }

    fn read_available(&mut self, buf: &mut BytesMut, max: usize) -> io::Result<usize> {
        let mut state = self.0.borrow_mut();
        let n = state.inbound.len().min(max);
        buf.extend_from_slice(&state.inbound[..n]);
        state.inbound.advance(n);
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let mut state = self.0.borrow_mut();
        let n = match state.write_cap {
            Some(cap) => data.len().min(cap),
            None => data.len(),
        };
        state.written.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn close(&mut self) {
        self.0.borrow_mut().closed = true;
    }

    fn set_timer(&mut self, kind: TimerKind, after: Duration) {
        self.0.borrow_mut().timers.insert(kind, after);
    }

    fn cancel_timer(&mut self, kind: TimerKind) {
        self.0.borrow_mut().timers.remove(&kind);
    }

    fn now(&self) -> Instant {
        self.0.borrow().now.expect("clock initialized")
    }
}

// ================== Recording handler ==================

#[derive(Default)]
struct Events {
    connects: usize,
    messages: Vec<(Vec<u8>, bool)>,
    message_begins: usize,
    message_ends: usize,
    frames: Vec<Vec<u8>>,
    frame_chunks: Vec<Vec<u8>>,
    pings: Vec<Vec<u8>>,
    pongs: Vec<Vec<u8>>,
    closes: Vec<(u16, Vec<u8>)>,
    errors: Vec<String>,
    pong_timeouts: usize,
    recv_timeouts: usize,
    connect_timeouts: usize,
    send_completes: Vec<Vec<u8>>,
    /// When set, received pings are not auto-answered.
    manual_ping: bool,
}

#[derive(Clone, Default)]
struct Recorder(Rc<RefCell<Events>>);

impl Recorder {
    fn events(&self) -> std::cell::Ref<'_, Events> {
        self.0.borrow()
    }
}

impl Handler for Recorder {
    fn on_connect(&mut self, _ws: &mut Connection) {
        self.0.borrow_mut().connects += 1;
    }

    fn on_message(&mut self, _ws: &mut Connection, payload: Bytes, binary: bool) {
        self.0.borrow_mut().messages.push((payload.to_vec(), binary));
    }

    fn on_message_begin(&mut self, _ws: &mut Connection) {
        self.0.borrow_mut().message_begins += 1;
    }

    fn on_message_end(&mut self, _ws: &mut Connection) {
        self.0.borrow_mut().message_ends += 1;
    }

    fn on_frame(&mut self, _ws: &mut Connection, _header: &FrameHeader, payload: Bytes) {
        self.0.borrow_mut().frames.push(payload.to_vec());
    }

    fn on_frame_data(&mut self, _ws: &mut Connection, chunk: Bytes) {
        self.0.borrow_mut().frame_chunks.push(chunk.to_vec());
    }

    fn on_ping(&mut self, _ws: &mut Connection, payload: &[u8]) -> PingResponse {
        let mut events = self.0.borrow_mut();
        events.pings.push(payload.to_vec());
        if events.manual_ping {
            PingResponse::Handled
        } else {
            PingResponse::Auto
        }
    }

    fn on_pong(&mut self, _ws: &mut Connection, payload: &[u8]) {
        self.0.borrow_mut().pongs.push(payload.to_vec());
    }

    fn on_close(&mut self, _ws: &mut Connection, code: CloseCode, reason: &[u8]) {
        self.0
            .borrow_mut()
            .closes
            .push((u16::from(code), reason.to_vec()));
    }

    fn on_send_complete(&mut self, _ws: &mut Connection, payload: Bytes) {
        self.0.borrow_mut().send_completes.push(payload.to_vec());
    }

    fn on_pong_timeout(&mut self, _ws: &mut Connection) {
        self.0.borrow_mut().pong_timeouts += 1;
    }

    fn on_recv_timeout(&mut self, _ws: &mut Connection) {
        self.0.borrow_mut().recv_timeouts += 1;
    }

    fn on_connect_timeout(&mut self, _ws: &mut Connection) {
        self.0.borrow_mut().connect_timeouts += 1;
    }

    fn on_error(&mut self, _ws: &mut Connection, error: &yawe::WebSocketError) {
        self.0.borrow_mut().errors.push(error.to_string());
    }
}

// ================== Test rig ==================

struct Rig {
    conn: Connection,
    handler: Recorder,
    transport: MockTransport,
}

impl Rig {
    fn new(opts: Options) -> Self {
        let transport = MockTransport::new();
        let conn = Connection::new(Box::new(transport.clone()), opts);
        Self {
            conn,
            handler: Recorder::default(),
            transport,
        }
    }

    fn event(&mut self, event: TransportEvent) {
        self.conn.handle_event(&mut self.handler, event);
    }

    /// Queues server bytes and signals them readable.
    fn feed(&mut self, bytes: &[u8]) {
        self.transport.0.borrow_mut().inbound.extend_from_slice(bytes);
        self.event(TransportEvent::BytesAvailable);
    }

    fn written(&self) -> Vec<u8> {
        self.transport.0.borrow().written.clone()
    }

    fn clear_written(&self) {
        self.transport.0.borrow_mut().written.clear();
    }

    fn advance_clock(&self, by: Duration) {
        let mut state = self.transport.0.borrow_mut();
        let now = state.now.expect("clock initialized");
        state.now = Some(now + by);
    }

    /// Runs connect + handshake, leaving the connection open and the
    /// write log empty.
    fn open(&mut self, url: &str) {
        self.conn.connect(url).expect("connect accepted");
        self.event(TransportEvent::Connected);

        let request = String::from_utf8(self.written()).expect("request is ASCII");
        let key = request
            .lines()
            .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
            .expect("request carries a key")
            .to_owned();
        self.clear_written();

        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            accept_key(&key)
        );
        self.feed(response.as_bytes());
        assert_eq!(self.conn.state(), ConnState::Open);
    }
}

/// Builds an unmasked server frame.
fn server_frame(fin: bool, opcode: OpCode, payload: &[u8]) -> Vec<u8> {
    let mut head = [0u8; 14];
    let n = FrameHeader::new(fin, opcode, payload.len() as u64).encode(&mut head);
    let mut out = head[..n].to_vec();
    out.extend_from_slice(payload);
    out
}

fn server_close(code: u16, reason: &[u8]) -> Vec<u8> {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(reason);
    server_frame(true, OpCode::Close, &payload)
}

/// Decodes the client's wire bytes into (fin, opcode, unmasked payload).
fn client_frames(bytes: &[u8]) -> Vec<(bool, OpCode, Vec<u8>)> {
    let mut frames = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        let (header, head_len) = FrameHeader::decode(rest)
            .expect("valid client header")
            .expect("complete client header");
        let len = header.payload_len as usize;
        let mut payload = rest[head_len..head_len + len].to_vec();
        if let Some(mask) = header.mask {
            apply_mask(&mut payload, mask);
        }
        frames.push((header.fin, header.opcode, payload));
        rest = &rest[head_len + len..];
    }
    frames
}

// ================== Handshake ==================

#[test]
fn handshake_request_layout() {
    let mut rig = Rig::new(
        Options::default()
            .with_origin("http://example.com")
            .with_subprotocol("chat"),
    );
    rig.conn.connect("ws://example.com/chat").expect("connect");
    rig.event(TransportEvent::Connected);

    assert_eq!(rig.conn.state(), ConnState::Handshaking);
    let request = String::from_utf8(rig.written()).expect("ASCII request");
    assert!(request.starts_with("GET /chat HTTP/1.1\r\n"));
    assert!(request.contains("Host: example.com\r\n"));
    assert!(request.contains("Upgrade: websocket\r\n"));
    assert!(request.contains("Sec-WebSocket-Version: 13\r\n"));
    assert!(request.contains("Origin: http://example.com\r\n"));
    assert!(request.contains("Sec-WebSocket-Protocol: chat\r\n"));

    let state = rig.transport.0.borrow();
    assert_eq!(
        state.connect.as_ref().map(|(h, p, _)| (h.as_str(), *p)),
        Some(("example.com", 80))
    );
}

#[test]
fn handshake_completes_and_fires_on_connect() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/chat");
    assert_eq!(rig.handler.events().connects, 1);
    assert!(rig.conn.is_connected());
}

#[test]
fn handshake_rejects_bad_accept_key() {
    let mut rig = Rig::new(Options::default());
    rig.conn.connect("ws://example.com/").expect("connect");
    rig.event(TransportEvent::Connected);
    rig.clear_written();

    rig.feed(
        b"HTTP/1.1 101 Switching Protocols\r\n\
          Upgrade: websocket\r\n\
          Connection: Upgrade\r\n\
          Sec-WebSocket-Accept: bm90IHRoZSByaWdodCBrZXk=\r\n\r\n",
    );

    assert_eq!(rig.conn.state(), ConnState::Closed);
    assert!(rig.transport.0.borrow().closed);
    let events = rig.handler.events();
    assert_eq!(events.errors.len(), 1);
    // Handshake failure reports 1002 without sending it on the wire.
    assert_eq!(events.closes, vec![(1002, vec![])]);
}

#[test]
fn subprotocol_is_negotiated() {
    let mut rig = Rig::new(Options::default().with_subprotocol("chat").with_subprotocol("v2"));
    rig.conn.connect("ws://example.com/").expect("connect");
    rig.event(TransportEvent::Connected);

    let request = String::from_utf8(rig.written()).expect("ASCII request");
    assert!(request.contains("Sec-WebSocket-Protocol: chat, v2\r\n"));
    let key = request
        .lines()
        .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
        .expect("key")
        .to_owned();
    rig.clear_written();

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         Sec-WebSocket-Protocol: v2\r\n\r\n",
        accept_key(&key)
    );
    rig.feed(response.as_bytes());

    assert_eq!(rig.conn.subprotocol(), Some("v2"));
}

#[test]
fn frames_behind_the_handshake_response_are_parsed() {
    let mut rig = Rig::new(Options::default());
    rig.conn.connect("ws://example.com/").expect("connect");
    rig.event(TransportEvent::Connected);
    let request = String::from_utf8(rig.written()).expect("ASCII request");
    let key = request
        .lines()
        .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
        .expect("key")
        .to_owned();
    rig.clear_written();

    let mut bytes = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(&key)
    )
    .into_bytes();
    bytes.extend_from_slice(&server_frame(true, OpCode::Text, b"early"));
    rig.feed(&bytes);

    let events = rig.handler.events();
    assert_eq!(events.connects, 1);
    assert_eq!(events.messages, vec![(b"early".to_vec(), false)]);
}

// ================== Scenarios S1-S6 ==================

/// S1: a single text message each way.
#[test]
fn s1_single_text_message() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/chat");

    rig.conn.send_msg("Hello").expect("send");

    let written = rig.written();
    assert_eq!(written[0], 0x81); // FIN + text
    assert_eq!(written[1], 0x85); // masked, len 5
    let frames = client_frames(&written);
    assert_eq!(frames, vec![(true, OpCode::Text, b"Hello".to_vec())]);

    rig.feed(&server_frame(true, OpCode::Text, b"Hello"));
    let events = rig.handler.events();
    assert_eq!(events.messages, vec![(b"Hello".to_vec(), false)]);
}

/// S2: outbound fragmentation at max_frame_size = 2.
#[test]
fn s2_outbound_fragmentation() {
    let mut rig = Rig::new(Options::default().with_max_frame_size(2));
    rig.open("ws://example.com/");

    rig.conn
        .send_msg_ex(Bytes::from_static(&[0xAA, 0xBB, 0xCC, 0xDD]), true)
        .expect("send");

    let frames = client_frames(&rig.written());
    assert_eq!(
        frames,
        vec![
            (false, OpCode::Binary, vec![0xAA, 0xBB]),
            (true, OpCode::Continuation, vec![0xCC, 0xDD]),
        ]
    );
}

/// S3: a ping is answered with a pong echoing the exact payload.
#[test]
fn s3_ping_auto_pong() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/");

    rig.feed(&server_frame(true, OpCode::Ping, b"abc"));

    let events = rig.handler.events();
    assert_eq!(events.pings, vec![b"abc".to_vec()]);
    drop(events);

    let frames = client_frames(&rig.written());
    assert_eq!(frames, vec![(true, OpCode::Pong, b"abc".to_vec())]);
}

/// A handler that answers pings itself suppresses the auto-pong.
#[test]
fn user_ping_handler_suppresses_auto_pong() {
    let mut rig = Rig::new(Options::default());
    rig.handler.0.borrow_mut().manual_ping = true;
    rig.open("ws://example.com/");

    rig.feed(&server_frame(true, OpCode::Ping, b"abc"));
    assert!(rig.written().is_empty());
    assert_eq!(rig.handler.events().pings, vec![b"abc".to_vec()]);
}

/// S4: clean close handshake initiated locally.
#[test]
fn s4_clean_close() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/");

    rig.conn
        .close_with_reason(CloseCode::Away, "bye")
        .expect("close");
    assert_eq!(rig.conn.state(), ConnState::Closing);

    let frames = client_frames(&rig.written());
    assert_eq!(
        frames,
        vec![(true, OpCode::Close, vec![0x03, 0xE9, b'b', b'y', b'e'])]
    );

    // Further sends are refused once the close is out.
    assert!(rig.conn.send_msg("nope").is_err());

    rig.feed(&server_close(1001, b"bye"));
    assert_eq!(rig.conn.state(), ConnState::Closed);
    assert!(rig.transport.0.borrow().closed);
    assert_eq!(rig.handler.events().closes, vec![(1001, b"bye".to_vec())]);
}

/// The peer initiates: we echo its status and close.
#[test]
fn peer_initiated_close_is_echoed() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/");

    rig.feed(&server_close(1000, b"done"));

    let frames = client_frames(&rig.written());
    assert_eq!(
        frames,
        vec![(true, OpCode::Close, [&[0x03, 0xE8][..], b"done"].concat())]
    );
    assert_eq!(rig.conn.state(), ConnState::Closed);
    assert_eq!(rig.handler.events().closes, vec![(1000, b"done".to_vec())]);
}

/// S5: overlong UTF-8 in a text frame closes with 1007.
#[test]
fn s5_invalid_utf8_closes_1007() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/");

    rig.feed(&server_frame(true, OpCode::Text, &[0xC0, 0x80]));

    let events = rig.handler.events();
    assert_eq!(events.errors, vec!["Invalid UTF-8".to_owned()]);
    drop(events);

    let frames = client_frames(&rig.written());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].1, OpCode::Close);
    assert_eq!(&frames[0].2[..2], &1007u16.to_be_bytes());
    assert_eq!(rig.conn.state(), ConnState::Closing);
}

/// S6: an unanswered ping fires the pong timeout exactly once.
#[test]
fn s6_pong_timeout_fires_once() {
    let mut rig = Rig::new(Options::default().with_pong_timeout(Duration::from_millis(500)));
    rig.open("ws://example.com/");

    rig.conn.send_ping_ex(Bytes::from_static(b"x")).expect("ping");
    assert_eq!(
        rig.transport.0.borrow().timers.get(&TimerKind::Pong),
        Some(&Duration::from_millis(500))
    );

    rig.event(TransportEvent::TimerFired(TimerKind::Pong));
    assert_eq!(rig.handler.events().pong_timeouts, 1);

    // A stray second expiry must not re-fire: nothing is pending.
    rig.event(TransportEvent::TimerFired(TimerKind::Pong));
    assert_eq!(rig.handler.events().pong_timeouts, 1);
}

/// A matching pong clears the pending set and cancels the timer.
#[test]
fn pong_clears_pending_ping() {
    let mut rig = Rig::new(Options::default().with_pong_timeout(Duration::from_millis(500)));
    rig.open("ws://example.com/");

    rig.conn.send_ping_ex(Bytes::from_static(b"x")).expect("ping");
    rig.feed(&server_frame(true, OpCode::Pong, b"x"));

    assert!(rig.transport.0.borrow().timers.get(&TimerKind::Pong).is_none());
    assert_eq!(rig.handler.events().pongs, vec![b"x".to_vec()]);

    rig.event(TransportEvent::TimerFired(TimerKind::Pong));
    assert_eq!(rig.handler.events().pong_timeouts, 0);
}

/// Unsolicited pongs are accepted without complaint.
#[test]
fn unsolicited_pong_is_accepted() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/");

    rig.feed(&server_frame(true, OpCode::Pong, b"surprise"));
    assert_eq!(rig.handler.events().pongs, vec![b"surprise".to_vec()]);
    assert_eq!(rig.conn.state(), ConnState::Open);
}

// ================== Inbound assembly ==================

#[test]
fn fragmented_message_reassembles() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/");

    rig.feed(&server_frame(false, OpCode::Text, b"Hel"));
    rig.feed(&server_frame(false, OpCode::Continuation, b"l"));
    rig.feed(&server_frame(true, OpCode::Continuation, b"o"));

    assert_eq!(
        rig.handler.events().messages,
        vec![(b"Hello".to_vec(), false)]
    );
}

#[test]
fn control_frames_interleave_fragments() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/");

    let mut bytes = server_frame(false, OpCode::Text, b"He");
    bytes.extend_from_slice(&server_frame(true, OpCode::Ping, b"p"));
    bytes.extend_from_slice(&server_frame(true, OpCode::Continuation, b"llo"));
    rig.feed(&bytes);

    let events = rig.handler.events();
    assert_eq!(events.pings, vec![b"p".to_vec()]);
    assert_eq!(events.messages, vec![(b"Hello".to_vec(), false)]);
    drop(events);

    // The pong went out even though a message was mid-flight.
    let frames = client_frames(&rig.written());
    assert_eq!(frames, vec![(true, OpCode::Pong, b"p".to_vec())]);
}

#[test]
fn stream_mode_delivers_chunks() {
    let mut rig = Rig::new(Options::default().with_delivery(DeliveryMode::Stream));
    rig.open("ws://example.com/");

    rig.feed(&server_frame(false, OpCode::Binary, &[1, 2]));
    rig.feed(&server_frame(true, OpCode::Continuation, &[3]));

    let events = rig.handler.events();
    assert_eq!(events.message_begins, 1);
    assert_eq!(events.frame_chunks, vec![vec![1, 2], vec![3]]);
    assert_eq!(events.message_ends, 1);
    assert!(events.messages.is_empty());
}

#[test]
fn frame_mode_delivers_frames() {
    let mut rig = Rig::new(Options::default().with_delivery(DeliveryMode::Frame));
    rig.open("ws://example.com/");

    rig.feed(&server_frame(false, OpCode::Binary, &[1, 2]));
    rig.feed(&server_frame(true, OpCode::Continuation, &[3]));

    let events = rig.handler.events();
    assert_eq!(events.message_begins, 1);
    assert_eq!(events.frames, vec![vec![1, 2], vec![3]]);
    assert_eq!(events.message_ends, 1);
}

#[test]
fn message_cap_closes_1009() {
    let mut rig = Rig::new(Options::default().with_max_message_size(4));
    rig.open("ws://example.com/");

    rig.feed(&server_frame(true, OpCode::Binary, &[0; 5]));

    let frames = client_frames(&rig.written());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].1, OpCode::Close);
    assert_eq!(&frames[0].2[..2], &1009u16.to_be_bytes());
}

// ================== Protocol failures ==================

#[test]
fn masked_server_frame_closes_1002() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/");

    rig.feed(&[0x81, 0x85, 1, 2, 3, 4, 0, 0, 0, 0, 0]);

    let frames = client_frames(&rig.written());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].1, OpCode::Close);
    assert_eq!(&frames[0].2[..2], &1002u16.to_be_bytes());

    // The transport eventually reports the close; the effective status
    // stays the protocol error.
    rig.event(TransportEvent::Closed);
    assert_eq!(rig.handler.events().closes, vec![(1002, vec![])]);
}

#[test]
fn reserved_close_code_from_peer_is_a_protocol_error() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/");

    rig.feed(&server_close(1005, b""));

    let frames = client_frames(&rig.written());
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0].2[..2], &1002u16.to_be_bytes());
}

#[test]
fn one_byte_close_payload_is_a_protocol_error() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/");

    rig.feed(&server_frame(true, OpCode::Close, &[0x03]));

    let frames = client_frames(&rig.written());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].1, OpCode::Close);
    assert_eq!(&frames[0].2[..2], &1002u16.to_be_bytes());
}

#[test]
fn transport_eof_without_close_reports_1006() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/");

    rig.event(TransportEvent::Closed);
    assert_eq!(rig.conn.state(), ConnState::Closed);
    assert_eq!(rig.handler.events().closes, vec![(1006, vec![])]);
}

#[test]
fn transport_error_reports_1006() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/");

    rig.event(TransportEvent::Error(io::Error::new(
        io::ErrorKind::ConnectionReset,
        "reset by peer",
    )));

    let events = rig.handler.events();
    assert_eq!(events.errors.len(), 1);
    assert_eq!(events.closes, vec![(1006, vec![])]);
}

// ================== Timers ==================

#[test]
fn connect_timeout_closes_the_connection() {
    let mut rig = Rig::new(Options::default().with_connect_timeout(Duration::from_secs(5)));
    rig.conn.connect("ws://example.com/").expect("connect");
    assert_eq!(
        rig.transport.0.borrow().timers.get(&TimerKind::Connect),
        Some(&Duration::from_secs(5))
    );

    rig.event(TransportEvent::TimerFired(TimerKind::Connect));

    let events = rig.handler.events();
    assert_eq!(events.connect_timeouts, 1);
    assert_eq!(events.closes, vec![(1006, vec![])]);
    assert_eq!(rig.conn.state(), ConnState::Closed);
}

#[test]
fn recv_timeout_closes_the_connection() {
    let mut rig = Rig::new(Options::default().with_recv_timeout(Duration::from_secs(30)));
    rig.open("ws://example.com/");

    rig.event(TransportEvent::TimerFired(TimerKind::Recv));

    let events = rig.handler.events();
    assert_eq!(events.recv_timeouts, 1);
    assert_eq!(events.closes, vec![(1006, vec![])]);
}

#[test]
fn close_grace_expiry_forces_shutdown() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/");

    rig.conn.close().expect("close");
    assert!(rig
        .transport
        .0
        .borrow()
        .timers
        .contains_key(&TimerKind::CloseGrace));

    rig.event(TransportEvent::TimerFired(TimerKind::CloseGrace));
    assert_eq!(rig.conn.state(), ConnState::Closed);
    assert!(rig.transport.0.borrow().closed);
    assert_eq!(rig.handler.events().closes, vec![(1006, vec![])]);
}

// ================== Rate limiting ==================

#[test]
fn read_rate_limit_throttles_and_resumes() {
    let limits = RateLimits {
        read_rate: 100,
        read_burst: 6,
        write_rate: 1_000_000,
        write_burst: 1_000_000,
    };
    let mut rig = Rig::new(Options::default().with_rate_limits(limits));
    rig.open("ws://example.com/");

    // A 12-byte wire image: 2 header bytes + 10 payload bytes.
    rig.feed(&server_frame(true, OpCode::Binary, &[7u8; 10]));

    // Only the 6-byte burst was consumed; the rest waits on the throttle
    // timer.
    assert!(rig.handler.events().messages.is_empty());
    assert!(rig
        .transport
        .0
        .borrow()
        .timers
        .contains_key(&TimerKind::ReadThrottle));

    // After 100 ms the bucket holds 10 more tokens.
    rig.advance_clock(Duration::from_millis(100));
    rig.event(TransportEvent::TimerFired(TimerKind::ReadThrottle));

    assert_eq!(
        rig.handler.events().messages,
        vec![(vec![7u8; 10], true)]
    );
}

#[test]
fn write_rate_limit_defers_output() {
    let limits = RateLimits {
        read_rate: 1_000_000,
        read_burst: 1_000_000,
        write_rate: 100,
        write_burst: 8,
    };
    let mut rig = Rig::new(Options::default().with_rate_limits(limits));
    rig.open("ws://example.com/");

    rig.conn
        .send_msg_ex(Bytes::from(vec![1u8; 20]), true)
        .expect("send");

    // Only the burst allowance went out.
    assert_eq!(rig.written().len(), 8);
    assert!(rig
        .transport
        .0
        .borrow()
        .timers
        .contains_key(&TimerKind::WriteThrottle));

    // The frame is 26 bytes (6 header + 20 payload) and the burst caps
    // each refill at 8, so the remainder takes a few throttle rounds.
    for _ in 0..4 {
        rig.advance_clock(Duration::from_millis(100));
        rig.event(TransportEvent::TimerFired(TimerKind::WriteThrottle));
    }

    let frames = client_frames(&rig.written());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].2, vec![1u8; 20]);
}

// ================== Write-side behavior ==================

#[test]
fn send_complete_reports_the_payload() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/");

    rig.conn
        .send_msg_ex(Bytes::from_static(b"owned buffer"), true)
        .expect("send");

    // The payload drained synchronously; the completion is delivered with
    // the next event.
    rig.event(TransportEvent::Writable);
    assert_eq!(
        rig.handler.events().send_completes,
        vec![b"owned buffer".to_vec()]
    );
}

#[test]
fn backpressured_output_resumes_on_writable() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/");

    rig.transport.0.borrow_mut().write_cap = Some(4);
    rig.conn
        .send_msg_ex(Bytes::from(vec![9u8; 40]), true)
        .expect("send");
    assert!(rig.written().len() < 46);

    rig.transport.0.borrow_mut().write_cap = None;
    rig.event(TransportEvent::Writable);

    let frames = client_frames(&rig.written());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0].2, vec![9u8; 40]);
}

#[test]
fn streaming_send_api_round_trip() {
    let mut rig = Rig::new(Options::default());
    rig.open("ws://example.com/");

    rig.conn.msg_begin(true).expect("begin");
    rig.conn.frame_data_begin(3).expect("frame");
    rig.conn.frame_data_send(&[1, 2]).expect("chunk");
    rig.conn.frame_data_send(&[3]).expect("chunk");
    rig.conn.msg_end().expect("end");

    let frames = client_frames(&rig.written());
    assert_eq!(
        frames,
        vec![
            (false, OpCode::Binary, vec![1, 2, 3]),
            (true, OpCode::Continuation, vec![]),
        ]
    );
}

// ================== Base integration ==================

#[test]
fn base_marshals_events_and_remote_sends() {
    let transport = MockTransport::new();
    let conn = Connection::new(Box::new(transport.clone()), Options::default());
    let recorder = Recorder::default();

    let mut base = Base::new();
    let id = base.register(conn, Box::new(recorder.clone()));
    let mailbox = base.mailbox();

    base.connection_mut(id)
        .expect("registered")
        .connect("ws://example.com/")
        .expect("connect");
    mailbox.post(id, TransportEvent::Connected);
    base.service();

    let request = String::from_utf8(transport.0.borrow().written.clone()).expect("ASCII");
    let key = request
        .lines()
        .find_map(|line| line.strip_prefix("Sec-WebSocket-Key: "))
        .expect("key")
        .to_owned();
    transport.0.borrow_mut().written.clear();

    let response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(&key)
    );
    transport
        .0
        .borrow_mut()
        .inbound
        .extend_from_slice(response.as_bytes());
    mailbox.post(id, TransportEvent::BytesAvailable);
    base.service();
    assert_eq!(recorder.events().connects, 1);

    // A remote handle on another thread marshals its send onto the
    // engine thread.
    let remote = base.remote(id);
    std::thread::spawn(move || {
        remote.send_msg("from afar");
    })
    .join()
    .expect("sender thread");
    base.service();

    let frames = client_frames(&transport.0.borrow().written);
    assert_eq!(frames, vec![(true, OpCode::Text, b"from afar".to_vec())]);

    // And a remote close runs the closing handshake.
    let remote = base.remote(id);
    remote.close();
    base.service();
    assert_eq!(
        base.connection(id).expect("still registered").state(),
        ConnState::Closing
    );
}
