//! The connection state machine.
//!
//! A [`Connection`] owns one WebSocket session end to end: it drives the
//! opening handshake, feeds inbound bytes through the frame parser and
//! message assembler, runs the ping/pong and close protocols, requests
//! timers from the transport and applies the configured rate limits.
//!
//! The lifecycle is
//!
//! ```text
//! Idle → Connecting → Handshaking → Open → Closing → Closed
//! ```
//!
//! with shortcuts to `Closed` on transport failure, handshake failure and
//! fatal protocol errors. `on_close` fires exactly once per connection
//! with the effective status: 1000 for a clean close, the peer's code when
//! the peer initiated, 1002/1007/1009 for protocol failures, 1006 when the
//! transport died without a closing handshake.

use std::collections::VecDeque;
use std::io;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use url::Url;

use crate::assembler::MessageAssembler;
use crate::close::CloseCode;
use crate::frame::{Frame, FrameHeader, OpCode};
use crate::handshake::ClientHandshake;
use crate::limit::TokenBucket;
use crate::options::{Options, TlsMode, DEFAULT_CLOSE_GRACE, DEFAULT_CONNECT_TIMEOUT};
use crate::parser::{FrameEvent, FrameParser};
use crate::writer::{Drained, FrameWriter, OutQueue};
use crate::{DeliveryMode, Result, WebSocketError};

/// The connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Created, not yet connecting.
    Idle,
    /// Transport-level connect (DNS/TCP/TLS) in progress.
    Connecting,
    /// Transport up; upgrade request sent, awaiting the 101 response.
    Handshaking,
    /// Handshake complete; data may flow.
    Open,
    /// A close frame has been sent or received; winding down.
    Closing,
    /// Terminal. The connection object may be dropped.
    Closed,
}

/// The timers a connection asks its transport to run.
///
/// Timers are one-shot: setting a kind replaces any pending timer of the
/// same kind, and the transport reports expiry with
/// [`TransportEvent::TimerFired`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Bounds connect + handshake.
    Connect,
    /// Bounds receive-side silence.
    Recv,
    /// Bounds how long output may sit unflushed.
    Send,
    /// Bounds the wait for a pong answering an outstanding ping.
    Pong,
    /// Bounds the wait for the peer's half of the closing handshake.
    CloseGrace,
    /// Internal: resume reading once the read token bucket refills.
    ReadThrottle,
    /// Internal: resume writing once the write token bucket refills.
    WriteThrottle,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::Connect => "connect",
            TimerKind::Recv => "recv",
            TimerKind::Send => "send",
            TimerKind::Pong => "pong",
            TimerKind::CloseGrace => "close grace",
            TimerKind::ReadThrottle => "read throttle",
            TimerKind::WriteThrottle => "write throttle",
        }
    }
}

impl std::fmt::Display for TimerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events the transport reports to the engine.
#[derive(Debug)]
pub enum TransportEvent {
    /// The connect requested with [`Transport::connect`] completed.
    Connected,
    /// Bytes are waiting; the engine will pull them with
    /// [`Transport::read_available`].
    BytesAvailable,
    /// The transport can accept more output.
    Writable,
    /// The peer closed the byte stream, or a close requested with
    /// [`Transport::close`] completed.
    Closed,
    /// The transport failed (DNS, TCP, TLS, socket error).
    Error(io::Error),
    /// A timer set with [`Transport::set_timer`] expired.
    TimerFired(TimerKind),
}

/// The byte-transport the engine drives.
///
/// Implementations wrap a nonblocking socket (or any byte pipe), a timer
/// facility and a clock. All methods are called from the engine thread.
/// The contract:
///
/// - After [`connect`](Self::connect), deliver [`TransportEvent::Connected`]
///   (or `Error`).
/// - Deliver [`TransportEvent::BytesAvailable`] when the read side has
///   data; the engine pulls it with [`read_available`](Self::read_available).
/// - [`write`](Self::write) is nonblocking and may accept fewer bytes than
///   offered; deliver [`TransportEvent::Writable`] when more can be
///   written.
/// - After [`close`](Self::close), deliver [`TransportEvent::Closed`].
/// - Timers are one-shot; [`set_timer`](Self::set_timer) on a pending kind
///   reschedules it.
pub trait Transport {
    /// Begin resolving and connecting to `host:port`, wrapping in TLS
    /// according to `tls`.
    fn connect(&mut self, host: &str, port: u16, tls: TlsMode) -> io::Result<()>;

    /// Moves up to `max` buffered inbound bytes into `buf`, returning how
    /// many were moved. Zero means no bytes are currently available.
    fn read_available(&mut self, buf: &mut BytesMut, max: usize) -> io::Result<usize>;

    /// Writes as much of `data` as currently fits, returning the number of
    /// bytes accepted.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Tears the byte stream down.
    fn close(&mut self);

    /// Schedules (or reschedules) the one-shot timer `kind`.
    fn set_timer(&mut self, kind: TimerKind, after: Duration);

    /// Cancels the timer `kind` if pending.
    fn cancel_timer(&mut self, kind: TimerKind);

    /// The current time, used for rate-limit accounting.
    fn now(&self) -> Instant;
}

/// What to do with a received ping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResponse {
    /// The engine replies with a pong echoing the exact payload.
    Auto,
    /// The handler took care of it (or chose not to reply).
    Handled,
}

/// Protocol events, one method per event, all optional.
///
/// Handlers receive `&mut Connection` and may call its send and close
/// methods directly. Which of the message-delivery methods fire is decided
/// by the connection's [`DeliveryMode`]:
///
/// - `Message`: `on_message`
/// - `Frame`: `on_message_begin`, `on_frame`, `on_message_end`
/// - `Stream`: `on_message_begin`, `on_frame_begin`, `on_frame_data`,
///   `on_frame_end`, `on_message_end`
#[allow(unused_variables)]
pub trait Handler {
    /// The handshake completed; the connection is open.
    fn on_connect(&mut self, ws: &mut Connection) {}

    /// A complete message arrived (message mode).
    fn on_message(&mut self, ws: &mut Connection, payload: Bytes, binary: bool) {}

    /// The first frame of a new message arrived (frame and stream modes).
    fn on_message_begin(&mut self, ws: &mut Connection) {}

    /// A data frame completed, with its buffered payload (frame mode).
    fn on_frame(&mut self, ws: &mut Connection, header: &FrameHeader, payload: Bytes) {}

    /// The message's final frame completed (frame and stream modes).
    fn on_message_end(&mut self, ws: &mut Connection) {}

    /// A data frame header arrived (stream mode).
    fn on_frame_begin(&mut self, ws: &mut Connection, header: &FrameHeader) {}

    /// A chunk of data frame payload arrived (stream mode).
    fn on_frame_data(&mut self, ws: &mut Connection, chunk: Bytes) {}

    /// The current data frame completed (stream mode).
    fn on_frame_end(&mut self, ws: &mut Connection) {}

    /// A ping arrived. Return [`PingResponse::Auto`] (the default) to let
    /// the engine echo a pong, or reply yourself and return
    /// [`PingResponse::Handled`].
    fn on_ping(&mut self, ws: &mut Connection, payload: &[u8]) -> PingResponse {
        PingResponse::Auto
    }

    /// A pong arrived. Unsolicited pongs are delivered too.
    fn on_pong(&mut self, ws: &mut Connection, payload: &[u8]) {}

    /// The connection reached `Closed`. Fires exactly once, with the
    /// effective status and any reason the peer supplied.
    fn on_close(&mut self, ws: &mut Connection, code: CloseCode, reason: &[u8]) {}

    /// The output buffer fully drained while open.
    fn on_writable(&mut self, ws: &mut Connection) {}

    /// A payload passed to a send call has completely left the engine.
    fn on_send_complete(&mut self, ws: &mut Connection, payload: Bytes) {}

    /// An outstanding ping was not answered within the pong timeout.
    fn on_pong_timeout(&mut self, ws: &mut Connection) {}

    /// The receive timeout expired.
    fn on_recv_timeout(&mut self, ws: &mut Connection) {}

    /// The send timeout expired with output still unflushed.
    fn on_send_timeout(&mut self, ws: &mut Connection) {}

    /// The connect timeout expired before the handshake completed.
    fn on_connect_timeout(&mut self, ws: &mut Connection) {}

    /// A protocol or transport error occurred. The close path that
    /// follows is reported separately through `on_close`.
    fn on_error(&mut self, ws: &mut Connection, error: &WebSocketError) {}
}

/// Accumulates the payload of the control frame currently being read.
/// The parser has already bounded it to 125 bytes.
#[derive(Default)]
struct ControlCollector {
    buf: BytesMut,
}

impl ControlCollector {
    fn begin(&mut self) {
        self.buf.clear();
    }

    fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

/// One WebSocket session.
pub struct Connection {
    state: ConnState,
    transport: Box<dyn Transport>,
    opts: Options,

    host: String,
    port: u16,
    path: String,
    secure: bool,

    handshake: Option<ClientHandshake>,
    subprotocol: Option<String>,

    read_buf: BytesMut,
    parser: FrameParser,
    assembler: MessageAssembler,
    ctrl: ControlCollector,
    current_header: Option<FrameHeader>,

    writer: FrameWriter,
    out: OutQueue,

    pending_pongs: VecDeque<Bytes>,
    read_bucket: Option<TokenBucket>,
    write_bucket: Option<TokenBucket>,

    sent_close: bool,
    recv_close: bool,
    close_code: CloseCode,
    close_reason: Bytes,
    closed_emitted: bool,
    failed: bool,

    /// Completions produced by sends outside an event callback, delivered
    /// at the next event.
    deferred_completions: Vec<Bytes>,
    /// A write error hit outside an event callback, surfaced at the next
    /// event.
    deferred_error: Option<io::Error>,
}

impl Connection {
    pub fn new(transport: Box<dyn Transport>, opts: Options) -> Self {
        let parser = FrameParser::client(opts.max_message_size.map(|n| n as u64));
        let assembler = MessageAssembler::new(opts.delivery, opts.max_message_size);
        let writer = FrameWriter::new(opts.max_frame_size);
        let (read_bucket, write_bucket) = match opts.rate_limits {
            Some(limits) => (
                Some(TokenBucket::new(limits.read_rate, limits.read_burst)),
                Some(TokenBucket::new(limits.write_rate, limits.write_burst)),
            ),
            None => (None, None),
        };

        Self {
            state: ConnState::Idle,
            transport,
            opts,
            host: String::new(),
            port: 0,
            path: "/".to_owned(),
            secure: false,
            handshake: None,
            subprotocol: None,
            read_buf: BytesMut::new(),
            parser,
            assembler,
            ctrl: ControlCollector::default(),
            current_header: None,
            writer,
            out: OutQueue::new(),
            pending_pongs: VecDeque::new(),
            read_bucket,
            write_bucket,
            sent_close: false,
            recv_close: false,
            close_code: CloseCode::Abnormal,
            close_reason: Bytes::new(),
            closed_emitted: false,
            failed: false,
            deferred_completions: Vec::new(),
            deferred_error: None,
        }
    }

    // ================== Accessors ==================

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnState::Open
    }

    /// The URI this connection was pointed at.
    pub fn uri(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{scheme}://{}:{}{}", self.host, self.port, self.path)
    }

    /// The subprotocol the server selected, when any were offered.
    pub fn subprotocol(&self) -> Option<&str> {
        self.subprotocol.as_deref()
    }

    /// The header of the inbound frame currently being processed. Only
    /// meaningful inside frame/stream mode callbacks.
    pub fn current_frame(&self) -> Option<&FrameHeader> {
        self.current_header.as_ref()
    }

    // ================== Connecting ==================

    /// Starts connecting to a `ws://` or `wss://` URL.
    ///
    /// Kicks off DNS/TCP/TLS through the transport and starts the connect
    /// timer; the handshake is sent once the transport reports
    /// [`TransportEvent::Connected`].
    pub fn connect(&mut self, url: &str) -> Result<()> {
        if self.state != ConnState::Idle {
            return Err(WebSocketError::InvalidState(
                "connect requires an idle connection",
            ));
        }

        let url = Url::parse(url)?;
        let secure = match url.scheme() {
            "ws" => false,
            "wss" => true,
            _ => return Err(WebSocketError::InvalidHttpScheme),
        };
        let host = url
            .host_str()
            .ok_or(WebSocketError::UrlParseError(url::ParseError::EmptyHost))?
            .to_owned();
        let port = url
            .port_or_known_default()
            .unwrap_or(if secure { 443 } else { 80 });
        let path = {
            let p = &url[url::Position::BeforePath..];
            if p.is_empty() {
                "/".to_owned()
            } else {
                p.to_owned()
            }
        };

        let tls = match (secure, self.opts.tls) {
            (false, _) => TlsMode::Off,
            (true, TlsMode::AllowSelfSigned) => TlsMode::AllowSelfSigned,
            (true, _) => TlsMode::On,
        };

        tracing::debug!(host = %host, port, path = %path, "connecting");

        self.host = host;
        self.port = port;
        self.path = path;
        self.secure = secure;
        self.handshake = Some(ClientHandshake::new());
        self.state = ConnState::Connecting;

        let timeout = self
            .opts
            .timeouts
            .connect
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        self.transport.set_timer(TimerKind::Connect, timeout);

        let host = self.host.clone();
        self.transport.connect(&host, port, tls)?;
        Ok(())
    }

    // ================== Sending ==================

    fn ensure_open(&self) -> Result<()> {
        if self.state != ConnState::Open || self.sent_close {
            return Err(WebSocketError::ConnectionClosed);
        }
        Ok(())
    }

    /// Sends a UTF-8 text message.
    pub fn send_msg(&mut self, text: &str) -> Result<()> {
        self.send_msg_ex(Bytes::copy_from_slice(text.as_bytes()), false)
    }

    /// Sends a message, fragmenting it when it exceeds the configured
    /// maximum frame size. The payload is reported back through
    /// `on_send_complete` once its last byte leaves the engine.
    ///
    /// Outbound text is not re-validated: RFC 6455 obliges the caller to
    /// send well-formed UTF-8.
    pub fn send_msg_ex(&mut self, payload: impl Into<Bytes>, binary: bool) -> Result<()> {
        self.ensure_open()?;
        self.writer
            .send_message(&mut self.out, payload.into(), binary)?;
        self.flush_detached();
        Ok(())
    }

    /// Opens a streaming message; frames are declared and filled with
    /// [`frame_data_begin`](Self::frame_data_begin) /
    /// [`frame_data_send`](Self::frame_data_send).
    pub fn msg_begin(&mut self, binary: bool) -> Result<()> {
        self.ensure_open()?;
        self.writer.msg_begin(binary)
    }

    /// Declares the next frame's total payload length and sends its
    /// header.
    pub fn frame_data_begin(&mut self, len: u64) -> Result<()> {
        self.ensure_open()?;
        self.writer.frame_begin(&mut self.out, len)?;
        self.flush_detached();
        Ok(())
    }

    /// Sends a chunk of the declared frame; the aggregate must not exceed
    /// the declared length.
    pub fn frame_data_send(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        self.writer.frame_data(&mut self.out, data)?;
        self.flush_detached();
        Ok(())
    }

    /// Ends the streaming message with a zero-length final continuation.
    pub fn msg_end(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.writer.msg_end(&mut self.out)?;
        self.flush_detached();
        Ok(())
    }

    /// Sends a ping with no payload.
    pub fn send_ping(&mut self) -> Result<()> {
        self.send_ping_ex(Bytes::new())
    }

    /// Sends a ping. The payload is remembered until the matching pong
    /// arrives; if a pong timeout is configured the pong timer starts (or
    /// refreshes) now.
    pub fn send_ping_ex(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.ensure_open()?;
        let payload = payload.into();
        self.writer
            .control(&mut self.out, Frame::ping(payload.clone()))?;
        self.pending_pongs.push_back(payload);
        if let Some(timeout) = self.opts.timeouts.pong {
            self.transport.set_timer(TimerKind::Pong, timeout);
        }
        self.flush_detached();
        Ok(())
    }

    /// Sends a pong. Per RFC 6455 a pong answering a ping must carry the
    /// ping's exact payload.
    pub fn send_pong(&mut self, payload: impl Into<Bytes>) -> Result<()> {
        self.ensure_open()?;
        self.writer
            .control(&mut self.out, Frame::pong(payload.into()))?;
        self.flush_detached();
        Ok(())
    }

    // ================== Closing ==================

    /// Starts a clean close with status 1000.
    pub fn close(&mut self) -> Result<()> {
        self.close_with_reason(CloseCode::Normal, "")
    }

    /// Starts a clean close with the given status.
    pub fn close_with_status(&mut self, code: CloseCode) -> Result<()> {
        self.close_with_reason(code, "")
    }

    /// Starts a clean close with a status and a reason (at most 123 bytes
    /// of UTF-8).
    ///
    /// At most one close frame is ever sent; repeated calls are no-ops.
    /// Data sends after a local close fail with
    /// [`WebSocketError::ConnectionClosed`].
    pub fn close_with_reason(&mut self, code: CloseCode, reason: &str) -> Result<()> {
        match self.state {
            ConnState::Open | ConnState::Closing => {}
            ConnState::Closed => return Ok(()),
            _ => {
                self.close_immediately();
                return Ok(());
            }
        }
        if self.sent_close {
            return Ok(());
        }
        if !code.is_allowed() {
            return Err(WebSocketError::InvalidCloseCode);
        }
        if reason.len() > 123 {
            return Err(WebSocketError::ControlFrameTooLarge);
        }

        tracing::info!(code = u16::from(code), reason, "closing");
        self.writer
            .control(&mut self.out, Frame::close(code, reason))?;
        self.sent_close = true;
        self.close_code = code;
        self.close_reason = Bytes::copy_from_slice(reason.as_bytes());
        self.state = ConnState::Closing;
        self.start_close_grace();
        self.flush_detached();
        Ok(())
    }

    /// Tears the transport down without a closing handshake.
    pub fn close_immediately(&mut self) {
        if self.state == ConnState::Closed {
            return;
        }
        tracing::debug!("closing transport immediately");
        self.cancel_all_timers();
        if !self.recv_close {
            self.close_code = CloseCode::Abnormal;
        }
        self.state = ConnState::Closed;
        self.transport.close();
    }

    // ================== Event handling ==================

    /// Feeds one transport event through the engine. All protocol events
    /// it produces are dispatched to `handler` before this returns.
    pub fn handle_event(&mut self, handler: &mut dyn Handler, event: TransportEvent) {
        // Completions and errors from sends made outside a callback.
        for payload in std::mem::take(&mut self.deferred_completions) {
            handler.on_send_complete(self, payload);
        }
        if let Some(err) = self.deferred_error.take() {
            self.on_transport_error(handler, err);
        }

        match event {
            TransportEvent::Connected => self.on_connected(handler),
            TransportEvent::BytesAvailable => self.on_readable(handler),
            TransportEvent::Writable => self.flush(handler),
            TransportEvent::Closed => self.on_transport_closed(handler),
            TransportEvent::Error(err) => self.on_transport_error(handler, err),
            TransportEvent::TimerFired(kind) => self.on_timer(handler, kind),
        }
    }

    fn on_connected(&mut self, handler: &mut dyn Handler) {
        if self.state != ConnState::Connecting {
            tracing::warn!(state = ?self.state, "unexpected connected event");
            return;
        }
        self.state = ConnState::Handshaking;

        let request = match &self.handshake {
            Some(hs) => hs.request(
                &self.host_header(),
                &self.path,
                self.opts.origin.as_deref(),
                &self.opts.subprotocols,
                &self.opts.extra_headers,
            ),
            None => return,
        };
        tracing::debug!(uri = %self.uri(), "transport connected, sending handshake");

        if let Some(recv) = self.opts.timeouts.recv {
            self.transport.set_timer(TimerKind::Recv, recv);
        }

        self.writer.raw(&mut self.out, request.as_bytes());
        self.flush(handler);
    }

    fn on_readable(&mut self, handler: &mut dyn Handler) {
        if self.failed || matches!(self.state, ConnState::Idle | ConnState::Closed) {
            return;
        }

        let now = self.transport.now();
        let mut budget = usize::MAX;
        if matches!(self.state, ConnState::Open | ConnState::Closing) {
            if let Some(bucket) = self.read_bucket.as_mut() {
                let available = bucket.available(now);
                if available == 0 {
                    let delay = bucket.delay_for(now);
                    self.transport.set_timer(TimerKind::ReadThrottle, delay);
                    return;
                }
                budget = usize::try_from(available).unwrap_or(usize::MAX);
            }
        }

        let n = match self.transport.read_available(&mut self.read_buf, budget) {
            Ok(n) => n,
            Err(err) => {
                self.on_transport_error(handler, err);
                return;
            }
        };
        if n == 0 {
            return;
        }
        tracing::trace!(bytes = n, "read from transport");

        if matches!(self.state, ConnState::Open | ConnState::Closing) {
            if let Some(bucket) = self.read_bucket.as_mut() {
                bucket.consume(n as u64);
                // The allowance may have been the limit; poll again after
                // a refill in case the transport still holds bytes.
                if n == budget {
                    let delay = bucket.delay_for(now);
                    self.transport
                        .set_timer(TimerKind::ReadThrottle, delay.max(Duration::from_millis(1)));
                }
            }
        }

        if let Some(recv) = self.opts.timeouts.recv {
            self.transport.set_timer(TimerKind::Recv, recv);
        }

        self.process_read_buf(handler);
    }

    fn process_read_buf(&mut self, handler: &mut dyn Handler) {
        loop {
            match self.state {
                ConnState::Handshaking => {
                    let hs = match &self.handshake {
                        Some(hs) => hs,
                        None => return,
                    };
                    match hs.poll_response(&mut self.read_buf, &self.opts.subprotocols) {
                        Ok(None) => return,
                        Ok(Some(negotiation)) => {
                            self.handshake = None;
                            self.subprotocol = negotiation.subprotocol;
                            self.transport.cancel_timer(TimerKind::Connect);
                            self.state = ConnState::Open;
                            tracing::info!(
                                uri = %self.uri(),
                                subprotocol = ?self.subprotocol,
                                "connection open",
                            );
                            handler.on_connect(self);
                        }
                        Err(err) => {
                            self.fail_handshake(handler, err);
                            return;
                        }
                    }
                }
                ConnState::Open | ConnState::Closing => {
                    match self.parser.poll(&mut self.read_buf) {
                        Ok(Some(event)) => {
                            if let Err(err) = self.on_frame_event(handler, event) {
                                self.protocol_failure(handler, err);
                                return;
                            }
                        }
                        Ok(None) => return,
                        Err(err) => {
                            self.protocol_failure(handler, err);
                            return;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn on_frame_event(&mut self, handler: &mut dyn Handler, event: FrameEvent) -> Result<()> {
        match event {
            FrameEvent::Header(header) => {
                if header.opcode.is_control() {
                    self.ctrl.begin();
                } else {
                    let message_begin = self.assembler.begin_frame(&header);
                    match self.opts.delivery {
                        DeliveryMode::Message => {}
                        DeliveryMode::Frame => {
                            if message_begin {
                                handler.on_message_begin(self);
                            }
                        }
                        DeliveryMode::Stream => {
                            if message_begin {
                                handler.on_message_begin(self);
                            }
                            handler.on_frame_begin(self, &header);
                        }
                    }
                }
                self.current_header = Some(header);
            }
            FrameEvent::Data(chunk) => {
                let is_control = match &self.current_header {
                    Some(header) => header.opcode.is_control(),
                    None => return Ok(()),
                };
                if is_control {
                    self.ctrl.extend(&chunk);
                } else if let Some(chunk) = self.assembler.frame_data(chunk)? {
                    handler.on_frame_data(self, chunk);
                }
            }
            FrameEvent::End => {
                let header = match self.current_header.take() {
                    Some(header) => header,
                    None => return Ok(()),
                };
                if header.opcode.is_control() {
                    let payload = self.ctrl.take();
                    self.on_control(handler, header.opcode, payload)?;
                } else {
                    let finish = self.assembler.end_frame(header.fin)?;
                    match self.opts.delivery {
                        DeliveryMode::Message => {
                            if let Some(message) = finish.message {
                                handler.on_message(self, message, finish.binary);
                            }
                        }
                        DeliveryMode::Frame => {
                            if let Some(payload) = finish.frame_payload {
                                handler.on_frame(self, &header, payload);
                            }
                            if finish.message_end {
                                handler.on_message_end(self);
                            }
                        }
                        DeliveryMode::Stream => {
                            handler.on_frame_end(self);
                            if finish.message_end {
                                handler.on_message_end(self);
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn on_control(
        &mut self,
        handler: &mut dyn Handler,
        opcode: OpCode,
        payload: Bytes,
    ) -> Result<()> {
        match opcode {
            OpCode::Ping => {
                tracing::debug!(len = payload.len(), "ping received");
                if self.state == ConnState::Open {
                    match handler.on_ping(self, &payload) {
                        PingResponse::Auto => self.send_pong(payload)?,
                        PingResponse::Handled => {}
                    }
                }
            }
            OpCode::Pong => {
                tracing::debug!(len = payload.len(), "pong received");
                if let Some(pos) = self.pending_pongs.iter().position(|p| *p == payload) {
                    self.pending_pongs.remove(pos);
                }
                if self.pending_pongs.is_empty() {
                    self.transport.cancel_timer(TimerKind::Pong);
                } else if let Some(timeout) = self.opts.timeouts.pong {
                    self.transport.set_timer(TimerKind::Pong, timeout);
                }
                handler.on_pong(self, &payload);
            }
            OpCode::Close => self.on_close_frame(handler, payload)?,
            _ => unreachable!("data opcode routed to control path"),
        }
        Ok(())
    }

    fn on_close_frame(&mut self, handler: &mut dyn Handler, payload: Bytes) -> Result<()> {
        let (code, reason) = match payload.len() {
            0 => (CloseCode::Normal, Bytes::new()),
            1 => return Err(WebSocketError::InvalidCloseFrame),
            _ => {
                let code = CloseCode::from(u16::from_be_bytes([payload[0], payload[1]]));
                if !code.is_allowed() {
                    return Err(WebSocketError::InvalidCloseCode);
                }
                let reason = payload.slice(2..);
                if std::str::from_utf8(&reason).is_err() {
                    return Err(WebSocketError::InvalidUTF8);
                }
                (code, reason)
            }
        };

        tracing::info!(code = u16::from(code), "close frame received");
        self.recv_close = true;
        self.close_code = code;
        self.close_reason = reason;
        self.state = ConnState::Closing;

        if !self.sent_close {
            // Echo the peer's close payload byte for byte; an empty close
            // is echoed empty.
            self.writer
                .control(&mut self.out, Frame::close_raw(payload))?;
            self.sent_close = true;
            self.start_close_grace();
        }

        self.flush(handler);
        Ok(())
    }

    fn on_transport_closed(&mut self, handler: &mut dyn Handler) {
        tracing::debug!(state = ?self.state, "transport closed");
        // An EOF without a closing handshake is abnormal (1006), unless a
        // protocol failure already decided the effective status.
        if !self.recv_close && !self.failed && self.state != ConnState::Closed {
            self.close_code = CloseCode::Abnormal;
        }
        self.to_closed(handler);
    }

    fn on_transport_error(&mut self, handler: &mut dyn Handler, err: io::Error) {
        tracing::error!(error = %err, "transport error");
        let err = WebSocketError::from(err);
        handler.on_error(self, &err);
        if !self.recv_close {
            self.close_code = CloseCode::Abnormal;
        }
        self.abort(handler);
    }

    fn on_timer(&mut self, handler: &mut dyn Handler, kind: TimerKind) {
        match kind {
            TimerKind::Connect => {
                if matches!(self.state, ConnState::Connecting | ConnState::Handshaking) {
                    tracing::warn!(uri = %self.uri(), "connect timed out");
                    handler.on_connect_timeout(self);
                    self.timeout_abort(handler);
                }
            }
            TimerKind::Recv => {
                if matches!(
                    self.state,
                    ConnState::Handshaking | ConnState::Open | ConnState::Closing
                ) {
                    tracing::warn!("receive timed out");
                    handler.on_recv_timeout(self);
                    self.timeout_abort(handler);
                }
            }
            TimerKind::Send => {
                if !self.out.is_empty() {
                    tracing::warn!(pending = self.out.pending_bytes(), "send timed out");
                    handler.on_send_timeout(self);
                    self.timeout_abort(handler);
                }
            }
            TimerKind::Pong => {
                if !self.pending_pongs.is_empty() {
                    tracing::warn!(outstanding = self.pending_pongs.len(), "pong timed out");
                    self.pending_pongs.clear();
                    handler.on_pong_timeout(self);
                }
            }
            TimerKind::CloseGrace => {
                if self.state == ConnState::Closing {
                    tracing::warn!("peer did not finish the closing handshake in time");
                    if !self.recv_close {
                        self.close_code = CloseCode::Abnormal;
                    }
                    self.abort(handler);
                }
            }
            TimerKind::ReadThrottle => self.on_readable(handler),
            TimerKind::WriteThrottle => self.flush(handler),
        }
    }

    // ================== Internals ==================

    fn host_header(&self) -> String {
        let default = if self.secure { 443 } else { 80 };
        if self.port == default {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn start_close_grace(&mut self) {
        let grace = self
            .opts
            .timeouts
            .close_grace
            .unwrap_or(DEFAULT_CLOSE_GRACE);
        self.transport.set_timer(TimerKind::CloseGrace, grace);
    }

    fn cancel_all_timers(&mut self) {
        for kind in [
            TimerKind::Connect,
            TimerKind::Recv,
            TimerKind::Send,
            TimerKind::Pong,
            TimerKind::CloseGrace,
            TimerKind::ReadThrottle,
            TimerKind::WriteThrottle,
        ] {
            self.transport.cancel_timer(kind);
        }
    }

    /// Drains the output queue within the write allowance and maintains
    /// the send/throttle timers. Completion and close bookkeeping is left
    /// to the caller.
    fn drain_out(&mut self) -> io::Result<Drained> {
        let now = self.transport.now();
        let mut budget = usize::MAX;
        if matches!(self.state, ConnState::Open | ConnState::Closing) {
            if let Some(bucket) = self.write_bucket.as_mut() {
                let available = bucket.available(now);
                if available == 0 {
                    let delay = bucket.delay_for(now);
                    self.transport.set_timer(TimerKind::WriteThrottle, delay);
                    return Ok(Drained::default());
                }
                budget = usize::try_from(available).unwrap_or(usize::MAX);
            }
        }

        let transport = &mut self.transport;
        let drained = self.out.drain(budget, &mut |chunk| transport.write(chunk))?;

        if drained.written > 0 {
            tracing::trace!(bytes = drained.written, "wrote to transport");
            if matches!(self.state, ConnState::Open | ConnState::Closing) {
                if let Some(bucket) = self.write_bucket.as_mut() {
                    bucket.consume(drained.written as u64);
                }
            }
        }

        if self.out.is_empty() {
            self.transport.cancel_timer(TimerKind::Send);
        } else {
            if let Some(timeout) = self.opts.timeouts.send {
                self.transport.set_timer(TimerKind::Send, timeout);
            }
            if budget != usize::MAX && drained.written == budget {
                // Out of allowance with bytes still queued.
                let delay = self
                    .write_bucket
                    .as_mut()
                    .map(|b| b.delay_for(now))
                    .unwrap_or(Duration::ZERO);
                self.transport
                    .set_timer(TimerKind::WriteThrottle, delay.max(Duration::from_millis(1)));
            }
        }

        Ok(drained)
    }

    fn flush(&mut self, handler: &mut dyn Handler) {
        if matches!(self.state, ConnState::Idle | ConnState::Closed) {
            return;
        }

        match self.drain_out() {
            Ok(drained) => {
                for payload in drained.completions {
                    handler.on_send_complete(self, payload);
                }
                if self.state == ConnState::Open && drained.written > 0 && self.out.is_empty() {
                    handler.on_writable(self);
                }
                self.maybe_finish_close(handler);
            }
            Err(err) => self.on_transport_error(handler, err),
        }
    }

    /// Flush used by the send APIs, where no handler is on the stack;
    /// completions and errors are deferred to the next event.
    fn flush_detached(&mut self) {
        if matches!(self.state, ConnState::Idle | ConnState::Closed) {
            return;
        }
        match self.drain_out() {
            Ok(drained) => self.deferred_completions.extend(drained.completions),
            Err(err) => {
                if self.deferred_error.is_none() {
                    self.deferred_error = Some(err);
                }
            }
        }
    }

    /// The closing handshake is complete once both close frames are
    /// exchanged and our output has drained.
    fn maybe_finish_close(&mut self, handler: &mut dyn Handler) {
        if self.state == ConnState::Closing
            && self.sent_close
            && self.recv_close
            && self.out.is_empty()
        {
            tracing::debug!("closing handshake complete");
            self.transport.close();
            self.to_closed(handler);
        }
    }

    fn fail_handshake(&mut self, handler: &mut dyn Handler, err: WebSocketError) {
        tracing::warn!(error = %err, "handshake failed");
        handler.on_error(self, &err);
        self.close_code = err.close_code().unwrap_or(CloseCode::Protocol);
        self.abort(handler);
    }

    fn protocol_failure(&mut self, handler: &mut dyn Handler, err: WebSocketError) {
        tracing::warn!(error = %err, "protocol failure");
        self.failed = true;
        handler.on_error(self, &err);

        let code = err.close_code().unwrap_or(CloseCode::Protocol);
        self.close_code = code;
        self.close_reason = Bytes::new();

        let can_negotiate = matches!(self.state, ConnState::Open | ConnState::Closing)
            && !self.sent_close
            && code.is_allowed();
        if can_negotiate {
            if self.writer.control(&mut self.out, Frame::close(code, "")).is_ok() {
                self.sent_close = true;
                self.state = ConnState::Closing;
                self.start_close_grace();
                self.flush(handler);
                return;
            }
        }
        self.abort(handler);
    }

    fn timeout_abort(&mut self, handler: &mut dyn Handler) {
        if !self.recv_close {
            self.close_code = CloseCode::Abnormal;
        }
        self.abort(handler);
    }

    fn abort(&mut self, handler: &mut dyn Handler) {
        self.transport.close();
        self.to_closed(handler);
    }

    fn to_closed(&mut self, handler: &mut dyn Handler) {
        if self.closed_emitted {
            return;
        }
        self.closed_emitted = true;
        self.cancel_all_timers();
        self.state = ConnState::Closed;
        tracing::info!(code = u16::from(self.close_code), "connection closed");
        let code = self.close_code;
        let reason = self.close_reason.clone();
        handler.on_close(self, code, &reason);
    }
}
