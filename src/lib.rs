//! # yawe
//!
//! A client-side WebSocket protocol engine implementing [RFC 6455].
//!
//! The engine is **sans-io**: it never touches a socket, a DNS resolver or a
//! timer wheel itself. The application supplies a [`Transport`] — a buffered,
//! nonblocking byte pipe with deferred timers — and feeds the engine
//! [`TransportEvent`]s as they happen. The engine runs the protocol
//! (handshake, framing, masking, fragmentation, UTF-8 validation, ping/pong
//! and the closing handshake) and reports back through a [`Handler`], a
//! capability object with one method per protocol event.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────┐
//! │  Application                                   │
//! │  • implements Transport (sockets, TLS, timers) │
//! │  • implements Handler (protocol events)        │
//! └──────────────────┬─────────────────────────────┘
//!                    │ TransportEvent / Handler calls
//! ┌──────────────────▼─────────────────────────────┐
//! │  Base                                          │
//! │  • owns connections by ConnId                  │
//! │  • mailbox: marshals events from any thread    │
//! │  • service() / service_blocking() / quit()     │
//! └──────────────────┬─────────────────────────────┘
//! ┌──────────────────▼─────────────────────────────┐
//! │  Connection                                    │
//! │  • handshake, state machine, timers            │
//! │  • ping/pong bookkeeping, close negotiation    │
//! │  • read/write token-bucket rate limiting       │
//! └──────────────────┬─────────────────────────────┘
//! ┌──────────────────▼─────────────────────────────┐
//! │  Protocol layers                               │
//! │  • FrameParser: inbound byte state machine     │
//! │  • MessageAssembler: fragment reassembly, UTF-8│
//! │  • FrameWriter: masking, fragmentation, queue  │
//! └────────────────────────────────────────────────┘
//! ```
//!
//! ## Threading
//!
//! All engine state is single-threaded: everything belonging to one [`Base`]
//! must be driven from one thread (the engine thread). When transport events
//! originate elsewhere — a reactor thread, a GUI framework — the cloneable
//! [`Mailbox`] marshals them onto the engine thread as messages, and
//! [`RemoteHandle`] offers the two operations that are safe to call from any
//! thread: sending a message and requesting a close.
//!
//! Custom allocators are not part of the API; use `#[global_allocator]` if
//! the process needs one.
//!
//! [RFC 6455]: https://datatracker.ietf.org/doc/html/rfc6455

mod assembler;
mod base;
pub mod close;
mod conn;
pub mod frame;
mod handshake;
mod limit;
mod mask;
mod options;
mod parser;
mod utf8;
mod writer;

pub use base::{Base, ConnId, Mailbox, RemoteHandle};
pub use close::CloseCode;
pub use conn::{
    ConnState, Connection, Handler, PingResponse, TimerKind, Transport, TransportEvent,
};
pub use frame::{Frame, FrameHeader, OpCode};
pub use handshake::accept_key;
pub use mask::apply_mask;
pub use options::{DeliveryMode, Options, RateLimits, Timeouts, TlsMode};
pub use parser::ParseState;
pub use utf8::Utf8Validator;

use thiserror::Error;

/// A result type for WebSocket operations, using `WebSocketError` as the error type.
pub type Result<T> = std::result::Result<T, WebSocketError>;

/// Represents errors that can occur while running the WebSocket protocol.
///
/// The variants fall into a few broad groups:
///
/// - Handshake failures (bad status, bad headers, bad accept key)
/// - Protocol violations in received frames (reserved bits, bad opcodes,
///   broken continuation sequences, oversized control frames)
/// - Data validation errors (invalid UTF-8, messages over the inbound cap)
/// - Local usage errors (sending on a closed connection, misusing the
///   streaming send API)
/// - I/O and timer failures surfaced by the transport
///
/// Errors that correspond to an RFC 6455 close status expose it through
/// [`WebSocketError::close_code`].
#[derive(Error, Debug)]
pub enum WebSocketError {
    /// A text payload (or a close frame reason) is not valid UTF-8.
    /// RFC 6455 requires all text payloads to be well-formed UTF-8.
    #[error("Invalid UTF-8")]
    InvalidUTF8,

    /// A continuation frame arrived without an open message, or a new data
    /// frame arrived while a fragmented message was still in progress.
    #[error("Invalid continuation frame")]
    InvalidContinuationFrame,

    /// The handshake response status was not `101 Switching Protocols`.
    #[error("Invalid status code: {0}")]
    InvalidStatusCode(u16),

    /// The handshake response `Upgrade` header is missing or is not
    /// `websocket`.
    #[error("Invalid upgrade header")]
    InvalidUpgradeHeader,

    /// The handshake response `Connection` header is missing or does not
    /// contain the `upgrade` token.
    #[error("Invalid connection header")]
    InvalidConnectionHeader,

    /// The handshake response `Sec-WebSocket-Accept` does not match the
    /// digest of the key we sent.
    #[error("Invalid Sec-WebSocket-Accept header")]
    InvalidAcceptKey,

    /// Subprotocols were offered but the server picked none of them, or
    /// answered with one that was never offered.
    #[error("Invalid Sec-WebSocket-Protocol header")]
    InvalidSubprotocol,

    /// The handshake response head grew beyond the accepted bound without a
    /// terminating blank line.
    #[error("Handshake response headers too large")]
    HeadersTooLarge,

    /// The handshake response head is not parseable HTTP/1.1.
    #[error("Malformed handshake response")]
    MalformedResponse,

    /// Operation attempted on a connection that is closing or closed.
    #[error("Connection is closed")]
    ConnectionClosed,

    /// A close frame carried a 1-byte payload; close payloads are either
    /// empty or at least two bytes (the status code).
    #[error("Invalid close frame")]
    InvalidCloseFrame,

    /// A close frame carried a status code that may not appear on the wire.
    #[error("Invalid close code")]
    InvalidCloseCode,

    /// Reserved header bits were set on a received frame. No extension is
    /// ever negotiated, so RSV1-3 must be zero.
    #[error("Reserved bits are not zero")]
    ReservedBitsNotZero,

    /// A received frame used an opcode reserved for future use.
    #[error("Invalid opcode (byte={0})")]
    InvalidOpCode(u8),

    /// A received control frame had its FIN bit clear. Control frames must
    /// not be fragmented.
    #[error("Control frame must not be fragmented")]
    ControlFrameFragmented,

    /// A control frame payload exceeded 125 bytes.
    #[error("Control frame payload too large")]
    ControlFrameTooLarge,

    /// The server sent a masked frame. Server-to-client frames are never
    /// masked.
    #[error("Received masked frame from server")]
    MaskedServerFrame,

    /// A 64-bit extended payload length had its most significant bit set.
    #[error("Invalid 64-bit payload length")]
    InvalidPayloadLength,

    /// A received frame exceeded the configured inbound frame cap.
    #[error("Frame too large")]
    FrameTooLarge,

    /// An assembled message exceeded the configured inbound message cap.
    #[error("Message too large")]
    MessageTooBig,

    /// Only `ws://` and `wss://` URLs can be connected to.
    #[error("Invalid http scheme")]
    InvalidHttpScheme,

    /// The connection is not in the state the operation requires, e.g.
    /// calling `connect` twice.
    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    /// A streaming message is already in progress; finish it with `msg_end`
    /// before starting another send.
    #[error("A streaming message is already in progress")]
    SendInProgress,

    /// A streaming send operation was attempted with no open message.
    #[error("No streaming message in progress")]
    NoMessageInProgress,

    /// More frame data was submitted than was declared for the frame.
    #[error("Frame data exceeds the declared frame length")]
    FrameDataOverflow,

    /// The streaming message was ended while declared frame bytes were
    /// still unsent.
    #[error("Frame data missing for the declared frame length")]
    FrameDataIncomplete,

    /// A configured timer expired before the awaited event arrived.
    #[error("{0} timeout")]
    Timeout(TimerKind),

    /// Wraps errors from URL parsing when establishing a connection.
    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    /// Wraps I/O errors reported by the transport.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

impl WebSocketError {
    /// The RFC 6455 close status this error maps to, if any.
    ///
    /// Statuses 1005/1006/1015 are reporting-only and are never written to
    /// the wire; the connection state machine checks
    /// [`CloseCode::is_allowed`] before putting a status in a close frame.
    pub fn close_code(&self) -> Option<CloseCode> {
        use WebSocketError::*;
        match self {
            InvalidUTF8 => Some(CloseCode::Invalid),
            InvalidContinuationFrame
            | InvalidCloseFrame
            | InvalidCloseCode
            | ReservedBitsNotZero
            | InvalidOpCode(_)
            | ControlFrameFragmented
            | ControlFrameTooLarge
            | MaskedServerFrame
            | InvalidPayloadLength => Some(CloseCode::Protocol),
            InvalidStatusCode(_)
            | InvalidUpgradeHeader
            | InvalidConnectionHeader
            | InvalidAcceptKey
            | InvalidSubprotocol
            | HeadersTooLarge
            | MalformedResponse => Some(CloseCode::Protocol),
            FrameTooLarge | MessageTooBig => Some(CloseCode::Size),
            Timeout(_) => Some(CloseCode::Abnormal),
            IoError(_) => Some(CloseCode::Abnormal),
            _ => None,
        }
    }
}
