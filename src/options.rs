//! Per-connection configuration.

use std::time::Duration;

/// Default connect timeout applied when none is configured.
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default grace period for the peer's half of the closing handshake.
pub(crate) const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(10);

/// How the transport should secure the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
    /// Plain TCP.
    #[default]
    Off,
    /// TLS with certificate verification.
    On,
    /// TLS, accepting self-signed certificates. Useful against test
    /// servers; do not use in production.
    AllowSelfSigned,
}

/// How inbound data reaches the [`Handler`](crate::Handler).
///
/// Exactly one mode is active per connection, chosen at configuration
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Buffer fragments and deliver whole messages through `on_message`.
    #[default]
    Message,
    /// Deliver each data frame's payload through `on_frame`, bracketed by
    /// `on_message_begin` / `on_message_end`.
    Frame,
    /// Deliver payload chunks as they arrive through `on_frame_begin` /
    /// `on_frame_data` / `on_frame_end`, without copying or buffering.
    Stream,
}

/// Transport I/O rate limits, bytes and bytes per second.
#[derive(Debug, Clone, Copy)]
pub struct RateLimits {
    pub read_rate: u64,
    pub read_burst: u64,
    pub write_rate: u64,
    pub write_burst: u64,
}

/// The connection's timers. `None` disables a timer, except `connect` and
/// `close_grace` which fall back to built-in defaults.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    /// Time allowed for DNS + TCP + TLS + handshake completion.
    pub connect: Option<Duration>,
    /// Maximum quiet time on the receive side while open.
    pub recv: Option<Duration>,
    /// Maximum time the output may sit unflushed.
    pub send: Option<Duration>,
    /// Time allowed for a pong to answer an outstanding ping.
    pub pong: Option<Duration>,
    /// Time allowed for the peer's close frame / TCP FIN after ours.
    pub close_grace: Option<Duration>,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Some(DEFAULT_CONNECT_TIMEOUT),
            recv: None,
            send: None,
            pong: None,
            close_grace: Some(DEFAULT_CLOSE_GRACE),
        }
    }
}

/// Configuration for a [`Connection`](crate::Connection).
///
/// ```
/// use std::time::Duration;
/// use yawe::{DeliveryMode, Options};
///
/// let opts = Options::default()
///     .with_max_frame_size(64 * 1024)
///     .with_origin("https://example.com")
///     .with_subprotocol("chat")
///     .with_pong_timeout(Duration::from_secs(5))
///     .with_delivery(DeliveryMode::Message);
/// ```
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Outbound fragmentation threshold. Messages above this many bytes
    /// are split into continuation frames; `None` sends messages whole.
    pub max_frame_size: Option<usize>,
    /// Inbound cap on an assembled message. Exceeding it closes the
    /// connection with status 1009.
    pub max_message_size: Option<usize>,
    /// TLS behavior requested from the transport.
    pub tls: TlsMode,
    pub timeouts: Timeouts,
    /// Token-bucket limits on transport reads and writes.
    pub rate_limits: Option<RateLimits>,
    /// `Origin` header for the handshake.
    pub origin: Option<String>,
    /// Additional handshake request headers, sent in order.
    pub extra_headers: Vec<(String, String)>,
    /// Subprotocols to offer, in preference order.
    pub subprotocols: Vec<String>,
    pub delivery: DeliveryMode,
}

impl Options {
    pub fn with_max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = if size == 0 { None } else { Some(size) };
        self
    }

    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = if size == 0 { None } else { Some(size) };
        self
    }

    pub fn with_tls(mut self, tls: TlsMode) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Adds a header to the handshake request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_headers.push((name.into(), value.into()));
        self
    }

    /// Offers a subprotocol; call repeatedly in preference order.
    pub fn with_subprotocol(mut self, name: impl Into<String>) -> Self {
        self.subprotocols.push(name.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect = Some(timeout);
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.recv = Some(timeout);
        self
    }

    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.send = Some(timeout);
        self
    }

    pub fn with_pong_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.pong = Some(timeout);
        self
    }

    pub fn with_rate_limits(mut self, limits: RateLimits) -> Self {
        self.rate_limits = Some(limits);
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }
}
