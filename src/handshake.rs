//! The opening HTTP/1.1 upgrade handshake, client side.
//!
//! The request is assembled as raw bytes and handed to the transport as
//! soon as it connects; the response head is accumulated until the blank
//! line and validated per RFC 6455 §4.2.2: status 101, `Upgrade:
//! websocket`, a `Connection` header containing the `upgrade` token, a
//! `Sec-WebSocket-Accept` matching our key, and — when subprotocols were
//! offered — a `Sec-WebSocket-Protocol` naming one of the offers.

use bytes::{Buf, BytesMut};
use sha1::{Digest, Sha1};

use crate::{Result, WebSocketError};

/// The GUID every WebSocket server appends to the client key before
/// hashing, RFC 6455 §1.3.
const ACCEPT_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the response head we are willing to buffer.
const MAX_RESPONSE_HEAD: usize = 16 * 1024;

/// Generates a fresh `Sec-WebSocket-Key`: base64 of 16 random bytes.
pub(crate) fn generate_key() -> String {
    use base64::prelude::*;
    let input: [u8; 16] = rand::random();
    BASE64_STANDARD.encode(input)
}

/// Computes the `Sec-WebSocket-Accept` value for a client key:
/// `base64(SHA1(key + GUID))`.
pub fn accept_key(key: &str) -> String {
    use base64::prelude::*;
    let mut digest = Sha1::new();
    digest.update(key.as_bytes());
    digest.update(ACCEPT_GUID.as_bytes());
    BASE64_STANDARD.encode(digest.finalize())
}

/// What the server agreed to during the upgrade.
#[derive(Debug, Default)]
pub(crate) struct Negotiation {
    /// The subprotocol the server selected, when any were offered.
    pub subprotocol: Option<String>,
}

/// Client-side handshake state: the key we sent and what we offered.
pub(crate) struct ClientHandshake {
    key: String,
}

impl ClientHandshake {
    pub fn new() -> Self {
        Self {
            key: generate_key(),
        }
    }

    #[cfg(test)]
    pub fn with_key(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }

    /// Assembles the upgrade request.
    pub fn request(
        &self,
        host: &str,
        path: &str,
        origin: Option<&str>,
        subprotocols: &[String],
        extra_headers: &[(String, String)],
    ) -> String {
        use std::fmt::Write;

        let mut req = String::with_capacity(256);
        let _ = write!(req, "GET {path} HTTP/1.1\r\n");
        let _ = write!(req, "Host: {host}\r\n");
        req.push_str("Upgrade: websocket\r\n");
        req.push_str("Connection: Upgrade\r\n");
        let _ = write!(req, "Sec-WebSocket-Key: {}\r\n", self.key);
        req.push_str("Sec-WebSocket-Version: 13\r\n");

        if let Some(origin) = origin {
            let _ = write!(req, "Origin: {origin}\r\n");
        }
        if !subprotocols.is_empty() {
            let _ = write!(req, "Sec-WebSocket-Protocol: {}\r\n", subprotocols.join(", "));
        }
        for (name, value) in extra_headers {
            let _ = write!(req, "{name}: {value}\r\n");
        }

        req.push_str("\r\n");
        req
    }

    /// Consumes the response head from `buf` once it is complete.
    ///
    /// Returns `Ok(None)` until the terminating blank line has arrived.
    /// On success the head (including the blank line) is drained from
    /// `buf`; any bytes after it — the first frames of the session — are
    /// left in place for the frame parser.
    pub fn poll_response(
        &self,
        buf: &mut BytesMut,
        offered: &[String],
    ) -> Result<Option<Negotiation>> {
        let end = match find_head_end(buf) {
            Some(end) => end,
            None => {
                if buf.len() > MAX_RESPONSE_HEAD {
                    return Err(WebSocketError::HeadersTooLarge);
                }
                return Ok(None);
            }
        };

        let head =
            std::str::from_utf8(&buf[..end]).map_err(|_| WebSocketError::MalformedResponse)?;
        tracing::debug!(bytes = end, "handshake response head complete");
        let negotiation = self.validate(head, offered)?;
        buf.advance(end);
        Ok(Some(negotiation))
    }

    fn validate(&self, head: &str, offered: &[String]) -> Result<Negotiation> {
        let mut lines = head.split("\r\n");
        let status_line = lines.next().ok_or(WebSocketError::MalformedResponse)?;

        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or("");
        if version != "HTTP/1.1" && version != "HTTP/1.0" {
            return Err(WebSocketError::MalformedResponse);
        }
        let status: u16 = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or(WebSocketError::MalformedResponse)?;
        if status != 101 {
            return Err(WebSocketError::InvalidStatusCode(status));
        }

        let mut upgrade_ok = false;
        let mut connection_ok = false;
        let mut accept: Option<&str> = None;
        let mut protocol: Option<&str> = None;

        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or(WebSocketError::MalformedResponse)?;
            let name = name.trim();
            let value = value.trim();

            if name.eq_ignore_ascii_case("upgrade") {
                upgrade_ok = value.eq_ignore_ascii_case("websocket");
            } else if name.eq_ignore_ascii_case("connection") {
                connection_ok = value
                    .split(',')
                    .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
            } else if name.eq_ignore_ascii_case("sec-websocket-accept") {
                accept = Some(value);
            } else if name.eq_ignore_ascii_case("sec-websocket-protocol") {
                protocol = Some(value);
            }
        }

        if !upgrade_ok {
            return Err(WebSocketError::InvalidUpgradeHeader);
        }
        if !connection_ok {
            return Err(WebSocketError::InvalidConnectionHeader);
        }
        if accept != Some(accept_key(&self.key).as_str()) {
            return Err(WebSocketError::InvalidAcceptKey);
        }

        let subprotocol = if offered.is_empty() {
            None
        } else {
            // The server must answer with exactly one of the offers.
            let selected = protocol.ok_or(WebSocketError::InvalidSubprotocol)?;
            if !offered.iter().any(|p| p == selected) {
                return Err(WebSocketError::InvalidSubprotocol);
            }
            Some(selected.to_owned())
        };

        Ok(Negotiation { subprotocol })
    }
}

/// Position just past the `\r\n\r\n` terminating the head, if present.
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}
