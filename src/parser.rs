//! The inbound frame parser: a byte-driven state machine over the read
//! buffer.
//!
//! The parser walks `FirstByte → SecondByte → [ExtendedLen16 |
//! ExtendedLen64] → [MaskingKey] → Payload → FrameEnd` and emits three
//! kinds of events: a decoded header, payload chunks bounded by whatever
//! the transport buffer holds, and a frame-end marker. Payload is never
//! accumulated here; buffering policy belongs to the assembler.
//!
//! Protocol violations are detected as early as the offending byte:
//! nonzero RSV bits, reserved opcodes, masked server frames, fragmented or
//! oversized control frames, a 64-bit length with the high bit set, and
//! broken continuation sequences.

use bytes::{Buf, Bytes, BytesMut};

use crate::frame::{FrameHeader, OpCode};
use crate::mask::apply_mask_offset;
use crate::{Result, WebSocketError};

/// Where the parser currently is inside a frame.
///
/// [`ParseState::as_str`] gives a stable human-readable name for
/// diagnostics and log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// Expecting FIN, RSV1-3 and the opcode.
    FirstByte,
    /// Expecting the MASK bit and the 7-bit length.
    SecondByte,
    /// Expecting a 16-bit big-endian extended length.
    ExtendedLen16,
    /// Expecting a 64-bit big-endian extended length.
    ExtendedLen64,
    /// Expecting a 4-byte masking key.
    MaskingKey,
    /// Consuming payload bytes.
    Payload,
    /// The frame is fully consumed; the end marker is pending.
    FrameEnd,
}

impl ParseState {
    /// A stable name for the state, for diagnostics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ParseState::FirstByte => "first byte",
            ParseState::SecondByte => "second byte",
            ParseState::ExtendedLen16 => "extended length (16-bit)",
            ParseState::ExtendedLen64 => "extended length (64-bit)",
            ParseState::MaskingKey => "masking key",
            ParseState::Payload => "payload",
            ParseState::FrameEnd => "frame end",
        }
    }
}

impl std::fmt::Display for ParseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsing step's output.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum FrameEvent {
    /// A complete header was read; payload (if any) follows.
    Header(FrameHeader),
    /// A chunk of payload, already unmasked, sized by buffer availability.
    Data(Bytes),
    /// The current frame is complete.
    End,
}

/// Byte-driven frame parser.
pub(crate) struct FrameParser {
    state: ParseState,
    /// Reject the MASK bit outright. Clients must: server frames are never
    /// masked.
    reject_masked: bool,
    /// Inbound per-frame payload cap; frames over it fail with 1009.
    max_frame_size: Option<u64>,

    // Fields of the header being assembled.
    fin: bool,
    opcode: OpCode,
    masked: bool,
    mask: Option<[u8; 4]>,
    payload_len: u64,

    /// Payload bytes of the current frame still to come.
    remaining: u64,
    /// Whether a fragmented data message is open (between a non-FIN data
    /// frame and its final continuation).
    fragmented: bool,
}

impl FrameParser {
    /// A parser for the client side: masked frames from the peer are a
    /// protocol error.
    pub fn client(max_frame_size: Option<u64>) -> Self {
        Self {
            state: ParseState::FirstByte,
            reject_masked: true,
            max_frame_size,
            fin: false,
            opcode: OpCode::Continuation,
            masked: false,
            mask: None,
            payload_len: 0,
            remaining: 0,
            fragmented: false,
        }
    }

    /// A parser that accepts masked frames and unmasks their payload.
    /// Exercised by tests that replay client-generated bytes.
    #[cfg(test)]
    pub fn permissive() -> Self {
        Self {
            reject_masked: false,
            ..Self::client(None)
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Advances the state machine over `buf`, consuming exactly the bytes
    /// it interprets.
    ///
    /// Returns `Ok(None)` when more bytes are needed; otherwise the next
    /// [`FrameEvent`]. Call repeatedly until `None` to drain a buffer.
    pub fn poll(&mut self, buf: &mut BytesMut) -> Result<Option<FrameEvent>> {
        loop {
            match self.state {
                ParseState::FirstByte => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let byte = buf.get_u8();

                    if byte & 0b0111_0000 != 0 {
                        return Err(WebSocketError::ReservedBitsNotZero);
                    }
                    self.fin = byte & 0x80 != 0;
                    self.opcode = OpCode::try_from(byte & 0x0F)?;
                    self.state = ParseState::SecondByte;
                }
                ParseState::SecondByte => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let byte = buf.get_u8();

                    self.masked = byte & 0x80 != 0;
                    if self.masked && self.reject_masked {
                        return Err(WebSocketError::MaskedServerFrame);
                    }

                    match byte & 0x7F {
                        126 => self.state = ParseState::ExtendedLen16,
                        127 => self.state = ParseState::ExtendedLen64,
                        n => {
                            self.payload_len = n as u64;
                            if let Some(event) = self.after_length()? {
                                return Ok(Some(event));
                            }
                        }
                    }
                }
                ParseState::ExtendedLen16 => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    self.payload_len = buf.get_u16() as u64;
                    if let Some(event) = self.after_length()? {
                        return Ok(Some(event));
                    }
                }
                ParseState::ExtendedLen64 => {
                    if buf.len() < 8 {
                        return Ok(None);
                    }
                    let len = buf.get_u64();
                    if len & (1 << 63) != 0 {
                        return Err(WebSocketError::InvalidPayloadLength);
                    }
                    self.payload_len = len;
                    if let Some(event) = self.after_length()? {
                        return Ok(Some(event));
                    }
                }
                ParseState::MaskingKey => {
                    if buf.len() < 4 {
                        return Ok(None);
                    }
                    let mut key = [0u8; 4];
                    key.copy_from_slice(&buf[..4]);
                    buf.advance(4);
                    self.mask = Some(key);
                    return Ok(Some(self.finish_header()?));
                }
                ParseState::Payload => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let take = (self.remaining).min(buf.len() as u64) as usize;
                    let mut chunk = buf.split_to(take);
                    if let Some(mask) = self.mask {
                        let offset = self.payload_len - self.remaining;
                        apply_mask_offset(&mut chunk, mask, offset);
                    }
                    self.remaining -= take as u64;
                    if self.remaining == 0 {
                        self.state = ParseState::FrameEnd;
                    }
                    return Ok(Some(FrameEvent::Data(chunk.freeze())));
                }
                ParseState::FrameEnd => {
                    self.state = ParseState::FirstByte;
                    return Ok(Some(FrameEvent::End));
                }
            }
        }
    }

    /// The payload length is known; route to the masking key or finish the
    /// header.
    fn after_length(&mut self) -> Result<Option<FrameEvent>> {
        if self.masked {
            self.state = ParseState::MaskingKey;
            Ok(None)
        } else {
            self.mask = None;
            Ok(Some(self.finish_header()?))
        }
    }

    /// Header complete: validate it and emit the header event.
    fn finish_header(&mut self) -> Result<FrameEvent> {
        if self.opcode.is_control() {
            if !self.fin {
                return Err(WebSocketError::ControlFrameFragmented);
            }
            if self.payload_len > 125 {
                return Err(WebSocketError::ControlFrameTooLarge);
            }
        } else {
            // Continuation sequencing: a data opcode opens a message, a
            // continuation requires one to be open.
            match self.opcode {
                OpCode::Text | OpCode::Binary => {
                    if self.fragmented {
                        return Err(WebSocketError::InvalidContinuationFrame);
                    }
                    self.fragmented = !self.fin;
                }
                OpCode::Continuation => {
                    if !self.fragmented {
                        return Err(WebSocketError::InvalidContinuationFrame);
                    }
                    if self.fin {
                        self.fragmented = false;
                    }
                }
                _ => unreachable!(),
            }

            if let Some(max) = self.max_frame_size {
                if self.payload_len > max {
                    return Err(WebSocketError::FrameTooLarge);
                }
            }
        }

        let header = FrameHeader {
            fin: self.fin,
            rsv1: false,
            rsv2: false,
            rsv3: false,
            opcode: self.opcode,
            mask: self.mask,
            payload_len: self.payload_len,
        };
        tracing::trace!(
            opcode = ?header.opcode,
            fin = header.fin,
            len = header.payload_len,
            "frame header",
        );

        self.remaining = self.payload_len;
        self.state = if self.remaining > 0 {
            ParseState::Payload
        } else {
            ParseState::FrameEnd
        };
        Ok(FrameEvent::Header(header))
    }
}
