//! Joins data-frame payloads into logical messages.
//!
//! The assembler receives only data frames — control frames are collected
//! separately and never enter the message path. Continuation sequencing is
//! already enforced by the parser; the assembler's concerns are buffering
//! policy (which of the three delivery modes the connection is in),
//! incremental UTF-8 validation of text messages, and the inbound message
//! size cap.

use bytes::{Bytes, BytesMut};

use crate::frame::{FrameHeader, OpCode};
use crate::options::DeliveryMode;
use crate::utf8::Utf8Validator;
use crate::{Result, WebSocketError};

/// Outcome of a frame's final byte.
#[derive(Default)]
pub(crate) struct FrameFinish {
    /// Frame mode: the buffered payload of the finished frame.
    pub frame_payload: Option<Bytes>,
    /// Message mode: the complete message, present when this frame carried
    /// FIN.
    pub message: Option<Bytes>,
    /// Whether this frame ended the message.
    pub message_end: bool,
    /// Whether the finished message was binary.
    pub binary: bool,
}

/// Per-connection message assembly state.
pub(crate) struct MessageAssembler {
    mode: DeliveryMode,
    max_message_size: Option<usize>,
    utf8: Utf8Validator,
    /// Message-mode accumulation across fragments.
    message: BytesMut,
    /// Frame-mode accumulation for the current frame.
    frame: BytesMut,
    in_message: bool,
    binary: bool,
    received: usize,
}

impl MessageAssembler {
    pub fn new(mode: DeliveryMode, max_message_size: Option<usize>) -> Self {
        Self {
            mode,
            max_message_size,
            utf8: Utf8Validator::new(),
            message: BytesMut::new(),
            frame: BytesMut::new(),
            in_message: false,
            binary: false,
            received: 0,
        }
    }

    /// A data frame header arrived. Returns whether it opens a new
    /// message.
    pub fn begin_frame(&mut self, header: &FrameHeader) -> bool {
        debug_assert!(!header.opcode.is_control());

        let message_begin = !self.in_message;
        if message_begin {
            self.in_message = true;
            self.binary = header.opcode == OpCode::Binary;
            self.utf8.reset();
            self.received = 0;
            self.message.clear();
        }
        self.frame.clear();
        message_begin
    }

    /// A chunk of data-frame payload arrived.
    ///
    /// Text is validated incrementally, so a bad byte fails here, mid
    /// message, not at FIN. In stream mode the chunk is handed back for
    /// zero-copy delivery; otherwise it is buffered.
    pub fn frame_data(&mut self, chunk: Bytes) -> Result<Option<Bytes>> {
        self.received += chunk.len();
        if let Some(max) = self.max_message_size {
            if self.received > max {
                return Err(WebSocketError::MessageTooBig);
            }
        }

        if !self.binary {
            self.utf8.feed(&chunk)?;
        }

        match self.mode {
            DeliveryMode::Message => {
                self.message.extend_from_slice(&chunk);
                Ok(None)
            }
            DeliveryMode::Frame => {
                self.frame.extend_from_slice(&chunk);
                Ok(None)
            }
            DeliveryMode::Stream => Ok(Some(chunk)),
        }
    }

    /// The current data frame is complete.
    pub fn end_frame(&mut self, fin: bool) -> Result<FrameFinish> {
        let mut finish = FrameFinish {
            binary: self.binary,
            ..FrameFinish::default()
        };

        if let DeliveryMode::Frame = self.mode {
            finish.frame_payload = Some(self.frame.split().freeze());
        }

        if fin {
            // The message must end on a code point boundary.
            if !self.binary {
                self.utf8.finish()?;
            }
            self.in_message = false;
            finish.message_end = true;
            if let DeliveryMode::Message = self.mode {
                finish.message = Some(self.message.split().freeze());
            }
        }

        Ok(finish)
    }

    /// Whether a fragmented message is currently open.
    pub fn in_message(&self) -> bool {
        self.in_message
    }
}
