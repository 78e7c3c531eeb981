//! Outbound frame construction: masking, automatic fragmentation, the
//! streaming send API, and the ordered output queue.
//!
//! Every client frame is masked with a fresh random 32-bit key. Messages
//! larger than the configured `max_frame_size` are split into a fragment
//! train before queueing. Control frames jump ahead of data frames that
//! have not started transmission — between the frames of a fragmented
//! message, never between the bytes of one frame.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};

use crate::frame::{Frame, FrameHeader, OpCode, MAX_HEADER_SIZE};
use crate::mask::{apply_mask, apply_mask_offset};
use crate::{Result, WebSocketError};

/// A frame queued for transmission, fully encoded (header + masked
/// payload).
struct OutFrame {
    bytes: BytesMut,
    /// How many of `bytes` have been handed to the transport.
    written: usize,
    /// A streaming frame that is still receiving payload bytes. An open
    /// frame is never popped, and control frames are never inserted after
    /// a partially transmitted one.
    open: bool,
    is_control: bool,
    is_close: bool,
    /// Zero-copy user payload reported back once the frame has fully left
    /// the engine.
    user: Option<Bytes>,
}

/// What a [`OutQueue::drain`] call accomplished.
#[derive(Default)]
pub(crate) struct Drained {
    /// Total bytes handed to the transport.
    pub written: usize,
    /// User payloads whose final byte left the engine.
    pub completions: Vec<Bytes>,
    /// A close frame finished transmitting.
    pub close_flushed: bool,
}

/// Ordered queue of encoded outbound frames.
pub(crate) struct OutQueue {
    frames: VecDeque<OutFrame>,
}

impl OutQueue {
    pub fn new() -> Self {
        Self {
            frames: VecDeque::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Bytes queued but not yet handed to the transport.
    pub fn pending_bytes(&self) -> usize {
        self.frames
            .iter()
            .map(|f| f.bytes.len() - f.written)
            .sum()
    }

    pub fn push_data(&mut self, bytes: BytesMut, user: Option<Bytes>) {
        self.frames.push_back(OutFrame {
            bytes,
            written: 0,
            open: false,
            is_control: false,
            is_close: false,
            user,
        });
    }

    /// Queues the header of a streaming frame whose payload will be
    /// appended incrementally.
    fn push_open(&mut self, bytes: BytesMut) {
        self.frames.push_back(OutFrame {
            bytes,
            written: 0,
            open: true,
            is_control: false,
            is_close: false,
            user: None,
        });
    }

    /// Appends payload bytes to the open streaming frame.
    fn append_open(&mut self, chunk: &[u8]) {
        let frame = self
            .frames
            .iter_mut()
            .rev()
            .find(|f| f.open)
            .expect("an open frame");
        frame.bytes.extend_from_slice(chunk);
    }

    /// Marks the open streaming frame complete.
    fn close_open(&mut self) {
        if let Some(frame) = self.frames.iter_mut().rev().find(|f| f.open) {
            frame.open = false;
        }
    }

    /// Inserts a control frame ahead of data frames that have not begun
    /// transmission, preserving the order of already queued control
    /// frames.
    fn push_control(&mut self, bytes: BytesMut, is_close: bool) {
        let mut idx = 0;
        for frame in &self.frames {
            // Never cut into a frame already on the wire, and keep control
            // frames first-come-first-served among themselves.
            if frame.written > 0 || frame.is_control {
                idx += 1;
                continue;
            }
            break;
        }
        self.frames.insert(
            idx,
            OutFrame {
                bytes,
                written: 0,
                open: false,
                is_control: true,
                is_close,
                user: None,
            },
        );
    }

    /// Writes up to `budget` bytes through `write`, popping frames as they
    /// complete. Stops early on transport backpressure (a short or zero
    /// write) or at an open frame that has no bytes left yet.
    pub fn drain(
        &mut self,
        mut budget: usize,
        write: &mut dyn FnMut(&[u8]) -> std::io::Result<usize>,
    ) -> std::io::Result<Drained> {
        let mut drained = Drained::default();

        loop {
            let head = match self.frames.front_mut() {
                Some(head) => head,
                None => break,
            };

            let avail = head.bytes.len() - head.written;
            if avail == 0 {
                if head.open {
                    // Mid-frame: nothing more to send until the caller
                    // appends or closes it.
                    break;
                }
                let frame = self.frames.pop_front().expect("head exists");
                if let Some(user) = frame.user {
                    drained.completions.push(user);
                }
                if frame.is_close {
                    drained.close_flushed = true;
                }
                continue;
            }

            if budget == 0 {
                break;
            }

            let want = avail.min(budget);
            let n = write(&head.bytes[head.written..head.written + want])?;
            head.written += n;
            budget -= n;
            drained.written += n;
            if n < want {
                break;
            }
        }

        Ok(drained)
    }
}

/// State of a streaming frame opened with `frame_begin`.
struct OpenFrame {
    mask: [u8; 4],
    declared: u64,
    sent: u64,
}

/// State of a streaming message opened with `msg_begin`.
struct StreamingSend {
    binary: bool,
    first_frame_sent: bool,
    frame: Option<OpenFrame>,
}

/// Builds outbound frames and feeds the [`OutQueue`].
pub(crate) struct FrameWriter {
    max_frame_size: Option<usize>,
    streaming: Option<StreamingSend>,
}

impl FrameWriter {
    pub fn new(max_frame_size: Option<usize>) -> Self {
        Self {
            max_frame_size,
            streaming: None,
        }
    }

    /// Encodes one masked frame: header, key, XORed payload.
    fn encode(fin: bool, opcode: OpCode, payload: &[u8]) -> BytesMut {
        let mask: [u8; 4] = rand::random();
        let mut header = FrameHeader::new(fin, opcode, payload.len() as u64);
        header.mask = Some(mask);

        let mut head = [0u8; MAX_HEADER_SIZE];
        let head_len = header.encode(&mut head);

        let mut out = BytesMut::with_capacity(head_len + payload.len());
        out.extend_from_slice(&head[..head_len]);
        out.extend_from_slice(payload);
        apply_mask(&mut out[head_len..], mask);
        out
    }

    /// Queues raw bytes that are not a frame (the handshake request).
    pub fn raw(&mut self, q: &mut OutQueue, bytes: &[u8]) {
        q.push_data(BytesMut::from(bytes), None);
    }

    /// Queues a whole message, fragmenting it when it exceeds the
    /// configured maximum frame size. The payload handle is reported back
    /// as complete once the final fragment has left the engine.
    pub fn send_message(&mut self, q: &mut OutQueue, payload: Bytes, binary: bool) -> Result<()> {
        if self.streaming.is_some() {
            return Err(WebSocketError::SendInProgress);
        }

        let opcode = if binary { OpCode::Binary } else { OpCode::Text };
        let user = payload.clone();
        let max = self.max_frame_size.unwrap_or(usize::MAX).max(1);

        let mut fragments = Frame::new(true, opcode, payload)
            .into_fragments(max)
            .peekable();
        while let Some(frame) = fragments.next() {
            let last = fragments.peek().is_none();
            let bytes = Self::encode(frame.fin, frame.opcode, &frame.payload);
            q.push_data(bytes, if last { Some(user.clone()) } else { None });
        }
        Ok(())
    }

    /// Opens a streaming message. Frames are declared and filled with
    /// `frame_begin`/`frame_data`; `msg_end` finishes the message.
    pub fn msg_begin(&mut self, binary: bool) -> Result<()> {
        if self.streaming.is_some() {
            return Err(WebSocketError::SendInProgress);
        }
        self.streaming = Some(StreamingSend {
            binary,
            first_frame_sent: false,
            frame: None,
        });
        Ok(())
    }

    /// Declares the next frame of the streaming message and queues its
    /// header. The declared length is final: `frame_data` may fill it in
    /// any number of chunks but never exceed it.
    pub fn frame_begin(&mut self, q: &mut OutQueue, total: u64) -> Result<()> {
        let streaming = self
            .streaming
            .as_mut()
            .ok_or(WebSocketError::NoMessageInProgress)?;
        if streaming.frame.is_some() {
            return Err(WebSocketError::SendInProgress);
        }

        let opcode = if streaming.first_frame_sent {
            OpCode::Continuation
        } else if streaming.binary {
            OpCode::Binary
        } else {
            OpCode::Text
        };

        let mask: [u8; 4] = rand::random();
        let mut header = FrameHeader::new(false, opcode, total);
        header.mask = Some(mask);
        let mut head = [0u8; MAX_HEADER_SIZE];
        let head_len = header.encode(&mut head);

        q.push_open(BytesMut::from(&head[..head_len]));
        streaming.first_frame_sent = true;

        if total == 0 {
            q.close_open();
        } else {
            streaming.frame = Some(OpenFrame {
                mask,
                declared: total,
                sent: 0,
            });
        }
        Ok(())
    }

    /// Masks and queues a chunk of the current streaming frame.
    pub fn frame_data(&mut self, q: &mut OutQueue, data: &[u8]) -> Result<()> {
        let streaming = self
            .streaming
            .as_mut()
            .ok_or(WebSocketError::NoMessageInProgress)?;
        let frame = streaming
            .frame
            .as_mut()
            .ok_or(WebSocketError::NoMessageInProgress)?;

        if frame.sent + data.len() as u64 > frame.declared {
            return Err(WebSocketError::FrameDataOverflow);
        }

        let mut chunk = data.to_vec();
        apply_mask_offset(&mut chunk, frame.mask, frame.sent);
        q.append_open(&chunk);
        frame.sent += data.len() as u64;

        if frame.sent == frame.declared {
            q.close_open();
            streaming.frame = None;
        }
        Ok(())
    }

    /// Ends the streaming message with a zero-length final continuation.
    ///
    /// Ending while the current frame still owes declared bytes is an
    /// error and leaves the message open.
    pub fn msg_end(&mut self, q: &mut OutQueue) -> Result<()> {
        {
            let streaming = self
                .streaming
                .as_ref()
                .ok_or(WebSocketError::NoMessageInProgress)?;
            if streaming.frame.is_some() {
                return Err(WebSocketError::FrameDataIncomplete);
            }
        }
        let streaming = self.streaming.take().expect("checked above");

        let opcode = if streaming.first_frame_sent {
            OpCode::Continuation
        } else if streaming.binary {
            OpCode::Binary
        } else {
            OpCode::Text
        };
        q.push_data(Self::encode(true, opcode, &[]), None);
        Ok(())
    }

    /// Whether a streaming message is currently open.
    pub fn is_streaming(&self) -> bool {
        self.streaming.is_some()
    }

    /// Queues a control frame ahead of untransmitted data frames.
    pub fn control(&mut self, q: &mut OutQueue, frame: Frame) -> Result<()> {
        debug_assert!(frame.opcode.is_control());
        if frame.payload.len() > 125 {
            return Err(WebSocketError::ControlFrameTooLarge);
        }
        let bytes = Self::encode(true, frame.opcode, &frame.payload);
        q.push_control(bytes, frame.opcode == OpCode::Close);
        Ok(())
    }
}
