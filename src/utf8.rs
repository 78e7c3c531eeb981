//! Incremental UTF-8 validation for text payloads that arrive in chunks.
//!
//! RFC 6455 requires an endpoint to fail a connection as soon as the byte
//! stream of a text message can no longer be a prefix of valid UTF-8 —
//! waiting for the final fragment is not allowed. [`Utf8Validator`] checks
//! each chunk as it arrives, carrying at most 3 bytes of an unfinished code
//! point between chunks, and rejects overlong encodings, surrogates and
//! code points above U+10FFFF exactly as `std::str::from_utf8` does.

use crate::{Result, WebSocketError};

/// Streaming UTF-8 validator.
///
/// Feed arbitrary chunk boundaries with [`feed`](Self::feed); call
/// [`finish`](Self::finish) at end of message to reject a trailing
/// incomplete code point.
#[derive(Debug, Default)]
pub struct Utf8Validator {
    /// Bytes of an incomplete code point carried from the previous chunk.
    carry: [u8; 4],
    carry_len: u8,
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard any carried state, ready for a new message.
    pub fn reset(&mut self) {
        self.carry_len = 0;
    }

    /// Validate the next chunk of the stream.
    ///
    /// Returns `Err(WebSocketError::InvalidUTF8)` the moment the cumulative
    /// input cannot be a prefix of well-formed UTF-8. An incomplete code
    /// point at the end of the chunk is fine; its bytes are carried into the
    /// next call.
    pub fn feed(&mut self, mut input: &[u8]) -> Result<()> {
        if self.carry_len > 0 {
            // Absorb bytes one at a time until the carried code point
            // completes or turns out to be invalid. A carried prefix is at
            // most 3 bytes and a code point at most 4, so `carry` cannot
            // overflow before from_utf8 decides.
            while !input.is_empty() {
                self.carry[self.carry_len as usize] = input[0];
                self.carry_len += 1;
                input = &input[1..];

                match std::str::from_utf8(&self.carry[..self.carry_len as usize]) {
                    Ok(_) => {
                        self.carry_len = 0;
                        break;
                    }
                    Err(e) if e.error_len().is_some() => return Err(WebSocketError::InvalidUTF8),
                    Err(_) => {}
                }
            }

            if self.carry_len > 0 {
                // Chunk exhausted while still inside the code point.
                return Ok(());
            }
        }

        match std::str::from_utf8(input) {
            Ok(_) => Ok(()),
            Err(e) => {
                if e.error_len().is_some() {
                    return Err(WebSocketError::InvalidUTF8);
                }
                let tail = &input[e.valid_up_to()..];
                self.carry[..tail.len()].copy_from_slice(tail);
                self.carry_len = tail.len() as u8;
                Ok(())
            }
        }
    }

    /// Confirm that the stream ended on a code point boundary.
    pub fn finish(&self) -> Result<()> {
        if self.carry_len == 0 {
            Ok(())
        } else {
            Err(WebSocketError::InvalidUTF8)
        }
    }
}
