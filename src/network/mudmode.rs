// MudMode framing for the I3 router link
//
// Every message on the wire is a 4-byte big-endian length followed by that
// many bytes of LPC text. The FrameReader reassembles frames from arbitrary
// TCP chunking; undecodable frames are logged and skipped so one bad frame
// cannot stall the stream.

use crate::network::lpc::{LpcCodec, LpcValue};
use bytes::{Buf, BytesMut};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum MudModeError {
    #[error("Frame of {0} bytes exceeds maximum of {1}")]
    FrameTooLarge(usize, usize),

    #[error("Failed to encode frame: {0}")]
    Encode(String),
}

/// Encode a value as a single MudMode frame
pub fn encode_frame(value: &LpcValue) -> Vec<u8> {
    let payload = LpcCodec::encode(value);
    let mut frame = Vec::with_capacity(payload.len() + 4);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Stream reassembler for inbound MudMode frames
pub struct FrameReader {
    buffer: BytesMut,
    expected_length: Option<usize>,
    max_frame_len: usize,
}

impl FrameReader {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            expected_length: None,
            max_frame_len,
        }
    }

    /// Feed a chunk of bytes from the transport, returning every complete
    /// value it finishes, in arrival order.
    pub fn feed(&mut self, data: &[u8]) -> Result<Vec<LpcValue>, MudModeError> {
        self.buffer.extend_from_slice(data);
        let mut values = Vec::new();

        loop {
            if self.expected_length.is_none() {
                if self.buffer.len() < 4 {
                    break;
                }
                let len = u32::from_be_bytes([
                    self.buffer[0],
                    self.buffer[1],
                    self.buffer[2],
                    self.buffer[3],
                ]) as usize;
                if len > self.max_frame_len {
                    // Persistent corruption; the caller resets the connection
                    self.reset();
                    return Err(MudModeError::FrameTooLarge(len, self.max_frame_len));
                }
                self.buffer.advance(4);
                self.expected_length = Some(len);
            }

            let expected = self.expected_length.unwrap();
            if self.buffer.len() < expected {
                break;
            }

            let frame = self.buffer.split_to(expected);
            self.expected_length = None;

            match LpcCodec::decode(&frame) {
                Ok(value) => values.push(value),
                Err(e) => {
                    warn!(error = %e, "dropping undecodable frame");
                }
            }
        }

        Ok(values)
    }

    /// Discard all buffered state; call on connection reset
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.expected_length = None;
    }

    /// Bytes currently buffered awaiting a complete frame
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}
