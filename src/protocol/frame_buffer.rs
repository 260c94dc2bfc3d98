//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForCount`: Need the 2-byte part count
//! - `WaitingForLength`: Need the 4-byte length of the next part
//! - `WaitingForPart`: Length known, need N more part bytes
//!
//! # Example
//!
//! ```ignore
//! use callmesh::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from socket
//! let frames = buffer.push(&chunk)?;
//!
//! for frame in frames {
//!     println!("Got frame for action {:?}", frame.action());
//! }
//! ```

use bytes::{Buf, Bytes, BytesMut};

use super::wire_format::{DEFAULT_MAX_PARTS, DEFAULT_MAX_PART_SIZE, PART_COUNT_SIZE, PART_LENGTH_SIZE};
use super::Frame;
use crate::error::{CallmeshError, Result};

/// State machine for frame parsing.
#[derive(Debug, Clone, Copy)]
enum State {
    WaitingForCount,
    WaitingForLength { count: u16 },
    WaitingForPart { count: u16, remaining: u32 },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Parts of the frame currently being assembled.
    parts: Vec<Bytes>,
    state: State,
    max_part_size: u32,
    max_parts: u16,
}

impl FrameBuffer {
    /// Create a new frame buffer with default limits.
    ///
    /// Default capacity: 64KB, max part: 64MiB, max parts: 64.
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_PART_SIZE, DEFAULT_MAX_PARTS)
    }

    /// Create a new frame buffer with custom limits.
    pub fn with_limits(max_part_size: u32, max_parts: u16) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            parts: Vec::new(),
            state: State::WaitingForCount,
            max_part_size,
            max_parts,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is buffered internally for the next push.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if a limit is exceeded or a completed frame is
    /// malformed. The stream cannot be resynchronised after that.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(parts) = self.try_extract_one()? {
            frames.push(Frame::from_parts(parts)?);
        }
        Ok(frames)
    }

    /// Try to extract the parts of a single frame.
    fn try_extract_one(&mut self) -> Result<Option<Vec<Bytes>>> {
        loop {
            match self.state {
                State::WaitingForCount => {
                    if self.buffer.len() < PART_COUNT_SIZE {
                        return Ok(None);
                    }
                    let count = self.buffer.get_u16();
                    if count == 0 || count > self.max_parts {
                        return Err(CallmeshError::Protocol(format!(
                            "Part count {} outside 1..={}",
                            count, self.max_parts
                        )));
                    }
                    self.parts = Vec::with_capacity(count as usize);
                    self.state = State::WaitingForLength { count };
                }

                State::WaitingForLength { count } => {
                    if self.buffer.len() < PART_LENGTH_SIZE {
                        return Ok(None);
                    }
                    let len = self.buffer.get_u32();
                    if len > self.max_part_size {
                        return Err(CallmeshError::Protocol(format!(
                            "Part size {} exceeds maximum {}",
                            len, self.max_part_size
                        )));
                    }
                    self.state = State::WaitingForPart {
                        count,
                        remaining: len,
                    };
                }

                State::WaitingForPart { count, remaining } => {
                    let remaining = remaining as usize;
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }

                    // Zero-copy freeze
                    self.parts.push(self.buffer.split_to(remaining).freeze());

                    if self.parts.len() == count as usize {
                        self.state = State::WaitingForCount;
                        return Ok(Some(std::mem::take(&mut self.parts)));
                    }
                    self.state = State::WaitingForLength { count };
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when no bytes are buffered and no frame is partially assembled.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && matches!(self.state, State::WaitingForCount)
    }

    /// Clear the buffer and reset state.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.parts.clear();
        self.state = State::WaitingForCount;
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match self.state {
            State::WaitingForCount => "WaitingForCount",
            State::WaitingForLength { .. } => "WaitingForLength",
            State::WaitingForPart { .. } => "WaitingForPart",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}
