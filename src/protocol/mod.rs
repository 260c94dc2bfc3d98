//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the multipart framing exchanged with the gateway:
//! - Part-count/part-length stream encoding
//! - Action tags (request, response with meta flags, control)
//! - Frame buffer for accumulating partial reads
//! - Frame reader/writer over async streams

mod frame;
mod frame_buffer;
mod stream;
mod wire_format;

pub use frame::Frame;
pub use frame_buffer::FrameBuffer;
pub use stream::{read_frame, write_frame, FrameReader};
pub use wire_format::{
    encode_parts, kind, meta, Signal, Tag, DEFAULT_MAX_PARTS, DEFAULT_MAX_PART_SIZE,
    PART_COUNT_SIZE, PART_LENGTH_SIZE,
};
