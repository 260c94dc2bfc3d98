//! Wire format constants and the action tag.
//!
//! A frame is a list of parts. On a byte stream it is written as:
//!
//! ```text
//! ┌──────────┬──────────┬─────────┬──────────┬─────────┬─────┐
//! │ Count    │ Len 0    │ Part 0  │ Len 1    │ Part 1  │ ... │
//! │ u16 BE   │ u32 BE   │ N bytes │ u32 BE   │ N bytes │     │
//! └──────────┴──────────┴─────────┴──────────┴─────────┴─────┘
//! ```
//!
//! Part layout: `[identity...] [empty delimiter] [tag] [payload...]`.
//! The first tag byte is the frame kind; the rest depends on the kind.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CallmeshError, Result};

/// Size of the part-count prefix.
pub const PART_COUNT_SIZE: usize = 2;

/// Size of each part-length prefix.
pub const PART_LENGTH_SIZE: usize = 4;

/// Default maximum part size (64 MiB).
pub const DEFAULT_MAX_PART_SIZE: u32 = 64 * 1024 * 1024;

/// Default maximum number of parts per frame.
pub const DEFAULT_MAX_PARTS: u16 = 64;

/// Frame kinds (first byte of the tag part).
pub mod kind {
    pub const REQUEST: u8 = 0x01;
    pub const RESPONSE: u8 = 0x02;
    pub const CONTROL: u8 = 0x03;
}

/// Response meta flags carried after the kind byte of a response tag.
pub mod meta {
    /// Nothing to report.
    pub const EMPTY: u8 = 0x00;
    /// The service made calls to other services.
    pub const SERVICE_CALL: u8 = 0x01;
    /// Files are attached to those calls.
    pub const FILES: u8 = 0x02;
    /// Transactions are registered.
    pub const TRANSACTIONS: u8 = 0x03;
    /// A download is registered.
    pub const DOWNLOAD: u8 = 0x04;
}

/// Control signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Ping,
    Pong,
}

impl Signal {
    fn as_bytes(self) -> &'static [u8] {
        match self {
            Signal::Ping => b"ping",
            Signal::Pong => b"pong",
        }
    }
}

/// Decoded action tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tag {
    /// A request for the named action.
    Request(String),
    /// A response with its meta flags (never empty; `[meta::EMPTY]` at least).
    Response(Vec<u8>),
    /// A control frame. Carries no payload parts.
    Control(Signal),
}

impl Tag {
    /// Encode the tag part.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Tag::Request(action) => {
                buf.put_u8(kind::REQUEST);
                buf.put_slice(action.as_bytes());
            }
            Tag::Response(flags) => {
                buf.put_u8(kind::RESPONSE);
                if flags.is_empty() {
                    buf.put_u8(meta::EMPTY);
                } else {
                    buf.put_slice(flags);
                }
            }
            Tag::Control(signal) => {
                buf.put_u8(kind::CONTROL);
                buf.put_slice(signal.as_bytes());
            }
        }
        buf.freeze()
    }

    /// Decode a tag part.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` for an empty tag, an unknown kind, a non-UTF-8
    /// action name, or an unknown control signal.
    pub fn decode(part: &[u8]) -> Result<Self> {
        let (&first, rest) = part
            .split_first()
            .ok_or_else(|| CallmeshError::Protocol("Empty action tag".to_string()))?;

        match first {
            kind::REQUEST => {
                let action = std::str::from_utf8(rest).map_err(|_| {
                    CallmeshError::Protocol("Action name is not valid UTF-8".to_string())
                })?;
                Ok(Tag::Request(action.to_string()))
            }
            kind::RESPONSE => {
                if rest.iter().any(|f| *f > meta::DOWNLOAD) {
                    return Err(CallmeshError::Protocol(format!(
                        "Unknown response meta flags: {:?}",
                        rest
                    )));
                }
                let flags = if rest.is_empty() {
                    vec![meta::EMPTY]
                } else {
                    rest.to_vec()
                };
                Ok(Tag::Response(flags))
            }
            kind::CONTROL => match rest {
                b"ping" => Ok(Tag::Control(Signal::Ping)),
                b"pong" => Ok(Tag::Control(Signal::Pong)),
                other => Err(CallmeshError::Protocol(format!(
                    "Unknown control signal: {:?}",
                    String::from_utf8_lossy(other)
                ))),
            },
            other => Err(CallmeshError::Protocol(format!(
                "Unknown frame kind: 0x{:02x}",
                other
            ))),
        }
    }
}

/// Encode a list of parts into the stream representation.
///
/// # Errors
///
/// Returns `Protocol` if there are more parts than fit the count prefix or a
/// part is larger than `u32::MAX`.
pub fn encode_parts(parts: &[Bytes]) -> Result<Bytes> {
    let count = u16::try_from(parts.len())
        .map_err(|_| CallmeshError::Protocol(format!("Too many parts: {}", parts.len())))?;

    let body: usize = parts.iter().map(|p| PART_LENGTH_SIZE + p.len()).sum();
    let mut buf = BytesMut::with_capacity(PART_COUNT_SIZE + body);
    buf.put_u16(count);
    for part in parts {
        let len = u32::try_from(part.len())
            .map_err(|_| CallmeshError::Protocol(format!("Part too large: {}", part.len())))?;
        buf.put_u32(len);
        buf.put_slice(part);
    }
    Ok(buf.freeze())
}
