//! Frame struct with typed accessors.
//!
//! Represents a complete multipart frame: routing identity, tag, payload parts.
//! Uses `bytes::Bytes` for zero-copy part sharing.
//!
//! # Example
//!
//! ```
//! use callmesh::protocol::{Frame, Tag};
//! use bytes::Bytes;
//!
//! let frame = Frame::request("read", vec![Bytes::new(), Bytes::from_static(b"cmd")]);
//! let parsed = Frame::from_parts(frame.to_parts()).unwrap();
//!
//! assert_eq!(parsed.action(), Some("read"));
//! assert_eq!(parsed.payload.len(), 2);
//! ```

use bytes::Bytes;

use super::wire_format::{encode_parts, Signal, Tag};
use crate::error::{CallmeshError, Result};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// Opaque routing prefix. Echoed unchanged on the reply.
    pub identity: Vec<Bytes>,
    /// Decoded action tag.
    pub tag: Tag,
    /// Payload parts.
    pub payload: Vec<Bytes>,
}

impl Frame {
    /// Create a request frame with no identity prefix.
    pub fn request(action: impl Into<String>, payload: Vec<Bytes>) -> Self {
        Self {
            identity: Vec::new(),
            tag: Tag::Request(action.into()),
            payload,
        }
    }

    /// Create a control frame.
    pub fn control(identity: Vec<Bytes>, signal: Signal) -> Self {
        Self {
            identity,
            tag: Tag::Control(signal),
            payload: Vec::new(),
        }
    }

    /// Create the response to this frame, echoing its identity prefix.
    pub fn reply(&self, meta_flags: Vec<u8>, payload: Bytes) -> Self {
        Self {
            identity: self.identity.clone(),
            tag: Tag::Response(meta_flags),
            payload: vec![payload],
        }
    }

    /// Parse a frame from raw parts.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the delimiter or tag is missing, the tag is
    /// invalid, or a control frame carries payload parts.
    pub fn from_parts(mut parts: Vec<Bytes>) -> Result<Self> {
        let delimiter = parts.iter().position(|p| p.is_empty()).ok_or_else(|| {
            CallmeshError::Protocol("Frame has no identity delimiter".to_string())
        })?;

        if parts.len() <= delimiter + 1 {
            return Err(CallmeshError::Protocol(
                "Frame has no action tag".to_string(),
            ));
        }

        let payload = parts.split_off(delimiter + 2);
        let tag = Tag::decode(&parts[delimiter + 1])?;
        parts.truncate(delimiter);

        if matches!(tag, Tag::Control(_)) && !payload.is_empty() {
            return Err(CallmeshError::Protocol(format!(
                "Control frame carries {} payload parts",
                payload.len()
            )));
        }

        Ok(Self {
            identity: parts,
            tag,
            payload,
        })
    }

    /// Flatten into parts, preserving order and count.
    pub fn to_parts(&self) -> Vec<Bytes> {
        let mut parts = Vec::with_capacity(self.identity.len() + 2 + self.payload.len());
        parts.extend(self.identity.iter().cloned());
        parts.push(Bytes::new());
        parts.push(self.tag.encode());
        parts.extend(self.payload.iter().cloned());
        parts
    }

    /// Encode to the stream representation.
    pub fn encode(&self) -> Result<Bytes> {
        encode_parts(&self.to_parts())
    }

    /// Number of parts this frame occupies on the wire.
    #[inline]
    pub fn part_count(&self) -> usize {
        self.identity.len() + 2 + self.payload.len()
    }

    /// Action name for request frames.
    #[inline]
    pub fn action(&self) -> Option<&str> {
        match &self.tag {
            Tag::Request(action) => Some(action),
            _ => None,
        }
    }

    #[inline]
    pub fn is_request(&self) -> bool {
        matches!(self.tag, Tag::Request(_))
    }

    #[inline]
    pub fn is_response(&self) -> bool {
        matches!(self.tag, Tag::Response(_))
    }

    #[inline]
    pub fn is_control(&self) -> bool {
        matches!(self.tag, Tag::Control(_))
    }

    /// The last payload part, which holds the command body.
    #[inline]
    pub fn body(&self) -> Option<&Bytes> {
        self.payload.last()
    }
}
