//! Codec module - the payload tree and its binary encoding.
//!
//! - [`Value`] - self-describing payload tree (maps, sequences, scalars, blobs)
//! - [`PayloadCodec`] - MessagePack using `rmp-serde` (to_vec_named), depth-limited
//! - [`Naming`] - compact/full field-name mapping shared with the gateway
//!
//! # Example
//!
//! ```
//! use callmesh::codec::{PayloadCodec, Value};
//!
//! let codec = PayloadCodec::with_max_depth(16);
//! let encoded = codec.encode(&Value::from("hello")).unwrap();
//! assert_eq!(codec.decode(&encoded).unwrap(), Value::from("hello"));
//! ```

mod msgpack;
pub mod names;
mod value;

pub use msgpack::{PayloadCodec, DEFAULT_MAX_DEPTH};
pub use names::Naming;
pub use value::{Map, Value};
