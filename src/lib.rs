//! # callmesh
//!
//! Component runtime for services and middleware orchestrated by a gateway.
//!
//! A component listens on a socket for request frames, decodes the
//! MsgPack command each one carries, resolves the (service, version,
//! action) triple against its schema table, runs the registered handler,
//! and replies with a Transport describing everything the handler (and
//! the services it called) produced.
//!
//! ## Architecture
//!
//! - **Payload codec** ([`codec`]): MsgPack value trees with a depth limit
//! - **Framer** ([`protocol`], [`writer`]): identity + tag + payload frames
//! - **Resolver** ([`version`], [`schema`]): wildcard version patterns
//! - **Aggregator** ([`transport`]): the mergeable response record
//! - **Dispatch loop** ([`dispatch`]): one state machine pass per request
//!
//! ## Example
//!
//! ```ignore
//! use callmesh::{Component, Value};
//!
//! fn main() -> std::process::ExitCode {
//!     Component::new()
//!         .action("read", |mut ctx| async move {
//!             let id = ctx.get_param("id").map(|p| p.value.clone()).unwrap_or_default();
//!             ctx.set_entity(Value::from_pairs([("id", id)]))?;
//!             Ok(ctx)
//!         })
//!         .run()
//! }
//! ```

pub mod caller;
pub mod channel;
pub mod cli;
pub mod codec;
pub mod command;
pub mod component;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod logging;
pub mod param;
pub mod protocol;
pub mod schema;
pub mod transport;
pub mod version;
pub mod writer;

pub use codec::Value;
pub use component::Component;
pub use dispatch::Dispatcher;
pub use error::{CallmeshError, HandlerError, Result};
pub use handler::RequestContext;
pub use param::Param;
pub use transport::{ActionKey, Transport};
