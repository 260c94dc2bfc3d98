//! Handler module - user handlers and the context they run with.
//!
//! Provides:
//! - [`HandlerRegistry`] - maps (service, version, action) to handlers
//! - [`RequestContext`] - the action API handlers use to build results
//! - [`RequestMiddleware`] / [`ResponseMiddleware`] - middleware stages
//!
//! # Example
//!
//! ```ignore
//! use callmesh::handler::HandlerRegistry;
//! use callmesh::transport::ActionKey;
//!
//! let mut registry = HandlerRegistry::new();
//!
//! registry.register(ActionKey::new("users", "1.0", "read"), |mut ctx| async move {
//!     let id = ctx.get_param("id").cloned();
//!     ctx.set_entity(Value::from_pairs([("id", id.map(|p| p.value).unwrap_or_default())]))?;
//!     Ok(ctx)
//! });
//! ```

mod context;
mod middleware;
mod registry;

pub use context::{CallResult, CallSpec, RequestContext, Resources, Runtime};
pub use middleware::{
    failure_response, MiddlewareHandler, MiddlewareRequest, MiddlewareResponse, RequestMiddleware,
    RequestOutcome, ResponseMiddleware,
};
pub use registry::{ActionFn, BoxFuture, Handler, HandlerRegistry, HandlerResult, TypedHandler};
