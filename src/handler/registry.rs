//! Handler registry for dispatching requests by (service, version, action).
//!
//! The registry is filled once by the component builder and then shared
//! read-only by every connection.
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
//!     ctx.set_entity(entity)?;
//!     Ok(ctx)
//! });
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use super::middleware::{MiddlewareHandler, RequestMiddleware, ResponseMiddleware};
use super::RequestContext;
use crate::codec::{Map, PayloadCodec, Value};
use crate::error::{CallmeshError, HandlerError};
use crate::transport::ActionKey;

/// Result type for action handlers.
///
/// A handler hands its context back on success; a failure discards the
/// handler's writes and records the error in the request's Transport.
pub type HandlerResult = std::result::Result<RequestContext, HandlerError>;

/// Boxed future for handler results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Trait for action handlers.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, ctx: RequestContext) -> BoxFuture<'static, HandlerResult>;
}

/// Handler taking the context as-is.
pub struct ActionFn<F, Fut>
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> ActionFn<F, Fut>
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Handler for ActionFn<F, Fut>
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.handler)(ctx))
    }
}

/// Wrapper that deserializes the parameters before calling the handler.
///
/// Parameters are gathered into an object keyed by name and decoded into `T`,
/// so `T` is usually a struct with one field per parameter.
pub struct TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    handler: F,
    _phantom: PhantomData<fn(T) -> Fut>,
}

impl<F, T, Fut> TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _phantom: PhantomData,
        }
    }
}

fn decode_params<T: DeserializeOwned>(ctx: &RequestContext) -> std::result::Result<T, CallmeshError> {
    let object: Map = ctx
        .params()
        .iter()
        .map(|p| (p.name.clone(), p.value.clone()))
        .collect();
    let bytes = PayloadCodec::encode_serde(&Value::Map(object))?;
    rmp_serde::from_slice(&bytes).map_err(|e| CallmeshError::InvalidParam {
        name: String::new(),
        reason: e.to_string(),
    })
}

impl<F, T, Fut> Handler for TypedHandler<F, T, Fut>
where
    F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
    T: DeserializeOwned + Send + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn call(&self, ctx: RequestContext) -> BoxFuture<'static, HandlerResult> {
        let parsed: T = match decode_params(&ctx) {
            Ok(v) => v,
            Err(e) => return Box::pin(async move { Err(HandlerError::from(e)) }),
        };

        Box::pin((self.handler)(parsed, ctx))
    }
}

/// Registry mapping actions and middleware stages to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    actions: HashMap<ActionKey, Arc<dyn Handler>>,
    request: Option<Arc<dyn MiddlewareHandler>>,
    response: Option<Arc<dyn MiddlewareHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an action handler. A later registration for the same key
    /// replaces the earlier one.
    pub fn register<F, Fut>(&mut self, key: ActionKey, handler: F)
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(key, ActionFn::new(handler));
    }

    /// Register an action handler that receives decoded parameters.
    pub fn register_typed<F, T, Fut>(&mut self, key: ActionKey, handler: F)
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_handler(key, TypedHandler::new(handler));
    }

    pub fn register_handler(&mut self, key: ActionKey, handler: impl Handler) {
        if self.actions.insert(key.clone(), Arc::new(handler)).is_some() {
            tracing::warn!(action = %key, "Replacing previously registered handler");
        }
    }

    pub fn set_request_middleware(&mut self, handler: RequestMiddleware) {
        self.request = Some(Arc::new(handler));
    }

    pub fn set_response_middleware(&mut self, handler: ResponseMiddleware) {
        self.response = Some(Arc::new(handler));
    }

    pub fn get(&self, key: &ActionKey) -> Option<Arc<dyn Handler>> {
        self.actions.get(key).cloned()
    }

    pub fn request_middleware(&self) -> Option<Arc<dyn MiddlewareHandler>> {
        self.request.clone()
    }

    pub fn response_middleware(&self) -> Option<Arc<dyn MiddlewareHandler>> {
        self.response.clone()
    }

    /// Registered action keys, sorted.
    pub fn keys(&self) -> Vec<&ActionKey> {
        let mut keys: Vec<_> = self.actions.keys().collect();
        keys.sort();
        keys
    }

    pub fn contains(&self, key: &ActionKey) -> bool {
        self.actions.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty() && self.request.is_none() && self.response.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::HttpResponse;
    use crate::handler::middleware::RequestOutcome;

    fn key(action: &str) -> ActionKey {
        ActionKey::new("users", "1.0", action)
    }

    #[test]
    fn test_register_action() {
        let mut registry = HandlerRegistry::new();
        registry.register(key("read"), |ctx| async { Ok(ctx) });

        assert!(registry.get(&key("read")).is_some());
        assert!(registry.contains(&key("read")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_handler_not_found() {
        let registry = HandlerRegistry::new();
        assert!(registry.get(&key("missing")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_keys_sorted() {
        let mut registry = HandlerRegistry::new();
        registry.register(key("update"), |ctx| async { Ok(ctx) });
        registry.register(key("create"), |ctx| async { Ok(ctx) });
        registry.register(key("read"), |ctx| async { Ok(ctx) });

        let actions: Vec<_> = registry.keys().iter().map(|k| k.action.as_str()).collect();
        assert_eq!(actions, ["create", "read", "update"]);
    }

    #[test]
    fn test_middleware_slots() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.request_middleware().is_none());

        registry.set_request_middleware(RequestMiddleware::new(|req| async move {
            Ok(RequestOutcome::Call {
                target: req.call,
                params: req.params,
            })
        }));
        registry.set_response_middleware(ResponseMiddleware::new(|res| async move {
            Ok(HttpResponse::new("204 No Content", "").with_header("X-Seen", res.response.status))
        }));

        assert!(registry.request_middleware().is_some());
        assert!(registry.response_middleware().is_some());
        assert!(!registry.is_empty());
    }

    #[derive(serde::Deserialize)]
    struct ReadParams {
        id: i64,
        #[serde(default)]
        verbose: bool,
    }

    #[tokio::test]
    async fn test_typed_handler_decodes_params() {
        use crate::param::Param;

        let handler = TypedHandler::new(|params: ReadParams, mut ctx: RequestContext| async move {
            ctx.set_return(Value::Int(params.id + i64::from(params.verbose)))?;
            Ok(ctx)
        });

        let ctx = RequestContext::for_test(key("read"), vec![Param::new("id", 41), Param::new("verbose", true)]);
        let ctx = handler.call(ctx).await.unwrap();
        assert_eq!(ctx.return_value(), Some(&Value::Int(42)));
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_bad_params() {
        let handler = TypedHandler::new(|_: ReadParams, ctx: RequestContext| async move { Ok(ctx) });
        let ctx = RequestContext::for_test(key("read"), vec![]);
        let err = handler.call(ctx).await.unwrap_err();
        assert_eq!(err.status, "400 Bad Request");
    }
}
