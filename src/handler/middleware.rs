//! Middleware stages.
//!
//! A request middleware sees the call the gateway is about to make and either
//! forwards it (possibly rewritten) or answers the HTTP request itself. A
//! response middleware rewrites the HTTP response built from a finished call.

use std::collections::BTreeMap;
use std::future::Future;

use super::BoxFuture;
use crate::codec::Value;
use crate::command::{Command, CommandResult, HttpRequest, HttpResponse, MiddlewareStage};
use crate::error::HandlerError;
use crate::param::Param;
use crate::transport::{ActionKey, Transport};

/// Input of a request middleware.
#[derive(Debug, Clone)]
pub struct MiddlewareRequest {
    /// Call the gateway resolved for the HTTP request.
    pub call: ActionKey,
    pub params: Vec<Param>,
    pub request: HttpRequest,
    pub variables: BTreeMap<String, String>,
}

/// What a request middleware decided.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestOutcome {
    /// Continue with this call.
    Call { target: ActionKey, params: Vec<Param> },
    /// Answer the HTTP request without calling a service.
    Respond(HttpResponse),
}

/// Input of a response middleware.
#[derive(Debug, Clone)]
pub struct MiddlewareResponse {
    pub request: HttpRequest,
    pub response: HttpResponse,
    /// Transport of the finished call, when the gateway forwards it.
    pub transport: Option<Transport>,
    pub return_value: Option<Value>,
    pub variables: BTreeMap<String, String>,
}

/// Type-erased middleware stage.
pub trait MiddlewareHandler: Send + Sync + 'static {
    fn stage(&self) -> MiddlewareStage;

    fn call(
        &self,
        command: Command,
        variables: BTreeMap<String, String>,
    ) -> BoxFuture<'static, std::result::Result<CommandResult, HandlerError>>;
}

type RequestFn =
    Box<dyn Fn(MiddlewareRequest) -> BoxFuture<'static, Result<RequestOutcome, HandlerError>> + Send + Sync>;

type ResponseFn =
    Box<dyn Fn(MiddlewareResponse) -> BoxFuture<'static, Result<HttpResponse, HandlerError>> + Send + Sync>;

/// Request stage handler.
pub struct RequestMiddleware {
    handler: RequestFn,
}

impl RequestMiddleware {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(MiddlewareRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<RequestOutcome, HandlerError>> + Send + 'static,
    {
        Self {
            handler: Box::new(move |req| Box::pin(handler(req))),
        }
    }
}

impl MiddlewareHandler for RequestMiddleware {
    fn stage(&self) -> MiddlewareStage {
        MiddlewareStage::Request
    }

    fn call(
        &self,
        command: Command,
        variables: BTreeMap<String, String>,
    ) -> BoxFuture<'static, Result<CommandResult, HandlerError>> {
        let input = MiddlewareRequest {
            call: command.call.unwrap_or_default(),
            params: command.params,
            request: command.request.unwrap_or_default(),
            variables,
        };
        let fut = (self.handler)(input);
        Box::pin(async move {
            Ok(match fut.await? {
                RequestOutcome::Call { target, params } => CommandResult::Call { target, params },
                RequestOutcome::Respond(response) => CommandResult::Response(response),
            })
        })
    }
}

/// Response stage handler.
pub struct ResponseMiddleware {
    handler: ResponseFn,
}

impl ResponseMiddleware {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(MiddlewareResponse) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<HttpResponse, HandlerError>> + Send + 'static,
    {
        Self {
            handler: Box::new(move |res| Box::pin(handler(res))),
        }
    }
}

impl MiddlewareHandler for ResponseMiddleware {
    fn stage(&self) -> MiddlewareStage {
        MiddlewareStage::Response
    }

    fn call(
        &self,
        command: Command,
        variables: BTreeMap<String, String>,
    ) -> BoxFuture<'static, Result<CommandResult, HandlerError>> {
        let input = MiddlewareResponse {
            request: command.request.unwrap_or_default(),
            response: command.response.unwrap_or_default(),
            transport: command.transport,
            return_value: command.return_value,
            variables,
        };
        let fut = (self.handler)(input);
        Box::pin(async move { Ok(CommandResult::Response(fut.await?)) })
    }
}

/// Response sent when a middleware stage fails.
pub fn failure_response(err: &HandlerError) -> HttpResponse {
    HttpResponse::new("500 Internal Server Error", err.message.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_command() -> Command {
        Command {
            name: "request".into(),
            call: Some(ActionKey::new("users", "1.*", "read")),
            params: vec![Param::new("id", 1)],
            stage: Some(MiddlewareStage::Request),
            request: Some(HttpRequest {
                method: "GET".into(),
                url: "http://example.com/users/1".into(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_request_middleware_rewrites_call() {
        let mw = RequestMiddleware::new(|mut req| async move {
            req.params.push(Param::new("tenant", "acme"));
            Ok(RequestOutcome::Call {
                target: req.call,
                params: req.params,
            })
        });
        assert_eq!(mw.stage(), MiddlewareStage::Request);

        let result = mw.call(request_command(), BTreeMap::new()).await.unwrap();
        match result {
            CommandResult::Call { target, params } => {
                assert_eq!(target.version, "1.*");
                assert_eq!(params.len(), 2);
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_middleware_early_response() {
        let mw = RequestMiddleware::new(|req| async move {
            if req.request.method == "GET" {
                return Ok(RequestOutcome::Respond(HttpResponse::new("403 Forbidden", "no")));
            }
            Ok(RequestOutcome::Call {
                target: req.call,
                params: req.params,
            })
        });

        let result = mw.call(request_command(), BTreeMap::new()).await.unwrap();
        assert_eq!(
            result,
            CommandResult::Response(HttpResponse::new("403 Forbidden", "no"))
        );
    }

    #[tokio::test]
    async fn test_response_middleware_defaults() {
        let mw = ResponseMiddleware::new(|res| async move {
            assert_eq!(res.response.status, "200 OK");
            assert_eq!(res.variables.get("env").map(String::as_str), Some("test"));
            Ok(res.response.with_header("X-Env", "test"))
        });

        let mut variables = BTreeMap::new();
        variables.insert("env".to_string(), "test".to_string());
        let command = Command {
            stage: Some(MiddlewareStage::Response),
            ..Default::default()
        };

        match mw.call(command, variables).await.unwrap() {
            CommandResult::Response(response) => {
                assert_eq!(response.headers["X-Env"], "test");
                assert_eq!(response.version, "1.1");
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_failure_response() {
        let response = failure_response(&HandlerError::new("broken"));
        assert_eq!(response.status, "500 Internal Server Error");
        assert_eq!(response.body, Value::from("broken"));
    }
}
