//! Command envelopes exchanged with the gateway.
//!
//! Request body:
//!
//! ```text
//! { command: { name, arguments: { call: {service, version, action}, params,
//!              transport, timeout, meta: {type}, request, response, return } },
//!   meta: { scope } }
//! ```
//!
//! Reply body: `{ command_reply: { name, result } }` where `result` holds a
//! transport and return value (services), a `call` (request middleware) or a
//! `response` (response middleware).

use std::collections::BTreeMap;

use crate::codec::names::{field, field_of, str_field};
use crate::codec::{Map, Naming, Value};
use crate::error::{CallmeshError, Result};
use crate::param::{params_from_value, params_to_value, Param};
use crate::transport::{ActionKey, Transport};

/// Middleware stage carried in `arguments.meta.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareStage {
    Request,
    Response,
}

impl MiddlewareStage {
    pub fn code(self) -> i64 {
        match self {
            MiddlewareStage::Request => 1,
            MiddlewareStage::Response => 2,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(MiddlewareStage::Request),
            2 => Some(MiddlewareStage::Response),
            _ => None,
        }
    }
}

/// HTTP request as seen by the gateway.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HttpRequest {
    pub version: String,
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

/// HTTP response produced by middleware.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub version: String,
    pub status: String,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl HttpResponse {
    pub fn new(status: impl Into<String>, body: impl Into<Value>) -> Self {
        Self {
            version: "1.1".to_string(),
            status: status.into(),
            headers: BTreeMap::new(),
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Numeric part of the status line.
    pub fn status_code(&self) -> Option<u16> {
        self.status.split_whitespace().next()?.parse().ok()
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new("200 OK", "")
    }
}

/// Decoded request command.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Command {
    pub name: String,
    pub scope: String,
    /// Requested target; the version may be a pattern.
    pub call: Option<ActionKey>,
    pub params: Vec<Param>,
    pub transport: Option<Transport>,
    /// Per-call timeout override.
    pub timeout_ms: Option<u64>,
    pub stage: Option<MiddlewareStage>,
    pub request: Option<HttpRequest>,
    pub response: Option<HttpResponse>,
    pub return_value: Option<Value>,
}

impl Command {
    /// Command for calling a service action.
    pub fn call(target: ActionKey, params: Vec<Param>, transport: Transport) -> Self {
        Self {
            name: target.action.clone(),
            call: Some(target),
            params,
            transport: Some(transport),
            ..Default::default()
        }
    }

    /// Decode a request body.
    ///
    /// # Errors
    ///
    /// `PayloadDecode` when the `command` object is missing, `InvalidParam`
    /// when a parameter entry is malformed.
    pub fn from_value(value: &Value) -> Result<Self> {
        let command = field_of(value, "command")
            .and_then(Value::as_map)
            .ok_or_else(|| CallmeshError::PayloadDecode {
                offset: None,
                message: "Command payload is missing".to_string(),
            })?;

        let empty = Map::new();
        let args = field(command, "arguments")
            .and_then(Value::as_map)
            .unwrap_or(&empty);

        let call = field(args, "call").and_then(Value::as_map).map(|c| {
            ActionKey::new(
                str_field(c, "service"),
                str_field(c, "version"),
                str_field(c, "action"),
            )
        });

        // Middleware puts params inside `call`, services next to it
        let params = match field(args, "params") {
            Some(params) => params_from_value(Some(params))?,
            None => params_from_value(
                field(args, "call")
                    .and_then(Value::as_map)
                    .and_then(|c| field(c, "params")),
            )?,
        };

        let stage = field(args, "meta")
            .and_then(Value::as_map)
            .and_then(|m| field(m, "type"))
            .and_then(Value::as_i64)
            .and_then(MiddlewareStage::from_code);

        let scope = field_of(value, "meta")
            .and_then(Value::as_map)
            .map(|m| str_field(m, "scope"))
            .unwrap_or_default();

        Ok(Self {
            name: str_field(command, "name"),
            scope,
            call,
            params,
            transport: field(args, "transport").map(Transport::from_value),
            timeout_ms: field(args, "timeout")
                .and_then(Value::as_i64)
                .and_then(|t| u64::try_from(t).ok()),
            stage,
            request: field(args, "request")
                .and_then(Value::as_map)
                .map(request_from_map),
            response: field(args, "response")
                .and_then(Value::as_map)
                .map(response_from_map),
            return_value: field(args, "return").cloned(),
        })
    }

    /// Encode as a request body.
    pub fn to_value(&self, naming: Naming) -> Value {
        let mut args = Map::new();
        if let Some(call) = &self.call {
            naming.insert(&mut args, "call", key_to_value(call, naming));
        }
        if !self.params.is_empty() {
            naming.insert(&mut args, "params", params_to_value(&self.params, naming));
        }
        if let Some(transport) = &self.transport {
            naming.insert(&mut args, "transport", transport.to_value(naming));
        }
        if let Some(timeout) = self.timeout_ms {
            naming.insert(
                &mut args,
                "timeout",
                Value::Int(i64::try_from(timeout).unwrap_or(i64::MAX)),
            );
        }
        if let Some(stage) = self.stage {
            let mut meta = Map::new();
            naming.insert(&mut meta, "type", Value::Int(stage.code()));
            naming.insert(&mut args, "meta", Value::Map(meta));
        }
        if let Some(request) = &self.request {
            naming.insert(&mut args, "request", request_to_value(request, naming));
        }
        if let Some(response) = &self.response {
            naming.insert(&mut args, "response", response_to_value(response, naming));
        }
        if let Some(return_value) = &self.return_value {
            naming.insert(&mut args, "return", return_value.clone());
        }

        let mut command = Map::new();
        naming.insert(&mut command, "name", Value::from(self.name.as_str()));
        naming.insert(&mut command, "arguments", Value::Map(args));

        let mut meta = Map::new();
        naming.insert(&mut meta, "scope", Value::from(self.scope.as_str()));

        let mut root = Map::new();
        naming.insert(&mut root, "command", Value::Map(command));
        naming.insert(&mut root, "meta", Value::Map(meta));
        Value::Map(root)
    }
}

/// Result carried by a reply.
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResult {
    /// A service action finished.
    Service {
        transport: Transport,
        return_value: Option<Value>,
    },
    /// A request middleware forwards to a service call.
    Call { target: ActionKey, params: Vec<Param> },
    /// A middleware answers with an HTTP response.
    Response(HttpResponse),
}

/// Decoded reply command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandReply {
    pub name: String,
    pub result: CommandResult,
}

impl CommandReply {
    pub fn to_value(&self, naming: Naming) -> Value {
        let mut result = Map::new();
        match &self.result {
            CommandResult::Service {
                transport,
                return_value,
            } => {
                naming.insert(&mut result, "transport", transport.to_value(naming));
                if let Some(value) = return_value {
                    naming.insert(&mut result, "return", value.clone());
                }
            }
            CommandResult::Call { target, params } => {
                let mut call = match key_to_value(target, naming) {
                    Value::Map(map) => map,
                    _ => Map::new(),
                };
                naming.insert(&mut call, "params", params_to_value(params, naming));
                naming.insert(&mut result, "call", Value::Map(call));
            }
            CommandResult::Response(response) => {
                naming.insert(&mut result, "response", response_to_value(response, naming));
            }
        }

        let mut reply = Map::new();
        naming.insert(&mut reply, "name", Value::from(self.name.as_str()));
        naming.insert(&mut reply, "result", Value::Map(result));

        let mut root = Map::new();
        naming.insert(&mut root, "command_reply", Value::Map(reply));
        Value::Map(root)
    }

    /// Decode a reply body.
    ///
    /// # Errors
    ///
    /// `PayloadDecode` when neither a transport, call nor response result is
    /// present.
    pub fn from_value(value: &Value) -> Result<Self> {
        let missing = |what: &str| CallmeshError::PayloadDecode {
            offset: None,
            message: format!("Reply is missing {}", what),
        };

        let reply = field_of(value, "command_reply")
            .and_then(Value::as_map)
            .ok_or_else(|| missing("command_reply"))?;
        let result = field(reply, "result")
            .and_then(Value::as_map)
            .ok_or_else(|| missing("result"))?;

        let result = if let Some(transport) = field(result, "transport") {
            CommandResult::Service {
                transport: Transport::from_value(transport),
                return_value: field(result, "return").cloned(),
            }
        } else if let Some(call) = field(result, "call").and_then(Value::as_map) {
            CommandResult::Call {
                target: ActionKey::new(
                    str_field(call, "service"),
                    str_field(call, "version"),
                    str_field(call, "action"),
                ),
                params: params_from_value(field(call, "params"))?,
            }
        } else if let Some(response) = field(result, "response").and_then(Value::as_map) {
            CommandResult::Response(response_from_map(response))
        } else {
            return Err(missing("transport, call or response"));
        };

        Ok(Self {
            name: str_field(reply, "name"),
            result,
        })
    }
}

fn key_to_value(key: &ActionKey, naming: Naming) -> Value {
    let mut map = Map::new();
    naming.insert(&mut map, "service", Value::from(key.service.as_str()));
    naming.insert(&mut map, "version", Value::from(key.version.as_str()));
    naming.insert(&mut map, "action", Value::from(key.action.as_str()));
    Value::Map(map)
}

fn headers_to_value(headers: &BTreeMap<String, String>) -> Value {
    Value::Map(
        headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect(),
    )
}

fn headers_from_map(map: &Map) -> BTreeMap<String, String> {
    field(map, "headers")
        .and_then(Value::as_map)
        .map(|headers| {
            headers
                .iter()
                .filter_map(|(k, v)| match v {
                    Value::String(s) => Some((k.clone(), s.clone())),
                    // multi-valued headers keep the first value
                    Value::Array(items) => items
                        .first()
                        .and_then(Value::as_str)
                        .map(|s| (k.clone(), s.to_string())),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

fn request_to_value(request: &HttpRequest, naming: Naming) -> Value {
    let mut map = Map::new();
    naming.insert(&mut map, "version", Value::from(request.version.as_str()));
    naming.insert(&mut map, "method", Value::from(request.method.as_str()));
    naming.insert(&mut map, "url", Value::from(request.url.as_str()));
    naming.insert(&mut map, "headers", headers_to_value(&request.headers));
    naming.insert(&mut map, "body", request.body.clone());
    Value::Map(map)
}

fn request_from_map(map: &Map) -> HttpRequest {
    let version = str_field(map, "version");
    HttpRequest {
        version: if version.is_empty() { "1.1".to_string() } else { version },
        method: str_field(map, "method").to_uppercase(),
        url: str_field(map, "url"),
        headers: headers_from_map(map),
        body: field(map, "body").cloned().unwrap_or_default(),
    }
}

fn response_to_value(response: &HttpResponse, naming: Naming) -> Value {
    let mut map = Map::new();
    naming.insert(&mut map, "version", Value::from(response.version.as_str()));
    naming.insert(&mut map, "status", Value::from(response.status.as_str()));
    naming.insert(&mut map, "headers", headers_to_value(&response.headers));
    naming.insert(&mut map, "body", response.body.clone());
    Value::Map(map)
}

fn response_from_map(map: &Map) -> HttpResponse {
    let defaults = HttpResponse::default();
    let version = str_field(map, "version");
    let status = str_field(map, "status");
    HttpResponse {
        version: if version.is_empty() { defaults.version } else { version },
        status: if status.is_empty() { defaults.status } else { status },
        headers: headers_from_map(map),
        body: field(map, "body").cloned().unwrap_or(defaults.body),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_command_roundtrip() {
        let transport = Transport::new("r1", ActionKey::new("users", "0.*", "read"));
        let mut command = Command::call(
            ActionKey::new("users", "0.*", "read"),
            vec![Param::new("id", 42)],
            transport,
        );
        command.timeout_ms = Some(500);
        command.scope = "public".into();

        for naming in [Naming::Compact, Naming::Full] {
            let mut back = Command::from_value(&command.to_value(naming)).unwrap();
            if let (Some(b), Some(c)) = (back.transport.as_mut(), command.transport.as_ref()) {
                b.meta.datetime = c.meta.datetime;
            }
            assert_eq!(back, command);
        }
    }

    #[test]
    fn test_missing_command_is_decode_error() {
        let err = Command::from_value(&Value::empty_map()).unwrap_err();
        assert!(matches!(err, CallmeshError::PayloadDecode { offset: None, .. }));
    }

    #[test]
    fn test_minimal_command_defaults() {
        let value = Value::from_pairs([(
            "command",
            Value::from_pairs([("name", Value::from("read"))]),
        )]);
        let command = Command::from_value(&value).unwrap();
        assert_eq!(command.name, "read");
        assert!(command.call.is_none());
        assert!(command.params.is_empty());
        assert!(command.transport.is_none());
        assert!(command.stage.is_none());
    }

    #[test]
    fn test_middleware_params_inside_call() {
        let value = Value::from_pairs([(
            "c",
            Value::from_pairs([
                ("n", Value::from("request")),
                (
                    "ar",
                    Value::from_pairs([
                        (
                            "c",
                            Value::from_pairs([
                                ("s", Value::from("users")),
                                ("vr", Value::from("1.0")),
                                ("a", Value::from("read")),
                                ("p", Value::Array(vec![Param::new("id", 1).to_value(Naming::Compact)])),
                            ]),
                        ),
                        ("M", Value::from_pairs([("ty", Value::Int(1))])),
                        (
                            "rq",
                            Value::from_pairs([
                                ("mt", Value::from("get")),
                                ("h", Value::from_pairs([("Accept", Value::Array(vec![Value::from("*/*")]))])),
                            ]),
                        ),
                    ]),
                ),
            ]),
        )]);
        // "c" is the compact key for `call`, so the top-level command must use
        // its own compact key to be found
        assert!(Command::from_value(&value).is_err());

        let Value::Map(mut root) = value else { unreachable!() };
        let inner = root.remove("c").unwrap();
        root.insert("cm".into(), inner);
        let command = Command::from_value(&Value::Map(root)).unwrap();
        assert_eq!(command.stage, Some(MiddlewareStage::Request));
        assert_eq!(command.params, vec![Param::new("id", 1)]);
        let request = command.request.unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.headers["Accept"], "*/*");
    }

    #[test]
    fn test_reply_variants_roundtrip() {
        let replies = [
            CommandReply {
                name: "read".into(),
                result: CommandResult::Service {
                    transport: Transport::new("x", ActionKey::new("a", "1", "b")),
                    return_value: Some(Value::Bool(true)),
                },
            },
            CommandReply {
                name: "request".into(),
                result: CommandResult::Call {
                    target: ActionKey::new("users", "1.0", "read"),
                    params: vec![Param::new("id", 3)],
                },
            },
            CommandReply {
                name: "response".into(),
                result: CommandResult::Response(
                    HttpResponse::new("404 Not Found", "nope").with_header("X-Id", "1"),
                ),
            },
        ];

        for reply in replies {
            let mut back = CommandReply::from_value(&reply.to_value(Naming::Compact)).unwrap();
            if let (
                CommandResult::Service { transport: b, .. },
                CommandResult::Service { transport: r, .. },
            ) = (&mut back.result, &reply.result)
            {
                b.meta.datetime = r.meta.datetime;
            }
            assert_eq!(back, reply);
        }
    }

    #[test]
    fn test_reply_without_result_kind() {
        let value = Value::from_pairs([(
            "command_reply",
            Value::from_pairs([("result", Value::empty_map())]),
        )]);
        assert!(CommandReply::from_value(&value).is_err());
    }

    #[test]
    fn test_status_code() {
        assert_eq!(HttpResponse::new("503 Service Unavailable", "").status_code(), Some(503));
        assert_eq!(HttpResponse::new("", "").status_code(), None);
    }
}
