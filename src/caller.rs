//! Downstream service calls.
//!
//! A [`ServiceCaller`] delivers one resolved call to another component and
//! returns the Transport fragment it produced. [`ChannelCaller`] talks to the
//! component over its socket; [`LocalCaller`] hands the frame straight to an
//! in-process [`Dispatcher`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;

use crate::channel::{connect, Address, Connection};
use crate::codec::{Naming, PayloadCodec};
use crate::command::{Command, CommandReply, CommandResult};
use crate::dispatch::Dispatcher;
use crate::error::{CallmeshError, Result};
use crate::handler::BoxFuture;
use crate::param::Param;
use crate::protocol::{read_frame, write_frame, Frame, Tag};
use crate::transport::{ActionKey, Transport};

/// A resolved call to another service action.
#[derive(Debug, Clone)]
pub struct CallRequest {
    /// Address the target component listens on.
    pub address: String,
    /// Target with a concrete version.
    pub target: ActionKey,
    pub params: Vec<Param>,
    /// Empty fragment of the caller's Transport.
    pub transport: Transport,
    pub timeout: Option<Duration>,
}

/// What a downstream call returned.
#[derive(Debug, Clone)]
pub struct CallReply {
    pub transport: Transport,
    pub return_value: Option<crate::codec::Value>,
}

/// Delivers calls to other components.
pub trait ServiceCaller: Send + Sync + 'static {
    fn call(&self, request: CallRequest) -> BoxFuture<'static, Result<CallReply>>;
}

fn request_frame(request: &CallRequest, codec: &PayloadCodec, naming: Naming) -> Result<Frame> {
    let mut command = Command::call(
        request.target.clone(),
        request.params.clone(),
        request.transport.clone(),
    );
    command.timeout_ms = request
        .timeout
        .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
    let body = codec.encode(&command.to_value(naming))?;
    Ok(Frame::request(
        request.target.action.clone(),
        vec![Bytes::from(body)],
    ))
}

fn reply_from_frame(frame: &Frame, codec: &PayloadCodec) -> Result<CallReply> {
    if !matches!(frame.tag, Tag::Response(_)) {
        return Err(CallmeshError::Protocol(
            "Expected a response frame".to_string(),
        ));
    }
    let body = frame
        .body()
        .ok_or_else(|| CallmeshError::Protocol("Response frame has no payload".to_string()))?;
    let reply = CommandReply::from_value(&codec.decode(body)?)?;
    match reply.result {
        CommandResult::Service {
            transport,
            return_value,
        } => Ok(CallReply {
            transport,
            return_value,
        }),
        _ => Err(CallmeshError::Protocol(
            "Service call answered with a middleware result".to_string(),
        )),
    }
}

/// Idle connections kept per address.
const MAX_IDLE_PER_ADDRESS: usize = 8;

/// Calls components over their listening socket.
///
/// A connection carries one call at a time. After a complete reply it goes
/// back to an idle pool keyed by address and is reused by the next call to
/// that address. Connections of calls that fail or are abandoned at their
/// deadline are closed, since a late reply may still arrive on them.
#[derive(Clone)]
pub struct ChannelCaller {
    codec: PayloadCodec,
    naming: Naming,
    idle: Arc<Mutex<HashMap<String, Vec<Connection>>>>,
}

impl ChannelCaller {
    pub fn new(codec: PayloadCodec, naming: Naming) -> Self {
        Self {
            codec,
            naming,
            idle: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Idle connections pooled for `address`.
    pub fn idle_count(&self, address: &str) -> usize {
        self.idle
            .lock()
            .map(|idle| idle.get(address).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn take_idle(&self, address: &str) -> Option<Connection> {
        self.idle.lock().ok()?.get_mut(address)?.pop()
    }

    fn put_idle(&self, address: &str, connection: Connection) {
        if let Ok(mut idle) = self.idle.lock() {
            let pooled = idle.entry(address.to_string()).or_default();
            if pooled.len() < MAX_IDLE_PER_ADDRESS {
                pooled.push(connection);
            }
        }
    }

    async fn exchange(&self, address: &Address, request: &CallRequest) -> Result<CallReply> {
        let frame = request_frame(request, &self.codec, self.naming)?;

        if let Some(connection) = self.take_idle(&request.address) {
            match round_trip(connection, &frame).await {
                Ok((connection, reply)) => return self.finish(&request.address, connection, &reply),
                // The peer may have closed the socket while it sat idle.
                Err(CallmeshError::TransportRead(e) | CallmeshError::TransportWrite(e)) => {
                    tracing::debug!(address = %address, error = %e, "Pooled connection is stale, reconnecting");
                }
                Err(e) => return Err(e),
            }
        }

        let connection = connect(address).await?;
        let (connection, reply) = round_trip(connection, &frame).await?;
        self.finish(&request.address, connection, &reply)
    }

    fn finish(&self, address: &str, connection: Connection, reply: &Frame) -> Result<CallReply> {
        let reply = reply_from_frame(reply, &self.codec)?;
        self.put_idle(address, connection);
        Ok(reply)
    }
}

async fn round_trip(mut connection: Connection, frame: &Frame) -> Result<(Connection, Frame)> {
    write_frame(&mut connection, frame).await?;
    let reply = read_frame(&mut connection).await?;
    Ok((connection, reply))
}

impl Default for ChannelCaller {
    fn default() -> Self {
        Self::new(PayloadCodec::new(), Naming::default())
    }
}

impl ServiceCaller for ChannelCaller {
    fn call(&self, request: CallRequest) -> BoxFuture<'static, Result<CallReply>> {
        let this = self.clone();
        Box::pin(async move {
            if request.address.is_empty() {
                return Err(CallmeshError::Config(format!(
                    "No address registered for service \"{}\" ({})",
                    request.target.service, request.target.version
                )));
            }
            let address = Address::parse(&request.address)?;

            tracing::debug!(
                address = %address,
                target = %request.target,
                "Calling downstream service"
            );
            this.exchange(&address, &request).await
        })
    }
}

/// Calls an in-process dispatcher without touching a socket.
#[derive(Clone)]
pub struct LocalCaller {
    dispatcher: Arc<Dispatcher>,
    codec: PayloadCodec,
    naming: Naming,
}

impl LocalCaller {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            dispatcher,
            codec: PayloadCodec::new(),
            naming: Naming::default(),
        }
    }
}

impl ServiceCaller for LocalCaller {
    fn call(&self, request: CallRequest) -> BoxFuture<'static, Result<CallReply>> {
        let this = self.clone();
        Box::pin(async move {
            let frame = request_frame(&request, &this.codec, this.naming)?;
            let outcome = this.dispatcher.process(frame).await;
            let reply = outcome.frame.ok_or_else(|| {
                CallmeshError::Protocol(format!("No reply from {}", request.target))
            })?;
            reply_from_frame(&reply, &this.codec)
        })
    }
}

/// Caller for components that never call other services.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCaller;

impl ServiceCaller for NoCaller {
    fn call(&self, request: CallRequest) -> BoxFuture<'static, Result<CallReply>> {
        Box::pin(async move {
            Err(CallmeshError::Config(format!(
                "Service calls are disabled, cannot call {}",
                request.target
            )))
        })
    }
}
