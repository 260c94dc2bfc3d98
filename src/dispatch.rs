//! Dispatch loop.
//!
//! Each request frame moves through
//! `Idle → Decoding → Resolving → Invoking → Merging → Encoding → Idle`.
//! Every syntactically valid request gets a reply frame: decode, resolution,
//! validation, handler and timeout failures are recorded as error entries in
//! the reply's Transport. Only a reply that cannot be encoded at all ends in
//! `Failed` without a frame.
//!
//! [`Dispatcher::serve`] runs the loop for every accepted connection;
//! [`Dispatcher::process_command`] runs a single pass for local invocation.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::channel::{Connection, Listener};
use crate::codec::{Naming, PayloadCodec, Value};
use crate::command::{Command, CommandReply, CommandResult, MiddlewareStage};
use crate::error::{CallmeshError, HandlerError, Result};
use crate::handler::{failure_response, HandlerRegistry, RequestContext, Runtime};
use crate::param::validate_params;
use crate::protocol::{
    meta, Frame, FrameBuffer, FrameReader, Signal, Tag, DEFAULT_MAX_PARTS, DEFAULT_MAX_PART_SIZE,
};
use crate::transport::{ActionKey, ErrorRecord, Transport};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

/// Default maximum in-flight requests across all connections.
pub const DEFAULT_MAX_CONCURRENT: usize = 256;

/// Called for every handler failure.
pub type ErrorCallback = Arc<dyn Fn(&ActionKey, &HandlerError) + Send + Sync>;

/// State of one request in the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Idle,
    Decoding,
    Resolving,
    Invoking,
    Merging,
    Encoding,
    Failed,
}

impl DispatchState {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchState::Idle => "idle",
            DispatchState::Decoding => "decoding",
            DispatchState::Resolving => "resolving",
            DispatchState::Invoking => "invoking",
            DispatchState::Merging => "merging",
            DispatchState::Encoding => "encoding",
            DispatchState::Failed => "failed",
        }
    }
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks and logs state transitions of one request.
struct Machine {
    state: DispatchState,
    request_id: String,
}

impl Machine {
    fn new() -> Self {
        Self {
            state: DispatchState::Idle,
            request_id: String::new(),
        }
    }

    fn enter(&mut self, next: DispatchState) {
        debug!(
            request_id = %self.request_id,
            from = %self.state,
            state = %next,
            "Dispatch state"
        );
        self.state = next;
    }
}

/// Result of processing one frame.
#[derive(Debug)]
pub struct DispatchOutcome {
    /// `Idle` after a reply was produced, `Failed` otherwise.
    pub state: DispatchState,
    pub frame: Option<Frame>,
}

/// Turns request frames into reply frames.
pub struct Dispatcher {
    runtime: Arc<Runtime>,
    registry: Arc<HandlerRegistry>,
    codec: PayloadCodec,
    naming: Naming,
    timeout: Duration,
    max_concurrent: usize,
    writer_config: WriterConfig,
    on_error: Option<ErrorCallback>,
}

impl Dispatcher {
    pub fn new(runtime: Runtime, registry: HandlerRegistry) -> Self {
        Self {
            runtime: Arc::new(runtime),
            registry: Arc::new(registry),
            codec: PayloadCodec::new(),
            naming: Naming::default(),
            timeout: DEFAULT_TIMEOUT,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            writer_config: WriterConfig::default(),
            on_error: None,
        }
    }

    pub fn with_codec(mut self, codec: PayloadCodec) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_naming(mut self, naming: Naming) -> Self {
        self.naming = naming;
        self
    }

    /// Timeout used when neither the request nor the action schema sets one.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_concurrent(mut self, limit: usize) -> Self {
        self.max_concurrent = limit.max(1);
        self
    }

    pub fn with_writer_config(mut self, config: WriterConfig) -> Self {
        self.writer_config = config;
        self
    }

    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn naming(&self) -> Naming {
        self.naming
    }

    fn component_key(&self, action: &str) -> ActionKey {
        ActionKey::new(
            self.runtime.name.clone(),
            self.runtime.version.clone(),
            action,
        )
    }

    fn report_error(&self, key: &ActionKey, err: &HandlerError) {
        warn!(action = %key, error = %err, "Handler failed");
        if let Some(callback) = &self.on_error {
            callback(key, err);
        }
    }

    /// Process one request frame into its reply.
    pub async fn process(&self, frame: Frame) -> DispatchOutcome {
        let mut machine = Machine::new();
        machine.enter(DispatchState::Decoding);

        let action = match &frame.tag {
            Tag::Request(action) => action.clone(),
            other => {
                warn!(tag = ?other, "Dispatcher only processes request frames");
                machine.enter(DispatchState::Failed);
                return DispatchOutcome {
                    state: machine.state,
                    frame: None,
                };
            }
        };

        if frame.payload.len() > 1 && frame.payload.iter().rev().skip(1).any(|p| !p.is_empty()) {
            debug!(action = %action, "Ignoring schema mappings sent with the request");
        }

        let decoded = frame
            .body()
            .ok_or_else(|| CallmeshError::PayloadDecode {
                offset: None,
                message: "Request frame has no payload".to_string(),
            })
            .and_then(|body| self.codec.decode(body))
            .and_then(|value| Command::from_value(&value));

        let command = match decoded {
            Ok(command) => command,
            Err(e) => {
                let key = self.component_key(&action);
                warn!(action = %key, error = %e, "Cannot decode request");
                let mut transport = Transport::new(uuid::Uuid::new_v4().to_string(), key.clone());
                transport.add_error(key.clone(), ErrorRecord::from(HandlerError::from(e)));
                return self.encode_service_reply(&frame, &mut machine, action, transport, None, &key);
            }
        };

        match command.stage {
            Some(stage) => self.run_middleware(&frame, &mut machine, command, stage).await,
            None => self.run_action(&frame, &mut machine, action, command).await,
        }
    }

    async fn run_action(
        &self,
        frame: &Frame,
        machine: &mut Machine,
        frame_action: String,
        mut command: Command,
    ) -> DispatchOutcome {
        machine.enter(DispatchState::Resolving);

        let call = command.call.take().unwrap_or_default();
        let or = |value: String, fallback: &str| {
            if value.is_empty() {
                fallback.to_string()
            } else {
                value
            }
        };
        let fallback_action = if command.name.is_empty() {
            frame_action.as_str()
        } else {
            command.name.as_str()
        };
        let requested = ActionKey::new(
            or(call.service, &self.runtime.name),
            or(call.version, &self.runtime.version),
            or(call.action, fallback_action),
        );
        let name = or(std::mem::take(&mut command.name), &requested.action);

        let transport = command.transport.take().unwrap_or_else(|| {
            Transport::new(uuid::Uuid::new_v4().to_string(), requested.clone())
        });
        machine.request_id = transport.meta.id.clone();

        let resolved = self
            .runtime
            .schema
            .resolve_action(&requested.service, &requested.version, &requested.action)
            .and_then(|(version, schema)| {
                let key = ActionKey::new(requested.service.clone(), version, requested.action.clone());
                match self.registry.get(&key) {
                    Some(handler) => Ok((key, schema, handler)),
                    None => Err(CallmeshError::ActionNotFound {
                        service: key.service,
                        version: key.version,
                        action: key.action,
                    }),
                }
            });

        let (key, schema, handler) = match resolved {
            Ok(resolved) => resolved,
            Err(e) => {
                warn!(action = %requested, error = %e, "Cannot resolve action");
                let mut transport = transport;
                transport.add_error(requested.clone(), ErrorRecord::from(HandlerError::from(e)));
                return self.encode_service_reply(frame, machine, name, transport, None, &requested);
            }
        };

        machine.enter(DispatchState::Invoking);

        let params = match validate_params(schema, std::mem::take(&mut command.params)) {
            Ok(params) => params,
            Err(e) => {
                let err = HandlerError::from(e);
                self.report_error(&key, &err);
                let mut transport = transport;
                transport.add_error(key.clone(), ErrorRecord::from(err));
                return self.encode_service_reply(frame, machine, name, transport, None, &key);
            }
        };

        let timeout = command
            .timeout_ms
            .or(schema.timeout_ms)
            .map(Duration::from_millis)
            .unwrap_or(self.timeout);
        let deadline = Instant::now() + timeout;

        let snapshot = transport.clone();
        let ctx = RequestContext::new(
            self.runtime.clone(),
            key.clone(),
            params,
            transport,
            schema.return_type,
            deadline,
        );

        debug!(action = %key, request_id = %machine.request_id, ?timeout, "Invoking handler");
        let mut task = tokio::spawn(handler.call(ctx));
        let result = match tokio::time::timeout_at(deadline, &mut task).await {
            Ok(Ok(Ok(ctx))) => Ok(ctx.into_parts()),
            Ok(Ok(Err(err))) => Err(err),
            Ok(Err(join_err)) => Err(HandlerError::new(format!("Handler panicked: {}", join_err))),
            Err(_) => {
                task.abort();
                machine.enter(DispatchState::Failed);
                Err(HandlerError::from(CallmeshError::Timeout {
                    after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }))
            }
        };

        machine.enter(DispatchState::Merging);
        let (transport, return_value) = match result {
            Ok(parts) => parts,
            Err(err) => {
                self.report_error(&key, &err);
                let mut transport = snapshot;
                transport.add_error(key.clone(), ErrorRecord::from(err));
                (transport, None)
            }
        };

        self.encode_service_reply(frame, machine, name, transport, return_value, &key)
    }

    fn encode_service_reply(
        &self,
        frame: &Frame,
        machine: &mut Machine,
        name: String,
        transport: Transport,
        return_value: Option<Value>,
        key: &ActionKey,
    ) -> DispatchOutcome {
        machine.enter(DispatchState::Encoding);

        let flags = transport.response_meta(&key.service, &key.version);
        let mut fallback = transport.fragment();
        fallback.meta.level = transport.meta.level;
        let reply = CommandReply {
            name,
            result: CommandResult::Service {
                transport,
                return_value,
            },
        };

        let encoded = self.codec.encode(&reply.to_value(self.naming));
        let (flags, body) = match encoded {
            Ok(body) => (flags, body),
            Err(e) => {
                warn!(action = %key, error = %e, "Cannot encode reply, sending error only");
                fallback.add_error(key.clone(), ErrorRecord::from(HandlerError::from(e)));
                let reply = CommandReply {
                    name: reply.name,
                    result: CommandResult::Service {
                        transport: fallback,
                        return_value: None,
                    },
                };
                match self.codec.encode(&reply.to_value(self.naming)) {
                    Ok(body) => (vec![meta::EMPTY], body),
                    Err(e) => {
                        error!(action = %key, error = %e, "Cannot encode error reply");
                        machine.enter(DispatchState::Failed);
                        return DispatchOutcome {
                            state: machine.state,
                            frame: None,
                        };
                    }
                }
            }
        };

        let reply = frame.reply(flags, Bytes::from(body));
        machine.enter(DispatchState::Idle);
        DispatchOutcome {
            state: machine.state,
            frame: Some(reply),
        }
    }

    async fn run_middleware(
        &self,
        frame: &Frame,
        machine: &mut Machine,
        command: Command,
        stage: MiddlewareStage,
    ) -> DispatchOutcome {
        machine.enter(DispatchState::Resolving);

        let key = self.component_key(&command.name);
        let name = command.name.clone();
        let handler = match stage {
            MiddlewareStage::Request => self.registry.request_middleware(),
            MiddlewareStage::Response => self.registry.response_middleware(),
        };

        let result = match handler {
            None => Err(HandlerError::new(format!(
                "No {:?} middleware registered in \"{}\" ({})",
                stage, self.runtime.name, self.runtime.version
            ))),
            Some(handler) => {
                machine.enter(DispatchState::Invoking);
                let timeout = command
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(self.timeout);
                let deadline = Instant::now() + timeout;
                let mut task = tokio::spawn(handler.call(command, self.runtime.variables.clone()));
                match tokio::time::timeout_at(deadline, &mut task).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(join_err)) => {
                        Err(HandlerError::new(format!("Middleware panicked: {}", join_err)))
                    }
                    Err(_) => {
                        task.abort();
                        machine.enter(DispatchState::Failed);
                        Err(HandlerError::from(CallmeshError::Timeout {
                            after_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        }))
                    }
                }
            }
        };

        let result = result.unwrap_or_else(|err| {
            self.report_error(&key, &err);
            CommandResult::Response(failure_response(&err))
        });

        machine.enter(DispatchState::Encoding);
        let reply = CommandReply { name, result };
        let body = match self.codec.encode(&reply.to_value(self.naming)) {
            Ok(body) => body,
            Err(e) => {
                let err = HandlerError::from(e);
                self.report_error(&key, &err);
                let reply = CommandReply {
                    name: reply.name,
                    result: CommandResult::Response(failure_response(&err)),
                };
                match self.codec.encode(&reply.to_value(self.naming)) {
                    Ok(body) => body,
                    Err(e) => {
                        error!(error = %e, "Cannot encode middleware reply");
                        machine.enter(DispatchState::Failed);
                        return DispatchOutcome {
                            state: machine.state,
                            frame: None,
                        };
                    }
                }
            }
        };

        let reply = frame.reply(vec![meta::EMPTY], Bytes::from(body));
        machine.enter(DispatchState::Idle);
        DispatchOutcome {
            state: machine.state,
            frame: Some(reply),
        }
    }

    /// Run one request given as a payload value and return the reply payload.
    ///
    /// # Errors
    ///
    /// Fails when the request cannot be encoded or no reply could be produced.
    pub async fn process_command(&self, action: &str, payload: &Value) -> Result<Value> {
        let body = self.codec.encode(payload)?;
        let frame = Frame::request(action, vec![Bytes::from(body)]);
        let outcome = self.process(frame).await;
        let reply = outcome.frame.ok_or_else(|| {
            CallmeshError::Protocol(format!("No reply produced for \"{}\"", action))
        })?;
        let body = reply
            .body()
            .ok_or_else(|| CallmeshError::Protocol("Reply has no payload".to_string()))?;
        self.codec.decode(body)
    }

    /// Accept connections until `shutdown` resolves.
    pub async fn serve<F>(self: Arc<Self>, listener: Listener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let connection = accepted?;
                    let dispatcher = self.clone();
                    let permits = permits.clone();
                    tokio::spawn(async move {
                        if let Err(e) = dispatcher.serve_connection(connection, permits).await {
                            error!("Connection error: {}", e);
                        }
                    });
                }
            }
        }
    }

    /// Read frames from one connection and reply on the same connection.
    pub async fn serve_connection(
        self: Arc<Self>,
        connection: Connection,
        permits: Arc<Semaphore>,
    ) -> Result<()> {
        let (reader, writer) = connection.into_split();
        let (writer, _writer_task) = spawn_writer_task(writer, self.writer_config.clone());
        let buffer = FrameBuffer::with_limits(DEFAULT_MAX_PART_SIZE, DEFAULT_MAX_PARTS);
        let mut frames = FrameReader::with_buffer(reader, buffer);

        while let Some(frame) = frames.next_frame().await? {
            let tag = frame.tag.clone();
            match tag {
                Tag::Control(Signal::Ping) => {
                    let pong = Frame::control(frame.identity.clone(), Signal::Pong);
                    writer.send_frame(&pong).await?;
                }
                Tag::Control(Signal::Pong) => trace!("Received pong"),
                Tag::Response(_) => warn!("Ignoring unexpected response frame"),
                Tag::Request(_) => {
                    let permit = permits
                        .clone()
                        .acquire_owned()
                        .await
                        .map_err(|_| CallmeshError::Protocol("Request limiter closed".to_string()))?;
                    let dispatcher = self.clone();
                    let writer = writer.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        dispatcher.reply(frame, &writer).await;
                    });
                }
            }
        }

        debug!("Connection closed by peer");
        Ok(())
    }

    async fn reply(&self, frame: Frame, writer: &WriterHandle) {
        let outcome = self.process(frame).await;
        if let Some(reply) = outcome.frame {
            if let Err(e) = writer.send_frame(&reply).await {
                error!("Failed to send reply: {}", e);
            }
        }
    }
}

/// Variables given as `NAME=VALUE` pairs.
pub fn parse_variables<I, S>(pairs: I) -> Result<BTreeMap<String, String>>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    pairs
        .into_iter()
        .map(|pair| {
            let pair = pair.as_ref();
            pair.split_once('=')
                .filter(|(name, _)| !name.is_empty())
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .ok_or_else(|| CallmeshError::Config(format!("Invalid variable \"{}\", expected NAME=VALUE", pair)))
        })
        .collect()
}
