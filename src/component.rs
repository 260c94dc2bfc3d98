//! Component builder and process lifecycle.
//!
//! [`Component`] collects actions, schemas, middleware, resources and
//! lifecycle callbacks, then either:
//! 1. binds its listening channel, runs the startup callback, and serves
//!    requests until ctrl-c, or
//! 2. runs a single request read from a JSON file and prints the reply.
//!
//! # Example
//!
//! ```ignore
//! use callmesh::component::Component;
//!
//! fn main() -> std::process::ExitCode {
//!     Component::new()
//!         .action("read", |mut ctx| async move {
//!             ctx.set_entity(Value::from_pairs([("id", Value::Int(42))]))?;
//!             Ok(ctx)
//!         })
//!         .run()
//! }
//! ```

use std::collections::BTreeSet;
use std::future::Future;
use std::io::{Read, Write};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::caller::{ChannelCaller, ServiceCaller};
use crate::channel::Listener;
use crate::cli::Args;
use crate::codec::{PayloadCodec, Value};
use crate::config::{load_definitions, ComponentKind, EngineSettings};
use crate::dispatch::{Dispatcher, ErrorCallback};
use crate::error::{CallmeshError, HandlerError, Result};
use crate::handler::{
    HandlerRegistry, HandlerResult, RequestContext, RequestMiddleware, Resources,
    ResponseMiddleware, Runtime,
};
use crate::logging::{self, Verbosity};
use crate::schema::{ActionSchema, SchemaTable};
use crate::transport::ActionKey;
use crate::writer::WriterConfig;

/// Lifecycle callback, run with the component runtime.
pub type LifecycleHook =
    Box<dyn FnOnce(&Runtime) -> std::result::Result<(), HandlerError> + Send>;

type Registration = Box<dyn FnOnce(&mut HandlerRegistry, ActionKey) + Send>;

/// Builder for a service or middleware component.
pub struct Component {
    actions: Vec<(String, Registration)>,
    own_schemas: Vec<ActionSchema>,
    schema: SchemaTable,
    request_middleware: Option<RequestMiddleware>,
    response_middleware: Option<ResponseMiddleware>,
    resources: Resources,
    caller: Option<Arc<dyn ServiceCaller>>,
    writer_config: WriterConfig,
    on_startup: Option<LifecycleHook>,
    on_shutdown: Option<LifecycleHook>,
    on_error: Option<ErrorCallback>,
}

impl Component {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
            own_schemas: Vec::new(),
            schema: SchemaTable::new(),
            request_middleware: None,
            response_middleware: None,
            resources: Resources::new(),
            caller: None,
            writer_config: WriterConfig::default(),
            on_startup: None,
            on_shutdown: None,
            on_error: None,
        }
    }

    /// Register an action of this component.
    pub fn action<F, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.actions.push((
            name.to_string(),
            Box::new(move |registry: &mut HandlerRegistry, key: ActionKey| {
                registry.register(key, handler)
            }),
        ));
        self
    }

    /// Register an action whose parameters are decoded into `T`.
    pub fn typed_action<F, T, Fut>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(T, RequestContext) -> Fut + Send + Sync + 'static,
        T: DeserializeOwned + Send + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.actions.push((
            name.to_string(),
            Box::new(move |registry: &mut HandlerRegistry, key: ActionKey| {
                registry.register_typed(key, handler)
            }),
        ));
        self
    }

    /// Schema for one of this component's own actions.
    ///
    /// Actions registered without a schema get an empty one.
    pub fn schema(mut self, schema: ActionSchema) -> Self {
        self.own_schemas.push(schema);
        self
    }

    /// Schema for an action of another service this component calls.
    pub fn service_schema(mut self, service: &str, version: &str, schema: ActionSchema) -> Self {
        self.schema.register(service, version, schema);
        self
    }

    /// Address another service version is reachable at.
    pub fn service_address(mut self, service: &str, version: &str, address: &str) -> Self {
        let file_server = self
            .schema
            .service(service, version)
            .map(|s| s.file_server)
            .unwrap_or(false);
        self.schema
            .register_service(service, version, Some(address.to_string()), file_server);
        self
    }

    pub fn request_middleware(mut self, handler: RequestMiddleware) -> Self {
        self.request_middleware = Some(handler);
        self
    }

    pub fn response_middleware(mut self, handler: ResponseMiddleware) -> Self {
        self.response_middleware = Some(handler);
        self
    }

    /// Share a value with every handler, looked up by type.
    pub fn resource<T: std::any::Any + Send + Sync>(mut self, value: T) -> Self {
        self.resources.insert(value);
        self
    }

    /// Replace how downstream calls reach other components.
    pub fn caller(mut self, caller: Arc<dyn ServiceCaller>) -> Self {
        self.caller = Some(caller);
        self
    }

    pub fn writer_config(mut self, config: WriterConfig) -> Self {
        self.writer_config = config;
        self
    }

    /// Run before the listener accepts connections. An error aborts startup.
    pub fn on_startup<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&Runtime) -> std::result::Result<(), HandlerError> + Send + 'static,
    {
        self.on_startup = Some(Box::new(hook));
        self
    }

    /// Run after the component stops serving.
    pub fn on_shutdown<F>(mut self, hook: F) -> Self
    where
        F: FnOnce(&Runtime) -> std::result::Result<(), HandlerError> + Send + 'static,
    {
        self.on_shutdown = Some(Box::new(hook));
        self
    }

    /// Called for every handler failure.
    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&ActionKey, &HandlerError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Parse the process arguments and run. Never returns on `--help`.
    pub fn run(self) -> ExitCode {
        self.run_with_args(Args::parse())
    }

    pub fn run_with_args(self, args: Args) -> ExitCode {
        logging::init(Verbosity::from_flags(args.debug, args.quiet));
        match args.into_settings() {
            Ok(settings) => self.run_with_settings(settings),
            Err(e) => {
                error!("{}", e);
                ExitCode::FAILURE
            }
        }
    }

    /// Run with explicit settings on a fresh multi-threaded runtime.
    pub fn run_with_settings(self, settings: EngineSettings) -> ExitCode {
        let runtime = match tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                error!("Cannot start async runtime: {}", e);
                return ExitCode::FAILURE;
            }
        };

        let result = runtime.block_on(async move {
            if settings.is_single_shot() {
                let reply = self.run_once(&settings).await?;
                write_reply(&reply)
            } else {
                self.serve(&settings, shutdown_signal()).await
            }
        });

        match result {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("{}", e);
                ExitCode::FAILURE
            }
        }
    }

    /// Validate settings and assemble the dispatcher.
    ///
    /// # Errors
    ///
    /// `Config` for invalid settings, definition file errors.
    pub fn build(&mut self, settings: &EngineSettings) -> Result<Dispatcher> {
        settings.validate()?;

        let mut schema = std::mem::take(&mut self.schema);
        if let Some(path) = &settings.definitions {
            load_definitions(path, &mut schema)?;
        }
        for action in self.own_schemas.drain(..) {
            schema.register(&settings.name, &settings.version, action);
        }

        let mut registry = HandlerRegistry::new();
        let mut names = BTreeSet::new();
        for (name, register) in self.actions.drain(..) {
            let key = ActionKey::new(settings.name.clone(), settings.version.clone(), name.clone());
            if schema.lookup(&key.service, &key.version, &key.action).is_err() {
                debug!(action = %key, "Registering empty schema");
                schema.register(&key.service, &key.version, ActionSchema::new(name.clone()));
            }
            register(&mut registry, key);
            names.insert(name);
        }
        if let Some(handler) = self.request_middleware.take() {
            registry.set_request_middleware(handler);
        }
        if let Some(handler) = self.response_middleware.take() {
            registry.set_response_middleware(handler);
        }

        match settings.component {
            ComponentKind::Service if names.is_empty() => {
                warn!("Service component has no actions")
            }
            ComponentKind::Middleware if !names.is_empty() => {
                warn!("Middleware component ignores its registered actions")
            }
            _ => {}
        }

        let codec = PayloadCodec::with_max_depth(settings.max_depth);
        let caller = self
            .caller
            .take()
            .unwrap_or_else(|| Arc::new(ChannelCaller::new(codec, settings.naming)));

        let runtime = Runtime {
            name: settings.name.clone(),
            version: settings.version.clone(),
            framework_version: settings.framework_version.clone(),
            schema,
            caller,
            resources: std::mem::take(&mut self.resources),
            variables: settings.variables.clone(),
            file_server: settings.file_server.clone(),
        };

        let mut dispatcher = Dispatcher::new(runtime, registry)
            .with_codec(codec)
            .with_naming(settings.naming)
            .with_timeout(settings.timeout)
            .with_max_concurrent(settings.max_concurrent)
            .with_writer_config(self.writer_config.clone());
        if let Some(callback) = self.on_error.take() {
            dispatcher = dispatcher.on_error(callback);
        }
        Ok(dispatcher)
    }

    /// Run one request read from the settings' input file, or stdin.
    ///
    /// # Errors
    ///
    /// Configuration, input or JSON errors; a reply that cannot be produced.
    pub async fn run_once(mut self, settings: &EngineSettings) -> Result<Value> {
        let dispatcher = self.build(settings)?;
        let action = settings
            .action
            .as_deref()
            .ok_or_else(|| CallmeshError::Config("single run needs an action".to_string()))?;

        let input = read_input(settings.input.as_deref())?;
        let json: serde_json::Value = serde_json::from_str(&input)?;
        let payload = Value::from_json(&json);

        info!(action, "Running single request");
        dispatcher.process_command(action, &payload).await
    }

    /// Bind the listening channel and serve until `shutdown` resolves.
    ///
    /// # Errors
    ///
    /// Configuration errors, bind failures, a failed startup callback.
    pub async fn serve<F>(mut self, settings: &EngineSettings, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let dispatcher = Arc::new(self.build(settings)?);
        let address = settings.listen_address();
        let listener = Listener::bind(&address).await?;

        if let Some(hook) = self.on_startup.take() {
            hook(dispatcher.runtime())?;
        }
        info!(
            component = settings.component.as_str(),
            name = %settings.name,
            version = %settings.version,
            address = %listener.local_addr()?,
            "Component listening"
        );

        let served = dispatcher.clone().serve(listener, shutdown).await;

        if let Some(hook) = self.on_shutdown.take() {
            if let Err(e) = hook(dispatcher.runtime()) {
                warn!("Shutdown callback failed: {}", e);
            }
        }
        info!("Component stopped");
        served
    }
}

impl Default for Component {
    fn default() -> Self {
        Self::new()
    }
}

fn read_input(path: Option<&Path>) -> Result<String> {
    match path {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => {
            let mut input = String::new();
            std::io::stdin().read_to_string(&mut input)?;
            Ok(input)
        }
    }
}

/// Print a reply as one JSON line on stdout.
///
/// Writes an explicit `\n` and flushes; logs never go to stdout.
fn write_reply(reply: &Value) -> Result<()> {
    let line = serde_json::to_string(&reply.to_json())?;
    let stdout = std::io::stdout();
    let mut handle = stdout.lock();
    handle.write_all(line.as_bytes())?;
    handle.write_all(b"\n")?;
    handle.flush()?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Cannot listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown requested");
}
