//! Request context for action handlers.
//!
//! A [`RequestContext`] owns the Transport of one request for the duration of
//! the handler. Handlers write results through the action API and return the
//! context; downstream calls are merged into it as they complete.
//!
//! # Example
//!
//! ```ignore
//! async fn read(mut ctx: RequestContext) -> HandlerResult {
//!     let id = ctx.get_param("id").and_then(|p| p.value.as_i64()).unwrap_or(0);
//!     let posts = ctx.call("posts", "1.*", "list", vec![Param::new("user", id)]).await?;
//!     ctx.set_entity(Value::from_pairs([("id", Value::Int(id)), ("posts", posts.unwrap_or_default())]))?;
//!     Ok(ctx)
//! }
//! ```

use std::any::{Any, TypeId};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::caller::{CallReply, CallRequest, ServiceCaller};
use crate::codec::Value;
use crate::error::{CallmeshError, HandlerError, Result};
use crate::param::Param;
use crate::schema::{ParamType, SchemaTable};
use crate::transport::{
    ActionKey, CallRecord, ErrorRecord, FileRef, RelationKey, Transaction, TransactionKind,
    Transport,
};

/// Shared values registered on the component, keyed by type.
#[derive(Default)]
pub struct Resources {
    values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.values.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.values
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|v| v.downcast::<T>().ok())
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.values.contains_key(&TypeId::of::<T>())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Component-wide state every request context can read.
pub struct Runtime {
    pub name: String,
    pub version: String,
    pub framework_version: String,
    pub schema: SchemaTable,
    pub caller: Arc<dyn ServiceCaller>,
    pub resources: Resources,
    pub variables: BTreeMap<String, String>,
    /// Address of the file server, when enabled.
    pub file_server: Option<String>,
}

/// One call in a [`RequestContext::call_all`] batch.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub service: String,
    /// Version pattern, resolved against the schema table.
    pub version: String,
    pub action: String,
    pub params: Vec<Param>,
    pub timeout: Option<Duration>,
}

impl CallSpec {
    pub fn new(
        service: impl Into<String>,
        version: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            version: version.into(),
            action: action.into(),
            params: Vec::new(),
            timeout: None,
        }
    }

    pub fn param(mut self, param: Param) -> Self {
        self.params.push(param);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome of one downstream call.
pub type CallResult = std::result::Result<Option<Value>, HandlerError>;

/// Context passed to action handlers.
pub struct RequestContext {
    runtime: Arc<Runtime>,
    key: ActionKey,
    params: Vec<Param>,
    transport: Transport,
    return_type: Option<ParamType>,
    return_value: Option<Value>,
    deadline: Instant,
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("key", &self.key)
            .field("params", &self.params)
            .field("transport", &self.transport)
            .field("return_type", &self.return_type)
            .field("return_value", &self.return_value)
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl RequestContext {
    pub(crate) fn new(
        runtime: Arc<Runtime>,
        key: ActionKey,
        params: Vec<Param>,
        transport: Transport,
        return_type: Option<ParamType>,
        deadline: Instant,
    ) -> Self {
        Self {
            runtime,
            key,
            params,
            transport,
            return_type,
            return_value: None,
            deadline,
        }
    }

    /// Context with an empty runtime, for unit tests of handlers.
    #[cfg(test)]
    pub(crate) fn for_test(key: ActionKey, params: Vec<Param>) -> Self {
        let runtime = Arc::new(Runtime {
            name: key.service.clone(),
            version: key.version.clone(),
            framework_version: String::new(),
            schema: SchemaTable::new(),
            caller: Arc::new(crate::caller::NoCaller),
            resources: Resources::new(),
            variables: BTreeMap::new(),
            file_server: None,
        });
        let transport = Transport::new("test", key.clone());
        Self::new(
            runtime,
            key,
            params,
            transport,
            Some(ParamType::Integer),
            Instant::now() + Duration::from_secs(5),
        )
    }

    /// Hand back the Transport and return value.
    pub(crate) fn into_parts(self) -> (Transport, Option<Value>) {
        (self.transport, self.return_value)
    }

    pub fn name(&self) -> &str {
        &self.key.service
    }

    pub fn version(&self) -> &str {
        &self.key.version
    }

    pub fn action_name(&self) -> &str {
        &self.key.action
    }

    pub fn key(&self) -> &ActionKey {
        &self.key
    }

    pub fn request_id(&self) -> &str {
        &self.transport.meta.id
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    // Parameters

    pub fn get_param(&self, name: &str) -> Option<&Param> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn has_param(&self, name: &str) -> bool {
        self.get_param(name).is_some()
    }

    pub fn params(&self) -> &[Param] {
        &self.params
    }

    // Results

    /// Set the action's result to a single entity.
    pub fn set_entity(&mut self, entity: Value) -> std::result::Result<(), HandlerError> {
        if entity.as_map().is_none() {
            return Err(HandlerError::new(format!(
                "Entity must be an object, got {}",
                entity.type_name()
            )));
        }
        self.transport.set_data(self.key.clone(), entity);
        Ok(())
    }

    /// Set the action's result to a list of entities.
    pub fn set_collection(&mut self, collection: Vec<Value>) -> std::result::Result<(), HandlerError> {
        if let Some(bad) = collection.iter().find(|e| e.as_map().is_none()) {
            return Err(HandlerError::new(format!(
                "Collection entities must be objects, got {}",
                bad.type_name()
            )));
        }
        self.transport
            .set_data(self.key.clone(), Value::Array(collection));
        Ok(())
    }

    /// Return value sent back to the caller. Must match the declared type.
    pub fn set_return(&mut self, value: Value) -> std::result::Result<(), HandlerError> {
        match self.return_type {
            None => Err(HandlerError::new(format!(
                "Cannot set a return value in {}",
                self.key
            ))),
            Some(expected) if !expected.accepts(&value) => Err(HandlerError::new(format!(
                "Invalid return type given in {}: expected {}, got {}",
                self.key,
                expected,
                value.type_name()
            ))),
            Some(_) => {
                self.return_value = Some(value);
                Ok(())
            }
        }
    }

    pub fn return_value(&self) -> Option<&Value> {
        self.return_value.as_ref()
    }

    /// Record an error for this action without failing the handler.
    pub fn error(&mut self, message: impl Into<String>, code: i64, status: Option<&str>) {
        let record = ErrorRecord::new(
            message,
            code,
            status.unwrap_or(crate::error::DEFAULT_ERROR_STATUS),
        );
        self.transport.add_error(self.key.clone(), record);
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.transport.set_property(name, value);
    }

    pub fn set_link(&mut self, name: impl Into<String>, uri: impl Into<String>) {
        let service = self.key.service.clone();
        self.transport.add_link(service, name, uri);
    }

    // Relations

    fn public_address(&self) -> String {
        let gateway = &self.transport.meta.gateway;
        gateway
            .get(1)
            .or_else(|| gateway.first())
            .cloned()
            .unwrap_or_default()
    }

    fn relation_key(&self, primary_key: &str, address: String, service: &str) -> RelationKey {
        RelationKey {
            service: self.key.service.clone(),
            primary_key: primary_key.to_string(),
            address,
            foreign_service: service.to_string(),
        }
    }

    pub fn relate_one(&mut self, primary_key: &str, service: &str, foreign_key: &str) {
        let key = self.relation_key(primary_key, self.public_address(), service);
        self.transport.set_relation(key, Value::from(foreign_key));
    }

    pub fn relate_many(&mut self, primary_key: &str, service: &str, foreign_keys: &[&str]) {
        let key = self.relation_key(primary_key, self.public_address(), service);
        let keys = foreign_keys.iter().map(|k| Value::from(*k)).collect();
        self.transport.set_relation(key, Value::Array(keys));
    }

    /// Relate to an entity served behind another realm's gateway.
    pub fn relate_one_remote(
        &mut self,
        primary_key: &str,
        address: &str,
        service: &str,
        foreign_key: &str,
    ) {
        let key = self.relation_key(primary_key, address.to_string(), service);
        self.transport.set_relation(key, Value::from(foreign_key));
    }

    pub fn relate_many_remote(
        &mut self,
        primary_key: &str,
        address: &str,
        service: &str,
        foreign_keys: &[&str],
    ) {
        let key = self.relation_key(primary_key, address.to_string(), service);
        let keys = foreign_keys.iter().map(|k| Value::from(*k)).collect();
        self.transport.set_relation(key, Value::Array(keys));
    }

    // Transactions

    fn transaction(&mut self, kind: TransactionKind, action: &str, params: Vec<Param>) {
        self.transport.add_transaction(Transaction {
            kind,
            service: self.key.service.clone(),
            version: self.key.version.clone(),
            caller: self.key.action.clone(),
            action: action.to_string(),
            params,
        });
    }

    /// Run `action` of this service after the request succeeds.
    pub fn commit(&mut self, action: &str, params: Vec<Param>) {
        self.transaction(TransactionKind::Commit, action, params);
    }

    /// Run `action` of this service after the request fails.
    pub fn rollback(&mut self, action: &str, params: Vec<Param>) {
        self.transaction(TransactionKind::Rollback, action, params);
    }

    /// Run `action` of this service after the request, whatever the outcome.
    pub fn complete(&mut self, action: &str, params: Vec<Param>) {
        self.transaction(TransactionKind::Complete, action, params);
    }

    // Files

    fn file_server_enabled(&self) -> bool {
        self.runtime.file_server.is_some()
            || self
                .runtime
                .schema
                .service(&self.key.service, &self.key.version)
                .is_some_and(|s| s.file_server)
    }

    /// Attach a file to a call made to `target`.
    pub fn add_file(&mut self, target: ActionKey, file: FileRef) -> std::result::Result<(), HandlerError> {
        if file.is_local() && !self.file_server_enabled() {
            return Err(HandlerError::new(format!(
                "File server not configured for \"{}\" ({})",
                self.key.service, self.key.version
            )));
        }
        self.transport.add_file(target, file);
        Ok(())
    }

    /// Stream `file` back as the HTTP response body.
    pub fn set_download(&mut self, file: FileRef) -> std::result::Result<(), HandlerError> {
        let declared = self
            .runtime
            .schema
            .service(&self.key.service, &self.key.version);
        if declared.is_some() && !self.file_server_enabled() {
            return Err(HandlerError::new(format!(
                "File server not configured for \"{}\" ({})",
                self.key.service, self.key.version
            )));
        }
        self.transport.set_download(file);
        Ok(())
    }

    // Component state

    pub fn resource<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.runtime.resources.get::<T>()
    }

    pub fn variable(&self, name: &str) -> Option<&str> {
        self.runtime.variables.get(name).map(String::as_str)
    }

    pub fn variables(&self) -> &BTreeMap<String, String> {
        &self.runtime.variables
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left before the request is abandoned.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    // Service calls

    fn prepare_call(&self, spec: CallSpec) -> Result<(CallRequest, Instant)> {
        let (version, _) =
            self.runtime
                .schema
                .resolve_action(&spec.service, &spec.version, &spec.action)?;
        let address = self
            .runtime
            .schema
            .service(&spec.service, &version)
            .and_then(|s| s.address.clone())
            .unwrap_or_default();

        let deadline = match spec.timeout {
            Some(timeout) => self.deadline.min(Instant::now() + timeout),
            None => self.deadline,
        };

        let request = CallRequest {
            address,
            target: ActionKey::new(spec.service, version, spec.action),
            params: spec.params,
            transport: self.transport.fragment(),
            timeout: Some(deadline.saturating_duration_since(Instant::now())),
        };
        Ok((request, deadline))
    }

    /// Merge a finished call and record it.
    fn finish_call(
        &mut self,
        target: ActionKey,
        params: Vec<Param>,
        timeout: Option<Duration>,
        elapsed: Duration,
        outcome: Result<CallReply>,
    ) -> CallResult {
        let call = self
            .transport
            .record_call(self.key.clone(), target.clone(), elapsed);
        call.params = params;
        call.timeout_ms = timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));

        let reply = match outcome {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(caller = %self.key, target = %target, error = %e, "Service call failed");
                return Err(HandlerError::from(e));
            }
        };

        let failure = reply
            .transport
            .errors()
            .get(&target)
            .and_then(|errors| errors.last())
            .map(HandlerError::from);
        self.transport.merge_into(reply.transport);

        match (reply.return_value, failure) {
            (None, Some(err)) => Err(err),
            (value, _) => Ok(value),
        }
    }

    /// Call another service action and wait for its reply.
    ///
    /// The version may be a pattern. The reply's Transport is merged into this
    /// one and the call is recorded with its duration.
    pub async fn call(
        &mut self,
        service: &str,
        version: &str,
        action: &str,
        params: Vec<Param>,
    ) -> CallResult {
        self.call_spec(CallSpec {
            params,
            ..CallSpec::new(service, version, action)
        })
        .await
    }

    /// Like [`call`](Self::call) with every option of a [`CallSpec`].
    pub async fn call_spec(&mut self, spec: CallSpec) -> CallResult {
        let (request, deadline) = self.prepare_call(spec)?;
        let target = request.target.clone();
        let params = request.params.clone();
        let timeout = request.timeout;
        let caller = self.runtime.caller.clone();

        let started = Instant::now();
        let outcome = match tokio::time::timeout_at(deadline, caller.call(request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(timeout_error(timeout)),
        };
        self.finish_call(target, params, timeout, started.elapsed(), outcome)
    }

    /// Run several calls concurrently.
    ///
    /// Replies are merged in completion order. Calls still pending when their
    /// deadline passes are abandoned and report a timeout. Results are
    /// returned in the order of `calls`.
    pub async fn call_all(&mut self, calls: Vec<CallSpec>) -> Vec<CallResult> {
        let mut results: Vec<Option<CallResult>> = (0..calls.len()).map(|_| None).collect();
        let mut pending = HashMap::new();
        let mut set = JoinSet::new();

        for (index, spec) in calls.into_iter().enumerate() {
            let (request, deadline) = match self.prepare_call(spec) {
                Ok(prepared) => prepared,
                Err(e) => {
                    results[index] = Some(Err(HandlerError::from(e)));
                    continue;
                }
            };
            pending.insert(
                index,
                (request.target.clone(), request.params.clone(), request.timeout),
            );

            let caller = self.runtime.caller.clone();
            set.spawn(async move {
                let started = Instant::now();
                let timeout = request.timeout;
                let outcome = match tokio::time::timeout_at(deadline, caller.call(request)).await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(timeout_error(timeout)),
                };
                (index, started.elapsed(), outcome)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, elapsed, outcome)) => {
                    if let Some((target, params, timeout)) = pending.remove(&index) {
                        results[index] = Some(self.finish_call(target, params, timeout, elapsed, outcome));
                    }
                }
                Err(e) => tracing::error!(caller = %self.key, error = %e, "Service call task failed"),
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(HandlerError::new("Service call was aborted"))))
            .collect()
    }

    /// Record a call for the gateway to run after this action returns.
    pub fn defer_call(&mut self, service: &str, version: &str, action: &str, params: Vec<Param>) {
        let mut call = CallRecord::new(self.key.clone(), ActionKey::new(service, version, action));
        call.params = params;
        self.transport.push_call(call);
    }

    /// Record a call to a service behind another realm's gateway.
    pub fn call_remote(
        &mut self,
        address: &str,
        target: ActionKey,
        params: Vec<Param>,
        timeout: Option<Duration>,
    ) {
        let mut call = CallRecord::new(self.key.clone(), target);
        call.params = params;
        call.gateway = Some(address.to_string());
        call.timeout_ms = timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX));
        self.transport.push_call(call);
    }
}

fn timeout_error(timeout: Option<Duration>) -> CallmeshError {
    CallmeshError::Timeout {
        after_ms: timeout
            .map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default(),
    }
}
