//! Transport - the result envelope of one originating request.
//!
//! A [`Transport`] is created when a request arrives, handed by value to the
//! handler, and folded together with the fragments returned by downstream
//! calls through [`Transport::merge_into`]. Each field has one fixed rule:
//!
//! | Field          | Rule                                        |
//! |----------------|---------------------------------------------|
//! | `calls`        | append, completion order                    |
//! | `files`        | append, completion order                    |
//! | `links`        | append, completion order                    |
//! | `transactions` | append, completion order                    |
//! | `data`         | overwrite by (service, version, action)     |
//! | `errors`       | overwrite by (service, version, action)     |
//! | `relations`    | overwrite by relation key                   |
//! | `properties`   | overwrite by name                           |
//! | `download`     | overwrite when the incoming one is set      |
//!
//! Concurrent downstream calls that write the same key resolve as
//! last-completed-wins.

mod record;
mod wire;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

pub use record::{
    ActionKey, AttachedFile, CallRecord, ErrorRecord, FileRef, Link, RelationKey, Transaction,
    TransactionKind,
};

use crate::codec::Value;
use crate::protocol::meta;

/// Request metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportMeta {
    pub id: String,
    pub datetime: DateTime<Utc>,
    /// Service action the request entered through.
    pub origin: ActionKey,
    /// Internal and public gateway addresses.
    pub gateway: Vec<String>,
    /// Call depth. The origin is level 1.
    pub level: u32,
    pub properties: BTreeMap<String, String>,
}

/// Shared result envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Transport {
    pub meta: TransportMeta,
    /// File to stream back as the HTTP response body.
    pub download: Option<FileRef>,
    data: BTreeMap<ActionKey, Value>,
    errors: BTreeMap<ActionKey, Vec<ErrorRecord>>,
    relations: BTreeMap<RelationKey, Value>,
    calls: Vec<CallRecord>,
    files: Vec<AttachedFile>,
    links: Vec<Link>,
    transactions: Vec<Transaction>,
}

impl Transport {
    /// Create an empty transport for a new request.
    pub fn new(request_id: impl Into<String>, origin: ActionKey) -> Self {
        Self {
            meta: TransportMeta {
                id: request_id.into(),
                datetime: Utc::now(),
                origin,
                gateway: Vec::new(),
                level: 1,
                properties: BTreeMap::new(),
            },
            download: None,
            data: BTreeMap::new(),
            errors: BTreeMap::new(),
            relations: BTreeMap::new(),
            calls: Vec::new(),
            files: Vec::new(),
            links: Vec::new(),
            transactions: Vec::new(),
        }
    }

    /// Empty transport sharing this one's metadata, one level deeper.
    ///
    /// Downstream calls receive a fragment and return it filled; the caller
    /// merges it back so nothing is counted twice.
    pub fn fragment(&self) -> Self {
        let mut fragment = Self::new(self.meta.id.clone(), self.meta.origin.clone());
        fragment.meta = self.meta.clone();
        fragment.meta.level = self.meta.level + 1;
        fragment
    }

    /// Fold a downstream fragment into this transport.
    pub fn merge_into(&mut self, incoming: Transport) {
        let Transport {
            meta,
            download,
            data,
            errors,
            relations,
            calls,
            files,
            links,
            transactions,
        } = incoming;

        self.meta.properties.extend(meta.properties);
        if download.is_some() {
            self.download = download;
        }
        self.data.extend(data);
        self.errors.extend(errors);
        self.relations.extend(relations);
        self.calls.extend(calls);
        self.files.extend(files);
        self.links.extend(links);
        self.transactions.extend(transactions);
    }

    /// Record a call from `caller` to `target` that took `duration`.
    pub fn record_call(
        &mut self,
        caller: ActionKey,
        target: ActionKey,
        duration: Duration,
    ) -> &mut CallRecord {
        let mut call = CallRecord::new(caller, target);
        call.duration_ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.calls.push(call);
        let last = self.calls.len() - 1;
        &mut self.calls[last]
    }

    pub fn push_call(&mut self, call: CallRecord) {
        self.calls.push(call);
    }

    /// Set the result of an action, replacing any previous one.
    pub fn set_data(&mut self, key: ActionKey, value: Value) {
        self.data.insert(key, value);
    }

    pub fn add_error(&mut self, key: ActionKey, error: ErrorRecord) {
        self.errors.entry(key).or_default().push(error);
    }

    pub fn add_file(&mut self, target: ActionKey, file: FileRef) {
        self.files.push(AttachedFile { target, file });
    }

    pub fn add_link(&mut self, service: impl Into<String>, name: impl Into<String>, uri: impl Into<String>) {
        self.links.push(Link {
            service: service.into(),
            name: name.into(),
            uri: uri.into(),
        });
    }

    pub fn add_transaction(&mut self, transaction: Transaction) {
        self.transactions.push(transaction);
    }

    pub fn set_relation(&mut self, key: RelationKey, foreign: Value) {
        self.relations.insert(key, foreign);
    }

    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.meta.properties.insert(name.into(), value.into());
    }

    pub fn set_download(&mut self, file: FileRef) {
        self.download = Some(file);
    }

    pub fn data(&self) -> &BTreeMap<ActionKey, Value> {
        &self.data
    }

    pub fn get_data(&self, key: &ActionKey) -> Option<&Value> {
        self.data.get(key)
    }

    pub fn errors(&self) -> &BTreeMap<ActionKey, Vec<ErrorRecord>> {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        self.errors.values().any(|e| !e.is_empty())
    }

    pub fn relations(&self) -> &BTreeMap<RelationKey, Value> {
        &self.relations
    }

    pub fn calls(&self) -> &[CallRecord] {
        &self.calls
    }

    pub fn files(&self) -> &[AttachedFile] {
        &self.files
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// Response meta flags describing this transport for `service`/`version`.
    pub fn response_meta(&self, service: &str, version: &str) -> Vec<u8> {
        let mut flags = Vec::new();

        if self.download.is_some() {
            flags.push(meta::DOWNLOAD);
        }
        if !self.transactions.is_empty() {
            flags.push(meta::TRANSACTIONS);
        }

        let own_calls: Vec<&CallRecord> = self
            .calls
            .iter()
            .filter(|c| c.caller.service == service && c.caller.version == version)
            .collect();
        if !own_calls.is_empty() {
            flags.push(meta::SERVICE_CALL);
            let has_files = self
                .files
                .iter()
                .any(|f| own_calls.iter().any(|c| c.target == f.target));
            if has_files {
                flags.push(meta::FILES);
            }
        }

        if flags.is_empty() {
            flags.push(meta::EMPTY);
        }
        flags
    }
}
