//! Payload form of a [`Transport`].
//!
//! Keyed fields nest by key (`data.<service>.<version>.<action>`), list fields
//! stay flat. Empty fields are left out. Reading is lenient: anything absent
//! or of the wrong shape falls back to its default.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};

use super::{
    ActionKey, AttachedFile, CallRecord, ErrorRecord, FileRef, Link, RelationKey, Transaction,
    TransactionKind, Transport, TransportMeta,
};
use crate::codec::names::{field, str_field};
use crate::codec::{Map, Naming, Value};
use crate::error::{DEFAULT_ERROR_MESSAGE, DEFAULT_ERROR_STATUS};
use crate::param::{params_from_value, params_to_value};

impl Transport {
    /// Encode to a payload map.
    pub fn to_value(&self, naming: Naming) -> Value {
        let mut map = Map::new();
        naming.insert(&mut map, "meta", meta_to_value(&self.meta, naming));

        if let Some(download) = &self.download {
            naming.insert(&mut map, "body", file_to_value(download, naming));
        }
        if !self.data.is_empty() {
            naming.insert(&mut map, "data", nest_by_action(&self.data, Clone::clone));
        }
        if !self.errors.is_empty() {
            let errors = nest_by_action(&self.errors, |list| {
                Value::Array(list.iter().map(|e| error_to_value(e, naming)).collect())
            });
            naming.insert(&mut map, "errors", errors);
        }
        if !self.relations.is_empty() {
            naming.insert(&mut map, "relations", relations_to_value(&self.relations));
        }
        if !self.files.is_empty() {
            let files = self
                .files
                .iter()
                .map(|f| attached_to_value(f, naming))
                .collect();
            naming.insert(&mut map, "files", Value::Array(files));
        }
        if !self.links.is_empty() {
            let links = self
                .links
                .iter()
                .map(|l| {
                    let mut m = Map::new();
                    naming.insert(&mut m, "service", Value::from(l.service.as_str()));
                    naming.insert(&mut m, "name", Value::from(l.name.as_str()));
                    naming.insert(&mut m, "uri", Value::from(l.uri.as_str()));
                    Value::Map(m)
                })
                .collect();
            naming.insert(&mut map, "links", Value::Array(links));
        }
        if !self.calls.is_empty() {
            let calls = self.calls.iter().map(|c| call_to_value(c, naming)).collect();
            naming.insert(&mut map, "calls", Value::Array(calls));
        }
        if !self.transactions.is_empty() {
            let transactions = self
                .transactions
                .iter()
                .map(|t| transaction_to_value(t, naming))
                .collect();
            naming.insert(&mut map, "transactions", Value::Array(transactions));
        }

        Value::Map(map)
    }

    /// Decode from a payload map. Never fails; see module docs.
    pub fn from_value(value: &Value) -> Self {
        let empty = Map::new();
        let map = value.as_map().unwrap_or(&empty);

        let meta = field(map, "meta")
            .and_then(Value::as_map)
            .map(meta_from_map)
            .unwrap_or_else(|| meta_from_map(&empty));
        let mut transport = Transport::new(String::new(), ActionKey::default());
        transport.meta = meta;

        transport.download = field(map, "body").and_then(Value::as_map).map(file_from_map);

        if let Some(data) = field(map, "data") {
            transport.data = unnest_by_action(data, |v| Some(v.clone()));
        }
        if let Some(errors) = field(map, "errors") {
            transport.errors = unnest_by_action(errors, |v| {
                v.as_array().map(|items| {
                    items
                        .iter()
                        .filter_map(Value::as_map)
                        .map(error_from_map)
                        .collect()
                })
            });
        }
        if let Some(relations) = field(map, "relations") {
            transport.relations = relations_from_value(relations);
        }

        transport.files = list_of(map, "files")
            .map(|m| AttachedFile {
                target: key_from_map(m),
                file: file_from_map(m),
            })
            .collect();
        transport.links = list_of(map, "links")
            .map(|m| Link {
                service: str_field(m, "service"),
                name: str_field(m, "name"),
                uri: str_field(m, "uri"),
            })
            .collect();
        transport.calls = list_of(map, "calls").map(call_from_map).collect();
        transport.transactions = list_of(map, "transactions")
            .filter_map(transaction_from_map)
            .collect();

        transport
    }
}

fn list_of<'a>(map: &'a Map, name: &'static str) -> impl Iterator<Item = &'a Map> + 'a {
    field(map, name)
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_map)
}

fn int_field(map: &Map, name: &'static str) -> Option<i64> {
    field(map, name).and_then(Value::as_i64)
}

fn meta_to_value(meta: &TransportMeta, naming: Naming) -> Value {
    let mut map = Map::new();
    naming.insert(&mut map, "id", Value::from(meta.id.as_str()));
    naming.insert(
        &mut map,
        "datetime",
        Value::from(meta.datetime.to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    naming.insert(
        &mut map,
        "origin",
        Value::Array(vec![
            Value::from(meta.origin.service.as_str()),
            Value::from(meta.origin.version.as_str()),
            Value::from(meta.origin.action.as_str()),
        ]),
    );
    naming.insert(
        &mut map,
        "gateway",
        Value::Array(meta.gateway.iter().map(|g| Value::from(g.as_str())).collect()),
    );
    naming.insert(&mut map, "level", Value::from(meta.level));
    if !meta.properties.is_empty() {
        let properties = meta
            .properties
            .iter()
            .map(|(k, v)| (k.clone(), Value::from(v.as_str())))
            .collect();
        naming.insert(&mut map, "properties", Value::Map(properties));
    }
    Value::Map(map)
}

fn meta_from_map(map: &Map) -> TransportMeta {
    let strings = |name| -> Vec<String> {
        field(map, name)
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .map(|v| v.as_str().unwrap_or_default().to_string())
                    .collect()
            })
            .unwrap_or_default()
    };

    let origin = strings("origin");
    let part = |i: usize| origin.get(i).cloned().unwrap_or_default();

    let datetime = field(map, "datetime")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let properties = field(map, "properties")
        .and_then(Value::as_map)
        .map(|props| {
            props
                .iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    TransportMeta {
        id: str_field(map, "id"),
        datetime,
        origin: ActionKey::new(part(0), part(1), part(2)),
        gateway: strings("gateway"),
        level: int_field(map, "level")
            .and_then(|l| u32::try_from(l).ok())
            .unwrap_or(1),
        properties,
    }
}

fn nest_by_action<T>(entries: &BTreeMap<ActionKey, T>, to_value: impl Fn(&T) -> Value) -> Value {
    let mut tree: BTreeMap<&str, BTreeMap<&str, Map>> = BTreeMap::new();
    for (key, entry) in entries {
        tree.entry(key.service.as_str())
            .or_default()
            .entry(key.version.as_str())
            .or_default()
            .insert(key.action.clone(), to_value(entry));
    }
    Value::Map(
        tree.into_iter()
            .map(|(service, versions)| {
                let versions = versions
                    .into_iter()
                    .map(|(version, actions)| (version.to_string(), Value::Map(actions)))
                    .collect();
                (service.to_string(), Value::Map(versions))
            })
            .collect(),
    )
}

fn unnest_by_action<T>(
    value: &Value,
    from_value: impl Fn(&Value) -> Option<T>,
) -> BTreeMap<ActionKey, T> {
    let mut entries = BTreeMap::new();
    let Some(services) = value.as_map() else {
        return entries;
    };
    for (service, versions) in services {
        for (version, actions) in versions.as_map().into_iter().flatten() {
            for (action, entry) in actions.as_map().into_iter().flatten() {
                if let Some(entry) = from_value(entry) {
                    entries.insert(ActionKey::new(service, version, action), entry);
                }
            }
        }
    }
    entries
}

fn relations_to_value(relations: &BTreeMap<RelationKey, Value>) -> Value {
    type Level<'a, T> = BTreeMap<&'a str, T>;
    let mut tree: Level<Level<Level<Map>>> = BTreeMap::new();
    for (key, foreign) in relations {
        tree.entry(key.service.as_str())
            .or_default()
            .entry(key.primary_key.as_str())
            .or_default()
            .entry(key.address.as_str())
            .or_default()
            .insert(key.foreign_service.clone(), foreign.clone());
    }

    fn level<T>(level: Level<'_, T>, inner: impl Fn(T) -> Value) -> Value {
        Value::Map(
            level
                .into_iter()
                .map(|(k, v)| (k.to_string(), inner(v)))
                .collect(),
        )
    }

    level(tree, |keys| level(keys, |addresses| level(addresses, Value::Map)))
}

fn relations_from_value(value: &Value) -> BTreeMap<RelationKey, Value> {
    let mut relations = BTreeMap::new();
    for (service, keys) in value.as_map().into_iter().flatten() {
        for (primary_key, addresses) in keys.as_map().into_iter().flatten() {
            for (address, foreign) in addresses.as_map().into_iter().flatten() {
                for (foreign_service, value) in foreign.as_map().into_iter().flatten() {
                    relations.insert(
                        RelationKey {
                            service: service.clone(),
                            primary_key: primary_key.clone(),
                            address: address.clone(),
                            foreign_service: foreign_service.clone(),
                        },
                        value.clone(),
                    );
                }
            }
        }
    }
    relations
}

fn error_to_value(error: &ErrorRecord, naming: Naming) -> Value {
    let mut map = Map::new();
    naming.insert(&mut map, "message", Value::from(error.message.as_str()));
    naming.insert(&mut map, "code", Value::Int(error.code));
    naming.insert(&mut map, "status", Value::from(error.status.as_str()));
    Value::Map(map)
}

pub(crate) fn error_from_map(map: &Map) -> ErrorRecord {
    let message = str_field(map, "message");
    let status = str_field(map, "status");
    ErrorRecord {
        message: if message.is_empty() {
            DEFAULT_ERROR_MESSAGE.to_string()
        } else {
            message
        },
        code: int_field(map, "code").unwrap_or(0),
        status: if status.is_empty() {
            DEFAULT_ERROR_STATUS.to_string()
        } else {
            status
        },
    }
}

fn insert_key(map: &mut Map, key: &ActionKey, naming: Naming) {
    naming.insert(map, "service", Value::from(key.service.as_str()));
    naming.insert(map, "version", Value::from(key.version.as_str()));
    naming.insert(map, "action", Value::from(key.action.as_str()));
}

fn key_from_map(map: &Map) -> ActionKey {
    ActionKey::new(
        str_field(map, "service"),
        str_field(map, "version"),
        str_field(map, "action"),
    )
}

fn insert_file(map: &mut Map, file: &FileRef, naming: Naming) {
    naming.insert(map, "name", Value::from(file.name.as_str()));
    naming.insert(map, "path", Value::from(file.path.as_str()));
    naming.insert(map, "mime", Value::from(file.mime.as_str()));
    naming.insert(map, "filename", Value::from(file.filename.as_str()));
    naming.insert(map, "size", Value::Int(i64::try_from(file.size).unwrap_or(i64::MAX)));
    if let Some(token) = &file.token {
        naming.insert(map, "token", Value::from(token.as_str()));
    }
}

fn file_to_value(file: &FileRef, naming: Naming) -> Value {
    let mut map = Map::new();
    insert_file(&mut map, file, naming);
    Value::Map(map)
}

fn file_from_map(map: &Map) -> FileRef {
    FileRef {
        name: str_field(map, "name"),
        path: str_field(map, "path"),
        mime: str_field(map, "mime"),
        filename: str_field(map, "filename"),
        size: int_field(map, "size")
            .and_then(|s| u64::try_from(s).ok())
            .unwrap_or(0),
        token: field(map, "token")
            .and_then(Value::as_str)
            .map(str::to_string),
    }
}

fn attached_to_value(attached: &AttachedFile, naming: Naming) -> Value {
    let mut map = Map::new();
    insert_key(&mut map, &attached.target, naming);
    insert_file(&mut map, &attached.file, naming);
    Value::Map(map)
}

fn call_to_value(call: &CallRecord, naming: Naming) -> Value {
    let mut caller = Map::new();
    insert_key(&mut caller, &call.caller, naming);

    let mut map = Map::new();
    naming.insert(&mut map, "caller", Value::Map(caller));
    insert_key(&mut map, &call.target, naming);
    naming.insert(
        &mut map,
        "duration",
        Value::Int(i64::try_from(call.duration_ms).unwrap_or(i64::MAX)),
    );
    if !call.params.is_empty() {
        naming.insert(&mut map, "params", params_to_value(&call.params, naming));
    }
    if let Some(gateway) = &call.gateway {
        naming.insert(&mut map, "gateway", Value::from(gateway.as_str()));
    }
    if let Some(timeout) = call.timeout_ms {
        naming.insert(
            &mut map,
            "timeout",
            Value::Int(i64::try_from(timeout).unwrap_or(i64::MAX)),
        );
    }
    Value::Map(map)
}

fn call_from_map(map: &Map) -> CallRecord {
    let caller = field(map, "caller")
        .and_then(Value::as_map)
        .map(key_from_map)
        .unwrap_or_default();
    CallRecord {
        caller,
        target: key_from_map(map),
        duration_ms: int_field(map, "duration")
            .and_then(|d| u64::try_from(d).ok())
            .unwrap_or(0),
        params: params_from_value(field(map, "params")).unwrap_or_default(),
        gateway: field(map, "gateway")
            .and_then(Value::as_str)
            .map(str::to_string),
        timeout_ms: int_field(map, "timeout").and_then(|t| u64::try_from(t).ok()),
    }
}

fn transaction_to_value(transaction: &Transaction, naming: Naming) -> Value {
    let mut map = Map::new();
    naming.insert(&mut map, "type", Value::from(transaction.kind.as_str()));
    naming.insert(&mut map, "service", Value::from(transaction.service.as_str()));
    naming.insert(&mut map, "version", Value::from(transaction.version.as_str()));
    naming.insert(&mut map, "caller", Value::from(transaction.caller.as_str()));
    naming.insert(&mut map, "action", Value::from(transaction.action.as_str()));
    if !transaction.params.is_empty() {
        naming.insert(&mut map, "params", params_to_value(&transaction.params, naming));
    }
    Value::Map(map)
}

fn transaction_from_map(map: &Map) -> Option<Transaction> {
    let kind = field(map, "type")
        .and_then(Value::as_str)
        .and_then(TransactionKind::from_name)?;
    Some(Transaction {
        kind,
        service: str_field(map, "service"),
        version: str_field(map, "version"),
        caller: str_field(map, "caller"),
        action: str_field(map, "action"),
        params: params_from_value(field(map, "params")).unwrap_or_default(),
    })
}
