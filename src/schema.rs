//! Schema mapping table.
//!
//! Indexes the declared contract of every known service action by
//! (service, version, action). The table is filled once at startup and then
//! shared behind an `Arc`; lookups never lock.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Deserialize;

use crate::codec::Value;
use crate::error::{CallmeshError, Result};
use crate::version::resolve;

/// Declared type of a parameter or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    Null,
    Boolean,
    Integer,
    Float,
    String,
    Binary,
    Array,
    Object,
}

impl ParamType {
    pub fn as_str(self) -> &'static str {
        match self {
            ParamType::Null => "null",
            ParamType::Boolean => "boolean",
            ParamType::Integer => "integer",
            ParamType::Float => "float",
            ParamType::String => "string",
            ParamType::Binary => "binary",
            ParamType::Array => "array",
            ParamType::Object => "object",
        }
    }

    /// Parse a type name as sent on the wire. Unknown names are `None`.
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "null" => ParamType::Null,
            "boolean" => ParamType::Boolean,
            "integer" => ParamType::Integer,
            "float" => ParamType::Float,
            "string" => ParamType::String,
            "binary" => ParamType::Binary,
            "array" => ParamType::Array,
            "object" => ParamType::Object,
            _ => return None,
        })
    }

    /// Type of a payload value.
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ParamType::Null,
            Value::Bool(_) => ParamType::Boolean,
            Value::Int(_) => ParamType::Integer,
            Value::Float(_) => ParamType::Float,
            Value::String(_) => ParamType::String,
            Value::Binary(_) => ParamType::Binary,
            Value::Array(_) => ParamType::Array,
            Value::Map(_) => ParamType::Object,
        }
    }

    /// Whether `value` is acceptable for this declared type.
    ///
    /// Integers are accepted where floats are declared; nothing else converts.
    pub fn accepts(self, value: &Value) -> bool {
        let actual = Self::of(value);
        actual == self || (self == ParamType::Float && actual == ParamType::Integer)
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a parameter comes from in the HTTP request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamLocation {
    Path,
    #[default]
    Query,
    Body,
    Header,
}

/// Declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSchema {
    pub name: String,
    pub param_type: ParamType,
    pub location: ParamLocation,
    pub required: bool,
    pub default: Option<Value>,
}

impl ParamSchema {
    pub fn new(name: impl Into<String>, param_type: ParamType) -> Self {
        Self {
            name: name.into(),
            param_type,
            location: ParamLocation::default(),
            required: false,
            default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn location(mut self, location: ParamLocation) -> Self {
        self.location = location;
        self
    }
}

/// HTTP binding of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpBinding {
    pub method: String,
    pub path: String,
}

/// Declared contract of one action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionSchema {
    pub name: String,
    pub params: Vec<ParamSchema>,
    pub return_type: Option<ParamType>,
    pub http: Option<HttpBinding>,
    pub tags: Vec<String>,
    /// Per-action timeout override in milliseconds.
    pub timeout_ms: Option<u64>,
}

impl ActionSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
            return_type: None,
            http: None,
            tags: Vec::new(),
            timeout_ms: None,
        }
    }

    pub fn param(mut self, param: ParamSchema) -> Self {
        self.params.push(param);
        self
    }

    pub fn returns(mut self, return_type: ParamType) -> Self {
        self.return_type = Some(return_type);
        self
    }

    pub fn http(mut self, method: impl Into<String>, path: impl Into<String>) -> Self {
        self.http = Some(HttpBinding {
            method: method.into().to_uppercase(),
            path: path.into(),
        });
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn get_param(&self, name: &str) -> Option<&ParamSchema> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag)
    }
}

/// One concrete service version.
#[derive(Debug, Clone, Default)]
pub struct ServiceSchema {
    /// Address of the component serving this version, if remote.
    pub address: Option<String>,
    /// Whether the service accepts file references via the file server.
    pub file_server: bool,
    actions: HashMap<String, ActionSchema>,
}

impl ServiceSchema {
    pub fn action(&self, name: &str) -> Option<&ActionSchema> {
        self.actions.get(name)
    }

    pub fn action_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.actions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Index of (service, version, action) to [`ActionSchema`].
#[derive(Debug, Clone, Default)]
pub struct SchemaTable {
    services: HashMap<String, BTreeMap<String, ServiceSchema>>,
}

impl SchemaTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind an action schema to a service version, replacing any previous one.
    pub fn register(&mut self, service: &str, version: &str, schema: ActionSchema) {
        self.entry(service, version)
            .actions
            .insert(schema.name.clone(), schema);
    }

    /// Record where a service version is served and whether it uses files.
    pub fn register_service(
        &mut self,
        service: &str,
        version: &str,
        address: Option<String>,
        file_server: bool,
    ) {
        let entry = self.entry(service, version);
        entry.address = address;
        entry.file_server = file_server;
    }

    fn entry(&mut self, service: &str, version: &str) -> &mut ServiceSchema {
        self.services
            .entry(service.to_string())
            .or_default()
            .entry(version.to_string())
            .or_default()
    }

    /// Fetch an action schema.
    ///
    /// # Errors
    ///
    /// `ActionNotFound` when the triple is unregistered.
    pub fn lookup(&self, service: &str, version: &str, action: &str) -> Result<&ActionSchema> {
        self.service(service, version)
            .and_then(|s| s.action(action))
            .ok_or_else(|| CallmeshError::ActionNotFound {
                service: service.to_string(),
                version: version.to_string(),
                action: action.to_string(),
            })
    }

    pub fn service(&self, service: &str, version: &str) -> Option<&ServiceSchema> {
        self.services.get(service).and_then(|v| v.get(version))
    }

    /// Registered concrete versions of a service.
    pub fn versions(&self, service: &str) -> Vec<&str> {
        self.services
            .get(service)
            .map(|v| v.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Registered concrete versions of a service that declare `action`.
    pub fn versions_with_action(&self, service: &str, action: &str) -> Vec<&str> {
        self.services
            .get(service)
            .map(|versions| {
                versions
                    .iter()
                    .filter(|(_, s)| s.actions.contains_key(action))
                    .map(|(v, _)| v.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Resolve a version pattern for `action` and fetch its schema.
    ///
    /// Only versions that declare the action are candidates.
    ///
    /// # Errors
    ///
    /// `NoVersionMatch` when no version of the service satisfies the pattern,
    /// `ActionNotFound` when versions match but none declares the action.
    pub fn resolve_action(
        &self,
        service: &str,
        pattern: &str,
        action: &str,
    ) -> Result<(String, &ActionSchema)> {
        let candidates = self.versions_with_action(service, action);
        if candidates.is_empty() {
            let version = resolve(service, pattern, self.versions(service))?;
            return Err(CallmeshError::ActionNotFound {
                service: service.to_string(),
                version,
                action: action.to_string(),
            });
        }
        let version = resolve(service, pattern, candidates)?;
        let schema = self.lookup(service, &version, action)?;
        Ok((version, schema))
    }

    pub fn service_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.services.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
