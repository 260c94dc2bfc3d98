//! Engine settings and service definition files.
//!
//! Definitions are TOML:
//!
//! ```toml
//! [[service]]
//! name = "users"
//! version = "0.1"
//! address = "tcp://127.0.0.1:5010"
//! file_server = false
//!
//! [[service.action]]
//! name = "read"
//! return = "boolean"
//! http_method = "get"
//! http_path = "/users/{id}"
//!
//! [[service.action.param]]
//! name = "id"
//! type = "integer"
//! location = "path"
//! required = true
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::channel::Address;
use crate::codec::{Naming, Value, DEFAULT_MAX_DEPTH};
use crate::dispatch::{DEFAULT_MAX_CONCURRENT, DEFAULT_TIMEOUT};
use crate::error::{CallmeshError, Result};
use crate::schema::{ActionSchema, ParamLocation, ParamSchema, ParamType, SchemaTable};

/// Maximum definition file size.
const MAX_DEFINITION_FILE_SIZE: u64 = 4 * 1024 * 1024;

/// What kind of component runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum ComponentKind {
    #[default]
    Service,
    Middleware,
}

impl ComponentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ComponentKind::Service => "service",
            ComponentKind::Middleware => "middleware",
        }
    }
}

/// Engine-level settings.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub component: ComponentKind,
    pub name: String,
    pub version: String,
    pub framework_version: String,
    /// Where to listen; a per-component Unix socket when unset.
    pub listen: Option<Address>,
    pub timeout: Duration,
    pub file_server: Option<String>,
    pub naming: Naming,
    pub max_concurrent: usize,
    pub max_depth: usize,
    pub variables: BTreeMap<String, String>,
    /// Action to run once instead of serving.
    pub action: Option<String>,
    /// JSON payload for the single-shot run.
    pub input: Option<PathBuf>,
    /// TOML service definitions.
    pub definitions: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            component: ComponentKind::default(),
            name: String::new(),
            version: String::new(),
            framework_version: String::new(),
            listen: None,
            timeout: DEFAULT_TIMEOUT,
            file_server: None,
            naming: Naming::default(),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_depth: DEFAULT_MAX_DEPTH,
            variables: BTreeMap::new(),
            action: None,
            input: None,
            definitions: None,
        }
    }
}

impl EngineSettings {
    /// Check the settings for internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(CallmeshError::Config("component name is required".to_string()));
        }
        if self.version.trim().is_empty() {
            return Err(CallmeshError::Config("component version is required".to_string()));
        }
        if self.version.contains('*') {
            return Err(CallmeshError::Config(format!(
                "component version must be concrete, got \"{}\"",
                self.version
            )));
        }
        if self.timeout.is_zero() {
            return Err(CallmeshError::Config("timeout must be greater than zero".to_string()));
        }
        if self.max_concurrent == 0 {
            return Err(CallmeshError::Config(
                "max concurrent requests must be greater than zero".to_string(),
            ));
        }
        if self.max_depth == 0 {
            return Err(CallmeshError::Config("max depth must be greater than zero".to_string()));
        }
        if self.input.is_some() && self.action.is_none() {
            return Err(CallmeshError::Config("an input file requires an action".to_string()));
        }
        Ok(())
    }

    pub fn is_single_shot(&self) -> bool {
        self.action.is_some()
    }

    pub fn listen_address(&self) -> Address {
        self.listen.clone().unwrap_or_else(|| {
            Address::default_socket(self.component.as_str(), &self.name, &self.version)
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefinitionFile {
    #[serde(default, rename = "service")]
    services: Vec<ServiceDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ServiceDef {
    name: String,
    version: String,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    file_server: bool,
    #[serde(default, rename = "action")]
    actions: Vec<ActionDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ActionDef {
    name: String,
    #[serde(default, rename = "return")]
    return_type: Option<ParamType>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    http_method: Option<String>,
    #[serde(default)]
    http_path: Option<String>,
    #[serde(default)]
    timeout: Option<u64>,
    #[serde(default, rename = "param")]
    params: Vec<ParamDef>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParamDef {
    name: String,
    #[serde(rename = "type", default = "default_param_type")]
    param_type: ParamType,
    #[serde(default)]
    location: ParamLocation,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    default: Option<toml::Value>,
}

fn default_param_type() -> ParamType {
    ParamType::String
}

fn toml_to_value(value: &toml::Value) -> Value {
    match value {
        toml::Value::String(s) => Value::String(s.clone()),
        toml::Value::Integer(i) => Value::Int(*i),
        toml::Value::Float(f) => Value::Float(*f),
        toml::Value::Boolean(b) => Value::Bool(*b),
        toml::Value::Datetime(d) => Value::String(d.to_string()),
        toml::Value::Array(items) => Value::Array(items.iter().map(toml_to_value).collect()),
        toml::Value::Table(table) => Value::Map(
            table
                .iter()
                .map(|(k, v)| (k.clone(), toml_to_value(v)))
                .collect(),
        ),
    }
}

impl ActionDef {
    fn into_schema(self, service: &str, version: &str) -> Result<ActionSchema> {
        let invalid = |reason: String| {
            CallmeshError::Config(format!(
                "\"{}\" ({}) action \"{}\": {}",
                service, version, self.name, reason
            ))
        };

        let mut schema = ActionSchema::new(self.name.clone());
        schema.return_type = self.return_type;
        schema.timeout_ms = self.timeout;
        for tag in &self.tags {
            schema = schema.tag(tag.clone());
        }

        match (&self.http_method, &self.http_path) {
            (Some(method), Some(path)) => schema = schema.http(method.clone(), path.clone()),
            (None, None) => {}
            _ => return Err(invalid("http_method and http_path go together".to_string())),
        }

        for param in &self.params {
            if schema.get_param(&param.name).is_some() {
                return Err(invalid(format!("duplicate parameter \"{}\"", param.name)));
            }
            let mut declared = ParamSchema::new(param.name.clone(), param.param_type)
                .location(param.location);
            if param.required {
                declared = declared.required();
            }
            if let Some(default) = &param.default {
                let default = toml_to_value(default);
                if !param.param_type.accepts(&default) {
                    return Err(invalid(format!(
                        "default of \"{}\" is {}, expected {}",
                        param.name,
                        default.type_name(),
                        param.param_type
                    )));
                }
                declared = declared.default_value(default);
            }
            schema = schema.param(declared);
        }

        Ok(schema)
    }
}

/// Parse TOML service definitions into `table`.
///
/// # Errors
///
/// `Toml` for syntax errors and unknown keys, `Config` for inconsistent
/// definitions.
pub fn parse_definitions(content: &str, table: &mut SchemaTable) -> Result<()> {
    let file: DefinitionFile = toml::from_str(content)?;

    for service in file.services {
        if service.version.contains('*') {
            return Err(CallmeshError::Config(format!(
                "\"{}\": definitions need concrete versions, got \"{}\"",
                service.name, service.version
            )));
        }
        table.register_service(
            &service.name,
            &service.version,
            service.address.clone(),
            service.file_server,
        );
        for action in service.actions {
            let schema = action.into_schema(&service.name, &service.version)?;
            table.register(&service.name, &service.version, schema);
        }
    }
    Ok(())
}

/// Load a definition file into `table`.
///
/// # Errors
///
/// `Io` when the file cannot be read, `Config` when it is too large, plus the
/// errors of [`parse_definitions`].
pub fn load_definitions(path: &Path, table: &mut SchemaTable) -> Result<()> {
    let size = std::fs::metadata(path)?.len();
    if size > MAX_DEFINITION_FILE_SIZE {
        return Err(CallmeshError::Config(format!(
            "definition file {} exceeds {} bytes",
            path.display(),
            MAX_DEFINITION_FILE_SIZE
        )));
    }
    let content = std::fs::read_to_string(path)?;
    parse_definitions(&content, table)?;
    tracing::debug!(path = %path.display(), services = table.service_names().len(), "Loaded definitions");
    Ok(())
}
