//! Command line arguments shared by every component binary.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::channel::Address;
use crate::codec::{Naming, DEFAULT_MAX_DEPTH};
use crate::config::{ComponentKind, EngineSettings};
use crate::dispatch::{parse_variables, DEFAULT_MAX_CONCURRENT};
use crate::error::{CallmeshError, Result};

/// Run a callmesh component.
#[derive(Parser, Debug, Clone)]
#[command(disable_version_flag = true)]
pub struct Args {
    /// Component type.
    #[arg(short = 'c', long, value_enum, default_value_t = ComponentKind::Service)]
    pub component: ComponentKind,

    /// Component name.
    #[arg(short = 'n', long)]
    pub name: String,

    /// Component version.
    #[arg(short = 'v', long = "version")]
    pub component_version: String,

    /// Framework version the gateway runs.
    #[arg(short = 'p', long, default_value = "1.0.0")]
    pub framework_version: String,

    /// Unix socket to listen on.
    #[arg(short = 's', long, value_name = "PATH", conflicts_with = "tcp")]
    pub socket: Option<PathBuf>,

    /// TCP address to listen on.
    #[arg(short = 't', long, value_name = "ADDR")]
    pub tcp: Option<String>,

    /// Request timeout in milliseconds.
    #[arg(short = 'T', long, default_value_t = 30_000)]
    pub timeout: u64,

    /// Run this action once and exit.
    #[arg(short = 'A', long, value_name = "NAME")]
    pub action: Option<String>,

    /// JSON payload for the single run.
    #[arg(short = 'i', long, value_name = "FILE", requires = "action")]
    pub input: Option<PathBuf>,

    /// Use full field names in payloads.
    #[arg(short = 'd', long)]
    pub disable_compact_names: bool,

    /// Log at debug level.
    #[arg(short = 'D', long, conflicts_with = "quiet")]
    pub debug: bool,

    /// Log errors only.
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Component variable, NAME=VALUE. Repeatable.
    #[arg(short = 'V', long = "var", value_name = "NAME=VALUE")]
    pub vars: Vec<String>,

    /// TOML service definitions.
    #[arg(long, value_name = "FILE", env = "CALLMESH_SCHEMA")]
    pub schema: Option<PathBuf>,

    /// File server address.
    #[arg(long, value_name = "ADDR")]
    pub file_server: Option<String>,

    /// Maximum in-flight requests.
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT)]
    pub max_concurrent: usize,

    /// Maximum payload nesting depth.
    #[arg(long, default_value_t = DEFAULT_MAX_DEPTH)]
    pub max_depth: usize,
}

impl Args {
    /// Build engine settings.
    ///
    /// # Errors
    ///
    /// `Config` for malformed variables or addresses.
    pub fn into_settings(self) -> Result<EngineSettings> {
        let listen = match (self.socket, self.tcp) {
            (Some(path), _) => Some(Address::Unix(path)),
            (None, Some(addr)) => match Address::parse(&addr)? {
                Address::Tcp(host) => Some(Address::Tcp(host)),
                Address::Unix(_) => {
                    return Err(CallmeshError::Config(format!(
                        "--tcp expects host:port, got \"{}\"",
                        addr
                    )))
                }
            },
            (None, None) => None,
        };

        Ok(EngineSettings {
            component: self.component,
            name: self.name,
            version: self.component_version,
            framework_version: self.framework_version,
            listen,
            timeout: Duration::from_millis(self.timeout),
            file_server: self.file_server,
            naming: if self.disable_compact_names {
                Naming::Full
            } else {
                Naming::Compact
            },
            max_concurrent: self.max_concurrent,
            max_depth: self.max_depth,
            variables: parse_variables(&self.vars)?,
            action: self.action,
            input: self.input,
            definitions: self.schema,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Args {
        Args::try_parse_from(std::iter::once("component").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let settings = parse(&["-n", "users", "-v", "0.1"]).into_settings().unwrap();
        assert_eq!(settings.component, ComponentKind::Service);
        assert_eq!(settings.timeout, Duration::from_millis(30_000));
        assert_eq!(settings.naming, Naming::Compact);
        assert_eq!(settings.max_concurrent, 256);
        assert_eq!(settings.max_depth, 128);
        assert!(settings.listen.is_none());
        assert!(!settings.is_single_shot());
    }

    #[test]
    fn test_full_flags() {
        let settings = parse(&[
            "-c", "middleware", "-n", "auth", "-v", "1.0", "-t", "127.0.0.1:7000", "-T", "500",
            "-d", "-D", "-V", "env=prod", "-V", "region=eu",
        ])
        .into_settings()
        .unwrap();
        assert_eq!(settings.component, ComponentKind::Middleware);
        assert_eq!(settings.listen, Some(Address::Tcp("127.0.0.1:7000".into())));
        assert_eq!(settings.timeout, Duration::from_millis(500));
        assert_eq!(settings.naming, Naming::Full);
        assert_eq!(settings.variables["region"], "eu");
    }

    #[test]
    fn test_single_shot_flags() {
        let settings = parse(&["-n", "users", "-v", "0.1", "-A", "read", "-i", "in.json"])
            .into_settings()
            .unwrap();
        assert_eq!(settings.action.as_deref(), Some("read"));
        assert_eq!(settings.input, Some(PathBuf::from("in.json")));
    }

    #[test]
    fn test_input_requires_action() {
        let result = Args::try_parse_from(["component", "-n", "u", "-v", "1", "-i", "in.json"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_debug_conflicts_with_quiet() {
        let result = Args::try_parse_from(["component", "-n", "u", "-v", "1", "-D", "-q"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_variable() {
        let args = parse(&["-n", "u", "-v", "1", "-V", "novalue"]);
        assert!(args.into_settings().is_err());
    }
}
