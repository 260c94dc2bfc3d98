//! Entry types accumulated in a [`Transport`](super::Transport).

use std::fmt;

use crate::error::{HandlerError, DEFAULT_ERROR_MESSAGE, DEFAULT_ERROR_STATUS};
use crate::param::Param;

/// A (service, version, action) triple.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ActionKey {
    pub service: String,
    pub version: String,
    pub action: String,
}

impl ActionKey {
    pub fn new(
        service: impl Into<String>,
        version: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            version: version.into(),
            action: action.into(),
        }
    }
}

impl fmt::Display for ActionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" ({}) \"{}\"", self.service, self.version, self.action)
    }
}

/// An error entry.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorRecord {
    pub message: String,
    pub code: i64,
    pub status: String,
}

impl ErrorRecord {
    pub fn new(message: impl Into<String>, code: i64, status: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            status: status.into(),
        }
    }
}

impl Default for ErrorRecord {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_MESSAGE, 0, DEFAULT_ERROR_STATUS)
    }
}

impl From<HandlerError> for ErrorRecord {
    fn from(err: HandlerError) -> Self {
        Self::new(err.message, err.code, err.status)
    }
}

impl From<&ErrorRecord> for HandlerError {
    fn from(record: &ErrorRecord) -> Self {
        HandlerError::new(record.message.clone())
            .with_code(record.code)
            .with_status(record.status.clone())
    }
}

/// Reference to a file kept outside the payload.
///
/// `path` is either a `file://` path or an `http://` URI on the file server;
/// the bytes themselves never travel in the Transport.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FileRef {
    pub name: String,
    pub path: String,
    pub mime: String,
    pub filename: String,
    pub size: u64,
    /// Access token for file-server URIs.
    pub token: Option<String>,
}

impl FileRef {
    pub fn new(name: impl Into<String>, path: impl Into<String>, mime: impl Into<String>) -> Self {
        let path = path.into();
        let filename = path
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        Self {
            name: name.into(),
            path,
            mime: mime.into(),
            filename,
            size: 0,
            token: None,
        }
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn is_local(&self) -> bool {
        self.path.starts_with("file://")
    }
}

/// A file sent along with a call to `target`.
#[derive(Debug, Clone, PartialEq)]
pub struct AttachedFile {
    pub target: ActionKey,
    pub file: FileRef,
}

/// A named hyperlink published by a service.
#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub service: String,
    pub name: String,
    pub uri: String,
}

/// A service-to-service call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    pub caller: ActionKey,
    pub target: ActionKey,
    /// Round-trip time in milliseconds. Zero for deferred calls.
    pub duration_ms: u64,
    pub params: Vec<Param>,
    /// Remote gateway for calls across realms.
    pub gateway: Option<String>,
    pub timeout_ms: Option<u64>,
}

impl CallRecord {
    pub fn new(caller: ActionKey, target: ActionKey) -> Self {
        Self {
            caller,
            target,
            duration_ms: 0,
            params: Vec::new(),
            gateway: None,
            timeout_ms: None,
        }
    }
}

/// When a transaction runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionKind {
    /// After the request succeeds.
    Commit,
    /// After the request fails.
    Rollback,
    /// After the request, always.
    Complete,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionKind::Commit => "commit",
            TransactionKind::Rollback => "rollback",
            TransactionKind::Complete => "complete",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "commit" => Some(TransactionKind::Commit),
            "rollback" => Some(TransactionKind::Rollback),
            "complete" => Some(TransactionKind::Complete),
            _ => None,
        }
    }
}

/// A side-effect intent for the gateway to run after the request.
#[derive(Debug, Clone, PartialEq)]
pub struct Transaction {
    pub kind: TransactionKind,
    pub service: String,
    pub version: String,
    /// Action that registered the transaction.
    pub caller: String,
    /// Action to run.
    pub action: String,
    pub params: Vec<Param>,
}

/// Key of a relation between entities of two services.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelationKey {
    pub service: String,
    pub primary_key: String,
    /// Gateway address of the foreign service (public address for local ones).
    pub address: String,
    pub foreign_service: String,
}
