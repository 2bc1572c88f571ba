//! Error types for the table administration surface

use std::fmt;

use thiserror::Error;

use crate::iterators::IteratorScope;
use crate::lifecycle::TableState;

pub type Result<T> = std::result::Result<T, AdminError>;

/// Coarse error category shared by the service and its clients.
///
/// Every `AdminError` maps onto exactly one kind, and the kind is what
/// travels over the wire. Callers should match on `kind()` rather than on
/// variants, since errors reconstructed by a client are `AdminError::Remote`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidArgument,
    InvalidState,
    Conflict,
    Transport,
    Internal,
}

impl ErrorKind {
    /// Get error code for wire protocol
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::AlreadyExists => "ALREADY_EXISTS",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::InvalidState => "INVALID_STATE",
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::Transport => "TRANSPORT",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// Parse a wire code. Unknown codes are treated as internal errors.
    pub fn from_code(code: &str) -> Self {
        match code {
            "NOT_FOUND" => ErrorKind::NotFound,
            "ALREADY_EXISTS" => ErrorKind::AlreadyExists,
            "INVALID_ARGUMENT" => ErrorKind::InvalidArgument,
            "INVALID_STATE" => ErrorKind::InvalidState,
            "CONFLICT" => ErrorKind::Conflict,
            "TRANSPORT" => ErrorKind::Transport,
            _ => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Error, Debug)]
pub enum AdminError {
    #[error("Table '{0}' not found")]
    TableNotFound(String),

    #[error("Iterator '{name}' not found in scope {scope} of table '{table}'")]
    IteratorNotFound {
        table: String,
        name: String,
        scope: IteratorScope,
    },

    #[error("Table '{0}' already exists")]
    TableExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Table '{table}' is {actual}, operation requires {required}")]
    InvalidState {
        table: String,
        actual: TableState,
        required: TableState,
    },

    #[error("Table '{0}' has used up its logical timestamps")]
    TimestampsExhausted(String),

    #[error("Illegal state transition for table '{table}': {from} -> {to}")]
    IllegalTransition {
        table: String,
        from: TableState,
        to: TableState,
    },

    #[error("Iterator '{name}' already configured in scope {scope} of table '{table}'")]
    IteratorConflict {
        table: String,
        name: String,
        scope: IteratorScope,
    },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Error reported by the remote service, rebuilt from its wire code.
    #[error("{message}")]
    Remote { kind: ErrorKind, message: String },
}

impl AdminError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdminError::TableNotFound(_) | AdminError::IteratorNotFound { .. } => ErrorKind::NotFound,
            AdminError::TableExists(_) => ErrorKind::AlreadyExists,
            AdminError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            AdminError::InvalidState { .. }
            | AdminError::IllegalTransition { .. }
            | AdminError::TimestampsExhausted(_) => ErrorKind::InvalidState,
            AdminError::IteratorConflict { .. } => ErrorKind::Conflict,
            AdminError::Transport(_) => ErrorKind::Transport,
            AdminError::Io(_) | AdminError::Manifest(_) | AdminError::Internal(_) => {
                ErrorKind::Internal
            }
            AdminError::Remote { kind, .. } => *kind,
        }
    }

    /// Get error code for wire protocol
    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Rebuild an error received over the wire.
    pub fn from_wire(code: &str, message: String) -> Self {
        AdminError::Remote {
            kind: ErrorKind::from_code(code),
            message,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        AdminError::InvalidArgument(msg.into())
    }
}
