//! Error taxonomy shared by every layer below the CLI.
//!
//! Each variant maps to a stable machine-readable code (see
//! [`RagError::code`]) so that the tool surface, the HTTP API and the CLI can
//! report failures as structured values instead of propagating them to the
//! host process.

use serde_json::{json, Value};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RagError {
    /// The source file could not be read or parsed.
    #[error("could not load source file {path}: {reason}")]
    FileLoad { path: String, reason: String },

    /// Caller-supplied arguments are unusable.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The mapping contains no `text_similarity` column.
    #[error("no text_similarity column in mapping; at least one column must be searchable by text")]
    NoTextColumn,

    /// Every mapped column failed to produce a scoring space.
    #[error("no valid scoring spaces produced")]
    NoValidSpaces,

    /// The index was never created (or its metadata was removed).
    #[error("index '{name}' not found")]
    NotFound { name: String, available: Vec<String> },

    /// The framework server did not answer its health check in time.
    #[error("{operation}: server failed to become healthy within {timeout_secs}s")]
    ServerUnhealthy { operation: String, timeout_secs: u64 },

    /// An external collaborator (vector database, framework server) failed.
    #[error("{operation}: {message}")]
    Resource { operation: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl RagError {
    pub fn file_load(path: impl Into<String>, reason: impl ToString) -> Self {
        RagError::FileLoad {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    pub fn resource(operation: impl Into<String>, message: impl ToString) -> Self {
        RagError::Resource {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::FileLoad { .. } => "file_load",
            RagError::InvalidInput(_) => "invalid_input",
            RagError::NoTextColumn => "no_text_column",
            RagError::NoValidSpaces => "no_valid_spaces",
            RagError::NotFound { .. } => "not_found",
            RagError::ServerUnhealthy { .. } => "server_unhealthy",
            RagError::Resource { .. } => "resource",
            RagError::Internal(_) => "internal",
        }
    }

    /// Whether the caller (rather than the environment) is at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            RagError::FileLoad { .. }
                | RagError::InvalidInput(_)
                | RagError::NoTextColumn
                | RagError::NoValidSpaces
                | RagError::NotFound { .. }
        )
    }

    /// Render as `{ "error": { "code", "message", ... } }`.
    pub fn to_json(&self) -> Value {
        let mut detail = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        match self {
            RagError::NotFound { available, .. } => {
                detail["available_indexes"] = json!(available);
            }
            RagError::ServerUnhealthy { operation, .. } | RagError::Resource { operation, .. } => {
                detail["operation"] = json!(operation);
            }
            _ => {}
        }
        json!({ "error": detail })
    }
}

impl From<serde_json::Error> for RagError {
    fn from(err: serde_json::Error) -> Self {
        RagError::Internal(format!("serialization: {}", err))
    }
}

impl From<std::io::Error> for RagError {
    fn from(err: std::io::Error) -> Self {
        RagError::Internal(format!("io: {}", err))
    }
}

pub type RagResult<T> = Result<T, RagError>;
