//! Error types for quarry-core.

use thiserror::Error;

/// Result type alias using quarry-core's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur during engine operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Relational store rejected the operation (constraint violation, bad
    /// statement). Deterministic, never retried.
    #[error("Store error: {0}")]
    Store(String),

    /// Relational store could not be reached or was busy. Transient.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Vector index operation failed.
    #[error("Vector index error: {0}")]
    VectorIndex(String),

    /// LLM server returned a deterministic API error (bad parameters,
    /// unknown model). Surfaced immediately.
    #[error("LLM API error: {provider} - {message}")]
    LlmApi { provider: String, message: String },

    /// LLM transport failure (connect, read, 5xx). Retried with backoff by
    /// the client before surfacing.
    #[error("LLM transport error: {0}")]
    LlmTransport(String),

    /// Operation exceeded its deadline.
    #[error("Operation timed out after {duration_ms}ms")]
    Timeout { duration_ms: u64 },

    /// Caller lacks the required permission. The display message is
    /// intentionally non-leaking; full detail is logged at the raise site.
    #[error("Not authorized")]
    NotAuthorized,

    /// Entity does not exist (or is not visible to the caller).
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Bad input, named by the offending field.
    #[error("Validation error: {field}: {message}")]
    Validation { field: String, message: String },

    /// LLM output did not conform to the requested schema after all
    /// fallback parsers were exhausted.
    #[error("Schema violation: {0}")]
    SchemaViolation(String),

    /// A tool step failed. Confined to its plan step.
    #[error("Tool '{tool}' failed: {message}")]
    ToolExecution { tool: String, message: String },

    /// Pool acquisition timed out.
    #[error("Resource exhausted: {kind}")]
    ResourceExhausted { kind: String },

    /// Pool is draining; no new acquisitions.
    #[error("Resource manager is shut down")]
    ResourceShutdown,

    /// Optimistic concurrency check failed on a document write.
    #[error("Version conflict on document {document_id}")]
    VersionConflict { document_id: String },

    /// Work was cancelled at a cancellation point.
    #[error("Operation cancelled")]
    Cancelled,

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a deterministic store error.
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Create an LLM API error.
    pub fn llm_api(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::LlmApi {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration_ms: u64) -> Self {
        Self::Timeout { duration_ms }
    }

    /// Create a not-found error.
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Create a validation error naming the offending field.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a tool-execution error.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ToolExecution {
            tool: tool.into(),
            message: message.into(),
        }
    }

    /// Whether the error is transient and worth retrying at the boundary
    /// that owns the handle.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::StoreUnavailable(_) | Self::LlmTransport(_))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match &e {
            rusqlite::Error::SqliteFailure(inner, _)
                if matches!(
                    inner.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                Self::StoreUnavailable(e.to_string())
            }
            _ => Self::Store(e.to_string()),
        }
    }
}
