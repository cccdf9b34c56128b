use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::om::OmConfigError;

pub type Result<T> = std::result::Result<T, OmError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OmInferenceSource {
    Observer,
    Reflector,
}

impl OmInferenceSource {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Observer => "observer",
            Self::Reflector => "reflector",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OmInferenceFailureKind {
    Transient,
    Fatal,
    Schema,
    Timeout,
}

impl OmInferenceFailureKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::Schema => "schema",
            Self::Timeout => "timeout",
        }
    }

    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient | Self::Timeout)
    }
}

#[derive(Debug, Error)]
pub enum OmError {
    #[error("{} model invocation failed ({}): {message}", .inference_source.as_str(), .kind.as_str())]
    ModelInvocation {
        inference_source: OmInferenceSource,
        kind: OmInferenceFailureKind,
        message: String,
    },

    #[error("storage failed: {0}")]
    Storage(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid configuration: {0}")]
    Config(#[from] OmConfigError),

    #[error("observational memory is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub operation: String,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl OmError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::ModelInvocation { .. } => "MODEL_INVOCATION_FAILED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Validation(_) => "VALIDATION_FAILED",
            Self::Config(_) => "CONFIG_INVALID",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Io(_) => "IO_ERROR",
            Self::Json(_) => "JSON_ERROR",
            Self::Sqlite(_) => "SQLITE_ERROR",
            Self::Http(_) => "HTTP_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Storage-class errors are the only ones `observe` surfaces synchronously.
    #[must_use]
    pub const fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Sqlite(_) | Self::Io(_))
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    pub fn observer(kind: OmInferenceFailureKind, message: impl Into<String>) -> Self {
        Self::ModelInvocation {
            inference_source: OmInferenceSource::Observer,
            kind,
            message: message.into(),
        }
    }

    pub fn reflector(kind: OmInferenceFailureKind, message: impl Into<String>) -> Self {
        Self::ModelInvocation {
            inference_source: OmInferenceSource::Reflector,
            kind,
            message: message.into(),
        }
    }

    pub fn mutex_poisoned(name: &str) -> Self {
        Self::Internal(format!("{name} mutex poisoned"))
    }

    pub fn to_payload(
        &self,
        operation: impl Into<String>,
        scope_key: Option<String>,
    ) -> ErrorPayload {
        let details = match self {
            Self::ModelInvocation {
                inference_source,
                kind,
                ..
            } => Some(serde_json::json!({
                "source": inference_source.as_str(),
                "kind": kind.as_str(),
                "retryable": kind.is_retryable(),
            })),
            _ => None,
        };
        ErrorPayload {
            code: self.code().to_string(),
            message: self.to_string(),
            operation: operation.into(),
            trace_id: Uuid::new_v4().to_string(),
            scope_key,
            details,
        }
    }
}
