use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::error;

/// Classification of a fault raised by a report script
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    /// The script threw (or failed to parse)
    Script,
    /// The wall-clock budget ran out
    Timeout,
    /// The runtime heap limit was hit
    OutOfMemory,
    /// The engine itself could not be set up
    Engine,
}

/// A fault raised while executing a report script.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{name}: {message}")]
pub struct ExecutionError {
    pub kind: ExecutionErrorKind,
    /// Reported kind of the fault, e.g. `TypeError`
    pub name: String,
    pub message: String,
    /// Script stack trace, only surfaced when debug traces are enabled
    pub trace: Option<String>,
}

impl ExecutionError {
    pub fn new(kind: ExecutionErrorKind, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            message: message.into(),
            trace: None,
        }
    }

    pub fn with_trace(mut self, trace: Option<String>) -> Self {
        self.trace = trace.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn engine(message: impl Into<String>) -> Self {
        Self::new(ExecutionErrorKind::Engine, "EngineError", message)
    }

    pub fn timeout(budget_ms: u64) -> Self {
        Self::new(
            ExecutionErrorKind::Timeout,
            "Timeout",
            format!("script exceeded its {}ms execution budget", budget_ms),
        )
    }
}

/// Errors of the report resolution and execution flow.
///
/// Each variant is reported to the end user on its own; none of them takes
/// down the listing or other reports.
#[derive(Debug, Error)]
pub enum PortalError {
    #[error("metadata store unavailable: {message}")]
    StoreUnavailable { message: String },

    #[error("report not found: {report_id}")]
    RecordNotFound { report_id: String },

    #[error("object not found in storage: {key}")]
    NotFound { key: String },

    #[error("failed to transfer {key}: {message}")]
    TransferError { key: String, message: String },

    #[error("report script failed: {0}")]
    Execution(#[from] ExecutionError),

    #[error("staging error: {message}")]
    Staging { message: String },

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
}

impl PortalError {
    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    pub fn record_not_found(report_id: impl Into<String>) -> Self {
        Self::RecordNotFound {
            report_id: report_id.into(),
        }
    }

    pub fn transfer(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::TransferError {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn staging(message: impl Into<String>) -> Self {
        Self::Staging {
            message: message.into(),
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Self::StoreUnavailable { .. } => ErrorCode::StoreUnavailable,
            Self::RecordNotFound { .. } => ErrorCode::RecordNotFound,
            Self::NotFound { .. } => ErrorCode::ScriptNotFound,
            Self::TransferError { .. } => ErrorCode::TransferFailed,
            Self::Execution(e) if e.kind == ExecutionErrorKind::Timeout => ErrorCode::ScriptTimeout,
            Self::Execution(_) => ErrorCode::ScriptExecutionFailed,
            Self::Staging { .. } => ErrorCode::FileSystemError,
            Self::Config(_) => ErrorCode::InternalServerError,
        }
    }

    /// Short headline shown in the render area
    pub fn headline(&self) -> &'static str {
        match self {
            Self::StoreUnavailable { .. } => "The report catalog is currently unavailable",
            Self::RecordNotFound { .. } => "Report not found",
            Self::NotFound { .. } => "The report script was not found in storage",
            Self::TransferError { .. } => "The report script could not be downloaded",
            Self::Execution(_) => "The report failed while running",
            Self::Staging { .. } => "The report could not be prepared for execution",
            Self::Config(_) => "The portal is misconfigured",
        }
    }

    /// Script trace for the debug panel, when one exists
    pub fn trace(&self) -> Option<&str> {
        match self {
            Self::Execution(e) => e.trace.as_deref(),
            _ => None,
        }
    }
}

/// Error classification used by the JSON API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BadRequest,
    NotFound,
    InternalServerError,

    StoreUnavailable,
    RecordNotFound,
    ScriptNotFound,
    TransferFailed,
    ScriptExecutionFailed,
    ScriptTimeout,
    FileSystemError,
}

impl ErrorCode {
    pub fn status(self) -> u16 {
        match self {
            ErrorCode::BadRequest => 400,
            ErrorCode::NotFound => 404,
            ErrorCode::InternalServerError => 500,
            ErrorCode::StoreUnavailable => 503,
            ErrorCode::RecordNotFound => 404,
            ErrorCode::ScriptNotFound => 404,
            ErrorCode::TransferFailed => 502,
            ErrorCode::ScriptExecutionFailed => 500,
            ErrorCode::ScriptTimeout => 504,
            ErrorCode::FileSystemError => 500,
        }
    }
}

/// Structured error response format
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorDetails,
    pub status: u16,
}

/// Details of an error occurrence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub request_id: String,
    pub timestamp: String,
    pub path: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,
}

/// Builder for creating error responses
pub struct ErrorResponseBuilder {
    code: ErrorCode,
    message: String,
    details: Option<String>,
    request_id: String,
    timestamp: String,
    path: String,
    context: HashMap<String, serde_json::Value>,
}

impl ErrorResponseBuilder {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            request_id: "unknown".to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            path: "/".to_string(),
            context: HashMap::new(),
        }
    }

    /// Start from a flow error; `debug` controls whether script traces are attached.
    pub fn from_portal_error(err: &PortalError, debug: bool) -> Self {
        let mut builder = Self::new(err.code(), err.headline()).details(err.to_string());
        if let PortalError::Execution(exec) = err {
            builder = builder.context("kind", exec.name.clone());
            if debug && let Some(trace) = &exec.trace {
                builder = builder.context("trace", trace.clone());
            }
        }
        builder
    }

    pub fn details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> ErrorResponse {
        ErrorResponse {
            status: self.code.status(),
            error: ErrorDetails {
                code: self.code,
                message: self.message,
                details: self.details,
                request_id: self.request_id,
                timestamp: self.timestamp,
                path: self.path,
                context: self.context,
            },
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or_else(|_| {
            error!("Invalid status code: {}, using 500 instead", self.status);
            StatusCode::INTERNAL_SERVER_ERROR
        });
        (status, axum::Json(self)).into_response()
    }
}
