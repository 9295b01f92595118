use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Machine-readable error category carried across the socket boundary.
///
/// The UI branches on this: `timeout` offers a retry, `crash` and `spawn`
/// point the user at the captured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Allocation,
    Spawn,
    Timeout,
    Crash,
    NotFound,
    Cancelled,
    InvalidRequest,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Allocation => "allocation",
            ErrorKind::Spawn => "spawn",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Crash => "crash",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidRequest => "invalid_request",
        }
    }
}

/// Errors produced by the supervisors.
///
/// Messages embed captured process output verbatim so a failed start is
/// diagnosable from the response alone.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProcError {
    #[error("no free port in range {start}-{end}")]
    Allocation { start: u16, end: u16 },

    #[error("failed to start process: {0}")]
    Spawn(String),

    #[error("readiness marker not seen within {}ms{}", timeout.as_millis(), format_output(output))]
    Timeout { timeout: Duration, output: String },

    #[error("process exited unexpectedly{}{}", format_code(*code), format_output(output))]
    Crash { code: Option<i32>, output: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("cancelled: {0}")]
    Cancelled(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

fn format_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!(" with code {code}"),
        None => " (killed by signal)".to_string(),
    }
}

fn format_output(output: &str) -> String {
    if output.is_empty() {
        String::new()
    } else {
        format!("\n{output}")
    }
}

impl ProcError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProcError::Allocation { .. } => ErrorKind::Allocation,
            ProcError::Spawn(_) => ErrorKind::Spawn,
            ProcError::Timeout { .. } => ErrorKind::Timeout,
            ProcError::Crash { .. } => ErrorKind::Crash,
            ProcError::NotFound(_) => ErrorKind::NotFound,
            ProcError::Cancelled(_) => ErrorKind::Cancelled,
            ProcError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    /// Structured form sent to the UI.
    pub fn to_payload(&self) -> ErrorPayload {
        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

impl From<crate::pty::PtyError> for ProcError {
    fn from(e: crate::pty::PtyError) -> Self {
        ProcError::Spawn(e.to_string())
    }
}

/// Error shape on the wire: `{"kind": "...", "message": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
}

impl std::fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl std::error::Error for ErrorPayload {}

pub type ProcResult<T> = Result<T, ProcError>;
