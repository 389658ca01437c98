use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an execution did not complete normally
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SyntaxError,
    RuntimeError,
    Timeout,
    Cancelled,
    ResourceLimitExceeded,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::SyntaxError => "syntax_error",
            ErrorKind::RuntimeError => "runtime_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::ResourceLimitExceeded => "resource_limit_exceeded",
        };
        write!(f, "{}", s)
    }
}

/// Result of executing one snippet
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionResult {
    Success {
        output: String,
    },
    Failure {
        error_kind: ErrorKind,
        message: String,
        /// Output captured before the fault
        partial_output: String,
    },
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        ExecutionResult::Success {
            output: output.into(),
        }
    }

    pub fn failure(
        error_kind: ErrorKind,
        message: impl Into<String>,
        partial_output: impl Into<String>,
    ) -> Self {
        ExecutionResult::Failure {
            error_kind,
            message: message.into(),
            partial_output: partial_output.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecutionResult::Success { .. })
    }

    /// Error kind, `None` on success
    pub fn error_kind(&self) -> Option<ErrorKind> {
        match self {
            ExecutionResult::Success { .. } => None,
            ExecutionResult::Failure { error_kind, .. } => Some(*error_kind),
        }
    }

    /// Captured text regardless of outcome
    pub fn output(&self) -> &str {
        match self {
            ExecutionResult::Success { output } => output,
            ExecutionResult::Failure { partial_output, .. } => partial_output,
        }
    }
}
