//! Rejections returned before (or instead of) an execution result

use thiserror::Error;

/// Why a request never produced an `ExecutionResult`
///
/// Everything that happens after a sandbox is allocated is reported through
/// `ExecutionResult::status` instead.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// Malformed or oversized request
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// No toolchain registered under this name
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// Admission refused, nothing was run
    #[error("executor overloaded, retry later")]
    Overloaded,

    /// Caller cancelled the request
    #[error("execution cancelled")]
    Cancelled,

    /// The worker task died before producing a result
    #[error("worker panicked: {0}")]
    WorkerPanicked(String),
}

impl ExecError {
    /// Rejections caused by the request itself
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            ExecError::InvalidInput(_) | ExecError::UnsupportedLanguage(_)
        )
    }

    /// Rejections the caller may retry unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, ExecError::Overloaded)
    }
}
