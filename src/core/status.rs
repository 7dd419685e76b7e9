use serde::{Deserialize, Serialize};
use std::fmt;

/// Terminal status of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    CompileError,
    RuntimeError,
    Timeout,
    ResourceExceeded,
    InternalError,
}

impl ExecutionStatus {
    /// Whether the failure belongs to the platform rather than the submitted program
    pub fn is_platform_fault(&self) -> bool {
        matches!(self, ExecutionStatus::InternalError)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::CompileError => "compile_error",
            ExecutionStatus::RuntimeError => "runtime_error",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::ResourceExceeded => "resource_exceeded",
            ExecutionStatus::InternalError => "internal_error",
        };
        write!(f, "{}", s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_serde() {
        for status in [
            ExecutionStatus::Success,
            ExecutionStatus::CompileError,
            ExecutionStatus::RuntimeError,
            ExecutionStatus::Timeout,
            ExecutionStatus::ResourceExceeded,
            ExecutionStatus::InternalError,
        ] {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status));
        }
    }

    #[test]
    fn test_only_internal_error_is_platform_fault() {
        assert!(ExecutionStatus::InternalError.is_platform_fault());
        assert!(!ExecutionStatus::RuntimeError.is_platform_fault());
        assert!(!ExecutionStatus::Timeout.is_platform_fault());
    }
}
