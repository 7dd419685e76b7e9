//! Request, limits and result types shared by every layer

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::status::ExecutionStatus;

/// Hard ceilings applied to one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    /// Wall-clock budget for the run phase in milliseconds
    pub wall_clock_ms: u64,
    /// CPU time in seconds (RLIMIT_CPU granularity)
    pub cpu_secs: u64,
    /// Memory ceiling in bytes
    pub memory_bytes: u64,
    /// Maximum number of live processes/threads
    pub max_processes: u32,
    /// Cap on captured bytes per output stream
    pub max_output_bytes: usize,
    /// Largest file the program may write
    pub max_file_bytes: u64,
    /// Maximum open file descriptors
    pub max_open_files: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            wall_clock_ms: 10_000,
            cpu_secs: 5,
            memory_bytes: 256 * 1024 * 1024,
            max_processes: 64,
            max_output_bytes: 64 * 1024,
            max_file_bytes: 16 * 1024 * 1024,
            max_open_files: 256,
        }
    }
}

impl ResourceLimits {
    /// Server-enforced upper bounds used when no ceiling is configured
    pub fn default_ceiling() -> Self {
        Self {
            wall_clock_ms: 30_000,
            cpu_secs: 30,
            memory_bytes: 1024 * 1024 * 1024,
            max_processes: 128,
            max_output_bytes: 1024 * 1024,
            max_file_bytes: 64 * 1024 * 1024,
            max_open_files: 1024,
        }
    }

    /// Field-wise minimum of two limit sets
    pub fn min(&self, other: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            wall_clock_ms: self.wall_clock_ms.min(other.wall_clock_ms),
            cpu_secs: self.cpu_secs.min(other.cpu_secs),
            memory_bytes: self.memory_bytes.min(other.memory_bytes),
            max_processes: self.max_processes.min(other.max_processes),
            max_output_bytes: self.max_output_bytes.min(other.max_output_bytes),
            max_file_bytes: self.max_file_bytes.min(other.max_file_bytes),
            max_open_files: self.max_open_files.min(other.max_open_files),
        }
    }

    /// Apply a partial override on top of these limits
    pub fn with_override(&self, overrides: &LimitsOverride) -> ResourceLimits {
        ResourceLimits {
            wall_clock_ms: overrides.wall_clock_ms.unwrap_or(self.wall_clock_ms),
            cpu_secs: overrides.cpu_secs.unwrap_or(self.cpu_secs),
            memory_bytes: overrides.memory_bytes.unwrap_or(self.memory_bytes),
            max_processes: overrides.max_processes.unwrap_or(self.max_processes),
            max_output_bytes: overrides.max_output_bytes.unwrap_or(self.max_output_bytes),
            max_file_bytes: overrides.max_file_bytes.unwrap_or(self.max_file_bytes),
            max_open_files: overrides.max_open_files.unwrap_or(self.max_open_files),
        }
    }
}

/// Partial limits supplied by a caller or a toolchain entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsOverride {
    pub wall_clock_ms: Option<u64>,
    pub cpu_secs: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub max_processes: Option<u32>,
    pub max_output_bytes: Option<usize>,
    pub max_file_bytes: Option<u64>,
    pub max_open_files: Option<u64>,
}

impl LimitsOverride {
    /// Names of fields explicitly set to zero
    pub fn zero_fields(&self) -> Vec<&'static str> {
        let mut zero = Vec::new();
        if self.wall_clock_ms == Some(0) {
            zero.push("wall_clock_ms");
        }
        if self.cpu_secs == Some(0) {
            zero.push("cpu_secs");
        }
        if self.memory_bytes == Some(0) {
            zero.push("memory_bytes");
        }
        if self.max_processes == Some(0) {
            zero.push("max_processes");
        }
        if self.max_output_bytes == Some(0) {
            zero.push("max_output_bytes");
        }
        if self.max_file_bytes == Some(0) {
            zero.push("max_file_bytes");
        }
        if self.max_open_files == Some(0) {
            zero.push("max_open_files");
        }
        zero
    }
}

/// A validated request, ready for admission
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// Correlation id, echoed in the result
    pub id: Uuid,
    /// Canonical toolchain name (aliases already resolved)
    pub language: String,
    pub source_code: String,
    pub stdin: String,
    /// Effective limits after defaults, overrides and ceilings
    pub limits: ResourceLimits,
}

/// First error location extracted from toolchain output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub line: Option<u32>,
    pub message: String,
}

/// Structured outcome of one execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub id: Uuid,
    pub language: String,
    pub status: ExecutionStatus,
    /// Lossy UTF-8 of the captured bytes. The capture keeps exactly
    /// `max_output_bytes`; the text can be a few bytes shorter when the cut
    /// lands inside a multi-byte character.
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    /// Exit code, `128 + signal` for signal deaths, `None` if nothing ran
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
    /// Wall time of the phase that decided the status
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compile_duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_peak_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostic: Option<Diagnostic>,
}

impl ExecutionResult {
    /// Opaque platform failure; details stay in the logs
    pub fn internal_error(id: Uuid, language: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            language: language.into(),
            status: ExecutionStatus::InternalError,
            stdout: String::new(),
            stderr: message.into(),
            stdout_truncated: false,
            stderr_truncated: false,
            exit_code: None,
            signal: None,
            duration_ms: 0,
            compile_duration_ms: None,
            memory_peak_bytes: None,
            diagnostic: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    /// Whether any captured stream was cut at the output cap
    pub fn is_truncated(&self) -> bool {
        self.stdout_truncated || self.stderr_truncated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_then_ceiling() {
        let defaults = ResourceLimits::default();
        let ceiling = ResourceLimits::default_ceiling();
        let overrides = LimitsOverride {
            wall_clock_ms: Some(1_000),
            memory_bytes: Some(u64::MAX),
            ..Default::default()
        };

        let effective = defaults.with_override(&overrides).min(&ceiling);

        assert_eq!(effective.wall_clock_ms, 1_000);
        assert_eq!(effective.memory_bytes, ceiling.memory_bytes);
        assert_eq!(effective.cpu_secs, defaults.cpu_secs);
    }

    #[test]
    fn test_zero_fields() {
        let overrides = LimitsOverride {
            cpu_secs: Some(0),
            max_output_bytes: Some(0),
            max_processes: Some(3),
            ..Default::default()
        };
        assert_eq!(overrides.zero_fields(), vec!["cpu_secs", "max_output_bytes"]);
        assert!(LimitsOverride::default().zero_fields().is_empty());
    }

    #[test]
    fn test_limits_toml_partial() {
        let limits: ResourceLimits = toml::from_str("wall_clock_ms = 2500\n").unwrap();
        assert_eq!(limits.wall_clock_ms, 2500);
        assert_eq!(limits.max_processes, ResourceLimits::default().max_processes);
    }

    #[test]
    fn test_internal_error_result() {
        let result = ExecutionResult::internal_error(Uuid::nil(), "cpp", "sandbox unavailable");
        assert_eq!(result.status, ExecutionStatus::InternalError);
        assert_eq!(result.exit_code, None);
        assert!(!result.is_truncated());
    }
}
