pub mod config;
pub mod error;
pub mod languages;
pub mod request;
pub mod status;

pub use config::{BackendKind, CompileConfig, SandboxConfig, ServiceConfig};
pub use error::ExecError;
pub use languages::{Severity, ToolchainRegistry, ToolchainSpec, ValidationIssue, ValidationRule};
pub use request::{Diagnostic, ExecutionRequest, ExecutionResult, LimitsOverride, ResourceLimits};
pub use status::ExecutionStatus;
