//! Multi-tenant code execution sandbox
//!
//! Compiles and runs untrusted source code under hard resource limits and
//! returns a structured result. Entry point is [`Executor`].

pub mod core;
pub mod engine;
pub mod executor;
pub mod scheduler;

pub use crate::core::{
    ExecError, ExecutionRequest, ExecutionResult, ExecutionStatus, LimitsOverride,
    ResourceLimits, ServiceConfig, ToolchainRegistry,
};
pub use executor::Executor;
