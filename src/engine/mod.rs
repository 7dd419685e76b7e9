//! Execution engine: isolation, limits, toolchains and output capture

pub mod collector;
pub mod limiter;
pub mod sandbox;
pub mod toolchain;

pub use collector::{classify, CappedBuffer, CapturedOutput};
pub use limiter::{ResourceLimiter, Termination};
pub use sandbox::{build_backend, CommandSpec, Isolation, RunOutcome, SandboxContext, SandboxHandle};
pub use toolchain::{toolchain_for, CompileOutcome, Toolchain};
