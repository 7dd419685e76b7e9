//! Language toolchain adapters
//!
//! Two strategies driven by `ToolchainSpec`:
//! - `CompiledToolchain`: stage source, compile under compile limits, run the artifact
//! - `InterpretedToolchain`: stage source, run the interpreter on it
//!
//! Adding a language is adding a `files/languages.toml` entry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::limiter::Termination;
use super::sandbox::{CommandSpec, RunOutcome, SandboxHandle};
use crate::core::{Diagnostic, ResourceLimits, ToolchainSpec};

/// Result of the compile phase
#[derive(Debug)]
pub enum CompileOutcome {
    /// Interpreted language, nothing to do
    Skipped,
    Compiled { duration: Duration },
    Failed(CompileFailure),
}

/// Why compilation failed, with the compiler's own report
#[derive(Debug)]
pub struct CompileFailure {
    /// Compiler diagnostics (stderr, else stdout, else a synthesized reason)
    pub message: String,
    pub diagnostic: Option<Diagnostic>,
    pub run: RunOutcome,
}

/// Per-language compile and run strategy
#[async_trait]
pub trait Toolchain: Send + Sync {
    fn spec(&self) -> &ToolchainSpec;

    /// Write the source under its canonical file name
    async fn stage_source(&self, sandbox: &mut SandboxHandle, source: &str) -> Result<()> {
        sandbox
            .write_file(&self.spec().source_file, source.as_bytes())
            .await
    }

    async fn compile(
        &self,
        sandbox: &mut SandboxHandle,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<CompileOutcome>;

    async fn run(
        &self,
        sandbox: &mut SandboxHandle,
        limits: &ResourceLimits,
        stdin: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let spec = self.spec();
        let command = CommandSpec::from_vec(&spec.run_command)?
            .with_address_space_limit(spec.limit_address_space);
        sandbox
            .run_isolated(&command, limits, stdin.as_bytes(), cancel)
            .await
    }
}

/// Pick the strategy for a spec
pub fn toolchain_for(spec: Arc<ToolchainSpec>) -> Box<dyn Toolchain> {
    if spec.is_compiled() {
        Box::new(CompiledToolchain { spec })
    } else {
        Box::new(InterpretedToolchain { spec })
    }
}

pub struct CompiledToolchain {
    spec: Arc<ToolchainSpec>,
}

#[async_trait]
impl Toolchain for CompiledToolchain {
    fn spec(&self) -> &ToolchainSpec {
        &self.spec
    }

    async fn compile(
        &self,
        sandbox: &mut SandboxHandle,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<CompileOutcome> {
        let Some(compile_command) = &self.spec.compile_command else {
            return Ok(CompileOutcome::Skipped);
        };

        debug!("Compiling {} with {:?}", self.spec.name, compile_command);

        let command = CommandSpec::from_vec(compile_command)?.with_address_space_limit(false);
        let run = sandbox.run_isolated(&command, limits, b"", cancel).await?;

        if run.is_success() {
            return Ok(CompileOutcome::Compiled {
                duration: run.duration,
            });
        }

        let message = compile_error_message(&run);
        let diagnostic = self.spec.extract_diagnostic(&message);
        Ok(CompileOutcome::Failed(CompileFailure {
            message,
            diagnostic,
            run,
        }))
    }
}

pub struct InterpretedToolchain {
    spec: Arc<ToolchainSpec>,
}

#[async_trait]
impl Toolchain for InterpretedToolchain {
    fn spec(&self) -> &ToolchainSpec {
        &self.spec
    }

    async fn compile(
        &self,
        _sandbox: &mut SandboxHandle,
        _limits: &ResourceLimits,
        _cancel: &CancellationToken,
    ) -> Result<CompileOutcome> {
        Ok(CompileOutcome::Skipped)
    }
}

fn compile_error_message(run: &RunOutcome) -> String {
    if !run.output.stderr.trim().is_empty() {
        return run.output.stderr.clone();
    }
    if !run.output.stdout.trim().is_empty() {
        return run.output.stdout.clone();
    }
    match run.termination {
        Termination::TimedOut | Termination::CpuTimeExceeded => "Compilation timed out".to_string(),
        Termination::MemoryExceeded => "Compiler ran out of memory".to_string(),
        Termination::Signaled(_) => "Compiler crashed".to_string(),
        Termination::Exited(code) => format!("Compilation failed with exit code {}", code),
        _ => "Compilation failed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ToolchainRegistry;
    use crate::engine::collector::CapturedOutput;

    fn outcome(termination: Termination, stdout: &str, stderr: &str) -> RunOutcome {
        RunOutcome {
            termination,
            exit_code: None,
            signal: None,
            duration: Duration::ZERO,
            output: CapturedOutput {
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
                ..Default::default()
            },
            memory_peak_bytes: None,
        }
    }

    #[test]
    fn test_compile_error_message_prefers_stderr() {
        let run = outcome(Termination::Exited(1), "out", "main.cpp:1:1: error: x");
        assert_eq!(compile_error_message(&run), "main.cpp:1:1: error: x");

        let run = outcome(Termination::Exited(1), "Main.java:3: error: y", "  \n");
        assert_eq!(compile_error_message(&run), "Main.java:3: error: y");
    }

    #[test]
    fn test_compile_error_message_fallbacks() {
        assert_eq!(
            compile_error_message(&outcome(Termination::TimedOut, "", "")),
            "Compilation timed out"
        );
        assert_eq!(
            compile_error_message(&outcome(Termination::Signaled(11), "", "")),
            "Compiler crashed"
        );
        assert_eq!(
            compile_error_message(&outcome(Termination::Exited(4), "", "")),
            "Compilation failed with exit code 4"
        );
    }

    #[test]
    fn test_strategy_selection() {
        let registry = ToolchainRegistry::load_default().unwrap();

        let cpp = toolchain_for(registry.get("cpp").unwrap());
        assert!(cpp.spec().is_compiled());
        let python = toolchain_for(registry.get("python").unwrap());
        assert!(!python.spec().is_compiled());
    }
}
