//! Isolation sandbox
//!
//! Every execution gets its own environment: a scratch directory, a process
//! group and, where available, a cgroup or an isolate box. Backends:
//! - `native`: setsid + rlimits + cgroup v2 + user/net namespaces + landlock,
//!   with a per-run subreaper that reaps anything the program leaves behind
//! - `isolate`: the external isolate sandbox, one box per worker slot
//!
//! A `SandboxHandle` owns one environment and tears it down exactly once,
//! either through `close()` or, on panic/cancellation, through `Drop`.

pub mod cgroup;
pub mod isolate_box;
pub mod meta;
pub mod native;
pub mod reaper;

use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use super::collector::CapturedOutput;
use super::limiter::Termination;
use crate::core::{BackendKind, ResourceLimits, SandboxConfig};

pub use isolate_box::IsolateBackend;
pub use native::{HostCapabilities, NativeBackend};

/// Identity of the execution an environment is created for
#[derive(Debug, Clone, Copy)]
pub struct SandboxContext {
    pub id: Uuid,
    /// Worker slot index, stable for the lifetime of the execution
    pub slot: usize,
}

/// Command specification for execution inside a sandbox
#[derive(Debug, Clone)]
pub struct CommandSpec {
    /// Program path or name, resolved through the sandbox PATH
    pub program: String,
    pub args: Vec<String>,
    /// Whether RLIMIT_AS may stand in for a missing memory cgroup
    pub limit_address_space: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            limit_address_space: true,
        }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(|a| a.into()).collect();
        self
    }

    pub fn with_address_space_limit(mut self, value: bool) -> Self {
        self.limit_address_space = value;
        self
    }

    /// Create from a command vector (first element is program, rest are args)
    pub fn from_vec(cmd: &[String]) -> Result<Self> {
        let (program, args) = cmd.split_first().context("Empty command")?;
        Ok(Self::new(program.clone()).with_args(args.iter().cloned()))
    }

    /// Program followed by its arguments
    pub fn to_vec(&self) -> Vec<String> {
        let mut v = vec![self.program.clone()];
        v.extend(self.args.iter().cloned());
        v
    }
}

/// Result of one `run_isolated` call
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub termination: Termination,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
    pub duration: Duration,
    pub output: CapturedOutput,
    pub memory_peak_bytes: Option<u64>,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        self.termination == Termination::Exited(0)
    }

    /// Exit code, or `128 + signal` for signal deaths
    pub fn reported_exit_code(&self) -> Option<i32> {
        match (self.exit_code, self.signal) {
            (Some(code), _) => Some(code),
            (None, Some(signal)) => Some(128 + signal),
            (None, None) => None,
        }
    }
}

/// Factory for isolated environments
#[async_trait]
pub trait Isolation: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, ctx: &SandboxContext) -> Result<Box<dyn SandboxEnv>>;
}

/// One isolated environment
#[async_trait]
pub trait SandboxEnv: Send + Sync {
    /// Host path of the directory programs run in
    fn work_dir(&self) -> &Path;

    /// Run `command` from the work directory under `limits`
    async fn run_isolated(
        &mut self,
        command: &CommandSpec,
        limits: &ResourceLimits,
        stdin: &[u8],
        cancel: &CancellationToken,
    ) -> Result<RunOutcome>;

    /// Kill everything still running and release every resource. Blocking.
    /// Failures are logged, never returned.
    fn teardown(self: Box<Self>);
}

/// Build the configured backend, probing host capabilities once
pub async fn build_backend(config: &SandboxConfig) -> Result<Arc<dyn Isolation>> {
    match config.backend {
        BackendKind::Native => Ok(Arc::new(NativeBackend::new(config.clone()).await?)),
        BackendKind::Isolate => Ok(Arc::new(IsolateBackend::new(config.clone()).await?)),
    }
}

/// Exclusively owned sandbox environment with guaranteed teardown
pub struct SandboxHandle {
    id: Uuid,
    env: Option<Box<dyn SandboxEnv>>,
}

impl SandboxHandle {
    pub async fn create(backend: &dyn Isolation, ctx: &SandboxContext) -> Result<Self> {
        let env = backend
            .create(ctx)
            .await
            .with_context(|| format!("Failed to create {} sandbox", backend.name()))?;
        debug!("Sandbox {} created at {:?}", ctx.id, env.work_dir());
        Ok(Self {
            id: ctx.id,
            env: Some(env),
        })
    }

    fn env(&mut self) -> Result<&mut Box<dyn SandboxEnv>> {
        self.env.as_mut().context("Sandbox already torn down")
    }

    pub fn work_dir(&self) -> Option<&Path> {
        self.env.as_ref().map(|env| env.work_dir())
    }

    /// Write a file into the work directory; the name must stay inside it
    pub async fn write_file(&mut self, name: &str, contents: &[u8]) -> Result<()> {
        if !is_safe_path(name) {
            anyhow::bail!("Refusing to write outside the sandbox: {:?}", name);
        }
        let path = self.env()?.work_dir().join(name);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("Failed to write {:?}", path))
    }

    pub async fn run_isolated(
        &mut self,
        command: &CommandSpec,
        limits: &ResourceLimits,
        stdin: &[u8],
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        self.env()?
            .run_isolated(command, limits, stdin, cancel)
            .await
    }

    /// Tear down on the blocking pool
    pub async fn close(mut self) {
        let Some(env) = self.env.take() else {
            return;
        };
        let id = self.id;
        if let Err(e) = tokio::task::spawn_blocking(move || env.teardown()).await {
            error!("Sandbox {} teardown panicked: {}", id, e);
        }
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if let Some(env) = self.env.take() {
            debug!("Sandbox {} dropped without close, tearing down inline", self.id);
            env.teardown();
        }
    }
}

/// Relative path without `..`, root or prefix components
pub fn is_safe_path(path: &str) -> bool {
    if path.is_empty() {
        return false;
    }
    Path::new(path)
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}
