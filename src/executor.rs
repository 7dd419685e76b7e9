//! Execution orchestrator
//!
//! Validates a request, admits it through the scheduler, then drives one
//! sandbox through allocate → stage → compile → run → collect → teardown.
//! Anything that goes wrong after admission is reported as an
//! `InternalError` result; the detailed cause only goes to the log.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::core::{
    CompileConfig, ExecError, ExecutionRequest, ExecutionResult, ExecutionStatus,
    LimitsOverride, ServiceConfig, Severity, ToolchainRegistry, ToolchainSpec,
};
use crate::engine::toolchain::CompileFailure;
use crate::engine::{
    build_backend, classify, toolchain_for, CompileOutcome, Isolation, ResourceLimiter,
    SandboxContext, SandboxHandle, Toolchain,
};
use crate::scheduler::{Scheduler, SchedulerStats};

/// Message returned to callers for platform faults
const INTERNAL_ERROR_MESSAGE: &str = "internal sandbox error";

pub struct Executor {
    config: Arc<ServiceConfig>,
    registry: Arc<ToolchainRegistry>,
    backend: Arc<dyn Isolation>,
    limiter: ResourceLimiter,
    scheduler: Scheduler,
}

impl Executor {
    /// Build the configured sandbox backend (probing the host) and the worker pool
    pub async fn new(config: ServiceConfig, registry: ToolchainRegistry) -> Result<Self> {
        let backend = build_backend(&config.sandbox).await?;
        Ok(Self::with_backend(config, registry, backend))
    }

    pub fn with_backend(
        config: ServiceConfig,
        registry: ToolchainRegistry,
        backend: Arc<dyn Isolation>,
    ) -> Self {
        let limiter = ResourceLimiter::new(config.default_limits, config.ceiling_limits);
        let scheduler = Scheduler::new(config.workers, config.queue_depth);
        info!(
            "Executor ready: backend={}, workers={}, queue_depth={}, languages={:?}",
            backend.name(),
            config.workers,
            config.queue_depth,
            registry.languages()
        );
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            backend,
            limiter,
            scheduler,
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Registered language names, sorted
    pub fn languages(&self) -> Vec<String> {
        self.registry.languages()
    }

    /// Language for a file name's extension, falling back to the source's
    /// first lines
    pub fn detect_language(&self, filename: Option<&str>, source: &str) -> Option<String> {
        filename
            .and_then(|name| self.registry.detect_by_extension(name))
            .or_else(|| self.registry.detect_by_content(source))
            .map(|spec| spec.name.clone())
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    /// Validate a request and resolve its limits. Allocates nothing.
    pub fn prepare(
        &self,
        language: &str,
        source: &str,
        stdin: &str,
        overrides: Option<&LimitsOverride>,
    ) -> Result<ExecutionRequest, ExecError> {
        let spec = self
            .registry
            .get(language)
            .ok_or_else(|| ExecError::UnsupportedLanguage(language.to_string()))?;

        if source.len() > self.config.max_source_bytes {
            return Err(ExecError::InvalidInput(format!(
                "source is {} bytes, limit is {}",
                source.len(),
                self.config.max_source_bytes
            )));
        }

        let issues = spec.validate(source);
        for issue in issues.iter().filter(|i| i.severity != Severity::Error) {
            debug!("{} source {}", spec.name, issue);
        }
        if let Some(issue) = issues.iter().find(|i| i.severity == Severity::Error) {
            return Err(ExecError::InvalidInput(issue.to_string()));
        }

        let limits = self.limiter.resolve(&spec.limits, overrides)?;

        Ok(ExecutionRequest {
            id: Uuid::new_v4(),
            language: spec.name.clone(),
            source_code: source.to_string(),
            stdin: stdin.to_string(),
            limits,
        })
    }

    /// Compile (if needed) and run `source`, waiting for the result
    pub async fn execute(
        &self,
        language: &str,
        source: &str,
        stdin: &str,
        overrides: Option<LimitsOverride>,
    ) -> Result<ExecutionResult, ExecError> {
        let request = self.prepare(language, source, stdin, overrides.as_ref())?;
        self.execute_request(request, &CancellationToken::new()).await
    }

    /// Run a prepared request; cancelling `cancel` stops it at any phase
    pub async fn execute_request(
        &self,
        request: ExecutionRequest,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecError> {
        let spec = self
            .registry
            .get(&request.language)
            .ok_or_else(|| ExecError::UnsupportedLanguage(request.language.clone()))?;

        debug!(
            "Execution {} ({}) limits: {:?}",
            request.id, request.language, request.limits
        );

        let id = request.id;
        let language = request.language.clone();
        let backend = Arc::clone(&self.backend);
        let compile = self.config.compile.clone();
        let submitted = self
            .scheduler
            .submit(cancel, move |slot, token| {
                run_phases(backend, spec, compile, request, slot, token)
            })
            .await;

        match submitted {
            Ok(result) => result,
            Err(ExecError::WorkerPanicked(message)) => {
                error!("Execution {} worker panicked: {}", id, message);
                Ok(ExecutionResult::internal_error(id, &language, INTERNAL_ERROR_MESSAGE))
            }
            Err(e) => {
                warn!("Execution {} not run: {}", id, e);
                Err(e)
            }
        }
    }

    /// Stop admitting work and wait for running executions
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

/// Runs on a worker slot; owns the sandbox for the whole execution
async fn run_phases(
    backend: Arc<dyn Isolation>,
    spec: Arc<ToolchainSpec>,
    compile: CompileConfig,
    request: ExecutionRequest,
    slot: usize,
    cancel: CancellationToken,
) -> Result<ExecutionResult, ExecError> {
    let ctx = SandboxContext {
        id: request.id,
        slot,
    };

    let mut sandbox = match SandboxHandle::create(backend.as_ref(), &ctx).await {
        Ok(sandbox) => sandbox,
        Err(e) => {
            error!("Execution {}: {:#}", request.id, e);
            return Ok(ExecutionResult::internal_error(
                request.id,
                &request.language,
                INTERNAL_ERROR_MESSAGE,
            ));
        }
    };

    let toolchain = toolchain_for(spec);
    let outcome = run_in_sandbox(toolchain.as_ref(), &mut sandbox, &compile, &request, &cancel).await;
    sandbox.close().await;

    if cancel.is_cancelled() {
        info!("Execution {} cancelled", request.id);
        return Err(ExecError::Cancelled);
    }

    let result = match outcome {
        Ok(result) => result,
        Err(e) => {
            error!("Execution {} failed: {:#}", request.id, e);
            ExecutionResult::internal_error(request.id, &request.language, INTERNAL_ERROR_MESSAGE)
        }
    };

    info!(
        "Execution {} ({}) completed: {} in {}ms",
        result.id, result.language, result.status, result.duration_ms
    );
    Ok(result)
}

async fn run_in_sandbox(
    toolchain: &dyn Toolchain,
    sandbox: &mut SandboxHandle,
    compile: &CompileConfig,
    request: &ExecutionRequest,
    cancel: &CancellationToken,
) -> Result<ExecutionResult> {
    toolchain.stage_source(sandbox, &request.source_code).await?;

    let compile_limits = compile.limits(&request.limits);
    let compile_duration = match toolchain.compile(sandbox, &compile_limits, cancel).await? {
        CompileOutcome::Skipped => None,
        CompileOutcome::Compiled { duration } => Some(duration),
        CompileOutcome::Failed(failure) => return Ok(compile_error_result(request, failure)),
    };

    let run = toolchain
        .run(sandbox, &request.limits, &request.stdin, cancel)
        .await?;
    let status = classify(&run.termination);
    let diagnostic = match status {
        ExecutionStatus::RuntimeError => toolchain.spec().extract_diagnostic(&run.output.stderr),
        _ => None,
    };

    Ok(ExecutionResult {
        id: request.id,
        language: request.language.clone(),
        status,
        exit_code: run.reported_exit_code(),
        signal: run.signal,
        duration_ms: millis(run.duration),
        compile_duration_ms: compile_duration.map(millis),
        memory_peak_bytes: run.memory_peak_bytes,
        diagnostic,
        stdout: run.output.stdout,
        stderr: run.output.stderr,
        stdout_truncated: run.output.stdout_truncated,
        stderr_truncated: run.output.stderr_truncated,
    })
}

fn compile_error_result(request: &ExecutionRequest, failure: CompileFailure) -> ExecutionResult {
    let run = failure.run;
    ExecutionResult {
        id: request.id,
        language: request.language.clone(),
        status: ExecutionStatus::CompileError,
        exit_code: run.reported_exit_code(),
        signal: run.signal,
        duration_ms: millis(run.duration),
        compile_duration_ms: Some(millis(run.duration)),
        memory_peak_bytes: run.memory_peak_bytes,
        diagnostic: failure.diagnostic,
        stdout: run.output.stdout,
        stderr: failure.message,
        stdout_truncated: run.output.stdout_truncated,
        stderr_truncated: run.output.stderr_truncated,
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis().min(u64::MAX as u128) as u64
}
