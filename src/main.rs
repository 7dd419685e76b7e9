use std::sync::Arc;

use anyhow::{Context, Result};
use exec_sandbox::{
    ExecError, ExecutionResult, Executor, LimitsOverride, ServiceConfig, ToolchainRegistry,
};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// One request line read from stdin
#[derive(Debug, Deserialize)]
struct JobRequest {
    /// Caller's correlation id; a fresh one is generated when absent
    #[serde(default)]
    id: Option<String>,
    /// Detected from `filename`, then from the source, when absent
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    filename: Option<String>,
    source: String,
    #[serde(default)]
    stdin: String,
    #[serde(default)]
    limits: Option<LimitsOverride>,
}

/// One response line written to stdout
#[derive(Debug, Serialize)]
struct JobResponse {
    id: Option<String>,
    #[serde(flatten)]
    outcome: JobOutcome,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
enum JobOutcome {
    Result(Box<ExecutionResult>),
    Error(JobError),
}

#[derive(Debug, Serialize)]
struct JobError {
    kind: &'static str,
    message: String,
    retryable: bool,
}

impl JobResponse {
    fn result(id: String, result: ExecutionResult) -> Self {
        Self {
            id: Some(id),
            outcome: JobOutcome::Result(Box::new(result)),
        }
    }

    fn error(id: Option<String>, err: &ExecError) -> Self {
        let kind = match err {
            ExecError::InvalidInput(_) => "invalid_input",
            ExecError::UnsupportedLanguage(_) => "unsupported_language",
            ExecError::Overloaded => "overloaded",
            ExecError::Cancelled => "cancelled",
            ExecError::WorkerPanicked(_) => "worker_panicked",
        };
        Self {
            id,
            outcome: JobOutcome::Error(JobError {
                kind,
                message: err.to_string(),
                retryable: err.is_retryable(),
            }),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("exec_sandbox=info".parse()?),
        )
        .init();

    let config = ServiceConfig::load()?;
    let registry = ToolchainRegistry::from_env()?;
    info!("Loaded {} language configurations", registry.len());

    info!("Starting exec worker...");
    let executor = Arc::new(Executor::new(config, registry).await?);

    let shutdown = CancellationToken::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut jobs = JoinSet::new();
    let mut input_open = true;

    info!("Waiting for jobs on stdin...");

    loop {
        tokio::select! {
            line = lines.next_line(), if input_open => match line.context("Failed to read stdin")? {
                Some(line) if !line.trim().is_empty() => {
                    jobs.spawn(handle_line(
                        Arc::clone(&executor),
                        line,
                        shutdown.child_token(),
                    ));
                }
                Some(_) => {}
                None => {
                    info!("Input closed, waiting for {} in-flight jobs", jobs.len());
                    input_open = false;
                }
            },
            Some(done) = jobs.join_next() => match done {
                Ok(response) => write_response(&mut stdout, &response).await?,
                Err(e) => error!("Job task failed: {}", e),
            },
            _ = tokio::signal::ctrl_c(), if !shutdown.is_cancelled() => {
                warn!("Interrupted, cancelling {} in-flight jobs", jobs.len());
                shutdown.cancel();
                input_open = false;
            }
        }

        if !input_open && jobs.is_empty() {
            break;
        }
    }

    executor.shutdown().await;
    stdout.flush().await?;
    info!("Exec worker stopped");
    Ok(())
}

async fn handle_line(executor: Arc<Executor>, line: String, cancel: CancellationToken) -> JobResponse {
    let job: JobRequest = match serde_json::from_str(&line) {
        Ok(job) => job,
        Err(e) => {
            warn!("Failed to parse job: {}", e);
            return JobResponse::error(None, &ExecError::InvalidInput(e.to_string()));
        }
    };

    let language = match job
        .language
        .clone()
        .or_else(|| executor.detect_language(job.filename.as_deref(), &job.source))
    {
        Some(language) => language,
        None => {
            let err = ExecError::InvalidInput("language missing and not detectable".to_string());
            warn!("Rejected job {:?}: {}", job.id, err);
            return JobResponse::error(job.id, &err);
        }
    };

    let request = match executor.prepare(&language, &job.source, &job.stdin, job.limits.as_ref()) {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejected job {:?}: {}", job.id, e);
            return JobResponse::error(job.id, &e);
        }
    };

    let id = job.id.unwrap_or_else(|| request.id.to_string());
    info!("Received job: id={}, language={}", id, request.language);

    match executor.execute_request(request, &cancel).await {
        Ok(result) => JobResponse::result(id, result),
        Err(e) => {
            warn!("Job {} not executed: {}", id, e);
            JobResponse::error(Some(id), &e)
        }
    }
}

async fn write_response(stdout: &mut Stdout, response: &JobResponse) -> Result<()> {
    let mut line = serde_json::to_vec(response)?;
    line.push(b'\n');
    stdout
        .write_all(&line)
        .await
        .context("Failed to write response")?;
    stdout.flush().await?;
    Ok(())
}
