//! Resource limiter
//!
//! Resolves effective limits, builds the rlimit set applied in the child
//! before `exec`, and supervises a running process group: wall-clock timer,
//! cancellation, SIGTERM → SIGKILL escalation, output draining.

use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::resource::{setrlimit, Resource};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::collector::{drain, CappedBuffer};
use crate::core::{ExecError, LimitsOverride, ResourceLimits};

/// Runtime messages printed when an allocation fails without a kernel OOM kill.
/// Only consulted when no memory cgroup accounts for the run.
const ALLOCATION_FAILURE_MARKERS: &[&str] = &[
    "std::bad_alloc",
    "MemoryError",
    "Cannot allocate memory",
    "out of memory",
    "OutOfMemoryError",
];

/// Combines service defaults, language defaults, caller overrides and the ceiling
#[derive(Debug, Clone)]
pub struct ResourceLimiter {
    defaults: ResourceLimits,
    ceiling: ResourceLimits,
}

impl ResourceLimiter {
    pub fn new(defaults: ResourceLimits, ceiling: ResourceLimits) -> Self {
        Self { defaults, ceiling }
    }

    pub fn ceiling(&self) -> &ResourceLimits {
        &self.ceiling
    }

    /// Effective limit per field: `min(override or language default, ceiling)`
    pub fn resolve(
        &self,
        language: &LimitsOverride,
        overrides: Option<&LimitsOverride>,
    ) -> Result<ResourceLimits, ExecError> {
        let mut limits = self.defaults.with_override(language);
        if let Some(overrides) = overrides {
            let zero = overrides.zero_fields();
            if !zero.is_empty() {
                return Err(ExecError::InvalidInput(format!(
                    "limits must be positive: {}",
                    zero.join(", ")
                )));
            }
            limits = limits.with_override(overrides);
        }
        Ok(limits.min(&self.ceiling))
    }
}

/// rlimits installed in the child between fork and exec
#[derive(Debug, Clone)]
pub struct RlimitPlan {
    entries: Vec<(Resource, u64, u64)>,
}

impl RlimitPlan {
    /// `cgroup` says whether memory and process count are already enforced
    /// by a cgroup; if not, RLIMIT_AS (when `address_space` allows it) and
    /// RLIMIT_NPROC stand in.
    pub fn new(limits: &ResourceLimits, cgroup: bool, address_space: bool) -> Self {
        let mut entries = vec![
            (Resource::RLIMIT_CPU, limits.cpu_secs, limits.cpu_secs + 1),
            (
                Resource::RLIMIT_FSIZE,
                limits.max_file_bytes,
                limits.max_file_bytes,
            ),
            (
                Resource::RLIMIT_NOFILE,
                limits.max_open_files,
                limits.max_open_files,
            ),
            (Resource::RLIMIT_CORE, 0, 0),
        ];

        if !cgroup {
            if address_space {
                entries.push((
                    Resource::RLIMIT_AS,
                    limits.memory_bytes,
                    limits.memory_bytes,
                ));
            }
            let nproc = u64::from(limits.max_processes);
            entries.push((Resource::RLIMIT_NPROC, nproc, nproc));
        }

        Self { entries }
    }

    pub fn entries(&self) -> &[(Resource, u64, u64)] {
        &self.entries
    }

    /// Only calls setrlimit, so it is safe between fork and exec
    pub fn apply(&self) -> nix::Result<()> {
        for &(resource, soft, hard) in &self.entries {
            setrlimit(resource, soft, hard)?;
        }
        Ok(())
    }
}

/// Why a supervised process stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    TimedOut,
    Cancelled,
    MemoryExceeded,
    ProcessLimitExceeded,
    CpuTimeExceeded,
    FileSizeExceeded,
}

/// Everything known about a finished process, gathered from the wait status,
/// the supervisor and the backend's accounting
#[derive(Debug, Clone, Default)]
pub struct Evidence {
    pub cancelled: bool,
    pub timed_out: bool,
    pub oom_killed: bool,
    pub pids_exhausted: bool,
    pub cpu_exceeded: bool,
    /// stderr carries an allocation failure report and no memory cgroup
    /// accounted for the run
    pub allocation_failure_reported: bool,
    pub exit_code: Option<i32>,
    pub signal: Option<i32>,
}

impl Termination {
    /// Apply the precedence: cancel, timer, memory, process count, CPU,
    /// file size, signal, exit code
    pub fn decide(evidence: &Evidence) -> Termination {
        // A report only counts together with a signal death (abort after bad_alloc)
        let allocation_failed = evidence.allocation_failure_reported && evidence.signal.is_some();

        if evidence.cancelled {
            Termination::Cancelled
        } else if evidence.timed_out {
            Termination::TimedOut
        } else if evidence.oom_killed || allocation_failed {
            Termination::MemoryExceeded
        } else if evidence.pids_exhausted {
            Termination::ProcessLimitExceeded
        } else if evidence.cpu_exceeded || evidence.signal == Some(Signal::SIGXCPU as i32) {
            Termination::CpuTimeExceeded
        } else if evidence.signal == Some(Signal::SIGXFSZ as i32) {
            Termination::FileSizeExceeded
        } else if let Some(signal) = evidence.signal {
            Termination::Signaled(signal)
        } else {
            Termination::Exited(evidence.exit_code.unwrap_or(-1))
        }
    }
}

/// Whether stderr carries a runtime's allocation-failure report
pub fn reports_allocation_failure(stderr: &str) -> bool {
    ALLOCATION_FAILURE_MARKERS
        .iter()
        .any(|marker| stderr.contains(marker))
}

/// Split a wait status into (exit code, signal)
pub fn exit_parts(status: &ExitStatus) -> (Option<i32>, Option<i32>) {
    (status.code(), status.signal())
}

/// A process group started with `setsid`, optionally backed by a cgroup
#[derive(Debug, Clone)]
pub struct ProcessGroup {
    pgid: Pid,
    /// `cgroup.kill` of the sandbox cgroup, catches processes that left the group
    kill_file: Option<PathBuf>,
}

impl ProcessGroup {
    pub fn new(pgid: u32) -> Self {
        Self {
            pgid: Pid::from_raw(pgid as i32),
            kill_file: None,
        }
    }

    pub fn with_kill_file(mut self, path: PathBuf) -> Self {
        self.kill_file = Some(path);
        self
    }

    pub fn pgid(&self) -> i32 {
        self.pgid.as_raw()
    }

    /// Signal every member; false once the group is gone
    pub fn signal(&self, signal: Signal) -> bool {
        match killpg(self.pgid, signal) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            Err(e) => {
                warn!("Failed to send {} to process group {}: {}", signal, self.pgid, e);
                false
            }
        }
    }

    /// SIGKILL the group and the cgroup
    pub fn kill(&self) {
        self.signal(Signal::SIGKILL);
        if let Some(path) = &self.kill_file {
            if let Err(e) = std::fs::write(path, "1") {
                debug!("cgroup kill via {:?} failed: {}", path, e);
            }
        }
    }
}

/// How long to let a process run and how hard to stop it
#[derive(Debug, Clone, Copy)]
pub struct Supervision {
    pub wall_clock: Duration,
    pub grace: Duration,
    pub output_cap: usize,
}

/// What the supervisor observed
#[derive(Debug)]
pub struct SupervisedRun {
    pub status: ExitStatus,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
    pub stdout: CappedBuffer,
    pub stderr: CappedBuffer,
}

enum Stop {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Feed stdin, drain stdout/stderr and wait for `child` under the wall-clock
/// timer and `cancel`.
///
/// On expiry or cancellation the group gets SIGTERM, then SIGKILL after the
/// grace window. Once the leader is gone the group is always SIGKILLed so
/// background processes cannot hold the pipes open; the drains then get one
/// more grace window.
pub async fn supervise(
    mut child: Child,
    group: &ProcessGroup,
    stdin: &[u8],
    supervision: Supervision,
    cancel: &CancellationToken,
) -> Result<SupervisedRun> {
    let start = Instant::now();
    let mut stdout_buf = CappedBuffer::new(supervision.output_cap);
    let mut stderr_buf = CappedBuffer::new(supervision.output_cap);

    let stdin_pipe = child.stdin.take();
    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    let (status, timed_out, cancelled) = {
        let feed = async {
            if let Some(mut pipe) = stdin_pipe {
                match pipe.write_all(stdin).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => {
                        debug!("stdin write failed: {}", e);
                    }
                    _ => {}
                }
            }
        };
        let out = async {
            if let Some(pipe) = stdout_pipe {
                if let Err(e) = drain(pipe, &mut stdout_buf).await {
                    debug!("stdout drain failed: {}", e);
                }
            }
        };
        let err = async {
            if let Some(pipe) = stderr_pipe {
                if let Err(e) = drain(pipe, &mut stderr_buf).await {
                    debug!("stderr drain failed: {}", e);
                }
            }
        };
        let io = async {
            tokio::join!(feed, out, err);
        };
        tokio::pin!(io);

        let wait = async {
            let stop = tokio::select! {
                status = child.wait() => Stop::Exited(status),
                _ = tokio::time::sleep(supervision.wall_clock) => Stop::TimedOut,
                _ = cancel.cancelled() => Stop::Cancelled,
            };

            let (timed_out, cancelled) = match stop {
                Stop::Exited(status) => return (status, false, false),
                Stop::TimedOut => (true, false),
                Stop::Cancelled => (false, true),
            };

            debug!(
                "Terminating process group {} (timed_out: {}, cancelled: {})",
                group.pgid(),
                timed_out,
                cancelled
            );
            group.signal(Signal::SIGTERM);
            let status = match tokio::time::timeout(supervision.grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    group.kill();
                    child.wait().await
                }
            };
            (status, timed_out, cancelled)
        };
        tokio::pin!(wait);

        let mut io_done = false;
        let result = loop {
            tokio::select! {
                result = &mut wait => break result,
                _ = &mut io, if !io_done => io_done = true,
            }
        };

        group.kill();
        if !io_done && tokio::time::timeout(supervision.grace, &mut io).await.is_err() {
            debug!("Output drains abandoned for process group {}", group.pgid());
        }
        result
    };

    let status = status.context("Failed to wait for sandboxed process")?;

    Ok(SupervisedRun {
        status,
        timed_out,
        cancelled,
        duration: start.elapsed(),
        stdout: stdout_buf,
        stderr: stderr_buf,
    })
}
