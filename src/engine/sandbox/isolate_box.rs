//! Isolate box backend
//!
//! Wraps the `isolate` sandbox. Each worker slot owns one box
//! (`box_id_base + slot`), so two executions never share a box. Programs
//! talk to us through isolate's inherited stdio; limits and the final
//! status come from isolate's flags and meta file.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::meta::parse_meta;
use super::{CommandSpec, Isolation, RunOutcome, SandboxContext, SandboxEnv};
use crate::core::{ResourceLimits, SandboxConfig};
use crate::engine::collector::CapturedOutput;
use crate::engine::limiter::{
    exit_parts, reports_allocation_failure, supervise, ProcessGroup, Supervision, Termination,
};

const ISOLATE: &str = "isolate";
const SEARCH_PATH: [&str; 3] = ["/usr/local/bin", "/usr/bin", "/bin"];
/// Directories isolate mounts on its own
const DEFAULT_MOUNTS: [&str; 6] = ["/bin", "/dev", "/lib", "/lib64", "/usr", "/proc"];
/// Our own timer only backs up isolate's wall-time limit
const WALL_CLOCK_MARGIN: Duration = Duration::from_secs(1);

/// Check if isolate cgroups are available by initializing a throwaway box
pub async fn is_cgroups_available(box_id: u32) -> Result<bool> {
    let box_arg = format!("--box-id={}", box_id);

    let test_result = Command::new(ISOLATE)
        .args([box_arg.as_str(), "--cg", "--init"])
        .output()
        .await
        .context("Failed to run isolate; is it installed?")?;

    let _ = Command::new(ISOLATE)
        .args([box_arg.as_str(), "--cg", "--cleanup"])
        .output()
        .await;

    Ok(test_result.status.success())
}

/// Factory for isolate boxes
pub struct IsolateBackend {
    config: SandboxConfig,
    use_cgroups: bool,
}

impl IsolateBackend {
    pub async fn new(config: SandboxConfig) -> Result<Self> {
        let use_cgroups = is_cgroups_available(config.box_id_base).await?;
        if !use_cgroups {
            if config.strict {
                anyhow::bail!("Isolate cgroup support is required but not available. Install isolate with cgroup support and ensure cgroups are enabled.");
            }
            warn!("Isolate cgroups unavailable; memory is limited by address space only");
        }
        info!(
            "Isolate sandbox ready (cgroups: {}, boxes from {})",
            use_cgroups, config.box_id_base
        );
        Ok(Self::with_cgroups(config, use_cgroups))
    }

    pub fn with_cgroups(config: SandboxConfig, use_cgroups: bool) -> Self {
        Self {
            config,
            use_cgroups,
        }
    }
}

#[async_trait]
impl Isolation for IsolateBackend {
    fn name(&self) -> &'static str {
        "isolate"
    }

    async fn create(&self, ctx: &SandboxContext) -> Result<Box<dyn SandboxEnv>> {
        let box_id = self.config.box_id_base + ctx.slot as u32;
        let isolate_box = IsolateBox::new(box_id, self.use_cgroups).await?;
        Ok(Box::new(IsolateSandbox {
            isolate_box,
            config: self.config.clone(),
            runs: 0,
            active_group: None,
        }))
    }
}

/// Isolate box manager
#[derive(Debug)]
pub struct IsolateBox {
    box_id: u32,
    box_path: PathBuf,
    work_dir: PathBuf,
    use_cgroups: bool,
}

impl IsolateBox {
    /// Create and initialize a box, clearing whatever a crashed run left behind
    pub async fn new(box_id: u32, use_cgroups: bool) -> Result<Self> {
        let _ = Command::new(ISOLATE)
            .args(Self::base_args(box_id, use_cgroups))
            .arg("--cleanup")
            .output()
            .await;

        let output = Command::new(ISOLATE)
            .args(Self::base_args(box_id, use_cgroups))
            .arg("--init")
            .output()
            .await
            .context("Failed to run isolate --init")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!("Failed to initialize isolate box {}: {}", box_id, stderr.trim());
        }

        let box_path = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        let work_dir = box_path.join("box");
        info!(
            "Initialized isolate box {} at {:?} (cgroups: {})",
            box_id, box_path, use_cgroups
        );

        Ok(Self {
            box_id,
            box_path,
            work_dir,
            use_cgroups,
        })
    }

    fn base_args(box_id: u32, use_cgroups: bool) -> Vec<String> {
        let mut args = vec![format!("--box-id={}", box_id)];
        if use_cgroups {
            args.push("--cg".to_string());
        }
        args
    }

    pub fn box_id(&self) -> u32 {
        self.box_id
    }

    pub fn path(&self) -> &Path {
        &self.box_path
    }

    /// The box/box subdirectory, mounted as /box inside
    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    /// Blocking cleanup, safe to call from teardown
    pub fn cleanup(&self) {
        let result = std::process::Command::new(ISOLATE)
            .args(Self::base_args(self.box_id, self.use_cgroups))
            .arg("--cleanup")
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();

        match result {
            Ok(output) if output.status.success() => {
                info!("Cleaned up isolate box {}", self.box_id)
            }
            Ok(output) => warn!(
                "isolate --cleanup for box {} failed: {}",
                self.box_id,
                String::from_utf8_lossy(&output.stderr).trim()
            ),
            Err(e) => warn!("Failed to run isolate --cleanup for box {}: {}", self.box_id, e),
        }
    }
}

/// Arguments for `isolate --run`
pub fn run_args(
    box_id: u32,
    use_cgroups: bool,
    config: &SandboxConfig,
    limits: &ResourceLimits,
    command: &CommandSpec,
    meta_file: &Path,
) -> Vec<String> {
    let memory_kb = limits.memory_bytes / 1024;
    let wall_secs = limits.wall_clock_ms as f64 / 1000.0;

    let mut args = IsolateBox::base_args(box_id, use_cgroups);
    args.push("--silent".to_string());

    if use_cgroups {
        args.push(format!("--cg-mem={}", memory_kb));
    } else if command.limit_address_space {
        args.push(format!("--mem={}", memory_kb));
    }

    args.extend([
        format!("--time={}", limits.cpu_secs),
        format!("--wall-time={}", wall_secs),
        format!("--meta={}", meta_file.display()),
        format!("--processes={}", limits.max_processes),
        format!("--open-files={}", limits.max_open_files),
        format!("--fsize={}", limits.max_file_bytes.div_ceil(1024)),
    ]);

    for path in &config.readable_paths {
        let path = path.to_string_lossy();
        if DEFAULT_MOUNTS.contains(&path.as_ref()) {
            continue;
        }
        if path == "/etc" {
            args.push("--dir=/etc:noexec".to_string());
        } else {
            args.push(format!("--dir={}", path));
        }
    }

    if !config.isolate_network {
        args.push("--share-net".to_string());
    }

    args.extend([
        "--env=PATH=/usr/local/bin:/usr/bin:/bin".to_string(),
        "--env=HOME=/box".to_string(),
        "--env=TMPDIR=/box".to_string(),
        "--env=LANG=C.UTF-8".to_string(),
    ]);

    args.push("--run".to_string());
    args.push("--".to_string());
    args.push(resolve_program(&command.program));
    args.extend(command.args.iter().cloned());
    args
}

/// isolate execs the program directly, so bare names are looked up here
fn resolve_program(program: &str) -> String {
    if program.contains('/') {
        return program.to_string();
    }
    SEARCH_PATH
        .iter()
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| candidate.is_file())
        .map(|found| found.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("/usr/bin/{}", program))
}

/// One isolate box for the lifetime of an execution
pub struct IsolateSandbox {
    isolate_box: IsolateBox,
    config: SandboxConfig,
    runs: u32,
    active_group: Option<ProcessGroup>,
}

#[async_trait]
impl SandboxEnv for IsolateSandbox {
    fn work_dir(&self) -> &Path {
        self.isolate_box.work_dir()
    }

    async fn run_isolated(
        &mut self,
        spec: &CommandSpec,
        limits: &ResourceLimits,
        stdin: &[u8],
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        self.runs += 1;
        let box_id = self.isolate_box.box_id();
        let meta_file = self
            .config
            .scratch_root
            .join(format!("isolate-meta-{}-{}.txt", box_id, self.runs));

        let args = run_args(
            box_id,
            self.isolate_box.use_cgroups,
            &self.config,
            limits,
            spec,
            &meta_file,
        );
        debug!("Running isolate with args: {:?}", args);

        let child = Command::new(ISOLATE)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .context("Failed to run isolate")?;

        let pid = child.id().context("isolate has no pid")?;
        let group = ProcessGroup::new(pid);
        self.active_group = Some(group.clone());

        let supervision = Supervision {
            wall_clock: Duration::from_millis(limits.wall_clock_ms) + WALL_CLOCK_MARGIN,
            grace: Duration::from_millis(self.config.kill_grace_ms),
            output_cap: limits.max_output_bytes,
        };
        let supervised = supervise(child, &group, stdin, supervision, cancel).await?;
        self.active_group = None;

        let meta_content = tokio::fs::read_to_string(&meta_file)
            .await
            .unwrap_or_default();
        let _ = tokio::fs::remove_file(&meta_file).await;
        let meta = parse_meta(&meta_content);

        let output = CapturedOutput::from_buffers(&supervised.stdout, &supervised.stderr);

        let (mut evidence, exit_code, signal) = if supervised.timed_out || supervised.cancelled {
            let (code, sig) = exit_parts(&supervised.status);
            (Default::default(), code, sig)
        } else {
            // isolate exits with 2 on its own failures
            let evidence = match meta.evidence() {
                Some(evidence) if supervised.status.code() != Some(2) => evidence,
                _ => anyhow::bail!(
                    "isolate failed for box {}: {}",
                    box_id,
                    if meta.message.is_empty() {
                        output.stderr.trim()
                    } else {
                        meta.message.as_str()
                    }
                ),
            };
            let (code, sig) = (evidence.exit_code, evidence.signal);
            (evidence, code, sig)
        };

        evidence.timed_out |= supervised.timed_out;
        evidence.cancelled = supervised.cancelled;
        evidence.exit_code = exit_code;
        evidence.signal = signal;
        evidence.allocation_failure_reported =
            !self.isolate_box.use_cgroups && reports_allocation_failure(&output.stderr);

        let termination = Termination::decide(&evidence);
        let duration = if meta.wall_time_ms > 0 {
            Duration::from_millis(meta.wall_time_ms)
        } else {
            supervised.duration
        };

        Ok(RunOutcome {
            termination,
            exit_code,
            signal,
            duration,
            output,
            memory_peak_bytes: meta.memory_bytes(),
        })
    }

    fn teardown(self: Box<Self>) {
        if let Some(group) = &self.active_group {
            group.kill();
        }
        self.isolate_box.cleanup();
    }
}
