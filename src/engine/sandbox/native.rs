//! Native isolation backend
//!
//! Each sandbox is a unique scratch directory. Every process is started in
//! its own session with a cleared environment and, as far as the host
//! allows, inside a per-run cgroup, a fresh user + network namespace and a
//! landlock domain that only grants write access to the scratch directory.
//!
//! Child setup order (between fork and exec): setsid, cgroup join, user/net
//! namespaces, reaper fork, rlimits, landlock. Everything before the reaper
//! fork is shared by the reaper and the program; rlimits and landlock only
//! bind the program, so RLIMIT_NPROC cannot stop the reaper fork.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use landlock::{
    Access, AccessFs, PathBeneath, PathFd, Ruleset, RulesetAttr, RulesetCreated,
    RulesetCreatedAttr, RulesetStatus, ABI,
};
use nix::errno::Errno;
use nix::sched::{unshare, CloneFlags};
use nix::unistd::{getgid, getuid, setsid};
use tempfile::TempDir;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::cgroup::{Cgroup, CgroupTree};
use super::reaper::spawn_reaper;
use super::{CommandSpec, Isolation, RunOutcome, SandboxContext, SandboxEnv};
use crate::core::{ResourceLimits, SandboxConfig};
use crate::engine::collector::CapturedOutput;
use crate::engine::limiter::{
    exit_parts, reports_allocation_failure, supervise, Evidence, ProcessGroup, RlimitPlan,
    Supervision, Termination,
};

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";
const LANDLOCK_ABI: ABI = ABI::V1;

/// Isolation features the host supports, checked once at start-up
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostCapabilities {
    pub cgroup: bool,
    pub user_namespaces: bool,
    pub network_namespace: bool,
    pub landlock: bool,
}

impl HostCapabilities {
    /// Check the host by starting `true` with each feature enabled
    pub async fn detect(config: &SandboxConfig) -> Self {
        let cgroup = match try_cgroup(&config.cgroup_root).await {
            Ok(()) => true,
            Err(e) => {
                debug!("cgroup check failed: {:#}", e);
                false
            }
        };

        let user_namespaces = spawns_with(|| {
            let maps = UserMaps::current();
            move || maps.enter()
        })
        .await;

        let network_namespace = spawns_with(move || {
            let maps = user_namespaces.then(UserMaps::current);
            move || {
                if let Some(maps) = &maps {
                    maps.enter()?;
                }
                unshare(CloneFlags::CLONE_NEWNET)?;
                Ok(())
            }
        })
        .await;

        let landlock = spawns_with(|| {
            let mut ruleset = LandlockRules::new(&config.readable_paths, &config.scratch_root)
                .build()
                .ok();
            move || restrict(&mut ruleset)
        })
        .await;

        Self {
            cgroup,
            user_namespaces,
            network_namespace,
            landlock,
        }
    }

    /// Features required by `config` that the host lacks
    pub fn missing(&self, config: &SandboxConfig) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if !self.cgroup {
            missing.push("cgroup v2");
        }
        if !self.landlock {
            missing.push("landlock");
        }
        if config.isolate_network && !self.network_namespace {
            missing.push("network namespace");
        }
        missing
    }
}

async fn try_cgroup(root: &Path) -> Result<()> {
    let tree = CgroupTree::new(root);
    tree.prepare()?;
    let cgroup = tree.create(&format!("selftest-{}", std::process::id()), &ResourceLimits::default())?;

    let procs = cgroup.open_procs()?;
    let joined = spawns_with(move || {
        let procs = procs;
        move || (&procs).write_all(b"0")
    })
    .await;
    cgroup.remove();

    if !joined {
        anyhow::bail!("cannot move processes into {:?}", root);
    }
    Ok(())
}

/// Whether `true` starts with the given pre-exec hook
async fn spawns_with<S, F>(setup: S) -> bool
where
    S: FnOnce() -> F,
    F: FnMut() -> std::io::Result<()> + Send + Sync + 'static,
{
    let mut hook = setup();
    let mut command = Command::new("true");
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    // SAFETY: the hook only performs syscalls on memory prepared before fork.
    unsafe {
        command.pre_exec(move || hook());
    }

    match command.status().await {
        Ok(status) => status.success(),
        Err(_) => false,
    }
}

/// uid/gid maps for a single-id user namespace, formatted before fork
#[derive(Debug, Clone)]
struct UserMaps {
    uid_map: String,
    gid_map: String,
}

impl UserMaps {
    fn current() -> Self {
        let uid = getuid();
        let gid = getgid();
        Self {
            uid_map: format!("{} {} 1\n", uid, uid),
            gid_map: format!("{} {} 1\n", gid, gid),
        }
    }

    /// Enter a new user namespace keeping the same ids
    fn enter(&self) -> std::io::Result<()> {
        unshare(CloneFlags::CLONE_NEWUSER)?;
        write_proc("/proc/self/setgroups", b"deny")?;
        write_proc("/proc/self/uid_map", self.uid_map.as_bytes())?;
        write_proc("/proc/self/gid_map", self.gid_map.as_bytes())?;
        Ok(())
    }
}

fn write_proc(path: &str, data: &[u8]) -> std::io::Result<()> {
    std::fs::OpenOptions::new()
        .write(true)
        .open(path)?
        .write_all(data)
}

/// Filesystem rules for one run
struct LandlockRules<'a> {
    readable: &'a [PathBuf],
    scratch: &'a Path,
}

impl<'a> LandlockRules<'a> {
    fn new(readable: &'a [PathBuf], scratch: &'a Path) -> Self {
        Self { readable, scratch }
    }

    /// Read/execute on system paths, everything inside the scratch directory
    fn build(&self) -> Result<RulesetCreated> {
        let mut ruleset = Ruleset::default()
            .handle_access(AccessFs::from_all(LANDLOCK_ABI))?
            .create()?;

        for path in self.readable {
            match PathFd::new(path) {
                Ok(fd) => {
                    ruleset =
                        ruleset.add_rule(PathBeneath::new(fd, AccessFs::from_read(LANDLOCK_ABI)))?;
                }
                Err(e) => debug!("Skipping landlock rule for {:?}: {}", path, e),
            }
        }

        if let Ok(fd) = PathFd::new("/dev/null") {
            ruleset = ruleset.add_rule(PathBeneath::new(fd, AccessFs::from_file(LANDLOCK_ABI)))?;
        }
        if let Ok(fd) = PathFd::new(self.scratch) {
            ruleset = ruleset.add_rule(PathBeneath::new(fd, AccessFs::from_all(LANDLOCK_ABI)))?;
        }

        Ok(ruleset)
    }
}

/// Apply a prepared ruleset in the child; not enforced counts as failure
fn restrict(ruleset: &mut Option<RulesetCreated>) -> std::io::Result<()> {
    let Some(ruleset) = ruleset.take() else {
        return Err(Errno::ENOSYS.into());
    };
    let status = ruleset
        .restrict_self()
        .map_err(|_| std::io::Error::from(Errno::EPERM))?;
    if status.ruleset == RulesetStatus::NotEnforced {
        return Err(Errno::ENOSYS.into());
    }
    Ok(())
}

/// Factory for native sandboxes
pub struct NativeBackend {
    config: SandboxConfig,
    caps: HostCapabilities,
    cgroups: CgroupTree,
}

impl NativeBackend {
    /// Check the host; with `strict` a missing capability is an error
    pub async fn new(config: SandboxConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.scratch_root)
            .with_context(|| format!("Failed to create scratch root {:?}", config.scratch_root))?;

        let caps = HostCapabilities::detect(&config).await;
        let missing = caps.missing(&config);
        if !missing.is_empty() {
            if config.strict {
                anyhow::bail!("Required isolation unavailable: {}", missing.join(", "));
            }
            warn!(
                "Isolation degraded, unavailable on this host: {} (rlimits and the per-run reaper still apply)",
                missing.join(", ")
            );
        }

        info!(
            "Native sandbox ready (cgroup: {}, userns: {}, netns: {}, landlock: {})",
            caps.cgroup, caps.user_namespaces, caps.network_namespace, caps.landlock
        );

        Ok(Self::with_capabilities(config, caps))
    }

    /// Skip probing; used when capabilities are already known
    pub fn with_capabilities(config: SandboxConfig, caps: HostCapabilities) -> Self {
        let cgroups = CgroupTree::new(&config.cgroup_root);
        Self {
            config,
            caps,
            cgroups,
        }
    }

    pub fn capabilities(&self) -> HostCapabilities {
        self.caps
    }
}

#[async_trait]
impl Isolation for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    async fn create(&self, ctx: &SandboxContext) -> Result<Box<dyn SandboxEnv>> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("exec-{}-", ctx.id))
            .tempdir_in(&self.config.scratch_root)
            .with_context(|| format!("Failed to create scratch dir in {:?}", self.config.scratch_root))?;

        info!("Created sandbox {} at {:?}", ctx.id, dir.path());

        Ok(Box::new(NativeSandbox {
            id: ctx.id.to_string(),
            dir,
            config: self.config.clone(),
            caps: self.caps,
            cgroups: self.cgroups.clone(),
            runs: AtomicU64::new(0),
            active_group: None,
            active_cgroup: None,
        }))
    }
}

/// One native sandbox: scratch directory plus whatever is still running
pub struct NativeSandbox {
    id: String,
    dir: TempDir,
    config: SandboxConfig,
    caps: HostCapabilities,
    cgroups: CgroupTree,
    runs: AtomicU64,
    active_group: Option<ProcessGroup>,
    active_cgroup: Option<Cgroup>,
}

impl NativeSandbox {
    fn build_command(
        &self,
        spec: &CommandSpec,
        limits: &ResourceLimits,
        cgroup: Option<&Cgroup>,
    ) -> Result<Command> {
        let work_dir = self.dir.path();

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(work_dir)
            .env_clear()
            .env("PATH", SANDBOX_PATH)
            .env("HOME", work_dir)
            .env("TMPDIR", work_dir)
            .env("LANG", "C.UTF-8")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let plan = RlimitPlan::new(limits, cgroup.is_some(), spec.limit_address_space);
        let procs: Option<File> = cgroup.map(|c| c.open_procs()).transpose()?;
        let user_maps = self.caps.user_namespaces.then(UserMaps::current);
        let isolate_network = self.config.isolate_network && self.caps.network_namespace;
        let cpu_secs = limits.cpu_secs;
        let mut ruleset = if self.caps.landlock {
            Some(LandlockRules::new(&self.config.readable_paths, work_dir).build()?)
        } else {
            None
        };

        // SAFETY: everything the hook touches is prepared above; in the child
        // it only performs syscalls and writes to pre-opened files.
        unsafe {
            command.pre_exec(move || {
                setsid()?;
                if let Some(procs) = &procs {
                    (&*procs).write_all(b"0")?;
                }
                if let Some(maps) = &user_maps {
                    maps.enter()?;
                }
                if isolate_network {
                    unshare(CloneFlags::CLONE_NEWNET)?;
                }
                spawn_reaper(cpu_secs)?;
                plan.apply()?;
                if ruleset.is_some() {
                    restrict(&mut ruleset)?;
                }
                Ok(())
            });
        }

        Ok(command)
    }
}

#[async_trait]
impl SandboxEnv for NativeSandbox {
    fn work_dir(&self) -> &Path {
        self.dir.path()
    }

    async fn run_isolated(
        &mut self,
        spec: &CommandSpec,
        limits: &ResourceLimits,
        stdin: &[u8],
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        let run = self.runs.fetch_add(1, Ordering::Relaxed);

        if self.caps.cgroup {
            let name = format!("exec-{}-{}", self.id, run);
            self.active_cgroup = Some(self.cgroups.create(&name, limits)?);
        }

        debug!("Running {:?} with limits {:?}", spec.to_vec(), limits);
        let mut command = self.build_command(spec, limits, self.active_cgroup.as_ref())?;
        let child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                if let Some(cgroup) = self.active_cgroup.take() {
                    tokio::task::spawn_blocking(move || cgroup.remove()).await?;
                }
                return Err(anyhow::Error::new(e).context(format!("Failed to spawn {}", spec.program)));
            }
        };
        drop(command);

        let pid = child.id().context("Spawned process has no pid")?;
        let mut group = ProcessGroup::new(pid);
        if let Some(cgroup) = &self.active_cgroup {
            group = group.with_kill_file(cgroup.kill_file());
        }
        self.active_group = Some(group.clone());

        let supervision = Supervision {
            wall_clock: std::time::Duration::from_millis(limits.wall_clock_ms),
            grace: std::time::Duration::from_millis(self.config.kill_grace_ms),
            output_cap: limits.max_output_bytes,
        };
        let supervised = supervise(child, &group, stdin, supervision, cancel).await?;
        self.active_group = None;

        let (events, memory_peak_bytes) = match self.active_cgroup.take() {
            Some(cgroup) => {
                let events = cgroup.events();
                let peak = cgroup.memory_peak();
                tokio::task::spawn_blocking(move || cgroup.remove()).await?;
                (events, peak)
            }
            None => Default::default(),
        };

        let output = CapturedOutput::from_buffers(&supervised.stdout, &supervised.stderr);
        let (exit_code, signal) = exit_parts(&supervised.status);

        let evidence = Evidence {
            cancelled: supervised.cancelled,
            timed_out: supervised.timed_out,
            oom_killed: events.oom_kill > 0,
            pids_exhausted: events.pids_max > 0,
            allocation_failure_reported: !self.caps.cgroup
                && reports_allocation_failure(&output.stderr),
            exit_code,
            signal,
            ..Default::default()
        };
        let termination = Termination::decide(&evidence);
        debug!(
            "Sandbox {} run {} finished: {:?} in {:?}",
            self.id, run, termination, supervised.duration
        );

        Ok(RunOutcome {
            termination,
            exit_code,
            signal,
            duration: supervised.duration,
            output,
            memory_peak_bytes,
        })
    }

    fn teardown(self: Box<Self>) {
        let this = *self;

        if let Some(group) = &this.active_group {
            group.kill();
        }
        if let Some(cgroup) = this.active_cgroup {
            cgroup.remove();
        }

        let path = this.dir.path().to_path_buf();
        match this.dir.close() {
            Ok(()) => info!("Cleaned up sandbox {} ({:?})", this.id, path),
            Err(e) => warn!("Failed to remove scratch dir {:?}: {}", path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn bare_backend(scratch: &Path) -> NativeBackend {
        let config = SandboxConfig {
            scratch_root: scratch.to_path_buf(),
            kill_grace_ms: 100,
            ..Default::default()
        };
        NativeBackend::with_capabilities(config, HostCapabilities::default())
    }

    fn ctx() -> SandboxContext {
        SandboxContext {
            id: Uuid::new_v4(),
            slot: 0,
        }
    }

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").with_args(["-c", script])
    }

    #[test]
    fn test_missing_capabilities() {
        let config = SandboxConfig::default();
        let none = HostCapabilities::default();
        assert_eq!(
            none.missing(&config),
            vec!["cgroup v2", "landlock", "network namespace"]
        );

        let offline = SandboxConfig {
            isolate_network: false,
            ..Default::default()
        };
        assert!(!none.missing(&offline).contains(&"network namespace"));
    }

    #[tokio::test]
    async fn test_run_in_scratch_dir_with_clean_env() {
        let root = TempDir::new().unwrap();
        let backend = bare_backend(root.path());
        let mut env = backend.create(&ctx()).await.unwrap();
        let cancel = CancellationToken::new();

        std::env::set_var("EXEC_SANDBOX_LEAK_CHECK", "1");
        let outcome = env
            .run_isolated(
                &sh("pwd; echo ${EXEC_SANDBOX_LEAK_CHECK:-clean}; echo \"$HOME\""),
                &ResourceLimits::default(),
                b"",
                &cancel,
            )
            .await
            .unwrap();

        let work_dir = env.work_dir().to_string_lossy().to_string();
        let lines: Vec<&str> = outcome.output.stdout.lines().collect();
        assert_eq!(lines, vec![work_dir.as_str(), "clean", work_dir.as_str()]);
        assert!(outcome.is_success());
        env.teardown();
    }

    #[tokio::test]
    async fn test_runs_in_own_session() {
        let root = TempDir::new().unwrap();
        let backend = bare_backend(root.path());
        let mut env = backend.create(&ctx()).await.unwrap();
        let cancel = CancellationToken::new();

        let outcome = env
            .run_isolated(
                &sh("ps -o sid= -p $$ | tr -d ' '; echo $PPID"),
                &ResourceLimits::default(),
                b"",
                &cancel,
            )
            .await
            .unwrap();

        let lines: Vec<&str> = outcome.output.stdout.lines().collect();
        if lines.len() == 2 {
            assert_eq!(lines[0], lines[1], "reaper should lead the program's session");
        }
        env.teardown();
    }

    #[tokio::test]
    async fn test_file_size_limit() {
        let root = TempDir::new().unwrap();
        let backend = bare_backend(root.path());
        let mut env = backend.create(&ctx()).await.unwrap();
        let cancel = CancellationToken::new();
        let limits = ResourceLimits {
            max_file_bytes: 4096,
            ..Default::default()
        };

        let outcome = env
            .run_isolated(
                &CommandSpec::new("dd").with_args(["if=/dev/zero", "of=big", "bs=1024", "count=64"]),
                &limits,
                b"",
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome.termination, Termination::FileSizeExceeded);
        env.teardown();
    }

    async fn run_sh(script: &str, limits: &ResourceLimits) -> RunOutcome {
        let root = TempDir::new().unwrap();
        let backend = bare_backend(root.path());
        let mut env = backend.create(&ctx()).await.unwrap();
        let cancel = CancellationToken::new();
        let outcome = env.run_isolated(&sh(script), limits, b"", &cancel).await.unwrap();
        env.teardown();
        outcome
    }

    #[tokio::test]
    async fn test_printed_allocation_failure_is_not_memory_exceeded() {
        let outcome = run_sh("echo 'out of memory' >&2; exit 1", &ResourceLimits::default()).await;
        assert_eq!(outcome.termination, Termination::Exited(1));
    }

    #[tokio::test]
    async fn test_abort_after_allocation_failure_without_cgroup() {
        let outcome = run_sh(
            "echo \"terminate called after throwing an instance of 'std::bad_alloc'\" >&2; kill -ABRT $$",
            &ResourceLimits::default(),
        )
        .await;
        assert_eq!(outcome.termination, Termination::MemoryExceeded);
        assert_eq!(outcome.signal, Some(6));
    }

    #[tokio::test]
    async fn test_ignored_sigxcpu_still_cpu_exceeded() {
        let limits = ResourceLimits {
            cpu_secs: 1,
            wall_clock_ms: 10_000,
            ..Default::default()
        };
        let outcome = run_sh("trap '' XCPU; while :; do :; done", &limits).await;
        assert_eq!(outcome.termination, Termination::CpuTimeExceeded);
    }

    #[tokio::test]
    async fn test_session_escapee_killed_with_run() {
        let has_setsid = std::process::Command::new("sh")
            .args(["-c", "command -v setsid"])
            .stdout(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false);
        if !has_setsid {
            eprintln!("skipping: setsid(1) not installed");
            return;
        }

        let token = format!("escapee-{}", Uuid::new_v4());
        let outcome = run_sh(
            &format!("setsid sh -c 'sleep 60; :' {} & sleep 0.2; echo started", token),
            &ResourceLimits::default(),
        )
        .await;
        assert!(outcome.is_success());

        let survivors = std::fs::read_dir("/proc")
            .unwrap()
            .filter_map(|e| e.ok()?.file_name().to_str()?.parse::<i32>().ok())
            .filter(|pid| {
                let cmdline = std::fs::read(format!("/proc/{}/cmdline", pid)).unwrap_or_default();
                String::from_utf8_lossy(&cmdline).contains(&token)
            })
            .count();
        assert_eq!(survivors, 0);
    }

    #[tokio::test]
    async fn test_teardown_removes_scratch_dir() {
        let root = TempDir::new().unwrap();
        let backend = bare_backend(root.path());
        let env = backend.create(&ctx()).await.unwrap();
        let path = env.work_dir().to_path_buf();
        std::fs::write(path.join("main.c"), "int main(){}").unwrap();
        assert!(path.exists());

        env.teardown();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_unique_scratch_dirs() {
        let root = TempDir::new().unwrap();
        let backend = bare_backend(root.path());
        let a = backend.create(&ctx()).await.unwrap();
        let b = backend.create(&ctx()).await.unwrap();
        assert_ne!(a.work_dir(), b.work_dir());
        a.teardown();
        b.teardown();
    }

    #[tokio::test]
    async fn test_missing_program_is_an_error() {
        let root = TempDir::new().unwrap();
        let backend = bare_backend(root.path());
        let mut env = backend.create(&ctx()).await.unwrap();
        let cancel = CancellationToken::new();

        let result = env
            .run_isolated(
                &CommandSpec::new("definitely-not-a-compiler"),
                &ResourceLimits::default(),
                b"",
                &cancel,
            )
            .await;
        assert!(result.is_err());
        env.teardown();
    }
}
