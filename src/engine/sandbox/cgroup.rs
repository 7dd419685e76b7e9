//! Cgroup v2 accounting for the native backend
//!
//! The service owns one delegated directory (`cgroup_root`). Each run gets a
//! child cgroup with its own limits, so OOM/pids events and `memory.peak`
//! always describe exactly one process tree. The child joins its cgroup
//! itself before `exec`, so nothing it starts escapes accounting.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::core::ResourceLimits;

const REMOVE_ATTEMPTS: u32 = 20;
const REMOVE_BACKOFF: Duration = Duration::from_millis(10);

/// The delegated parent directory
#[derive(Debug, Clone)]
pub struct CgroupTree {
    root: PathBuf,
}

impl CgroupTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root and enable the memory and pids controllers for children
    pub fn prepare(&self) -> Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("Failed to create cgroup root {:?}", self.root))?;

        let controllers = fs::read_to_string(self.root.join("cgroup.controllers"))
            .with_context(|| format!("{:?} is not a cgroup v2 directory", self.root))?;
        for needed in ["memory", "pids"] {
            if !controllers.split_whitespace().any(|c| c == needed) {
                anyhow::bail!("cgroup controller {} not delegated to {:?}", needed, self.root);
            }
        }

        fs::write(self.root.join("cgroup.subtree_control"), "+memory +pids")
            .with_context(|| format!("Failed to enable controllers under {:?}", self.root))?;
        Ok(())
    }

    /// Create a child cgroup with `limits` applied
    pub fn create(&self, name: &str, limits: &ResourceLimits) -> Result<Cgroup> {
        let path = self.root.join(name);
        fs::create_dir(&path).with_context(|| format!("Failed to create cgroup {:?}", path))?;

        let cgroup = Cgroup { path };
        if let Err(e) = cgroup.apply_limits(limits) {
            cgroup.remove();
            return Err(e);
        }
        debug!("Created cgroup {:?}", cgroup.path);
        Ok(cgroup)
    }
}

/// Counters read from `memory.events` and `pids.events`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CgroupEvents {
    pub oom_kill: u64,
    pub pids_max: u64,
}

/// One per-run cgroup
#[derive(Debug)]
pub struct Cgroup {
    path: PathBuf,
}

impl Cgroup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `cgroup.kill` (kernel 5.14+)
    pub fn kill_file(&self) -> PathBuf {
        self.path.join("cgroup.kill")
    }

    /// Opened in the parent; the child writes "0" to it to join
    pub fn open_procs(&self) -> Result<File> {
        let path = self.path.join("cgroup.procs");
        OpenOptions::new()
            .write(true)
            .open(&path)
            .with_context(|| format!("Failed to open {:?}", path))
    }

    fn apply_limits(&self, limits: &ResourceLimits) -> Result<()> {
        self.write("memory.max", &limits.memory_bytes.to_string())?;
        self.write("pids.max", &limits.max_processes.to_string())?;

        // Absent when swap accounting or oom.group is not supported
        for (file, value) in [("memory.swap.max", "0"), ("memory.oom.group", "1")] {
            if self.path.join(file).exists() {
                self.write(file, value)?;
            }
        }
        Ok(())
    }

    fn write(&self, file: &str, value: &str) -> Result<()> {
        let path = self.path.join(file);
        fs::write(&path, value).with_context(|| format!("Failed to write {} to {:?}", value, path))
    }

    pub fn events(&self) -> CgroupEvents {
        CgroupEvents {
            oom_kill: read_keyed(&self.path.join("memory.events"), "oom_kill"),
            pids_max: read_keyed(&self.path.join("pids.events"), "max"),
        }
    }

    /// `memory.peak` (kernel 5.19+)
    pub fn memory_peak(&self) -> Option<u64> {
        fs::read_to_string(self.path.join("memory.peak"))
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// Kill every process in the cgroup
    pub fn kill_all(&self) {
        if fs::write(self.kill_file(), "1").is_ok() {
            return;
        }

        // Older kernels: signal each member
        let Ok(procs) = fs::read_to_string(self.path.join("cgroup.procs")) else {
            return;
        };
        for pid in procs.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
        }
    }

    /// Kill members and remove the directory. Blocking; retries while the
    /// kernel finishes reaping.
    pub fn remove(self) {
        self.kill_all();

        for attempt in 0..REMOVE_ATTEMPTS {
            match fs::remove_dir(&self.path) {
                Ok(()) => {
                    debug!("Removed cgroup {:?}", self.path);
                    return;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return,
                Err(e) => {
                    if attempt + 1 == REMOVE_ATTEMPTS {
                        warn!("Failed to remove cgroup {:?}: {}", self.path, e);
                        return;
                    }
                    self.kill_all();
                    std::thread::sleep(REMOVE_BACKOFF);
                }
            }
        }
    }
}

/// Value of `key` in a flat-keyed cgroup file, 0 when absent
fn read_keyed(path: &Path, key: &str) -> u64 {
    fs::read_to_string(path)
        .map(|content| parse_keyed(&content, key))
        .unwrap_or(0)
}

fn parse_keyed(content: &str, key: &str) -> u64 {
    content
        .lines()
        .filter_map(|line| line.split_once(' '))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| v.trim().parse().ok())
        .unwrap_or(0)
}
