//! Service configuration
//!
//! Read once at start-up (TOML file + environment overrides) and shared
//! read-only afterwards.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use super::request::ResourceLimits;

/// Which isolation backend runs the programs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// setsid + rlimits + cgroup v2 + namespaces + landlock, in-process
    #[default]
    Native,
    /// The external `isolate` sandbox
    Isolate,
}

impl std::str::FromStr for BackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "native" => Ok(BackendKind::Native),
            "isolate" => Ok(BackendKind::Isolate),
            other => anyhow::bail!("Unknown sandbox backend: {}", other),
        }
    }
}

/// Limits for the compile phase
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileConfig {
    /// Compile time limit in milliseconds (default: 30000ms = 30s)
    pub time_limit_ms: u64,
    /// Compile memory limit in MB (default: 2048MB)
    pub memory_limit_mb: u64,
    /// Compilers spawn helpers (cc1plus, as, ld)
    pub max_processes: u32,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            time_limit_ms: 30_000,
            memory_limit_mb: 2048,
            max_processes: 128,
        }
    }
}

impl CompileConfig {
    /// Limits applied to a compiler run, keeping the request's output and file caps
    pub fn limits(&self, request: &ResourceLimits) -> ResourceLimits {
        ResourceLimits {
            wall_clock_ms: self.time_limit_ms,
            cpu_secs: self.time_limit_ms.div_ceil(1000),
            memory_bytes: self.memory_limit_mb * 1024 * 1024,
            max_processes: self.max_processes,
            max_output_bytes: request.max_output_bytes,
            max_file_bytes: request.max_file_bytes.max(256 * 1024 * 1024),
            max_open_files: request.max_open_files,
        }
    }
}

/// Sandbox backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: BackendKind,
    /// Parent directory of per-execution scratch directories
    pub scratch_root: PathBuf,
    /// Delegated cgroup v2 directory owned by this service
    pub cgroup_root: PathBuf,
    /// Run programs in an empty network namespace
    pub isolate_network: bool,
    /// Fail start-up instead of degrading when a host capability is missing
    pub strict: bool,
    /// Host paths programs may read and execute from. `/proc` is left out
    /// by default; the host procfs would expose other runs' command lines.
    pub readable_paths: Vec<PathBuf>,
    /// Time between SIGTERM and SIGKILL when terminating a process group
    pub kill_grace_ms: u64,
    /// First isolate box id; worker slot N uses `box_id_base + N`
    pub box_id_base: u32,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Native,
            scratch_root: std::env::temp_dir(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup/exec-sandbox"),
            isolate_network: true,
            strict: false,
            readable_paths: ["/usr", "/lib", "/lib64", "/bin", "/etc", "/dev"]
                .iter()
                .map(PathBuf::from)
                .collect(),
            kill_grace_ms: 250,
            box_id_base: 0,
        }
    }
}

/// Top-level service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Concurrent executions
    pub workers: usize,
    /// Requests allowed to wait for a worker; 0 rejects everything beyond `workers`
    pub queue_depth: usize,
    /// Largest accepted source file in bytes
    pub max_source_bytes: usize,
    /// Limits used when neither the language nor the caller says otherwise
    pub default_limits: ResourceLimits,
    /// Server-enforced maximum for every limit
    pub ceiling_limits: ResourceLimits,
    pub compile: CompileConfig,
    pub sandbox: SandboxConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_depth: 16,
            max_source_bytes: 100 * 1024,
            default_limits: ResourceLimits::default(),
            ceiling_limits: ResourceLimits::default_ceiling(),
            compile: CompileConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Load configuration: `.env`, optional TOML file (`EXEC_CONFIG`), environment overrides
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match std::env::var("EXEC_CONFIG") {
            Ok(path) => {
                let config = Self::from_file(&path)?;
                info!("Loaded service configuration from {}", path);
                config
            }
            Err(_) => Self::default(),
        };

        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        Self::from_toml(&content).with_context(|| format!("Invalid config file {:?}", path))
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(value) = std::env::var("EXEC_WORKERS") {
            self.workers = value
                .parse()
                .with_context(|| format!("Invalid EXEC_WORKERS: {}", value))?;
        }
        if let Ok(value) = std::env::var("EXEC_QUEUE_DEPTH") {
            self.queue_depth = value
                .parse()
                .with_context(|| format!("Invalid EXEC_QUEUE_DEPTH: {}", value))?;
        }
        if let Ok(value) = std::env::var("EXEC_BACKEND") {
            self.sandbox.backend = value.parse()?;
        }
        if let Ok(value) = std::env::var("EXEC_SCRATCH_ROOT") {
            self.sandbox.scratch_root = PathBuf::from(value);
        }
        Ok(())
    }

    /// Reject configurations the scheduler or limiter cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            anyhow::bail!("workers must be at least 1");
        }
        if self.max_source_bytes == 0 {
            anyhow::bail!("max_source_bytes must be positive");
        }

        let d = &self.default_limits;
        let c = &self.ceiling_limits;
        if d.min(c) != *d {
            anyhow::bail!(
                "default_limits exceed ceiling_limits: default={:?} ceiling={:?}",
                d,
                c
            );
        }
        if d.wall_clock_ms == 0 || d.cpu_secs == 0 || d.memory_bytes == 0 || d.max_processes == 0 {
            anyhow::bail!("default_limits must be positive: {:?}", d);
        }
        if self.compile.time_limit_ms == 0 || self.compile.memory_limit_mb == 0 {
            anyhow::bail!("compile limits must be positive");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ServiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.sandbox.backend, BackendKind::Native);
        assert!(config.sandbox.isolate_network);
    }

    #[test]
    fn test_partial_toml() {
        let config = ServiceConfig::from_toml(
            r#"
workers = 2
queue_depth = 0

[default_limits]
wall_clock_ms = 2000

[sandbox]
backend = "isolate"
box_id_base = 100
"#,
        )
        .unwrap();

        assert_eq!(config.workers, 2);
        assert_eq!(config.queue_depth, 0);
        assert_eq!(config.default_limits.wall_clock_ms, 2000);
        assert_eq!(config.default_limits.cpu_secs, 5);
        assert_eq!(config.sandbox.backend, BackendKind::Isolate);
        assert_eq!(config.sandbox.box_id_base, 100);
        assert_eq!(config.compile.time_limit_ms, 30_000);
    }

    #[test]
    fn test_default_above_ceiling_rejected() {
        let mut config = ServiceConfig::default();
        config.default_limits.memory_bytes = config.ceiling_limits.memory_bytes + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_host_procfs_not_readable_by_default() {
        let sandbox = SandboxConfig::default();
        assert!(!sandbox.readable_paths.iter().any(|p| p.starts_with("/proc")));
        assert!(sandbox.readable_paths.contains(&PathBuf::from("/usr")));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = ServiceConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_backend_from_str() {
        assert_eq!("Isolate".parse::<BackendKind>().unwrap(), BackendKind::Isolate);
        assert!("docker".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_compile_limits_keep_output_cap() {
        let compile = CompileConfig::default();
        let request = ResourceLimits {
            max_output_bytes: 512,
            ..Default::default()
        };
        let limits = compile.limits(&request);
        assert_eq!(limits.wall_clock_ms, 30_000);
        assert_eq!(limits.cpu_secs, 30);
        assert_eq!(limits.memory_bytes, 2048 * 1024 * 1024);
        assert_eq!(limits.max_output_bytes, 512);
    }

    #[test]
    fn test_from_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "workers = 8\n[compile]\ntime_limit_ms = 5000").unwrap();

        let config = ServiceConfig::from_file(file.path()).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.compile.time_limit_ms, 5000);
    }
}
