//! Isolate meta file parser
//!
//! Parses the meta file written by `isolate --meta` into the evidence the
//! limiter uses to decide a termination.

use crate::engine::limiter::Evidence;

/// Raw execution status from isolate
#[derive(Debug, Clone, PartialEq)]
pub enum IsolateStatus {
    /// Program exited normally
    Ok,
    /// Time limit exceeded; `wall` distinguishes the wall clock from CPU time
    TimeOut { wall: bool },
    /// Killed by signal
    Signal(i32),
    /// Non-zero exit
    RuntimeError,
    /// Internal error in isolate
    InternalError,
}

/// Parsed isolate meta file contents
#[derive(Debug, Clone)]
pub struct IsolateMeta {
    /// CPU time used in milliseconds
    pub time_ms: u64,
    /// Wall clock time in milliseconds
    pub wall_time_ms: u64,
    /// Memory used in KB (from cg-mem or max-rss)
    pub memory_kb: u64,
    pub exit_code: Option<i32>,
    pub exit_signal: Option<i32>,
    /// Killed by the cgroup OOM killer
    pub oom_killed: bool,
    pub status: IsolateStatus,
    /// Human-readable status message from isolate
    pub message: String,
}

impl Default for IsolateMeta {
    fn default() -> Self {
        Self {
            time_ms: 0,
            wall_time_ms: 0,
            memory_kb: 0,
            exit_code: None,
            exit_signal: None,
            oom_killed: false,
            status: IsolateStatus::Ok,
            message: String::new(),
        }
    }
}

impl IsolateMeta {
    /// Evidence for the limiter; `None` if isolate itself failed
    pub fn evidence(&self) -> Option<Evidence> {
        if self.status == IsolateStatus::InternalError {
            return None;
        }
        Some(Evidence {
            timed_out: matches!(self.status, IsolateStatus::TimeOut { wall: true }),
            cpu_exceeded: matches!(self.status, IsolateStatus::TimeOut { wall: false }),
            oom_killed: self.oom_killed,
            exit_code: self.exit_code,
            signal: self.exit_signal,
            ..Default::default()
        })
    }

    pub fn memory_bytes(&self) -> Option<u64> {
        (self.memory_kb > 0).then(|| self.memory_kb * 1024)
    }
}

fn seconds_to_ms(value: &str) -> Option<u64> {
    value.parse::<f64>().ok().map(|t| (t * 1000.0) as u64)
}

/// Parse isolate meta file content
pub fn parse_meta(content: &str) -> IsolateMeta {
    let mut meta = IsolateMeta::default();
    let mut status_str = String::new();

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();

        match key.trim() {
            "time" => meta.time_ms = seconds_to_ms(value).unwrap_or(0),
            "time-wall" => meta.wall_time_ms = seconds_to_ms(value).unwrap_or(0),
            "cg-mem" | "max-rss" => {
                // cg-mem for cgroups, max-rss for non-cgroups (both in KB)
                if let Ok(m) = value.parse::<u64>() {
                    meta.memory_kb = meta.memory_kb.max(m);
                }
            }
            "cg-oom-killed" => meta.oom_killed = value == "1",
            "status" => status_str = value.to_string(),
            "message" => meta.message = value.to_string(),
            "exitcode" => meta.exit_code = value.parse().ok(),
            "exitsig" => meta.exit_signal = value.parse().ok(),
            _ => {}
        }
    }

    meta.status = match status_str.as_str() {
        "TO" => IsolateStatus::TimeOut {
            wall: meta.message.contains("wall clock"),
        },
        "SG" => IsolateStatus::Signal(meta.exit_signal.unwrap_or(0)),
        "RE" => IsolateStatus::RuntimeError,
        "XX" => IsolateStatus::InternalError,
        "" if meta.exit_code.unwrap_or(0) == 0 => IsolateStatus::Ok,
        _ => IsolateStatus::RuntimeError,
    };

    // A clean run without an explicit exit code still exited 0
    if meta.status == IsolateStatus::Ok && meta.exit_code.is_none() {
        meta.exit_code = Some(0);
    }

    meta
}
