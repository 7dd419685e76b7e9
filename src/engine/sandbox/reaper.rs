//! Per-run subreaper
//!
//! The pre-exec hook forks once more. The new child goes on to exec the
//! program; the original process stays behind as a child subreaper, so
//! every process the program leaves behind (double forks and `setsid`
//! escapes included) is reparented to it instead of to init. Once the
//! program exits, the reaper kills and reaps whatever is left and then
//! exits with the program's status.
//!
//! The reaper is what the supervisor sees as the process group leader.
//! SIGTERM makes it SIGKILL the program; a SIGKILL on the reaper takes the
//! program down through its parent-death signal.

use std::sync::atomic::{AtomicBool, Ordering};

use nix::errno::Errno;
use nix::libc;
use nix::sys::prctl;
use nix::sys::resource::{getrusage, setrlimit, Resource, UsageWho};
use nix::sys::signal::{kill, raise, sigaction, signal, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, fork, getpid, getppid, ForkResult, Pid};

/// Upper bound on descriptors closed when `/proc/self/fd` is unreadable
const FALLBACK_FD_SCAN: i32 = 4096;

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_terminate(_: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
}

fn exit_now(code: i32) -> ! {
    // SAFETY: skips atexit handlers and stdio flushing owned by the service
    unsafe { libc::_exit(code) }
}

/// Split the pre-exec child into reaper and program. Returns only in the
/// program process.
///
/// Call after everything both processes share (session, cgroup,
/// namespaces) and before anything only the program should carry (rlimits,
/// landlock). `cpu_secs` is the RLIMIT_CPU soft limit the program gets.
pub fn spawn_reaper(cpu_secs: u64) -> std::io::Result<()> {
    prctl::set_child_subreaper(true)?;
    let reaper = getpid();

    // SAFETY: called between fork and exec; the reaper side never returns
    // into the caller and only uses syscalls and the allocator.
    match unsafe { fork() }? {
        ForkResult::Child => {
            prctl::set_pdeathsig(Signal::SIGKILL)?;
            if getppid() != reaper {
                exit_now(1);
            }
            Ok(())
        }
        ForkResult::Parent { child } => reap(child, cpu_secs),
    }
}

fn reap(program: Pid, cpu_secs: u64) -> ! {
    close_inherited_fds();
    let _ = setrlimit(Resource::RLIMIT_CORE, 0, 0);

    let action = SigAction::new(
        SigHandler::Handler(on_terminate),
        SaFlags::empty(),
        SigSet::empty(),
    );
    // SAFETY: the handler only stores to an atomic
    let _ = unsafe { sigaction(Signal::SIGTERM, &action) };

    let status = wait_program(program);
    let cpu_exceeded = children_cpu_secs() >= cpu_secs;
    kill_remaining();
    mirror(status, cpu_exceeded)
}

/// Drop every descriptor inherited from the service, including the pipes
/// the supervisor reads and the spawn error pipe
fn close_inherited_fds() {
    let fds: Vec<i32> = match std::fs::read_dir("/proc/self/fd") {
        Ok(entries) => entries
            .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse().ok())
            .collect(),
        Err(_) => (0..FALLBACK_FD_SCAN).collect(),
    };
    for fd in fds {
        let _ = close(fd);
    }
}

/// Reap orphans until the program itself exits
fn wait_program(program: Pid) -> WaitStatus {
    loop {
        if TERMINATE.load(Ordering::SeqCst) {
            let _ = kill(program, Signal::SIGKILL);
        }
        match waitpid(Option::<Pid>::None, None) {
            Ok(status) if status.pid() == Some(program) => return status,
            Ok(_) | Err(Errno::EINTR) => {}
            Err(_) => return WaitStatus::StillAlive,
        }
    }
}

/// CPU seconds of every reaped descendant
fn children_cpu_secs() -> u64 {
    match getrusage(UsageWho::RUSAGE_CHILDREN) {
        Ok(usage) => {
            let secs = usage.user_time().tv_sec() + usage.system_time().tv_sec();
            u64::try_from(secs).unwrap_or(0)
        }
        Err(_) => 0,
    }
}

/// SIGKILL and reap descendants until none are left. Killed processes'
/// children are reparented here too, so the loop converges.
fn kill_remaining() {
    let me = getpid();
    loop {
        for pid in child_pids(me) {
            let _ = kill(pid, Signal::SIGKILL);
        }
        match waitpid(Option::<Pid>::None, None) {
            Ok(_) | Err(Errno::EINTR) => {}
            Err(_) => return,
        }
    }
}

/// Exit the way the program did. A SIGKILL after the CPU soft limit is the
/// hard RLIMIT_CPU kill of a program that caught SIGXCPU.
fn mirror(status: WaitStatus, cpu_exceeded: bool) -> ! {
    match status {
        WaitStatus::Exited(_, code) => exit_now(code),
        WaitStatus::Signaled(_, sig, _) => {
            let sig = if sig == Signal::SIGKILL && cpu_exceeded {
                Signal::SIGXCPU
            } else {
                sig
            };
            // SAFETY: restores the default disposition before re-raising
            let _ = unsafe { signal(sig, SigHandler::SigDfl) };
            let _ = raise(sig);
            exit_now(128 + sig as i32)
        }
        _ => exit_now(1),
    }
}

fn child_pids(me: Pid) -> Vec<Pid> {
    let path = format!("/proc/{}/task/{}/children", me, me);
    if let Ok(list) = std::fs::read_to_string(path) {
        return parse_pid_list(&list);
    }

    // Kernels without CONFIG_PROC_CHILDREN
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(|entry| entry.ok()?.file_name().to_str()?.parse::<i32>().ok())
        .filter(|pid| {
            std::fs::read_to_string(format!("/proc/{}/stat", pid))
                .ok()
                .and_then(|stat| stat_parent(&stat))
                == Some(me.as_raw())
        })
        .map(Pid::from_raw)
        .collect()
}

fn parse_pid_list(list: &str) -> Vec<Pid> {
    list.split_whitespace()
        .filter_map(|pid| pid.parse().ok())
        .map(Pid::from_raw)
        .collect()
}

/// Parent pid from `/proc/<pid>/stat`; the command name may contain spaces
/// and parentheses
fn stat_parent(stat: &str) -> Option<i32> {
    let (_, rest) = stat.rsplit_once(')')?;
    rest.split_whitespace().nth(1)?.parse().ok()
}
