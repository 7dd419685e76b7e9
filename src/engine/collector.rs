//! Output capture and status classification
//!
//! Streams are drained while the program runs. Each stream keeps exactly
//! `cap` bytes once it overflows; everything past the cap is read and
//! discarded so the child never blocks on a full pipe. The cap is on bytes:
//! the text handed to callers is the lossy UTF-8 of those bytes cut back to
//! a char boundary, so it may be shorter than the cap but never longer.

use tokio::io::{AsyncRead, AsyncReadExt};

use super::limiter::Termination;
use crate::core::ExecutionStatus;

const READ_CHUNK: usize = 8192;

/// Byte buffer that stops growing at `cap`
#[derive(Debug, Clone)]
pub struct CappedBuffer {
    data: Vec<u8>,
    cap: usize,
    seen: u64,
    truncated: bool,
}

impl CappedBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::with_capacity(cap.min(READ_CHUNK)),
            cap,
            seen: 0,
            truncated: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.seen += chunk.len() as u64;
        let room = self.cap - self.data.len();
        if chunk.len() > room {
            self.data.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        } else {
            self.data.extend_from_slice(chunk);
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total bytes produced by the stream, kept or not
    pub fn total_seen(&self) -> u64 {
        self.seen
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Lossy UTF-8 text, never longer than the cap. A character split by the
    /// cap, or replacement characters pushing past it, shorten the text.
    pub fn to_text(&self) -> String {
        capped_text(&self.data, self.cap)
    }
}

/// Read `reader` to EOF into `buf`
pub async fn drain<R>(mut reader: R, buf: &mut CappedBuffer) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.push(&chunk[..n]);
    }
}

/// Replacement characters can make lossy text longer than its input; cut at
/// the last char boundary within `cap`.
fn capped_text(bytes: &[u8], cap: usize) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if text.len() > cap {
        let mut end = cap;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
    }
    text
}

/// Both streams of one process, converted to text
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput {
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
}

impl CapturedOutput {
    pub fn from_buffers(stdout: &CappedBuffer, stderr: &CappedBuffer) -> Self {
        Self {
            stdout: stdout.to_text(),
            stderr: stderr.to_text(),
            stdout_truncated: stdout.is_truncated(),
            stderr_truncated: stderr.is_truncated(),
        }
    }
}

/// Map a run-phase termination to the status reported to the caller
pub fn classify(termination: &Termination) -> ExecutionStatus {
    match termination {
        Termination::Exited(0) => ExecutionStatus::Success,
        Termination::Exited(_) | Termination::Signaled(_) => ExecutionStatus::RuntimeError,
        Termination::TimedOut => ExecutionStatus::Timeout,
        Termination::MemoryExceeded
        | Termination::ProcessLimitExceeded
        | Termination::CpuTimeExceeded
        | Termination::FileSizeExceeded => ExecutionStatus::ResourceExceeded,
        // Normally surfaced as ExecError::Cancelled before a result exists
        Termination::Cancelled => ExecutionStatus::InternalError,
    }
}
