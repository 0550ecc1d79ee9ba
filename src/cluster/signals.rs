//! Exit analysis for worker processes.

use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// The status could not be determined.
    Unknown,
}

impl TerminationReason {
    /// Check if this is a successful exit.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Exit code, if the process exited normally.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }

    /// Terminating signal, if any.
    pub fn signal(&self) -> Option<Signal> {
        match self {
            Self::Signaled(signal) => Some(*signal),
            _ => None,
        }
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(sig) => write!(f, "killed by signal {}", sig.as_str()),
            Self::Unknown => f.write_str("unknown reason"),
        }
    }
}

/// Analyze an `ExitStatus` to determine the termination reason.
pub fn analyze_exit_status(status: ExitStatus) -> TerminationReason {
    if let Some(code) = status.code() {
        return TerminationReason::Exited(code);
    }
    status
        .signal()
        .and_then(|raw| Signal::try_from(raw).ok())
        .map(TerminationReason::Signaled)
        .unwrap_or(TerminationReason::Unknown)
}

/// A worker exit as reported in logs.
#[derive(Debug, Clone)]
pub struct WorkerExit {
    /// Worker ordinal.
    pub id: usize,
    /// Process id.
    pub pid: u32,
    /// Why it terminated.
    pub reason: TerminationReason,
}

impl std::fmt::Display for WorkerExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Worker {} (pid {}) {}", self.id, self.pid, self.reason)
    }
}
