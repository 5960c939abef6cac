//! Worker exit notifications.
//!
//! Translates process termination status into something the supervisor
//! can log and reason about.

use nix::sys::signal::Signal;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;

/// Why a worker process terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by signal.
    Signaled(Signal),
    /// No exit code, and no signal this platform knows.
    Unknown,
}

impl ExitReason {
    /// Check if this is a successful exit.
    #[cfg(test)]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Exit code, if the worker exited on its own.
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            _ => None,
        }
    }

    /// Terminating signal, if any.
    pub fn signal(&self) -> Option<Signal> {
        match self {
            Self::Signaled(sig) => Some(*sig),
            _ => None,
        }
    }
}

impl From<ExitStatus> for ExitReason {
    fn from(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            Self::Exited(code)
        } else if let Some(sig) = status.signal() {
            Signal::try_from(sig).map_or(Self::Unknown, Self::Signaled)
        } else {
            Self::Unknown
        }
    }
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(sig) => {
                write!(f, "killed by signal {} ({})", *sig as i32, sig.as_str())
            }
            Self::Unknown => write!(f, "terminated for an unknown reason"),
        }
    }
}

/// Exit notification delivered to the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerExit {
    /// Supervisor-assigned worker number.
    pub id: usize,
    /// OS process id.
    pub pid: u32,
    pub reason: ExitReason,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_exit_status() {
        // Raw wait statuses: exit code in the high byte, signal in the low bits.
        assert_eq!(
            ExitReason::from(ExitStatus::from_raw(3 << 8)),
            ExitReason::Exited(3)
        );
        assert_eq!(
            ExitReason::from(ExitStatus::from_raw(0)),
            ExitReason::Exited(0)
        );
        assert_eq!(
            ExitReason::from(ExitStatus::from_raw(Signal::SIGKILL as i32)),
            ExitReason::Signaled(Signal::SIGKILL)
        );
    }

    #[test]
    fn test_accessors() {
        assert!(ExitReason::Exited(0).is_success());
        assert!(!ExitReason::Exited(1).is_success());
        assert!(!ExitReason::Signaled(Signal::SIGTERM).is_success());

        assert_eq!(ExitReason::Exited(2).code(), Some(2));
        assert_eq!(ExitReason::Exited(2).signal(), None);
        assert_eq!(
            ExitReason::Signaled(Signal::SIGKILL).signal(),
            Some(Signal::SIGKILL)
        );
        assert_eq!(ExitReason::Unknown.code(), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(ExitReason::Exited(1).to_string(), "exited with code 1");
        assert_eq!(
            ExitReason::Signaled(Signal::SIGTERM).to_string(),
            format!("killed by signal {} (SIGTERM)", Signal::SIGTERM as i32)
        );
        assert_eq!(
            ExitReason::Unknown.to_string(),
            "terminated for an unknown reason"
        );
    }
}
