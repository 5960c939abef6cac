//! Worker subprocess spawning.
//!
//! Workers are started by re-executing the current binary in `worker`
//! mode via `std::process::Command`. Each child gets a reaper thread that
//! blocks on its exit and forwards a [`WorkerExit`] to the supervisor.

use super::exit::{ExitReason, WorkerExit};
use crate::config::WorkerConfig;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::Sender;
use std::thread;
use tracing::{debug, warn};

/// Launches workers for the supervisor.
///
/// Implementations must deliver exactly one [`WorkerExit`] on `exits` for
/// every worker they successfully spawn.
pub trait Spawn {
    /// Start worker number `id`, returning its OS process id.
    fn spawn(&mut self, id: usize, exits: Sender<WorkerExit>) -> io::Result<u32>;

    /// Ask a running worker to stop.
    fn terminate(&mut self, pid: u32) -> io::Result<()>;
}

/// Spawns workers as child processes.
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessSpawner {
    /// Spawn `program args...` for every worker.
    pub fn new(program: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Re-execute this binary as `worker` with the given settings.
    pub fn for_worker(config: &WorkerConfig, log_level: &str) -> io::Result<Self> {
        let exe = std::env::current_exe()?;

        let mut args: Vec<OsString> = vec!["--log-level".into(), log_level.into(), "worker".into()];
        args.extend(config.to_args().into_iter().map(OsString::from));

        Ok(Self::new(exe, args))
    }
}

impl Spawn for ProcessSpawner {
    fn spawn(&mut self, id: usize, exits: Sender<WorkerExit>) -> io::Result<u32> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .spawn()?;
        let pid = child.id();

        let reaper = thread::Builder::new()
            .name(format!("reaper-{id}"))
            .spawn(move || {
                let reason = match child.wait() {
                    Ok(status) => ExitReason::from(status),
                    Err(e) => {
                        warn!(worker = id, pid, error = %e, "Failed to wait for worker");
                        ExitReason::Unknown
                    }
                };
                debug!(worker = id, pid, %reason, "Reaped worker");
                // The supervisor may already be gone during teardown.
                let _ = exits.send(WorkerExit { id, pid, reason });
            });

        if let Err(e) = reaper {
            // Without a reaper its exit would never be seen; do not leave it running.
            let _ = send_signal(pid, Signal::SIGKILL);
            return Err(e);
        }

        Ok(pid)
    }

    fn terminate(&mut self, pid: u32) -> io::Result<()> {
        send_signal(pid, Signal::SIGTERM)
    }
}

/// Send `signal` to process `pid`.
pub fn send_signal(pid: u32, sig: Signal) -> io::Result<()> {
    let pid = i32::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
    signal::kill(Pid::from_raw(pid), sig)?;
    Ok(())
}
