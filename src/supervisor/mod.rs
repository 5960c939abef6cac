//! Worker pool supervisor.
//!
//! Keeps a fixed number of worker processes alive. Every worker exit is
//! reported on a channel; the supervisor logs it and schedules exactly one
//! replacement, so the pool always returns to its target size.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │   Supervisor    │
//!                     └────────┬────────┘
//!               spawn / exit   │
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 1  │  │ Worker 2  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         └─────┬─────┘  └─────┬─────┘  └─────┬─────┘
//!               └──────── :8000 (SO_REUSEPORT) ┘
//! ```

mod exit;
mod restart;
mod spawn;

pub use exit::{ExitReason, WorkerExit};
pub use restart::{RestartPolicy, RestartTracker};
pub use spawn::{ProcessSpawner, Spawn};

use crate::error::SupervisorError;
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest the supervision loop sleeps before re-checking the shutdown flag.
const TICK: Duration = Duration::from_millis(250);

/// Delay before retrying a spawn that failed.
const SPAWN_RETRY_DELAY: Duration = Duration::from_secs(1);

/// How long teardown waits for workers to exit after SIGTERM.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Liveness of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    Running,
    Exited(ExitReason),
}

/// One running worker process.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    pub id: usize,
    pub pid: u32,
    pub status: WorkerStatus,
    /// Wall-clock spawn time, for logs.
    pub spawned_at: DateTime<Utc>,
    started: Instant,
}

impl WorkerHandle {
    /// How long the worker has been (or was) running.
    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Keeps `target` workers alive.
pub struct Supervisor<S: Spawn> {
    spawner: S,
    target: usize,
    restart: RestartTracker,
    pool: BTreeMap<usize, WorkerHandle>,
    /// Replacement spawns waiting for their due time.
    pending: Vec<Instant>,
    next_id: usize,
    respawns: u64,
    exits_tx: Sender<WorkerExit>,
    exits_rx: Receiver<WorkerExit>,
    stopping: bool,
}

impl<S: Spawn> Supervisor<S> {
    pub fn new(spawner: S, target: usize, policy: RestartPolicy) -> Self {
        let (exits_tx, exits_rx) = mpsc::channel();
        Self {
            spawner,
            target,
            restart: RestartTracker::new(policy),
            pool: BTreeMap::new(),
            pending: Vec::new(),
            next_id: 1,
            respawns: 0,
            exits_tx,
            exits_rx,
            stopping: false,
        }
    }

    /// Spawn the initial `target` workers without waiting for them to be ready.
    ///
    /// Spawns that fail are retried later by the supervision loop. Fails only
    /// if no worker at all could be started.
    pub fn start(&mut self) -> Result<(), SupervisorError> {
        info!(
            pid = std::process::id(),
            workers = self.target,
            restart = ?self.restart.policy(),
            "Supervisor {} is running",
            std::process::id()
        );

        for _ in 0..self.target {
            if let Err(e) = self.spawn_worker() {
                error!(error = %e, "Failed to start worker");
                self.pending.push(Instant::now() + SPAWN_RETRY_DELAY);
            }
        }

        if self.pool.is_empty() {
            self.pending.clear();
            return Err(SupervisorError::NoWorkers {
                target: self.target,
            });
        }
        Ok(())
    }

    /// Supervise until `shutdown` is raised, then tear the pool down.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), SupervisorError> {
        while !shutdown.load(Ordering::Relaxed) {
            self.step(TICK, shutdown);
        }
        info!("Shutdown requested");
        self.shutdown();
        Ok(())
    }

    /// Wait up to `timeout` for one exit notification, handle it, then spawn
    /// any replacements that are due. Returns whether an exit was handled.
    ///
    /// Once `shutdown` is raised, exits are still recorded but nothing is
    /// respawned: a Ctrl-C reaches the workers as well as the supervisor.
    pub fn step(&mut self, timeout: Duration, shutdown: &AtomicBool) -> bool {
        let timeout = match self.next_due() {
            Some(due) => timeout.min(due.saturating_duration_since(Instant::now())),
            None => timeout,
        };

        let received = self.exits_rx.recv_timeout(timeout);
        if shutdown.load(Ordering::Relaxed) {
            self.stop_respawning();
        }

        let handled = match received {
            Ok(exit) => {
                self.handle_exit(exit);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
            // We hold a sender ourselves, so this cannot happen.
            Err(RecvTimeoutError::Disconnected) => false,
        };

        self.spawn_due();
        handled
    }

    /// Record a worker exit and schedule its replacement.
    ///
    /// Returns the delay before the replacement is spawned, or `None` when
    /// no replacement is scheduled (unknown worker, or tearing down).
    pub fn handle_exit(&mut self, exit: WorkerExit) -> Option<Duration> {
        let Some(mut handle) = self.pool.remove(&exit.id) else {
            debug!(worker = exit.id, pid = exit.pid, "Exit for unknown worker ignored");
            return None;
        };
        handle.status = WorkerStatus::Exited(exit.reason);
        let uptime = handle.uptime();

        if self.stopping {
            info!(worker = exit.id, pid = exit.pid, reason = %exit.reason, "Worker {} stopped", exit.pid);
            return None;
        }

        warn!(
            worker = exit.id,
            pid = exit.pid,
            code = exit.reason.code(),
            signal = exit.reason.signal().map(Signal::as_str),
            spawned_at = %handle.spawned_at,
            uptime_ms = uptime.as_millis() as u64,
            reason = %exit.reason,
            "Worker {} died",
            exit.pid
        );

        let delay = self.restart.next_delay(uptime);
        if !delay.is_zero() {
            info!(worker = exit.id, delay_ms = delay.as_millis() as u64, "Delaying replacement");
        }
        self.pending.push(Instant::now() + delay);
        self.respawns += 1;
        self.spawn_due();
        Some(delay)
    }

    /// Spawn every scheduled replacement whose time has come.
    fn spawn_due(&mut self) {
        if self.stopping {
            return;
        }
        let now = Instant::now();
        let (due, later): (Vec<Instant>, Vec<Instant>) =
            self.pending.drain(..).partition(|at| *at <= now);
        self.pending = later;

        for _ in due {
            if let Err(e) = self.spawn_worker() {
                error!(error = %e, "Failed to spawn replacement worker, will retry");
                self.pending.push(now + SPAWN_RETRY_DELAY);
            }
        }
    }

    fn spawn_worker(&mut self) -> Result<usize, SupervisorError> {
        let id = self.next_id;
        self.next_id += 1;

        let pid = self
            .spawner
            .spawn(id, self.exits_tx.clone())
            .map_err(|source| SupervisorError::Spawn { id, source })?;

        self.pool.insert(
            id,
            WorkerHandle {
                id,
                pid,
                status: WorkerStatus::Running,
                spawned_at: Utc::now(),
                started: Instant::now(),
            },
        );
        info!(worker = id, pid, live = self.pool.len(), "Worker {} started", pid);
        Ok(id)
    }

    fn next_due(&self) -> Option<Instant> {
        self.pending.iter().min().copied()
    }

    fn stop_respawning(&mut self) {
        if !self.stopping {
            self.stopping = true;
            self.pending.clear();
        }
    }

    /// Stop respawning, SIGTERM every live worker and wait for them to exit.
    pub fn shutdown(&mut self) {
        if self.stopping && self.pool.is_empty() {
            return;
        }
        self.stop_respawning();

        for handle in self.pool.values() {
            if let Err(e) = self.spawner.terminate(handle.pid) {
                warn!(worker = handle.id, pid = handle.pid, error = %e, "Failed to signal worker");
            }
        }

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while !self.pool.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.exits_rx.recv_timeout(remaining) {
                Ok(exit) => {
                    self.handle_exit(exit);
                }
                Err(_) => break,
            }
        }

        if !self.pool.is_empty() {
            warn!(remaining = self.pool.len(), "Workers still running after shutdown grace period");
        }
        info!(respawns = self.respawns, "Supervisor stopped");
    }

    /// Workers currently believed alive.
    pub fn live(&self) -> usize {
        self.pool.len()
    }

    pub fn target(&self) -> usize {
        self.target
    }

    /// Ids of live workers, ascending.
    pub fn worker_ids(&self) -> Vec<usize> {
        self.pool.keys().copied().collect()
    }

    /// Process ids of live workers, in worker id order.
    pub fn pids(&self) -> Vec<u32> {
        self.pool.values().map(|h| h.pid).collect()
    }

    #[cfg(test)]
    pub fn worker(&self, id: usize) -> Option<&WorkerHandle> {
        self.pool.get(&id)
    }

    /// Replacements spawned or scheduled so far.
    #[cfg(test)]
    pub fn respawns(&self) -> u64 {
        self.respawns
    }

    /// Replacements scheduled but not yet spawned.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl<S: Spawn> Drop for Supervisor<S> {
    fn drop(&mut self) {
        if !self.pool.is_empty() {
            self.shutdown();
        }
    }
}
