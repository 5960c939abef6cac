//! Worker runtime.
//!
//! Each worker process runs a single mio event loop over its own
//! `SO_REUSEPORT` listener. Shared pieces:
//! - `EchoQueue`: per-connection FIFO of bytes to write back
//! - `Connection`: connection state machine
//! - `WorkerStats`: counters for accepted/closed connections

mod buffer;
mod connection;
mod event_loop;
mod listener;
mod stats;

pub use event_loop::Worker;

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use std::sync::atomic::AtomicBool;

/// Bind the shared port and serve until `shutdown` is raised.
pub fn run(config: &WorkerConfig, shutdown: &AtomicBool) -> Result<(), WorkerError> {
    let mut worker = Worker::bind(config)?;
    worker.run(shutdown)
}
