//! Per-worker connection counters.
//!
//! Updated only by the worker's event loop thread; readable from anywhere
//! through the shared handle.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct WorkerStats {
    accepted: AtomicU64,
    refused: AtomicU64,
    closed: AtomicU64,
    failed: AtomicU64,
    bytes_received: AtomicU64,
    bytes_echoed: AtomicU64,
}

/// Point-in-time copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub refused: u64,
    pub closed: u64,
    pub failed: u64,
    pub bytes_received: u64,
    pub bytes_echoed: u64,
}

impl StatsSnapshot {
    /// Connections currently open.
    #[cfg(test)]
    pub fn open(&self) -> u64 {
        self.accepted.saturating_sub(self.closed + self.failed)
    }
}

impl WorkerStats {
    pub fn record_accept(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Record a released connection and the bytes it echoed.
    pub fn record_close(&self, clean: bool, echoed: u64) {
        if clean {
            self.closed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_echoed.fetch_add(echoed, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_echoed: self.bytes_echoed.load(Ordering::Relaxed),
        }
    }
}
