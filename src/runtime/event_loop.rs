//! mio event loop for a worker process.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then we perform non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! One loop serves the listener and every connection the worker accepts,
//! on a single thread. Each readable event is drained into the connection's
//! echo queue, which is flushed immediately and again whenever the socket
//! turns writable.

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::runtime::buffer::Flush;
use crate::runtime::connection::{CloseReason, ConnState, Connection, ConnectionRegistry};
use crate::runtime::listener::bind_shared;
use crate::runtime::stats::WorkerStats;
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token};
use std::io::{self, Read};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// How often the loop wakes up to check the shutdown flag.
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(250);

const EVENTS_CAPACITY: usize = 1024;

/// A worker: one shared listener plus the connections it accepted.
pub struct Worker {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: ConnectionRegistry,
    read_buf: Vec<u8>,
    reply_prefix: Vec<u8>,
    stats: Arc<WorkerStats>,
}

impl Worker {
    /// Bind the shared port and set up the poller.
    pub fn bind(config: &WorkerConfig) -> Result<Self, WorkerError> {
        let addr = config.addr()?;
        Self::bind_addr(addr, config)
    }

    /// Like [`Worker::bind`] with an already resolved address.
    pub fn bind_addr(addr: SocketAddr, config: &WorkerConfig) -> Result<Self, WorkerError> {
        let listener = bind_shared(addr, config.backlog)
            .map_err(|source| WorkerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let mut listener = TcpListener::from_std(listener);

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            listener,
            local_addr,
            connections: ConnectionRegistry::new(config.max_connections),
            read_buf: vec![0u8; config.buffer_size],
            reply_prefix: config.reply_prefix.as_bytes().to_vec(),
            stats: Arc::new(WorkerStats::default()),
        })
    }

    /// Address actually bound (resolves port 0).
    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Shared handle to this worker's counters.
    #[cfg(test)]
    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Accept and echo until `shutdown` is raised.
    ///
    /// Connection failures are logged and contained; only poller failures
    /// end the loop with an error.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<(), WorkerError> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);

        info!(
            pid = std::process::id(),
            addr = %self.local_addr,
            "Worker {} is listening on port {}",
            std::process::id(),
            self.local_addr.port()
        );

        while !shutdown.load(Ordering::Relaxed) {
            match self.poll.poll(&mut events, Some(SHUTDOWN_CHECK_INTERVAL)) {
                Ok(()) => {}
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept_connections(),
                    Token(conn_id) => {
                        if let Some(reason) = self.handle_connection_event(conn_id, event) {
                            self.close_connection(conn_id, reason);
                        }
                    }
                }
            }
        }

        for conn_id in self.connections.ids() {
            self.close_connection(conn_id, CloseReason::Shutdown);
        }

        let stats = self.stats.snapshot();
        info!(
            accepted = stats.accepted,
            closed = stats.closed,
            failed = stats.failed,
            bytes_echoed = stats.bytes_echoed,
            "Worker stopped"
        );
        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.connections.is_full() {
                        warn!(peer = %peer, "Connection limit reached, refusing connection");
                        self.stats.record_refused();
                        continue;
                    }

                    let conn_id = match self.connections.insert(Connection::new(stream, peer)) {
                        Ok(id) => id,
                        Err(_) => continue,
                    };
                    let registered = match self.connections.get_mut(conn_id) {
                        Some(conn) => self.poll.registry().register(
                            &mut conn.stream,
                            Token(conn_id),
                            Interest::READABLE,
                        ),
                        None => continue,
                    };
                    if let Err(e) = registered {
                        error!(peer = %peer, error = %e, "Failed to register connection");
                        self.connections.remove(conn_id);
                        continue;
                    }

                    self.stats.record_accept();
                    info!(
                        conn_id,
                        peer = %peer,
                        "Worker {} handling new connection from {}:{}",
                        std::process::id(),
                        peer.ip(),
                        peer.port()
                    );
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    /// Process one readiness event. Returns the close reason once the
    /// connection is done.
    fn handle_connection_event(
        &mut self,
        conn_id: usize,
        event: &mio::event::Event,
    ) -> Option<CloseReason> {
        let conn = self.connections.get_mut(conn_id)?;

        if event.is_readable() || event.is_read_closed() || event.is_error() {
            if let Err(e) = read_into_queue(
                conn,
                &mut self.read_buf,
                &self.reply_prefix,
                &self.stats,
            ) {
                return Some(CloseReason::from_io(e));
            }
        }

        if conn.has_pending() {
            match conn.flush() {
                Ok(Flush::Done) | Ok(Flush::Blocked) => {}
                Err(e) => return Some(CloseReason::from_io(e)),
            }
        }

        if conn.is_finished() {
            return Some(CloseReason::PeerClosed);
        }

        if let Some(wanted) = conn.wanted_interest() {
            if wanted != conn.interest {
                if let Err(e) =
                    self.poll
                        .registry()
                        .reregister(&mut conn.stream, Token(conn_id), wanted)
                {
                    return Some(CloseReason::Failed(e));
                }
                conn.interest = wanted;
            }
        }

        None
    }

    fn close_connection(&mut self, conn_id: usize, reason: CloseReason) {
        let Some(mut conn) = self.connections.remove(conn_id) else {
            return;
        };
        conn.close();
        let _ = self.poll.registry().deregister(&mut conn.stream);
        self.stats.record_close(reason.is_clean(), conn.echoed());

        let peer = conn.peer;
        match reason {
            CloseReason::PeerClosed => {
                info!(
                    conn_id,
                    echoed = conn.echoed(),
                    "Client {}:{} disconnected",
                    peer.ip(),
                    peer.port()
                );
            }
            CloseReason::PeerReset(e) => {
                info!(
                    conn_id,
                    error = %e,
                    "Client {}:{} went away",
                    peer.ip(),
                    peer.port()
                );
            }
            CloseReason::Failed(e) => {
                warn!(conn_id, peer = %peer, error = %e, "Socket error");
            }
            CloseReason::Shutdown => {
                debug!(conn_id, peer = %peer, "Connection closed for shutdown");
            }
        }
    }
}

/// Read until the socket would block, queueing every chunk for echo.
///
/// EOF moves the connection to half-closed; nothing is read after that.
fn read_into_queue(
    conn: &mut Connection,
    buf: &mut [u8],
    prefix: &[u8],
    stats: &WorkerStats,
) -> io::Result<()> {
    while conn.state == ConnState::Open {
        match conn.stream.read(buf) {
            Ok(0) => {
                conn.read_closed();
            }
            Ok(n) => {
                let chunk = &buf[..n];
                stats.record_received(n);
                info!(
                    bytes = n,
                    "Received data from client {}:{}: {}",
                    conn.peer.ip(),
                    conn.peer.port(),
                    String::from_utf8_lossy(chunk)
                );
                conn.queue_echo(prefix, chunk);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}
