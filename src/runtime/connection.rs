//! Connection state machine for accepted TCP connections.
//!
//! Each connection tracks whether the peer is still sending, the bytes
//! waiting to be echoed, and how it eventually ended.

use crate::runtime::buffer::{EchoQueue, Flush};
use mio::net::TcpStream;
use mio::Interest;
use slab::Slab;
use std::io;
use std::net::SocketAddr;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Reading and echoing.
    Open,
    /// Peer sent EOF; flushing what is left before closing.
    HalfClosed,
    /// Done. The registry drops it on the next pass.
    Closed,
}

/// Why a connection was released.
#[derive(Debug)]
pub enum CloseReason {
    /// Peer sent EOF and everything was echoed.
    PeerClosed,
    /// Peer went away abruptly (reset, broken pipe).
    PeerReset(io::Error),
    /// Any other read/write failure.
    Failed(io::Error),
    /// The worker is shutting down.
    Shutdown,
}

impl CloseReason {
    /// Sort an I/O error into a peer departure or a real failure.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => CloseReason::PeerReset(err),
            _ => CloseReason::Failed(err),
        }
    }

    /// True unless the connection ended on an unexpected error.
    pub fn is_clean(&self) -> bool {
        !matches!(self, CloseReason::Failed(_))
    }
}

/// A single client connection.
#[derive(Debug)]
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub state: ConnState,
    /// Interest currently registered with the poller.
    pub interest: Interest,
    queue: EchoQueue,
    echoed: u64,
}

impl Connection {
    /// Create a new connection in the open state, registered for reads.
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: ConnState::Open,
            interest: Interest::READABLE,
            queue: EchoQueue::new(),
            echoed: 0,
        }
    }

    /// Queue a received chunk for echo.
    pub fn queue_echo(&mut self, prefix: &[u8], chunk: &[u8]) {
        self.queue.push(prefix, chunk);
    }

    /// Write queued bytes until done or the socket would block.
    pub fn flush(&mut self) -> io::Result<Flush> {
        let (written, flush) = self.queue.drain_into(&mut self.stream)?;
        self.echoed += written as u64;
        Ok(flush)
    }

    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Total bytes written back to the peer.
    pub fn echoed(&self) -> u64 {
        self.echoed
    }

    /// Peer finished sending.
    pub fn read_closed(&mut self) {
        if self.state == ConnState::Open {
            self.state = ConnState::HalfClosed;
        }
    }

    /// Mark connection as closed. Nothing queued will be written after this.
    pub fn close(&mut self) {
        self.queue.clear();
        self.state = ConnState::Closed;
    }

    /// Whether the connection has nothing left to do.
    pub fn is_finished(&self) -> bool {
        match self.state {
            ConnState::Open => false,
            ConnState::HalfClosed => !self.has_pending(),
            ConnState::Closed => true,
        }
    }

    /// Interest the poller should watch for in the current state.
    ///
    /// Reads stop after EOF; writes are only watched while echo bytes are
    /// queued.
    pub fn wanted_interest(&self) -> Option<Interest> {
        let reading = self.state == ConnState::Open;
        let writing = self.state != ConnState::Closed && self.has_pending();
        match (reading, writing) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

/// Registry of active connections using slab allocation.
///
/// Provides O(1) insert, lookup, and remove operations.
pub struct ConnectionRegistry {
    connections: Slab<Connection>,
    max_connections: usize,
}

impl ConnectionRegistry {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection into the registry.
    ///
    /// Returns the connection back if the registry is at capacity.
    pub fn insert(&mut self, conn: Connection) -> Result<usize, Connection> {
        if self.connections.len() >= self.max_connections {
            return Err(conn);
        }
        Ok(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection> {
        self.connections.get_mut(id)
    }

    /// Remove a connection from the registry.
    pub fn remove(&mut self, id: usize) -> Option<Connection> {
        self.connections.try_remove(id)
    }

    pub fn is_full(&self) -> bool {
        self.connections.len() >= self.max_connections
    }

    /// Number of active connections.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Ids of all active connections.
    pub fn ids(&self) -> Vec<usize> {
        self.connections.iter().map(|(id, _)| id).collect()
    }
}
