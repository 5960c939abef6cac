//! Shared listening socket.
//!
//! Every worker process opens its own listener on the same address with
//! `SO_REUSEPORT`; the kernel then spreads incoming connections across
//! them. A socket bound without the option cannot join the group.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::SocketAddr;

/// Create a non-blocking TCP listener with SO_REUSEPORT for kernel load balancing.
pub fn bind_shared(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as u32) as i32)?;

    Ok(socket.into())
}
