use std::io;
use std::net::SocketAddr;

use mio::net::TcpListener;

/// Builds a `std::net::TcpListener` bound with `SO_REUSEPORT`/`SO_REUSEADDR` so that every
/// worker thread can independently accept connections off the same port, with the kernel
/// spreading new connections across them instead of a single thread owning the accept queue.
pub fn bind_reuseport(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => socket2::Domain::IPV4,
        SocketAddr::V6(_) => socket2::Domain::IPV6,
    };

    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}

/// Same as `bind_reuseport`, wrapped straight into an `mio::net::TcpListener` ready for
/// registration with a worker's `Poll`.
pub fn bind_mio_reuseport(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let std_listener = bind_reuseport(addr, backlog)?;
    TcpListener::from_std(std_listener)
}
