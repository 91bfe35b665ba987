//! Pub/sub bridge: once a client issues `SUBSCRIBE`/`PSUBSCRIBE`, the core stops parsing its
//! frames entirely and hands the raw socket off to a blocking byte-shovel connected to a single
//! backend node. Subscriptions are long-lived and push-driven, which doesn't fit the
//! request/response fan-out the rest of the proxy is built around, so this is the one place the
//! proxy leaves the reactor and spends a dedicated OS thread per bridged connection.

use std::io;
use std::net::{SocketAddr, TcpStream as StdTcpStream};
#[cfg(unix)]
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::thread;

use mio::net::TcpStream as MioTcpStream;
use slog::Logger;

/// Detaches `client_stream` from the reactor's non-blocking mode and relays bytes between it and
/// a fresh connection to `backend`, in both directions, until either side closes. Runs entirely
/// on a new thread; the caller has already deregistered the socket from its `mio::Poll` and
/// dropped every other reference to the client connection.
pub fn bridge(client_stream: MioTcpStream, backend: SocketAddr, log: Logger) -> io::Result<()> {
    let client_stream = to_blocking(client_stream)?;
    let backend_stream = StdTcpStream::connect(backend)?;

    thread::Builder::new()
        .name(format!("pubsub-bridge-{}", backend))
        .spawn(move || {
            if let Err(err) = shovel(client_stream, backend_stream) {
                slog::debug!(log, "pub/sub bridge ended"; "reason" => %err);
            }
        })?;

    Ok(())
}

#[cfg(unix)]
fn to_blocking(stream: MioTcpStream) -> io::Result<StdTcpStream> {
    let std_stream = unsafe { StdTcpStream::from_raw_fd(stream.into_raw_fd()) };
    std_stream.set_nonblocking(false)?;
    Ok(std_stream)
}

fn shovel(client: StdTcpStream, backend: StdTcpStream) -> io::Result<()> {
    let mut client_reader = client.try_clone()?;
    let mut client_writer = client;
    let mut backend_reader = backend.try_clone()?;
    let mut backend_writer = backend;

    let to_backend = thread::Builder::new()
        .name("pubsub-bridge-c2b".into())
        .spawn(move || io::copy(&mut client_reader, &mut backend_writer))?;

    let result = io::copy(&mut backend_reader, &mut client_writer);

    // Either direction closing ends the bridge; join the other thread to avoid leaking it, but
    // don't propagate its (likely identical) error beyond logging.
    let _ = to_backend.join();

    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    #[test]
    fn shovel_relays_bytes_in_both_directions() {
        let client_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let backend_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client_addr = client_listener.local_addr().unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();

        let client_side = thread::spawn(move || {
            let mut sock = StdTcpStream::connect(client_addr).unwrap();
            sock.write_all(b"hello backend").unwrap();
            sock.shutdown(std::net::Shutdown::Write).unwrap();
            let mut buf = Vec::new();
            sock.read_to_end(&mut buf).unwrap();
            buf
        });

        let backend_side = thread::spawn(move || {
            let mut sock = StdTcpStream::connect(backend_addr).unwrap();
            let mut buf = Vec::new();
            sock.read_to_end(&mut buf).unwrap();
            sock.write_all(b"hello client").unwrap();
            sock.shutdown(std::net::Shutdown::Write).unwrap();
            buf
        });

        let (proxy_client, _) = client_listener.accept().unwrap();
        let (proxy_backend, _) = backend_listener.accept().unwrap();

        shovel(proxy_client, proxy_backend).unwrap();

        assert_eq!(client_side.join().unwrap(), b"hello client");
        assert_eq!(backend_side.join().unwrap(), b"hello backend");
    }
}
