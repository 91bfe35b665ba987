use std::fmt;
use std::io;
use std::net;

/// Result alias used throughout the networking layer.
pub type NetResult<T> = Result<T, NetError>;

/// The error type returned by non-blocking network operations.
///
/// `Wait` is not really an error: it means the operation could not make progress right now
/// (the socket would have blocked) and should be retried once the reactor reports the channel
/// readable/writable again. Everything else is `Fatal` and means the connection backing the
/// operation must be torn down.
#[derive(Debug)]
pub enum NetError {
    Wait,
    Fatal(FatalKind),
}

#[derive(Debug)]
pub enum FatalKind {
    Io(io::Error),
    AddrParse(net::AddrParseError),
    /// The peer sent bytes that do not parse as a well formed RESP message.
    Protocol(String),
    /// A cluster slot map could not be derived from `CLUSTER NODES` output.
    ClusterState(String),
}

impl NetError {
    #[inline]
    pub fn protocol<S: Into<String>>(message: S) -> NetError {
        NetError::Fatal(FatalKind::Protocol(message.into()))
    }

    #[inline]
    pub fn cluster_state<S: Into<String>>(message: S) -> NetError {
        NetError::Fatal(FatalKind::ClusterState(message.into()))
    }

    /// True if retrying the operation later might succeed; false if the channel is dead.
    #[inline]
    pub fn is_wait(&self) -> bool {
        matches!(self, NetError::Wait)
    }
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            _ => NetError::Fatal(FatalKind::Io(err)),
        }
    }
}

impl From<net::AddrParseError> for NetError {
    #[inline]
    fn from(err: net::AddrParseError) -> Self {
        NetError::Fatal(FatalKind::AddrParse(err))
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::Wait => write!(f, "operation would block"),
            NetError::Fatal(FatalKind::Io(err)) => write!(f, "io error: {}", err),
            NetError::Fatal(FatalKind::AddrParse(err)) => write!(f, "address parse error: {}", err),
            NetError::Fatal(FatalKind::Protocol(msg)) => write!(f, "protocol error: {}", msg),
            NetError::Fatal(FatalKind::ClusterState(msg)) => write!(f, "cluster state error: {}", msg),
        }
    }
}

impl std::error::Error for NetError {}

/// Extension trait mirroring the convention that a `Wait` is not a genuine failure.
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn would_block_becomes_wait() {
        let io_err: io::Error = io::ErrorKind::WouldBlock.into();
        let net_err: NetError = io_err.into();
        assert!(net_err.is_wait());
    }

    #[test]
    fn other_io_errors_are_fatal() {
        let io_err: io::Error = io::ErrorKind::ConnectionReset.into();
        let net_err: NetError = io_err.into();
        assert!(!net_err.is_wait());

        let result: NetResult<()> = Err(net_err);
        assert!(result.has_failed());
    }
}
