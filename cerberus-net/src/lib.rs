//! Low level, proxy-agnostic networking primitives: a growable byte buffer for non-blocking
//! sockets, the error type used to distinguish "would block" from fatal I/O failures, and
//! helpers to stand up `SO_REUSEPORT` listeners shared across worker threads.

pub mod buffer;
pub mod error;
pub mod listener;

pub use buffer::Buffer;
pub use error::{ErrorUtils, FatalKind, NetError, NetResult};
