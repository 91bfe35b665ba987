//! The proxy's core engine: command splitting, cluster slot routing, and the per-thread reactor
//! that ties them together. Deliberately has no opinion on process bootstrap, configuration
//! sources, or logging sinks — those live in the `cerberus-proxy` binary crate, which hands a
//! `worker::WorkerConfig` and a ready-made `slog::Logger` down to this crate's `Worker`.

pub mod arena;
pub mod client;
pub mod command;
pub mod protocol;
pub mod pubsub;
pub mod response;
pub mod server;
pub mod slot;
pub mod slotmap;
pub mod stats;
pub mod updater;
pub mod worker;

pub use stats::{Stats, StatsSnapshot};
pub use worker::{AdminState, Worker, WorkerConfig};
