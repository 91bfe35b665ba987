//! Process-bootstrap concerns for the proxy binary, split out into a small library so the
//! `gen_config` helper binary can share them with `main`, the same way the teacher's service
//! binaries share a `core`/config module with their `src/bin/` helpers.

pub mod config;
pub mod logging;
pub mod stats_reporter;
