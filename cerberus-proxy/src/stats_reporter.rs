//! Background stats reporter: wakes on a fixed interval and logs a snapshot from every worker's
//! `Stats`, the same `thread::sleep`-driven loop shape as the teacher's `World::run` frame timer
//! in `neutronium/src/world.rs`, just reporting instead of simulating.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use cerberus_core::Stats;
use slog::Logger;

const REPORT_INTERVAL: Duration = Duration::from_secs(10);

/// Spawns a detached thread that logs an aggregate snapshot across `workers` every
/// `REPORT_INTERVAL`. Runs for the lifetime of the process; there is no shutdown signal since
/// the proxy itself has none.
pub fn spawn(workers: Vec<Arc<Stats>>, log: Logger) {
    thread::spawn(move || loop {
        thread::sleep(REPORT_INTERVAL);

        let mut clients_count = 0u64;
        let mut total_cmd = 0u64;
        let mut total_cmd_elapse_nanos = 0u64;
        let mut total_remote_cost_nanos = 0u64;
        let mut buffer_memory_bytes = 0u64;

        for stats in &workers {
            let snap = stats.snapshot();
            clients_count += snap.clients_count;
            total_cmd += snap.total_cmd;
            total_cmd_elapse_nanos += snap.total_cmd_elapse_nanos;
            total_remote_cost_nanos += snap.total_remote_cost_nanos;
            buffer_memory_bytes += snap.buffer_memory_bytes;
        }

        let avg_cmd_elapse_us = if total_cmd > 0 { total_cmd_elapse_nanos / total_cmd / 1_000 } else { 0 };
        let avg_remote_cost_us = if total_cmd > 0 { total_remote_cost_nanos / total_cmd / 1_000 } else { 0 };

        slog::info!(
            log,
            "stats";
            "clients" => clients_count,
            "total_cmd" => total_cmd,
            "avg_cmd_elapse_us" => avg_cmd_elapse_us,
            "avg_remote_cost_us" => avg_remote_cost_us,
            "buffer_memory_bytes" => buffer_memory_bytes,
        );
    });
}
