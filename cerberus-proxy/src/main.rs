//! Process entry point: parses the CLI, loads the config file, layers the `-b/-n/-t/-r/-R`
//! overrides on top of it, then spawns one reactor thread per `thread_count`, all bound to the
//! same port via `SO_REUSEPORT`. Bootstrap concerns only — the reactor itself lives entirely in
//! `cerberus_core::Worker`.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{App, Arg};

use cerberus_core::{AdminState, Stats, Worker, WorkerConfig};
use cerberus_proxy::config::Config;
use cerberus_proxy::{logging, stats_reporter};

fn install_panic_hook(log: slog::Logger) {
    std::panic::set_hook(Box::new(move |info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown".to_string());
        let message = info
            .payload()
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| info.payload().downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "<non-string panic payload>".to_string());

        slog::crit!(log, "worker thread panicked"; "location" => location, "message" => message);
    }));
}

fn main() {
    let matches = App::new("cerberus-proxy")
        .version("0.1.0")
        .author("Bush Hammer Industries")
        .about("Transparent proxy in front of a Redis Cluster.")
        .arg(Arg::with_name("CONFIG_FILE").help("Path to the config file").required(true))
        .arg(Arg::with_name("bind-port").short("b").takes_value(true).help("Overrides bind_port"))
        .arg(Arg::with_name("seed-remote").short("n").takes_value(true).help("Overrides seed_remote, as HOST:PORT"))
        .arg(Arg::with_name("thread-count").short("t").takes_value(true).help("Overrides thread_count"))
        .arg(Arg::with_name("read-slave").short("r").takes_value(true).possible_values(&["yes", "no"]).help("Overrides read_slave"))
        .arg(Arg::with_name("read-slave-filter").short("R").takes_value(true).help("Host prefix preferred when selecting a replica"))
        .get_matches();

    let config_file_path = matches.value_of("CONFIG_FILE").unwrap();
    let mut config = Config::load(config_file_path);

    if let Some(port) = matches.value_of("bind-port") {
        config.bind_port = port.parse().expect("-b expects a numeric port");
    }
    if let Some(addr) = matches.value_of("seed-remote") {
        config.seed_remote = addr.parse().expect("-n expects a HOST:PORT address");
    }
    if let Some(count) = matches.value_of("thread-count") {
        config.thread_count = count.parse().expect("-t expects a positive integer");
    }
    if let Some(flag) = matches.value_of("read-slave") {
        config.read_slave = flag == "yes";
    }
    if let Some(filter) = matches.value_of("read-slave-filter") {
        config.read_slave_filter = filter.to_string();
    }

    let log = logging::init(&config.logging);
    install_panic_hook(log.clone());

    slog::info!(
        log,
        "starting cerberus-proxy";
        "started_at" => %chrono::Local::now().to_rfc3339(),
        "bind_port" => config.bind_port,
        "thread_count" => config.thread_count,
        "seed_remote" => %config.seed_remote,
        "read_slave" => config.read_slave,
        "read_slave_filter" => %config.read_slave_filter,
        "cluster_require_full_coverage" => config.cluster_require_full_coverage,
    );

    let bind_addr: SocketAddr = format!("0.0.0.0:{}", config.bind_port)
        .parse()
        .expect("failed to build bind address");

    let admin = Arc::new(AdminState::new(config.seed_remote));

    let mut handles = Vec::with_capacity(config.thread_count);
    let mut stats_handles = Vec::with_capacity(config.thread_count);

    for worker_id in 0..config.thread_count {
        let stats = Arc::new(Stats::new());
        stats_handles.push(stats.clone());

        let worker_config = WorkerConfig {
            bind_addr,
            seed_remote: config.seed_remote,
            require_full_coverage: config.cluster_require_full_coverage,
            read_slave: config.read_slave,
            read_slave_filter: config.read_slave_filter.clone(),
            admin: admin.clone(),
        };
        let worker_log = log.new(slog::o!("worker" => worker_id));

        handles.push(std::thread::spawn(move || {
            let worker = Worker::new(worker_config, stats, worker_log.clone())
                .unwrap_or_else(|err| {
                    slog::crit!(worker_log, "failed to bind worker"; "error" => %err);
                    std::process::exit(1);
                });
            if let Err(err) = worker.run() {
                slog::crit!(worker_log, "worker reactor exited"; "error" => %err);
                std::process::exit(1);
            }
        }));
    }

    stats_reporter::spawn(stats_handles, log.clone());

    for handle in handles {
        let _ = handle.join();
    }
}
