//! On-disk configuration for the proxy process. Loaded once at startup from a TOML file and
//! then layered with CLI overrides (see `main.rs`), the same two-step shape the teacher's
//! `GameConfig::load` plus clap-arg handling uses, just collapsed into one struct instead of
//! being split game-side vs session-side.

use std::net::SocketAddr;
use std::path::Path;

use serde_derive::{Deserialize, Serialize};

pub const DEFAULT_BIND_PORT: u16 = 6379;

#[derive(Serialize, Deserialize, Clone)]
pub struct Config {
    pub bind_port: u16,
    pub thread_count: usize,
    pub seed_remote: SocketAddr,
    pub read_slave: bool,
    #[serde(default)]
    pub read_slave_filter: String,
    pub cluster_require_full_coverage: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Passed straight through to `sloggers::LoggerConfig` at startup. Kept as a raw TOML fragment
/// rather than a typed struct since `sloggers` already owns a rich config schema of its own —
/// duplicating it here would just be a second copy to keep in sync.
#[derive(Serialize, Deserialize, Clone)]
pub struct LoggingConfig {
    pub kind: String,
    pub level: String,
    pub destination: String,
}

impl Default for LoggingConfig {
    fn default() -> LoggingConfig {
        LoggingConfig {
            kind: "terminal".to_string(),
            level: "info".to_string(),
            destination: "stderr".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Config {
        Config {
            bind_port: DEFAULT_BIND_PORT,
            thread_count: 4,
            seed_remote: "127.0.0.1:7000".parse().unwrap(),
            read_slave: false,
            read_slave_filter: String::new(),
            cluster_require_full_coverage: true,
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Config {
        serdeconv::from_toml_file(path).expect("error loading proxy configuration file")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_a_usable_bind_port_and_thread_count() {
        let config = Config::default();
        assert_eq!(config.bind_port, DEFAULT_BIND_PORT);
        assert!(config.thread_count > 0);
    }

    #[test]
    fn round_trips_through_toml() {
        let config = Config::default();
        let toml = serdeconv::to_toml_string(&config).unwrap();
        let parsed: Config = serdeconv::from_toml_str(&toml).unwrap();
        assert_eq!(parsed.bind_port, config.bind_port);
        assert_eq!(parsed.thread_count, config.thread_count);
        assert_eq!(parsed.seed_remote, config.seed_remote);
        assert_eq!(parsed.read_slave, config.read_slave);
        assert_eq!(parsed.read_slave_filter, config.read_slave_filter);
    }
}
