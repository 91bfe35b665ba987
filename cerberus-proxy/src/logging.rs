//! Structured logging bootstrap. Builds a `slog::Logger` from the `[logging]` section of the
//! process config via `sloggers`, the same `sloggers::{Config, LoggerConfig}` plus
//! `serdeconv::from_toml_str` pairing the teacher's `flux::logging` uses — fixed here to
//! actually hand the built logger back to the caller instead of dropping it.

use slog::Logger;
use sloggers::{Config, LoggerConfig};

use crate::config::LoggingConfig;

pub fn init(config: &LoggingConfig) -> Logger {
    let toml = format!(
        "type = \"{}\"\nlevel = \"{}\"\ndestination = \"{}\"\n",
        config.kind, config.level, config.destination
    );

    let logger_config: LoggerConfig =
        serdeconv::from_toml_str(&toml).expect("invalid logging configuration");

    logger_config.build_logger().expect("failed to build logger")
}
