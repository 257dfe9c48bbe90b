//! Command-line interface handling for the realm server.
//!
//! This module provides command-line argument parsing using the `clap`
//! builder API. Every option overrides the matching configuration file value.

use clap::{value_parser, Arg, ArgMatches, Command};
use std::path::PathBuf;

use crate::config::AppConfig;

/// Command line arguments parsed from user input.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    /// Optional override for the idle session timeout, in seconds
    pub session_timeout_secs: Option<u64>,
    /// Optional override for the per-client request rate
    pub requests_per_second: Option<f64>,
}

impl CliArgs {
    /// Builds the clap command definition.
    pub fn command() -> Command {
        Command::new("Realm Server")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Shared-state core for multiplayer game servers")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("config.toml"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(clap::ArgAction::SetTrue),
            )
            .arg(
                Arg::new("session-timeout")
                    .long("session-timeout")
                    .value_name("SECONDS")
                    .help("Idle time before an unused session is evicted")
                    .value_parser(value_parser!(u64)),
            )
            .arg(
                Arg::new("rate-limit")
                    .long("rate-limit")
                    .value_name("RPS")
                    .help("Sustained requests per second allowed per client")
                    .value_parser(value_parser!(f64)),
            )
    }

    /// Parses the process arguments, exiting with usage on error.
    pub fn parse() -> Self {
        Self::from_matches(&Self::command().get_matches())
    }

    fn from_matches(matches: &ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("config.toml")),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            session_timeout_secs: matches.get_one::<u64>("session-timeout").copied(),
            requests_per_second: matches.get_one::<f64>("rate-limit").copied(),
        }
    }

    /// Applies every override given on the command line.
    pub fn apply_to(&self, config: &mut AppConfig) {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json_logs {
            config.logging.json_format = true;
        }
        if let Some(timeout) = self.session_timeout_secs {
            config.sessions.timeout_secs = timeout;
        }
        if let Some(rps) = self.requests_per_second {
            config.rate_limit.requests_per_second = rps;
        }
    }
}
