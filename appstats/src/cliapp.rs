// This module implements the definition of the command line app.
use std::path::PathBuf;

use clap::builder::ValueParser;
use clap::{Arg, ArgAction, Command, value_parser};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ABOUT: &str = "Appstats aggregates application metrics and logs into time-series rollups.";

/// The config folder used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = ".appstats";

pub fn make_app() -> Command {
    Command::new("appstats")
        .disable_help_subcommand(true)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .propagate_version(true)
        .max_term_width(79)
        .version(VERSION)
        .about(ABOUT)
        .arg(
            Arg::new("config")
                .value_name("CONFIG")
                .long("config")
                .short('c')
                .global(true)
                .env("APPSTATS_CONFIG_PATH")
                .default_value(DEFAULT_CONFIG_PATH)
                .value_parser(value_parser!(PathBuf))
                .help("The path to the config folder."),
        )
        .subcommand(
            Command::new("run")
                .about("Run the daemon")
                .after_help(
                    "This runs appstats in the foreground until it's shut down. It will bind \
                     the statsd and log ports as well as the HTTP port configured in the config \
                     file or on the command line.",
                )
                .arg(
                    Arg::new("host")
                        .long("host")
                        .short('H')
                        .env("APPSTATS_HOST")
                        .help("The host address all sockets bind to."),
                )
                .arg(
                    Arg::new("statsd_port")
                        .long("statsd-port")
                        .env("APPSTATS_STATSD_PORT")
                        .help("The UDP port for statsd measurements."),
                )
                .arg(
                    Arg::new("log_port")
                        .long("log-port")
                        .env("APPSTATS_LOG_PORT")
                        .help("The UDP port for log lines."),
                )
                .arg(
                    Arg::new("http_port")
                        .long("http-port")
                        .short('P')
                        .env("APPSTATS_HTTP_PORT")
                        .help("The TCP port of the HTTP query API."),
                )
                .arg(
                    Arg::new("storage")
                        .long("storage")
                        .value_parser(["sqlite", "memory"])
                        .env("APPSTATS_STORAGE")
                        .help("The rollup store backend."),
                )
                .arg(
                    Arg::new("storage_path")
                        .long("storage-path")
                        .env("APPSTATS_STORAGE_PATH")
                        .help("Path to the database file, relative to the config folder."),
                )
                .arg(
                    Arg::new("shutdown_timeout")
                        .long("shutdown-timeout")
                        .env("APPSTATS_SHUTDOWN_TIMEOUT")
                        .help("Seconds to wait for queued writes on shutdown."),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Manage the appstats config")
                .after_help("This command provides basic config management.")
                .subcommand_required(true)
                .arg_required_else_help(true)
                .subcommand(
                    Command::new("show")
                        .about("Show the entire effective config")
                        .after_help(
                            "This prints the configuration with all defaults filled in, in \
                             the same YAML format as the config file.",
                        ),
                ),
        )
        .subcommand(
            Command::new("query")
                .about("Query the rollups of a process")
                .after_help(
                    "This reads from the configured store directly and prints the result as \
                     JSON. It can run while the daemon is running.",
                )
                .arg(
                    Arg::new("process")
                        .value_name("PROCESS")
                        .required(true)
                        .help("The dimension path joined by underscores, for example route_ctrl."),
                )
                .arg(
                    Arg::new("data")
                        .long("data")
                        .short('d')
                        .required(true)
                        .value_delimiter(',')
                        .help("Comma separated fields to return, for example c_count,t_time."),
                )
                .arg(
                    Arg::new("period")
                        .long("period")
                        .short('p')
                        .value_parser(["day", "hour", "minute"])
                        .default_value("day")
                        .help("The slot granularity of the series."),
                )
                .arg(
                    Arg::new("amount")
                        .long("amount")
                        .short('n')
                        .value_parser(value_parser!(u32).range(1..=i64::from(i16::MAX)))
                        .help("Number of days up to and including today."),
                )
                .arg(
                    Arg::new("group")
                        .long("group")
                        .short('g')
                        .value_delimiter(',')
                        .help("Comma separated group fields. Use * to group by app."),
                )
                .arg(
                    Arg::new("app")
                        .long("app")
                        .short('a')
                        .help("Restrict to one app, or * to read the per-app rollups."),
                )
                .arg(
                    Arg::new("filter")
                        .long("filter")
                        .short('f')
                        .value_name("NAME=VALUE")
                        .action(ArgAction::Append)
                        .value_parser(ValueParser::new(parse_filter))
                        .help("Only include rollups where a group field equals a value."),
                )
                .arg(
                    Arg::new("derived")
                        .long("derived")
                        .action(ArgAction::SetTrue)
                        .help("Report averages instead of sums for timers and gauges."),
                ),
        )
}

/// Parses a `NAME=VALUE` filter.
fn parse_filter(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, value)) if !name.is_empty() => Ok((name.to_owned(), value.to_owned())),
        _ => Err(format!("expected NAME=VALUE, got {value:?}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app() {
        make_app().debug_assert();
    }

    #[test]
    fn test_query_args() {
        let matches = make_app()
            .try_get_matches_from([
                "appstats", "query", "route", "--data", "c_count,t_time", "-f", "route=/login",
                "--group", "*",
            ])
            .unwrap();

        let (_, query) = matches.subcommand().unwrap();
        let data: Vec<&String> = query.get_many("data").unwrap().collect();
        assert_eq!(data, ["c_count", "t_time"]);

        let filters: Vec<&(String, String)> = query.get_many("filter").unwrap().collect();
        assert_eq!(filters, [&("route".to_owned(), "/login".to_owned())]);
        assert_eq!(query.get_one::<String>("period").unwrap(), "day");
    }

    #[test]
    fn test_amount_range() {
        let result = make_app().try_get_matches_from([
            "appstats", "query", "route", "--data", "c_count", "--amount", "40000",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_filter() {
        let result = make_app().try_get_matches_from([
            "appstats", "query", "route", "--data", "c_count", "--filter", "route",
        ]);
        assert!(result.is_err());
    }
}
