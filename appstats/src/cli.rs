use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use appstats_config::{Config, OverridableConfig};
use appstats_rollup::{Granularity, Query, StoreClient};
use clap::ArgMatches;

use crate::{cliapp, setup};

/// Runs the command line application.
pub fn execute() -> Result<()> {
    let app = cliapp::make_app();
    let matches = app.get_matches();

    let config_path = matches
        .get_one::<PathBuf>("config")
        .cloned()
        .unwrap_or_else(|| PathBuf::from(cliapp::DEFAULT_CONFIG_PATH));

    let mut config = Config::from_path(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    if let Some(matches) = matches.subcommand_matches("run") {
        config.apply_override(extract_config_args(matches))?;
    }

    appstats_log::init(config.logging());

    match matches.subcommand() {
        Some(("run", _)) => run(config),
        Some(("config", matches)) => manage_config(&config, matches),
        Some(("query", matches)) => query(config, matches),
        _ => unreachable!(),
    }
}

/// Extracts config overrides from the `run` arguments.
pub fn extract_config_args(matches: &ArgMatches) -> OverridableConfig {
    let get = |name: &str| matches.get_one::<String>(name).cloned();

    OverridableConfig {
        host: get("host"),
        statsd_port: get("statsd_port"),
        log_port: get("log_port"),
        http_port: get("http_port"),
        storage: get("storage"),
        storage_path: get("storage_path"),
        shutdown_timeout: get("shutdown_timeout"),
    }
}

pub fn manage_config(config: &Config, matches: &ArgMatches) -> Result<()> {
    match matches.subcommand() {
        Some(("show", _)) => {
            #[allow(clippy::print_stdout)]
            {
                print!("{}", config.to_yaml_string()?);
            }
            Ok(())
        }
        _ => unreachable!(),
    }
}

/// Builds a stats query from the `query` arguments.
fn extract_query(config: &Config, matches: &ArgMatches) -> Result<(Query, bool)> {
    let strings = |name: &str| -> Vec<String> {
        matches
            .get_many::<String>(name)
            .map(|values| values.cloned().collect())
            .unwrap_or_default()
    };

    let process = matches
        .get_one::<String>("process")
        .cloned()
        .unwrap_or_default();

    let period = matches
        .get_one::<String>("period")
        .map(|period| period.parse::<Granularity>())
        .transpose()?
        .unwrap_or_default();

    let filters: BTreeMap<String, String> = matches
        .get_many::<(String, String)>("filter")
        .map(|filters| filters.cloned().collect())
        .unwrap_or_default();

    let query = Query {
        period,
        amount: matches
            .get_one::<u32>("amount")
            .copied()
            .unwrap_or_else(|| config.default_query_amount()),
        filters,
        groups: strings("group"),
        app: matches.get_one::<String>("app").cloned(),
        ..Query::new(process, strings("data"))
    };

    Ok((query, matches.get_flag("derived")))
}

/// Runs a query against the configured store and prints the result as JSON.
pub fn query(config: Config, matches: &ArgMatches) -> Result<()> {
    let (query, derived) = extract_query(&config, matches)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to create the tokio runtime")?;

    let result = runtime.block_on(async {
        let client = StoreClient::new(config.storage());
        let store = client.connect().await?;
        let result = appstats_rollup::execute(&store, &query, chrono::Utc::now()).await;
        client.close().await;
        anyhow::Ok(result?)
    })?;

    let result = if derived {
        result.with_derived_values()
    } else {
        result
    };

    #[allow(clippy::print_stdout)]
    {
        println!("{}", serde_json::to_string_pretty(&result)?);
    }

    Ok(())
}

pub fn run(config: Config) -> Result<()> {
    setup::check_config(&config)?;
    setup::dump_spawn_infos(&config);
    setup::init_metrics(&config)?;

    appstats_server::run(config)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subcommand(args: &[&str]) -> ArgMatches {
        let matches = cliapp::make_app().try_get_matches_from(args).unwrap();
        let (_, matches) = matches.subcommand().unwrap();
        matches.clone()
    }

    #[test]
    fn test_extract_config_args() {
        let matches = subcommand(&["appstats", "run", "--http-port", "9000", "--storage", "memory"]);
        let overrides = extract_config_args(&matches);

        assert_eq!(overrides.http_port.as_deref(), Some("9000"));
        assert_eq!(overrides.storage.as_deref(), Some("memory"));
        assert_eq!(overrides.host, None);
    }

    #[test]
    fn test_extract_query() {
        let matches = subcommand(&[
            "appstats",
            "query",
            "route_ctrl",
            "--data",
            "c_count",
            "--period",
            "minute",
            "--group",
            "route,*",
            "--filter",
            "route=/login",
            "--derived",
        ]);

        let (query, derived) = extract_query(&Config::default(), &matches).unwrap();

        assert!(derived);
        assert_eq!(query.process, "route_ctrl");
        assert_eq!(query.period, Granularity::Minute);
        assert_eq!(query.amount, 2);
        assert_eq!(query.groups, ["route", "*"]);
        assert_eq!(query.filters["route"], "/login");
        assert_eq!(query.app, None);
    }
}
