use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use crate::{LogConfig, LogFormat};

// Import CRATE_NAMES, which lists all crates in the workspace.
include!(concat!(env!("OUT_DIR"), "/constants.gen.rs"));

/// Builds the default filter: `INFO` for third-party crates, the configured level for ours.
fn default_filter(config: &LogConfig) -> EnvFilter {
    let mut directives = String::from("info,sqlx=warn,tower_http=info");
    for name in CRATE_NAMES {
        directives.push(',');
        directives.push_str(name);
        directives.push('=');
        directives.push_str(config.level.as_str());
    }

    EnvFilter::new(directives)
}

/// Initializes the logging system.
///
/// The `RUST_LOG` environment variable takes precedence over the configured level. Calling this
/// more than once has no effect.
///
/// # Example
///
/// ```
/// let config = appstats_log::LogConfig {
///     enable_backtraces: true,
///     ..Default::default()
/// };
///
/// appstats_log::init(&config);
/// ```
pub fn init(config: &LogConfig) {
    if config.enable_backtraces {
        crate::force_backtraces();
    }

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(config));

    let format = match (config.format, console::user_attended_stderr()) {
        (LogFormat::Auto, true) => LogFormat::Pretty,
        (LogFormat::Auto, false) => LogFormat::Simplified,
        (format, _) => format,
    };

    let subscriber = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
    let subscriber = match format {
        LogFormat::Pretty => subscriber.compact().with_ansi(true).boxed(),
        LogFormat::Simplified | LogFormat::Auto => subscriber.with_ansi(false).boxed(),
        LogFormat::Json => subscriber
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(subscriber.with_filter(filter))
        .try_init()
        .ok();
}
