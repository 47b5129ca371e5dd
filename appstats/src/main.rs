//! The appstats daemon.
//!
//! Appstats receives application measurements over the statsd protocol and log lines over UDP,
//! rolls them up per day, hour and quarter hour, and serves dense time series over HTTP.
//!
//! # Usage
//!
//! ```text
//! appstats run --config .appstats
//! appstats config show
//! appstats query route --data c_count,t_time --period hour --group '*'
//! ```
//!
//! See [`appstats_config`] for the configuration file and [`appstats_server`] for the wire
//! protocols and the HTTP API.

mod cli;
mod cliapp;
mod setup;

use std::process;

pub fn main() {
    let exit_code = match cli::execute() {
        Ok(()) => 0,
        Err(err) => {
            appstats_log::ensure_error(&err);
            1
        }
    };

    process::exit(exit_code);
}
