//! The appstats daemon.
//!
//! This crate hosts the network collaborators around the rollup engine:
//!
//!  - The statsd listener receives measurements as UDP datagrams of statsd lines, for example
//!    `web.route#/login.count:1|c`.
//!  - The log listener receives log lines as UDP datagrams, `APP:LEVEL:MESSAGEID:MESSAGE`.
//!  - The HTTP server answers time-series queries on `/api/stats/{process}` and serves the most
//!    recent log records on `/api/log`.
//!
//! Both listeners decode every datagram on its own task and enqueue the results on the bounded
//! ingestion queue of a single [`RollupWriter`](appstats_rollup::RollupWriter). When the queue is
//! full, the decoding tasks wait.
//!
//! The entry point is [`run`], which blocks until a shutdown signal is received.
#![warn(missing_docs)]

mod constants;
mod endpoints;
mod middlewares;
mod service;
mod services;
mod statsd;
mod utils;

use std::sync::Arc;

use anyhow::Context;
use appstats_config::Config;
use appstats_system::{Controller, Service, ServiceRunner};

pub use self::service::*;
pub use self::services::{HttpServer, LogListener, ServerError, StatsdListener};

/// Runs the appstats daemon and all of its services.
///
/// This boots the entire server application. It blocks the current thread until a shutdown
/// signal is received or a fatal error happens. Failure to bind any of the listening sockets is
/// fatal.
pub fn run(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("appstats-worker")
        .enable_all()
        .build()
        .context("failed to create the tokio runtime")?;

    runtime.block_on(async {
        Controller::start(config.shutdown_timeout());

        let mut runner = ServiceRunner::new();
        let state = ServiceState::start(config.clone(), &mut runner);

        let statsd = StatsdListener::new(&config, state.ingest().clone())?;
        let logs = LogListener::new(&config, state.ingest().clone())?;
        let server = HttpServer::new(config.clone(), state.clone())?;

        runner.start(statsd, 1);
        runner.start(logs, 1);
        runner.start(server, 1);

        runner.join().await;
        state.store().close().await;

        anyhow::Ok(())
    })?;

    appstats_log::info!("shutdown complete");
    Ok(())
}
