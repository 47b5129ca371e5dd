//! Foundational system components for the appstats services.
//!
//! Every long running part of the daemon (the rollup writer, the listeners, the HTTP server) is a
//! [`Service`] with a bounded inbox. Services stop when the [`Controller`] broadcasts a
//! [`Shutdown`].
#![warn(missing_docs)]

mod controller;
mod service;
mod statsd;

pub use self::controller::*;
pub use self::service::*;
