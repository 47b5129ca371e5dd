//! Configuration for the appstats CLI and daemon.
//!
//! The configuration is read from `config.yml` in the config directory. Every section and every
//! field is optional, a missing file yields the defaults. Individual values can be overridden from
//! the command line through [`OverridableConfig`].

#![warn(missing_docs)]

mod config;

pub use self::config::*;
