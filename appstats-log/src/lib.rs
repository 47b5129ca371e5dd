//! Logging facade for appstats.
//!
//! # Setup
//!
//! To enable logging, invoke [`init`] with a [`LogConfig`]. The configuration implements `serde`
//! traits, so it is usually read from the `logging` section of the config file.
//!
//! ```ignore
//! let config = appstats_log::LogConfig {
//!     enable_backtraces: true,
//!     ..Default::default()
//! };
//!
//! appstats_log::init(&config);
//! ```
//!
//! # Logging
//!
//! Use the re-exported `tracing` macros: [`error!`], [`warn!`], [`info!`], [`debug!`] and
//! [`trace!`].
//!
//! ## Conventions
//!
//! Log messages start lowercase and end without punctuation. Errors are attached as structured
//! fields rather than formatted into the message:
//!
//! ```
//! use std::error::Error;
//!
//! let error = std::io::Error::other("disk on fire");
//! appstats_log::error!(error = &error as &dyn Error, "failed to write rollup");
//! ```
//!
//! # Testing
//!
//! Call [`init_test!`] at the start of a test to route logs of the calling crate into the test
//! runner's captured output.

#![warn(missing_docs)]

#[cfg(feature = "init")]
mod setup;
#[cfg(feature = "init")]
pub use setup::*;

#[cfg(feature = "test")]
mod test;
#[cfg(feature = "test")]
pub use test::*;

mod level;
pub use level::*;

mod utils;
pub use utils::*;

#[doc(inline)]
pub use tracing::{Level, debug, error, info, trace, warn};
