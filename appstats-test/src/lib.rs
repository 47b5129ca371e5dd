//! Helpers for testing the services and the HTTP API.
//!
//! In every test, call [`setup`]. This sets up the logger so that all console output is captured
//! by the test runner. All logs emitted with [`appstats_log`] show up for test failures or when
//! run with `--nocapture`.
//!
//! # Example
//!
//! ```no_run
//! #[test]
//! fn my_test() {
//!     appstats_test::setup();
//!
//!     appstats_log::debug!("hello, world!");
//! }
//! ```

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the calling crate and mutes all other
///    logs.
pub fn setup() {
    appstats_log::init_test!();
}
