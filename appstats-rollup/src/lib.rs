//! Rollup storage engine for measurements and logs.
//!
//! Measurements are named by a dotted bucket path, `APP.DIMENSION[#PARAM...]....FIELD`. Each
//! measurement is folded into one rollup document per dimension prefix, both globally and per
//! app. Documents are per date and hold cumulative values for the day, every hour and every
//! quarter hour. Queries read these documents back and rebuild dense, zero-filled series.
//!
//! # Write Path
//!
//! 1. [`BucketPath::parse`] splits and validates the bucket name.
//! 2. [`encode`] fans the measurement out into [`WriteRequest`]s.
//! 3. [`RollupStore::upsert`] adds the increments to the stored documents.
//!
//! The [`RollupWriter`] service runs these steps for every message of its bounded queue.
//!
//! ```
//! use appstats_rollup::{BucketPath, MeasurementKind, encode};
//!
//! let path = BucketPath::parse("web.route#/login#GET.ctrl.count").unwrap();
//! let requests = encode(MeasurementKind::Counter, &path, 1.0, chrono::Utc::now()).unwrap();
//!
//! let collections: Vec<_> = requests.iter().map(|r| r.collection.as_str()).collect();
//! assert_eq!(collections, ["_a_route", "_a_route_app", "_a_route_ctrl", "_a_route_ctrl_app"]);
//! ```
//!
//! # Read Path
//!
//! [`execute`] scans a collection from the start of the requested range, feeds every document
//! into a [`PeriodCollector`] per group and returns a [`QueryResult`].

#![warn(missing_docs)]

mod bucket;
mod collector;
mod document;
mod encoder;
mod logs;
mod pipeline;
mod protocol;
mod query;
mod statsd;
mod store;

pub use self::bucket::*;
pub use self::collector::*;
pub use self::document::*;
pub use self::encoder::*;
pub use self::logs::*;
pub use self::pipeline::*;
pub use self::protocol::*;
pub use self::query::*;
pub use self::store::*;
