use appstats_statsd::{CounterMetric, TimerMetric};

/// Counter metrics for the rollup engine.
pub enum RollupCounters {
    /// Number of measurements accepted by the writer.
    ///
    /// This metric is tagged with:
    ///  - `kind`: `c`, `ms` or `g`.
    MeasurementAccepted,
    /// Number of measurements dropped because of an invalid bucket name.
    MeasurementRejected,
    /// Number of log records written.
    LogAccepted,
    /// Number of individual upserts that failed.
    ///
    /// A single measurement fans out into several upserts, each of which is counted separately.
    UpsertFailed,
    /// Number of times a broken store connection was dropped to reconnect on next use.
    StoreReset,
}

impl CounterMetric for RollupCounters {
    fn name(&self) -> &'static str {
        match self {
            Self::MeasurementAccepted => "rollup.measurement.accepted",
            Self::MeasurementRejected => "rollup.measurement.rejected",
            Self::LogAccepted => "rollup.log.accepted",
            Self::UpsertFailed => "rollup.upsert.failed",
            Self::StoreReset => "rollup.store.reset",
        }
    }
}

/// Timer metrics for the rollup engine.
pub enum RollupTimers {
    /// Time spent writing all upserts of a single measurement.
    ///
    /// This metric is tagged with:
    ///  - `backend`: `memory` or `sqlite`.
    MeasurementWrite,
    /// Total time to answer a stats query, including the scan.
    ///
    /// This metric is tagged with:
    ///  - `period`: The requested granularity.
    QueryDuration,
}

impl TimerMetric for RollupTimers {
    fn name(&self) -> &'static str {
        match self {
            Self::MeasurementWrite => "rollup.measurement.write",
            Self::QueryDuration => "rollup.query.duration",
        }
    }
}
