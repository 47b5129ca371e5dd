//! The single writer draining the ingestion queue.
//!
//! Producers send [`IngestMessage`]s to the [`Addr`](appstats_system::Addr) returned by
//! [`RollupWriter::start`]. The queue is bounded, so producers wait when the writer falls behind.
//! All store mutations happen sequentially on the writer's task.
use std::error::Error;
use std::sync::Arc;
use std::time::Instant;

use appstats_system::{Controller, Receiver, Service, Shutdown};
use chrono::Utc;
use tokio::task::JoinHandle;

use crate::bucket::BucketPath;
use crate::encoder::encode;
use crate::logs::LogRecord;
use crate::protocol::Measurement;
use crate::statsd::{RollupCounters, RollupTimers};
use crate::store::{RollupStore, StoreClient};

/// Default capacity of the ingestion queue.
pub const DEFAULT_QUEUE_SIZE: usize = 1000;

/// A unit of work for the [`RollupWriter`].
#[derive(Clone, Debug, PartialEq)]
pub enum IngestMessage {
    /// A decoded measurement.
    Measurement(Measurement),
    /// A parsed log line.
    Log(LogRecord),
}

impl From<Measurement> for IngestMessage {
    fn from(measurement: Measurement) -> Self {
        Self::Measurement(measurement)
    }
}

impl From<LogRecord> for IngestMessage {
    fn from(record: LogRecord) -> Self {
        Self::Log(record)
    }
}

/// Writes measurements and log records to the rollup store.
///
/// Failures are logged and counted but never reported back to producers. A failed upsert does
/// not abort the remaining upserts of the same measurement.
#[derive(Debug)]
pub struct RollupWriter {
    store: Arc<StoreClient>,
    error_statistics: bool,
}

impl RollupWriter {
    /// Creates a writer on the given store.
    ///
    /// With `error_statistics`, error and warning log records are also counted as
    /// `<app>.error.ct` and `<app>.error.wct`.
    pub fn new(store: Arc<StoreClient>, error_statistics: bool) -> Self {
        Self {
            store,
            error_statistics,
        }
    }

    async fn connect(&self) -> Option<RollupStore> {
        match self.store.connect().await {
            Ok(store) => Some(store),
            Err(err) => {
                appstats_log::error!(
                    error = &err as &dyn Error,
                    "failed to connect to the rollup store"
                );
                None
            }
        }
    }

    async fn handle_message(&self, message: IngestMessage) {
        match message {
            IngestMessage::Measurement(measurement) => self.write_measurement(measurement).await,
            IngestMessage::Log(record) => self.write_log(record).await,
        }
    }

    async fn write_measurement(&self, measurement: Measurement) {
        let requests = match BucketPath::parse(&measurement.bucket)
            .and_then(|path| encode(measurement.kind, &path, measurement.value, Utc::now()))
        {
            Ok(requests) => requests,
            Err(err) => {
                appstats_log::debug!(
                    error = &err as &dyn Error,
                    bucket = %measurement.bucket,
                    "dropping measurement"
                );
                appstats_statsd::metric!(counter(RollupCounters::MeasurementRejected) += 1);
                return;
            }
        };

        let started = Instant::now();
        for request in &requests {
            let Some(store) = self.connect().await else {
                appstats_statsd::metric!(counter(RollupCounters::UpsertFailed) += 1);
                continue;
            };

            if let Err(err) = store.upsert(request).await {
                appstats_log::error!(
                    error = &err as &dyn Error,
                    collection = %request.collection,
                    "failed to upsert rollup"
                );
                appstats_statsd::metric!(counter(RollupCounters::UpsertFailed) += 1);

                if err.is_connection_error() {
                    self.store.reset().await;
                }
            }
        }

        appstats_statsd::metric!(
            timer(RollupTimers::MeasurementWrite) = started.elapsed(),
            backend = self.store.backend().to_string().as_str(),
        );
        appstats_statsd::metric!(
            counter(RollupCounters::MeasurementAccepted) += 1,
            kind = measurement.kind.as_str(),
        );
    }

    async fn write_log(&self, record: LogRecord) {
        let statistic = self
            .error_statistics
            .then(|| record.error_statistic())
            .flatten();

        if let Some(store) = self.connect().await {
            match store.insert_log(&record).await {
                Ok(()) => appstats_statsd::metric!(counter(RollupCounters::LogAccepted) += 1),
                Err(err) => {
                    appstats_log::error!(error = &err as &dyn Error, "failed to store log record");
                    if err.is_connection_error() {
                        self.store.reset().await;
                    }
                }
            }
        }

        if let Some(measurement) = statistic {
            self.write_measurement(measurement).await;
        }
    }

    /// Drains what is already queued, bounded by the shutdown timeout.
    async fn handle_shutdown(&self, rx: &mut Receiver<IngestMessage>, shutdown: Shutdown) {
        rx.close();

        let drain = async {
            let mut drained = 0usize;
            while let Some(message) = rx.recv().await {
                self.handle_message(message).await;
                drained += 1;
            }
            drained
        };

        match shutdown.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, drain).await {
                Ok(drained) => appstats_log::debug!(drained, "ingestion queue drained"),
                Err(_) => appstats_log::warn!("shutdown timeout reached, dropping queued writes"),
            },
            None => {
                let drained = drain.await;
                appstats_log::debug!(drained, "ingestion queue drained");
            }
        }
    }
}

impl Service for RollupWriter {
    type Interface = IngestMessage;

    fn spawn_handler(self, mut rx: Receiver<Self::Interface>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut shutdown = Controller::shutdown_handle();
            appstats_log::info!("rollup writer started");

            loop {
                tokio::select! {
                    biased;

                    message = rx.recv() => match message {
                        Some(message) => self.handle_message(message).await,
                        None => break,
                    },
                    shutdown = shutdown.notified() => {
                        self.handle_shutdown(&mut rx, shutdown).await;
                        break;
                    }
                }
            }

            appstats_log::info!("rollup writer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use appstats_system::ServiceRunner;

    use super::*;
    use crate::collector::Granularity;
    use crate::document::{CollectionName, Scope};
    use crate::logs::LogLevel;
    use crate::protocol::MeasurementKind;
    use crate::query::{Query, QueryResult, execute};

    fn record(level: LogLevel) -> LogRecord {
        LogRecord {
            timestamp: Utc::now(),
            level,
            app: "web".to_owned(),
            message_id: "db".to_owned(),
            message: "connection lost".to_owned(),
        }
    }

    /// Sums today and yesterday, so writes from just before midnight are still counted.
    async fn recent_total(store: &RollupStore, process: &str, field: &str) -> f64 {
        let query = Query {
            amount: 2,
            period: Granularity::Day,
            ..Query::new(process, vec![field.to_owned()])
        };
        match execute(store, &query, Utc::now()).await.unwrap() {
            QueryResult::Series(series) => series.points().iter().map(|p| p.values[field]).sum(),
            QueryResult::Grouped(_) => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_writes_measurements_in_order() {
        appstats_test::setup();

        let store = RollupStore::memory();
        let client = Arc::new(StoreClient::from_store(store.clone()));
        let writer = RollupWriter::new(client, false);

        let messages = [
            Measurement::counter("web.route#/login.count", 1.0),
            Measurement::counter("_invalid.route.count", 100.0),
            Measurement::counter("web.route#/login.count", 2.0),
            Measurement {
                kind: MeasurementKind::Timer,
                bucket: "web.route.time".to_owned(),
                value: 40.0,
            },
        ];
        for message in messages {
            writer.handle_message(message.into()).await;
        }

        assert_eq!(recent_total(&store, "route", "c_count").await, 3.0);
        assert_eq!(recent_total(&store, "route", "tc_time").await, 1.0);
        assert_eq!(recent_total(&store, "route", "t_time").await, 40.0);
    }

    #[tokio::test]
    async fn test_error_statistics() {
        let store = RollupStore::memory();
        let client = Arc::new(StoreClient::from_store(store.clone()));
        let writer = RollupWriter::new(client, true);

        for level in [LogLevel::Critical, LogLevel::Error, LogLevel::Warning, LogLevel::Info] {
            writer.handle_message(record(level).into()).await;
        }

        assert_eq!(store.recent_logs(10).await.unwrap().len(), 4);
        assert_eq!(recent_total(&store, "error", "c_ct").await, 2.0);
        assert_eq!(recent_total(&store, "error", "c_wct").await, 1.0);
    }

    #[tokio::test]
    async fn test_error_statistics_disabled() {
        let store = RollupStore::memory();
        let client = Arc::new(StoreClient::from_store(store.clone()));
        let writer = RollupWriter::new(client, false);

        writer.handle_message(record(LogLevel::Error).into()).await;

        let collection = CollectionName::for_process("error", Scope::Global);
        assert!(!store.collection_exists(&collection).await.unwrap());
    }

    #[tokio::test]
    async fn test_service_processes_queue() {
        let store = RollupStore::memory();
        let client = Arc::new(StoreClient::from_store(store.clone()));
        let mut runner = ServiceRunner::new();
        let addr = runner.start(RollupWriter::new(client, false), DEFAULT_QUEUE_SIZE);

        for _ in 0..10 {
            addr.send(Measurement::counter("web.route.count", 1.0).into())
                .await
                .unwrap();
        }

        // The writer stops once every address is gone and the queue is empty.
        drop(addr);
        runner.join().await;

        assert_eq!(recent_total(&store, "route", "c_count").await, 10.0);
    }

    #[test]
    fn test_rejected_bucket_metric() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        let client = Arc::new(StoreClient::from_store(RollupStore::memory()));
        let writer = RollupWriter::new(client, false);

        let captures = appstats_statsd::with_capturing_test_client(|| {
            runtime.block_on(writer.handle_message(Measurement::counter("web.count", 1.0).into()));
        });

        assert_eq!(captures, ["rollup.measurement.rejected:1|c"]);
    }
}
