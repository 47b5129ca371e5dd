//! Persistence of rollup documents and log records.
//!
//! The store exposes additive upserts, a sorted date-range scan and collection lookups over two
//! backends: an in-process [`MemoryStore`] and a [`SqliteStore`]. Both produce identical scan
//! orders so the query engine does not care which one it talks to.
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::migrate::MigrateError;
use tokio::sync::{Mutex, mpsc};

use crate::document::{CollectionName, RollupDocument, Scope};
use crate::encoder::WriteRequest;
use crate::logs::LogRecord;
use crate::statsd::RollupCounters;

mod memory;
mod sqlite;

pub use self::memory::MemoryStore;
pub use self::sqlite::SqliteStore;

/// An error returned by store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Connecting to the database failed.
    #[error("failed to set up the database: {0}")]
    Setup(sqlx::Error),

    /// The directory of the database file could not be created.
    #[error("failed to create the database directory: {0}")]
    Directory(std::io::Error),

    /// Applying migrations failed.
    #[error("error during the migration of the database: {0}")]
    Migration(MigrateError),

    /// A statement failed.
    #[error("database operation failed: {0}")]
    Query(sqlx::Error),

    /// A stored row could not be decoded.
    #[error("corrupt row in {collection}: {detail}")]
    Corrupt {
        /// The collection containing the row.
        collection: String,
        /// What was wrong with it.
        detail: String,
    },
}

impl StoreError {
    /// Returns `true` if the error indicates a broken connection rather than a bad statement.
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Setup(_) | Self::Directory(_) | Self::Migration(_) => true,
            Self::Query(error) => matches!(
                error,
                sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut
            ),
            Self::Corrupt { .. } => false,
        }
    }
}

/// The storage backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Keep everything in memory. Data is lost on restart.
    Memory,
    /// Persist to a SQLite database file.
    #[default]
    Sqlite,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Sqlite => f.write_str("sqlite"),
        }
    }
}

/// Configuration of the rollup store.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    /// The storage backend.
    ///
    /// Defaults to `sqlite`.
    pub backend: StoreBackend,
    /// Path to the database file for the `sqlite` backend.
    ///
    /// Relative paths are resolved against the config directory. Defaults to `appstats.db`.
    pub path: PathBuf,
    /// Maximum number of pooled database connections.
    ///
    /// Defaults to `4`.
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            path: PathBuf::from("appstats.db"),
            max_connections: 4,
        }
    }
}

/// Selects and orders documents for the read path.
#[derive(Clone, Debug)]
pub struct ScanFilter {
    /// The collection to scan.
    pub collection: CollectionName,
    /// Only documents on or after this date.
    pub since: NaiveDate,
    /// Only documents of this app.
    pub app: Option<String>,
    /// Equality filters on group fields.
    pub fields: BTreeMap<String, String>,
    /// Group fields to sort by after the date. [`APP_KEY`](crate::APP_KEY) sorts by app.
    pub sort: Vec<String>,
}

impl ScanFilter {
    /// Returns `true` if the document matches all conditions of this filter.
    pub(crate) fn matches(&self, document: &RollupDocument) -> bool {
        let key = &document.key;
        key.date >= self.since
            && self
                .app
                .as_deref()
                .is_none_or(|app| key.app.as_deref() == Some(app))
            && self
                .fields
                .iter()
                .all(|(name, value)| key.group_value(name) == Some(value.as_str()))
    }
}

/// Number of documents buffered ahead of a consumer by streaming scans.
const SCAN_BUFFER: usize = 64;

enum CursorInner {
    Buffered(std::vec::IntoIter<RollupDocument>),
    Streaming(mpsc::Receiver<Result<RollupDocument, StoreError>>),
}

/// Sorted stream of documents returned by [`RollupStore::scan`].
pub struct DocumentCursor(CursorInner);

impl DocumentCursor {
    fn buffered(documents: Vec<RollupDocument>) -> Self {
        Self(CursorInner::Buffered(documents.into_iter()))
    }

    fn streaming() -> (mpsc::Sender<Result<RollupDocument, StoreError>>, Self) {
        let (tx, rx) = mpsc::channel(SCAN_BUFFER);
        (tx, Self(CursorInner::Streaming(rx)))
    }

    /// Returns the next document, or `None` at the end of the scan.
    pub async fn try_next(&mut self) -> Result<Option<RollupDocument>, StoreError> {
        match &mut self.0 {
            CursorInner::Buffered(documents) => Ok(documents.next()),
            CursorInner::Streaming(rx) => rx.recv().await.transpose(),
        }
    }

    /// Drains the cursor into a vector.
    pub async fn collect(mut self) -> Result<Vec<RollupDocument>, StoreError> {
        let mut documents = Vec::new();
        while let Some(document) = self.try_next().await? {
            documents.push(document);
        }
        Ok(documents)
    }
}

impl fmt::Debug for DocumentCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            CursorInner::Buffered(documents) => f
                .debug_tuple("DocumentCursor::Buffered")
                .field(&documents.len())
                .finish(),
            CursorInner::Streaming(_) => f.write_str("DocumentCursor::Streaming"),
        }
    }
}

/// A connected rollup store.
///
/// Cloning is cheap and yields another handle to the same data, used to give every reader its own
/// session.
#[derive(Clone, Debug)]
pub enum RollupStore {
    /// In-process store.
    Memory(MemoryStore),
    /// SQLite backed store.
    Sqlite(SqliteStore),
}

impl RollupStore {
    /// Creates an empty in-memory store.
    pub fn memory() -> Self {
        Self::Memory(MemoryStore::new())
    }

    /// Opens a SQLite store, creating and migrating the database as needed.
    pub async fn sqlite(config: &StoreConfig) -> Result<Self, StoreError> {
        Ok(Self::Sqlite(SqliteStore::open(config).await?))
    }

    /// Returns the backend of this store.
    pub fn backend(&self) -> StoreBackend {
        match self {
            Self::Memory(_) => StoreBackend::Memory,
            Self::Sqlite(_) => StoreBackend::Sqlite,
        }
    }

    /// Creates the target document if missing and adds all increments to it.
    pub async fn upsert(&self, request: &WriteRequest) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => {
                store.upsert(request);
                Ok(())
            }
            Self::Sqlite(store) => store.upsert(request).await,
        }
    }

    /// Ensures the scan index of a collection exists.
    pub async fn ensure_index(
        &self,
        collection: &CollectionName,
        scope: Scope,
    ) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => {
                store.ensure_index(collection, scope);
                Ok(())
            }
            Self::Sqlite(store) => store.ensure_index(collection, scope).await,
        }
    }

    /// Returns `true` if any document was ever written to the collection.
    pub async fn collection_exists(&self, collection: &CollectionName) -> Result<bool, StoreError> {
        match self {
            Self::Memory(store) => Ok(store.collection_exists(collection)),
            Self::Sqlite(store) => store.collection_exists(collection).await,
        }
    }

    /// Returns all matching documents sorted by date, then the sort fields.
    ///
    /// Documents that compare equal on all sort keys come in a stable, backend specific order.
    pub async fn scan(&self, filter: ScanFilter) -> Result<DocumentCursor, StoreError> {
        match self {
            Self::Memory(store) => Ok(DocumentCursor::buffered(store.scan(&filter))),
            Self::Sqlite(store) => Ok(store.scan(filter)),
        }
    }

    /// Stores a log record.
    pub async fn insert_log(&self, record: &LogRecord) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => {
                store.insert_log(record);
                Ok(())
            }
            Self::Sqlite(store) => store.insert_log(record).await,
        }
    }

    /// Returns the `limit` most recent log records, newest first.
    pub async fn recent_logs(&self, limit: usize) -> Result<Vec<LogRecord>, StoreError> {
        match self {
            Self::Memory(store) => Ok(store.recent_logs(limit)),
            Self::Sqlite(store) => store.recent_logs(limit).await,
        }
    }

    /// Closes all connections. Further operations on clones fail.
    pub async fn close(&self) {
        if let Self::Sqlite(store) = self {
            store.close().await;
        }
    }
}

/// Lazily connected handle to the configured [`RollupStore`].
///
/// The connection is established on first use and reused afterwards. After a connection error,
/// [`reset`](Self::reset) drops the connection so the next [`connect`](Self::connect) tries again.
/// There is no backoff and no background health check.
#[derive(Debug)]
pub struct StoreClient {
    config: StoreConfig,
    store: Mutex<Option<RollupStore>>,
}

impl StoreClient {
    /// Creates a client without connecting.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            store: Mutex::new(None),
        }
    }

    /// Creates a client around an already connected store.
    pub fn from_store(store: RollupStore) -> Self {
        let config = StoreConfig {
            backend: store.backend(),
            ..StoreConfig::default()
        };

        Self {
            config,
            store: Mutex::new(Some(store)),
        }
    }

    /// Returns the configured backend.
    pub fn backend(&self) -> StoreBackend {
        self.config.backend
    }

    /// Returns a session on the store, connecting first if necessary.
    pub async fn connect(&self) -> Result<RollupStore, StoreError> {
        let mut guard = self.store.lock().await;
        if let Some(store) = guard.as_ref() {
            return Ok(store.clone());
        }

        appstats_log::debug!(backend = %self.config.backend, "connecting to store");
        let store = match self.config.backend {
            StoreBackend::Memory => RollupStore::memory(),
            StoreBackend::Sqlite => RollupStore::sqlite(&self.config).await?,
        };

        *guard = Some(store.clone());
        Ok(store)
    }

    /// Drops a broken connection so the next use reconnects.
    ///
    /// In-memory stores are never dropped, since that would discard their data.
    pub async fn reset(&self) {
        let mut guard = self.store.lock().await;
        if !matches!(*guard, Some(RollupStore::Sqlite(_))) {
            return;
        }

        if let Some(store) = guard.take() {
            appstats_statsd::metric!(counter(RollupCounters::StoreReset) += 1);
            store.close().await;
        }
    }

    /// Closes the connection, if any.
    pub async fn close(&self) {
        if let Some(store) = self.store.lock().await.take() {
            store.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, TimeZone, Utc};

    use super::*;
    use crate::bucket::BucketPath;
    use crate::document::{APP_KEY, Slot};
    use crate::encoder::encode;
    use crate::logs::LogLevel;
    use crate::protocol::MeasurementKind;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 10, 19, 14, 37, 0).unwrap()
    }

    async fn write(store: &RollupStore, bucket: &str, value: f64, at: DateTime<Utc>) {
        let path = BucketPath::parse(bucket).unwrap();
        for request in encode(MeasurementKind::Counter, &path, value, at).unwrap() {
            store.upsert(&request).await.unwrap();
        }
    }

    fn filter(collection: &str, sort: &[&str]) -> ScanFilter {
        ScanFilter {
            collection: CollectionName::root().join(collection),
            since: NaiveDate::from_ymd_opt(2024, 10, 1).unwrap(),
            app: None,
            fields: BTreeMap::new(),
            sort: sort.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    async fn open_sqlite(dir: &tempfile::TempDir) -> RollupStore {
        let config = StoreConfig {
            backend: StoreBackend::Sqlite,
            path: dir.path().join("nested").join("rollups.db"),
            max_connections: 2,
        };
        RollupStore::sqlite(&config).await.unwrap()
    }

    /// Runs the same assertions against both backends.
    async fn check_backend(store: RollupStore) {
        let yesterday = now() - chrono::Duration::days(1);

        write(&store, "web.route#/b.count", 1.0, now()).await;
        write(&store, "web.route#/a.count", 2.0, now()).await;
        write(&store, "api.route#/a.count", 4.0, now()).await;
        write(&store, "web.route#/b.count", 8.0, yesterday).await;
        write(&store, "web.route#/b.count", 16.0, yesterday).await;

        let route = CollectionName::root().join("route");
        assert!(store.collection_exists(&route).await.unwrap());
        assert!(store.collection_exists(&route.scoped(Scope::App)).await.unwrap());
        assert!(!store
            .collection_exists(&CollectionName::root().join("missing"))
            .await
            .unwrap());

        store.ensure_index(&route, Scope::Global).await.unwrap();
        store.ensure_index(&route, Scope::Global).await.unwrap();

        let documents = store
            .scan(filter("route", &["route"]))
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();

        let summary: Vec<_> = documents
            .iter()
            .map(|d| {
                (
                    d.key.date.to_string(),
                    d.key.group_value("route").unwrap_or_default().to_owned(),
                    d.day["c_count"],
                )
            })
            .collect();

        assert_eq!(
            summary,
            [
                ("2024-10-18".to_owned(), "/b".to_owned(), 24.0),
                ("2024-10-19".to_owned(), "/a".to_owned(), 6.0),
                ("2024-10-19".to_owned(), "/b".to_owned(), 1.0),
            ]
        );
        assert_eq!(documents[1].slot(Slot::Minute(14, 30)).unwrap()["c_count"], 6.0);

        // app scoped, filtered and sorted by app
        let mut app_filter = filter("route_app", &[APP_KEY]);
        app_filter.fields.insert("route".to_owned(), "/a".to_owned());
        app_filter.since = now().date_naive();
        let documents = store.scan(app_filter).await.unwrap().collect().await.unwrap();
        let apps: Vec<_> = documents.iter().map(|d| d.key.app.clone()).collect();
        assert_eq!(apps, [Some("api".to_owned()), Some("web".to_owned())]);

        let mut web_filter = filter("route_app", &[]);
        web_filter.app = Some("web".to_owned());
        let documents = store.scan(web_filter).await.unwrap().collect().await.unwrap();
        assert_eq!(documents.len(), 3);
        assert!(documents.iter().all(|d| d.key.app.as_deref() == Some("web")));

        // logs
        for (index, level) in [LogLevel::Error, LogLevel::Info, LogLevel::Debug].into_iter().enumerate() {
            store
                .insert_log(&LogRecord {
                    timestamp: now() + chrono::Duration::seconds(index as i64),
                    level,
                    app: "web".to_owned(),
                    message_id: format!("m{index}"),
                    message: "hello: world".to_owned(),
                })
                .await
                .unwrap();
        }

        let logs = store.recent_logs(2).await.unwrap();
        let ids: Vec<_> = logs.iter().map(|l| l.message_id.as_str()).collect();
        assert_eq!(ids, ["m2", "m1"]);
        assert_eq!(logs[0].level, LogLevel::Debug);
        assert_eq!(logs[0].timestamp, now() + chrono::Duration::seconds(2));
    }

    #[tokio::test]
    async fn test_memory_backend() {
        check_backend(RollupStore::memory()).await;
    }

    #[tokio::test]
    async fn test_sqlite_backend() {
        let dir = tempfile::tempdir().unwrap();
        check_backend(open_sqlite(&dir).await).await;
    }

    #[tokio::test]
    async fn test_sqlite_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();

        let store = open_sqlite(&dir).await;
        write(&store, "web.route.count", 3.0, now()).await;
        store.close().await;

        let store = open_sqlite(&dir).await;
        write(&store, "web.route.count", 3.0, now()).await;

        let documents = store
            .scan(filter("route", &[]))
            .await
            .unwrap()
            .collect()
            .await
            .unwrap();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].day["c_count"], 6.0);
    }

    #[tokio::test]
    async fn test_client_reconnects_after_reset() {
        let dir = tempfile::tempdir().unwrap();
        let client = StoreClient::new(StoreConfig {
            backend: StoreBackend::Sqlite,
            path: dir.path().join("client.db"),
            max_connections: 1,
        });

        let store = client.connect().await.unwrap();
        write(&store, "web.route.count", 1.0, now()).await;

        client.reset().await;
        assert!(store.collection_exists(&CollectionName::root()).await.is_err());

        let store = client.connect().await.unwrap();
        let route = CollectionName::root().join("route");
        assert!(store.collection_exists(&route).await.unwrap());
    }

    #[tokio::test]
    async fn test_client_keeps_memory_store() {
        let client = StoreClient::new(StoreConfig {
            backend: StoreBackend::Memory,
            ..Default::default()
        });

        let store = client.connect().await.unwrap();
        write(&store, "web.route.count", 1.0, now()).await;

        client.reset().await;
        let store = client.connect().await.unwrap();
        let route = CollectionName::root().join("route");
        assert!(store.collection_exists(&route).await.unwrap());
    }
}
