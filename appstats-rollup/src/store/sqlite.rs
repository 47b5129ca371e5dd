use std::collections::BTreeSet;
use std::error::Error;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate};
use futures::TryStreamExt;
use parking_lot::Mutex;
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::{Pool, QueryBuilder, Row, Sqlite};
use tokio::fs::DirBuilder;

use crate::document::{
    APP_KEY, CollectionName, DATE_FORMAT, DocumentKey, GroupFields, RollupDocument, Scope, Slot,
};
use crate::encoder::WriteRequest;
use crate::logs::{LogLevel, LogRecord};
use crate::store::{DocumentCursor, ScanFilter, StoreConfig, StoreError};

/// Stores documents in a SQLite database.
///
/// Every field of every slot is one row in the `rollups` table, so an upsert is a single
/// `INSERT ... ON CONFLICT DO UPDATE` that adds to existing values. Scans read rows back in key
/// order and reassemble them into documents.
#[derive(Clone, Debug)]
pub struct SqliteStore {
    db: Pool<Sqlite>,
    indexed: Arc<Mutex<BTreeSet<CollectionName>>>,
}

impl SqliteStore {
    /// Opens the database at the configured path and runs all migrations.
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let path = &config.path;
        appstats_log::info!("rollup database {}", path.display());

        Self::create_directory(path).await?;

        let options = SqliteConnectOptions::new()
            .filename(path)
            // Readers do not block the single writer.
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .create_if_missing(true);

        let db = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(StoreError::Setup)?;

        sqlx::migrate!("../migrations")
            .run(&db)
            .await
            .map_err(StoreError::Migration)?;

        Ok(Self {
            db,
            indexed: Arc::default(),
        })
    }

    async fn create_directory(path: &Path) -> Result<(), StoreError> {
        let Some(parent) = path.parent() else {
            return Ok(());
        };

        if !parent.as_os_str().is_empty() && !parent.exists() {
            appstats_log::debug!("creating directory for database: {}", parent.display());
            DirBuilder::new()
                .recursive(true)
                .create(&parent)
                .await
                .map_err(StoreError::Directory)?;
        }

        Ok(())
    }

    pub(super) async fn upsert(&self, request: &WriteRequest) -> Result<(), StoreError> {
        if request.increments.is_empty() {
            return Ok(());
        }

        let mut tx = self.db.begin().await.map_err(StoreError::Query)?;

        build_register_collection(&request.collection, request.scope)
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Query)?;

        build_upsert_rollups(request)
            .build()
            .execute(&mut *tx)
            .await
            .map_err(StoreError::Query)?;

        tx.commit().await.map_err(StoreError::Query)
    }

    pub(super) async fn ensure_index(
        &self,
        collection: &CollectionName,
        scope: Scope,
    ) -> Result<(), StoreError> {
        if self.indexed.lock().contains(collection) {
            return Ok(());
        }

        let statement = match scope {
            Scope::Global => "CREATE INDEX IF NOT EXISTS rollups_by_date ON rollups (collection, date)",
            Scope::App => {
                "CREATE INDEX IF NOT EXISTS rollups_by_date_app ON rollups (collection, date, app)"
            }
        };

        appstats_log::debug!(%collection, "indexing collection");
        sqlx::query(statement)
            .execute(&self.db)
            .await
            .map_err(StoreError::Query)?;

        self.indexed.lock().insert(collection.clone());
        Ok(())
    }

    pub(super) async fn collection_exists(
        &self,
        collection: &CollectionName,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query("SELECT 1 FROM collections WHERE name = ?")
            .bind(collection.as_str())
            .fetch_optional(&self.db)
            .await
            .map_err(StoreError::Query)?;

        Ok(row.is_some())
    }

    /// Streams the scan from a background task, one document at a time.
    pub(super) fn scan(&self, filter: ScanFilter) -> DocumentCursor {
        let (tx, cursor) = DocumentCursor::streaming();
        let db = self.db.clone();

        tokio::spawn(async move {
            let collection = filter.collection.as_str().to_owned();
            let mut builder = build_scan(&filter);
            let mut rows = builder.build().fetch(&db);

            let mut current: Option<(RowKey, RollupDocument)> = None;
            loop {
                let row = match rows.try_next().await {
                    Ok(Some(row)) => row,
                    Ok(None) => break,
                    Err(err) => {
                        appstats_log::error!(
                            error = &err as &dyn Error,
                            collection = %collection,
                            "failed to scan rollups",
                        );
                        tx.send(Err(StoreError::Query(err))).await.ok();
                        return;
                    }
                };

                let cell = match extract_cell(&row, &collection) {
                    Ok(cell) => cell,
                    Err(err) => {
                        tx.send(Err(err)).await.ok();
                        return;
                    }
                };

                if let Some((key, document)) = current.as_mut() {
                    if *key == cell.key {
                        document.add(cell.slot, &cell.field, cell.value);
                        continue;
                    }
                }

                let mut document = match cell.key.decode(&collection) {
                    Ok(key) => RollupDocument::new(key),
                    Err(err) => {
                        tx.send(Err(err)).await.ok();
                        return;
                    }
                };
                document.add(cell.slot, &cell.field, cell.value);

                if let Some((_, finished)) = current.replace((cell.key, document)) {
                    if tx.send(Ok(finished)).await.is_err() {
                        // The reader went away.
                        return;
                    }
                }
            }

            if let Some((_, document)) = current {
                tx.send(Ok(document)).await.ok();
            }
        });

        cursor
    }

    pub(super) async fn insert_log(&self, record: &LogRecord) -> Result<(), StoreError> {
        build_insert_log(record)
            .execute(&self.db)
            .await
            .map_err(StoreError::Query)?;
        Ok(())
    }

    pub(super) async fn recent_logs(&self, limit: usize) -> Result<Vec<LogRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT timestamp, level, app, message_id, message FROM logs
             ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.db)
        .await
        .map_err(StoreError::Query)?;

        rows.iter().map(extract_log).collect()
    }

    pub(super) async fn close(&self) {
        self.db.close().await;
    }
}

/// The raw document key columns of a row.
#[derive(Debug, PartialEq)]
struct RowKey {
    date: String,
    app: String,
    fields: String,
}

impl RowKey {
    fn decode(&self, collection: &str) -> Result<DocumentKey, StoreError> {
        let corrupt = |detail: String| StoreError::Corrupt {
            collection: collection.to_owned(),
            detail,
        };

        let date = NaiveDate::parse_from_str(&self.date, DATE_FORMAT)
            .map_err(|err| corrupt(format!("invalid date {:?}: {err}", self.date)))?;
        let groups = GroupFields::from_json(&self.fields)
            .map_err(|err| corrupt(format!("invalid group fields: {err}")))?;
        let app = (!self.app.is_empty()).then(|| self.app.clone());

        Ok(DocumentKey { date, app, groups })
    }
}

/// A single field value of a document.
struct Cell {
    key: RowKey,
    slot: Slot,
    field: String,
    value: f64,
}

fn extract_cell(row: &SqliteRow, collection: &str) -> Result<Cell, StoreError> {
    let key = RowKey {
        date: row.try_get("date").map_err(StoreError::Query)?,
        app: row.try_get("app").map_err(StoreError::Query)?,
        fields: row.try_get("fields").map_err(StoreError::Query)?,
    };

    let hour: i64 = row.try_get("hour").map_err(StoreError::Query)?;
    let minute: i64 = row.try_get("minute").map_err(StoreError::Query)?;
    let slot = Slot::from_columns(hour, minute).ok_or_else(|| StoreError::Corrupt {
        collection: collection.to_owned(),
        detail: format!("invalid slot {hour}:{minute}"),
    })?;

    Ok(Cell {
        key,
        slot,
        field: row.try_get("field").map_err(StoreError::Query)?,
        value: row.try_get("value").map_err(StoreError::Query)?,
    })
}

fn extract_log(row: &SqliteRow) -> Result<LogRecord, StoreError> {
    let corrupt = |detail: String| StoreError::Corrupt {
        collection: "logs".to_owned(),
        detail,
    };

    let timestamp: i64 = row.try_get("timestamp").map_err(StoreError::Query)?;
    let timestamp = DateTime::from_timestamp_millis(timestamp)
        .ok_or_else(|| corrupt(format!("invalid timestamp {timestamp}")))?;

    let level: i64 = row.try_get("level").map_err(StoreError::Query)?;
    let level = LogLevel::try_from(level).map_err(|err| corrupt(err.to_string()))?;

    Ok(LogRecord {
        timestamp,
        level,
        app: row.try_get("app").map_err(StoreError::Query)?,
        message_id: row.try_get("message_id").map_err(StoreError::Query)?,
        message: row.try_get("message").map_err(StoreError::Query)?,
    })
}

/// Path expression selecting a group field from the `fields` column.
fn json_path(name: &str) -> String {
    format!("$.\"{name}\"")
}

/// Records that a collection has been written to.
fn build_register_collection<'a>(
    collection: &'a CollectionName,
    scope: Scope,
) -> Query<'a, Sqlite, SqliteArguments<'a>> {
    sqlx::query("INSERT INTO collections (name, scoped) VALUES (?, ?) ON CONFLICT (name) DO NOTHING")
        .bind(collection.as_str())
        .bind(scope == Scope::App)
}

/// Builds an additive upsert of all increments of a request.
fn build_upsert_rollups(request: &WriteRequest) -> QueryBuilder<'static, Sqlite> {
    let collection = request.collection.as_str().to_owned();
    let fields = request.key.groups.to_json();
    let app = request.key.app.clone().unwrap_or_default();
    let date = request.key.date.format(DATE_FORMAT).to_string();

    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "INSERT INTO rollups (collection, fields, app, date, hour, minute, field, value) ",
    );

    builder.push_values(request.increments.iter(), |mut b, increment| {
        let (hour, minute) = increment.slot.columns();
        b.push_bind(collection.clone())
            .push_bind(fields.clone())
            .push_bind(app.clone())
            .push_bind(date.clone())
            .push_bind(hour)
            .push_bind(minute)
            .push_bind(increment.field.clone())
            .push_bind(increment.value);
    });

    builder.push(
        " ON CONFLICT (collection, fields, app, date, hour, minute, field) \
         DO UPDATE SET value = rollups.value + excluded.value",
    );

    builder
}

/// Builds the scan query, ordered so that all rows of a document are adjacent.
fn build_scan(filter: &ScanFilter) -> QueryBuilder<'static, Sqlite> {
    let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT date, app, fields, hour, minute, field, value FROM rollups WHERE collection = ",
    );
    builder.push_bind(filter.collection.as_str().to_owned());

    builder.push(" AND date >= ");
    builder.push_bind(filter.since.format(DATE_FORMAT).to_string());

    if let Some(app) = &filter.app {
        builder.push(" AND app = ");
        builder.push_bind(app.clone());
    }

    for (name, value) in &filter.fields {
        builder.push(" AND json_extract(fields, ");
        builder.push_bind(json_path(name));
        builder.push(") = ");
        builder.push_bind(value.clone());
    }

    builder.push(" ORDER BY date");
    for name in &filter.sort {
        if name == APP_KEY {
            builder.push(", app");
        } else {
            builder.push(", json_extract(fields, ");
            builder.push_bind(json_path(name));
            builder.push(")");
        }
    }
    builder.push(", app, fields, hour, minute");

    builder
}

fn build_insert_log(record: &LogRecord) -> Query<'_, Sqlite, SqliteArguments<'_>> {
    sqlx::query(
        "INSERT INTO logs (timestamp, level, app, message_id, message) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(record.timestamp.timestamp_millis())
    .bind(i64::from(record.level.as_u8()))
    .bind(record.app.as_str())
    .bind(record.message_id.as_str())
    .bind(record.message.as_str())
}
