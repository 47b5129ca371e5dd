//! The read path: turns stored rollups back into dense time series.
use std::collections::BTreeMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;

use crate::bucket::{is_valid_name, is_valid_value_name};
use crate::collector::{
    CollectorError, Granularity, PeriodCollector, PeriodCollectorBuilder, Series, range_start,
};
use crate::document::{APP_KEY, CollectionName, RollupDocument, Scope};
use crate::statsd::RollupTimers;
use crate::store::{RollupStore, ScanFilter, StoreError};

/// Token that matches any app, or groups by app when used as a group name.
pub const ANY_TOKEN: &str = "*";

/// Largest number of days a single query may cover.
pub const MAX_QUERY_AMOUNT: u32 = i16::MAX as u32;

/// Separator placed before every value of a composite group key.
const GROUP_KEY_SEPARATOR: &str = "::";

/// An error returned by [`execute`].
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    /// A parameter is missing or has an invalid name.
    #[error("invalid query: {0}")]
    InvalidQuery(String),
    /// The process has never been written to.
    #[error("process not found: {0}")]
    NotFound(String),
    /// A scanned document lacks a group field.
    #[error("no such field {0}")]
    MissingField(String),
    /// The store failed while scanning.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<CollectorError> for QueryError {
    fn from(error: CollectorError) -> Self {
        Self::InvalidQuery(error.to_string())
    }
}

/// A time-series query against one process.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    /// The dimension path joined by `_`, for example `route_ctrl`.
    pub process: String,
    /// Prefixed field keys to return, such as `c_count` or `t_time`.
    pub fields: Vec<String>,
    /// Slot granularity of the result.
    pub period: Granularity,
    /// Number of days up to and including today. Values below 1 are treated as 1, values above
    /// [`MAX_QUERY_AMOUNT`] are rejected.
    pub amount: u32,
    /// Equality filters on group fields.
    pub filters: BTreeMap<String, String>,
    /// Group field names. [`ANY_TOKEN`] groups by app.
    pub groups: Vec<String>,
    /// Restricts to one app, or [`ANY_TOKEN`] for the app-scoped collection without a filter.
    pub app: Option<String>,
}

impl Query {
    /// Creates a daily query over two days without filters or groups.
    pub fn new(process: impl Into<String>, fields: Vec<String>) -> Self {
        Self {
            process: process.into(),
            fields,
            period: Granularity::Day,
            amount: 2,
            filters: BTreeMap::new(),
            groups: Vec::new(),
            app: None,
        }
    }

    fn validate(&self) -> Result<(), QueryError> {
        if self.process.is_empty() || self.fields.is_empty() {
            return Err(QueryError::InvalidQuery(
                "required parameter not sent".to_owned(),
            ));
        }

        if self.amount > MAX_QUERY_AMOUNT {
            return Err(QueryError::InvalidQuery(format!(
                "amount {} exceeds the maximum of {MAX_QUERY_AMOUNT} days",
                self.amount
            )));
        }

        if !is_valid_value_name(&self.process) {
            return Err(invalid_name("process", &self.process));
        }

        if let Some(app) = &self.app {
            if app != ANY_TOKEN && !is_valid_name(app) {
                return Err(invalid_name("app", app));
            }
        }

        for group in &self.groups {
            if group != ANY_TOKEN && !is_valid_value_name(group) {
                return Err(invalid_name("group", group));
            }
        }

        for name in self.filters.keys() {
            if !is_valid_value_name(name) {
                return Err(invalid_name("filter", name));
            }
        }

        Ok(())
    }

    /// Returns `true` if the app-scoped collection has to be read.
    fn scope(&self) -> Scope {
        if self.app.is_some() || self.groups.iter().any(|g| g == ANY_TOKEN) {
            Scope::App
        } else {
            Scope::Global
        }
    }

    /// Group names as stored on documents.
    fn group_keys(&self) -> Vec<String> {
        self.groups
            .iter()
            .map(|group| match group.as_str() {
                ANY_TOKEN => APP_KEY.to_owned(),
                other => other.to_owned(),
            })
            .collect()
    }
}

fn invalid_name(kind: &str, name: &str) -> QueryError {
    QueryError::InvalidQuery(format!("invalid {kind} name: {name}"))
}

/// The series of one group.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GroupSeries {
    /// The composite group key, `::` before every group value.
    #[serde(skip)]
    pub key: String,
    /// Values of the group fields, in query order.
    pub groups: IndexMap<String, String>,
    /// The dense series of this group.
    pub list: Series,
}

/// Result of a query: a single series, or one series per group.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub enum QueryResult {
    /// Ungrouped result, serialized as `{"list": [...]}`.
    #[serde(rename = "list")]
    Series(Series),
    /// Grouped result, serialized as `{"group": [...]}`.
    #[serde(rename = "group")]
    Grouped(Vec<GroupSeries>),
}

impl QueryResult {
    /// Replaces timer and gauge sums by their averages in every point.
    pub fn with_derived_values(self) -> Self {
        match self {
            Self::Series(series) => Self::Series(series.with_derived_values()),
            Self::Grouped(groups) => Self::Grouped(
                groups
                    .into_iter()
                    .map(|group| GroupSeries {
                        list: group.list.with_derived_values(),
                        ..group
                    })
                    .collect(),
            ),
        }
    }
}

/// Per-group collectors in order of first appearance.
struct GroupCollectors {
    builder: PeriodCollectorBuilder,
    range: (chrono::NaiveDate, chrono::NaiveDate),
    now: DateTime<Utc>,
    groups: IndexMap<String, (IndexMap<String, String>, PeriodCollector)>,
}

impl GroupCollectors {
    fn feed(
        &mut self,
        group_names: &[String],
        display_names: &[String],
        document: &RollupDocument,
    ) -> Result<(), QueryError> {
        let mut key = String::new();
        for name in group_names {
            let value = document
                .key
                .group_value(name)
                .ok_or_else(|| QueryError::MissingField(name.clone()))?;
            key.push_str(GROUP_KEY_SEPARATOR);
            key.push_str(value);
        }

        if !self.groups.contains_key(&key) {
            let display = display_names
                .iter()
                .zip(group_names)
                .filter_map(|(display, name)| {
                    let value = document.key.group_value(name)?;
                    Some((display.clone(), value.to_owned()))
                })
                .collect();

            let (start, end) = self.range;
            let collector = self.builder.clone().init(start, end, self.now)?;
            self.groups.insert(key.clone(), (display, collector));
        }

        if let Some((_, collector)) = self.groups.get_mut(&key) {
            collector.feed(document.key.date, document);
        }

        Ok(())
    }
}

/// Runs a query against the store at the given instant.
///
/// Every group's series covers the full range from `amount - 1` days before today up to `now`,
/// regardless of where its documents fall. An ungrouped query without any matching documents
/// returns an empty series.
pub async fn execute(
    store: &RollupStore,
    query: &Query,
    now: DateTime<Utc>,
) -> Result<QueryResult, QueryError> {
    let started = Instant::now();
    query.validate()?;

    let scope = query.scope();
    let collection = CollectionName::for_process(&query.process, scope);
    if !store.collection_exists(&collection).await? {
        return Err(QueryError::NotFound(query.process.clone()));
    }

    store.ensure_index(&collection, scope).await?;

    let today = now.date_naive();
    let start = range_start(today, query.amount.max(1));

    let mut builder = PeriodCollectorBuilder::new(query.period);
    for field in &query.fields {
        builder.import(field, field)?;
    }

    let group_names = query.group_keys();
    let filter = ScanFilter {
        collection,
        since: start,
        app: query.app.clone().filter(|app| app != ANY_TOKEN),
        fields: query.filters.clone(),
        sort: group_names.clone(),
    };

    let mut collectors = GroupCollectors {
        builder,
        range: (start, today),
        now,
        groups: IndexMap::new(),
    };

    let mut cursor = store.scan(filter).await?;
    while let Some(document) = cursor.try_next().await? {
        collectors.feed(&group_names, &query.groups, &document)?;
    }

    let result = if query.groups.is_empty() {
        let series = collectors
            .groups
            .swap_remove("")
            .map(|(_, collector)| collector.finish())
            .unwrap_or_default();
        QueryResult::Series(series)
    } else {
        let groups = collectors
            .groups
            .into_iter()
            .map(|(key, (groups, collector))| GroupSeries {
                key,
                groups,
                list: collector.finish(),
            })
            .collect();
        QueryResult::Grouped(groups)
    };

    appstats_statsd::metric!(
        timer(RollupTimers::QueryDuration) = started.elapsed(),
        period = query.period.as_str(),
    );

    Ok(result)
}
