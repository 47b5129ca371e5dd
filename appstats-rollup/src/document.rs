//! Typed rollup documents and their persisted layout.
//!
//! A rollup document is keyed by date, optional app and group fields, and holds cumulative
//! values at three granularities. Serialized, a document looks like this:
//!
//! ```json
//! {
//!   "_dt": "2024-10-19",
//!   "_app": "web",
//!   "route": "/login",
//!   "_dy": {"c_count": 3.0},
//!   "_hr": {"h_14": {"c_count": 3.0, "mn": {"m_30": {"c_count": 3.0}}}}
//! }
//! ```
use std::collections::BTreeMap;
use std::fmt;

use chrono::NaiveDate;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use smallvec::SmallVec;

use crate::bucket::{BucketError, SENTINEL};
use crate::protocol::{MeasurementKind, MeasurementValue};

/// Document key holding the ISO date.
pub const DATE_KEY: &str = "_dt";
/// Document key holding the app of app-scoped documents.
pub const APP_KEY: &str = "_app";
/// Root of all collection names.
pub const COLLECTION_ROOT: &str = "_a";
/// Suffix of app-scoped collections.
pub const APP_SUFFIX: &str = "_app";

/// Format of the date key.
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// The starting minutes of the four quarter-hour slots.
pub const MINUTE_SLOTS: [u8; 4] = [0, 15, 30, 45];

/// Cumulative values of one slot, keyed by prefixed field key such as `c_count`.
pub type Fields = BTreeMap<String, f64>;

/// Selects whether a write or read targets the global or the per-app collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    /// All apps summed together.
    Global,
    /// One document per app, in the `_app` suffixed collection.
    App,
}

/// Name of a rollup collection, such as `_a_route_ctrl` or `_a_route_app`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionName(String);

impl CollectionName {
    /// Returns the root from which dimension names are appended.
    pub fn root() -> Self {
        Self(COLLECTION_ROOT.to_owned())
    }

    /// Returns the collection of a query process, e.g. `route_ctrl`.
    pub fn for_process(process: &str, scope: Scope) -> Self {
        Self::root().join(process).scoped(scope)
    }

    /// Appends a dimension name.
    pub fn join(&self, dimension: &str) -> Self {
        Self(format!("{}_{dimension}", self.0))
    }

    /// Returns the variant of this collection for the given scope.
    pub fn scoped(&self, scope: Scope) -> Self {
        match scope {
            Scope::Global => self.clone(),
            Scope::App => Self(format!("{}{APP_SUFFIX}", self.0)),
        }
    }

    /// Returns the collection name as string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Group field values of a document, derived from dimension parameters.
///
/// Keys never start with the [`SENTINEL`] and never collide with the reserved document keys.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupFields(BTreeMap<String, String>);

impl GroupFields {
    /// Creates an empty set of group fields.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a group field, replacing a previous value of the same key.
    pub fn insert(&mut self, key: String, value: String) -> Result<(), BucketError> {
        if key.is_empty() || key.starts_with(SENTINEL) {
            return Err(BucketError::ReservedKey(key));
        }
        self.0.insert(key, value);
        Ok(())
    }

    /// Returns the value of a group field.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Iterates all fields in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Returns the number of group fields.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no group fields.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the canonical JSON encoding used as part of the storage key.
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_owned())
    }

    /// Decodes the canonical JSON encoding.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json).map(Self)
    }
}

impl FromIterator<(String, String)> for GroupFields {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The unique key of a document within its collection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DocumentKey {
    /// The UTC day.
    pub date: NaiveDate,
    /// The app, only set in app-scoped collections.
    pub app: Option<String>,
    /// Group field values.
    pub groups: GroupFields,
}

impl DocumentKey {
    /// Returns the value of a group field, where [`APP_KEY`] resolves to the app.
    pub fn group_value(&self, name: &str) -> Option<&str> {
        if name == APP_KEY {
            self.app.as_deref()
        } else {
            self.groups.get(name)
        }
    }
}

/// The granularity region a single increment applies to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    /// The day total.
    Day,
    /// An hour of the day, `0..24`.
    Hour(u8),
    /// A quarter-hour slot as `(hour, minute)` with minute one of [`MINUTE_SLOTS`].
    Minute(u8, u8),
}

impl Slot {
    /// Returns the hour and minute columns used by the SQL layout, `-1` meaning unset.
    pub(crate) fn columns(self) -> (i64, i64) {
        match self {
            Slot::Day => (-1, -1),
            Slot::Hour(hour) => (hour.into(), -1),
            Slot::Minute(hour, minute) => (hour.into(), minute.into()),
        }
    }

    /// Inverse of [`columns`](Self::columns).
    pub(crate) fn from_columns(hour: i64, minute: i64) -> Option<Self> {
        let hour_in_range = (0..24).contains(&hour);
        match (hour, minute) {
            (-1, -1) => Some(Slot::Day),
            (h, -1) if hour_in_range => Some(Slot::Hour(h as u8)),
            (h, m) if hour_in_range && (0..60).contains(&m) && MINUTE_SLOTS.contains(&(m as u8)) => {
                Some(Slot::Minute(h as u8, m as u8))
            }
            _ => None,
        }
    }
}

/// An additive change of one field in one slot.
#[derive(Clone, Debug, PartialEq)]
pub struct Increment {
    /// The targeted slot.
    pub slot: Slot,
    /// The prefixed field key, e.g. `t_time` or `tc_time`.
    pub field: String,
    /// The amount added.
    pub value: MeasurementValue,
}

/// All increments produced by one measurement.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Increments(SmallVec<[Increment; 6]>);

impl Increments {
    /// Builds the increments of a measurement at the given hour and quarter-hour slot.
    ///
    /// Counters produce one field per granularity, timers and gauges a sum and a count field.
    pub fn new(
        kind: MeasurementKind,
        field: &str,
        value: MeasurementValue,
        hour: u8,
        minute: u8,
    ) -> Self {
        let sum_key = format!("{}{field}", kind.sum_prefix());
        let count_key = kind.count_prefix().map(|prefix| format!("{prefix}{field}"));

        let mut increments = SmallVec::new();
        for slot in [Slot::Day, Slot::Hour(hour), Slot::Minute(hour, minute)] {
            increments.push(Increment {
                slot,
                field: sum_key.clone(),
                value,
            });
            if let Some(count_key) = &count_key {
                increments.push(Increment {
                    slot,
                    field: count_key.clone(),
                    value: 1.0,
                });
            }
        }

        Self(increments)
    }

    /// Iterates the increments.
    pub fn iter(&self) -> impl Iterator<Item = &Increment> {
        self.0.iter()
    }

    /// Returns the number of increments.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no increments.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The increments of one hour and its quarter-hour slots.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct HourRegion {
    /// Hour totals.
    pub fields: Fields,
    /// Quarter-hour totals keyed by starting minute.
    pub minutes: BTreeMap<u8, Fields>,
}

/// A per-date document holding cumulative values at day, hour and quarter-hour granularity.
#[derive(Clone, Debug, PartialEq)]
pub struct RollupDocument {
    /// The unique key of this document.
    pub key: DocumentKey,
    /// Day totals.
    pub day: Fields,
    /// Hour regions keyed by hour of day.
    pub hours: BTreeMap<u8, HourRegion>,
}

impl RollupDocument {
    /// Creates an empty document for the given key.
    pub fn new(key: DocumentKey) -> Self {
        Self {
            key,
            day: Fields::new(),
            hours: BTreeMap::new(),
        }
    }

    /// Adds a value to a field in a slot, creating the field if missing.
    pub fn add(&mut self, slot: Slot, field: &str, value: f64) {
        let fields = match slot {
            Slot::Day => &mut self.day,
            Slot::Hour(hour) => &mut self.hours.entry(hour).or_default().fields,
            Slot::Minute(hour, minute) => self
                .hours
                .entry(hour)
                .or_default()
                .minutes
                .entry(minute)
                .or_default(),
        };

        *fields.entry(field.to_owned()).or_insert(0.0) += value;
    }

    /// Applies all increments additively.
    pub fn apply(&mut self, increments: &Increments) {
        for increment in increments.iter() {
            self.add(increment.slot, &increment.field, increment.value);
        }
    }

    /// Returns the fields of a slot, if any value was recorded for it.
    pub fn slot(&self, slot: Slot) -> Option<&Fields> {
        match slot {
            Slot::Day => Some(&self.day),
            Slot::Hour(hour) => self.hours.get(&hour).map(|region| &region.fields),
            Slot::Minute(hour, minute) => self
                .hours
                .get(&hour)
                .and_then(|region| region.minutes.get(&minute)),
        }
    }
}

struct HourLayout<'a>(&'a HourRegion);

impl Serialize for HourLayout<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        for (key, value) in &self.0.fields {
            map.serialize_entry(key, value)?;
        }
        if !self.0.minutes.is_empty() {
            let minutes: BTreeMap<String, &Fields> = self
                .0
                .minutes
                .iter()
                .map(|(minute, fields)| (format!("m_{minute}"), fields))
                .collect();
            map.serialize_entry("mn", &minutes)?;
        }
        map.end()
    }
}

impl Serialize for RollupDocument {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry(DATE_KEY, &self.key.date.format(DATE_FORMAT).to_string())?;
        if let Some(app) = &self.key.app {
            map.serialize_entry(APP_KEY, app)?;
        }
        for (key, value) in self.key.groups.iter() {
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry("_dy", &self.day)?;

        let hours: BTreeMap<String, HourLayout<'_>> = self
            .hours
            .iter()
            .map(|(hour, region)| (format!("h_{hour}"), HourLayout(region)))
            .collect();
        map.serialize_entry("_hr", &hours)?;
        map.end()
    }
}
