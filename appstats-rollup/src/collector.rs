//! Reconstruction of dense, zero-filled series from sparse rollup documents.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Days, NaiveDate, Utc};
use indexmap::IndexMap;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::bucket::is_valid_value_name;
use crate::document::{DATE_FORMAT, Fields, MINUTE_SLOTS, RollupDocument, Slot};

/// Field prefixes of averaged kinds and their paired count prefixes.
const AVERAGED_PREFIXES: [(&str, &str); 2] = [("t_", "tc_"), ("g_", "gc_")];

/// The density of slots in a series.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    /// One slot per day.
    #[default]
    Day,
    /// One slot per hour.
    Hour,
    /// One slot per 15 minutes.
    Minute,
}

impl Granularity {
    /// Returns the name used in queries.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Day => "day",
            Self::Hour => "hour",
            Self::Minute => "minute",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown [`Granularity`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown period {0:?}, expected day, hour or minute")]
pub struct ParseGranularityError(String);

impl FromStr for Granularity {
    type Err = ParseGranularityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(Self::Day),
            "hour" => Ok(Self::Hour),
            "minute" => Ok(Self::Minute),
            other => Err(ParseGranularityError(other.to_owned())),
        }
    }
}

/// Misconfiguration of a [`PeriodCollector`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CollectorError {
    /// A field name is empty, reserved or contains invalid characters.
    #[error("invalid field name {0:?}")]
    InvalidField(String),
    /// The range ends before it starts.
    #[error("end date {end} is before start date {start}")]
    InvalidRange {
        /// Requested start of the range.
        start: NaiveDate,
        /// Requested end of the range.
        end: NaiveDate,
    },
}

/// The position of a point in a series.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotTime {
    /// The day.
    pub date: NaiveDate,
    /// The hour, for hour and minute granularity.
    pub hour: Option<u8>,
    /// The starting minute, for minute granularity.
    pub minute: Option<u8>,
}

impl SlotTime {
    /// Returns the UTC instant at which this slot starts.
    pub fn start(&self) -> DateTime<Utc> {
        let hour = self.hour.unwrap_or(0).into();
        let minute = self.minute.unwrap_or(0).into();
        self.date
            .and_hms_opt(hour, minute, 0)
            .unwrap_or_default()
            .and_utc()
    }

    fn slot(&self) -> Slot {
        match (self.hour, self.minute) {
            (Some(hour), Some(minute)) => Slot::Minute(hour, minute),
            (Some(hour), None) => Slot::Hour(hour),
            _ => Slot::Day,
        }
    }
}

/// One slot of a series with a value for every imported field.
#[derive(Clone, Debug, PartialEq)]
pub struct Point {
    /// The slot.
    pub time: SlotTime,
    /// Output field name to value.
    pub values: IndexMap<String, f64>,
}

impl Point {
    /// Returns the displayed value of a field.
    ///
    /// For timer (`t_`) and gauge (`g_`) sums this is the average `sum / count` using the paired
    /// count field, or `0` if the count is zero. Other fields are returned unchanged.
    pub fn derived(&self, field: &str) -> f64 {
        let value = self.values.get(field).copied().unwrap_or_default();

        for (sum_prefix, count_prefix) in AVERAGED_PREFIXES {
            if let Some(name) = field.strip_prefix(sum_prefix) {
                let count = self
                    .values
                    .get(&format!("{count_prefix}{name}"))
                    .copied()
                    .unwrap_or_default();
                return if count > 0.0 { value / count } else { 0.0 };
            }
        }

        value
    }

    /// Returns a copy of this point with averaged fields replaced by their derived value.
    pub fn with_derived_values(&self) -> Self {
        let values = self
            .values
            .keys()
            .map(|field| (field.clone(), self.derived(field)))
            .collect();

        Self {
            time: self.time,
            values,
        }
    }
}

impl Serialize for Point {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("date", &self.time.date.format(DATE_FORMAT).to_string())?;
        if let Some(hour) = self.time.hour {
            map.serialize_entry("hour", &hour)?;
        }
        if let Some(minute) = self.time.minute {
            map.serialize_entry("minute", &minute)?;
        }
        for (key, value) in &self.values {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

/// A dense, chronologically ordered list of points.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Series(Vec<Point>);

impl Series {
    /// Returns the points.
    pub fn points(&self) -> &[Point] {
        &self.0
    }

    /// Returns the number of points.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the series has no points.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns a copy with timer and gauge sums replaced by averages.
    pub fn with_derived_values(&self) -> Self {
        Self(self.0.iter().map(Point::with_derived_values).collect())
    }
}

/// Configures the fields of a [`PeriodCollector`] before any data is fed.
///
/// # Example
///
/// ```
/// use appstats_rollup::{Granularity, PeriodCollectorBuilder};
/// use chrono::{NaiveDate, TimeZone, Utc};
///
/// let mut builder = PeriodCollectorBuilder::new(Granularity::Day);
/// builder.import("t_time", "t_time").unwrap();
///
/// let start = NaiveDate::from_ymd_opt(2024, 10, 17).unwrap();
/// let end = NaiveDate::from_ymd_opt(2024, 10, 19).unwrap();
/// let now = Utc.with_ymd_and_hms(2024, 10, 19, 12, 0, 0).unwrap();
///
/// let collector = builder.init(start, end, now).unwrap();
/// let series = collector.finish();
/// assert_eq!(series.len(), 3);
/// assert_eq!(series.points()[0].values["tc_time"], 0.0);
/// ```
#[derive(Clone, Debug)]
pub struct PeriodCollectorBuilder {
    granularity: Granularity,
    imports: IndexMap<String, String>,
}

impl PeriodCollectorBuilder {
    /// Creates a builder without imports.
    pub fn new(granularity: Granularity) -> Self {
        Self {
            granularity,
            imports: IndexMap::new(),
        }
    }

    /// Registers a source field and the name under which it appears in the output.
    ///
    /// Registering a timer sum `t_x` or gauge sum `g_x` also registers its count `tc_x` or `gc_x`
    /// under its own name.
    pub fn import(
        &mut self,
        source: &str,
        output: &str,
    ) -> Result<&mut Self, CollectorError> {
        for name in [source, output] {
            if !is_valid_value_name(name) {
                return Err(CollectorError::InvalidField(name.to_owned()));
            }
        }

        self.imports.insert(source.to_owned(), output.to_owned());

        for (sum_prefix, count_prefix) in AVERAGED_PREFIXES {
            if let Some(name) = source.strip_prefix(sum_prefix) {
                let count = format!("{count_prefix}{name}");
                self.imports.insert(count.clone(), count);
            }
        }

        Ok(self)
    }

    /// Pre-creates zero valued slots for `[start, end]` and switches to the feeding phase.
    ///
    /// Slots starting after `now` are omitted.
    pub fn init(
        self,
        start: NaiveDate,
        end: NaiveDate,
        now: DateTime<Utc>,
    ) -> Result<PeriodCollector, CollectorError> {
        if end < start {
            return Err(CollectorError::InvalidRange { start, end });
        }

        let mut collector = PeriodCollector {
            granularity: self.granularity,
            imports: self.imports,
            now,
            points: IndexMap::new(),
        };

        for date in start.iter_days().take_while(|date| *date <= end) {
            for time in collector.slot_times(date) {
                let values = collector
                    .imports
                    .values()
                    .map(|output| (output.clone(), 0.0))
                    .collect();
                collector.points.insert(time, Point { time, values });
            }
        }

        Ok(collector)
    }
}

/// Accumulates rollup documents into a dense series.
///
/// Created by [`PeriodCollectorBuilder::init`]. Feeding is always additive: several documents of
/// the same date, for example shards that differ in a group field that is not grouped on, sum up
/// in the same slots.
#[derive(Clone, Debug)]
pub struct PeriodCollector {
    granularity: Granularity,
    imports: IndexMap<String, String>,
    now: DateTime<Utc>,
    points: IndexMap<SlotTime, Point>,
}

impl PeriodCollector {
    /// Returns all slot positions of a date that do not start after `now`, in order.
    fn slot_times(&self, date: NaiveDate) -> Vec<SlotTime> {
        let candidates: Vec<SlotTime> = match self.granularity {
            Granularity::Day => vec![SlotTime {
                date,
                hour: None,
                minute: None,
            }],
            Granularity::Hour => (0..24)
                .map(|hour| SlotTime {
                    date,
                    hour: Some(hour),
                    minute: None,
                })
                .collect(),
            Granularity::Minute => (0..24)
                .flat_map(|hour| {
                    MINUTE_SLOTS.into_iter().map(move |minute| SlotTime {
                        date,
                        hour: Some(hour),
                        minute: Some(minute),
                    })
                })
                .collect(),
        };

        candidates
            .into_iter()
            .take_while(|time| time.start() <= self.now)
            .collect()
    }

    /// Adds the imported fields of `document` to the slots of `date`.
    ///
    /// Slots outside of the initialized range are ignored.
    pub fn feed(&mut self, date: NaiveDate, document: &RollupDocument) {
        for time in self.slot_times(date) {
            let Some(point) = self.points.get_mut(&time) else {
                continue;
            };

            let Some(fields) = document.slot(time.slot()) else {
                continue;
            };

            add_imports(&self.imports, &mut point.values, fields);
        }
    }

    /// Returns the number of slots.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    /// Returns `true` if the range did not produce any slot.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Returns the series in the order the slots were created.
    pub fn finish(self) -> Series {
        Series(self.points.into_values().collect())
    }
}

fn add_imports(imports: &IndexMap<String, String>, dest: &mut IndexMap<String, f64>, src: &Fields) {
    for (source, output) in imports {
        if let Some(value) = src.get(source) {
            *dest.entry(output.clone()).or_insert(0.0) += value;
        }
    }
}

/// Returns the day `amount - 1` days before `today`, the start of a range of `amount` days.
pub fn range_start(today: NaiveDate, amount: u32) -> NaiveDate {
    today
        .checked_sub_days(Days::new(amount.saturating_sub(1).into()))
        .unwrap_or(NaiveDate::MIN)
}
