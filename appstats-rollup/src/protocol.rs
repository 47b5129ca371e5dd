//! The statsd line protocol for inbound measurements.
//!
//! Each line has the form `<bucket>:<value>|<type>[|@<rate>]` where type is one of `c`
//! (counter), `ms` (timer) or `g` (gauge). A datagram may carry multiple lines separated by
//! newlines.
use std::fmt;
use std::iter::FusedIterator;

use serde::{Deserialize, Serialize};

/// Type used for measurement values.
pub type MeasurementValue = f64;

/// The kind of a [`Measurement`], selecting the field prefixes used to store it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasurementKind {
    /// Counts occurrences. Stored as `c_<field>`.
    Counter,
    /// A duration. Stored as a sum `t_<field>` and a count `tc_<field>`.
    Timer,
    /// A sampled value. Stored as a sum `g_<field>` and a count `gc_<field>`.
    Gauge,
}

impl MeasurementKind {
    /// Returns the statsd shortcode for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "c",
            Self::Timer => "ms",
            Self::Gauge => "g",
        }
    }

    /// Returns the field key prefix of the summed value.
    pub fn sum_prefix(&self) -> &'static str {
        match self {
            Self::Counter => "c_",
            Self::Timer => "t_",
            Self::Gauge => "g_",
        }
    }

    /// Returns the field key prefix of the paired count, if this kind is averaged.
    pub fn count_prefix(&self) -> Option<&'static str> {
        match self {
            Self::Counter => None,
            Self::Timer => Some("tc_"),
            Self::Gauge => Some("gc_"),
        }
    }
}

impl fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MeasurementKind {
    type Err = ParseMeasurementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "c" => Self::Counter,
            "ms" => Self::Timer,
            "g" => Self::Gauge,
            _ => return Err(ParseMeasurementError(())),
        })
    }
}

/// An error returned when a statsd line cannot be parsed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ParseMeasurementError(());

impl fmt::Display for ParseMeasurementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to parse measurement")
    }
}

impl std::error::Error for ParseMeasurementError {}

/// A single decoded measurement, the raw input of the write path.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub struct Measurement {
    /// The kind of the measurement.
    pub kind: MeasurementKind,
    /// The unparsed bucket name.
    pub bucket: String,
    /// The value. Counters sent with a sample rate are already scaled up.
    pub value: MeasurementValue,
}

impl Measurement {
    /// Creates a counter measurement.
    pub fn counter(bucket: impl Into<String>, value: MeasurementValue) -> Self {
        Self {
            kind: MeasurementKind::Counter,
            bucket: bucket.into(),
            value,
        }
    }

    fn parse_str(string: &str) -> Option<Self> {
        let mut components = string.split('|');

        let (bucket, value) = components.next()?.rsplit_once(':')?;
        if bucket.is_empty() {
            return None;
        }

        let value: MeasurementValue = value.trim().parse().ok()?;
        if !value.is_finite() {
            return None;
        }

        let kind: MeasurementKind = components.next()?.trim().parse().ok()?;

        let mut value = value;
        if let Some(component) = components.next() {
            let rate: f64 = component.strip_prefix('@')?.parse().ok()?;
            if !(rate > 0.0 && rate <= 1.0) {
                return None;
            }
            if kind == MeasurementKind::Counter {
                value /= rate;
            }
        }

        if components.next().is_some() {
            return None;
        }

        Some(Self {
            kind,
            bucket: bucket.to_owned(),
            value,
        })
    }

    /// Parses a single measurement from a raw line.
    ///
    /// # Example
    ///
    /// ```
    /// use appstats_rollup::{Measurement, MeasurementKind};
    ///
    /// let measurement = Measurement::parse(b"web.route.time:27|ms").unwrap();
    /// assert_eq!(measurement.kind, MeasurementKind::Timer);
    /// assert_eq!(measurement.value, 27.0);
    /// ```
    pub fn parse(slice: &[u8]) -> Result<Self, ParseMeasurementError> {
        let string = std::str::from_utf8(slice).or(Err(ParseMeasurementError(())))?;
        Self::parse_str(string).ok_or(ParseMeasurementError(()))
    }

    /// Parses a set of measurements from newline separated lines.
    ///
    /// Empty lines are skipped and a trailing `\r` is removed. Invalid lines are returned as
    /// errors without stopping the iterator.
    ///
    /// # Example
    ///
    /// ```
    /// use appstats_rollup::Measurement;
    ///
    /// let data = b"web.route.count:1|c\nweb.route.time:12|ms\n";
    /// let measurements: Vec<_> = Measurement::parse_all(data).collect();
    /// assert_eq!(measurements.len(), 2);
    /// ```
    pub fn parse_all(slice: &[u8]) -> ParseMeasurements<'_> {
        ParseMeasurements { slice }
    }
}

/// Iterator over parsed measurements returned from [`Measurement::parse_all`].
#[derive(Clone, Debug, Default)]
pub struct ParseMeasurements<'a> {
    slice: &'a [u8],
}

impl Iterator for ParseMeasurements<'_> {
    type Item = Result<Measurement, ParseMeasurementError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.slice.is_empty() {
                return None;
            }

            let mut split = self.slice.splitn(2, |&b| b == b'\n');
            let current = split.next()?;
            self.slice = split.next().unwrap_or_default();

            let string = match std::str::from_utf8(current) {
                Ok(string) => string.strip_suffix('\r').unwrap_or(string),
                Err(_) => return Some(Err(ParseMeasurementError(()))),
            };

            if !string.is_empty() {
                return Some(Measurement::parse_str(string).ok_or(ParseMeasurementError(())));
            }
        }
    }
}

impl FusedIterator for ParseMeasurements<'_> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_garbage() {
        let s = "x23-408j17z4232@#34d\nc3456y7^😎";
        assert!(Measurement::parse(s.as_bytes()).is_err());
    }

    #[test]
    fn test_parse_counter() {
        let measurement = Measurement::parse(b"web.route#/login#GET.ctrl.count:1|c").unwrap();
        insta::assert_debug_snapshot!(measurement, @r###"
        Measurement {
            kind: Counter,
            bucket: "web.route#/login#GET.ctrl.count",
            value: 1.0,
        }
        "###);
    }

    #[test]
    fn test_parse_gauge_negative() {
        let measurement = Measurement::parse(b"web.pool.free:-4.5|g").unwrap();
        assert_eq!(measurement.kind, MeasurementKind::Gauge);
        assert_eq!(measurement.value, -4.5);
    }

    #[test]
    fn test_parse_sample_rate() {
        let measurement = Measurement::parse(b"web.route.count:2|c|@0.5").unwrap();
        assert_eq!(measurement.value, 4.0);

        // Only counters are scaled.
        let measurement = Measurement::parse(b"web.route.time:20|ms|@0.1").unwrap();
        assert_eq!(measurement.value, 20.0);
    }

    #[test]
    fn test_parse_invalid_sample_rate() {
        assert!(Measurement::parse(b"web.route.count:1|c|@0").is_err());
        assert!(Measurement::parse(b"web.route.count:1|c|@1.5").is_err());
        assert!(Measurement::parse(b"web.route.count:1|c|0.5").is_err());
    }

    #[test]
    fn test_parse_unknown_type() {
        assert!(Measurement::parse(b"web.route.count:1|s").is_err());
        assert!(Measurement::parse(b"web.route.count:1").is_err());
        assert!(Measurement::parse(b"web.route.count:1|c|@1|x").is_err());
    }

    #[test]
    fn test_parse_colon_in_bucket() {
        let measurement = Measurement::parse(b"web.route#a:b.count:3|c").unwrap();
        assert_eq!(measurement.bucket, "web.route#a:b.count");
        assert_eq!(measurement.value, 3.0);
    }

    #[test]
    fn test_parse_non_finite() {
        assert!(Measurement::parse(b"web.route.count:inf|c").is_err());
        assert!(Measurement::parse(b"web.route.count:NaN|g").is_err());
    }

    #[test]
    fn test_parse_all() {
        let data = b"web.a.count:1|c\r\n\nbroken\nweb.b.time:3|ms";
        let results: Vec<_> = Measurement::parse_all(data).collect();

        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert_eq!(results[1], Err(ParseMeasurementError(())));
        assert_eq!(results[2].as_ref().unwrap().kind, MeasurementKind::Timer);
    }

    #[test]
    fn test_parse_all_empty() {
        assert_eq!(Measurement::parse_all(b"").count(), 0);
        assert_eq!(Measurement::parse_all(b"\n\r\n").count(), 0);
    }
}
