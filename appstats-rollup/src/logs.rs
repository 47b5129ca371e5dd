//! Structured log lines received next to measurements.
//!
//! A log line has the form `APP:LEVEL:MESSAGEID:MESSAGE`. Only the first three colons are
//! significant, the message is taken verbatim and may contain further colons.
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::protocol::Measurement;

/// Severity of a [`LogRecord`], numbered like syslog from most to least severe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// `1`
    Critical = 1,
    /// `2`
    Error = 2,
    /// `3`
    Warning = 3,
    /// `4`
    Notice = 4,
    /// `5`
    Info = 5,
    /// `6`
    Debug = 6,
}

impl LogLevel {
    /// Returns the numeric level as sent on the wire.
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl TryFrom<i64> for LogLevel {
    type Error = ParseLogError;

    fn try_from(value: i64) -> Result<Self, ParseLogError> {
        Ok(match value {
            1 => LogLevel::Critical,
            2 => LogLevel::Error,
            3 => LogLevel::Warning,
            4 => LogLevel::Notice,
            5 => LogLevel::Info,
            6 => LogLevel::Debug,
            _ => return Err(ParseLogError::InvalidLevel(value.to_string())),
        })
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Critical => "critical",
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Notice => "notice",
            Self::Info => "info",
            Self::Debug => "debug",
        };
        f.write_str(name)
    }
}

/// Error for a malformed log line.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ParseLogError {
    /// The line is not valid UTF-8.
    #[error("log line is not valid utf-8")]
    InvalidUtf8,
    /// The line ended before a required field.
    #[error("log line is missing the {0} field")]
    MissingField(&'static str),
    /// The level is not an integer from 1 to 6.
    #[error("invalid log level {0:?}")]
    InvalidLevel(String),
}

/// A received log line.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogRecord {
    /// Time of receipt.
    pub timestamp: DateTime<Utc>,
    /// The severity.
    pub level: LogLevel,
    /// The sending application.
    pub app: String,
    /// Application defined identifier of the message.
    pub message_id: String,
    /// The message text.
    pub message: String,
}

impl LogRecord {
    /// Parses a single line without trailing newline.
    ///
    /// # Example
    ///
    /// ```
    /// use appstats_rollup::{LogLevel, LogRecord};
    ///
    /// let record = LogRecord::parse("web:2:db:connection lost: retrying", chrono::Utc::now()).unwrap();
    /// assert_eq!(record.level, LogLevel::Error);
    /// assert_eq!(record.message, "connection lost: retrying");
    /// ```
    pub fn parse(line: &str, timestamp: DateTime<Utc>) -> Result<Self, ParseLogError> {
        let mut parts = line.splitn(4, ':');

        let app = parts.next().ok_or(ParseLogError::MissingField("app"))?;
        let level = parts.next().ok_or(ParseLogError::MissingField("level"))?;
        let message_id = parts.next().ok_or(ParseLogError::MissingField("message id"))?;
        let message = parts.next().ok_or(ParseLogError::MissingField("message"))?;

        let level = level
            .parse::<i64>()
            .map_err(|_| ParseLogError::InvalidLevel(level.to_owned()))
            .and_then(LogLevel::try_from)?;

        Ok(Self {
            timestamp,
            level,
            app: app.to_owned(),
            message_id: message_id.to_owned(),
            message: message.to_owned(),
        })
    }

    /// Parses all lines of a datagram.
    ///
    /// The final line does not need a trailing newline. Lines of at most one byte are skipped.
    pub fn parse_all(slice: &[u8], timestamp: DateTime<Utc>) -> ParseLogRecords<'_> {
        ParseLogRecords { slice, timestamp }
    }

    /// Returns the error statistics counter derived from this record, if any.
    ///
    /// Critical and error lines count towards `<app>.error.ct`, warnings towards
    /// `<app>.error.wct`.
    pub fn error_statistic(&self) -> Option<Measurement> {
        let field = match self.level {
            LogLevel::Critical | LogLevel::Error => "ct",
            LogLevel::Warning => "wct",
            _ => return None,
        };

        Some(Measurement::counter(
            format!("{}.error.{field}", self.app),
            1.0,
        ))
    }
}

/// Iterator over log records returned from [`LogRecord::parse_all`].
#[derive(Clone, Debug)]
pub struct ParseLogRecords<'a> {
    slice: &'a [u8],
    timestamp: DateTime<Utc>,
}

impl Iterator for ParseLogRecords<'_> {
    type Item = Result<LogRecord, ParseLogError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.slice.is_empty() {
                return None;
            }

            let mut split = self.slice.splitn(2, |&b| b == b'\n');
            let current = split.next()?;
            self.slice = split.next().unwrap_or_default();

            let current = current.strip_suffix(b"\r").unwrap_or(current);
            if current.len() <= 1 {
                continue;
            }

            return Some(match std::str::from_utf8(current) {
                Ok(line) => LogRecord::parse(line, self.timestamp),
                Err(_) => Err(ParseLogError::InvalidUtf8),
            });
        }
    }
}
