//! Parsing of dotted bucket names into a dimensional write target.
//!
//! A bucket has the form `<app>.<dim>[#param...][.<dim>[#param...]...].<field>`:
//!
//! ```
//! use appstats_rollup::BucketPath;
//!
//! let path: BucketPath = "web.route#/login#GET.ctrl.count".parse().unwrap();
//! assert_eq!(path.app, "web");
//! assert_eq!(path.dims[0].name, "route");
//! assert_eq!(path.dims[0].params.as_slice(), ["/login", "GET"]);
//! assert_eq!(path.field, "count");
//! ```
use std::fmt;
use std::str::FromStr;

use smallvec::SmallVec;

/// Leading character of reserved keys and collection roots.
///
/// User supplied names may never start with it.
pub const SENTINEL: char = '_';

/// Error returned when a bucket name violates the naming rules.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BucketError {
    /// The bucket has fewer than three dot-separated segments.
    #[error("invalid bucket: expected at least 3 segments, found {0}")]
    TooShort(usize),
    /// A segment starts with the reserved sentinel character.
    #[error("invalid bucket: segment {0:?} starts with a reserved character")]
    Reserved(String),
    /// A dimension segment has an empty name.
    #[error("invalid bucket: empty dimension name in {0:?}")]
    EmptyDimension(String),
    /// The trailing field segment is empty.
    #[error("invalid bucket: empty field name")]
    EmptyField,
    /// A dimension or field name contains characters outside the allowed set.
    #[error("invalid bucket: {0:?} is not a valid name")]
    InvalidName(String),
    /// A filter key derived from a dimension starts with the sentinel.
    #[error("invalid bucket: derived key {0:?} is reserved")]
    ReservedKey(String),
}

/// One component of a bucket's dimension path.
///
/// The first `#`-separated token is the dimension name, the remaining tokens are its parameters
/// in order. Parameters may be empty; empty parameters are never used as filter values.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DimensionSegment {
    /// The dimension name, used to build collection names.
    pub name: String,
    /// Ordered parameters, used as group field values.
    pub params: SmallVec<[String; 2]>,
}

impl DimensionSegment {
    fn parse(segment: &str) -> Result<Self, BucketError> {
        let mut tokens = segment.split('#');
        let name = tokens.next().unwrap_or_default();

        if name.is_empty() {
            return Err(BucketError::EmptyDimension(segment.to_owned()));
        }
        if name.starts_with(SENTINEL) {
            return Err(BucketError::Reserved(name.to_owned()));
        }
        if !is_valid_name(name) {
            return Err(BucketError::InvalidName(name.to_owned()));
        }

        Ok(Self {
            name: name.to_owned(),
            params: tokens.map(str::to_owned).collect(),
        })
    }

    /// Returns the filter entries contributed by this dimension.
    ///
    /// The first parameter is keyed by the dimension name, the parameter at position `i > 0` by
    /// `name + i`. Empty parameters are skipped but still consume their position.
    pub fn filter_entries(&self) -> impl Iterator<Item = (String, &str)> + '_ {
        self.params
            .iter()
            .enumerate()
            .filter(|(_, value)| !value.is_empty())
            .map(|(index, value)| {
                let key = match index {
                    0 => self.name.clone(),
                    _ => format!("{}{index}", self.name),
                };
                (key, value.as_str())
            })
    }
}

impl fmt::Display for DimensionSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for param in &self.params {
            write!(f, "#{param}")?;
        }
        Ok(())
    }
}

/// A bucket name decomposed into app, dimension path and field.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BucketPath {
    /// The application, taken from the first segment. May be empty.
    pub app: String,
    /// The dimension path between app and field. Never empty.
    pub dims: Vec<DimensionSegment>,
    /// The field name, taken from the last segment. Never empty.
    pub field: String,
}

impl BucketPath {
    /// Parses and validates a bucket name.
    pub fn parse(bucket: &str) -> Result<Self, BucketError> {
        let segments: SmallVec<[&str; 8]> = bucket.split('.').collect();
        if segments.len() < 3 {
            return Err(BucketError::TooShort(segments.len()));
        }

        if let Some(reserved) = segments.iter().find(|s| s.starts_with(SENTINEL)) {
            return Err(BucketError::Reserved((*reserved).to_owned()));
        }

        let app = segments[0];
        let field = segments[segments.len() - 1];
        if field.is_empty() {
            return Err(BucketError::EmptyField);
        }
        if !is_valid_value_name(field) {
            return Err(BucketError::InvalidName(field.to_owned()));
        }

        let dims = segments[1..segments.len() - 1]
            .iter()
            .map(|segment| DimensionSegment::parse(segment))
            .collect::<Result<_, _>>()?;

        Ok(Self {
            app: app.to_owned(),
            dims,
            field: field.to_owned(),
        })
    }
}

impl FromStr for BucketPath {
    type Err = BucketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BucketPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.app)?;
        for dim in &self.dims {
            write!(f, ".{dim}")?;
        }
        write!(f, ".{}", self.field)
    }
}

/// Returns `true` if `name` is a non-empty run of ASCII letters and digits.
///
/// This is the rule for app names and for query parameters that name a group.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Returns `true` if `name` is a valid field or filter name.
///
/// In addition to [`is_valid_name`], underscores are allowed anywhere but at the start, so
/// prefixed field keys such as `c_count` and process names such as `route_ctrl` pass.
pub fn is_valid_value_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(SENTINEL)
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == SENTINEL as u8)
}
