//! The write path: fans a measurement out into rollup upserts.
use chrono::{DateTime, Timelike, Utc};

use crate::bucket::{BucketError, BucketPath};
use crate::document::{CollectionName, DocumentKey, GroupFields, Increments, Scope};
use crate::protocol::{MeasurementKind, MeasurementValue};

/// A single additive upsert against a rollup collection.
///
/// The document matching `key` in `collection` is created if missing, then every increment is
/// added to it.
#[derive(Clone, Debug, PartialEq)]
pub struct WriteRequest {
    /// The target collection, already suffixed for app scope.
    pub collection: CollectionName,
    /// Whether this targets the global or the app-scoped variant.
    pub scope: Scope,
    /// The filter selecting the document.
    pub key: DocumentKey,
    /// The additive changes.
    pub increments: Increments,
}

/// Encodes a parsed measurement into write requests.
///
/// For every prefix of the dimension path one request goes to the global collection and, when the
/// app is not empty, one to the app-scoped collection. Dimension parameters accumulate into the
/// filter from left to right, so deeper collections are filtered by all parameters seen so far.
/// Increments are stamped with the day, hour and quarter-hour of `now`.
pub fn encode(
    kind: MeasurementKind,
    path: &BucketPath,
    value: MeasurementValue,
    now: DateTime<Utc>,
) -> Result<Vec<WriteRequest>, BucketError> {
    let hour = now.hour() as u8;
    let minute = (now.minute() / 15 * 15) as u8;
    let increments = Increments::new(kind, &path.field, value, hour, minute);

    let date = now.date_naive();
    let app = (!path.app.is_empty()).then(|| path.app.clone());

    let mut collection = CollectionName::root();
    let mut groups = GroupFields::new();
    let mut requests = Vec::with_capacity(path.dims.len() * 2);

    for dim in &path.dims {
        collection = collection.join(&dim.name);
        for (key, value) in dim.filter_entries() {
            groups.insert(key, value.to_owned())?;
        }

        requests.push(WriteRequest {
            collection: collection.clone(),
            scope: Scope::Global,
            key: DocumentKey {
                date,
                app: None,
                groups: groups.clone(),
            },
            increments: increments.clone(),
        });

        if let Some(app) = &app {
            requests.push(WriteRequest {
                collection: collection.scoped(Scope::App),
                scope: Scope::App,
                key: DocumentKey {
                    date,
                    app: Some(app.clone()),
                    groups: groups.clone(),
                },
                increments: increments.clone(),
            });
        }
    }

    Ok(requests)
}
