use std::error::Error;

use appstats_rollup::LogRecord;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};

use crate::service::ServiceState;
use crate::utils::{ApiError, ApiResponse};

#[derive(Debug, Default, Deserialize)]
pub struct LogParams {
    #[serde(default)]
    amount: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LogList {
    list: Vec<LogRecord>,
}

/// Resolves the number of records.
///
/// The amount is a 16-bit integer. Missing, unparseable or negative amounts use the default, and
/// `0` selects no records.
fn amount(params: &LogParams, default: usize) -> usize {
    params
        .amount
        .as_deref()
        .and_then(|amount| amount.parse::<i16>().ok())
        .and_then(|amount| usize::try_from(amount).ok())
        .unwrap_or(default)
}

/// Handles `GET /api/log`, newest records first.
pub async fn handle(
    State(state): State<ServiceState>,
    Query(params): Query<LogParams>,
) -> Result<ApiResponse<LogList>, ApiError> {
    let limit = amount(&params, state.config().default_log_amount());

    let result = match state.store().connect().await {
        Ok(store) => store.recent_logs(limit).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(list) => Ok(ApiResponse::ok(LogList { list })),
        Err(err) => {
            appstats_log::error!(error = &err as &dyn Error, "failed to read log records");
            if err.is_connection_error() {
                state.store().reset().await;
            }
            Err(err.into())
        }
    }
}

#[cfg(test)]
mod tests {
    use appstats_rollup::LogLevel;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::endpoints::tests::{request, test_state};

    #[test]
    fn test_amount() {
        let params = |amount: &str| LogParams {
            amount: Some(amount.to_owned()),
        };

        assert_eq!(amount(&LogParams::default(), 100), 100);
        assert_eq!(amount(&params("5"), 100), 5);
        assert_eq!(amount(&params("0"), 100), 0);
        assert_eq!(amount(&params("-1"), 100), 100);
        assert_eq!(amount(&params("lots"), 100), 100);
        assert_eq!(amount(&params("32767"), 100), 32767);
        assert_eq!(amount(&params("40000"), 100), 100);
    }

    #[tokio::test]
    async fn test_zero_amount_is_empty() {
        let (state, _rx) = test_state();
        let store = state.store().connect().await.unwrap();
        let record = LogRecord {
            timestamp: Utc.with_ymd_and_hms(2024, 10, 19, 8, 0, 0).unwrap(),
            level: LogLevel::Error,
            app: "web".to_owned(),
            message_id: "db".to_owned(),
            message: "lost".to_owned(),
        };
        store.insert_log(&record).await.unwrap();

        let (status, body) = request(
            state,
            Request::get("/api/log?amount=0").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["list"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_recent_logs() {
        let (state, _rx) = test_state();
        let store = state.store().connect().await.unwrap();

        for (second, message) in [(1, "first"), (2, "second"), (3, "third")] {
            let record = LogRecord {
                timestamp: Utc.with_ymd_and_hms(2024, 10, 19, 8, 0, second).unwrap(),
                level: LogLevel::Warning,
                app: "web".to_owned(),
                message_id: "disk".to_owned(),
                message: message.to_owned(),
            };
            store.insert_log(&record).await.unwrap();
        }

        let (status, body) = request(
            state,
            Request::get("/api/log?amount=2").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        insta::assert_json_snapshot!(body["data"]["list"], @r###"
        [
          {
            "app": "web",
            "level": "warning",
            "message": "third",
            "message_id": "disk",
            "timestamp": "2024-10-19T08:00:03Z"
          },
          {
            "app": "web",
            "level": "warning",
            "message": "second",
            "message_id": "disk",
            "timestamp": "2024-10-19T08:00:02Z"
          }
        ]
        "###);
    }
}
