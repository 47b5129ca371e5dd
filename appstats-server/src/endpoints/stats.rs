//! Time-series queries over the rollups of one process.

use std::error::Error;

use appstats_rollup::{Granularity, Query, QueryError, QueryResult};
use axum::extract::{Path, Query as QueryParams, State};
use chrono::Utc;

use crate::service::ServiceState;
use crate::utils::{ApiError, ApiResponse};

/// Prefix of query parameters that filter on a group field.
const FILTER_PREFIX: &str = "f_";

/// Splits a comma separated parameter. An empty parameter yields no values.
fn split_params(value: &str) -> Vec<String> {
    if value.is_empty() {
        return Vec::new();
    }

    value.split(',').map(str::to_owned).collect()
}

/// Builds a query from the request parameters.
///
/// Amounts that do not parse as a 16-bit integer fall back to the default. Amounts below one
/// are raised to one.
fn parse_query(
    process: String,
    params: Vec<(String, String)>,
    default_amount: u32,
) -> Result<(Query, bool), ApiError> {
    let mut query = Query {
        amount: default_amount,
        ..Query::new(process, Vec::new())
    };
    let mut derived = false;

    for (name, value) in params {
        match name.as_str() {
            "data" => query.fields = split_params(&value),
            "period" if value.is_empty() => query.period = Granularity::Day,
            "period" => {
                query.period = value
                    .parse()
                    .map_err(|err: appstats_rollup::ParseGranularityError| {
                        ApiError::invalid_query(err.to_string())
                    })?;
            }
            "amount" => {
                if let Ok(amount) = value.parse::<i16>() {
                    query.amount = amount.max(1).unsigned_abs().into();
                }
            }
            "group" => query.groups = split_params(&value),
            "app" => query.app = Some(value).filter(|app| !app.is_empty()),
            "derived" => derived = matches!(value.as_str(), "true" | "1"),
            _ => {
                if let Some(field) = name.strip_prefix(FILTER_PREFIX) {
                    query.filters.insert(field.to_owned(), value);
                }
            }
        }
    }

    Ok((query, derived))
}

/// Handles `GET /api/stats/{process}`.
pub async fn handle(
    State(state): State<ServiceState>,
    Path(process): Path<String>,
    QueryParams(params): QueryParams<Vec<(String, String)>>,
) -> Result<ApiResponse<QueryResult>, ApiError> {
    let (query, derived) = parse_query(process, params, state.config().default_query_amount())?;

    let store = match state.store().connect().await {
        Ok(store) => store,
        Err(err) => {
            appstats_log::error!(
                error = &err as &dyn Error,
                "failed to connect to the rollup store"
            );
            return Err(err.into());
        }
    };

    match appstats_rollup::execute(&store, &query, Utc::now()).await {
        Ok(result) if derived => Ok(ApiResponse::ok(result.with_derived_values())),
        Ok(result) => Ok(ApiResponse::ok(result)),
        Err(QueryError::Store(err)) => {
            appstats_log::error!(
                error = &err as &dyn Error,
                process = %query.process,
                "failed to scan rollups"
            );
            if err.is_connection_error() {
                state.store().reset().await;
            }
            Err(QueryError::Store(err).into())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use appstats_rollup::{BucketPath, MAX_QUERY_AMOUNT, MeasurementKind, RollupStore, encode};
    use chrono::DateTime;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};

    use super::*;
    use crate::endpoints::tests::{request, test_state};

    fn params(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(name, value)| ((*name).to_owned(), (*value).to_owned()))
            .collect()
    }

    async fn write(
        store: &RollupStore,
        kind: MeasurementKind,
        bucket: &str,
        value: f64,
        at: DateTime<Utc>,
    ) {
        let path = BucketPath::parse(bucket).unwrap();
        for request in encode(kind, &path, value, at).unwrap() {
            store.upsert(&request).await.unwrap();
        }
    }

    /// Returns the daily point of the date of `at`.
    ///
    /// Queries ask for two days so the point is still found when midnight passes mid-test.
    fn point_on(body: &serde_json::Value, at: DateTime<Utc>) -> &serde_json::Value {
        let date = at.format("%Y-%m-%d").to_string();
        body["data"]["list"]
            .as_array()
            .unwrap()
            .iter()
            .find(|point| point["date"] == date.as_str())
            .unwrap()
    }

    #[test]
    fn test_parse_query() {
        let (query, derived) = parse_query(
            "route".to_owned(),
            params(&[
                ("data", "c_count,t_time"),
                ("period", "hour"),
                ("amount", "5"),
                ("group", "route,*"),
                ("app", "web"),
                ("f_route", "/login"),
                ("derived", "true"),
                ("unknown", "x"),
            ]),
            2,
        )
        .unwrap();

        assert!(derived);
        insta::assert_debug_snapshot!(query, @r###"
        Query {
            process: "route",
            fields: [
                "c_count",
                "t_time",
            ],
            period: Hour,
            amount: 5,
            filters: {
                "route": "/login",
            },
            groups: [
                "route",
                "*",
            ],
            app: Some(
                "web",
            ),
        }
        "###);
    }

    #[test]
    fn test_parse_amount() {
        let amount = |value: &str| {
            parse_query("route".to_owned(), params(&[("amount", value)]), 2)
                .unwrap()
                .0
                .amount
        };

        assert_eq!(amount("7"), 7);
        assert_eq!(amount("0"), 1);
        assert_eq!(amount("-3"), 1);
        assert_eq!(amount("many"), 2);
        assert_eq!(amount("32767"), MAX_QUERY_AMOUNT);
        assert_eq!(amount("32768"), 2);
        assert_eq!(amount("150000"), 2);
    }

    #[test]
    fn test_parse_invalid_period() {
        let result = parse_query("route".to_owned(), params(&[("period", "week")]), 2);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_query_counter() {
        let (state, _rx) = test_state();
        let store = state.store().connect().await.unwrap();
        let at = Utc::now();
        write(&store, MeasurementKind::Counter, "web.route#/login.count", 3.0, at).await;

        let (status, body) = request(
            state,
            Request::get("/api/stats/route?data=c_count&amount=2")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["error_code"], 0);
        assert_eq!(body["data"]["list"].as_array().unwrap().len(), 2);
        assert_eq!(point_on(&body, at)["c_count"], 3.0);
    }

    #[tokio::test]
    async fn test_query_grouped_by_app() {
        let (state, _rx) = test_state();
        let store = state.store().connect().await.unwrap();
        let at = Utc::now();
        write(&store, MeasurementKind::Counter, "web.route.count", 1.0, at).await;
        write(&store, MeasurementKind::Counter, "api.route.count", 2.0, at).await;

        let (status, body) = request(
            state,
            Request::get("/api/stats/route?data=c_count&group=*")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let groups = body["data"]["group"].as_array().unwrap();
        assert_eq!(groups.len(), 2);
        for group in groups {
            assert_eq!(group["list"].as_array().unwrap().len(), 2);
            assert!(group["groups"]["*"].is_string());
        }
    }

    #[tokio::test]
    async fn test_query_derived_timer() {
        let (state, _rx) = test_state();
        let store = state.store().connect().await.unwrap();
        let at = Utc::now();
        write(&store, MeasurementKind::Timer, "web.route.time", 10.0, at).await;
        write(&store, MeasurementKind::Timer, "web.route.time", 30.0, at).await;

        let (_, raw) = request(
            state.clone(),
            Request::get("/api/stats/route?data=t_time,tc_time&amount=2")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(point_on(&raw, at)["t_time"], 40.0);

        let (_, derived) = request(
            state,
            Request::get("/api/stats/route?data=t_time,tc_time&amount=2&derived=true")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(point_on(&derived, at)["t_time"], 20.0);
        assert_eq!(point_on(&derived, at)["tc_time"], 2.0);
    }

    #[tokio::test]
    async fn test_query_unknown_process() {
        let (state, _rx) = test_state();

        let (status, body) = request(
            state,
            Request::get("/api/stats/checkout?data=c_count")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_code"], 2);
        assert_eq!(body["error_message"], "process not found: checkout");
        assert!(body["data"].is_null());
    }

    #[tokio::test]
    async fn test_query_missing_data() {
        let (state, _rx) = test_state();

        let (status, body) = request(
            state,
            Request::get("/api/stats/route").body(Body::empty()).unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], 1);
    }

    #[tokio::test]
    async fn test_query_invalid_app() {
        let (state, _rx) = test_state();
        let store = state.store().connect().await.unwrap();
        let at = Utc::now();
        write(&store, MeasurementKind::Counter, "web.route.count", 1.0, at).await;

        let (status, body) = request(
            state,
            Request::get("/api/stats/route?data=c_count&app=_web")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error_code"], 1);
    }

    #[tokio::test]
    async fn test_query_missing_group_field() {
        let (state, _rx) = test_state();
        let store = state.store().connect().await.unwrap();
        let at = Utc::now();
        write(&store, MeasurementKind::Counter, "web.route.count", 1.0, at).await;

        let (status, body) = request(
            state,
            Request::get("/api/stats/route?data=c_count&group=method")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["error_code"], 3);
    }

    #[tokio::test]
    async fn test_query_hour_period() {
        let (state, _rx) = test_state();
        let store = state.store().connect().await.unwrap();
        let at = Utc::now();
        write(&store, MeasurementKind::Counter, "web.route.count", 1.0, at).await;

        let (status, body) = request(
            state,
            Request::get("/api/stats/route?data=c_count&period=hour&amount=2")
                .body(Body::empty())
                .unwrap(),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        let points = body["data"]["list"].as_array().unwrap();
        assert!(!points.is_empty());
        assert!(points.iter().all(|point| point["hour"].is_u64()));
        assert!(points.iter().all(|point| point.get("minute").is_none()));

        let total: f64 = points.iter().map(|p| p["c_count"].as_f64().unwrap()).sum();
        assert_eq!(total, 1.0);
    }
}
