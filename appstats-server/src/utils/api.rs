use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use appstats_rollup::{QueryError, StoreError};

/// Error codes of the response envelope.
///
/// Every code except [`Success`](Self::Success) maps to a fixed HTTP status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// The request succeeded.
    Success = 0,
    /// A parameter is missing or invalid.
    InvalidQuery = 1,
    /// The requested process does not exist.
    NotFound = 2,
    /// A group field is missing on a stored document.
    MissingField = 3,
    /// The store failed or the handler panicked.
    StoreFailure = 4,
}

impl ErrorCode {
    fn status(self) -> StatusCode {
        match self {
            Self::Success => StatusCode::OK,
            Self::InvalidQuery => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::MissingField => StatusCode::UNPROCESSABLE_ENTITY,
            Self::StoreFailure => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl Serialize for ErrorCode {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

/// The envelope around every API response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    error_code: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_message: Option<String>,
    data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    /// Wraps a successful result.
    pub fn ok(data: T) -> Self {
        Self {
            error_code: ErrorCode::Success,
            error_message: None,
            data: Some(data),
        }
    }
}

impl<T: Serialize> IntoResponse for ApiResponse<T> {
    fn into_response(self) -> Response {
        (self.error_code.status(), Json(self)).into_response()
    }
}

/// A failed API request.
///
/// Rendered as the envelope with `data: null` and the message of the error.
#[derive(Debug)]
pub struct ApiError {
    code: ErrorCode,
    message: String,
}

impl ApiError {
    /// Creates an error with the given code.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates an [`ErrorCode::InvalidQuery`] error.
    pub fn invalid_query(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidQuery, message)
    }
}

impl From<QueryError> for ApiError {
    fn from(error: QueryError) -> Self {
        let code = match error {
            QueryError::InvalidQuery(_) => ErrorCode::InvalidQuery,
            QueryError::NotFound(_) => ErrorCode::NotFound,
            QueryError::MissingField(_) => ErrorCode::MissingField,
            QueryError::Store(_) => ErrorCode::StoreFailure,
        };
        Self::new(code, error.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        Self::new(ErrorCode::StoreFailure, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        ApiResponse::<()> {
            error_code: self.code,
            error_message: Some(self.message),
            data: None,
        }
        .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_envelope() {
        let response = ApiResponse::<()> {
            error_code: ErrorCode::NotFound,
            error_message: Some("process not found: route".to_owned()),
            data: None,
        };

        insta::assert_json_snapshot!(response, @r###"
        {
          "error_code": 2,
          "error_message": "process not found: route",
          "data": null
        }
        "###);
    }

    #[test]
    fn test_success_envelope_omits_message() {
        insta::assert_json_snapshot!(ApiResponse::ok(vec![1, 2]), @r###"
        {
          "error_code": 0,
          "data": [
            1,
            2
          ]
        }
        "###);
    }

    #[test]
    fn test_query_error_codes() {
        let cases = [
            (QueryError::InvalidQuery("x".to_owned()), StatusCode::BAD_REQUEST),
            (QueryError::NotFound("x".to_owned()), StatusCode::NOT_FOUND),
            (QueryError::MissingField("x".to_owned()), StatusCode::UNPROCESSABLE_ENTITY),
        ];

        for (error, status) in cases {
            assert_eq!(ApiError::from(error).into_response().status(), status);
        }
    }
}
