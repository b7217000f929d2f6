//! Error responses.
//!
//! Failures are reported the way the table service does it:
//! `{"odata.error":{"code":"...","message":{"lang":"en-US","value":"..."}}}`
//! with the HTTP status that belongs to the error code.

use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use tablelocal_common::{Error, ErrorKind};
use tablelocal_query::FilterError;
use tablelocal_store::BatchFailure;
use tracing::error;

/// Content type of every JSON error body
pub const ERROR_CONTENT_TYPE: &str = "application/json;odata=minimalmetadata;streaming=true;charset=utf-8";

/// Error returned by request handlers
#[derive(Debug)]
pub struct ApiError(pub Error);

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    #[serde(rename = "odata.error")]
    error: ErrorBody<'a>,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    code: &'a str,
    message: ErrorMessage,
}

#[derive(Serialize)]
struct ErrorMessage {
    lang: &'static str,
    value: String,
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        status_of(&self.0)
    }
}

/// HTTP status for an error
#[must_use]
pub fn status_of(err: &Error) -> StatusCode {
    StatusCode::from_u16(err.http_status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Serialize an error body. `index` prefixes the message with the position
/// of the failing operation inside a batch.
#[must_use]
pub fn error_body(err: &Error, index: Option<usize>) -> String {
    let value = match index {
        Some(i) => format!("{i}:{err}"),
        None => err.to_string(),
    };
    let envelope = ErrorEnvelope {
        error: ErrorBody {
            code: err.error_code(),
            message: ErrorMessage {
                lang: "en-US",
                value,
            },
        },
    };
    serde_json::to_string(&envelope).unwrap_or_default()
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.0.kind() == ErrorKind::Internal {
            error!("Request failed: {}", self.0);
        }
        let mut response = (self.status(), error_body(&self.0, None)).into_response();
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static(ERROR_CONTENT_TYPE),
        );
        response
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<FilterError> for ApiError {
    fn from(err: FilterError) -> Self {
        Self(err.into())
    }
}

impl From<BatchFailure> for ApiError {
    fn from(failure: BatchFailure) -> Self {
        Self(failure.error)
    }
}

impl From<tablelocal_common::TableNameError> for ApiError {
    fn from(err: tablelocal_common::TableNameError) -> Self {
        Self(err.into())
    }
}

impl From<tablelocal_common::KeyError> for ApiError {
    fn from(err: tablelocal_common::KeyError) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_shape() {
        let body = error_body(&Error::TableNotFound("test".into()), None);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["odata.error"]["code"], "TableNotFound");
        assert_eq!(json["odata.error"]["message"]["lang"], "en-US");
        assert_eq!(json["odata.error"]["message"]["value"], "table not found: test");
    }

    #[test]
    fn test_batch_index_prefix() {
        let body = error_body(&Error::BatchDuplicateRow, Some(3));
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert!(
            json["odata.error"]["message"]["value"]
                .as_str()
                .unwrap()
                .starts_with("3:")
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            ApiError(Error::UpdateConditionNotSatisfied).status(),
            StatusCode::PRECONDITION_FAILED
        );
        let response = ApiError(Error::Timeout).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            ERROR_CONTENT_TYPE
        );
    }
}
