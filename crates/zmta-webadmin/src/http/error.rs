use axum::Json;
use axum::extract::rejection::{BytesRejection, JsonRejection, PathRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::warn;

use crate::core::{QueryError, RemoteError, StoreError};

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    /// Request refused before reaching a handler: malformed input, wrong
    /// content type, body over the size limit, unknown route.
    #[error("{message}")]
    Rejected { status: StatusCode, message: String },
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Remote(RemoteError::NotQueued { .. }) | Self::NotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::Remote(_) => StatusCode::BAD_GATEWAY,
            Self::Query(QueryError::Store(_)) | Self::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Query(_) | Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Rejected { status, .. } => *status,
        }
    }

    /// `{ "error", "status"? }`, the common error document of every route.
    pub fn body(&self) -> Map<String, Value> {
        let mut body = Map::new();
        body.insert("error".to_string(), Value::String(self.to_string()));
        if let Self::Remote(RemoteError::NotQueued { status, .. }) = self {
            body.insert("status".to_string(), json!(status));
        }
        body
    }

    /// Error response with extra members merged into the error document.
    pub fn into_response_with(
        self,
        extra: Map<String, Value>
    ) -> Response {
        let status = self.status_code();
        self.log(status);
        let mut body = self.body();
        body.extend(extra);
        (status, Json(Value::Object(body))).into_response()
    }

    fn log(
        &self,
        status: StatusCode
    ) {
        if status.is_server_error() {
            warn!("request failed: status={}, error={}", status.as_u16(), self);
        }
    }
}

macro_rules! from_rejection {
    ($($rejection:ty),+) => {$(
        impl From<$rejection> for ApiError {
            fn from(rejection: $rejection) -> Self {
                Self::Rejected {
                    status: rejection.status(),
                    message: rejection.body_text(),
                }
            }
        }
    )+};
}

from_rejection!(JsonRejection, QueryRejection, PathRejection, BytesRejection);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.into_response_with(Map::new())
    }
}
