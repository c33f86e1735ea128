//! Serves the local object store's pre-signed URLs, so local mode keeps the
//! same direct-to-store upload path as cloud mode.

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;

use crate::app_state::AppState;
use crate::services::storage::{StorageError, SSE_HEADER};

#[derive(Debug, Deserialize)]
pub struct SignedQuery {
    #[serde(default)]
    pub token: String,
}

/// Mimic the store's plain-text rejections rather than the API envelope.
fn store_error(err: StorageError) -> Response {
    let status = match err {
        StorageError::Rejected(_) => StatusCode::FORBIDDEN,
        StorageError::NotFound(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string()).into_response()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// PUT /local-store/{*key}?token=
pub async fn put_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SignedQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(store) = state.local_store.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let result = store
        .accept_upload(
            &key,
            &query.token,
            header_str(&headers, header::CONTENT_TYPE.as_str()),
            header_str(&headers, SSE_HEADER),
            body.to_vec(),
        )
        .await;

    match result {
        Ok(()) => {
            tracing::debug!(key = %key, bytes = body.len(), "Local store accepted upload");
            StatusCode::OK.into_response()
        }
        Err(e) => {
            tracing::info!(key = %key, error = %e, "Local store rejected upload");
            store_error(e)
        }
    }
}

/// GET /local-store/{*key}?token=
pub async fn get_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<SignedQuery>,
) -> Response {
    let Some(store) = state.local_store.as_ref() else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match store.serve_download(&key, &query.token).await {
        Ok((data, content_type)) => ([(header::CONTENT_TYPE, content_type)], data).into_response(),
        Err(e) => store_error(e),
    }
}
