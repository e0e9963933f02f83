//! Individual files of a deposit, addressed as `/deposit/{id}/file/{*key}`.
//! Payloads are streamed from disk rather than buffered.

use crate::{
    errors::AppError,
    handlers::{deposit_request, parse_id},
    models::object::{FileInstance, ObjectVersion},
    routes::routes::AppState,
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use tokio_util::io::ReaderStream;

/// Stream the head version of `key`.
pub async fn get_file(
    State(state): State<AppState>,
    Path((id, key)): Path<(String, String)>,
) -> Result<Response, AppError> {
    let payload = state.deposits.file(parse_id(&id)?, &key).await?;
    let mut response = Response::new(Body::from_stream(ReaderStream::new(payload.file)));
    set_file_headers(response.headers_mut(), &payload.version, &payload.instance);
    Ok(response)
}

/// Replace `key` with the request body, or with a single binary by-reference file.
pub async fn put_file(
    State(state): State<AppState>,
    Path((id, key)): Path<(String, String)>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, AppError> {
    let request = deposit_request(&headers, body)?;
    state.deposits.put_file(parse_id(&id)?, &key, request).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_file(
    State(state): State<AppState>,
    Path((id, key)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    state.deposits.delete_file(parse_id(&id)?, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

fn set_file_headers(headers: &mut HeaderMap, version: &ObjectVersion, instance: &FileInstance) {
    let content_type = version
        .mimetype
        .as_deref()
        .and_then(|mimetype| HeaderValue::from_str(mimetype).ok())
        .unwrap_or_else(|| HeaderValue::from_static("application/octet-stream"));
    headers.insert(header::CONTENT_TYPE, content_type);
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from(instance.size_bytes.max(0)),
    );
    if let Ok(etag) = HeaderValue::from_str(&format!("\"{}\"", instance.etag)) {
        headers.insert(header::ETAG, etag);
    }
    if let Ok(disposition) =
        HeaderValue::from_str(&format!("attachment; filename=\"{}\"", version.filename()))
    {
        headers.insert(header::CONTENT_DISPOSITION, disposition);
    }
    if let Ok(modified) = HeaderValue::from_str(&version.created_at.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, modified);
    }
}
