//! Segmented upload endpoints under `/staging`.

use crate::{
    errors::AppError,
    handlers::{created, header_str, json_ld, parse_id},
    headers::ContentDisposition,
    metadata::SWORD_CONTEXT,
    models::multipart::SegmentedUpload,
    routes::routes::AppState,
    services::staging_service::{self, SegmentLimits, StagingError},
};
use axum::{
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::Response,
};
use futures::{StreamExt, TryStreamExt};
use serde_json::{Value, json};
use std::io;
use tracing::info;

fn limits(state: &AppState) -> SegmentLimits {
    SegmentLimits {
        min_segment_size: state.config.min_segment_size,
        max_segment_size: state.config.max_upload_size,
        max_segments: state.config.max_segments,
        max_assembled_size: state.config.max_assembled_size,
    }
}

fn disposition(headers: &HeaderMap) -> ContentDisposition {
    ContentDisposition::parse(
        header_str(headers, header::CONTENT_DISPOSITION.as_str()).unwrap_or_default(),
    )
}

fn temporary_document(state: &AppState, upload: &SegmentedUpload, received: &[i64]) -> Value {
    let expecting: Vec<i64> = (1..=upload.segment_count)
        .filter(|number| !received.contains(number))
        .collect();
    json!({
        "@context": SWORD_CONTEXT,
        "@id": state.deposits.urls().staging(upload.id),
        "@type": "Temporary",
        "segments": {
            "received": received,
            "expecting": expecting,
            "size": upload.size,
            "segment_size": upload.segment_size,
        },
    })
}

/// `POST /staging` with `Content-Disposition: segment-init; ...`
pub async fn init_staging(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let init = limits(&state).validate(&disposition(&headers))?;
    let mut conn = state.storage.db.acquire().await?;
    let upload = staging_service::init(&mut conn, init).await?;
    info!(upload = %upload.id, segments = upload.segment_count, "initiated segmented upload");
    let document = temporary_document(&state, &upload, &[]);
    created(&state.deposits.urls().staging(upload.id), document)
}

pub async fn get_staging(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, AppError> {
    let id = parse_id(&id)?;
    let mut conn = state.storage.db.acquire().await?;
    let upload = staging_service::find(&mut conn, id)
        .await?
        .ok_or(StagingError::NotFound(id))?;
    let received = staging_service::received(&mut conn, &upload).await?;
    Ok(json_ld(
        StatusCode::OK,
        temporary_document(&state, &upload, &received),
    ))
}

/// `POST /staging/{id}` with `Content-Disposition: segment; segment_number=K`
pub async fn upload_segment(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    body: Body,
) -> Result<StatusCode, AppError> {
    let id = parse_id(&id)?;
    let disposition = disposition(&headers);
    if disposition.kind() != "segment" {
        return Err(StagingError::InvalidParameters(vec!["Content-Disposition".into()]).into());
    }
    let number = disposition
        .param("segment_number")
        .and_then(|raw| raw.trim().parse::<i64>().ok())
        .ok_or_else(|| StagingError::InvalidParameters(vec!["segment_number".into()]))?;

    let mut conn = state.storage.db.acquire().await?;
    let upload = staging_service::find(&mut conn, id)
        .await?
        .ok_or(StagingError::NotFound(id))?;
    drop(conn);
    let body = body.into_data_stream().map_err(io::Error::other).boxed();
    let segment = staging_service::spool_segment(&state.storage, &upload, number, body).await?;

    let mut tx = state.storage.db.begin().await?;
    let upload = staging_service::find(&mut tx, id)
        .await?
        .ok_or(StagingError::NotFound(id))?;
    let removed =
        staging_service::put_segment(&state.storage, &mut tx, &upload, number, segment).await?;
    tx.commit().await?;
    state.storage.remove_payloads(&removed).await;

    let upload = staging_service::assemble_if_complete(&state.storage, id).await?;
    if upload.completed {
        info!(upload = %id, "segmented upload complete");
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete_staging(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    let id = parse_id(&id)?;
    let mut tx = state.storage.db.begin().await?;
    let removed = staging_service::delete(&state.storage, &mut tx, id).await?;
    tx.commit().await?;
    state.storage.remove_payloads(&removed).await;
    Ok(StatusCode::NO_CONTENT)
}
