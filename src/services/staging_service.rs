//! Segmented uploads: a large file is sent as numbered segments to a
//! temporary URL, then assembled into one payload that a by-reference
//! deposit can point at.

use crate::{
    headers::ContentDisposition,
    models::multipart::{SegmentedUpload, UploadSegment},
    services::storage_service::{SpooledPayload, StorageError, StorageResult, StorageService},
};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, TryStreamExt, stream};
use sqlx::SqliteConnection;
use std::{io, path::PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StagingError {
    #[error("invalid segmented upload parameters: {}", .0.join(", "))]
    InvalidParameters(Vec<String>),
    #[error("segment {number} must be exactly {expected} bytes")]
    InvalidSegmentSize { number: i64, expected: i64 },
    #[error("segmented upload {0} not found")]
    NotFound(Uuid),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Server-side bounds on segmented uploads.
#[derive(Debug, Clone, Copy)]
pub struct SegmentLimits {
    pub min_segment_size: u64,
    pub max_segment_size: u64,
    pub max_segments: u64,
    pub max_assembled_size: u64,
}

/// Parameters of a `segment-init` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentInit {
    pub segment_count: i64,
    pub segment_size: i64,
    pub size: i64,
}

impl SegmentLimits {
    /// Validate `segment-init` parameters, naming every offending one.
    pub fn validate(&self, disposition: &ContentDisposition) -> Result<SegmentInit, StagingError> {
        let mut errors = Vec::new();
        if disposition.kind() != "segment-init" {
            errors.push("Content-Disposition".to_string());
        }
        let mut number = |name: &str| -> i64 {
            match disposition.param(name).and_then(|raw| raw.trim().parse::<i64>().ok()) {
                Some(value) if value > 0 => value,
                _ => {
                    errors.push(name.to_string());
                    0
                }
            }
        };
        let segment_count = number("segment_count");
        let segment_size = number("segment_size");
        let size = number("size");
        if !errors.is_empty() {
            return Err(StagingError::InvalidParameters(errors));
        }

        let as_u64 = |value: i64| value as u64;
        if as_u64(segment_size) < self.min_segment_size
            || as_u64(segment_size) > self.max_segment_size
        {
            errors.push("segment_size".to_string());
        }
        if as_u64(segment_count) > self.max_segments {
            errors.push("segment_count".to_string());
        }
        if as_u64(size) > self.max_assembled_size {
            errors.push("size".to_string());
        }
        let capacity = segment_count.checked_mul(segment_size);
        let without_last = (segment_count - 1).checked_mul(segment_size);
        match (without_last, capacity) {
            (Some(without_last), Some(capacity)) if without_last < size && size <= capacity => {}
            _ => errors.push("size".to_string()),
        }
        errors.dedup();
        if errors.is_empty() {
            Ok(SegmentInit {
                segment_count,
                segment_size,
                size,
            })
        } else {
            Err(StagingError::InvalidParameters(errors))
        }
    }
}

pub async fn init(conn: &mut SqliteConnection, init: SegmentInit) -> StorageResult<SegmentedUpload> {
    let upload = SegmentedUpload {
        id: Uuid::new_v4(),
        segment_count: init.segment_count,
        segment_size: init.segment_size,
        size: init.size,
        file_id: None,
        completed: false,
        created_at: Utc::now(),
    };
    sqlx::query(
        "INSERT INTO segmented_uploads
            (id, segment_count, segment_size, size, file_id, completed, created_at)
         VALUES (?, ?, ?, ?, NULL, 0, ?)",
    )
    .bind(upload.id)
    .bind(upload.segment_count)
    .bind(upload.segment_size)
    .bind(upload.size)
    .bind(upload.created_at)
    .execute(&mut *conn)
    .await?;
    info!(upload = %upload.id, segments = upload.segment_count, size = upload.size, "initiated segmented upload");
    Ok(upload)
}

pub async fn find(conn: &mut SqliteConnection, id: Uuid) -> StorageResult<Option<SegmentedUpload>> {
    let upload = sqlx::query_as::<_, SegmentedUpload>(
        "SELECT id, segment_count, segment_size, size, file_id, completed, created_at
         FROM segmented_uploads WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(upload)
}

async fn segments(conn: &mut SqliteConnection, id: Uuid) -> StorageResult<Vec<UploadSegment>> {
    let segments = sqlx::query_as::<_, UploadSegment>(
        "SELECT upload_id, segment_number, file_id, size_bytes, uploaded_at
         FROM upload_segments WHERE upload_id = ? ORDER BY segment_number ASC",
    )
    .bind(id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(segments)
}

/// Segment numbers received so far.
pub async fn received(conn: &mut SqliteConnection, upload: &SegmentedUpload) -> StorageResult<Vec<i64>> {
    if upload.completed {
        return Ok((1..=upload.segment_count).collect());
    }
    Ok(segments(conn, upload.id)
        .await?
        .into_iter()
        .map(|segment| segment.segment_number)
        .collect())
}

fn check_number(upload: &SegmentedUpload, number: i64) -> Result<(), StagingError> {
    if upload.completed || number < 1 || number > upload.segment_count {
        return Err(StagingError::InvalidParameters(vec!["segment_number".into()]));
    }
    Ok(())
}

/// Spool segment `number` to disk, checking its size, without touching the
/// database.
pub async fn spool_segment<S>(
    storage: &StorageService,
    upload: &SegmentedUpload,
    number: i64,
    body: S,
) -> Result<SpooledPayload, StagingError>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    check_number(upload, number)?;
    let expected = upload.expected_segment_size(number);
    let segment = match storage.spool_payload(body, Some(expected as u64)).await {
        Ok(segment) => segment,
        Err(StorageError::PayloadTooLarge { .. }) => {
            return Err(StagingError::InvalidSegmentSize { number, expected });
        }
        Err(err) => return Err(err.into()),
    };
    if segment.size_bytes != expected as u64 {
        return Err(StagingError::InvalidSegmentSize { number, expected });
    }
    Ok(segment)
}

/// Record a spooled segment, replacing any earlier copy of it.
///
/// Returns the paths of payloads to remove after the transaction commits.
pub async fn put_segment(
    storage: &StorageService,
    conn: &mut SqliteConnection,
    upload: &SegmentedUpload,
    number: i64,
    segment: SpooledPayload,
) -> Result<Vec<PathBuf>, StagingError> {
    check_number(upload, number)?;
    let file = storage.record_payload(conn, segment).await?;
    let mut removed = Vec::new();

    let previous: Option<Uuid> = sqlx::query_scalar(
        "SELECT file_id FROM upload_segments WHERE upload_id = ? AND segment_number = ?",
    )
    .bind(upload.id)
    .bind(number)
    .fetch_optional(&mut *conn)
    .await
    .map_err(StorageError::from)?;
    sqlx::query(
        "INSERT INTO upload_segments (upload_id, segment_number, file_id, size_bytes, uploaded_at)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(upload_id, segment_number) DO UPDATE SET
             file_id = excluded.file_id,
             size_bytes = excluded.size_bytes,
             uploaded_at = excluded.uploaded_at",
    )
    .bind(upload.id)
    .bind(number)
    .bind(file.id)
    .bind(file.size_bytes)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await
    .map_err(StorageError::from)?;
    if let Some(previous) = previous {
        removed.push(storage.forget_payload(conn, previous).await?);
    }
    debug!(upload = %upload.id, number, "stored segment");
    Ok(removed)
}

/// Assemble upload `id` once every segment has arrived, and return its
/// current state.
///
/// The segments are concatenated into a spooled payload on a plain
/// connection. The transaction that follows only records it, and gives up
/// if a segment was replaced in the meantime.
pub async fn assemble_if_complete(
    storage: &StorageService,
    id: Uuid,
) -> Result<SegmentedUpload, StagingError> {
    let mut conn = storage.db.acquire().await.map_err(StorageError::from)?;
    let upload = find(&mut conn, id).await?.ok_or(StagingError::NotFound(id))?;
    let parts = segments(&mut conn, id).await?;
    if upload.completed || parts.len() as i64 != upload.segment_count {
        return Ok(upload);
    }
    let mut paths = Vec::with_capacity(parts.len());
    for segment in &parts {
        let instance = storage.file_instance(&mut conn, segment.file_id).await?;
        paths.push(storage.payload_path(&instance));
    }
    drop(conn);

    let body = stream::iter(paths)
        .then(|path: PathBuf| File::open(path))
        .map_ok(ReaderStream::new)
        .try_flatten();
    let assembled = storage.spool_payload(body, Some(upload.size as u64)).await?;

    let mut tx = storage.db.begin().await.map_err(StorageError::from)?;
    let upload = find(&mut tx, id).await?.ok_or(StagingError::NotFound(id))?;
    let unchanged = segments(&mut tx, id)
        .await?
        .iter()
        .map(|segment| segment.file_id)
        .eq(parts.iter().map(|segment| segment.file_id));
    if upload.completed || !unchanged {
        return Ok(upload);
    }
    let file = storage.record_payload(&mut tx, assembled).await?;
    sqlx::query("UPDATE segmented_uploads SET file_id = ?, completed = 1 WHERE id = ?")
        .bind(file.id)
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(StorageError::from)?;
    let removed = drop_segments(storage, &mut tx, id).await?;
    tx.commit().await.map_err(StorageError::from)?;
    storage.remove_payloads(&removed).await;
    info!(upload = %id, size = file.size_bytes, "assembled segmented upload");

    Ok(SegmentedUpload {
        file_id: Some(file.id),
        completed: true,
        ..upload
    })
}

async fn drop_segments(
    storage: &StorageService,
    conn: &mut SqliteConnection,
    upload_id: Uuid,
) -> StorageResult<Vec<PathBuf>> {
    let segments = segments(conn, upload_id).await?;
    sqlx::query("DELETE FROM upload_segments WHERE upload_id = ?")
        .bind(upload_id)
        .execute(&mut *conn)
        .await?;
    let mut removed = Vec::with_capacity(segments.len());
    for segment in segments {
        removed.push(storage.forget_payload(conn, segment.file_id).await?);
    }
    Ok(removed)
}

/// Delete an upload with its segments and assembled payload.
///
/// Returns the payload paths to remove after commit.
pub async fn delete(
    storage: &StorageService,
    conn: &mut SqliteConnection,
    id: Uuid,
) -> Result<Vec<PathBuf>, StagingError> {
    let upload = find(conn, id).await?.ok_or(StagingError::NotFound(id))?;
    let mut removed = drop_segments(storage, conn, id).await?;
    sqlx::query("DELETE FROM segmented_uploads WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(StorageError::from)?;
    if let Some(file_id) = upload.file_id {
        removed.push(storage.forget_payload(conn, file_id).await?);
    }
    info!(upload = %id, "deleted segmented upload");
    Ok(removed)
}
