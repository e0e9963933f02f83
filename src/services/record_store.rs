//! Persistence of deposit records in the `deposits` table.

use crate::{
    models::deposit::{Deposit, DepositRow},
    services::storage_service::{StorageError, StorageResult},
};
use chrono::Utc;
use serde_json::Value;
use sqlx::SqliteConnection;
use uuid::Uuid;

const DEPOSIT_COLUMNS: &str = "id, bucket_id, status, metadata, sword_metadata, \
     sword_metadata_format, bagit_info, created_at, updated_at";

fn to_text(value: &Option<Value>) -> Option<String> {
    value.as_ref().map(Value::to_string)
}

pub async fn insert(conn: &mut SqliteConnection, deposit: &Deposit) -> StorageResult<()> {
    sqlx::query(
        "INSERT INTO deposits (id, bucket_id, status, metadata, sword_metadata,
             sword_metadata_format, bagit_info, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(deposit.id)
    .bind(deposit.bucket_id)
    .bind(deposit.status.as_str())
    .bind(Value::Object(deposit.metadata.clone()).to_string())
    .bind(to_text(&deposit.sword_metadata))
    .bind(&deposit.sword_metadata_format)
    .bind(to_text(&deposit.bagit_info))
    .bind(deposit.created_at)
    .bind(deposit.updated_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn fetch(conn: &mut SqliteConnection, id: Uuid) -> StorageResult<Option<Deposit>> {
    let row = sqlx::query_as::<_, DepositRow>(&format!(
        "SELECT {DEPOSIT_COLUMNS} FROM deposits WHERE id = ?"
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await?;

    row.map(Deposit::try_from)
        .transpose()
        .map_err(|err| StorageError::CorruptRecord(err.to_string()))
}

/// Write every mutable field of `deposit` back, bumping `updated_at`.
pub async fn save(conn: &mut SqliteConnection, deposit: &mut Deposit) -> StorageResult<()> {
    deposit.updated_at = Utc::now();
    sqlx::query(
        "UPDATE deposits SET status = ?, metadata = ?, sword_metadata = ?,
             sword_metadata_format = ?, bagit_info = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(deposit.status.as_str())
    .bind(Value::Object(deposit.metadata.clone()).to_string())
    .bind(to_text(&deposit.sword_metadata))
    .bind(&deposit.sword_metadata_format)
    .bind(to_text(&deposit.bagit_info))
    .bind(deposit.updated_at)
    .bind(deposit.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn delete(conn: &mut SqliteConnection, id: Uuid) -> StorageResult<()> {
    sqlx::query("DELETE FROM deposits WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn find_by_bucket(
    conn: &mut SqliteConnection,
    bucket_id: Uuid,
) -> StorageResult<Option<Deposit>> {
    let id: Option<Uuid> = sqlx::query_scalar("SELECT id FROM deposits WHERE bucket_id = ?")
        .bind(bucket_id)
        .fetch_optional(&mut *conn)
        .await?;
    match id {
        Some(id) => fetch(conn, id).await,
        None => Ok(None),
    }
}

pub async fn list_ids(conn: &mut SqliteConnection) -> StorageResult<Vec<Uuid>> {
    let ids = sqlx::query_scalar("SELECT id FROM deposits ORDER BY created_at ASC")
        .fetch_all(&mut *conn)
        .await?;
    Ok(ids)
}
