//! Typed access to the tags of an object version.
//!
//! Values are validated with [`TagValue::parse`] before they are written, so
//! an enum-typed tag can never hold an unknown value.

use crate::{
    models::tags::{TagKey, TagValue, Tags},
    services::storage_service::StorageResult,
};
use sqlx::{QueryBuilder, SqliteConnection, sqlite::Sqlite};
use std::collections::HashMap;
use uuid::Uuid;

/// Load every tag of `version_id`.
pub async fn load(conn: &mut SqliteConnection, version_id: Uuid) -> StorageResult<Tags> {
    let pairs: Vec<(String, String)> =
        sqlx::query_as("SELECT key, value FROM object_version_tags WHERE version_id = ?")
            .bind(version_id)
            .fetch_all(&mut *conn)
            .await?;
    Ok(Tags::from_pairs(pairs)?)
}

/// Load tags for many versions in one query. Versions without tags map to
/// an empty [`Tags`].
pub async fn load_many(
    conn: &mut SqliteConnection,
    version_ids: &[Uuid],
) -> StorageResult<HashMap<Uuid, Tags>> {
    let mut result: HashMap<Uuid, Tags> = version_ids
        .iter()
        .map(|id| (*id, Tags::default()))
        .collect();
    if version_ids.is_empty() {
        return Ok(result);
    }

    let mut builder = QueryBuilder::<Sqlite>::new(
        "SELECT version_id, key, value FROM object_version_tags WHERE version_id IN (",
    );
    let mut separated = builder.separated(", ");
    for id in version_ids {
        separated.push_bind(*id);
    }
    builder.push(")");

    let rows: Vec<(Uuid, String, String)> =
        builder.build_query_as().fetch_all(&mut *conn).await?;
    for (version_id, key, value) in rows {
        let key: TagKey = key.parse()?;
        let value = TagValue::parse(key, &value)?;
        result.entry(version_id).or_default().insert(key, value);
    }
    Ok(result)
}

pub async fn get(
    conn: &mut SqliteConnection,
    version_id: Uuid,
    key: TagKey,
) -> StorageResult<Option<TagValue>> {
    let raw: Option<String> = sqlx::query_scalar(
        "SELECT value FROM object_version_tags WHERE version_id = ? AND key = ?",
    )
    .bind(version_id)
    .bind(key.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(raw.map(|raw| TagValue::parse(key, &raw)).transpose()?)
}

/// Create or overwrite one tag, rejecting values invalid for `key`.
pub async fn set(
    conn: &mut SqliteConnection,
    version_id: Uuid,
    key: TagKey,
    value: impl Into<TagValue>,
) -> StorageResult<()> {
    let raw = value.into().to_storage();
    TagValue::parse(key, &raw)?;
    sqlx::query(
        "INSERT INTO object_version_tags (version_id, key, value) VALUES (?, ?, ?)
         ON CONFLICT(version_id, key) DO UPDATE SET value = excluded.value",
    )
    .bind(version_id)
    .bind(key.as_str())
    .bind(raw)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Remove one tag; absent tags are ignored.
pub async fn delete(conn: &mut SqliteConnection, version_id: Uuid, key: TagKey) -> StorageResult<()> {
    sqlx::query("DELETE FROM object_version_tags WHERE version_id = ? AND key = ?")
        .bind(version_id)
        .bind(key.as_str())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Apply several sets in order. Each one is its own write; a failure part
/// way through leaves the earlier ones in place.
pub async fn bulk_update<I>(conn: &mut SqliteConnection, version_id: Uuid, updates: I) -> StorageResult<()>
where
    I: IntoIterator<Item = (TagKey, TagValue)>,
{
    for (key, value) in updates {
        set(conn, version_id, key, value).await?;
    }
    Ok(())
}
