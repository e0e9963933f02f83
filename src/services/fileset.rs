//! File-set reconciliation and garbage collection.
//!
//! Only heads carrying a provenance tag (`FileSetFile`, `DerivedFrom`,
//! `OriginalDeposit`) are ever touched here. Metadata objects belong to the
//! metadata slot and are left alone.

use crate::{
    models::{
        object::ObjectVersion,
        tags::{TagKey, Tags},
    },
    services::{
        storage_service::{StorageResult, StorageService},
        tag_store,
    },
};
use sqlx::SqliteConnection;
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info};
use uuid::Uuid;

/// What a garbage-collection pass did.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct GcReport {
    /// Keys of payload-bearing objects that were deleted.
    pub deleted: Vec<String>,
    /// Keys of placeholders whose provenance tags were removed.
    pub untagged: Vec<String>,
}

async fn provenance_heads(
    storage: &StorageService,
    conn: &mut SqliteConnection,
    bucket_id: Uuid,
) -> StorageResult<Vec<(ObjectVersion, Tags)>> {
    let heads = storage
        .heads_with_any_tag(conn, bucket_id, &TagKey::PROVENANCE)
        .await?;
    let ids: Vec<Uuid> = heads.iter().map(|v| v.version_id).collect();
    let mut tags: HashMap<Uuid, Tags> = tag_store::load_many(conn, &ids).await?;
    Ok(heads
        .into_iter()
        .map(|head| {
            let head_tags = tags.remove(&head.version_id).unwrap_or_default();
            (head, head_tags)
        })
        .filter(|(_, tags)| tags.metadata_format.is_none())
        .collect())
}

/// Delete every file-set head of the bucket whose key is not in `keep`.
///
/// Returns the deleted keys.
pub async fn reconcile(
    storage: &StorageService,
    conn: &mut SqliteConnection,
    bucket_id: Uuid,
    keep: &BTreeSet<String>,
) -> StorageResult<Vec<String>> {
    let mut deleted = Vec::new();
    for (head, _) in provenance_heads(storage, conn, bucket_id).await? {
        if keep.contains(&head.key) {
            continue;
        }
        if storage.delete_version(conn, bucket_id, &head.key).await?.is_some() {
            debug!(key = %head.key, "removed from file-set");
            deleted.push(head.key);
        }
    }
    if !deleted.is_empty() {
        info!(bucket = %bucket_id, removed = deleted.len(), "reconciled file-set");
    }
    Ok(deleted)
}

/// Remove provenance-tagged objects outside `keep`.
///
/// Objects with a payload are deleted; payload-less placeholders only lose
/// their provenance tags, so a fetch still in flight finds its version intact.
pub async fn collect_garbage(
    storage: &StorageService,
    conn: &mut SqliteConnection,
    bucket_id: Uuid,
    keep: &BTreeSet<String>,
) -> StorageResult<GcReport> {
    let mut report = GcReport::default();
    for (head, _) in provenance_heads(storage, conn, bucket_id).await? {
        if keep.contains(&head.key) {
            continue;
        }
        if head.has_payload() {
            storage.delete_version(conn, bucket_id, &head.key).await?;
            report.deleted.push(head.key);
        } else {
            for key in TagKey::PROVENANCE {
                tag_store::delete(conn, head.version_id, key).await?;
            }
            report.untagged.push(head.key);
        }
    }
    Ok(report)
}

/// Collect everything that no live original deposit accounts for.
///
/// Kept: original deposits, files derived from nothing, and files derived
/// from an original deposit that is still present.
pub async fn collect_orphans(
    storage: &StorageService,
    conn: &mut SqliteConnection,
    bucket_id: Uuid,
) -> StorageResult<GcReport> {
    let heads = provenance_heads(storage, conn, bucket_id).await?;
    let originals: BTreeSet<&str> = heads
        .iter()
        .filter(|(_, tags)| tags.original_deposit)
        .map(|(head, _)| head.key.as_str())
        .collect();
    let keep: BTreeSet<String> = heads
        .iter()
        .filter(|(head, tags)| match tags.derived_from.as_deref() {
            _ if tags.original_deposit => true,
            None => true,
            Some(source) => source != head.key && originals.contains(source),
        })
        .map(|(head, _)| head.key.clone())
        .collect();
    collect_garbage(storage, conn, bucket_id, &keep).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{models::tags::TagValue, test_helpers::test_storage};
    use bytes::Bytes;

    async fn tagged(
        storage: &StorageService,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
        payload: bool,
        tags: Vec<(TagKey, TagValue)>,
    ) -> ObjectVersion {
        let version = if payload {
            storage
                .create_version_from_bytes(conn, bucket_id, key, None, Bytes::from_static(b"x"))
                .await
                .unwrap()
        } else {
            storage
                .create_version(conn, bucket_id, key, None, None)
                .await
                .unwrap()
        };
        tag_store::bulk_update(conn, version.version_id, tags).await.unwrap();
        version
    }

    fn fileset_file() -> Vec<(TagKey, TagValue)> {
        vec![(TagKey::FileSetFile, TagValue::Flag(true))]
    }

    #[tokio::test]
    async fn reconcile_deletes_only_unkept_fileset_objects() {
        let (storage, _tmp) = test_storage().await;
        let mut conn = storage.db.acquire().await.unwrap();
        let bucket = storage.create_bucket(&mut conn).await.unwrap();

        tagged(&storage, &mut conn, bucket.id, "old.txt", true, fileset_file()).await;
        tagged(&storage, &mut conn, bucket.id, "new.txt", true, fileset_file()).await;
        tagged(&storage, &mut conn, bucket.id, "untagged.txt", true, Vec::new()).await;
        tagged(
            &storage,
            &mut conn,
            bucket.id,
            ".metadata-x/sword.json",
            true,
            vec![
                (TagKey::MetadataFormat, TagValue::from("http://purl.org/net/sword/3.0/types/Metadata")),
                (TagKey::DerivedFrom, TagValue::from("bag.zip")),
            ],
        )
        .await;

        let keep = BTreeSet::from(["new.txt".to_string()]);
        let deleted = reconcile(&storage, &mut conn, bucket.id, &keep).await.unwrap();
        assert_eq!(deleted, vec!["old.txt".to_string()]);

        let old = storage.head(&mut conn, bucket.id, "old.txt").await.unwrap().unwrap();
        assert!(!old.has_payload());
        for key in ["new.txt", "untagged.txt", ".metadata-x/sword.json"] {
            let head = storage.head(&mut conn, bucket.id, key).await.unwrap().unwrap();
            assert!(head.has_payload(), "{key} should survive");
        }
    }

    #[tokio::test]
    async fn garbage_collection_untags_placeholders() {
        let (storage, _tmp) = test_storage().await;
        let mut conn = storage.db.acquire().await.unwrap();
        let bucket = storage.create_bucket(&mut conn).await.unwrap();

        let placeholder = tagged(
            &storage,
            &mut conn,
            bucket.id,
            "remote.bin",
            false,
            vec![
                (TagKey::FileSetFile, TagValue::Flag(true)),
                (TagKey::OriginalDeposit, TagValue::Flag(true)),
                (TagKey::ByReferenceUrl, TagValue::from("http://example.org/remote.bin")),
            ],
        )
        .await;
        tagged(&storage, &mut conn, bucket.id, "stale.txt", true, fileset_file()).await;

        let report = collect_garbage(&storage, &mut conn, bucket.id, &BTreeSet::new())
            .await
            .unwrap();
        assert_eq!(report.deleted, vec!["stale.txt".to_string()]);
        assert_eq!(report.untagged, vec!["remote.bin".to_string()]);

        let tags = tag_store::load(&mut conn, placeholder.version_id).await.unwrap();
        assert!(!tags.original_deposit && !tags.fileset_file && tags.derived_from.is_none());
        assert_eq!(tags.by_reference_url.as_deref(), Some("http://example.org/remote.bin"));
        let head = storage.head(&mut conn, bucket.id, "remote.bin").await.unwrap().unwrap();
        assert_eq!(head.version_id, placeholder.version_id);
    }

    #[tokio::test]
    async fn orphans_of_a_removed_original_are_collected() {
        let (storage, _tmp) = test_storage().await;
        let mut conn = storage.db.acquire().await.unwrap();
        let bucket = storage.create_bucket(&mut conn).await.unwrap();

        let derived = |source: &str| {
            vec![
                (TagKey::FileSetFile, TagValue::Flag(true)),
                (TagKey::DerivedFrom, TagValue::from(source)),
            ]
        };
        tagged(
            &storage,
            &mut conn,
            bucket.id,
            "live.zip",
            true,
            vec![(TagKey::OriginalDeposit, TagValue::Flag(true))],
        )
        .await;
        tagged(&storage, &mut conn, bucket.id, "a.txt", true, derived("live.zip")).await;
        tagged(&storage, &mut conn, bucket.id, "b.txt", true, derived("gone.zip")).await;
        tagged(&storage, &mut conn, bucket.id, "plain.txt", true, fileset_file()).await;

        let report = collect_orphans(&storage, &mut conn, bucket.id).await.unwrap();
        assert_eq!(report.deleted, vec!["b.txt".to_string()]);
        assert!(report.untagged.is_empty());
    }
}
