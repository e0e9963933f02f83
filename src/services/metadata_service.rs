//! Metadata slot of a deposit: the stored metadata object plus the inline
//! SWORD metadata and projected fields on the deposit record.

use crate::{
    metadata::{Metadata, MetadataDocument, MetadataError, MetadataFormat, set_title},
    models::{
        deposit::Deposit,
        object::ObjectVersion,
        tags::{TagKey, TagValue},
    },
    services::{DepositTx, storage_service::StorageService, tag_store},
};
use bytes::Bytes;
use sqlx::SqliteConnection;
use tracing::info;
use uuid::Uuid;

/// Store, merge or clear the deposit's metadata in `format`.
///
/// With `replace` the new document supersedes whatever metadata the deposit
/// holds, in any format; `None` clears it. Without `replace` the document is
/// merged into the existing one, which must be of the same format.
///
/// Returns the metadata object written, if any.
pub async fn set_metadata(
    ctx: &mut DepositTx<'_>,
    format: MetadataFormat,
    document: Option<MetadataDocument<'_>>,
    derived_from: Option<&str>,
    replace: bool,
) -> Result<Option<ObjectVersion>, MetadataError> {
    let parsed = document
        .map(|doc| Metadata::from_document(format, doc.bytes, doc.content_type, doc.encoding))
        .transpose()?;

    let Some(mut metadata) = parsed else {
        if replace {
            clear_metadata(ctx, Some(format)).await?;
        }
        return Ok(None);
    };

    if replace {
        for other in MetadataFormat::ALL.into_iter().filter(|other| *other != format) {
            delete_metadata_object(ctx, other).await?;
        }
    } else {
        if let Some(current) = ctx.deposit.sword_metadata_format.as_deref() {
            if current != format.uri() {
                return Err(MetadataError::TypeMismatch);
            }
        }
        if let Some(existing) = load_metadata(ctx.storage, ctx.conn, ctx.deposit.bucket_id, format).await? {
            metadata = existing.merge(metadata)?;
        }
    }

    metadata.project_onto(ctx.deposit);
    ctx.deposit.sword_metadata = Some(metadata.to_sword_json());
    ctx.deposit.sword_metadata_format = Some(format.uri().to_string());

    let key = format!("{}{}", ctx.deposit.metadata_key_prefix(), format.filename());
    let version = ctx
        .storage
        .create_version_from_bytes(
            ctx.conn,
            ctx.deposit.bucket_id,
            &key,
            Some(format.content_type()),
            Bytes::from(metadata.serialize()),
        )
        .await?;

    let mut tags = vec![(TagKey::MetadataFormat, TagValue::from(format.uri()))];
    if let Some(derived_from) = derived_from {
        tags.push((TagKey::DerivedFrom, TagValue::from(derived_from)));
    }
    tag_store::bulk_update(ctx.conn, version.version_id, tags).await?;

    info!(deposit = %ctx.deposit.id, format = format.uri(), replace, "stored metadata");
    Ok(Some(version))
}

/// Delete the metadata object of `format` (every format when `None`) and
/// clear the inline metadata if it came from a deleted object.
pub async fn clear_metadata(
    ctx: &mut DepositTx<'_>,
    format: Option<MetadataFormat>,
) -> Result<(), MetadataError> {
    let formats: Vec<MetadataFormat> = match format {
        Some(format) => vec![format],
        None => MetadataFormat::ALL.to_vec(),
    };
    for format in formats {
        delete_metadata_object(ctx, format).await?;
        if ctx.deposit.sword_metadata_format.as_deref() == Some(format.uri()) {
            ctx.deposit.sword_metadata = None;
            ctx.deposit.sword_metadata_format = None;
            set_title(ctx.deposit, None);
        }
    }
    Ok(())
}

async fn delete_metadata_object(
    ctx: &mut DepositTx<'_>,
    format: MetadataFormat,
) -> Result<(), MetadataError> {
    let existing = ctx
        .storage
        .head_with_tag_value(ctx.conn, ctx.deposit.bucket_id, TagKey::MetadataFormat, format.uri())
        .await?;
    if let Some(existing) = existing {
        ctx.storage
            .delete_version(ctx.conn, ctx.deposit.bucket_id, &existing.key)
            .await?;
    }
    Ok(())
}

/// The stored metadata object of `format`, parsed.
pub async fn load_metadata(
    storage: &StorageService,
    conn: &mut SqliteConnection,
    bucket_id: Uuid,
    format: MetadataFormat,
) -> Result<Option<Metadata>, MetadataError> {
    let Some(version) = storage
        .head_with_tag_value(conn, bucket_id, TagKey::MetadataFormat, format.uri())
        .await?
    else {
        return Ok(None);
    };
    let bytes = storage.read_payload(conn, &version).await?;
    Metadata::from_document(format, &bytes, format.content_type(), None).map(Some)
}

/// The deposit's current metadata, in the format it was last stored in.
pub async fn current_metadata(
    storage: &StorageService,
    conn: &mut SqliteConnection,
    deposit: &Deposit,
) -> Result<Option<Metadata>, MetadataError> {
    let Some(format) = deposit
        .sword_metadata_format
        .as_deref()
        .and_then(MetadataFormat::from_uri)
    else {
        return Ok(None);
    };
    load_metadata(storage, conn, deposit.bucket_id, format).await
}
