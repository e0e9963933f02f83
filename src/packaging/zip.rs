//! SimpleZip packaging: every file in the archive becomes a file-set member
//! derived from the stored original.

use super::{IngestResult, PackagingError, extract_archive, ingest_extracted};
use crate::{models::object::ObjectVersion, services::DepositTx};
use tracing::info;

pub async fn unpack(
    ctx: &mut DepositTx<'_>,
    original: &ObjectVersion,
) -> Result<IngestResult, PackagingError> {
    let instance = ctx.storage.payload_of(ctx.conn, original).await?;
    let extracted = extract_archive(
        ctx.storage.payload_path(&instance),
        ctx.storage.scratch_dir(),
        ctx.storage.unpack_limit(),
    )
    .await?;

    let entries: Vec<(String, String)> = extracted
        .files
        .iter()
        .map(|name| (name.clone(), name.clone()))
        .collect();
    let created = ingest_extracted(ctx, original, &extracted, &entries).await?;

    info!(deposit = %ctx.deposit.id, original = %original.key, files = created.len(), "unpacked zip");
    Ok(IngestResult::new(Some(original.clone()), created))
}
