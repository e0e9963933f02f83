//! Public URLs and the deposit status document.

use crate::{
    metadata::SWORD_CONTEXT,
    models::{
        deposit::Deposit,
        object::ObjectVersion,
        tags::{FileState, Tags},
    },
    packaging::{PackagingError, PackagingFormat},
    services::{storage_service::StorageService, tag_store},
};
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use serde_json::{Map, Value, json};
use sqlx::SqliteConnection;
use std::collections::{BTreeSet, HashSet};
use tracing::warn;
use uuid::Uuid;

const STATE_IN_PROGRESS: &str = "http://purl.org/net/sword/3.0/state/inProgress";
const STATE_INGESTED: &str = "http://purl.org/net/sword/3.0/state/ingested";

const REL_ORIGINAL_DEPOSIT: &str = "http://purl.org/net/sword/3.0/terms/originalDeposit";
const REL_FILESET_FILE: &str = "http://purl.org/net/sword/3.0/terms/fileSetFile";
const REL_DERIVED_RESOURCE: &str = "http://purl.org/net/sword/3.0/terms/derivedResource";
const REL_FORMATTED_METADATA: &str = "http://purl.org/net/sword/3.0/terms/formattedMetadata";

/// Characters escaped in object keys; `/` is kept so keys read as paths.
const KEY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// Builds the absolute URLs of every SWORD resource.
#[derive(Debug, Clone)]
pub struct Urls {
    base: String,
}

impl Urls {
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub fn service_document(&self) -> String {
        format!("{}/service-document", self.base)
    }

    pub fn deposit(&self, id: Uuid) -> String {
        format!("{}/deposit/{id}", self.base)
    }

    pub fn metadata(&self, id: Uuid) -> String {
        format!("{}/metadata", self.deposit(id))
    }

    pub fn fileset(&self, id: Uuid) -> String {
        format!("{}/fileset", self.deposit(id))
    }

    pub fn file(&self, id: Uuid, key: &str) -> String {
        format!(
            "{}/file/{}",
            self.deposit(id),
            utf8_percent_encode(key, KEY_ENCODE_SET)
        )
    }

    pub fn staging_root(&self) -> String {
        format!("{}/staging", self.base)
    }

    pub fn staging(&self, id: Uuid) -> String {
        format!("{}/{id}", self.staging_root())
    }

    /// The upload id of one of this server's staging URLs.
    pub fn staging_id(&self, url: &str) -> Option<Uuid> {
        let root = self.staging_root();
        url.strip_prefix(root.as_str())?
            .strip_prefix('/')?
            .trim_end_matches('/')
            .parse()
            .ok()
    }
}

fn link(urls: &Urls, deposit: &Deposit, version: &ObjectVersion, tags: &Tags) -> Value {
    let status = match tags.file_state {
        Some(state) => state.uri(),
        None if !version.has_payload() => FileState::Pending.uri(),
        None => FileState::Ingested.uri(),
    };
    let mut rel = BTreeSet::new();
    let mut link = Map::new();
    link.insert("@id".into(), json!(urls.file(deposit.id, &version.key)));
    link.insert("contentType".into(), json!(version.mimetype));
    link.insert("status".into(), json!(status));

    if tags.original_deposit {
        rel.insert(REL_ORIGINAL_DEPOSIT);
    }
    if tags.fileset_file {
        rel.insert(REL_FILESET_FILE);
    }
    if let Some(derived_from) = &tags.derived_from {
        rel.insert(REL_DERIVED_RESOURCE);
        link.insert("derivedFrom".into(), json!(urls.file(deposit.id, derived_from)));
    }
    if let Some(packaging) = &tags.packaging {
        link.insert("packaging".into(), json!(packaging));
    }
    if let Some(format) = &tags.metadata_format {
        rel.insert(REL_FORMATTED_METADATA);
        link.insert("metadataFormat".into(), json!(format));
    }
    link.insert("rel".into(), json!(rel));
    Value::Object(link)
}

fn pending_link(urls: &Urls, deposit: &Deposit, key: &str, original: &str) -> Value {
    let rel = BTreeSet::from([REL_DERIVED_RESOURCE, REL_FILESET_FILE]);
    json!({
        "@id": urls.file(deposit.id, key),
        "contentType": mime_guess::from_path(key).first_raw(),
        "status": FileState::Pending.uri(),
        "derivedFrom": urls.file(deposit.id, original),
        "rel": rel,
    })
}

/// One link per live object in the deposit's bucket, plus pending links
/// for the entries of containers that are still being unpacked.
pub async fn links(
    storage: &StorageService,
    conn: &mut SqliteConnection,
    urls: &Urls,
    deposit: &Deposit,
) -> Result<Vec<Value>, PackagingError> {
    let heads = storage.heads(conn, deposit.bucket_id).await?;
    let ids: Vec<Uuid> = heads.iter().map(|v| v.version_id).collect();
    let tags = tag_store::load_many(conn, &ids).await?;

    let mut links = Vec::new();
    let mut unpacking = Vec::new();
    for head in &heads {
        let head_tags = tags.get(&head.version_id).cloned().unwrap_or_default();
        if !head.has_payload() && head_tags.is_empty() {
            continue;
        }
        links.push(link(urls, deposit, head, &head_tags));
        if head_tags.file_state == Some(FileState::Unpacking) {
            unpacking.push((head, head_tags));
        }
    }

    let existing: HashSet<&str> = heads
        .iter()
        .filter(|head| head.has_payload())
        .map(|head| head.key.as_str())
        .collect();
    for (original, original_tags) in unpacking {
        let Some(packaging) = original_tags
            .packaging
            .as_deref()
            .and_then(PackagingFormat::from_uri)
        else {
            continue;
        };
        match packaging.file_list(storage, conn, original).await {
            Ok(keys) => links.extend(
                keys.iter()
                    .filter(|key| !existing.contains(key.as_str()))
                    .map(|key| pending_link(urls, deposit, key, &original.key)),
            ),
            Err(err) => warn!(key = %original.key, error = %err, "cannot list container"),
        }
    }
    Ok(links)
}

/// The SWORD status document of a deposit.
pub async fn status_document(
    storage: &StorageService,
    conn: &mut SqliteConnection,
    urls: &Urls,
    deposit: &Deposit,
) -> Result<Value, PackagingError> {
    let editable = deposit.is_draft();
    let state = if editable {
        json!({"@id": STATE_IN_PROGRESS, "description": "the item is currently inProgress"})
    } else {
        json!({"@id": STATE_INGESTED, "description": "the item is ingested"})
    };
    let links = links(storage, conn, urls, deposit).await?;

    let mut document = json!({
        "@context": SWORD_CONTEXT,
        "@id": urls.deposit(deposit.id),
        "@type": "Status",
        "metadata": {"@id": urls.metadata(deposit.id)},
        "fileSet": {"@id": urls.fileset(deposit.id)},
        "service": urls.service_document(),
        "state": [state],
        "actions": {
            "getMetadata": true,
            "getFiles": true,
            "appendMetadata": editable,
            "appendFiles": editable,
            "replaceMetadata": editable,
            "replaceFiles": editable,
            "deleteMetadata": editable,
            "deleteFiles": editable,
            "deleteObject": editable,
        },
        "links": links,
    });
    if let (Some(info), Value::Object(document)) = (&deposit.bagit_info, &mut document) {
        document.insert("bagitInfo".into(), info.clone());
    }
    Ok(document)
}
