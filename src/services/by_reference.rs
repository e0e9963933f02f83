//! By-reference deposits.
//!
//! Registration turns each declared remote file into a payload-less
//! placeholder carrying the reference as tags. The [`Pipeline`] later
//! downloads the payload and unpacks containers, recording progress in the
//! `FileState` tag:
//!
//! ```text
//! (none) -> Downloading -> Pending | Unpacking -> Ingested
//!                |                       |
//!                +--------> Error <------+
//! ```

use crate::{
    headers::ContentDisposition,
    models::{
        object::ObjectVersion,
        tags::{FileState, TagKey, TagValue, Tags},
    },
    packaging::{IngestResult, PackagingError, PackagingFormat, PackagingRegistry},
    services::{
        DepositTx, record_store, staging_service,
        status::Urls,
        storage_service::{StorageError, StorageService},
        tag_store,
    },
    tasks::{AfterCommit, Task, TaskError, TaskScheduler},
};
use chrono::DateTime;
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::Value;
use sqlx::SqliteConnection;
use std::{io, sync::Arc};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

pub const BY_REFERENCE_TYPE: &str = "ByReference";
pub const METADATA_AND_BY_REFERENCE_TYPE: &str = "MetadataAndByReference";

/// One entry of `byReferenceFiles`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ByReferenceFile {
    #[serde(rename = "@id")]
    pub url: String,
    pub content_disposition: String,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    #[serde(default)]
    pub dereference: bool,
    pub packaging: Option<String>,
    pub ttl: Option<String>,
}

/// A `ByReference` or `MetadataAndByReference` request body.
#[derive(Debug, Clone, Deserialize)]
pub struct ByReferenceDocument {
    #[serde(rename = "@type")]
    pub kind: String,
    #[serde(rename = "byReferenceFiles", default)]
    pub files: Vec<ByReferenceFile>,
    #[serde(default)]
    pub metadata: Option<Value>,
}

impl ByReferenceDocument {
    pub fn parse(bytes: &[u8]) -> Result<Self, PackagingError> {
        let document: ByReferenceDocument = serde_json::from_slice(bytes)
            .map_err(|err| PackagingError::ContentMalformed(err.to_string()))?;
        match document.kind.as_str() {
            BY_REFERENCE_TYPE | METADATA_AND_BY_REFERENCE_TYPE => Ok(document),
            other => Err(PackagingError::ContentMalformed(format!(
                "unexpected document type `{other}`"
            ))),
        }
    }
}

/// Where a registered file's bytes come from.
#[derive(Debug, Clone, PartialEq)]
pub enum Source {
    Remote,
    /// A completed segmented upload on this server.
    Staged(Uuid),
}

/// A validated by-reference file, ready to register.
#[derive(Debug, Clone)]
pub struct Registration {
    pub source: Source,
    pub url: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    pub dereference: bool,
    pub packaging: PackagingFormat,
    pub ttl: Option<String>,
}

/// Admission rules for by-reference files.
pub struct Admission<'a> {
    pub packaging: &'a PackagingRegistry,
    pub urls: &'a Urls,
    pub max_size: u64,
}

impl Admission<'_> {
    /// Validate every file before anything is created.
    pub fn validate(&self, files: &[ByReferenceFile]) -> Result<Vec<Registration>, PackagingError> {
        files.iter().map(|file| self.validate_one(file)).collect()
    }

    fn validate_one(&self, file: &ByReferenceFile) -> Result<Registration, PackagingError> {
        let url = Url::parse(&file.url).map_err(|err| {
            PackagingError::ContentMalformed(format!("invalid by-reference URL `{}`: {err}", file.url))
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PackagingError::ContentMalformed(format!(
                "by-reference URL `{}` must be http or https",
                file.url
            )));
        }
        let filename = ContentDisposition::parse(&file.content_disposition)
            .filename()
            .map(str::to_string)
            .ok_or_else(|| {
                PackagingError::ContentMalformed(format!(
                    "no filename in contentDisposition of `{}`",
                    file.url
                ))
            })?;
        let packaging = self.packaging.resolve(file.packaging.as_deref())?;
        packaging.check_content_type(file.content_type.as_deref())?;
        if let Some(ttl) = &file.ttl {
            DateTime::parse_from_rfc3339(ttl).map_err(|err| {
                PackagingError::ContentMalformed(format!("invalid ttl `{ttl}`: {err}"))
            })?;
        }
        if file.content_length.is_some_and(|length| length > self.max_size) {
            return Err(StorageError::PayloadTooLarge {
                limit: self.max_size,
            }
            .into());
        }
        let source = match self.urls.staging_id(&file.url) {
            Some(id) => Source::Staged(id),
            None => Source::Remote,
        };
        Ok(Registration {
            source,
            url: file.url.clone(),
            filename,
            content_type: file.content_type.clone(),
            content_length: file.content_length,
            dereference: file.dereference,
            packaging,
            ttl: file.ttl.clone(),
        })
    }
}

/// Create the objects for validated registrations.
///
/// Remote files become placeholders; a fetch is queued on `after_commit`
/// for each one marked `dereference`. Staged files are ingested at once
/// from the assembled upload.
pub async fn register(
    ctx: &mut DepositTx<'_>,
    registrations: &[Registration],
    after_commit: &mut AfterCommit,
) -> Result<IngestResult, PackagingError> {
    let mut result = IngestResult::default();
    for registration in registrations {
        let key = registration.packaging.original_deposit_filename(
            &ctx.deposit.original_deposit_key_prefix(),
            Some(&registration.filename),
            registration.content_type.as_deref(),
        );
        match registration.source {
            Source::Staged(upload_id) => {
                let ingested = ingest_staged(ctx, registration, upload_id, &key).await?;
                result.extend(ingested);
            }
            Source::Remote => {
                let placeholder = create_placeholder(ctx, registration, &key).await?;
                if registration.dereference {
                    after_commit.push(Task::FetchByReference {
                        version_id: placeholder.version_id,
                    });
                }
                result.extend(IngestResult::new(Some(placeholder), Vec::new()));
            }
        }
    }
    Ok(result)
}

async fn create_placeholder(
    ctx: &mut DepositTx<'_>,
    registration: &Registration,
    key: &str,
) -> Result<ObjectVersion, PackagingError> {
    let placeholder = ctx
        .storage
        .create_version(
            ctx.conn,
            ctx.deposit.bucket_id,
            key,
            registration.content_type.as_deref(),
            None,
        )
        .await?;
    registration
        .packaging
        .tag_original(ctx.conn, &placeholder)
        .await?;

    let mut tags = vec![
        (TagKey::ByReferenceUrl, TagValue::from(registration.url.as_str())),
        (TagKey::ByReferenceDereference, TagValue::Flag(registration.dereference)),
    ];
    if let Some(ttl) = &registration.ttl {
        tags.push((TagKey::ByReferenceTtl, TagValue::from(ttl.as_str())));
    }
    if let Some(length) = registration.content_length {
        tags.push((TagKey::ByReferenceContentLength, TagValue::Length(length)));
    }
    tag_store::bulk_update(ctx.conn, placeholder.version_id, tags).await?;

    info!(
        deposit = %ctx.deposit.id,
        key,
        url = %registration.url,
        dereference = registration.dereference,
        "registered by-reference file"
    );
    Ok(placeholder)
}

async fn ingest_staged(
    ctx: &mut DepositTx<'_>,
    registration: &Registration,
    upload_id: Uuid,
    key: &str,
) -> Result<IngestResult, PackagingError> {
    let upload = staging_service::find(ctx.conn, upload_id)
        .await?
        .filter(|upload| upload.completed)
        .ok_or_else(|| {
            PackagingError::ValidationFailed(format!(
                "segmented upload `{}` is missing or incomplete",
                registration.url
            ))
        })?;
    let Some(file_id) = upload.file_id else {
        return Err(StorageError::CorruptRecord(format!(
            "completed upload {upload_id} has no payload"
        ))
        .into());
    };
    let assembled = ctx.storage.file_instance(ctx.conn, file_id).await?;
    let copy = ctx.storage.copy_payload(ctx.conn, &assembled).await?;
    let original = ctx
        .storage
        .create_version(
            ctx.conn,
            ctx.deposit.bucket_id,
            key,
            registration.content_type.as_deref(),
            Some(copy.id),
        )
        .await?;
    registration.packaging.tag_original(ctx.conn, &original).await?;
    tag_store::set(
        ctx.conn,
        original.version_id,
        TagKey::ByReferenceUrl,
        registration.url.as_str(),
    )
    .await?;
    info!(deposit = %ctx.deposit.id, key, upload = %upload_id, "ingesting staged upload");

    registration.packaging.unpack(ctx, &original).await
}

/// Executes by-reference fetches and deferred unpacks.
#[derive(Clone)]
pub struct Pipeline {
    storage: StorageService,
    http: reqwest::Client,
    max_size: u64,
    scheduler: Arc<dyn TaskScheduler>,
}

impl Pipeline {
    pub fn new(
        storage: StorageService,
        http: reqwest::Client,
        max_size: u64,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> Self {
        Self {
            storage,
            http,
            max_size,
            scheduler,
        }
    }

    pub async fn execute(&self, task: Task) -> Result<(), TaskError> {
        match task {
            Task::FetchByReference { version_id } => self.fetch(version_id).await,
            Task::UnpackObject { version_id } => self.unpack(version_id).await,
        }
    }

    /// The current head for `version_id`, or `None` if it was superseded
    /// or deleted.
    async fn live_version(
        &self,
        conn: &mut SqliteConnection,
        version_id: Uuid,
    ) -> Result<Option<(ObjectVersion, Tags)>, TaskError> {
        let Some(version) = self.storage.get_version(conn, version_id).await? else {
            debug!(version = %version_id, "object version no longer exists");
            return Ok(None);
        };
        if !version.is_head {
            debug!(version = %version_id, key = %version.key, "object version superseded");
            return Ok(None);
        }
        let tags = tag_store::load(conn, version_id).await?;
        Ok(Some((version, tags)))
    }

    async fn mark_error(&self, conn: &mut SqliteConnection, version_id: Uuid) {
        if let Err(err) = tag_store::set(conn, version_id, TagKey::FileState, FileState::Error).await {
            warn!(version = %version_id, error = %err, "cannot record error state");
        }
    }

    fn packaging_of(tags: &Tags) -> Result<PackagingFormat, TaskError> {
        match tags.packaging.as_deref() {
            None => Ok(PackagingFormat::Binary),
            Some(uri) => {
                PackagingFormat::from_uri(uri).ok_or_else(|| TaskError::UnknownPackaging(uri.into()))
            }
        }
    }

    /// Download the payload of a by-reference placeholder.
    pub async fn fetch(&self, version_id: Uuid) -> Result<(), TaskError> {
        let mut conn = self.storage.db.acquire().await?;
        let Some((version, tags)) = self.live_version(&mut conn, version_id).await? else {
            return Ok(());
        };
        let Some(url) = tags.by_reference_url.clone() else {
            return Err(TaskError::MissingUrl(version_id));
        };

        tag_store::set(&mut conn, version_id, TagKey::FileState, FileState::Downloading).await?;
        match self.download(&mut conn, &version, &tags, &url).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.mark_error(&mut conn, version_id).await;
                Err(err)
            }
        }
    }

    async fn download(
        &self,
        conn: &mut SqliteConnection,
        version: &ObjectVersion,
        tags: &Tags,
        url: &str,
    ) -> Result<(), TaskError> {
        let packaging = Self::packaging_of(tags)?;
        info!(key = %version.key, url, "fetching by-reference file");

        let response = self.http.get(url).send().await?.error_for_status()?;
        if response
            .content_length()
            .is_some_and(|length| length > self.max_size)
        {
            return Err(StorageError::PayloadTooLarge {
                limit: self.max_size,
            }
            .into());
        }
        let body = response.bytes_stream().map_err(io::Error::other);
        let file = self
            .storage
            .store_payload(conn, body, Some(self.max_size))
            .await?;

        if self.live_version(conn, version.version_id).await?.is_none() {
            let path = self.storage.forget_payload(conn, file.id).await?;
            self.storage.remove_payloads(&[path]).await;
            return Ok(());
        }
        self.storage
            .attach_payload(conn, version, file.id)
            .await?;

        if packaging == PackagingFormat::Binary {
            tag_store::set(conn, version.version_id, TagKey::FileState, FileState::Pending).await?;
        } else {
            tag_store::set(conn, version.version_id, TagKey::FileState, FileState::Unpacking)
                .await?;
            self.scheduler.schedule(Task::UnpackObject {
                version_id: version.version_id,
            });
        }
        info!(key = %version.key, size = file.size_bytes, "fetched by-reference file");
        Ok(())
    }

    /// Unpack a downloaded container into its deposit.
    pub async fn unpack(&self, version_id: Uuid) -> Result<(), TaskError> {
        let mut tx = self.storage.db.begin().await?;
        let Some((version, tags)) = self.live_version(&mut tx, version_id).await? else {
            return Ok(());
        };
        match self.unpack_in(&mut tx, &version, &tags).await {
            Ok(()) => {
                tx.commit().await?;
                info!(key = %version.key, "unpacked by-reference container");
                Ok(())
            }
            Err(err) => {
                tx.rollback().await?;
                let mut conn = self.storage.db.acquire().await?;
                self.mark_error(&mut conn, version_id).await;
                Err(err)
            }
        }
    }

    async fn unpack_in(
        &self,
        conn: &mut SqliteConnection,
        version: &ObjectVersion,
        tags: &Tags,
    ) -> Result<(), TaskError> {
        let packaging = Self::packaging_of(tags)?;
        let mut deposit = record_store::find_by_bucket(conn, version.bucket_id)
            .await?
            .ok_or(TaskError::DepositMissing(version.bucket_id))?;
        let mut ctx = DepositTx {
            storage: &self.storage,
            conn: &mut *conn,
            deposit: &mut deposit,
        };
        packaging.unpack(&mut ctx, version).await?;
        tag_store::set(conn, version.version_id, TagKey::FileState, FileState::Ingested).await?;
        record_store::save(conn, &mut deposit).await?;
        Ok(())
    }

    /// Reschedule work interrupted by a restart.
    ///
    /// Heads left `Downloading` or `Unpacking` are retried, as are
    /// placeholders marked for dereference whose fetch never started.
    pub async fn resume_pending(&self) -> Result<usize, TaskError> {
        let mut conn = self.storage.db.acquire().await?;
        let mut scheduled = 0;

        let in_flight = self
            .storage
            .all_heads_with_tag_values(
                &mut conn,
                TagKey::FileState,
                &[
                    TagValue::State(FileState::Downloading).to_storage(),
                    TagValue::State(FileState::Unpacking).to_storage(),
                ],
            )
            .await?;
        let ids: Vec<Uuid> = in_flight.iter().map(|v| v.version_id).collect();
        let tags = tag_store::load_many(&mut conn, &ids).await?;
        for version in &in_flight {
            let task = match tags.get(&version.version_id).and_then(|t| t.file_state) {
                Some(FileState::Unpacking) if version.has_payload() => Task::UnpackObject {
                    version_id: version.version_id,
                },
                _ => Task::FetchByReference {
                    version_id: version.version_id,
                },
            };
            self.scheduler.schedule(task);
            scheduled += 1;
        }

        let waiting = self
            .storage
            .all_heads_with_tag_values(
                &mut conn,
                TagKey::ByReferenceDereference,
                &[TagValue::Flag(true).to_storage()],
            )
            .await?;
        let ids: Vec<Uuid> = waiting.iter().map(|v| v.version_id).collect();
        let tags = tag_store::load_many(&mut conn, &ids).await?;
        for version in waiting.iter().filter(|v| !v.has_payload()) {
            if tags.get(&version.version_id).is_some_and(|t| t.file_state.is_none()) {
                self.scheduler.schedule(Task::FetchByReference {
                    version_id: version.version_id,
                });
                scheduled += 1;
            }
        }

        if scheduled > 0 {
            info!(scheduled, "resumed interrupted by-reference work");
        }
        Ok(scheduled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::deposit::Deposit,
        test_helpers::{RecordingScheduler, serve_remote, test_storage, zip_bytes},
    };
    use axum::{Router, http::StatusCode, routing::get};
    use bytes::Bytes;

    fn admission<'a>(registry: &'a PackagingRegistry, urls: &'a Urls) -> Admission<'a> {
        Admission {
            packaging: registry,
            urls,
            max_size: 1024,
        }
    }

    fn file(url: &str) -> ByReferenceFile {
        ByReferenceFile {
            url: url.into(),
            content_disposition: "attachment; filename=remote.bin".into(),
            content_type: Some("application/octet-stream".into()),
            content_length: None,
            dereference: true,
            packaging: None,
            ttl: None,
        }
    }

    #[test]
    fn document_type_is_checked() {
        let doc = br#"{"@type": "ByReference", "byReferenceFiles": [{
            "@id": "http://example.org/a.bin",
            "contentDisposition": "attachment; filename=a.bin",
            "contentType": "application/octet-stream",
            "dereference": true
        }]}"#;
        let parsed = ByReferenceDocument::parse(doc).unwrap();
        assert_eq!(parsed.files.len(), 1);
        assert!(parsed.files[0].dereference);
        assert!(matches!(
            ByReferenceDocument::parse(br#"{"@type": "Metadata"}"#),
            Err(PackagingError::ContentMalformed(_))
        ));
    }

    #[test]
    fn admission_rejects_bad_files() {
        let registry = PackagingRegistry::default();
        let urls = Urls::new("http://sword.example");
        let admission = admission(&registry, &urls);

        assert!(matches!(
            admission.validate(&[file("ftp://example.org/a")]),
            Err(PackagingError::ContentMalformed(_))
        ));
        let mut too_big = file("http://example.org/a");
        too_big.content_length = Some(4096);
        assert!(matches!(
            admission.validate(&[too_big]),
            Err(PackagingError::Storage(StorageError::PayloadTooLarge { limit: 1024 }))
        ));
        let mut no_name = file("http://example.org/a");
        no_name.content_disposition = "attachment".into();
        assert!(admission.validate(&[no_name]).is_err());
        let mut zip = file("http://example.org/a.zip");
        zip.packaging = Some(PackagingFormat::SimpleZip.uri().into());
        assert!(matches!(
            admission.validate(&[zip]),
            Err(PackagingError::ContentTypeNotAcceptable { .. })
        ));

        let upload = Uuid::new_v4();
        let staged = admission.validate(&[file(&urls.staging(upload))]).unwrap();
        assert_eq!(staged[0].source, Source::Staged(upload));
    }

    #[tokio::test]
    async fn register_queues_exactly_one_fetch() {
        let (storage, _tmp) = test_storage().await;
        let mut conn = storage.db.acquire().await.unwrap();
        let bucket = storage.create_bucket(&mut conn).await.unwrap();
        let mut deposit = Deposit::new(bucket.id);
        let registry = PackagingRegistry::default();
        let urls = Urls::new("http://sword.example");
        let mut lazy = file("http://example.org/lazy.bin");
        lazy.dereference = false;
        lazy.content_disposition = "attachment; filename=lazy.bin".into();
        let registrations = admission(&registry, &urls)
            .validate(&[file("http://example.org/remote.bin"), lazy])
            .unwrap();

        let mut after_commit = AfterCommit::default();
        let mut ctx = DepositTx {
            storage: &storage,
            conn: &mut conn,
            deposit: &mut deposit,
        };
        let result = register(&mut ctx, &registrations, &mut after_commit)
            .await
            .unwrap();

        assert_eq!(result.keys().len(), 2);
        assert_eq!(after_commit.tasks().len(), 1);
        let placeholder = storage
            .head(&mut conn, bucket.id, "remote.bin")
            .await
            .unwrap()
            .unwrap();
        assert!(!placeholder.has_payload());
        assert_eq!(
            after_commit.tasks()[0],
            Task::FetchByReference {
                version_id: placeholder.version_id
            }
        );
        let tags = tag_store::load(&mut conn, placeholder.version_id).await.unwrap();
        assert!(tags.original_deposit && tags.fileset_file);
        assert_eq!(tags.by_reference_url.as_deref(), Some("http://example.org/remote.bin"));
        assert_eq!(tags.file_state, None);
    }

    async fn placeholder(
        storage: &StorageService,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
        url: &str,
        packaging: PackagingFormat,
        mimetype: &str,
    ) -> ObjectVersion {
        let version = storage
            .create_version(conn, bucket_id, key, Some(mimetype), None)
            .await
            .unwrap();
        packaging.tag_original(conn, &version).await.unwrap();
        tag_store::bulk_update(
            conn,
            version.version_id,
            [
                (TagKey::ByReferenceUrl, TagValue::from(url)),
                (TagKey::ByReferenceDereference, TagValue::Flag(true)),
            ],
        )
        .await
        .unwrap();
        version
    }

    fn remote() -> Router {
        Router::new()
            .route("/data.bin", get(|| async { Bytes::from_static(b"remote bytes") }))
            .route(
                "/archive.zip",
                get(|| async { zip_bytes(&[("one.txt", b"1"), ("dir/two.txt", b"2")]) }),
            )
            .route("/missing", get(|| async { StatusCode::NOT_FOUND }))
    }

    #[tokio::test]
    async fn binary_fetch_attaches_payload() {
        let (storage, _tmp) = test_storage().await;
        let base = serve_remote(remote()).await;
        let scheduler = Arc::new(RecordingScheduler::default());
        let pipeline = Pipeline::new(storage.clone(), reqwest::Client::new(), 1024, scheduler.clone());
        let mut conn = storage.db.acquire().await.unwrap();
        let bucket = storage.create_bucket(&mut conn).await.unwrap();
        let version = placeholder(
            &storage,
            &mut conn,
            bucket.id,
            "data.bin",
            &format!("{base}/data.bin"),
            PackagingFormat::Binary,
            "application/octet-stream",
        )
        .await;
        drop(conn);

        pipeline.fetch(version.version_id).await.unwrap();

        let mut conn = storage.db.acquire().await.unwrap();
        let head = storage.head(&mut conn, bucket.id, "data.bin").await.unwrap().unwrap();
        assert_eq!(head.version_id, version.version_id);
        assert_eq!(storage.read_payload(&mut conn, &head).await.unwrap(), b"remote bytes");
        let tags = tag_store::load(&mut conn, head.version_id).await.unwrap();
        assert_eq!(tags.file_state, Some(FileState::Pending));
        assert!(scheduler.tasks().is_empty());
    }

    #[tokio::test]
    async fn container_fetch_then_unpack() {
        let (storage, _tmp) = test_storage().await;
        let base = serve_remote(remote()).await;
        let scheduler = Arc::new(RecordingScheduler::default());
        let pipeline = Pipeline::new(storage.clone(), reqwest::Client::new(), 1 << 20, scheduler.clone());
        let mut conn = storage.db.acquire().await.unwrap();
        let bucket = storage.create_bucket(&mut conn).await.unwrap();
        let mut deposit = Deposit::new(bucket.id);
        record_store::insert(&mut conn, &deposit).await.unwrap();
        let key = format!("{}archive.zip", deposit.original_deposit_key_prefix());
        let version = placeholder(
            &storage,
            &mut conn,
            bucket.id,
            &key,
            &format!("{base}/archive.zip"),
            PackagingFormat::SimpleZip,
            "application/zip",
        )
        .await;
        drop(conn);

        pipeline.fetch(version.version_id).await.unwrap();
        assert_eq!(
            scheduler.tasks(),
            vec![Task::UnpackObject {
                version_id: version.version_id
            }]
        );
        pipeline.unpack(version.version_id).await.unwrap();

        let mut conn = storage.db.acquire().await.unwrap();
        let tags = tag_store::load(&mut conn, version.version_id).await.unwrap();
        assert_eq!(tags.file_state, Some(FileState::Ingested));
        for entry in ["one.txt", "dir/two.txt"] {
            let head = storage.head(&mut conn, bucket.id, entry).await.unwrap().unwrap();
            let entry_tags = tag_store::load(&mut conn, head.version_id).await.unwrap();
            assert_eq!(entry_tags.derived_from.as_deref(), Some(key.as_str()));
        }
        deposit = record_store::fetch(&mut conn, deposit.id).await.unwrap().unwrap();
        assert!(deposit.updated_at >= deposit.created_at);
    }

    #[tokio::test]
    async fn superseded_version_is_left_alone() {
        let (storage, _tmp) = test_storage().await;
        let scheduler = Arc::new(RecordingScheduler::default());
        let pipeline = Pipeline::new(storage.clone(), reqwest::Client::new(), 1024, scheduler);
        let mut conn = storage.db.acquire().await.unwrap();
        let bucket = storage.create_bucket(&mut conn).await.unwrap();
        let old = placeholder(
            &storage,
            &mut conn,
            bucket.id,
            "a.bin",
            "http://127.0.0.1:9/unreachable",
            PackagingFormat::Binary,
            "application/octet-stream",
        )
        .await;
        storage
            .create_version_from_bytes(&mut conn, bucket.id, "a.bin", None, Bytes::from("new"))
            .await
            .unwrap();
        drop(conn);

        pipeline.fetch(old.version_id).await.unwrap();
        pipeline.unpack(old.version_id).await.unwrap();

        let mut conn = storage.db.acquire().await.unwrap();
        let tags = tag_store::load(&mut conn, old.version_id).await.unwrap();
        assert_eq!(tags.file_state, None);
    }

    #[tokio::test]
    async fn failures_record_error_state() {
        let (storage, _tmp) = test_storage().await;
        let base = serve_remote(remote()).await;
        let scheduler = Arc::new(RecordingScheduler::default());
        let pipeline = Pipeline::new(storage.clone(), reqwest::Client::new(), 1024, scheduler);
        let mut conn = storage.db.acquire().await.unwrap();
        let bucket = storage.create_bucket(&mut conn).await.unwrap();
        let missing = placeholder(
            &storage,
            &mut conn,
            bucket.id,
            "missing.bin",
            &format!("{base}/missing"),
            PackagingFormat::Binary,
            "application/octet-stream",
        )
        .await;
        let no_url = storage
            .create_version(&mut conn, bucket.id, "no-url.bin", None, None)
            .await
            .unwrap();
        tag_store::set(&mut conn, no_url.version_id, TagKey::FileSetFile, true)
            .await
            .unwrap();
        drop(conn);

        assert!(matches!(
            pipeline.fetch(missing.version_id).await,
            Err(TaskError::Fetch(_))
        ));
        assert!(matches!(
            pipeline.fetch(no_url.version_id).await,
            Err(TaskError::MissingUrl(_))
        ));

        let mut conn = storage.db.acquire().await.unwrap();
        let tags = tag_store::load(&mut conn, missing.version_id).await.unwrap();
        assert_eq!(tags.file_state, Some(FileState::Error));
        let head = storage.head(&mut conn, bucket.id, "missing.bin").await.unwrap().unwrap();
        assert!(!head.has_payload());
    }

    #[tokio::test]
    async fn interrupted_work_is_resumed() {
        let (storage, _tmp) = test_storage().await;
        let scheduler = Arc::new(RecordingScheduler::default());
        let pipeline = Pipeline::new(storage.clone(), reqwest::Client::new(), 1024, scheduler.clone());
        let mut conn = storage.db.acquire().await.unwrap();
        let bucket = storage.create_bucket(&mut conn).await.unwrap();
        let waiting = placeholder(
            &storage,
            &mut conn,
            bucket.id,
            "waiting.bin",
            "http://example.org/w",
            PackagingFormat::Binary,
            "application/octet-stream",
        )
        .await;
        let downloading = placeholder(
            &storage,
            &mut conn,
            bucket.id,
            "downloading.bin",
            "http://example.org/d",
            PackagingFormat::Binary,
            "application/octet-stream",
        )
        .await;
        tag_store::set(&mut conn, downloading.version_id, TagKey::FileState, FileState::Downloading)
            .await
            .unwrap();
        let failed = placeholder(
            &storage,
            &mut conn,
            bucket.id,
            "failed.bin",
            "http://example.org/f",
            PackagingFormat::Binary,
            "application/octet-stream",
        )
        .await;
        tag_store::set(&mut conn, failed.version_id, TagKey::FileState, FileState::Error)
            .await
            .unwrap();
        drop(conn);

        assert_eq!(pipeline.resume_pending().await.unwrap(), 2);
        let tasks = scheduler.tasks();
        assert!(tasks.contains(&Task::FetchByReference {
            version_id: waiting.version_id
        }));
        assert!(tasks.contains(&Task::FetchByReference {
            version_id: downloading.version_id
        }));
    }
}
