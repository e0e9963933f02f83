//! The deposit orchestrator.
//!
//! Every mutating operation follows the same shape: load the deposit inside
//! a transaction, check it is still a draft and that `In-Progress` is
//! acceptable, apply the object-store changes, reconcile the file-set when
//! replacing, write the deposit record, commit, and only then release the
//! background tasks the operation queued.

use crate::{
    config::AppConfig,
    errors::AppError,
    headers::ContentDisposition,
    metadata::{MetadataDocument, MetadataFormat, MetadataRegistry, SWORD_CONTEXT},
    models::{
        deposit::Deposit,
        object::{FileInstance, ObjectVersion},
        tags::{TagKey, TagValue},
    },
    packaging::{IngestResult, PackagingFormat, PackagingRegistry, Upload},
    services::{
        DepositTx,
        by_reference::{self, Admission, ByReferenceDocument, Registration},
        fileset, metadata_service, record_store,
        status::{self, Urls},
        storage_service::{SpooledPayload, StorageService},
        tag_store,
    },
    tasks::{AfterCommit, TaskScheduler},
};
use anyhow::Context;
use bytes::{Bytes, BytesMut};
use futures::{TryStreamExt, stream::BoxStream};
use serde_json::{Value, json};
use sqlx::{Sqlite, SqliteConnection, Transaction};
use std::{collections::BTreeSet, io, sync::Arc};
use tokio::fs::File;
use tracing::info;
use uuid::Uuid;

const SWORD_VERSION: &str = "http://purl.org/net/sword/3.0";

/// A request body as a stream of chunks.
pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// A SWORD request with its headers already parsed.
pub struct DepositRequest {
    pub disposition: ContentDisposition,
    /// Media type without parameters, lower-cased.
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub packaging: Option<String>,
    pub metadata_format: Option<String>,
    pub in_progress: bool,
    /// `None` when the request carried no content.
    pub body: Option<BodyStream>,
}

impl DepositRequest {
    pub fn kind(&self) -> RequestKind {
        match (
            self.disposition.is_metadata(),
            self.disposition.is_by_reference(),
        ) {
            (true, true) => RequestKind::MetadataAndByReference,
            (true, false) => RequestKind::Metadata,
            (false, true) => RequestKind::ByReference,
            (false, false) if self.body.is_some() => RequestKind::File,
            (false, false) => RequestKind::Empty,
        }
    }
}

/// What a request deposits, decided by its `Content-Disposition`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Empty,
    Metadata,
    ByReference,
    MetadataAndByReference,
    File,
}

/// The part of a deposit an endpoint addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Deposit,
    Metadata,
    Fileset,
}

impl Scope {
    fn covers_metadata(self) -> bool {
        matches!(self, Scope::Deposit | Scope::Metadata)
    }

    fn covers_files(self) -> bool {
        matches!(self, Scope::Deposit | Scope::Fileset)
    }
}

enum Files {
    None,
    Upload {
        packaging: PackagingFormat,
        payload: SpooledPayload,
        filename: Option<String>,
        content_type: Option<String>,
    },
    ByReference(Vec<Registration>),
}

/// The new contents of a single file.
enum Replacement {
    Upload(SpooledPayload),
    ByReference(Vec<Registration>),
}

struct MetadataPart {
    format: MetadataFormat,
    bytes: Bytes,
    content_type: Option<String>,
    charset: Option<String>,
}

/// A request, validated and split into its metadata and file parts before
/// anything is written. Uploaded bodies are already spooled to disk.
struct Plan {
    metadata: Option<MetadataPart>,
    files: Files,
}

/// A stored file, ready to stream.
pub struct FilePayload {
    pub version: ObjectVersion,
    pub instance: FileInstance,
    pub file: File,
}

#[derive(Clone)]
pub struct DepositService {
    storage: StorageService,
    config: Arc<AppConfig>,
    urls: Urls,
    packaging: PackagingRegistry,
    metadata: MetadataRegistry,
    scheduler: Arc<dyn TaskScheduler>,
}

impl DepositService {
    pub fn new(
        storage: StorageService,
        config: Arc<AppConfig>,
        scheduler: Arc<dyn TaskScheduler>,
    ) -> anyhow::Result<Self> {
        let packaging = PackagingRegistry::from_uris(&config.packaging_formats)
            .context("loading packaging formats")?;
        let metadata = MetadataRegistry::from_uris(&config.metadata_formats)
            .context("loading metadata formats")?;
        Ok(Self {
            storage,
            urls: Urls::new(config.base_url.clone()),
            config,
            packaging,
            metadata,
            scheduler,
        })
    }

    pub fn urls(&self) -> &Urls {
        &self.urls
    }

    pub fn service_document(&self) -> Value {
        json!({
            "@context": SWORD_CONTEXT,
            "@id": self.urls.service_document(),
            "@type": "ServiceDocument",
            "dc:title": self.config.site_name,
            "root": self.urls.service_document(),
            "acceptDeposits": true,
            "version": SWORD_VERSION,
            "maxUploadSize": self.config.max_upload_size,
            "maxByReferenceSize": self.config.max_by_reference_size,
            "acceptArchiveFormat": ["application/zip"],
            "acceptPackaging": self.packaging.uris(),
            "acceptMetadata": self.metadata.uris(),
            "staging": self.urls.staging_root(),
            "byReferenceDeposit": true,
            "maxAssembledSize": self.config.max_assembled_size,
            "maxSegments": self.config.max_segments,
            "minSegmentSize": self.config.min_segment_size,
            "maxSegmentSize": self.config.max_upload_size,
        })
    }

    async fn load(conn: &mut SqliteConnection, id: Uuid) -> Result<Deposit, AppError> {
        record_store::fetch(conn, id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("deposit {id} not found")))
    }

    fn admit(deposit: &Deposit, in_progress: Option<bool>) -> Result<(), AppError> {
        deposit.ensure_draft()?;
        if let Some(in_progress) = in_progress {
            deposit.check_in_progress(in_progress)?;
        }
        Ok(())
    }

    /// Refuse a modification before its body is read. [`Self::begin`]
    /// checks again once the transaction is open.
    async fn precheck(&self, id: Uuid, in_progress: bool) -> Result<(), AppError> {
        let mut conn = self.storage.db.acquire().await?;
        let deposit = Self::load(&mut conn, id).await?;
        Self::admit(&deposit, Some(in_progress))
    }

    /// Load a deposit for modification.
    async fn begin(
        &self,
        id: Uuid,
        in_progress: Option<bool>,
    ) -> Result<(Transaction<'static, Sqlite>, Deposit), AppError> {
        let mut tx = self.storage.db.begin().await?;
        let deposit = Self::load(&mut tx, id).await?;
        Self::admit(&deposit, in_progress)?;
        Ok((tx, deposit))
    }

    async fn commit(
        &self,
        mut tx: Transaction<'static, Sqlite>,
        deposit: &mut Deposit,
        in_progress: Option<bool>,
        after_commit: AfterCommit,
    ) -> Result<(), AppError> {
        if let Some(in_progress) = in_progress {
            deposit.apply_in_progress(in_progress)?;
        }
        record_store::save(&mut tx, deposit).await?;
        tx.commit().await?;
        after_commit.run(self.scheduler.as_ref());
        Ok(())
    }

    /// `POST /service-document`: create a deposit from whatever the request carries.
    pub async fn create_deposit(&self, request: DepositRequest) -> Result<Deposit, AppError> {
        let in_progress = request.in_progress;
        let plan = self.plan(request, Scope::Deposit).await?;
        let mut tx = self.storage.db.begin().await?;
        let bucket = self.storage.create_bucket(&mut tx).await?;
        let mut deposit = Deposit::new(bucket.id);
        record_store::insert(&mut tx, &deposit).await?;

        let mut after_commit = AfterCommit::default();
        let mut ctx = DepositTx {
            storage: &self.storage,
            conn: &mut *tx,
            deposit: &mut deposit,
        };
        self.apply(&mut ctx, plan, Scope::Deposit, false, &mut after_commit)
            .await?;
        self.commit(tx, &mut deposit, Some(in_progress), after_commit)
            .await?;
        info!(deposit = %deposit.id, status = %deposit.status, "created deposit");
        Ok(deposit)
    }

    /// `POST` (append) or `PUT` (replace) on a deposit.
    pub async fn update_deposit(
        &self,
        id: Uuid,
        request: DepositRequest,
        replace: bool,
    ) -> Result<Deposit, AppError> {
        self.update(id, request, Scope::Deposit, replace).await
    }

    pub async fn update_metadata(
        &self,
        id: Uuid,
        request: DepositRequest,
        replace: bool,
    ) -> Result<Deposit, AppError> {
        self.update(id, request, Scope::Metadata, replace).await
    }

    pub async fn update_fileset(
        &self,
        id: Uuid,
        request: DepositRequest,
        replace: bool,
    ) -> Result<Deposit, AppError> {
        self.update(id, request, Scope::Fileset, replace).await
    }

    async fn update(
        &self,
        id: Uuid,
        request: DepositRequest,
        scope: Scope,
        replace: bool,
    ) -> Result<Deposit, AppError> {
        let in_progress = request.in_progress;
        self.precheck(id, in_progress).await?;
        let plan = self.plan(request, scope).await?;
        let (mut tx, mut deposit) = self.begin(id, Some(in_progress)).await?;
        let mut after_commit = AfterCommit::default();
        let mut ctx = DepositTx {
            storage: &self.storage,
            conn: &mut *tx,
            deposit: &mut deposit,
        };
        self.apply(&mut ctx, plan, scope, replace, &mut after_commit)
            .await?;
        self.commit(tx, &mut deposit, Some(in_progress), after_commit)
            .await?;
        info!(deposit = %id, ?scope, replace, "updated deposit");
        Ok(deposit)
    }

    /// Apply a validated request within `ctx`.
    async fn apply(
        &self,
        ctx: &mut DepositTx<'_>,
        plan: Plan,
        scope: Scope,
        replace: bool,
        after_commit: &mut AfterCommit,
    ) -> Result<(), AppError> {
        if scope.covers_metadata() {
            match &plan.metadata {
                Some(part) => {
                    let document = MetadataDocument {
                        bytes: &part.bytes,
                        content_type: part
                            .content_type
                            .as_deref()
                            .unwrap_or(part.format.content_type()),
                        encoding: part.charset.as_deref(),
                    };
                    metadata_service::set_metadata(ctx, part.format, Some(document), None, replace)
                        .await?;
                }
                None if replace => metadata_service::clear_metadata(ctx, None).await?,
                None => {}
            }
        }

        let result = match plan.files {
            Files::None => IngestResult::default(),
            Files::Upload {
                packaging,
                payload,
                filename,
                content_type,
            } => {
                let upload = Upload {
                    payload,
                    filename,
                    content_type,
                };
                packaging.ingest(ctx, upload).await?
            }
            Files::ByReference(registrations) => {
                by_reference::register(ctx, &registrations, after_commit).await?
            }
        };

        if replace && scope.covers_files() {
            fileset::reconcile(ctx.storage, ctx.conn, ctx.deposit.bucket_id, &result.keys())
                .await?;
        }
        Ok(())
    }

    /// Validate `request` completely and read its body, without opening a
    /// transaction.
    async fn plan(&self, request: DepositRequest, scope: Scope) -> Result<Plan, AppError> {
        let kind = request.kind();
        let DepositRequest {
            disposition,
            content_type,
            charset,
            packaging,
            metadata_format,
            body,
            ..
        } = request;

        let mut plan = Plan {
            metadata: None,
            files: Files::None,
        };
        match (scope, kind) {
            (Scope::Metadata, _) => {
                let Some(body) = body else {
                    return Err(AppError::BadRequest {
                        message: "a metadata document is required".into(),
                        errors: Vec::new(),
                    });
                };
                let format = self.metadata.resolve(metadata_format.as_deref())?;
                let bytes = self.read_document(body).await?;
                plan.metadata = Some(MetadataPart {
                    format,
                    bytes,
                    content_type,
                    charset,
                });
            }
            (Scope::Deposit, RequestKind::Metadata) => {
                let format = self.metadata.resolve(metadata_format.as_deref())?;
                let bytes = match body {
                    Some(body) => self.read_document(body).await?,
                    None => Bytes::new(),
                };
                plan.metadata = Some(MetadataPart {
                    format,
                    bytes,
                    content_type,
                    charset,
                });
            }
            (_, RequestKind::ByReference | RequestKind::MetadataAndByReference) => {
                let Some(body) = body else {
                    return Err(AppError::ContentMalformed(
                        "a by-reference document is required".into(),
                    ));
                };
                let document = ByReferenceDocument::parse(&self.read_document(body).await?)?;
                if scope == Scope::Deposit {
                    if let Some(metadata) = document.metadata.as_ref() {
                        let format = self.metadata.resolve(metadata_format.as_deref())?;
                        let bytes = serde_json::to_vec(metadata).map_err(|err| {
                            AppError::ContentMalformed(err.to_string())
                        })?;
                        plan.metadata = Some(MetadataPart {
                            format,
                            bytes: Bytes::from(bytes),
                            content_type: None,
                            charset: None,
                        });
                    }
                }
                plan.files = Files::ByReference(self.admission().validate(&document.files)?);
            }
            (_, RequestKind::File | RequestKind::Metadata) => {
                if let Some(stream) = body {
                    let packaging = self.packaging.resolve(packaging.as_deref())?;
                    packaging.check_content_type(content_type.as_deref())?;
                    let payload = self
                        .storage
                        .spool_payload(stream, Some(self.config.max_upload_size))
                        .await?;
                    plan.files = Files::Upload {
                        packaging,
                        payload,
                        filename: disposition.filename().map(str::to_string),
                        content_type,
                    };
                }
            }
            (_, RequestKind::Empty) => {}
        }
        Ok(plan)
    }

    fn admission(&self) -> Admission<'_> {
        Admission {
            packaging: &self.packaging,
            urls: &self.urls,
            max_size: self.config.max_by_reference_size,
        }
    }

    /// Read a JSON request document into memory.
    async fn read_document(&self, mut body: BodyStream) -> Result<Bytes, AppError> {
        let limit = self.config.max_upload_size;
        let mut buffer = BytesMut::new();
        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|err| AppError::ContentMalformed(format!("reading request body: {err}")))?
        {
            if (buffer.len() + chunk.len()) as u64 > limit {
                return Err(AppError::MaxUploadSizeExceeded(format!(
                    "request body exceeds the maximum size of {limit} bytes"
                )));
            }
            buffer.extend_from_slice(&chunk);
        }
        Ok(buffer.freeze())
    }

    /// `DELETE /deposit/{id}`: remove the record, its bucket and every payload.
    pub async fn delete_deposit(&self, id: Uuid) -> Result<(), AppError> {
        let (mut tx, deposit) = self.begin(id, None).await?;
        record_store::delete(&mut tx, id).await?;
        let payloads = self.storage.delete_bucket(&mut tx, deposit.bucket_id).await?;
        tx.commit().await?;
        self.storage.remove_payloads(&payloads).await;
        info!(deposit = %id, payloads = payloads.len(), "deleted deposit");
        Ok(())
    }

    pub async fn delete_metadata(&self, id: Uuid) -> Result<(), AppError> {
        let (mut tx, mut deposit) = self.begin(id, None).await?;
        let mut ctx = DepositTx {
            storage: &self.storage,
            conn: &mut *tx,
            deposit: &mut deposit,
        };
        metadata_service::clear_metadata(&mut ctx, None).await?;
        self.commit(tx, &mut deposit, None, AfterCommit::default())
            .await
    }

    pub async fn delete_fileset(&self, id: Uuid) -> Result<(), AppError> {
        let (mut tx, mut deposit) = self.begin(id, None).await?;
        fileset::reconcile(&self.storage, &mut tx, deposit.bucket_id, &BTreeSet::new()).await?;
        self.commit(tx, &mut deposit, None, AfterCommit::default())
            .await
    }

    pub async fn status_document(&self, id: Uuid) -> Result<Value, AppError> {
        let mut conn = self.storage.db.acquire().await?;
        let deposit = Self::load(&mut conn, id).await?;
        Ok(status::status_document(&self.storage, &mut conn, &self.urls, &deposit).await?)
    }

    /// The stored metadata document with its canonical `@id`, and its format.
    pub async fn metadata_document(&self, id: Uuid) -> Result<(MetadataFormat, Vec<u8>), AppError> {
        let mut conn = self.storage.db.acquire().await?;
        let deposit = Self::load(&mut conn, id).await?;
        let metadata = metadata_service::current_metadata(&self.storage, &mut conn, &deposit)
            .await?
            .ok_or_else(|| AppError::not_found(format!("deposit {id} has no metadata")))?;
        Ok((
            metadata.format(),
            metadata.to_wire_document(&self.urls.metadata(id)),
        ))
    }

    /// Open the payload stored under `key`.
    pub async fn file(&self, id: Uuid, key: &str) -> Result<FilePayload, AppError> {
        let mut conn = self.storage.db.acquire().await?;
        let deposit = Self::load(&mut conn, id).await?;
        let version = self
            .storage
            .head(&mut conn, deposit.bucket_id, key)
            .await?
            .filter(ObjectVersion::has_payload)
            .ok_or_else(|| AppError::not_found(format!("file `{key}` not found")))?;
        let (instance, file) = self.storage.open_payload(&mut conn, &version).await?;
        Ok(FilePayload {
            version,
            instance,
            file,
        })
    }

    /// `PUT /deposit/{id}/file/{key}`: replace one file, with a binary body
    /// or a single binary by-reference file.
    pub async fn put_file(
        &self,
        id: Uuid,
        key: &str,
        request: DepositRequest,
    ) -> Result<ObjectVersion, AppError> {
        let in_progress = request.in_progress;
        self.precheck(id, in_progress).await?;
        let file = if request.disposition.is_by_reference() {
            let body = request.body.ok_or_else(|| {
                AppError::ContentMalformed("a by-reference document is required".into())
            })?;
            let document = ByReferenceDocument::parse(&self.read_document(body).await?)?;
            if document.files.len() != 1 {
                return Err(AppError::ValidationFailed(
                    "exactly one by-reference file is required to replace a file".into(),
                ));
            }
            let mut registrations = self.admission().validate(&document.files)?;
            if registrations
                .iter()
                .any(|registration| registration.packaging != PackagingFormat::Binary)
            {
                return Err(AppError::PackagingFormatNotAcceptable(
                    "only binary packaging can replace a single file".into(),
                ));
            }
            for registration in &mut registrations {
                registration.filename = key.to_string();
            }
            Replacement::ByReference(registrations)
        } else {
            let body = request.body.ok_or_else(|| AppError::BadRequest {
                message: "a file body is required".into(),
                errors: Vec::new(),
            })?;
            let payload = self
                .storage
                .spool_payload(body, Some(self.config.max_upload_size))
                .await?;
            Replacement::Upload(payload)
        };

        let (mut tx, mut deposit) = self.begin(id, Some(in_progress)).await?;
        let mut after_commit = AfterCommit::default();
        let version = match file {
            Replacement::ByReference(registrations) => {
                let mut ctx = DepositTx {
                    storage: &self.storage,
                    conn: &mut *tx,
                    deposit: &mut deposit,
                };
                by_reference::register(&mut ctx, &registrations, &mut after_commit)
                    .await?
                    .ingested_objects
                    .into_iter()
                    .find(|version| version.key == key)
                    .ok_or_else(|| AppError::internal(format!("file `{key}` was not registered")))?
            }
            Replacement::Upload(payload) => {
                let version = self
                    .storage
                    .create_version_from_spooled(
                        &mut tx,
                        deposit.bucket_id,
                        key,
                        request.content_type.as_deref(),
                        payload,
                    )
                    .await?;
                tag_store::set(&mut tx, version.version_id, TagKey::FileSetFile, TagValue::Flag(true))
                    .await?;
                version
            }
        };

        self.commit(tx, &mut deposit, Some(in_progress), after_commit)
            .await?;
        info!(deposit = %id, key, "replaced file");
        Ok(version)
    }

    pub async fn delete_file(&self, id: Uuid, key: &str) -> Result<(), AppError> {
        let (mut tx, mut deposit) = self.begin(id, None).await?;
        self.storage
            .delete_version(&mut tx, deposit.bucket_id, key)
            .await?
            .ok_or_else(|| AppError::not_found(format!("file `{key}` not found")))?;
        self.commit(tx, &mut deposit, None, AfterCommit::default())
            .await?;
        info!(deposit = %id, key, "deleted file");
        Ok(())
    }

    /// Run orphan collection over every deposit.
    pub async fn collect_garbage(&self) -> Result<fileset::GcReport, AppError> {
        let mut conn = self.storage.db.acquire().await?;
        let ids = record_store::list_ids(&mut conn).await?;
        drop(conn);

        let mut total = fileset::GcReport::default();
        for id in ids {
            let mut tx = self.storage.db.begin().await?;
            let Some(deposit) = record_store::fetch(&mut tx, id).await? else {
                continue;
            };
            let report = fileset::collect_orphans(&self.storage, &mut tx, deposit.bucket_id).await?;
            tx.commit().await?;
            if report != fileset::GcReport::default() {
                info!(
                    deposit = %id,
                    deleted = report.deleted.len(),
                    untagged = report.untagged.len(),
                    "collected garbage"
                );
            }
            total.deleted.extend(report.deleted);
            total.untagged.extend(report.untagged);
        }
        Ok(total)
    }
}
