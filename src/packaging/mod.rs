//! Packaging formats: how a deposited container turns into a file-set.
//!
//! Each format knows how to ingest a spooled upload (store the original
//! deposit, then unpack it) and how to unpack an already stored container,
//! which is what the by-reference pipeline does once a download finishes.

pub mod bagit;
pub mod binary;
pub mod zip;

use crate::{
    metadata::MetadataError,
    models::{
        object::ObjectVersion,
        tags::{TagKey, TagValue},
    },
    services::{
        DepositTx,
        storage_service::{SpooledPayload, StorageError, StorageService},
        tag_store,
    },
};
use sqlx::SqliteConnection;
use std::{
    collections::BTreeSet,
    io::{self, Read},
    path::{Component, Path, PathBuf},
};
use tempfile::TempDir;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const ZIP_CONTENT_TYPE: &str = "application/zip";

#[derive(Debug, Error)]
pub enum PackagingError {
    #[error("content type `{found}` is not acceptable for {format}; expected `{expected}`")]
    ContentTypeNotAcceptable {
        format: &'static str,
        expected: &'static str,
        found: String,
    },
    #[error("malformed container: {0}")]
    ContentMalformed(String),
    #[error("container unpacks to more than {limit} bytes")]
    UnpackedTooLarge { limit: u64 },
    #[error("validation failed: {0}")]
    ValidationFailed(String),
    #[error("packaging format `{0}` is not supported")]
    UnknownFormat(String),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<::zip::result::ZipError> for PackagingError {
    fn from(err: ::zip::result::ZipError) -> Self {
        match err {
            ::zip::result::ZipError::Io(err) => PackagingError::Io(err),
            other => PackagingError::ContentMalformed(other.to_string()),
        }
    }
}

/// Outcome of an ingest: the original deposit (if one was stored) plus every
/// version produced, the original included.
#[derive(Debug, Clone, Default)]
pub struct IngestResult {
    pub original_deposit: Option<ObjectVersion>,
    pub ingested_objects: Vec<ObjectVersion>,
}

impl IngestResult {
    pub fn new(original_deposit: Option<ObjectVersion>, mut objects: Vec<ObjectVersion>) -> Self {
        if let Some(original) = &original_deposit {
            if !objects.iter().any(|v| v.version_id == original.version_id) {
                objects.push(original.clone());
            }
        }
        Self {
            original_deposit,
            ingested_objects: objects,
        }
    }

    pub fn keys(&self) -> BTreeSet<String> {
        self.ingested_objects.iter().map(|v| v.key.clone()).collect()
    }

    pub fn extend(&mut self, other: IngestResult) {
        if self.original_deposit.is_none() {
            self.original_deposit = other.original_deposit;
        }
        self.ingested_objects.extend(other.ingested_objects);
    }
}

/// A client's upload, spooled to disk but not yet looked at by the
/// packaging format.
pub struct Upload {
    pub payload: SpooledPayload,
    pub filename: Option<String>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PackagingFormat {
    Binary,
    SimpleZip,
    SwordBagIt,
}

impl PackagingFormat {
    pub const ALL: [PackagingFormat; 3] = [
        PackagingFormat::Binary,
        PackagingFormat::SimpleZip,
        PackagingFormat::SwordBagIt,
    ];

    pub fn uri(self) -> &'static str {
        match self {
            PackagingFormat::Binary => "http://purl.org/net/sword/3.0/package/Binary",
            PackagingFormat::SimpleZip => "http://purl.org/net/sword/3.0/package/SimpleZip",
            PackagingFormat::SwordBagIt => "http://purl.org/net/sword/3.0/package/SWORDBagIt",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|format| format.uri() == uri)
    }

    fn slug(self) -> &'static str {
        match self {
            PackagingFormat::Binary => "binary",
            PackagingFormat::SimpleZip => "simple-zip",
            PackagingFormat::SwordBagIt => "sword-bagit",
        }
    }

    /// Required container media type; `None` accepts anything.
    pub fn content_type(self) -> Option<&'static str> {
        match self {
            PackagingFormat::Binary => None,
            PackagingFormat::SimpleZip | PackagingFormat::SwordBagIt => Some(ZIP_CONTENT_TYPE),
        }
    }

    pub fn check_content_type(self, found: Option<&str>) -> Result<(), PackagingError> {
        let Some(expected) = self.content_type() else {
            return Ok(());
        };
        let found = found.unwrap_or_default();
        if found.eq_ignore_ascii_case(expected) {
            Ok(())
        } else {
            Err(PackagingError::ContentTypeNotAcceptable {
                format: self.uri(),
                expected,
                found: found.to_string(),
            })
        }
    }

    /// Key under which the raw container is stored.
    ///
    /// Binary deposits are stored directly under the client filename (or a
    /// `data` fallback); containers live under the deposit's
    /// original-deposit prefix.
    pub fn original_deposit_filename(
        self,
        key_prefix: &str,
        filename_hint: Option<&str>,
        media_type_hint: Option<&str>,
    ) -> String {
        match self {
            PackagingFormat::Binary => binary::filename(filename_hint, media_type_hint),
            _ => match filename_hint {
                Some(filename) => format!("{key_prefix}{filename}"),
                None => format!("{key_prefix}{}-{}.zip", self.slug(), Uuid::new_v4()),
            },
        }
    }

    /// Store an uploaded container as the original deposit, then unpack it.
    pub async fn ingest(
        self,
        ctx: &mut DepositTx<'_>,
        upload: Upload,
    ) -> Result<IngestResult, PackagingError> {
        let content_type = upload.content_type.as_deref();
        self.check_content_type(content_type)?;

        let key = self.original_deposit_filename(
            &ctx.deposit.original_deposit_key_prefix(),
            upload.filename.as_deref(),
            content_type,
        );
        let original = ctx
            .storage
            .create_version_from_spooled(
                ctx.conn,
                ctx.deposit.bucket_id,
                &key,
                content_type.or(self.content_type()),
                upload.payload,
            )
            .await?;
        self.tag_original(ctx.conn, &original).await?;
        info!(deposit = %ctx.deposit.id, key = %original.key, packaging = self.uri(), "stored original deposit");

        self.unpack(ctx, &original).await
    }

    /// Tag a freshly created original deposit.
    pub async fn tag_original(
        self,
        conn: &mut SqliteConnection,
        original: &ObjectVersion,
    ) -> Result<(), StorageError> {
        let mut tags = vec![
            (TagKey::OriginalDeposit, TagValue::Flag(true)),
            (TagKey::Packaging, TagValue::from(self.uri())),
        ];
        if self == PackagingFormat::Binary {
            tags.push((TagKey::FileSetFile, TagValue::Flag(true)));
        }
        tag_store::bulk_update(conn, original.version_id, tags).await
    }

    /// Unpack an already stored container into the deposit's bucket.
    pub async fn unpack(
        self,
        ctx: &mut DepositTx<'_>,
        original: &ObjectVersion,
    ) -> Result<IngestResult, PackagingError> {
        self.check_content_type(original.mimetype.as_deref())?;
        match self {
            PackagingFormat::Binary => Ok(binary::unpack(original)),
            PackagingFormat::SimpleZip => zip::unpack(ctx, original).await,
            PackagingFormat::SwordBagIt => bagit::unpack(ctx, original).await,
        }
    }

    /// Keys the container will produce once unpacked, without side effects.
    pub async fn file_list(
        self,
        storage: &StorageService,
        conn: &mut SqliteConnection,
        original: &ObjectVersion,
    ) -> Result<Vec<String>, PackagingError> {
        if self == PackagingFormat::Binary {
            return Ok(vec![original.key.clone()]);
        }
        if !original.has_payload() {
            return Ok(Vec::new());
        }
        let instance = storage.payload_of(conn, original).await?;
        let names = list_archive(storage.payload_path(&instance)).await?;
        Ok(match self {
            PackagingFormat::SwordBagIt => bagit::payload_keys(&names),
            _ => names,
        })
    }
}

/// The packaging formats enabled for this server.
#[derive(Debug, Clone)]
pub struct PackagingRegistry {
    formats: BTreeSet<PackagingFormat>,
}

impl PackagingRegistry {
    pub fn from_uris<S: AsRef<str>>(uris: &[S]) -> Result<Self, PackagingError> {
        let formats = uris
            .iter()
            .map(|uri| {
                PackagingFormat::from_uri(uri.as_ref())
                    .ok_or_else(|| PackagingError::UnknownFormat(uri.as_ref().to_string()))
            })
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Self { formats })
    }

    /// Resolve a `Packaging` header; absent means Binary.
    pub fn resolve(&self, uri: Option<&str>) -> Result<PackagingFormat, PackagingError> {
        let uri = uri.unwrap_or(PackagingFormat::Binary.uri());
        PackagingFormat::from_uri(uri)
            .filter(|format| self.formats.contains(format))
            .ok_or_else(|| PackagingError::UnknownFormat(uri.to_string()))
    }

    pub fn uris(&self) -> Vec<&'static str> {
        let mut uris: Vec<_> = self.formats.iter().map(|format| format.uri()).collect();
        uris.sort_unstable();
        uris
    }
}

impl Default for PackagingRegistry {
    fn default() -> Self {
        Self {
            formats: PackagingFormat::ALL.into_iter().collect(),
        }
    }
}

/// An archive extracted into a scratch directory.
pub(crate) struct Extracted {
    pub dir: TempDir,
    /// Slash-separated paths of every regular file, sorted.
    pub files: Vec<String>,
}

impl Extracted {
    pub fn path_of(&self, name: &str) -> PathBuf {
        name.split('/')
            .fold(self.dir.path().to_path_buf(), |path, part| path.join(part))
    }
}

fn entry_key(path: &Path) -> Option<String> {
    let parts = path
        .components()
        .map(|component| match component {
            Component::Normal(part) => part.to_str().map(str::to_string),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    (!parts.is_empty()).then(|| parts.join("/"))
}

/// Extract a ZIP archive beneath `scratch`, rejecting entries that would
/// escape the extraction directory and archives whose entries add up to more
/// than `limit` bytes.
pub(crate) async fn extract_archive(
    archive: PathBuf,
    scratch: PathBuf,
    limit: u64,
) -> Result<Extracted, PackagingError> {
    tokio::task::spawn_blocking(move || -> Result<Extracted, PackagingError> {
        std::fs::create_dir_all(&scratch)?;
        let dir = tempfile::Builder::new()
            .prefix("unpack-")
            .tempdir_in(&scratch)?;
        let mut zip = ::zip::ZipArchive::new(std::fs::File::open(&archive)?)?;
        let mut files = Vec::new();
        let mut total: u64 = 0;
        for index in 0..zip.len() {
            let mut entry = zip.by_index(index)?;
            let key = entry
                .enclosed_name()
                .as_deref()
                .and_then(entry_key)
                .ok_or_else(|| {
                    PackagingError::ContentMalformed(format!("unsafe entry name `{}`", entry.name()))
                })?;
            let target = key
                .split('/')
                .fold(dir.path().to_path_buf(), |path, part| path.join(part));
            if entry.is_dir() {
                std::fs::create_dir_all(&target)?;
                continue;
            }
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            // Declared sizes can lie; the copy is capped as well.
            let remaining = limit.saturating_sub(total);
            if entry.size() > remaining {
                return Err(PackagingError::UnpackedTooLarge { limit });
            }
            let mut out = std::fs::File::create(&target)?;
            total += io::copy(&mut (&mut entry).take(remaining + 1), &mut out)?;
            if total > limit {
                return Err(PackagingError::UnpackedTooLarge { limit });
            }
            files.push(key);
        }
        files.sort();
        files.dedup();
        Ok(Extracted { dir, files })
    })
    .await
    .map_err(|err| PackagingError::Io(io::Error::other(err)))?
}

/// Names of the regular files in a ZIP archive, sorted.
pub(crate) async fn list_archive(archive: PathBuf) -> Result<Vec<String>, PackagingError> {
    tokio::task::spawn_blocking(move || -> Result<Vec<String>, PackagingError> {
        let mut zip = ::zip::ZipArchive::new(std::fs::File::open(&archive)?)?;
        let mut names = Vec::new();
        for index in 0..zip.len() {
            let entry = zip.by_index(index)?;
            if entry.is_dir() {
                continue;
            }
            if let Some(key) = entry.enclosed_name().as_deref().and_then(entry_key) {
                names.push(key);
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    })
    .await
    .map_err(|err| PackagingError::Io(io::Error::other(err)))?
}

/// Create one file-set member per extracted file, derived from `original`.
pub(crate) async fn ingest_extracted(
    ctx: &mut DepositTx<'_>,
    original: &ObjectVersion,
    extracted: &Extracted,
    entries: &[(String, String)],
) -> Result<Vec<ObjectVersion>, PackagingError> {
    let mut created = Vec::with_capacity(entries.len());
    for (name, key) in entries {
        let mimetype = mime_guess::from_path(key).first_raw();
        let version = ctx
            .storage
            .create_version_from_path(
                ctx.conn,
                ctx.deposit.bucket_id,
                key,
                mimetype,
                &extracted.path_of(name),
            )
            .await?;
        tag_store::bulk_update(
            ctx.conn,
            version.version_id,
            [
                (TagKey::FileSetFile, TagValue::Flag(true)),
                (TagKey::DerivedFrom, TagValue::from(original.key.as_str())),
            ],
        )
        .await?;
        created.push(version);
    }
    Ok(created)
}
