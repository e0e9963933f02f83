//! src/services/storage_service.rs
//!
//! StorageService: versioned object storage backed by SQLite for metadata
//! and local disk for payloads. Every write creates a new object version;
//! the most recent version of a key is its head. Payloads are immutable blobs
//! sharded beneath `base_path/{shard}/{shard}/{file_id}`.
//!
//! Database operations take a `&mut SqliteConnection` so that callers can run
//! them inside their own transaction; payload files are written before the
//! row referencing them and removed only after the deleting transaction has
//! committed.

use crate::models::{
    bucket::Bucket,
    object::{FileInstance, ObjectVersion},
    tags::{TagError, TagKey},
};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt, pin_mut, stream};
use md5::Context;
use sqlx::{QueryBuilder, SqliteConnection, SqlitePool, sqlite::Sqlite};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    sync::Arc,
};
use tempfile::TempPath;
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("bucket `{0}` not found")]
    BucketNotFound(Uuid),
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("object version `{0}` not found")]
    VersionNotFound(Uuid),
    #[error("object version `{0}` has no payload")]
    MissingPayload(Uuid),
    #[error("invalid object key `{0}`")]
    InvalidObjectKey(String),
    #[error("payload exceeds the maximum size of {limit} bytes")]
    PayloadTooLarge { limit: u64 },
    #[error("corrupt record: {0}")]
    CorruptRecord(String),
    #[error(transparent)]
    Tag(#[from] TagError),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Columns selected for every `ObjectVersion` query.
const VERSION_COLUMNS: &str = "version_id, bucket_id, key, file_id, mimetype, is_head, created_at";

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// A payload written to disk whose `files` row does not exist yet.
///
/// Dropping it removes the temporary file.
#[derive(Debug)]
pub struct SpooledPayload {
    file_id: Uuid,
    uri: String,
    tmp: TempPath,
    pub size_bytes: u64,
    pub etag: String,
}

impl SpooledPayload {
    pub fn path(&self) -> &Path {
        &self.tmp
    }
}

/// StorageService provides the versioned object store:
/// - Create / delete buckets
/// - Create object versions (with or without a payload)
/// - Delete objects (a new payload-less head)
/// - Look up heads by key or by tag
/// - Open payloads for streaming
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,

    /// Base directory on disk where payloads are stored.
    pub base_path: PathBuf,

    /// Most bytes a single container may unpack to.
    unpack_limit: u64,
}

/// Reject keys that could escape the bucket or confuse URL routing.
pub fn ensure_key_safe(key: &str) -> StorageResult<()> {
    let invalid = || StorageError::InvalidObjectKey(key.to_string());
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(invalid());
    }
    if key.starts_with('/') || key.ends_with('/') || key.split('/').any(|s| s == ".." || s.is_empty())
    {
        return Err(invalid());
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(invalid());
    }
    Ok(())
}

impl StorageService {
    /// Create a new StorageService backed by the provided SQLite pool and
    /// using `base_path` as the root directory for payloads.
    pub fn new(db: Arc<SqlitePool>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            db,
            base_path: base_path.into(),
            unpack_limit: u64::MAX,
        }
    }

    pub fn with_unpack_limit(self, unpack_limit: u64) -> Self {
        Self {
            unpack_limit,
            ..self
        }
    }

    pub fn unpack_limit(&self) -> u64 {
        self.unpack_limit
    }

    /// Directory for scratch files (archive extraction, uploads in flight).
    ///
    /// Kept beneath `base_path` so renames into place never cross devices.
    pub fn scratch_dir(&self) -> PathBuf {
        self.base_path.join(".scratch")
    }

    /// Generate two-level shard identifiers for a payload.
    ///
    /// Uses MD5(file_id) and returns the first two bytes as lowercase
    /// hexadecimal strings (00–ff). Reduces file count per directory.
    fn payload_shards(file_id: Uuid) -> (String, String) {
        let digest = md5::compute(file_id.as_bytes());
        (format!("{:02x}", digest[0]), format!("{:02x}", digest[1]))
    }

    /// Absolute on-disk path of a payload.
    pub fn payload_path(&self, file: &FileInstance) -> PathBuf {
        self.base_path.join(&file.uri)
    }

    pub async fn create_bucket(&self, conn: &mut SqliteConnection) -> StorageResult<Bucket> {
        let bucket = Bucket {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
        };
        sqlx::query("INSERT INTO buckets (id, created_at) VALUES (?, ?)")
            .bind(bucket.id)
            .bind(bucket.created_at)
            .execute(&mut *conn)
            .await?;
        debug!(bucket = %bucket.id, "created bucket");
        Ok(bucket)
    }

    /// Delete a bucket with every version, tag and payload row inside it.
    ///
    /// Returns the on-disk payload paths; pass them to
    /// [`StorageService::remove_payloads`] once the transaction commits.
    pub async fn delete_bucket(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
    ) -> StorageResult<Vec<PathBuf>> {
        let files = sqlx::query_as::<_, FileInstance>(
            "SELECT f.id, f.uri, f.size_bytes, f.etag, f.created_at
             FROM files f JOIN object_versions v ON v.file_id = f.id
             WHERE v.bucket_id = ?",
        )
        .bind(bucket_id)
        .fetch_all(&mut *conn)
        .await?;

        let result = sqlx::query("DELETE FROM buckets WHERE id = ?")
            .bind(bucket_id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::BucketNotFound(bucket_id));
        }

        for file in &files {
            sqlx::query("DELETE FROM files WHERE id = ?")
                .bind(file.id)
                .execute(&mut *conn)
                .await?;
        }

        Ok(files.iter().map(|file| self.payload_path(file)).collect())
    }

    /// Stream a payload to disk without touching the database.
    ///
    /// - Writes bytes incrementally to a temporary file in its shard.
    /// - Computes MD5/etag and size while streaming.
    /// - Aborts with `PayloadTooLarge` once `limit` bytes are exceeded.
    ///
    /// Callers spool before opening a transaction; only
    /// [`StorageService::record_payload`] runs inside one.
    pub async fn spool_payload<S>(&self, stream: S, limit: Option<u64>) -> StorageResult<SpooledPayload>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let file_id = Uuid::new_v4();
        let (shard_a, shard_b) = Self::payload_shards(file_id);
        let uri = format!("{shard_a}/{shard_b}/{file_id}");
        let parent = self.base_path.join(&shard_a).join(&shard_b);
        fs::create_dir_all(&parent).await?;
        let (file, tmp) = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(&parent)?
            .into_parts();
        let mut file = File::from_std(file);

        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();
        pin_mut!(stream);
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            size_bytes += chunk.len() as u64;
            if let Some(limit) = limit {
                if size_bytes > limit {
                    return Err(StorageError::PayloadTooLarge { limit });
                }
            }
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(SpooledPayload {
            file_id,
            uri,
            tmp,
            size_bytes,
            etag: format!("{:x}", digest.compute()),
        })
    }

    /// Rename a spooled payload into its sharded location and record it in
    /// `files`.
    pub async fn record_payload(
        &self,
        conn: &mut SqliteConnection,
        spooled: SpooledPayload,
    ) -> StorageResult<FileInstance> {
        let instance = FileInstance {
            id: spooled.file_id,
            uri: spooled.uri,
            size_bytes: spooled.size_bytes as i64,
            etag: spooled.etag,
            created_at: Utc::now(),
        };
        spooled
            .tmp
            .persist(self.payload_path(&instance))
            .map_err(|err| StorageError::Io(err.error))?;
        self.insert_file(conn, instance).await
    }

    /// Insert the row of a payload already in place, removing the file if
    /// the insert fails.
    async fn insert_file(
        &self,
        conn: &mut SqliteConnection,
        instance: FileInstance,
    ) -> StorageResult<FileInstance> {
        let inserted = sqlx::query(
            "INSERT INTO files (id, uri, size_bytes, etag, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(instance.id)
        .bind(&instance.uri)
        .bind(instance.size_bytes)
        .bind(&instance.etag)
        .bind(instance.created_at)
        .execute(&mut *conn)
        .await;

        match inserted {
            Ok(_) => {
                debug!(file = %instance.id, size = instance.size_bytes, "stored payload");
                Ok(instance)
            }
            Err(err) => {
                let _ = fs::remove_file(self.payload_path(&instance)).await;
                Err(StorageError::Sqlx(err))
            }
        }
    }

    /// Spool a payload and record it at once. Only for local sources or
    /// connections outside a transaction.
    pub async fn store_payload<S>(
        &self,
        conn: &mut SqliteConnection,
        stream: S,
        limit: Option<u64>,
    ) -> StorageResult<FileInstance>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let spooled = self.spool_payload(stream, limit).await?;
        self.record_payload(conn, spooled).await
    }

    /// Store the contents of a local file as a new payload.
    pub async fn store_payload_from_path(
        &self,
        conn: &mut SqliteConnection,
        path: &Path,
    ) -> StorageResult<FileInstance> {
        let file = File::open(path).await?;
        self.store_payload(conn, ReaderStream::new(file), None).await
    }

    /// Create a new head version for `key`, demoting the previous head.
    pub async fn create_version(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
        mimetype: Option<&str>,
        file_id: Option<Uuid>,
    ) -> StorageResult<ObjectVersion> {
        ensure_key_safe(key)?;

        sqlx::query(
            "UPDATE object_versions SET is_head = 0
             WHERE bucket_id = ? AND key = ? AND is_head = 1",
        )
        .bind(bucket_id)
        .bind(key)
        .execute(&mut *conn)
        .await?;

        let version = ObjectVersion {
            version_id: Uuid::new_v4(),
            bucket_id,
            key: key.to_string(),
            file_id,
            mimetype: mimetype.map(str::to_string),
            is_head: true,
            created_at: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO object_versions
                (version_id, bucket_id, key, file_id, mimetype, is_head, created_at)
             VALUES (?, ?, ?, ?, ?, 1, ?)",
        )
        .bind(version.version_id)
        .bind(version.bucket_id)
        .bind(&version.key)
        .bind(version.file_id)
        .bind(&version.mimetype)
        .bind(version.created_at)
        .execute(&mut *conn)
        .await?;

        debug!(key, version = %version.version_id, "created object version");
        Ok(version)
    }

    /// Create a new head version backed by an already spooled payload.
    pub async fn create_version_from_spooled(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
        mimetype: Option<&str>,
        spooled: SpooledPayload,
    ) -> StorageResult<ObjectVersion> {
        ensure_key_safe(key)?;
        let file = self.record_payload(conn, spooled).await?;
        self.create_version(conn, bucket_id, key, mimetype, Some(file.id))
            .await
    }

    pub async fn create_version_from_bytes(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
        mimetype: Option<&str>,
        bytes: Bytes,
    ) -> StorageResult<ObjectVersion> {
        ensure_key_safe(key)?;
        let body = stream::once(async move { Ok::<_, io::Error>(bytes) });
        let file = self.store_payload(conn, body, None).await?;
        self.create_version(conn, bucket_id, key, mimetype, Some(file.id))
            .await
    }

    pub async fn create_version_from_path(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
        mimetype: Option<&str>,
        path: &Path,
    ) -> StorageResult<ObjectVersion> {
        ensure_key_safe(key)?;
        let file = self.store_payload_from_path(conn, path).await?;
        self.create_version(conn, bucket_id, key, mimetype, Some(file.id))
            .await
    }

    /// Delete `key` by writing a payload-less head version.
    ///
    /// Returns `None` without writing anything when the key does not exist
    /// or is already deleted.
    pub async fn delete_version(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
    ) -> StorageResult<Option<ObjectVersion>> {
        let Some(head) = self.head(conn, bucket_id, key).await? else {
            return Ok(None);
        };
        if !head.has_payload() && !self.has_tags(conn, head.version_id).await? {
            return Ok(None);
        }
        let mimetype = head.mimetype.as_deref();
        self.create_version(conn, bucket_id, key, mimetype, None)
            .await
            .map(Some)
    }

    /// Point an existing version at an already stored payload.
    pub async fn attach_payload(
        &self,
        conn: &mut SqliteConnection,
        version: &ObjectVersion,
        file_id: Uuid,
    ) -> StorageResult<ObjectVersion> {
        let result = sqlx::query("UPDATE object_versions SET file_id = ? WHERE version_id = ?")
            .bind(file_id)
            .bind(version.version_id)
            .execute(&mut *conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::VersionNotFound(version.version_id));
        }
        Ok(ObjectVersion {
            file_id: Some(file_id),
            ..version.clone()
        })
    }

    pub async fn get_version(
        &self,
        conn: &mut SqliteConnection,
        version_id: Uuid,
    ) -> StorageResult<Option<ObjectVersion>> {
        let version = sqlx::query_as::<_, ObjectVersion>(&format!(
            "SELECT {VERSION_COLUMNS} FROM object_versions WHERE version_id = ?"
        ))
        .bind(version_id)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(version)
    }

    pub async fn head(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        key: &str,
    ) -> StorageResult<Option<ObjectVersion>> {
        let version = sqlx::query_as::<_, ObjectVersion>(&format!(
            "SELECT {VERSION_COLUMNS} FROM object_versions
             WHERE bucket_id = ? AND key = ? AND is_head = 1"
        ))
        .bind(bucket_id)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(version)
    }

    /// All head versions in a bucket, including tombstones, ordered by key.
    pub async fn heads(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
    ) -> StorageResult<Vec<ObjectVersion>> {
        let versions = sqlx::query_as::<_, ObjectVersion>(&format!(
            "SELECT {VERSION_COLUMNS} FROM object_versions
             WHERE bucket_id = ? AND is_head = 1 ORDER BY key ASC"
        ))
        .bind(bucket_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(versions)
    }

    /// Head versions in a bucket carrying at least one of `tag_keys`.
    pub async fn heads_with_any_tag(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        tag_keys: &[TagKey],
    ) -> StorageResult<Vec<ObjectVersion>> {
        if tag_keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {VERSION_COLUMNS} FROM object_versions v WHERE v.bucket_id = "
        ));
        builder.push_bind(bucket_id);
        builder.push(
            " AND v.is_head = 1 AND EXISTS (SELECT 1 FROM object_version_tags t \
             WHERE t.version_id = v.version_id AND t.key IN (",
        );
        let mut separated = builder.separated(", ");
        for key in tag_keys {
            separated.push_bind(key.as_str());
        }
        builder.push(")) ORDER BY v.key ASC");

        let versions: Vec<ObjectVersion> = builder.build_query_as().fetch_all(&mut *conn).await?;
        Ok(versions)
    }

    /// The payload-bearing head whose tag `tag_key` equals `value`, if any.
    pub async fn head_with_tag_value(
        &self,
        conn: &mut SqliteConnection,
        bucket_id: Uuid,
        tag_key: TagKey,
        value: &str,
    ) -> StorageResult<Option<ObjectVersion>> {
        let version = sqlx::query_as::<_, ObjectVersion>(&format!(
            "SELECT {VERSION_COLUMNS} FROM object_versions v
             WHERE v.bucket_id = ? AND v.is_head = 1 AND v.file_id IS NOT NULL
               AND EXISTS (SELECT 1 FROM object_version_tags t
                           WHERE t.version_id = v.version_id AND t.key = ? AND t.value = ?)
             ORDER BY v.key ASC LIMIT 1"
        ))
        .bind(bucket_id)
        .bind(tag_key.as_str())
        .bind(value)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(version)
    }

    /// Heads in any bucket whose tag `tag_key` takes one of `values`.
    pub async fn all_heads_with_tag_values(
        &self,
        conn: &mut SqliteConnection,
        tag_key: TagKey,
        values: &[String],
    ) -> StorageResult<Vec<ObjectVersion>> {
        if values.is_empty() {
            return Ok(Vec::new());
        }
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {VERSION_COLUMNS} FROM object_versions v WHERE v.is_head = 1 \
             AND EXISTS (SELECT 1 FROM object_version_tags t \
             WHERE t.version_id = v.version_id AND t.key = "
        ));
        builder.push_bind(tag_key.as_str());
        builder.push(" AND t.value IN (");
        let mut separated = builder.separated(", ");
        for value in values {
            separated.push_bind(value);
        }
        builder.push(")) ORDER BY v.created_at ASC");

        let versions: Vec<ObjectVersion> = builder.build_query_as().fetch_all(&mut *conn).await?;
        Ok(versions)
    }

    async fn has_tags(&self, conn: &mut SqliteConnection, version_id: Uuid) -> StorageResult<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM object_version_tags WHERE version_id = ?")
                .bind(version_id)
                .fetch_one(&mut *conn)
                .await?;
        Ok(count > 0)
    }

    pub async fn file_instance(
        &self,
        conn: &mut SqliteConnection,
        file_id: Uuid,
    ) -> StorageResult<FileInstance> {
        sqlx::query_as::<_, FileInstance>(
            "SELECT id, uri, size_bytes, etag, created_at FROM files WHERE id = ?",
        )
        .bind(file_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| StorageError::CorruptRecord(format!("payload {file_id} has no file row")))
    }

    /// Resolve the payload of `version`.
    pub async fn payload_of(
        &self,
        conn: &mut SqliteConnection,
        version: &ObjectVersion,
    ) -> StorageResult<FileInstance> {
        let file_id = version
            .file_id
            .ok_or(StorageError::MissingPayload(version.version_id))?;
        self.file_instance(conn, file_id).await
    }

    /// Open the payload of `version` for reading.
    pub async fn open_payload(
        &self,
        conn: &mut SqliteConnection,
        version: &ObjectVersion,
    ) -> StorageResult<(FileInstance, File)> {
        let instance = self.payload_of(conn, version).await?;
        let file = File::open(self.payload_path(&instance))
            .await
            .map_err(|err| {
                if err.kind() == ErrorKind::NotFound {
                    StorageError::ObjectNotFound(version.key.clone())
                } else {
                    StorageError::Io(err)
                }
            })?;
        Ok((instance, file))
    }

    /// Read a (small) payload fully into memory.
    pub async fn read_payload(
        &self,
        conn: &mut SqliteConnection,
        version: &ObjectVersion,
    ) -> StorageResult<Vec<u8>> {
        let instance = self.payload_of(conn, version).await?;
        Ok(fs::read(self.payload_path(&instance)).await?)
    }

    /// Give a stored payload a second, independently owned `files` row.
    ///
    /// Payloads never change once written, so the copy is a hard link
    /// where the filesystem allows one and a full copy otherwise.
    pub async fn copy_payload(
        &self,
        conn: &mut SqliteConnection,
        source: &FileInstance,
    ) -> StorageResult<FileInstance> {
        let file_id = Uuid::new_v4();
        let (shard_a, shard_b) = Self::payload_shards(file_id);
        let instance = FileInstance {
            id: file_id,
            uri: format!("{shard_a}/{shard_b}/{file_id}"),
            size_bytes: source.size_bytes,
            etag: source.etag.clone(),
            created_at: Utc::now(),
        };
        fs::create_dir_all(self.base_path.join(&shard_a).join(&shard_b)).await?;
        let source_path = self.payload_path(source);
        if let Err(err) = fs::hard_link(&source_path, self.payload_path(&instance)).await {
            debug!(file = %source.id, error = %err, "hard link failed, copying payload");
            return self.store_payload_from_path(conn, &source_path).await;
        }
        self.insert_file(conn, instance).await
    }

    /// Drop the row of a payload nothing references any more.
    ///
    /// Returns its path for [`StorageService::remove_payloads`].
    pub async fn forget_payload(
        &self,
        conn: &mut SqliteConnection,
        file_id: Uuid,
    ) -> StorageResult<PathBuf> {
        let instance = self.file_instance(conn, file_id).await?;
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file_id)
            .execute(&mut *conn)
            .await?;
        Ok(self.payload_path(&instance))
    }

    /// Remove payload files best-effort, pruning emptied shard directories.
    pub async fn remove_payloads(&self, paths: &[PathBuf]) {
        for path in paths {
            match fs::remove_file(path).await {
                Ok(_) => debug!("removed payload {}", path.display()),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    debug!("payload {} already missing", path.display());
                }
                Err(err) => debug!("failed to remove payload {}: {}", path.display(), err),
            }
            if let Some(parent) = path.parent() {
                self.prune_empty_dirs(parent, &self.base_path).await;
            }
        }
    }

    /// Recursively remove empty directories up to the storage root.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}
