//! Represents object versions (files) stored in a bucket and their payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One version of an object within a bucket.
///
/// Versions for the same key form a history; exactly one of them is the head.
/// A version without a payload is either a by-reference placeholder (it
/// carries tags) or a tombstone left behind by a delete (it carries none).
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct ObjectVersion {
    /// Identifier of this particular version.
    pub version_id: Uuid,

    /// Foreign key linking to the owning bucket.
    pub bucket_id: Uuid,

    /// Object key (path-like identifier within the bucket).
    pub key: String,

    /// Payload backing this version, if any.
    pub file_id: Option<Uuid>,

    /// Content type (MIME type).
    pub mimetype: Option<String>,

    /// Whether this is the authoritative version for its key.
    pub is_head: bool,

    /// When this version was created.
    pub created_at: DateTime<Utc>,
}

impl ObjectVersion {
    pub fn has_payload(&self) -> bool {
        self.file_id.is_some()
    }

    /// The last path segment of the key.
    pub fn filename(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

/// A stored payload blob.
///
/// Payloads are immutable once written; a new upload always produces a new
/// `FileInstance`.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq)]
pub struct FileInstance {
    pub id: Uuid,

    /// Location relative to the storage root.
    pub uri: String,

    /// Size in bytes.
    pub size_bytes: i64,

    /// MD5 checksum of the payload.
    pub etag: String,

    pub created_at: DateTime<Utc>,
}
