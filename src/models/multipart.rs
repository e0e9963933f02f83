//! Represents segmented upload sessions and their segments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A segmented upload, initiated before uploading a large file in segments.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct SegmentedUpload {
    /// Identifier exposed in the temporary URL.
    pub id: Uuid,

    /// Number of segments the client promised to send.
    pub segment_count: i64,

    /// Size of every segment except the last.
    pub segment_size: i64,

    /// Total size of the assembled file.
    pub size: i64,

    /// Assembled payload, set once every segment has arrived.
    pub file_id: Option<Uuid>,

    pub completed: bool,

    pub created_at: DateTime<Utc>,
}

impl SegmentedUpload {
    /// Expected size of segment `number` (1-based).
    pub fn expected_segment_size(&self, number: i64) -> i64 {
        if number == self.segment_count {
            self.size - (self.segment_count - 1) * self.segment_size
        } else {
            self.segment_size
        }
    }
}

/// Represents a single uploaded segment.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSegment {
    pub upload_id: Uuid,

    /// Segment number (1-based).
    pub segment_number: i64,

    pub file_id: Uuid,

    pub size_bytes: i64,

    pub uploaded_at: DateTime<Utc>,
}
