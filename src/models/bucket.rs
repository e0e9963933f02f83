//! Represents a bucket, the container owning every object version of one deposit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A storage bucket.
///
/// Each deposit owns exactly one bucket; deleting the deposit deletes the
/// bucket and, through it, every object version and tag inside.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Bucket {
    /// Unique identifier for this bucket.
    pub id: Uuid,

    /// When this bucket was created.
    pub created_at: DateTime<Utc>,
}
