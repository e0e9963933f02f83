//! The deposit record: status, projected metadata and the owning bucket.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::FromRow;
use std::{fmt, str::FromStr};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DepositError {
    #[error("deposit {0} is published and can no longer be modified")]
    NotDraft(Uuid),
    #[error("deposit {0} is published and cannot return to in-progress")]
    InvalidTransition(Uuid),
    #[error("deposit record {id} is corrupt: {reason}")]
    Corrupt { id: Uuid, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepositStatus {
    Draft,
    Published,
}

impl DepositStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DepositStatus::Draft => "draft",
            DepositStatus::Published => "published",
        }
    }
}

impl fmt::Display for DepositStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DepositStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(DepositStatus::Draft),
            "published" => Ok(DepositStatus::Published),
            other => Err(format!("unknown status `{other}`")),
        }
    }
}

/// A SWORD deposit.
#[derive(Debug, Clone, Serialize)]
pub struct Deposit {
    pub id: Uuid,
    pub bucket_id: Uuid,
    pub status: DepositStatus,

    /// Repository-native fields projected from the SWORD metadata.
    pub metadata: Map<String, Value>,

    /// The deposit's metadata in SWORD JSON-LD form, if any was supplied.
    pub sword_metadata: Option<Value>,

    /// Format identifier of the document `sword_metadata` was derived from.
    pub sword_metadata_format: Option<String>,

    /// `bag-info.txt` of the most recent BagIt ingest.
    pub bagit_info: Option<Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deposit {
    pub fn new(bucket_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            bucket_id,
            status: DepositStatus::Draft,
            metadata: Map::new(),
            sword_metadata: None,
            sword_metadata_format: None,
            bagit_info: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_draft(&self) -> bool {
        self.status == DepositStatus::Draft
    }

    pub fn ensure_draft(&self) -> Result<(), DepositError> {
        if self.is_draft() {
            Ok(())
        } else {
            Err(DepositError::NotDraft(self.id))
        }
    }

    /// Check that `In-Progress: <in_progress>` is acceptable without applying it.
    pub fn check_in_progress(&self, in_progress: bool) -> Result<(), DepositError> {
        if in_progress && self.status == DepositStatus::Published {
            return Err(DepositError::InvalidTransition(self.id));
        }
        Ok(())
    }

    /// Apply the `In-Progress` header: `false` publishes a draft.
    pub fn apply_in_progress(&mut self, in_progress: bool) -> Result<(), DepositError> {
        self.check_in_progress(in_progress)?;
        if !in_progress {
            self.status = DepositStatus::Published;
        }
        Ok(())
    }

    pub fn metadata_key_prefix(&self) -> String {
        format!(".metadata-{}/", self.id)
    }

    pub fn original_deposit_key_prefix(&self) -> String {
        format!(".original-deposit-{}/", self.id)
    }

    /// Projected title, if one was set from metadata.
    pub fn title(&self) -> Option<&str> {
        self.metadata
            .get("title_statement")
            .and_then(|statement| statement.get("title"))
            .and_then(Value::as_str)
    }
}

/// Row shape of the `deposits` table; JSON columns are stored as text.
#[derive(Debug, FromRow)]
pub struct DepositRow {
    pub id: Uuid,
    pub bucket_id: Uuid,
    pub status: String,
    pub metadata: String,
    pub sword_metadata: Option<String>,
    pub sword_metadata_format: Option<String>,
    pub bagit_info: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<DepositRow> for Deposit {
    type Error = DepositError;

    fn try_from(row: DepositRow) -> Result<Self, Self::Error> {
        let id = row.id;
        let corrupt = |reason: String| DepositError::Corrupt { id, reason };
        let parse_json = |text: Option<String>| -> Result<Option<Value>, DepositError> {
            text.map(|text| serde_json::from_str(&text))
                .transpose()
                .map_err(|err| corrupt(err.to_string()))
        };

        let metadata = match serde_json::from_str::<Value>(&row.metadata) {
            Ok(Value::Object(map)) => map,
            Ok(_) => return Err(corrupt("metadata is not an object".into())),
            Err(err) => return Err(corrupt(err.to_string())),
        };

        Ok(Deposit {
            id,
            bucket_id: row.bucket_id,
            status: row.status.parse().map_err(corrupt)?,
            metadata,
            sword_metadata: parse_json(row.sword_metadata)?,
            sword_metadata_format: row.sword_metadata_format,
            bagit_info: parse_json(row.bagit_info)?,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}
