//! Typed annotations attached to object versions.
//!
//! Tags are stored as plain `(key, value)` string pairs in
//! `object_version_tags`; this module is the only place that knows how those
//! strings map onto typed values. Every write goes through [`TagValue::parse`]
//! so an invalid value never reaches the database.

use serde::Serialize;
use std::{fmt, str::FromStr};
use thiserror::Error;

const FILE_STATE_BASE: &str = "http://purl.org/net/sword/3.0/filestate/";

#[derive(Debug, Error, PartialEq)]
pub enum TagError {
    #[error("unknown tag key `{0}`")]
    UnknownKey(String),
    #[error("invalid value `{value}` for tag `{key}`")]
    InvalidTagValue { key: &'static str, value: String },
}

/// The closed vocabulary of tag keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TagKey {
    OriginalDeposit,
    FileSetFile,
    DerivedFrom,
    Packaging,
    MetadataFormat,
    ByReferenceUrl,
    ByReferenceDereference,
    ByReferenceTtl,
    ByReferenceContentLength,
    FileState,
}

impl TagKey {
    /// Tags marking an object as part of the deposit's file-set lineage.
    /// Reconciliation and garbage collection only ever touch objects carrying
    /// one of these.
    pub const PROVENANCE: [TagKey; 3] = [
        TagKey::FileSetFile,
        TagKey::DerivedFrom,
        TagKey::OriginalDeposit,
    ];

    /// Tags describing transient by-reference state, cleared once a
    /// placeholder is replaced by real content.
    pub const PLACEHOLDER: [TagKey; 5] = [
        TagKey::ByReferenceUrl,
        TagKey::ByReferenceDereference,
        TagKey::ByReferenceTtl,
        TagKey::ByReferenceContentLength,
        TagKey::FileState,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TagKey::OriginalDeposit => "sword.originalDeposit",
            TagKey::FileSetFile => "sword.fileSetFile",
            TagKey::DerivedFrom => "sword.derivedFrom",
            TagKey::Packaging => "sword.packaging",
            TagKey::MetadataFormat => "sword.metadataFormat",
            TagKey::ByReferenceUrl => "sword.byReferenceURL",
            TagKey::ByReferenceDereference => "sword.byReferenceDereference",
            TagKey::ByReferenceTtl => "sword.byReferenceTTL",
            TagKey::ByReferenceContentLength => "sword.byReferenceContentLength",
            TagKey::FileState => "sword.fileState",
        }
    }

    const ALL: [TagKey; 10] = [
        TagKey::OriginalDeposit,
        TagKey::FileSetFile,
        TagKey::DerivedFrom,
        TagKey::Packaging,
        TagKey::MetadataFormat,
        TagKey::ByReferenceUrl,
        TagKey::ByReferenceDereference,
        TagKey::ByReferenceTtl,
        TagKey::ByReferenceContentLength,
        TagKey::FileState,
    ];
}

impl FromStr for TagKey {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TagKey::ALL
            .into_iter()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| TagError::UnknownKey(s.to_string()))
    }
}

impl fmt::Display for TagKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress of a file through the by-reference pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FileState {
    Pending,
    Downloading,
    Unpacking,
    Ingested,
    Error,
}

impl FileState {
    pub fn as_str(self) -> &'static str {
        match self {
            FileState::Pending => "pending",
            FileState::Downloading => "downloading",
            FileState::Unpacking => "unpacking",
            FileState::Ingested => "ingested",
            FileState::Error => "error",
        }
    }

    /// The SWORD URI for this state, as stored and as shown in status links.
    pub fn uri(self) -> String {
        format!("{FILE_STATE_BASE}{}", self.as_str())
    }
}

impl FromStr for FileState {
    type Err = TagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.strip_prefix(FILE_STATE_BASE).unwrap_or(s);
        match name {
            "pending" => Ok(FileState::Pending),
            "downloading" => Ok(FileState::Downloading),
            "unpacking" => Ok(FileState::Unpacking),
            "ingested" => Ok(FileState::Ingested),
            "error" => Ok(FileState::Error),
            _ => Err(TagError::InvalidTagValue {
                key: TagKey::FileState.as_str(),
                value: s.to_string(),
            }),
        }
    }
}

/// A typed tag value.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    Text(String),
    Flag(bool),
    Length(u64),
    State(FileState),
}

impl TagValue {
    /// Parse and validate the storage representation of `key`'s value.
    pub fn parse(key: TagKey, raw: &str) -> Result<Self, TagError> {
        let invalid = || TagError::InvalidTagValue {
            key: key.as_str(),
            value: raw.to_string(),
        };
        match key {
            TagKey::FileState => raw.parse().map(TagValue::State),
            TagKey::OriginalDeposit | TagKey::FileSetFile | TagKey::ByReferenceDereference => {
                match raw {
                    "true" => Ok(TagValue::Flag(true)),
                    "false" => Ok(TagValue::Flag(false)),
                    _ => Err(invalid()),
                }
            }
            TagKey::ByReferenceContentLength => raw
                .parse::<u64>()
                .map(TagValue::Length)
                .map_err(|_| invalid()),
            TagKey::ByReferenceTtl => chrono::DateTime::parse_from_rfc3339(raw)
                .map(|_| TagValue::Text(raw.to_string()))
                .map_err(|_| invalid()),
            TagKey::DerivedFrom
            | TagKey::Packaging
            | TagKey::MetadataFormat
            | TagKey::ByReferenceUrl => {
                if raw.is_empty() {
                    Err(invalid())
                } else {
                    Ok(TagValue::Text(raw.to_string()))
                }
            }
        }
    }

    /// The string written to `object_version_tags.value`.
    pub fn to_storage(&self) -> String {
        match self {
            TagValue::Text(text) => text.clone(),
            TagValue::Flag(flag) => flag.to_string(),
            TagValue::Length(length) => length.to_string(),
            TagValue::State(state) => state.uri(),
        }
    }
}

impl From<FileState> for TagValue {
    fn from(state: FileState) -> Self {
        TagValue::State(state)
    }
}

impl From<bool> for TagValue {
    fn from(flag: bool) -> Self {
        TagValue::Flag(flag)
    }
}

impl From<u64> for TagValue {
    fn from(length: u64) -> Self {
        TagValue::Length(length)
    }
}

impl From<String> for TagValue {
    fn from(text: String) -> Self {
        TagValue::Text(text)
    }
}

impl From<&str> for TagValue {
    fn from(text: &str) -> Self {
        TagValue::Text(text.to_string())
    }
}

/// All tags of one object version, decoded into typed fields.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tags {
    pub original_deposit: bool,
    pub fileset_file: bool,
    pub derived_from: Option<String>,
    pub packaging: Option<String>,
    pub metadata_format: Option<String>,
    pub by_reference_url: Option<String>,
    pub by_reference_dereference: Option<bool>,
    pub by_reference_ttl: Option<String>,
    pub by_reference_content_length: Option<u64>,
    pub file_state: Option<FileState>,
}

impl Tags {
    /// Decode raw storage pairs, validating each value.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, TagError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut tags = Tags::default();
        for (key, value) in pairs {
            let key: TagKey = key.as_ref().parse()?;
            tags.insert(key, TagValue::parse(key, value.as_ref())?);
        }
        Ok(tags)
    }

    /// Apply an already validated value to the matching field.
    pub fn insert(&mut self, key: TagKey, value: TagValue) {
        match (key, value) {
            (TagKey::OriginalDeposit, TagValue::Flag(flag)) => self.original_deposit = flag,
            (TagKey::FileSetFile, TagValue::Flag(flag)) => self.fileset_file = flag,
            (TagKey::ByReferenceDereference, TagValue::Flag(flag)) => {
                self.by_reference_dereference = Some(flag)
            }
            (TagKey::ByReferenceContentLength, TagValue::Length(length)) => {
                self.by_reference_content_length = Some(length)
            }
            (TagKey::FileState, TagValue::State(state)) => self.file_state = Some(state),
            (TagKey::DerivedFrom, TagValue::Text(text)) => self.derived_from = Some(text),
            (TagKey::Packaging, TagValue::Text(text)) => self.packaging = Some(text),
            (TagKey::MetadataFormat, TagValue::Text(text)) => self.metadata_format = Some(text),
            (TagKey::ByReferenceUrl, TagValue::Text(text)) => self.by_reference_url = Some(text),
            (TagKey::ByReferenceTtl, TagValue::Text(text)) => self.by_reference_ttl = Some(text),
            // `parse` always yields the variant matching `key`, so this recurses once.
            (key, value) => {
                if let Ok(value) = TagValue::parse(key, &value.to_storage()) {
                    self.insert(key, value);
                }
            }
        }
    }

    pub fn remove(&mut self, key: TagKey) {
        match key {
            TagKey::OriginalDeposit => self.original_deposit = false,
            TagKey::FileSetFile => self.fileset_file = false,
            TagKey::DerivedFrom => self.derived_from = None,
            TagKey::Packaging => self.packaging = None,
            TagKey::MetadataFormat => self.metadata_format = None,
            TagKey::ByReferenceUrl => self.by_reference_url = None,
            TagKey::ByReferenceDereference => self.by_reference_dereference = None,
            TagKey::ByReferenceTtl => self.by_reference_ttl = None,
            TagKey::ByReferenceContentLength => self.by_reference_content_length = None,
            TagKey::FileState => self.file_state = None,
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Tags::default()
    }
}
