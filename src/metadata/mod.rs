//! Format-polymorphic deposit metadata.
//!
//! A [`Metadata`] value is parsed from a client document, merged with or
//! replacing the stored document, projected onto the deposit record and
//! serialized back for storage. One variant exists per supported wire format;
//! [`MetadataRegistry`] maps format identifiers onto them.

pub mod dublin_core;
pub mod sword;

use crate::{models::deposit::Deposit, services::storage_service::StorageError};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use thiserror::Error;

pub use dublin_core::DublinCoreMetadata;
pub use sword::{SWORD_CONTEXT, SwordMetadata};

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("content type `{found}` is not acceptable for this metadata format; expected `{expected}`")]
    UnsupportedMediaType {
        expected: &'static str,
        found: String,
    },
    #[error("malformed metadata document: {0}")]
    MalformedContent(String),
    #[error(
        "existing or new metadata is of the wrong type for appending; reconcile client-side and PUT instead"
    )]
    TypeMismatch,
    #[error("metadata format `{0}` is not supported")]
    UnknownFormat(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A metadata document as received: raw bytes plus the media type (without
/// parameters) and `charset` it was sent with.
#[derive(Debug, Clone, Copy)]
pub struct MetadataDocument<'a> {
    pub bytes: &'a [u8],
    pub content_type: &'a str,
    pub encoding: Option<&'a str>,
}

/// Supported metadata wire formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetadataFormat {
    Sword,
    DublinCore,
}

impl MetadataFormat {
    pub const ALL: [MetadataFormat; 2] = [MetadataFormat::Sword, MetadataFormat::DublinCore];

    pub fn uri(self) -> &'static str {
        match self {
            MetadataFormat::Sword => "http://purl.org/net/sword/3.0/types/Metadata",
            MetadataFormat::DublinCore => "http://purl.org/dc/elements/1.1/",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            MetadataFormat::Sword => "application/ld+json",
            MetadataFormat::DublinCore => "application/json",
        }
    }

    /// File name of the stored metadata object.
    pub fn filename(self) -> &'static str {
        match self {
            MetadataFormat::Sword => "sword.json",
            MetadataFormat::DublinCore => "dc.json",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|format| format.uri() == uri)
    }
}

/// A parsed metadata document.
#[derive(Debug, Clone, PartialEq)]
pub enum Metadata {
    Sword(SwordMetadata),
    DublinCore(DublinCoreMetadata),
}

impl Metadata {
    /// Parse a client document.
    ///
    /// `content_type` is the media type without parameters and `encoding` the
    /// `charset` parameter, if any.
    pub fn from_document(
        format: MetadataFormat,
        bytes: &[u8],
        content_type: &str,
        encoding: Option<&str>,
    ) -> Result<Self, MetadataError> {
        if !content_type.eq_ignore_ascii_case(format.content_type()) {
            return Err(MetadataError::UnsupportedMediaType {
                expected: format.content_type(),
                found: content_type.to_string(),
            });
        }
        if let Some(encoding) = encoding {
            if !matches!(encoding.to_ascii_lowercase().as_str(), "utf-8" | "utf8" | "utf_8") {
                return Err(MetadataError::MalformedContent(format!(
                    "unsupported charset `{encoding}`"
                )));
            }
        }
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|err| MetadataError::MalformedContent(err.to_string()))?;
        Self::from_value(format, value)
    }

    /// Build from an already decoded JSON document.
    pub fn from_value(format: MetadataFormat, value: Value) -> Result<Self, MetadataError> {
        let Value::Object(mut data) = value else {
            return Err(MetadataError::MalformedContent(
                "metadata document must be a JSON object".into(),
            ));
        };
        data.remove("@id");
        match format {
            MetadataFormat::Sword => Ok(Metadata::Sword(SwordMetadata::new(data))),
            MetadataFormat::DublinCore => {
                DublinCoreMetadata::new(data).map(Metadata::DublinCore)
            }
        }
    }

    pub fn format(&self) -> MetadataFormat {
        match self {
            Metadata::Sword(_) => MetadataFormat::Sword,
            Metadata::DublinCore(_) => MetadataFormat::DublinCore,
        }
    }

    fn data(&self) -> &Map<String, Value> {
        match self {
            Metadata::Sword(metadata) => metadata.data(),
            Metadata::DublinCore(metadata) => metadata.data(),
        }
    }

    /// Append `other` onto `self`; keys in `other` win.
    pub fn merge(self, other: Metadata) -> Result<Metadata, MetadataError> {
        match (self, other) {
            (Metadata::Sword(existing), Metadata::Sword(new)) => {
                Ok(Metadata::Sword(existing.merge(new)))
            }
            (Metadata::DublinCore(existing), Metadata::DublinCore(new)) => {
                Ok(Metadata::DublinCore(existing.merge(new)))
            }
            _ => Err(MetadataError::TypeMismatch),
        }
    }

    pub fn title(&self) -> Option<String> {
        match self {
            Metadata::Sword(metadata) => metadata.title(),
            Metadata::DublinCore(metadata) => metadata.title(),
        }
    }

    /// Update the repository-native fields this format understands.
    pub fn project_onto(&self, deposit: &mut Deposit) {
        set_title(deposit, self.title());
    }

    /// Canonical bytes for storage.
    pub fn serialize(&self) -> Vec<u8> {
        pretty(&Value::Object(self.data().clone()))
    }

    /// Bytes served to clients, with `@id` set to the metadata URL.
    pub fn to_wire_document(&self, canonical_url: &str) -> Vec<u8> {
        let mut data = self.data().clone();
        data.insert("@id".into(), Value::String(canonical_url.to_string()));
        pretty(&Value::Object(data))
    }

    /// The document in SWORD JSON-LD form, as kept inline on the deposit.
    pub fn to_sword_json(&self) -> Value {
        match self {
            Metadata::Sword(metadata) => Value::Object(metadata.data().clone()),
            Metadata::DublinCore(metadata) => metadata.to_sword_json(),
        }
    }
}

/// Set or clear the projected title on the deposit.
pub fn set_title(deposit: &mut Deposit, title: Option<String>) {
    match title {
        Some(title) => {
            let statement = deposit
                .metadata
                .entry("title_statement")
                .or_insert_with(|| Value::Object(Map::new()));
            if !statement.is_object() {
                *statement = Value::Object(Map::new());
            }
            if let Value::Object(statement) = statement {
                statement.insert("title".into(), Value::String(title));
            }
        }
        None => {
            let now_empty = match deposit.metadata.get_mut("title_statement") {
                Some(Value::Object(statement)) => {
                    statement.remove("title");
                    statement.is_empty()
                }
                _ => false,
            };
            if now_empty {
                deposit.metadata.remove("title_statement");
            }
        }
    }
}

fn pretty(value: &Value) -> Vec<u8> {
    let mut bytes = serde_json::to_vec_pretty(value).unwrap_or_default();
    bytes.push(b'\n');
    bytes
}

/// Extract a plain string from a JSON-LD literal: a string, a `@value`
/// object, or the first element of an array of either.
pub(crate) fn literal(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Object(object) => object.get("@value").and_then(literal),
        Value::Array(items) => items.first().and_then(literal),
        _ => None,
    }
}

/// The metadata formats enabled for this server.
#[derive(Debug, Clone)]
pub struct MetadataRegistry {
    formats: BTreeSet<MetadataFormat>,
}

impl MetadataRegistry {
    pub fn from_uris<S: AsRef<str>>(uris: &[S]) -> Result<Self, MetadataError> {
        let formats = uris
            .iter()
            .map(|uri| {
                MetadataFormat::from_uri(uri.as_ref())
                    .ok_or_else(|| MetadataError::UnknownFormat(uri.as_ref().to_string()))
            })
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(Self { formats })
    }

    /// Resolve a `Metadata-Format` header; absent means SWORD JSON-LD.
    pub fn resolve(&self, uri: Option<&str>) -> Result<MetadataFormat, MetadataError> {
        let uri = uri.unwrap_or(MetadataFormat::Sword.uri());
        MetadataFormat::from_uri(uri)
            .filter(|format| self.formats.contains(format))
            .ok_or_else(|| MetadataError::UnknownFormat(uri.to_string()))
    }

    pub fn contains(&self, format: MetadataFormat) -> bool {
        self.formats.contains(&format)
    }

    /// Identifiers of every enabled format, sorted.
    pub fn uris(&self) -> Vec<&'static str> {
        let mut uris: Vec<_> = self.formats.iter().map(|format| format.uri()).collect();
        uris.sort_unstable();
        uris
    }
}

impl Default for MetadataRegistry {
    fn default() -> Self {
        Self {
            formats: MetadataFormat::ALL.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn sword(doc: Value) -> Metadata {
        Metadata::from_document(
            MetadataFormat::Sword,
            doc.to_string().as_bytes(),
            "application/ld+json",
            None,
        )
        .unwrap()
    }

    #[test]
    fn wrong_content_type_is_unsupported() {
        let err = Metadata::from_document(
            MetadataFormat::Sword,
            b"{}",
            "application/json",
            None,
        )
        .unwrap_err();
        assert!(matches!(err, MetadataError::UnsupportedMediaType { .. }));
    }

    #[test]
    fn invalid_json_is_malformed() {
        for body in [&b"{not json"[..], b"[1, 2]"] {
            let err = Metadata::from_document(
                MetadataFormat::Sword,
                body,
                "application/ld+json",
                Some("utf-8"),
            )
            .unwrap_err();
            assert!(matches!(err, MetadataError::MalformedContent(_)));
        }
    }

    #[test]
    fn serialize_strips_and_wire_document_reinjects_id() {
        let doc = json!({
            "@context": SWORD_CONTEXT,
            "@id": "http://client.example/ignored",
            "@type": "Metadata",
            "dc:title": "The title",
        });
        let metadata = sword(doc.clone());

        let mut canonical = doc.as_object().unwrap().clone();
        canonical.remove("@id");
        let expected = pretty(&Value::Object(canonical.clone()));
        assert_eq!(metadata.serialize(), expected);

        let reparsed = Metadata::from_document(
            MetadataFormat::Sword,
            &metadata.serialize(),
            "application/ld+json",
            None,
        )
        .unwrap();
        assert_eq!(reparsed, metadata);

        let wire: Value =
            serde_json::from_slice(&metadata.to_wire_document("http://localhost/deposit/1/metadata"))
                .unwrap();
        assert_eq!(wire["@id"], "http://localhost/deposit/1/metadata");
        assert_eq!(wire["dc:title"], "The title");
    }

    #[test]
    fn merge_later_keys_override() {
        let existing = sword(json!({"dc:title": "Old", "dc:creator": "Alice"}));
        let new = sword(json!({"dc:title": "New", "dc:subject": "Rust"}));

        let merged = existing.merge(new).unwrap();
        let value = merged.to_sword_json();
        assert_eq!(value["dc:title"], "New");
        assert_eq!(value["dc:creator"], "Alice");
        assert_eq!(value["dc:subject"], "Rust");
    }

    #[test]
    fn merge_across_formats_is_a_type_mismatch() {
        let existing = sword(json!({"dc:title": "Old"}));
        let new = Metadata::from_value(MetadataFormat::DublinCore, json!({"title": "New"})).unwrap();
        assert!(matches!(existing.merge(new), Err(MetadataError::TypeMismatch)));
    }

    #[test]
    fn project_sets_and_clears_title() {
        let mut deposit = Deposit::new(Uuid::new_v4());
        deposit
            .metadata
            .insert("access_right".into(), json!("open"));

        sword(json!({"dc:title": "A title"})).project_onto(&mut deposit);
        assert_eq!(deposit.title(), Some("A title"));

        sword(json!({"dc:creator": "Bob"})).project_onto(&mut deposit);
        assert_eq!(deposit.title(), None);
        assert!(!deposit.metadata.contains_key("title_statement"));
        assert_eq!(deposit.metadata["access_right"], "open");
    }

    #[test]
    fn registry_resolves_enabled_formats_only() {
        let registry = MetadataRegistry::from_uris(&[MetadataFormat::Sword.uri()]).unwrap();
        assert_eq!(registry.resolve(None).unwrap(), MetadataFormat::Sword);
        assert!(matches!(
            registry.resolve(Some(MetadataFormat::DublinCore.uri())),
            Err(MetadataError::UnknownFormat(_))
        ));
        assert!(MetadataRegistry::from_uris(&["http://example.org/nope"]).is_err());
        assert_eq!(
            MetadataRegistry::default().uris(),
            vec![
                "http://purl.org/dc/elements/1.1/",
                "http://purl.org/net/sword/3.0/types/Metadata"
            ]
        );
    }
}
