//! Plain Dublin Core elements as JSON (`http://purl.org/dc/elements/1.1/`).
//!
//! Documents are objects keyed by bare element names (`title`, `creator`,
//! ...). Inline SWORD metadata is produced by prefixing each element with
//! `dc:`.

use super::{MetadataError, SWORD_CONTEXT, literal};
use serde_json::{Map, Value};

const ELEMENTS: [&str; 15] = [
    "contributor",
    "coverage",
    "creator",
    "date",
    "description",
    "format",
    "identifier",
    "language",
    "publisher",
    "relation",
    "rights",
    "source",
    "subject",
    "title",
    "type",
];

#[derive(Debug, Clone, PartialEq)]
pub struct DublinCoreMetadata {
    data: Map<String, Value>,
}

impl DublinCoreMetadata {
    /// Accepts only the fifteen DCMES elements (plus `@context`).
    pub fn new(mut data: Map<String, Value>) -> Result<Self, MetadataError> {
        data.remove("@context");
        if let Some(unknown) = data.keys().find(|key| !ELEMENTS.contains(&key.as_str())) {
            return Err(MetadataError::MalformedContent(format!(
                "`{unknown}` is not a Dublin Core element"
            )));
        }
        Ok(Self { data })
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn merge(mut self, other: DublinCoreMetadata) -> DublinCoreMetadata {
        self.data.extend(other.data);
        self
    }

    pub fn title(&self) -> Option<String> {
        self.data.get("title").and_then(literal)
    }

    pub fn to_sword_json(&self) -> Value {
        let mut sword = Map::new();
        sword.insert("@context".into(), Value::String(SWORD_CONTEXT.into()));
        sword.insert("@type".into(), Value::String("Metadata".into()));
        for (element, value) in &self.data {
            sword.insert(format!("dc:{element}"), value.clone());
        }
        Value::Object(sword)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_unknown_elements() {
        let data = json!({"title": "T", "colour": "red"});
        let err = DublinCoreMetadata::new(data.as_object().unwrap().clone()).unwrap_err();
        assert!(matches!(err, MetadataError::MalformedContent(_)));
    }

    #[test]
    fn converts_to_prefixed_sword_form() {
        let data = json!({"title": "T", "creator": ["A", "B"]});
        let metadata = DublinCoreMetadata::new(data.as_object().unwrap().clone()).unwrap();
        assert_eq!(metadata.title().as_deref(), Some("T"));

        let sword = metadata.to_sword_json();
        assert_eq!(sword["@context"], SWORD_CONTEXT);
        assert_eq!(sword["dc:title"], "T");
        assert_eq!(sword["dc:creator"], json!(["A", "B"]));
    }
}
