//! SWORD JSON-LD metadata (`http://purl.org/net/sword/3.0/types/Metadata`).

use super::literal;
use serde_json::{Map, Value};
use std::collections::HashMap;

pub const SWORD_CONTEXT: &str = "https://swordapp.github.io/swordv3/swordv3.jsonld";

/// Dublin Core title properties, in order of preference.
const TITLE_IRIS: [&str; 2] = [
    "http://purl.org/dc/elements/1.1/title",
    "http://purl.org/dc/terms/title",
];

/// Prefixes assumed even when a document's own context does not bind them.
const DEFAULT_PREFIXES: [(&str, &str); 2] = [
    ("dc", "http://purl.org/dc/elements/1.1/"),
    ("dcterms", "http://purl.org/dc/terms/"),
];

/// Term and prefix bindings read from a document's inline `@context`.
///
/// This is not full JSON-LD expansion: remote contexts are not fetched and
/// scoped contexts, `@base` and keyword aliases are ignored.
struct TermMap {
    terms: HashMap<String, String>,
    vocab: Option<String>,
}

impl TermMap {
    fn of(data: &Map<String, Value>) -> Self {
        let mut map = TermMap {
            terms: DEFAULT_PREFIXES
                .iter()
                .map(|(prefix, iri)| (prefix.to_string(), iri.to_string()))
                .collect(),
            vocab: None,
        };
        match data.get("@context") {
            Some(Value::Array(items)) => items.iter().for_each(|item| map.bind(item)),
            Some(item) => map.bind(item),
            None => {}
        }
        map
    }

    fn bind(&mut self, item: &Value) {
        let Value::Object(definitions) = item else {
            return;
        };
        for (term, definition) in definitions {
            let iri = match definition {
                Value::String(iri) => iri.as_str(),
                Value::Object(definition) => match definition.get("@id").and_then(Value::as_str) {
                    Some(iri) => iri,
                    None => continue,
                },
                _ => continue,
            };
            if term == "@vocab" {
                self.vocab = Some(iri.to_string());
            } else if !term.starts_with('@') {
                self.terms.insert(term.clone(), iri.to_string());
            }
        }
    }

    /// The IRI a property name stands for.
    fn expand(&self, key: &str) -> Option<String> {
        if let Some(iri) = self.terms.get(key) {
            return Some(self.expand_prefixed(iri).unwrap_or_else(|| iri.clone()));
        }
        if let Some(iri) = self.expand_prefixed(key) {
            return Some(iri);
        }
        if key.contains(':') || key.starts_with('@') {
            return Some(key.to_string());
        }
        self.vocab.as_ref().map(|vocab| format!("{vocab}{key}"))
    }

    fn expand_prefixed(&self, value: &str) -> Option<String> {
        let (prefix, suffix) = value.split_once(':')?;
        if suffix.starts_with("//") {
            return None;
        }
        self.terms.get(prefix).map(|iri| format!("{iri}{suffix}"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SwordMetadata {
    data: Map<String, Value>,
}

impl SwordMetadata {
    pub fn new(data: Map<String, Value>) -> Self {
        Self { data }
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn merge(mut self, other: SwordMetadata) -> SwordMetadata {
        self.data.extend(other.data);
        self
    }

    /// The Dublin Core title, matched by IRI after resolving the
    /// document's inline `@context`.
    pub fn title(&self) -> Option<String> {
        let terms = TermMap::of(&self.data);
        TITLE_IRIS.iter().find_map(|title| {
            self.data
                .iter()
                .filter(|(key, _)| terms.expand(key).as_deref() == Some(*title))
                .find_map(|(_, value)| literal(value))
        })
    }
}
