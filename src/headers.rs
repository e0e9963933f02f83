//! Parsing of the parameterised request headers SWORD relies on
//! (`Content-Disposition`, `Content-Type`) and of `In-Progress`.

use percent_encoding::percent_decode_str;
use std::collections::BTreeMap;

/// A header value split into its lower-cased main token and parameters.
///
/// Parameter names are lower-cased; RFC 5987 extended parameters
/// (`filename*=UTF-8''na%C3%AFve.txt`) are decoded and stored under the plain
/// name, taking precedence over the non-extended form.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionsHeader {
    pub value: String,
    pub params: BTreeMap<String, String>,
}

impl OptionsHeader {
    pub fn parse(header: &str) -> Self {
        let mut parts = split_unquoted(header, ';').into_iter();
        let value = parts
            .next()
            .map(|part| part.trim().to_ascii_lowercase())
            .unwrap_or_default();

        let mut params = BTreeMap::new();
        let mut extended = BTreeMap::new();
        for part in parts {
            let Some((name, raw)) = part.split_once('=') else {
                let flag = part.trim().to_ascii_lowercase();
                if !flag.is_empty() {
                    params.insert(flag, String::new());
                }
                continue;
            };
            let name = name.trim().to_ascii_lowercase();
            let raw = raw.trim();
            if let Some(base) = name.strip_suffix('*') {
                if let Some(decoded) = decode_extended(raw) {
                    extended.insert(base.to_string(), decoded);
                }
            } else {
                params.insert(name, unquote(raw));
            }
        }
        params.extend(extended);
        Self { value, params }
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }
}

/// `Content-Disposition`, interpreted for SWORD.
///
/// SWORD overloads the header: besides `attachment; filename=...` it uses
/// `attachment; metadata=true`, `attachment; by-reference=true` and the
/// `segment-init` / `segment` dispositions of segmented uploads.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentDisposition(pub OptionsHeader);

impl ContentDisposition {
    pub fn parse(header: &str) -> Self {
        Self(OptionsHeader::parse(header))
    }

    pub fn kind(&self) -> &str {
        &self.0.value
    }

    /// The client filename with any directory components removed.
    pub fn filename(&self) -> Option<&str> {
        self.0
            .param("filename")
            .map(|name| name.rsplit(['/', '\\']).next().unwrap_or(name))
            .filter(|name| !name.is_empty() && *name != "." && *name != "..")
    }

    pub fn flag(&self, name: &str) -> bool {
        self.0
            .param(name)
            .is_some_and(|value| value.eq_ignore_ascii_case("true"))
    }

    pub fn is_metadata(&self) -> bool {
        self.flag("metadata")
    }

    pub fn is_by_reference(&self) -> bool {
        self.flag("by-reference")
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.0.param(name)
    }
}

/// `In-Progress: true|false`; absent means `false`.
pub fn parse_in_progress(header: Option<&str>) -> Result<bool, String> {
    match header.map(|value| value.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(value) if value == "true" => Ok(true),
        Some(value) if value == "false" => Ok(false),
        Some(value) => Err(format!("invalid In-Progress header `{value}`")),
    }
}

fn split_unquoted(input: &str, separator: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut escaped = false;
    for (index, ch) in input.char_indices() {
        match ch {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c == separator && !in_quotes => {
                parts.push(&input[start..index]);
                start = index + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts
}

fn unquote(raw: &str) -> String {
    let Some(inner) = raw
        .strip_prefix('"')
        .and_then(|rest| rest.strip_suffix('"'))
    else {
        return raw.to_string();
    };
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
            }
        } else {
            out.push(ch);
        }
    }
    out
}

fn decode_extended(raw: &str) -> Option<String> {
    let mut pieces = raw.splitn(3, '\'');
    let charset = pieces.next()?;
    let _language = pieces.next()?;
    let encoded = pieces.next()?;
    if !charset.eq_ignore_ascii_case("utf-8") {
        return None;
    }
    percent_decode_str(encoded)
        .decode_utf8()
        .ok()
        .map(|decoded| decoded.into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_filename_and_flags() {
        let cd = ContentDisposition::parse(r#"attachment; filename="my file.zip"; metadata=true"#);
        assert_eq!(cd.kind(), "attachment");
        assert_eq!(cd.filename(), Some("my file.zip"));
        assert!(cd.is_metadata());
        assert!(!cd.is_by_reference());
    }

    #[test]
    fn extended_filename_wins() {
        let cd = ContentDisposition::parse(
            "attachment; filename=fallback.txt; filename*=UTF-8''na%C3%AFve%3Bname.txt",
        );
        assert_eq!(cd.filename(), Some("naïve;name.txt"));
    }

    #[test]
    fn quoted_separator_and_path_components() {
        let cd = ContentDisposition::parse(r#"attachment; filename="../a;b\"c.txt""#);
        assert_eq!(cd.filename(), Some("a;b\"c.txt"));
    }

    #[test]
    fn segment_init_parameters() {
        let cd = ContentDisposition::parse("segment-init; segment_count=3; segment_size=10; size=25");
        assert_eq!(cd.kind(), "segment-init");
        assert_eq!(cd.param("segment_count"), Some("3"));
        assert_eq!(cd.param("size"), Some("25"));
    }

    #[test]
    fn content_type_charset() {
        let ct = OptionsHeader::parse("Application/LD+JSON; charset=UTF-8");
        assert_eq!(ct.value, "application/ld+json");
        assert_eq!(ct.param("charset"), Some("UTF-8"));
    }

    #[test]
    fn in_progress_values() {
        assert_eq!(parse_in_progress(None), Ok(false));
        assert_eq!(parse_in_progress(Some("TRUE")), Ok(true));
        assert_eq!(parse_in_progress(Some("false")), Ok(false));
        assert!(parse_in_progress(Some("maybe")).is_err());
    }
}
