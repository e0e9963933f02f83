//! Binary packaging: the upload is itself the single file-set member.

use super::IngestResult;
use crate::models::object::ObjectVersion;

/// Key for a binary deposit: the client filename, else `data` with an
/// extension inferred from the media type.
pub fn filename(filename_hint: Option<&str>, media_type_hint: Option<&str>) -> String {
    if let Some(filename) = filename_hint {
        return filename.to_string();
    }
    match media_type_hint {
        Some(media_type) if media_type.eq_ignore_ascii_case("application/octet-stream") => {
            "data.bin".to_string()
        }
        Some(media_type) => mime_guess::get_mime_extensions_str(media_type)
            .and_then(|extensions| extensions.first())
            .map(|extension| format!("data.{extension}"))
            .unwrap_or_else(|| "data".to_string()),
        None => "data".to_string(),
    }
}

/// Nothing to extract; the original deposit is the file-set.
pub fn unpack(original: &ObjectVersion) -> IngestResult {
    IngestResult::new(Some(original.clone()), Vec::new())
}
