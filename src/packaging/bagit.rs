//! SWORD BagIt packaging: a ZIP containing a BagIt bag.
//!
//! The bag is validated before anything is ingested: declaration, payload
//! manifests (every payload file listed, every listed file present with a
//! matching checksum), `Payload-Oxum` and tag manifests when present. Bags
//! relying on `fetch.txt` are refused. `bag-info.txt` is recorded on the
//! deposit and `metadata/sword.json`, if present, replaces the deposit's
//! SWORD metadata.

use super::{Extracted, IngestResult, PackagingError, extract_archive, ingest_extracted};
use crate::{
    metadata::{MetadataDocument, MetadataFormat},
    models::object::ObjectVersion,
    services::{DepositTx, metadata_service},
};
use md5::Context;
use percent_encoding::percent_decode_str;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256, Sha512};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs::File,
    io::{self, Read},
    path::{Path, PathBuf},
};
use tracing::info;

const METADATA_TAG_FILE: &str = "metadata/sword.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Algorithm {
    Md5,
    Sha256,
    Sha512,
}

impl Algorithm {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "md5" => Some(Algorithm::Md5),
            "sha256" => Some(Algorithm::Sha256),
            "sha512" => Some(Algorithm::Sha512),
            _ => None,
        }
    }
}

/// A bag that passed validation.
#[derive(Debug)]
pub struct Bag {
    /// Prefix of the bag directory inside the archive (`""` or `"dir/"`).
    root: String,
    pub info: Map<String, Value>,
    /// Archive names of the payload files.
    pub payload: Vec<String>,
    /// Archive name of the embedded SWORD metadata document.
    pub metadata: Option<String>,
}

impl Bag {
    /// Object key of a payload file: its path below `data/`.
    pub fn payload_key(&self, name: &str) -> String {
        name.strip_prefix(&self.root)
            .and_then(|rest| rest.strip_prefix("data/"))
            .unwrap_or(name)
            .to_string()
    }
}

fn invalid(message: impl Into<String>) -> PackagingError {
    PackagingError::ValidationFailed(message.into())
}

/// Locate the bag: either at the archive root or inside a single top-level
/// directory.
fn find_root(files: &[String]) -> Option<String> {
    if files.iter().any(|name| name == "bagit.txt") {
        return Some(String::new());
    }
    let mut tops = files
        .iter()
        .map(|name| name.split_once('/').map_or(name.as_str(), |(top, _)| top))
        .collect::<BTreeSet<&str>>()
        .into_iter();
    let (Some(top), None) = (tops.next(), tops.next()) else {
        return None;
    };
    let root = format!("{top}/");
    files
        .iter()
        .any(|name| *name == format!("{root}bagit.txt"))
        .then_some(root)
}

/// Payload keys of an archive listing, without validating the bag.
pub fn payload_keys(names: &[String]) -> Vec<String> {
    let Some(root) = find_root(names) else {
        return Vec::new();
    };
    let prefix = format!("{root}data/");
    names
        .iter()
        .filter_map(|name| name.strip_prefix(&prefix))
        .map(str::to_string)
        .collect()
}

fn read_text(path: &Path, label: &str) -> Result<String, PackagingError> {
    let bytes = std::fs::read(path).map_err(|err| invalid(format!("cannot read {label}: {err}")))?;
    let text = String::from_utf8(bytes).map_err(|_| invalid(format!("{label} is not UTF-8")))?;
    Ok(text.trim_start_matches('\u{feff}').to_string())
}

/// Parse `Label: value` lines; indented lines continue the previous value.
fn parse_tag_file(text: &str, label: &str) -> Result<Vec<(String, String)>, PackagingError> {
    let mut entries: Vec<(String, String)> = Vec::new();
    for line in text.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with([' ', '\t']) {
            let Some((_, value)) = entries.last_mut() else {
                return Err(invalid(format!("{label} starts with a continuation line")));
            };
            value.push(' ');
            value.push_str(line.trim());
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(invalid(format!("{label}: malformed line `{line}`")));
        };
        entries.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok(entries)
}

/// `checksum path` lines; paths use BagIt's percent-encoding of CR, LF and `%`.
fn parse_manifest(text: &str, label: &str) -> Result<BTreeMap<String, String>, PackagingError> {
    let mut entries = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let Some((checksum, path)) = line.split_once([' ', '\t']) else {
            return Err(invalid(format!("{label}: malformed line `{line}`")));
        };
        let path = percent_decode_str(path.trim_start())
            .decode_utf8()
            .map_err(|_| invalid(format!("{label}: path is not UTF-8")))?
            .trim_start_matches("./")
            .to_string();
        if path.split('/').any(|part| part == ".." || part.is_empty()) {
            return Err(invalid(format!("{label}: unsafe path `{path}`")));
        }
        entries.insert(path, checksum.to_ascii_lowercase());
    }
    Ok(entries)
}

fn file_digest(path: &Path, algorithm: Algorithm) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut buffer = vec![0u8; 64 * 1024];
    let mut md5 = Context::new();
    let mut sha256 = Sha256::new();
    let mut sha512 = Sha512::new();
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        let chunk = &buffer[..read];
        match algorithm {
            Algorithm::Md5 => md5.consume(chunk),
            Algorithm::Sha256 => sha256.update(chunk),
            Algorithm::Sha512 => sha512.update(chunk),
        }
    }
    Ok(match algorithm {
        Algorithm::Md5 => format!("{:x}", md5.compute()),
        Algorithm::Sha256 => format!("{:x}", sha256.finalize()),
        Algorithm::Sha512 => format!("{:x}", sha512.finalize()),
    })
}

/// Manifests named `{kind}-{algorithm}.txt` at the bag root.
fn manifests(
    files: &[String],
    root: &str,
    kind: &str,
) -> Result<Vec<(String, Algorithm)>, PackagingError> {
    let prefix = format!("{root}{kind}-");
    files
        .iter()
        .filter_map(|name| {
            let algorithm = name.strip_prefix(&prefix)?.strip_suffix(".txt")?;
            (!algorithm.contains('/')).then(|| (name.clone(), algorithm.to_string()))
        })
        .map(|(name, algorithm)| {
            Algorithm::from_name(&algorithm)
                .map(|alg| (name, alg))
                .ok_or_else(|| invalid(format!("unsupported checksum algorithm `{algorithm}`")))
        })
        .collect()
}

fn verify_manifest(
    dir: &Path,
    root: &str,
    name: &str,
    algorithm: Algorithm,
) -> Result<BTreeMap<String, String>, PackagingError> {
    let path = join(dir, name);
    let entries = parse_manifest(&read_text(&path, name)?, name)?;
    for (relative, expected) in &entries {
        let target = join(dir, &format!("{root}{relative}"));
        if !target.is_file() {
            return Err(invalid(format!("{name}: `{relative}` is missing from the bag")));
        }
        let actual = file_digest(&target, algorithm)?;
        if actual != *expected {
            return Err(invalid(format!(
                "{name}: checksum mismatch for `{relative}`"
            )));
        }
    }
    Ok(entries)
}

fn join(dir: &Path, name: &str) -> PathBuf {
    name.split('/').fold(dir.to_path_buf(), |path, part| path.join(part))
}

/// Validate the bag extracted into `dir`, whose regular files are `files`.
pub fn validate(dir: &Path, files: &[String]) -> Result<Bag, PackagingError> {
    let root = find_root(files).ok_or_else(|| invalid("bagit.txt not found"))?;

    let declaration = parse_tag_file(
        &read_text(&join(dir, &format!("{root}bagit.txt")), "bagit.txt")?,
        "bagit.txt",
    )?;
    let declared = |label: &str| {
        declaration
            .iter()
            .find(|(name, _)| name == label)
            .map(|(_, value)| value.clone())
    };
    if declared("BagIt-Version").is_none() {
        return Err(invalid("bagit.txt lacks BagIt-Version"));
    }
    match declared("Tag-File-Character-Encoding") {
        Some(encoding) if encoding.eq_ignore_ascii_case("utf-8") => {}
        Some(encoding) => {
            return Err(invalid(format!("unsupported tag file encoding `{encoding}`")));
        }
        None => return Err(invalid("bagit.txt lacks Tag-File-Character-Encoding")),
    }

    let fetch = format!("{root}fetch.txt");
    if files.contains(&fetch) {
        let text = read_text(&join(dir, &fetch), "fetch.txt")?;
        if text.lines().any(|line| !line.trim().is_empty()) {
            return Err(invalid("fetch.txt is not supported in SWORD BagIt"));
        }
    }

    let payload_prefix = format!("{root}data/");
    let payload: Vec<String> = files
        .iter()
        .filter(|name| name.starts_with(&payload_prefix))
        .cloned()
        .collect();

    let payload_manifests = manifests(files, &root, "manifest")?;
    if payload_manifests.is_empty() {
        return Err(invalid("bag has no payload manifest"));
    }
    for (name, algorithm) in &payload_manifests {
        let listed = verify_manifest(dir, &root, name, *algorithm)?;
        if let Some(stray) = listed.keys().find(|path| !path.starts_with("data/")) {
            return Err(invalid(format!("{name}: `{stray}` is outside the payload")));
        }
        for file in &payload {
            let relative = &file[root.len()..];
            if !listed.contains_key(relative) {
                return Err(invalid(format!("{name}: `{relative}` is not listed")));
            }
        }
    }

    let bag_info = format!("{root}bag-info.txt");
    let info = if files.contains(&bag_info) {
        parse_tag_file(&read_text(&join(dir, &bag_info), "bag-info.txt")?, "bag-info.txt")?
    } else {
        Vec::new()
    };

    if let Some((_, oxum)) = info.iter().find(|(name, _)| name == "Payload-Oxum") {
        let (octets, count) = oxum
            .split_once('.')
            .and_then(|(octets, count)| Some((octets.parse::<u64>().ok()?, count.parse::<usize>().ok()?)))
            .ok_or_else(|| invalid(format!("malformed Payload-Oxum `{oxum}`")))?;
        let mut actual_octets = 0u64;
        for file in &payload {
            actual_octets += std::fs::metadata(join(dir, file))?.len();
        }
        if octets != actual_octets || count != payload.len() {
            return Err(invalid(format!(
                "Payload-Oxum {oxum} does not match payload {actual_octets}.{}",
                payload.len()
            )));
        }
    }

    let tag_manifests = manifests(files, &root, "tagmanifest")?;
    let mut tag_entries = BTreeSet::new();
    for (name, algorithm) in &tag_manifests {
        tag_entries.extend(verify_manifest(dir, &root, name, *algorithm)?.into_keys());
    }

    let metadata_name = format!("{root}{METADATA_TAG_FILE}");
    let metadata = (files.contains(&metadata_name) || tag_entries.contains(METADATA_TAG_FILE))
        .then_some(metadata_name)
        .filter(|name| join(dir, name).is_file());

    Ok(Bag {
        root,
        info: info_to_json(info),
        payload,
        metadata,
    })
}

/// Repeated labels become arrays, as BagIt allows.
fn info_to_json(entries: Vec<(String, String)>) -> Map<String, Value> {
    let mut info = Map::new();
    for (name, value) in entries {
        match info.get_mut(&name) {
            Some(Value::Array(values)) => values.push(Value::String(value)),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, Value::String(value)]);
            }
            None => {
                info.insert(name, Value::String(value));
            }
        }
    }
    info
}

async fn validate_extracted(extracted: &Extracted) -> Result<Bag, PackagingError> {
    let dir = extracted.dir.path().to_path_buf();
    let files = extracted.files.clone();
    tokio::task::spawn_blocking(move || validate(&dir, &files))
        .await
        .map_err(|err| PackagingError::Io(io::Error::other(err)))?
}

pub async fn unpack(
    ctx: &mut DepositTx<'_>,
    original: &ObjectVersion,
) -> Result<IngestResult, PackagingError> {
    let instance = ctx.storage.payload_of(ctx.conn, original).await?;
    let extracted = extract_archive(
        ctx.storage.payload_path(&instance),
        ctx.storage.scratch_dir(),
        ctx.storage.unpack_limit(),
    )
    .await?;
    let bag = validate_extracted(&extracted).await?;

    ctx.deposit.bagit_info = Some(Value::Object(bag.info.clone()));

    let mut created = Vec::new();
    if let Some(name) = &bag.metadata {
        let bytes = tokio::fs::read(extracted.path_of(name)).await?;
        let document = MetadataDocument {
            bytes: &bytes,
            content_type: MetadataFormat::Sword.content_type(),
            encoding: None,
        };
        let stored = metadata_service::set_metadata(
            ctx,
            MetadataFormat::Sword,
            Some(document),
            Some(&original.key),
            true,
        )
        .await?;
        created.extend(stored);
    }

    let entries: Vec<(String, String)> = bag
        .payload
        .iter()
        .map(|name| (name.clone(), bag.payload_key(name)))
        .collect();
    created.extend(ingest_extracted(ctx, original, &extracted, &entries).await?);

    info!(deposit = %ctx.deposit.id, original = %original.key, files = entries.len(), "unpacked bag");
    Ok(IngestResult::new(Some(original.clone()), created))
}
