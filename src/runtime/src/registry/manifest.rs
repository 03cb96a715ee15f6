//! Manifest media types and decoding.
//!
//! Only what staleness and architecture detection need is decoded: the
//! manifest kind, its content digest, per-platform entries of a list or
//! index, and the config digest of a single-platform manifest.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use refit_core::error::{RefitError, Result};
use serde::Deserialize;
use sha2::{Digest, Sha256};

pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_IMAGE_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const DOCKER_MANIFEST_V1: &str = "application/vnd.docker.distribution.manifest.v1+json";
pub const DOCKER_MANIFEST_V1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";

/// `Accept` values in order of preference.
pub const ACCEPTED_MEDIA_TYPES: &[&str] = &[
    OCI_IMAGE_INDEX,
    DOCKER_MANIFEST_LIST,
    DOCKER_MANIFEST_V2,
    OCI_IMAGE_MANIFEST,
    DOCKER_MANIFEST_V1,
    DOCKER_MANIFEST_V1_SIGNED,
];

/// Architectures that carry no information.
const SENTINEL_ARCHITECTURES: &[&str] = &["", "unknown"];

/// Kind of manifest the registry returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    OciIndex,
    DockerManifestList,
    DockerManifestV2,
    OciManifest,
    DockerManifestV1,
}

impl ManifestKind {
    /// Classify a `Content-Type` (parameters ignored).
    pub fn from_media_type(media_type: &str) -> Option<Self> {
        let essence = media_type.split(';').next().unwrap_or("").trim();
        match essence {
            OCI_IMAGE_INDEX => Some(Self::OciIndex),
            DOCKER_MANIFEST_LIST => Some(Self::DockerManifestList),
            DOCKER_MANIFEST_V2 => Some(Self::DockerManifestV2),
            OCI_IMAGE_MANIFEST => Some(Self::OciManifest),
            DOCKER_MANIFEST_V1 | DOCKER_MANIFEST_V1_SIGNED => Some(Self::DockerManifestV1),
            _ => None,
        }
    }

    /// Multi-platform list or index.
    pub fn is_list(&self) -> bool {
        matches!(self, Self::OciIndex | Self::DockerManifestList)
    }
}

/// One platform of a multi-platform image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformEntry {
    pub architecture: String,
    pub os: String,
    pub variant: Option<String>,
}

/// Result of a manifest fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestDescriptor {
    pub kind: ManifestKind,
    /// Content digest, e.g. `sha256:...`
    pub digest: String,
    /// Platforms with a meaningful architecture
    pub platforms: Vec<PlatformEntry>,
    /// Config blob of a single-platform v2/OCI manifest
    pub config_digest: Option<String>,
}

impl ManifestDescriptor {
    /// De-duplicated architectures in manifest order, sentinels removed.
    pub fn architectures(&self) -> Vec<String> {
        dedup_architectures(self.platforms.iter().map(|p| p.architecture.as_str()))
    }
}

/// Filter sentinel values and duplicates, keeping first-seen order.
pub fn dedup_architectures<'a>(architectures: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut seen: Vec<String> = Vec::new();
    for arch in architectures {
        let arch = arch.trim();
        if SENTINEL_ARCHITECTURES.contains(&arch) {
            continue;
        }
        if !seen.iter().any(|s| s == arch) {
            seen.push(arch.to_string());
        }
    }
    seen
}

/// `sha256:<hex>` of a manifest body, used when the registry omits
/// `Docker-Content-Digest`.
pub fn content_digest(body: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(body)))
}

/// Digest of a manifest of `kind`. A signed schema-v1 body is hashed over
/// its JWS payload, the same bytes the engine records, not the raw body.
pub fn manifest_digest(kind: ManifestKind, body: &[u8]) -> String {
    match kind {
        ManifestKind::DockerManifestV1 => match signed_payload(body) {
            Some(payload) => content_digest(&payload),
            None => content_digest(body),
        },
        _ => content_digest(body),
    }
}

/// Rebuild the payload of a `+prettyjws` manifest: the first
/// `formatLength` bytes followed by the decoded `formatTail`.
fn signed_payload(body: &[u8]) -> Option<Vec<u8>> {
    let doc: SignedDocument = serde_json::from_slice(body).ok()?;
    let protected = decode_jws_segment(&doc.signatures.first()?.protected)?;
    let header: ProtectedHeader = serde_json::from_slice(&protected).ok()?;

    let mut payload = body.get(..header.format_length)?.to_vec();
    payload.extend(decode_jws_segment(&header.format_tail)?);
    Some(payload)
}

fn decode_jws_segment(segment: &str) -> Option<Vec<u8>> {
    URL_SAFE_NO_PAD.decode(segment.trim_end_matches('=')).ok()
}

#[derive(Deserialize)]
struct MediaTypeProbe {
    #[serde(rename = "mediaType")]
    media_type: Option<String>,
    #[serde(rename = "schemaVersion")]
    schema_version: Option<u32>,
}

#[derive(Deserialize)]
struct IndexDocument {
    #[serde(default)]
    manifests: Vec<IndexEntry>,
}

#[derive(Deserialize)]
struct IndexEntry {
    platform: Option<PlatformDocument>,
}

#[derive(Deserialize)]
struct PlatformDocument {
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    os: String,
    variant: Option<String>,
}

#[derive(Deserialize)]
struct ImageManifestDocument {
    config: Option<DescriptorDocument>,
}

#[derive(Deserialize)]
struct DescriptorDocument {
    digest: String,
}

#[derive(Deserialize)]
struct SchemaV1Document {
    #[serde(default)]
    architecture: String,
}

#[derive(Deserialize)]
struct SignedDocument {
    #[serde(default)]
    signatures: Vec<SignatureDocument>,
}

#[derive(Deserialize)]
struct SignatureDocument {
    protected: String,
}

#[derive(Deserialize)]
struct ProtectedHeader {
    #[serde(rename = "formatLength")]
    format_length: usize,
    #[serde(rename = "formatTail")]
    format_tail: String,
}

impl From<PlatformDocument> for PlatformEntry {
    fn from(doc: PlatformDocument) -> Self {
        Self {
            architecture: doc.architecture,
            os: doc.os,
            variant: doc.variant.filter(|v| !v.is_empty()),
        }
    }
}

fn decode_error(reference: &str, message: impl std::fmt::Display) -> RefitError {
    RefitError::ManifestDecode {
        reference: reference.to_string(),
        message: message.to_string(),
    }
}

fn keep_platform(entry: &PlatformEntry) -> bool {
    !SENTINEL_ARCHITECTURES.contains(&entry.architecture.trim())
}

/// Classify and decode a manifest body.
///
/// The kind comes from `content_type`; when that is missing or generic
/// (`application/json`), the body's own `mediaType` decides.
pub fn decode(
    reference: &str,
    content_type: Option<&str>,
    body: &[u8],
    digest: Option<String>,
) -> Result<ManifestDescriptor> {
    let kind = match content_type.and_then(ManifestKind::from_media_type) {
        Some(kind) => kind,
        None => {
            let probe: MediaTypeProbe =
                serde_json::from_slice(body).map_err(|e| decode_error(reference, e))?;
            match (probe.media_type.as_deref(), probe.schema_version) {
                (Some(media_type), _) => ManifestKind::from_media_type(media_type).ok_or_else(|| {
                    decode_error(reference, format!("unsupported media type '{}'", media_type))
                })?,
                (None, Some(1)) => ManifestKind::DockerManifestV1,
                _ => {
                    return Err(decode_error(
                        reference,
                        format!(
                            "cannot classify manifest with content type '{}'",
                            content_type.unwrap_or("")
                        ),
                    ))
                }
            }
        }
    };

    let digest = digest.unwrap_or_else(|| manifest_digest(kind, body));

    let (platforms, config_digest) = match kind {
        ManifestKind::OciIndex | ManifestKind::DockerManifestList => {
            let doc: IndexDocument =
                serde_json::from_slice(body).map_err(|e| decode_error(reference, e))?;
            let platforms = doc
                .manifests
                .into_iter()
                .filter_map(|m| m.platform)
                .map(PlatformEntry::from)
                .filter(keep_platform)
                .collect();
            (platforms, None)
        }
        ManifestKind::DockerManifestV2 | ManifestKind::OciManifest => {
            let doc: ImageManifestDocument =
                serde_json::from_slice(body).map_err(|e| decode_error(reference, e))?;
            (Vec::new(), doc.config.map(|c| c.digest))
        }
        ManifestKind::DockerManifestV1 => {
            let doc: SchemaV1Document =
                serde_json::from_slice(body).map_err(|e| decode_error(reference, e))?;
            let entry = PlatformEntry {
                architecture: doc.architecture,
                os: "linux".to_string(),
                variant: None,
            };
            (
                Some(entry).filter(keep_platform).into_iter().collect(),
                None,
            )
        }
    };

    Ok(ManifestDescriptor {
        kind,
        digest,
        platforms,
        config_digest,
    })
}

/// Platform recorded in an image config blob.
pub fn decode_config_platform(reference: &str, body: &[u8]) -> Result<Option<PlatformEntry>> {
    let doc: PlatformDocument =
        serde_json::from_slice(body).map_err(|e| decode_error(reference, e))?;
    let entry = PlatformEntry::from(doc);
    Ok(Some(entry).filter(keep_platform))
}
