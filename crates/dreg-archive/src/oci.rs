//! OCI image-layout documents found inside an export archive.

use std::collections::BTreeMap;

use dreg_cas::Digest;
use serde::{Deserialize, Serialize};

pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_TAR_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";
pub const DOCKER_MANIFEST_LIST: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Path of the top-level index inside an export.
pub const INDEX_PATH: &str = "index.json";
/// Directory prefix of content blobs inside an export.
pub const BLOBS_PREFIX: &str = "blobs/sha256/";

/// Top-level `index.json` of an image layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl ImageIndex {
    /// Index with the given manifests and the OCI index media type.
    pub fn new(manifests: Vec<Descriptor>) -> Self {
        Self {
            schema_version: 2,
            media_type: Some(OCI_INDEX.to_string()),
            manifests,
            annotations: None,
        }
    }

    /// The only manifest this index lists, if it lists exactly one.
    pub fn single_manifest(&self) -> Option<&Descriptor> {
        match self.manifests.as_slice() {
            [only] => Some(only),
            _ => None,
        }
    }
}

/// Single-platform image manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    pub config: Descriptor,
    #[serde(default)]
    pub layers: Vec<Descriptor>,
}

/// Content descriptor: what a blob is, where it is, how big it is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: Digest,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, data: &[u8]) -> Self {
        Self {
            media_type: media_type.into(),
            digest: Digest::of(data),
            size: data.len() as u64,
            annotations: None,
        }
    }

    /// Value of the `org.opencontainers.image.ref.name` annotation.
    pub fn ref_name(&self) -> Option<&str> {
        self.annotations
            .as_ref()?
            .get("org.opencontainers.image.ref.name")
            .map(String::as_str)
    }
}

pub fn is_index_type(media_type: &str) -> bool {
    media_type == OCI_INDEX || media_type == DOCKER_MANIFEST_LIST
}

pub fn is_manifest_type(media_type: &str) -> bool {
    media_type == OCI_MANIFEST || media_type == DOCKER_MANIFEST
}

/// Guess the media type of a JSON document from its `mediaType` field,
/// falling back to its shape. `None` when it is not an index or manifest.
pub fn sniff_media_type(data: &[u8]) -> Option<&'static str> {
    let value: serde_json::Value = serde_json::from_slice(data).ok()?;
    let object = value.as_object()?;

    if let Some(declared) = object.get("mediaType").and_then(|v| v.as_str()) {
        return [OCI_INDEX, OCI_MANIFEST, DOCKER_MANIFEST_LIST, DOCKER_MANIFEST]
            .into_iter()
            .find(|known| *known == declared);
    }
    if object.contains_key("manifests") {
        Some(OCI_INDEX)
    } else if object.contains_key("config") && object.contains_key("layers") {
        Some(OCI_MANIFEST)
    } else {
        None
    }
}
