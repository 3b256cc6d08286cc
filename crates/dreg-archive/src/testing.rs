//! In-memory image export archives for tests.
//!
//! # Usage
//!
//! ```ignore
//! use dreg_archive::testing::ExportBuilder;
//!
//! let mut builder = ExportBuilder::new();
//! let manifest = builder.image(&[b"layer"]);
//! let tarball: Vec<u8> = builder.build();
//! ```

use dreg_cas::Digest;
use serde_json::json;

use crate::oci::{
    Descriptor, ImageIndex, ImageManifest, BLOBS_PREFIX, INDEX_PATH, OCI_CONFIG,
    OCI_LAYER_TAR_GZIP, OCI_MANIFEST,
};

enum Entry {
    File { path: String, data: Vec<u8> },
    Dir { path: String },
}

/// Builds a tarball shaped like `docker save` output in OCI layout.
///
/// Entries are written in the order they were added. When [`image`] was
/// called and no index was given explicitly, `build` appends `index.json`,
/// `manifest.json` and `oci-layout` the way the engine does.
///
/// [`image`]: ExportBuilder::image
#[derive(Default)]
pub struct ExportBuilder {
    entries: Vec<Entry>,
    manifests: Vec<Descriptor>,
    docker_manifest: Vec<serde_json::Value>,
    explicit_index: bool,
    dot_prefix: bool,
}

impl ExportBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write every path as `./<path>`, as some exporters do.
    pub fn with_dot_prefix(mut self) -> Self {
        self.dot_prefix = true;
        self
    }

    /// Add a raw file entry.
    pub fn file(&mut self, path: &str, data: &[u8]) -> &mut Self {
        self.entries.push(Entry::File {
            path: path.to_string(),
            data: data.to_vec(),
        });
        self
    }

    /// Add a directory entry.
    pub fn dir(&mut self, path: &str) -> &mut Self {
        self.entries.push(Entry::Dir {
            path: path.to_string(),
        });
        self
    }

    /// Add `data` under `blobs/sha256/<hex>` and return its digest.
    pub fn blob(&mut self, data: &[u8]) -> Digest {
        let digest = Digest::of(data);
        self.file(&format!("{BLOBS_PREFIX}{}", digest.to_hex()), data);
        digest
    }

    /// Add an explicit `index.json`.
    pub fn index_bytes(&mut self, data: &[u8]) -> &mut Self {
        self.explicit_index = true;
        self.file(INDEX_PATH, data)
    }

    /// Add a single-platform image: a config blob, one blob per layer and a
    /// manifest blob. Returns the manifest's descriptor.
    pub fn image<L: AsRef<[u8]>>(&mut self, layers: &[L]) -> Descriptor {
        let layer_descriptors: Vec<Descriptor> = layers
            .iter()
            .map(|layer| {
                self.blob(layer.as_ref());
                Descriptor::new(OCI_LAYER_TAR_GZIP, layer.as_ref())
            })
            .collect();

        let config = serde_json::to_vec(&json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {
                "type": "layers",
                "diff_ids": layer_descriptors.iter().map(|d| d.digest.to_string()).collect::<Vec<_>>(),
            },
        }))
        .unwrap_or_default();
        self.blob(&config);

        let manifest = ImageManifest {
            schema_version: 2,
            media_type: Some(OCI_MANIFEST.to_string()),
            config: Descriptor::new(OCI_CONFIG, &config),
            layers: layer_descriptors,
        };
        let manifest_bytes = serde_json::to_vec(&manifest).unwrap_or_default();
        self.blob(&manifest_bytes);

        self.docker_manifest.push(json!({
            "Config": format!("{BLOBS_PREFIX}{}", manifest.config.digest.to_hex()),
            "RepoTags": [],
            "Layers": manifest
                .layers
                .iter()
                .map(|l| format!("{BLOBS_PREFIX}{}", l.digest.to_hex()))
                .collect::<Vec<_>>(),
        }));

        let descriptor = Descriptor::new(OCI_MANIFEST, &manifest_bytes);
        self.manifests.push(descriptor.clone());
        descriptor
    }

    /// The `index.json` that `build` will append for the images added so far.
    pub fn index_document(&self) -> Vec<u8> {
        serde_json::to_vec(&ImageIndex::new(self.manifests.clone())).unwrap_or_default()
    }

    /// Finish the archive.
    pub fn build(&self) -> Vec<u8> {
        let mut tar = tar::Builder::new(Vec::new());

        let mut trailer = Vec::new();
        if !self.manifests.is_empty() && !self.explicit_index {
            trailer.push(Entry::File {
                path: INDEX_PATH.to_string(),
                data: self.index_document(),
            });
            trailer.push(Entry::File {
                path: "manifest.json".to_string(),
                data: serde_json::to_vec(&self.docker_manifest).unwrap_or_default(),
            });
            trailer.push(Entry::File {
                path: "oci-layout".to_string(),
                data: br#"{"imageLayoutVersion":"1.0.0"}"#.to_vec(),
            });
        }

        for entry in self.entries.iter().chain(trailer.iter()) {
            let (path, data, entry_type, mode) = match entry {
                Entry::File { path, data } => (path, data.as_slice(), tar::EntryType::Regular, 0o644),
                Entry::Dir { path } => (path, &[][..], tar::EntryType::Directory, 0o755),
            };
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(entry_type);
            header.set_size(data.len() as u64);
            header.set_mode(mode);
            header.set_mtime(0);

            let appended = if self.dot_prefix {
                // The builder normalises `./` away, so write the name field directly.
                let name = format!("./{path}");
                let field = &mut header.as_old_mut().name;
                field[..name.len()].copy_from_slice(name.as_bytes());
                header.set_cksum();
                tar.append(&header, data)
            } else {
                tar.append_data(&mut header, path, data)
            };
            appended.unwrap_or_else(|e| panic!("appending {path} to in-memory tar: {e}"));
        }

        tar.into_inner()
            .unwrap_or_else(|e| panic!("finishing in-memory tar: {e}"))
    }
}
