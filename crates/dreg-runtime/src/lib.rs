//! # dreg-runtime
//!
//! The container runtime as seen by the registry: something that can list
//! images by name, pull an image, and export an image as a tar stream.
//!
//! [`ImageRuntime`] is the seam the registry is written against;
//! [`DockerClient`] implements it over the Docker Engine API.

pub mod docker;

pub use docker::DockerClient;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Deserializer};
use thiserror::Error;
use tokio::sync::mpsc;

/// Chunks of an export archive, in order. The stream ends when the sender
/// is dropped; an `Err` item means the export broke off.
pub type ExportStream = mpsc::Receiver<io::Result<Bytes>>;

/// Chunks buffered between the runtime connection and the scanner.
pub const EXPORT_CHANNEL_CAPACITY: usize = 16;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("cannot connect to runtime at {socket}: {source}")]
    Connect {
        socket: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("invalid request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("{operation} returned {status}: {message}")]
    Status {
        operation: &'static str,
        status: u16,
        message: String,
    },

    #[error("invalid response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("pull of {reference} failed: {message}")]
    Pull { reference: String, message: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// One image known to the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageSummary {
    #[serde(rename = "Id")]
    pub id: String,
    /// `name:tag` strings; the engine sends `null` for untagged images.
    #[serde(rename = "RepoTags", default, deserialize_with = "null_as_empty")]
    pub repo_tags: Vec<String>,
}

impl ImageSummary {
    pub fn new(id: impl Into<String>, repo_tags: &[&str]) -> Self {
        Self {
            id: id.into(),
            repo_tags: repo_tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Tags this image carries under `repository`.
    ///
    /// The engine lists every tag of a matching image, including tags of
    /// other repositories; only those naming `repository` are returned.
    pub fn tags_in<'a>(&'a self, repository: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.repo_tags.iter().filter_map(move |repo_tag| {
            let (repo, tag) = split_repo_tag(repo_tag)?;
            (familiar_name(repo) == familiar_name(repository)).then_some(tag)
        })
    }

    pub fn has_tag(&self, repository: &str, tag: &str) -> bool {
        self.tags_in(repository).any(|t| t == tag)
    }
}

/// The tag part of a `name:tag` string.
///
/// The tag follows the last `:` unless that colon belongs to a registry
/// port (`localhost:5000/app` has no tag).
pub fn tag_of(repo_tag: &str) -> Option<&str> {
    let (_, tag) = repo_tag.rsplit_once(':')?;
    (!tag.is_empty() && !tag.contains('/')).then_some(tag)
}

/// Split `name:tag` into its repository and tag.
pub fn split_repo_tag(repo_tag: &str) -> Option<(&str, &str)> {
    let tag = tag_of(repo_tag)?;
    Some((&repo_tag[..repo_tag.len() - tag.len() - 1], tag))
}

/// Docker Hub names as the engine prints them: `docker.io/library/nginx`
/// and `library/nginx` are both `nginx`.
pub fn familiar_name(repository: &str) -> &str {
    let name = ["docker.io/", "index.docker.io/"]
        .iter()
        .find_map(|prefix| repository.strip_prefix(*prefix))
        .unwrap_or(repository);
    match name.strip_prefix("library/") {
        Some(short) if !short.contains('/') => short,
        _ => name,
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Operations the registry needs from a container runtime.
#[async_trait]
pub trait ImageRuntime: Send + Sync {
    /// Images whose reference matches `name` (a repository without tag).
    async fn list_images(&self, name: &str) -> Result<Vec<ImageSummary>>;

    /// Pull `name` at `reference`, a tag or a `sha256:` digest. Returns once
    /// the pull has finished.
    async fn pull_image(&self, name: &str, reference: &str) -> Result<()>;

    /// Start exporting image `id` as a tar archive.
    async fn export_image(&self, id: &str) -> Result<ExportStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tag_of() {
        assert_eq!(tag_of("nginx:latest"), Some("latest"));
        assert_eq!(tag_of("library/nginx:1.25-alpine"), Some("1.25-alpine"));
        assert_eq!(tag_of("localhost:5000/app:v1"), Some("v1"));
        assert_eq!(tag_of("localhost:5000/app"), None);
        assert_eq!(tag_of("nginx"), None);
        assert_eq!(tag_of("nginx:"), None);
    }

    #[test]
    fn test_summary_from_engine_json() {
        let raw = r#"[
            {"Id": "sha256:aaa", "RepoTags": ["alpine:3.19", "alpine:latest"], "Size": 7},
            {"Id": "sha256:bbb", "RepoTags": null}
        ]"#;
        let images: Vec<ImageSummary> = serde_json::from_str(raw).unwrap();
        assert_eq!(images.len(), 2);
        assert!(images[0].has_tag("alpine", "3.19"));
        assert!(images[0].has_tag("library/alpine", "latest"));
        assert!(!images[0].has_tag("alpine", "3.18"));
        assert!(images[1].repo_tags.is_empty());
    }

    #[test]
    fn test_tags_of_other_repositories_are_ignored() {
        let image = ImageSummary::new(
            "sha256:aaa",
            &["library/app:1", "other/tool:2", "localhost:5000/app:3"],
        );
        assert_eq!(image.tags_in("library/app").collect::<Vec<_>>(), vec!["1"]);
        assert!(image.has_tag("app", "1"));
        assert!(!image.has_tag("library/app", "2"));
        assert!(!image.has_tag("library/app", "3"));
        assert!(image.has_tag("other/tool", "2"));
        assert!(image.has_tag("localhost:5000/app", "3"));
    }

    #[test]
    fn test_split_repo_tag_and_familiar_name() {
        assert_eq!(split_repo_tag("library/nginx:1.25"), Some(("library/nginx", "1.25")));
        assert_eq!(split_repo_tag("localhost:5000/app:v1"), Some(("localhost:5000/app", "v1")));
        assert_eq!(split_repo_tag("localhost:5000/app"), None);

        assert_eq!(familiar_name("docker.io/library/nginx"), "nginx");
        assert_eq!(familiar_name("library/nginx"), "nginx");
        assert_eq!(familiar_name("docker.io/acme/app"), "acme/app");
        assert_eq!(familiar_name("ghcr.io/library/app"), "ghcr.io/library/app");
    }

    #[test]
    fn test_summary_missing_tags_field() {
        let image: ImageSummary = serde_json::from_str(r#"{"Id": "sha256:ccc"}"#).unwrap();
        assert_eq!(image, ImageSummary::new("sha256:ccc", &[]));
    }
}
