//! Request path parsing.
//!
//! Image names may span several path segments, so routing is done by
//! splitting on the last `/blobs/` or `/manifests/` rather than by a fixed
//! route pattern.

use std::fmt;

use dreg_cas::Digest;

use crate::error::{RegistryError, Result};

/// Longest tag the registry protocol allows.
const MAX_TAG_LEN: usize = 128;

/// Which of the two read endpoints a path addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Blobs,
    Manifests,
}

/// Split `/v2/<name>/<endpoint>/<reference>` into its parts.
///
/// Returns `None` for paths that are not blob or manifest paths.
pub fn split_path(path: &str) -> Option<(&str, Endpoint, &str)> {
    let rest = path.strip_prefix("/v2/")?;
    let (head, reference) = rest.rsplit_once('/')?;
    if reference.is_empty() {
        return None;
    }
    let (name, endpoint) = if let Some(name) = head.strip_suffix("/blobs") {
        (name, Endpoint::Blobs)
    } else if let Some(name) = head.strip_suffix("/manifests") {
        (name, Endpoint::Manifests)
    } else {
        return None;
    };
    (!name.is_empty()).then_some((name, endpoint, reference))
}

/// A tag or a content digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reference {
    Tag(String),
    Digest(Digest),
}

impl Reference {
    pub fn parse(reference: &str) -> Result<Self> {
        if reference.starts_with("sha256:") {
            return Digest::parse(reference)
                .map(Reference::Digest)
                .ok_or_else(|| RegistryError::InvalidReference(reference.to_string()));
        }
        if is_valid_tag(reference) {
            Ok(Reference::Tag(reference.to_string()))
        } else {
            Err(RegistryError::InvalidReference(reference.to_string()))
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Tag(tag) => f.write_str(tag),
            Reference::Digest(digest) => write!(f, "{digest}"),
        }
    }
}

/// `[A-Za-z0-9_][A-Za-z0-9_.-]{0,127}`
fn is_valid_tag(tag: &str) -> bool {
    let mut chars = tag.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    tag.len() <= MAX_TAG_LEN
        && (first.is_ascii_alphanumeric() || first == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

/// Lowercase alphanumerics separated by `.`, `_` or `-`, never just dots.
fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment != "."
        && segment != ".."
        && segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

/// Registry host, optionally with a port.
fn is_valid_domain(domain: &str) -> bool {
    !domain.is_empty()
        && !domain.starts_with('.')
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':'))
}

/// `(domain, namespace, image, reference)` for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub domain: String,
    /// Every name segment but the last, joined by `/`; may be empty.
    pub namespace: String,
    pub image: String,
    pub reference: Reference,
}

impl ImageReference {
    /// Build a reference from the path name, the path reference and the
    /// `ns` query parameter.
    pub fn parse(name: &str, reference: &str, ns: Option<&str>) -> Result<Self> {
        let domain = ns
            .filter(|d| !d.is_empty())
            .ok_or(RegistryError::MissingNamespace)?;
        if !is_valid_domain(domain) {
            return Err(RegistryError::InvalidName(domain.to_string()));
        }
        if !name.split('/').all(is_valid_segment) {
            return Err(RegistryError::InvalidName(name.to_string()));
        }
        let (namespace, image) = match name.rsplit_once('/') {
            Some((namespace, image)) => (namespace, image),
            None => ("", name),
        };

        Ok(Self {
            domain: domain.to_string(),
            namespace: namespace.to_string(),
            image: image.to_string(),
            reference: Reference::parse(reference)?,
        })
    }

    /// `namespace/image` as it appeared in the request path.
    pub fn name(&self) -> String {
        if self.namespace.is_empty() {
            self.image.clone()
        } else {
            format!("{}/{}", self.namespace, self.image)
        }
    }

    /// The name the runtime knows the image by: `domain/namespace/image`
    /// with the default registry's prefix removed.
    pub fn repository(&self, default_registry: &str) -> String {
        let full = format!("{}/{}", self.domain, self.name());
        match full.strip_prefix(default_registry) {
            Some(rest) if !default_registry.is_empty() && rest.starts_with('/') => {
                rest[1..].to_string()
            }
            _ => full,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_path() {
        assert_eq!(
            split_path("/v2/library/nginx/manifests/latest"),
            Some(("library/nginx", Endpoint::Manifests, "latest"))
        );
        assert_eq!(
            split_path("/v2/a/b/c/blobs/sha256:abc"),
            Some(("a/b/c", Endpoint::Blobs, "sha256:abc"))
        );
        // A repository may itself be called "blobs".
        assert_eq!(
            split_path("/v2/acme/blobs/manifests/v1"),
            Some(("acme/blobs", Endpoint::Manifests, "v1"))
        );
        assert_eq!(split_path("/v2/"), None);
        assert_eq!(split_path("/v2/blobs/sha256:abc"), None);
        assert_eq!(split_path("/v2/nginx/tags/list"), None);
        assert_eq!(split_path("/v2/nginx/manifests/"), None);
        assert_eq!(split_path("/v1/nginx/manifests/latest"), None);
    }

    #[test]
    fn test_parse_tag_reference() {
        let r = ImageReference::parse("library/nginx", "1.25-alpine", Some("docker.io")).unwrap();
        assert_eq!(r.domain, "docker.io");
        assert_eq!(r.namespace, "library");
        assert_eq!(r.image, "nginx");
        assert_eq!(r.reference, Reference::Tag("1.25-alpine".into()));
    }

    #[test]
    fn test_parse_multi_segment_name() {
        let r = ImageReference::parse("org/team/app", "v1", Some("ghcr.io")).unwrap();
        assert_eq!(r.namespace, "org/team");
        assert_eq!(r.image, "app");
        assert_eq!(r.name(), "org/team/app");
    }

    #[test]
    fn test_parse_digest_reference() {
        let digest = Digest::of(b"hello");
        let r = ImageReference::parse("library/app", &digest.to_string(), Some("docker.io")).unwrap();
        assert_eq!(r.reference, Reference::Digest(digest));
    }

    #[test]
    fn test_missing_namespace() {
        for ns in [None, Some("")] {
            assert!(matches!(
                ImageReference::parse("library/app", "latest", ns),
                Err(RegistryError::MissingNamespace)
            ));
        }
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(matches!(
            ImageReference::parse("library/app", "sha256:nothex", Some("docker.io")),
            Err(RegistryError::InvalidReference(_))
        ));
        assert!(matches!(
            ImageReference::parse("library/app", "-leading-dash", Some("docker.io")),
            Err(RegistryError::InvalidReference(_))
        ));
        assert!(matches!(
            ImageReference::parse("library/app", &"t".repeat(129), Some("docker.io")),
            Err(RegistryError::InvalidReference(_))
        ));
        assert!(matches!(
            ImageReference::parse("../etc", "latest", Some("docker.io")),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(matches!(
            ImageReference::parse("Library/App", "latest", Some("docker.io")),
            Err(RegistryError::InvalidName(_))
        ));
        assert!(matches!(
            ImageReference::parse("library/app", "latest", Some("evil/../host")),
            Err(RegistryError::InvalidName(_))
        ));
    }

    #[test]
    fn test_tag_syntax() {
        assert!(is_valid_tag("latest"));
        assert!(is_valid_tag("_internal"));
        assert!(is_valid_tag(&"a".repeat(128)));
        assert!(!is_valid_tag(""));
        assert!(!is_valid_tag(".hidden"));
        assert!(!is_valid_tag("has:colon"));
    }

    #[test]
    fn test_repository_strips_default_registry() {
        let hub = ImageReference::parse("library/nginx", "latest", Some("docker.io")).unwrap();
        assert_eq!(hub.repository("docker.io"), "library/nginx");
        assert_eq!(hub.repository("registry.local"), "docker.io/library/nginx");

        let ghcr = ImageReference::parse("acme/app", "v1", Some("ghcr.io")).unwrap();
        assert_eq!(ghcr.repository("docker.io"), "ghcr.io/acme/app");

        let lookalike = ImageReference::parse("x", "v1", Some("docker.iox")).unwrap();
        assert_eq!(lookalike.repository("docker.io"), "docker.iox/x");

        let local = ImageReference::parse("app", "v1", Some("localhost:5000")).unwrap();
        assert_eq!(local.repository("docker.io"), "localhost:5000/app");
    }
}
