//! # Registry errors
//!
//! One error type for the whole request path, rendered in the registry
//! protocol's error shape:
//!
//! ```json
//! {"errors": [{"code": "BLOB_UNKNOWN", "message": "blob unknown: sha256:..."}]}
//! ```

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

use dreg_archive::ScanError;
use dreg_cas::{CasError, Digest};
use dreg_config::{log_server_debug, log_server_error};
use dreg_runtime::RuntimeError;

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub errors: Vec<ErrorDetail>,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: &'static str,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum RegistryError {
    /// No `ns` query parameter; this service never acts as its own registry.
    #[error("requires a 'ns' query parameter")]
    MissingNamespace,

    #[error("invalid repository name: {0:?}")]
    InvalidName(String),

    #[error("invalid reference: {0:?}")]
    InvalidReference(String),

    #[error("blob unknown: {0}")]
    BlobUnknown(Digest),

    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    #[error("not found")]
    RouteUnknown,

    #[error("method not allowed")]
    MethodNotAllowed,

    /// The runtime could not list, pull or export the image.
    #[error("runtime could not resolve {reference}: {source}")]
    Upstream {
        reference: String,
        #[source]
        source: RuntimeError,
    },

    /// More than one image carries the requested tag.
    #[error("tag {tag:?} is held by more than one image: {}", .ids.join(", "))]
    AmbiguousTag { tag: String, ids: Vec<String> },

    #[error("export of {image} is not a readable archive: {source}")]
    MalformedArchive {
        image: String,
        #[source]
        source: ScanError,
    },

    #[error("backward seek while reading export of {image}")]
    UnsupportedSeek {
        image: String,
        #[source]
        source: ScanError,
    },

    /// A tag that should exist could not be turned into an index document.
    #[error("{0} could not be materialized from the runtime")]
    Unmaterialized(String),

    #[error("index for {name} cannot be followed: {reason}")]
    UnusableIndex { name: String, reason: String },

    #[error("cache error: {0}")]
    Cache(#[from] CasError),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

impl RegistryError {
    /// HTTP status and registry error code.
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            Self::MissingNamespace => (StatusCode::BAD_REQUEST, "UNSUPPORTED"),
            Self::InvalidName(_) => (StatusCode::BAD_REQUEST, "NAME_INVALID"),
            Self::InvalidReference(r) if r.starts_with("sha256:") => {
                (StatusCode::BAD_REQUEST, "DIGEST_INVALID")
            }
            Self::InvalidReference(_) => (StatusCode::BAD_REQUEST, "TAG_INVALID"),
            Self::BlobUnknown(_) => (StatusCode::NOT_FOUND, "BLOB_UNKNOWN"),
            Self::ManifestUnknown(_) => (StatusCode::NOT_FOUND, "MANIFEST_UNKNOWN"),
            Self::RouteUnknown => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Self::MethodNotAllowed => (StatusCode::METHOD_NOT_ALLOWED, "UNSUPPORTED"),
            Self::Upstream { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "UPSTREAM_ERROR"),
            Self::AmbiguousTag { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "AMBIGUOUS_TAG"),
            Self::MalformedArchive { .. } => {
                (StatusCode::INTERNAL_SERVER_ERROR, "ARCHIVE_INVALID")
            }
            Self::Unmaterialized(_) => (StatusCode::INTERNAL_SERVER_ERROR, "MANIFEST_UNAVAILABLE"),
            Self::UnusableIndex { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "INDEX_INVALID"),
            Self::UnsupportedSeek { .. } | Self::Cache(_) | Self::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR")
            }
        }
    }

    /// Classify a failed scan of `image`.
    pub fn from_scan(image: &str, source: ScanError) -> Self {
        let image = image.to_string();
        match source {
            ScanError::MalformedArchive(_) => Self::MalformedArchive { image, source },
            ScanError::UnsupportedSeek(_) => Self::UnsupportedSeek { image, source },
            ScanError::Cache(e) => Self::Cache(e),
        }
    }

    pub fn upstream(reference: impl Into<String>, source: RuntimeError) -> Self {
        Self::Upstream {
            reference: reference.into(),
            source,
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();

        // Cache and invariant failures stay in the log.
        let message = match &self {
            Self::UnsupportedSeek { .. } | Self::Cache(_) | Self::Internal(_) => {
                "an internal error occurred".to_string()
            }
            other => other.to_string(),
        };

        if status.is_server_error() {
            log_server_error!("Request failed", code = code, error = self.to_string());
        } else {
            log_server_debug!("Request rejected", code = code, error = self.to_string());
        }

        let body = ErrorBody {
            errors: vec![ErrorDetail { code, message }],
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors() {
        assert_eq!(
            RegistryError::MissingNamespace.status_and_code().0,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            RegistryError::InvalidReference("sha256:zz".into()).status_and_code(),
            (StatusCode::BAD_REQUEST, "DIGEST_INVALID")
        );
        assert_eq!(
            RegistryError::InvalidReference("-bad".into()).status_and_code(),
            (StatusCode::BAD_REQUEST, "TAG_INVALID")
        );
    }

    #[test]
    fn test_absence_is_404() {
        let err = RegistryError::BlobUnknown(Digest::of(b"x"));
        assert_eq!(err.status_and_code(), (StatusCode::NOT_FOUND, "BLOB_UNKNOWN"));
    }

    #[test]
    fn test_materialization_failures_are_500() {
        let err = RegistryError::Unmaterialized("library/app:1".into());
        assert_eq!(err.status_and_code().0, StatusCode::INTERNAL_SERVER_ERROR);

        let err = RegistryError::AmbiguousTag {
            tag: "latest".into(),
            ids: vec!["sha256:a".into(), "sha256:b".into()],
        };
        assert_eq!(err.status_and_code().1, "AMBIGUOUS_TAG");
        assert!(err.to_string().contains("sha256:a, sha256:b"));
    }

    #[test]
    fn test_scan_errors_classified() {
        let malformed = ScanError::MalformedArchive(std::io::Error::other("bad header"));
        assert!(matches!(
            RegistryError::from_scan("img", malformed),
            RegistryError::MalformedArchive { .. }
        ));
        let cache = ScanError::Cache(CasError::InvalidName("..".into()));
        assert!(matches!(
            RegistryError::from_scan("img", cache),
            RegistryError::Cache(_)
        ));
    }
}
