//! HTTP handlers for the read side of the registry protocol.

use std::path::Path;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use dreg_archive::oci::{is_index_type, is_manifest_type, sniff_media_type, ImageIndex, OCI_INDEX, OCTET_STREAM};
use dreg_cas::{CasError, Digest};
use dreg_config::{log_server_debug, TagResolution};

use crate::error::{RegistryError, Result};
use crate::reference::{split_path, Endpoint, ImageReference, Reference};
use crate::AppState;

pub const DOCKER_CONTENT_DIGEST: &str = "docker-content-digest";
pub const API_VERSION_HEADER: &str = "docker-distribution-api-version";

/// Manifests up to this size are read to determine their media type.
const SNIFF_LIMIT: u64 = 4 * 1024 * 1024;

#[derive(Debug, Default, Deserialize)]
pub struct RegistryQuery {
    /// Upstream registry the request is really for, e.g. `docker.io`.
    pub ns: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(hello))
        .route("/v2", get(version_check))
        .route("/v2/", get(version_check))
        .fallback(dispatch)
}

async fn hello() -> &'static str {
    "Hello, world!\n"
}

/// Liveness probe; registry clients call this before anything else.
async fn version_check() -> impl IntoResponse {
    (StatusCode::OK, [(API_VERSION_HEADER, "registry/2.0")])
}

/// Everything under `/v2/<name>/...`. Names span segments, so the path is
/// split by hand.
async fn dispatch(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    Query(query): Query<RegistryQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let (name, endpoint, reference) = split_path(uri.path()).ok_or(RegistryError::RouteUnknown)?;
    if method != Method::GET && method != Method::HEAD {
        return Err(RegistryError::MethodNotAllowed);
    }
    let head = method == Method::HEAD;

    let image = ImageReference::parse(name, reference, query.ns.as_deref())?;
    let repository = image.repository(&state.registry.default_registry);
    log_server_debug!(
        "Resolving",
        repository = repository.as_str(),
        reference = reference
    );

    match (endpoint, &image.reference) {
        (Endpoint::Blobs, Reference::Tag(tag)) => Err(RegistryError::InvalidReference(tag.clone())),
        (Endpoint::Blobs, Reference::Digest(digest)) => {
            let path = state.resolver.blob(&repository, digest).await?;
            let content_type = accepted_type(&headers).unwrap_or_else(|| OCTET_STREAM.to_string());
            file_response(&path, digest, &content_type, head).await
        }
        (Endpoint::Manifests, Reference::Digest(digest)) => {
            let path = state.resolver.blob(&repository, digest).await.map_err(|e| match e {
                RegistryError::BlobUnknown(d) => RegistryError::ManifestUnknown(d.to_string()),
                other => other,
            })?;
            let content_type = match sniff_file(&path).await {
                Some(sniffed) => sniffed.to_string(),
                None => accepted_type(&headers).unwrap_or_else(|| OCTET_STREAM.to_string()),
            };
            file_response(&path, digest, &content_type, head).await
        }
        (Endpoint::Manifests, Reference::Tag(tag)) => {
            let index = state.resolver.index(&repository, tag).await?;
            match state.registry.tag_resolution {
                TagResolution::Index => Ok(bytes_response(index, OCI_INDEX, head)),
                TagResolution::Redirect => redirect_to_manifest(&image, &index),
            }
        }
    }
}

/// First concrete media type the client offered.
fn accepted_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::ACCEPT)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|offer| offer.split(';').next().unwrap_or("").trim())
        .find(|offer| !offer.is_empty() && *offer != "*/*")
        .map(str::to_string)
}

async fn sniff_file(path: &Path) -> Option<&'static str> {
    let len = tokio::fs::metadata(path).await.ok()?.len();
    if len > SNIFF_LIMIT {
        return None;
    }
    let data = tokio::fs::read(path).await.ok()?;
    sniff_media_type(&data)
}

/// Stream a cached blob from disk.
async fn file_response(path: &Path, digest: &Digest, content_type: &str, head: bool) -> Result<Response> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        // Evicted between lookup and open
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RegistryError::BlobUnknown(*digest))
        }
        Err(e) => return Err(CasError::from(e).into()),
    };
    let len = file.metadata().await.map_err(CasError::from)?.len();
    let body = if head {
        Body::empty()
    } else {
        Body::from_stream(ReaderStream::new(file))
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, len)
        .header(DOCKER_CONTENT_DIGEST, digest.to_string())
        .body(body)
        .map_err(|e| RegistryError::Internal(e.to_string()))
}

fn bytes_response(data: Vec<u8>, content_type: &'static str, head: bool) -> Response {
    let digest = Digest::of(&data);
    let headers = [
        (header::CONTENT_TYPE, content_type.to_string()),
        (header::CONTENT_LENGTH, data.len().to_string()),
        (header::HeaderName::from_static(DOCKER_CONTENT_DIGEST), digest.to_string()),
    ];
    if head {
        (headers, Body::empty()).into_response()
    } else {
        (headers, data).into_response()
    }
}

/// Send the client on to the one manifest the index lists.
fn redirect_to_manifest(image: &ImageReference, index: &[u8]) -> Result<Response> {
    let unusable = |reason: String| RegistryError::UnusableIndex {
        name: format!("{}:{}", image.name(), image.reference),
        reason,
    };
    let parsed: ImageIndex = serde_json::from_slice(index).map_err(|e| unusable(e.to_string()))?;
    let manifest = parsed
        .single_manifest()
        .ok_or_else(|| unusable(format!("lists {} manifests, expected 1", parsed.manifests.len())))?;
    // A nested index is still fetchable by digest; configs and layers are not.
    if !is_manifest_type(&manifest.media_type) && !is_index_type(&manifest.media_type) {
        return Err(unusable(format!("entry has media type {}", manifest.media_type)));
    }

    let location = format!(
        "/v2/{}/manifests/{}?ns={}",
        image.name(),
        manifest.digest,
        image.domain
    );
    Ok((StatusCode::FOUND, [(header::LOCATION, location)]).into_response())
}
