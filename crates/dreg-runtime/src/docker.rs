//! Docker Engine API client over a Unix socket.
//!
//! One HTTP/1 connection per call; the engine is local so there is nothing
//! to gain from pooling, and an export holds its connection for as long as
//! the scan takes.

use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dreg_config::{log_runtime_info, log_runtime_warn, RuntimeConfig};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::{header, Method, Request, Response};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, instrument};

use crate::{
    ExportStream, ImageRuntime, ImageSummary, Result, RuntimeError, EXPORT_CHANNEL_CAPACITY,
};

/// Docker Engine client.
#[derive(Debug, Clone)]
pub struct DockerClient {
    socket: PathBuf,
    api_version: String,
    timeout: Duration,
    pull_timeout: Duration,
}

impl DockerClient {
    /// Client for the engine at `socket` with default API version and timeouts.
    pub fn new(socket: impl AsRef<Path>) -> Self {
        let mut config = RuntimeConfig::default();
        config.socket = socket.as_ref().to_path_buf();
        Self::from_config(&config)
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            socket: config.socket.clone(),
            api_version: config.api_version.trim_matches('/').to_string(),
            timeout: config.timeout(),
            pull_timeout: config.pull_timeout(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket
    }

    /// Issue one request and return the response once its status is known
    /// to be a success.
    async fn send(
        &self,
        operation: &'static str,
        method: Method,
        path_and_query: &str,
    ) -> Result<Response<Incoming>> {
        let stream = UnixStream::connect(&self.socket)
            .await
            .map_err(|source| RuntimeError::Connect {
                socket: self.socket.clone(),
                source,
            })?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                debug!("runtime connection closed: {}", e);
            }
        });

        let request = Request::builder()
            .method(method)
            .uri(format!("/{}{}", self.api_version, path_and_query))
            .header(header::HOST, "docker")
            .body(Empty::<Bytes>::new())?;

        let response = sender.send_request(request).await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.into_body().collect().await?.to_bytes();
            return Err(RuntimeError::Status {
                operation,
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        Ok(response)
    }
}

/// Bound `fut` by `after`, reporting which operation ran out of time.
async fn within<T>(
    operation: &'static str,
    after: Duration,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| RuntimeError::Timeout { operation, after })?
}

/// The engine reports errors as `{"message": "..."}`.
fn error_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct EngineError {
        message: String,
    }
    match serde_json::from_slice::<EngineError>(body) {
        Ok(e) => e.message,
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    }
}

/// One line of the newline-delimited JSON progress stream of a pull.
#[derive(Debug, Default, Deserialize)]
struct PullProgress {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default, rename = "errorDetail")]
    error_detail: Option<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    message: String,
}

impl PullProgress {
    fn failure(self) -> Option<String> {
        self.error
            .or(self.error_detail.map(|d| d.message))
            .filter(|m| !m.is_empty())
    }
}

/// Check one progress line; `Err` carries the engine's failure message.
fn check_progress_line(line: &[u8]) -> std::result::Result<(), String> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(());
    }
    match serde_json::from_slice::<PullProgress>(line) {
        Ok(progress) => {
            if let Some(status) = progress.status.as_deref() {
                debug!(id = progress.id.as_deref().unwrap_or(""), "{}", status);
            }
            match progress.failure() {
                Some(message) => Err(message),
                None => Ok(()),
            }
        }
        Err(e) => {
            log_runtime_warn!("Unparseable pull progress", error = e.to_string());
            Ok(())
        }
    }
}

#[async_trait]
impl ImageRuntime for DockerClient {
    #[instrument(skip(self), level = "debug")]
    async fn list_images(&self, name: &str) -> Result<Vec<ImageSummary>> {
        let filters = serde_json::json!({ "reference": [name] }).to_string();
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("filters", &filters)
            .finish();

        within("list images", self.timeout, async {
            let response = self
                .send("list images", Method::GET, &format!("/images/json?{query}"))
                .await?;
            let body = response.into_body().collect().await?.to_bytes();
            Ok(serde_json::from_slice(&body)?)
        })
        .await
    }

    #[instrument(skip(self))]
    async fn pull_image(&self, name: &str, reference: &str) -> Result<()> {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("fromImage", name)
            .append_pair("tag", reference)
            .finish();
        log_runtime_info!("Pulling image", name = name, reference = reference);

        within("pull image", self.pull_timeout, async {
            let response = self
                .send("pull image", Method::POST, &format!("/images/create?{query}"))
                .await?;

            let fail = |message: String| RuntimeError::Pull {
                reference: format!("{name}:{reference}"),
                message,
            };
            let mut body = response.into_body();
            let mut pending: Vec<u8> = Vec::new();
            while let Some(frame) = body.frame().await {
                let Ok(data) = frame?.into_data() else {
                    continue;
                };
                pending.extend_from_slice(&data);
                while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = pending.drain(..=newline).collect();
                    check_progress_line(&line).map_err(fail)?;
                }
            }
            check_progress_line(&pending).map_err(fail)?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), level = "debug")]
    async fn export_image(&self, id: &str) -> Result<ExportStream> {
        let response = within(
            "export image",
            self.timeout,
            self.send("export image", Method::GET, &format!("/images/{id}/get")),
        )
        .await?;

        let (tx, rx) = mpsc::channel(EXPORT_CHANNEL_CAPACITY);
        let mut body = response.into_body();
        tokio::spawn(async move {
            while let Some(frame) = body.frame().await {
                let item = match frame {
                    Ok(frame) => match frame.into_data() {
                        Ok(data) => Ok(data),
                        Err(_) => continue,
                    },
                    Err(e) => Err(io::Error::other(e)),
                };
                let broken = item.is_err();
                // A dropped receiver means the scan stopped; nothing left to do.
                if tx.send(item).await.is_err() || broken {
                    break;
                }
            }
        });
        Ok(rx)
    }
}
