//! LXD REST API client.
//!
//! Speaks the `/1.0` API over HTTPS. Synchronous calls return their payload
//! in the response `metadata`; image import and image deletion are
//! background operations that are awaited through `/1.0/operations/<id>/wait`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lxbake_core::config::RemoteConfig;
use lxbake_core::error::{BakeError, Result};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Method, Response, Url};
use serde::Deserialize;
use serde_json::Value;
use tokio_util::io::ReaderStream;

use super::{
    AliasEntry, ArtifactStream, ImageRecord, ImageServer, ImageUpload, OperationRecord,
    ProgressHandler, RemoteOperation, TransferProgress,
};

/// Standard LXD response envelope.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    operation: String,
    #[serde(default)]
    error: String,
    #[serde(default)]
    error_code: u16,
    #[serde(default)]
    metadata: Value,
}

/// Client for one LXD remote.
#[derive(Clone)]
pub struct LxdServer {
    name: String,
    base_url: Url,
    project: Option<String>,
    client: Client,
}

impl LxdServer {
    /// Build a client from remote connection settings.
    pub fn new(name: &str, config: &RemoteConfig) -> Result<Self> {
        let base_url = Url::parse(&config.address).map_err(|e| {
            BakeError::ConfigError(format!("Invalid address for remote {}: {}", name, e))
        })?;

        let mut builder = Client::builder().danger_accept_invalid_certs(config.accept_invalid_certs);

        if let Some(ref server_cert) = config.server_cert {
            let pem = std::fs::read(server_cert)?;
            let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                BakeError::ConfigError(format!(
                    "Invalid server certificate {}: {}",
                    server_cert.display(),
                    e
                ))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        match (&config.client_cert, &config.client_key) {
            (Some(cert_path), Some(key_path)) => {
                let cert = std::fs::read(cert_path)?;
                let key = std::fs::read(key_path)?;
                let identity = reqwest::Identity::from_pkcs8_pem(&cert, &key).map_err(|e| {
                    BakeError::ConfigError(format!("Invalid client identity for {}: {}", name, e))
                })?;
                builder = builder.identity(identity);
            }
            (None, None) => {}
            _ => {
                return Err(BakeError::ConfigError(format!(
                    "Remote {} needs both client_cert and client_key",
                    name
                )))
            }
        }

        let client = builder
            .build()
            .map_err(|e| BakeError::ConfigError(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            name: name.to_string(),
            base_url,
            project: config.project.clone(),
            client,
        })
    }

    /// Build an endpoint URL from path segments (each segment is percent-encoded).
    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                BakeError::ConfigError(format!("Remote {} address cannot be a base URL", self.name))
            })?;
            path.pop_if_empty();
            path.extend(segments);
        }
        if let Some(ref project) = self.project {
            url.query_pairs_mut().append_pair("project", project);
        }
        Ok(url)
    }

    /// Send a request and unwrap the LXD envelope.
    async fn call(&self, method: Method, url: Url, body: Option<Value>, what: &str) -> Result<Envelope> {
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        self.unwrap_envelope(response, what).await
    }

    async fn unwrap_envelope(&self, response: Response, what: &str) -> Result<Envelope> {
        let status = response.status();
        let text = response.text().await.map_err(|e| self.transport_error(e))?;
        let envelope: Option<Envelope> = serde_json::from_str(&text).ok();

        let error_code = envelope.as_ref().map(|e| e.error_code).unwrap_or(0);
        if status == reqwest::StatusCode::NOT_FOUND || error_code == 404 {
            return Err(BakeError::NotFound(what.to_string()));
        }

        match envelope {
            Some(envelope) if status.is_success() && envelope.kind != "error" => Ok(envelope),
            Some(envelope) => Err(BakeError::ServerError {
                remote: self.name.clone(),
                status: if envelope.error_code != 0 {
                    envelope.error_code
                } else {
                    status.as_u16()
                },
                message: envelope.error,
            }),
            None => Err(BakeError::ServerError {
                remote: self.name.clone(),
                status: status.as_u16(),
                message: format!("Unexpected response for {}: {}", what, text),
            }),
        }
    }

    fn transport_error(&self, err: reqwest::Error) -> BakeError {
        BakeError::ServerError {
            remote: self.name.clone(),
            status: err.status().map(|s| s.as_u16()).unwrap_or(0),
            message: err.to_string(),
        }
    }

    /// Turn an async envelope into an operation handle.
    fn operation_from(&self, envelope: Envelope) -> Result<Box<dyn RemoteOperation>> {
        let id = self
            .operation_id(&envelope.operation)
            .or_else(|| {
                envelope
                    .metadata
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .ok_or_else(|| {
                BakeError::ContractViolation(format!(
                    "remote {} returned a {} response without an operation",
                    self.name, envelope.kind
                ))
            })?;

        Ok(Box::new(LxdOperation {
            server: self.clone(),
            id,
        }))
    }

    /// Last path segment of an operation URL; the query (e.g. `?project=`) is dropped.
    fn operation_id(&self, operation: &str) -> Option<String> {
        if operation.is_empty() {
            return None;
        }
        let url = Url::options()
            .base_url(Some(&self.base_url))
            .parse(operation)
            .ok()?;
        url.path_segments()?
            .filter(|segment| !segment.is_empty())
            .last()
            .map(str::to_string)
    }

    fn metadata<T: serde::de::DeserializeOwned>(envelope: Envelope) -> Result<T> {
        Ok(serde_json::from_value(envelope.metadata)?)
    }
}

/// Wrap an artifact in a streamed multipart part that reports progress.
fn artifact_part(
    artifact: ArtifactStream,
    sent: Arc<AtomicU64>,
    total: u64,
    progress: Option<ProgressHandler>,
) -> Part {
    let stream = ReaderStream::new(artifact.file).inspect(move |chunk| {
        if let Ok(bytes) = chunk {
            let now = sent.fetch_add(bytes.len() as u64, Ordering::Relaxed) + bytes.len() as u64;
            if let Some(ref progress) = progress {
                progress(TransferProgress { sent: now, total });
            }
        }
    });

    Part::stream_with_length(Body::wrap_stream(stream), artifact.size).file_name(artifact.name)
}

#[async_trait]
impl ImageServer for LxdServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_image(&self, upload: ImageUpload) -> Result<Box<dyn RemoteOperation>> {
        let total = upload.total_size();
        let sent = Arc::new(AtomicU64::new(0));

        tracing::info!(
            remote = %self.name,
            filename = %upload.filename,
            bytes = total,
            "Uploading split image"
        );

        let form = Form::new()
            .part(
                "metadata",
                artifact_part(upload.meta, sent.clone(), total, upload.progress.clone()),
            )
            .part(
                "rootfs",
                artifact_part(upload.rootfs, sent, total, upload.progress),
            );

        let url = self.endpoint(&["1.0", "images"])?;
        let response = self
            .client
            .post(url)
            .header("X-LXD-filename", upload.filename)
            .header("X-LXD-public", if upload.public { "1" } else { "0" })
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let envelope = self.unwrap_envelope(response, "image upload").await?;
        self.operation_from(envelope)
    }

    async fn get_image(&self, fingerprint: &str) -> Result<ImageRecord> {
        let url = self.endpoint(&["1.0", "images", fingerprint])?;
        let envelope = self
            .call(Method::GET, url, None, &format!("image {fingerprint}"))
            .await?;
        Self::metadata(envelope)
    }

    async fn delete_image(&self, fingerprint: &str) -> Result<Box<dyn RemoteOperation>> {
        let url = self.endpoint(&["1.0", "images", fingerprint])?;
        let envelope = self
            .call(Method::DELETE, url, None, &format!("image {fingerprint}"))
            .await?;
        self.operation_from(envelope)
    }

    async fn list_image_aliases(&self) -> Result<Vec<AliasEntry>> {
        let mut url = self.endpoint(&["1.0", "images", "aliases"])?;
        url.query_pairs_mut().append_pair("recursion", "1");
        let envelope = self.call(Method::GET, url, None, "image aliases").await?;
        Self::metadata(envelope)
    }

    async fn get_image_alias(&self, name: &str) -> Result<Option<AliasEntry>> {
        let url = self.endpoint(&["1.0", "images", "aliases", name])?;
        match self
            .call(Method::GET, url, None, &format!("image alias {name}"))
            .await
        {
            Ok(envelope) => Ok(Some(Self::metadata(envelope)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_image_alias(&self, name: &str, target: &str) -> Result<()> {
        let url = self.endpoint(&["1.0", "images", "aliases"])?;
        let body = serde_json::json!({
            "name": name,
            "description": "",
            "target": target,
        });
        self.call(Method::POST, url, Some(body), &format!("image {target}"))
            .await?;
        Ok(())
    }

    async fn delete_image_alias(&self, name: &str) -> Result<()> {
        let url = self.endpoint(&["1.0", "images", "aliases", name])?;
        self.call(Method::DELETE, url, None, &format!("image alias {name}"))
            .await?;
        Ok(())
    }
}

/// Background operation on an LXD remote.
pub struct LxdOperation {
    server: LxdServer,
    id: String,
}

#[async_trait]
impl RemoteOperation for LxdOperation {
    fn id(&self) -> &str {
        &self.id
    }

    async fn wait(&self) -> Result<OperationRecord> {
        let mut url = self.server.endpoint(&["1.0", "operations", &self.id, "wait"])?;
        url.query_pairs_mut().append_pair("timeout", "-1");
        let envelope = self
            .server
            .call(Method::GET, url, None, &format!("operation {}", self.id))
            .await?;
        LxdServer::metadata(envelope)
    }

    async fn cancel(&self) -> Result<()> {
        let url = self.server.endpoint(&["1.0", "operations", &self.id])?;
        self.server
            .call(Method::DELETE, url, None, &format!("operation {}", self.id))
            .await?;
        tracing::info!(remote = %self.server.name, operation = %self.id, "Cancellation requested");
        Ok(())
    }
}
