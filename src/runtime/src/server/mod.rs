//! Remote image store seam.
//!
//! The lifecycle controller never talks HTTP directly: it drives an
//! [`ImageServer`], which hands back [`RemoteOperation`] handles for the
//! calls LXD runs asynchronously (image import and image deletion).
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐   connect(remote)   ┌──────────────────────┐
//! │ ServerConnector  │ ──────────────────▶ │ Arc<dyn ImageServer> │
//! └──────────────────┘                     └──────────┬───────────┘
//!                                                     │
//!                    ┌────────────────────────────────┼───────────────────┐
//!                    ▼                                ▼                   ▼
//!            create_image / delete_image       get_image         *_image_alias
//!                    │
//!                    ▼
//!        Box<dyn RemoteOperation>  ── wait() / cancel()
//! ```

mod lxd;
mod memory;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lxbake_core::config::ProviderConfig;
use lxbake_core::error::{BakeError, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use lxd::{LxdOperation, LxdServer};
pub use memory::{MemoryServer, ServerCall};

/// LXD status code of a successfully finished operation.
pub const STATUS_SUCCESS: u16 = 200;

/// LXD status code of a cancelled operation.
pub const STATUS_CANCELLED: u16 = 401;

/// Image as reported by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Content fingerprint (sha256 hex)
    pub fingerprint: String,
    /// When the image was imported
    pub created_at: DateTime<Utc>,
    /// Aliases currently pointing at this image
    #[serde(default)]
    pub aliases: Vec<ImageAliasRef>,
    /// Original upload file name
    #[serde(default)]
    pub filename: String,
    /// Total size in bytes
    #[serde(default)]
    pub size: u64,
}

/// Alias reference embedded in an [`ImageRecord`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAliasRef {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Entry of the store-wide alias table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasEntry {
    pub name: String,
    pub target: String,
    #[serde(default)]
    pub description: String,
}

/// Snapshot of a server-side operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub status_code: u16,
    #[serde(default)]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    pub err: String,
}

impl OperationRecord {
    pub fn is_success(&self) -> bool {
        self.status_code == STATUS_SUCCESS
    }

    /// Turn a finished operation into an error unless it succeeded.
    pub fn into_result(self) -> Result<Self> {
        match self.status_code {
            STATUS_SUCCESS => Ok(self),
            STATUS_CANCELLED => Err(BakeError::Cancelled(format!("operation {}", self.id))),
            _ => Err(BakeError::OperationFailed {
                message: if self.err.is_empty() {
                    self.status.clone()
                } else {
                    self.err.clone()
                },
                id: self.id,
            }),
        }
    }

    /// Look up a metadata field.
    pub fn metadata_field(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.as_ref().and_then(|m| m.get(key))
    }
}

/// Bytes sent so far out of the total upload size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub sent: u64,
    pub total: u64,
}

impl TransferProgress {
    pub fn percent(&self) -> u64 {
        if self.total == 0 {
            100
        } else {
            self.sent.saturating_mul(100) / self.total
        }
    }
}

/// Caller-driven progress callback invoked while artifacts stream.
pub type ProgressHandler = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// One artifact opened for streaming.
#[derive(Debug)]
pub struct ArtifactStream {
    /// File name announced to the store
    pub name: String,
    pub file: tokio::fs::File,
    pub size: u64,
}

impl ArtifactStream {
    /// Open an artifact for streaming read.
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(Self { name, file, size })
    }
}

/// Split image upload: metadata archive plus filesystem image.
pub struct ImageUpload {
    /// File name hint stored with the image
    pub filename: String,
    pub meta: ArtifactStream,
    pub rootfs: ArtifactStream,
    /// Whether the image is public on the store
    pub public: bool,
    pub progress: Option<ProgressHandler>,
}

impl ImageUpload {
    pub fn total_size(&self) -> u64 {
        self.meta.size + self.rootfs.size
    }
}

/// Handle to a long-running server-side operation.
#[async_trait]
pub trait RemoteOperation: Send + Sync {
    /// Operation identifier
    fn id(&self) -> &str;

    /// Block until the operation finishes.
    async fn wait(&self) -> Result<OperationRecord>;

    /// Ask the server to cancel the operation (best effort).
    async fn cancel(&self) -> Result<()>;
}

/// Image store API consumed by the built image lifecycle.
#[async_trait]
pub trait ImageServer: Send + Sync {
    /// Remote name this server was connected as.
    fn name(&self) -> &str;

    /// Start importing a split image.
    async fn create_image(&self, upload: ImageUpload) -> Result<Box<dyn RemoteOperation>>;

    /// Fetch an image by fingerprint. Absent images yield `NotFound`.
    async fn get_image(&self, fingerprint: &str) -> Result<ImageRecord>;

    /// Start deleting an image.
    async fn delete_image(&self, fingerprint: &str) -> Result<Box<dyn RemoteOperation>>;

    /// List every alias on the store.
    async fn list_image_aliases(&self) -> Result<Vec<AliasEntry>>;

    /// Fetch one alias, `None` when it does not exist.
    async fn get_image_alias(&self, name: &str) -> Result<Option<AliasEntry>>;

    async fn create_image_alias(&self, name: &str, target: &str) -> Result<()>;

    async fn delete_image_alias(&self, name: &str) -> Result<()>;
}

/// Resolves remote names to image servers.
pub trait ServerConnector: Send + Sync {
    fn connect(&self, remote: &str) -> Result<Arc<dyn ImageServer>>;
}

/// Connects to LXD remotes described by the provider configuration.
///
/// Clients are built lazily and reused per remote.
pub struct LxdConnector {
    config: ProviderConfig,
    clients: Mutex<HashMap<String, Arc<dyn ImageServer>>>,
}

impl LxdConnector {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }
}

impl ServerConnector for LxdConnector {
    fn connect(&self, remote: &str) -> Result<Arc<dyn ImageServer>> {
        let mut clients = self.clients.lock();
        if let Some(server) = clients.get(remote) {
            return Ok(server.clone());
        }

        let server: Arc<dyn ImageServer> =
            Arc::new(LxdServer::new(remote, self.config.remote(remote)?)?);
        clients.insert(remote.to_string(), server.clone());
        Ok(server)
    }
}

/// Fixed remote → server mapping.
#[derive(Default)]
pub struct StaticConnector {
    servers: HashMap<String, Arc<dyn ImageServer>>,
}

impl StaticConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server(mut self, remote: impl Into<String>, server: Arc<dyn ImageServer>) -> Self {
        self.servers.insert(remote.into(), server);
        self
    }
}

impl ServerConnector for StaticConnector {
    fn connect(&self, remote: &str) -> Result<Arc<dyn ImageServer>> {
        self.servers
            .get(remote)
            .cloned()
            .ok_or_else(|| BakeError::ConfigError(format!("Unknown remote: {remote}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status_code: u16, err: &str) -> OperationRecord {
        OperationRecord {
            id: "op-1".to_string(),
            status: "Failure".to_string(),
            status_code,
            metadata: None,
            err: err.to_string(),
        }
    }

    #[test]
    fn test_into_result_success() {
        let op = record(STATUS_SUCCESS, "");
        assert!(op.is_success());
        assert!(op.into_result().is_ok());
    }

    #[test]
    fn test_into_result_failure_uses_err() {
        let err = record(400, "Image with same fingerprint already exists")
            .into_result()
            .unwrap_err();
        match err {
            BakeError::OperationFailed { id, message } => {
                assert_eq!(id, "op-1");
                assert_eq!(message, "Image with same fingerprint already exists");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_into_result_failure_falls_back_to_status() {
        let err = record(400, "").into_result().unwrap_err();
        assert!(err.to_string().contains("Failure"));
    }

    #[test]
    fn test_into_result_cancelled() {
        let err = record(STATUS_CANCELLED, "").into_result().unwrap_err();
        assert!(matches!(err, BakeError::Cancelled(_)));
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(TransferProgress { sent: 50, total: 200 }.percent(), 25);
        assert_eq!(TransferProgress { sent: 0, total: 0 }.percent(), 100);
    }

    #[test]
    fn test_static_connector() {
        let server: Arc<dyn ImageServer> = Arc::new(MemoryServer::new("local"));
        let connector = StaticConnector::new().with_server("local", server);
        assert_eq!(connector.connect("local").unwrap().name(), "local");
        assert!(matches!(
            connector.connect("other"),
            Err(BakeError::ConfigError(_))
        ));
    }

    #[test]
    fn test_lxd_connector_unknown_remote() {
        let connector = LxdConnector::new(ProviderConfig::default());
        assert!(connector.connect("nowhere").is_err());
    }

    #[test]
    fn test_lxd_connector_reuses_clients() {
        let connector = LxdConnector::new(ProviderConfig::default());
        let first = connector.connect("local").unwrap();
        let second = connector.connect("local").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }
}
