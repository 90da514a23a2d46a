//! In-process simulated image store.
//!
//! Behaves like an LXD image store for the calls the lifecycle uses:
//! images are content-addressed with the split image fingerprint rule,
//! aliases live in one store-wide table, and deleting an image drops its
//! aliases. Every call is appended to a journal so callers can assert on
//! ordering, and alias operations or uploads can be made to fail.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lxbake_core::error::{BakeError, Result};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use super::{
    AliasEntry, ArtifactStream, ImageAliasRef, ImageRecord, ImageServer, ImageUpload,
    OperationRecord, ProgressHandler, RemoteOperation, TransferProgress, STATUS_SUCCESS,
};
use crate::fingerprint::bytes_fingerprint;

/// A call received by a [`MemoryServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerCall {
    CreateImage { filename: String },
    GetImage(String),
    DeleteImage(String),
    ListAliases,
    GetAlias(String),
    CreateAlias { name: String, target: String },
    DeleteAlias(String),
    CancelOperation(String),
}

#[derive(Debug, Clone)]
struct StoredImage {
    created_at: DateTime<Utc>,
    filename: String,
    size: u64,
}

#[derive(Default)]
struct MemoryState {
    images: BTreeMap<String, StoredImage>,
    aliases: BTreeMap<String, String>,
    journal: Vec<ServerCall>,
    failing_aliases: HashSet<String>,
    reject_uploads: bool,
    stall_uploads: bool,
    hold_operations: bool,
    next_operation: u64,
    operation_metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

impl MemoryState {
    fn operation_id(&mut self) -> String {
        self.next_operation += 1;
        format!("op-{}", self.next_operation)
    }
}

/// Simulated image store.
#[derive(Clone)]
pub struct MemoryServer {
    name: String,
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryServer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Seed an image.
    pub fn insert_image(&self, fingerprint: &str, created_at: DateTime<Utc>) {
        self.state.lock().images.insert(
            fingerprint.to_string(),
            StoredImage {
                created_at,
                filename: String::new(),
                size: 0,
            },
        );
    }

    /// Seed an alias (bypasses the journal).
    pub fn insert_alias(&self, name: &str, target: &str) {
        self.state
            .lock()
            .aliases
            .insert(name.to_string(), target.to_string());
    }

    /// Make create/delete of this alias fail.
    pub fn fail_alias(&self, name: &str) {
        self.state.lock().failing_aliases.insert(name.to_string());
    }

    /// Make every upload fail.
    pub fn reject_uploads(&self) {
        self.state.lock().reject_uploads = true;
    }

    /// Accept uploads but never finish receiving them.
    pub fn stall_uploads(&self) {
        self.state.lock().stall_uploads = true;
    }

    /// Keep operations pending until they are cancelled.
    pub fn hold_operations(&self) {
        self.state.lock().hold_operations = true;
    }

    /// Replace the metadata returned by finished import operations.
    pub fn override_operation_metadata(
        &self,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) {
        self.state.lock().operation_metadata = metadata;
    }

    pub fn has_image(&self, fingerprint: &str) -> bool {
        self.state.lock().images.contains_key(fingerprint)
    }

    pub fn image_count(&self) -> usize {
        self.state.lock().images.len()
    }

    pub fn alias_target(&self, name: &str) -> Option<String> {
        self.state.lock().aliases.get(name).cloned()
    }

    /// Calls received so far.
    pub fn journal(&self) -> Vec<ServerCall> {
        self.state.lock().journal.clone()
    }

    pub fn clear_journal(&self) {
        self.state.lock().journal.clear();
    }

    fn record(&self, call: ServerCall) {
        self.state.lock().journal.push(call);
    }

    fn check_alias(&self, name: &str) -> Result<()> {
        if self.state.lock().failing_aliases.contains(name) {
            return Err(BakeError::ServerError {
                remote: self.name.clone(),
                status: 500,
                message: format!("simulated failure for alias {name}"),
            });
        }
        Ok(())
    }

    fn operation(&self, record: OperationRecord) -> Box<dyn RemoteOperation> {
        let hold = self.state.lock().hold_operations;
        Box::new(MemoryOperation {
            server: self.clone(),
            record,
            hold,
        })
    }
}

async fn read_artifact(
    artifact: &mut ArtifactStream,
    sent: &mut u64,
    total: u64,
    progress: &Option<ProgressHandler>,
) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(artifact.size as usize);
    artifact.file.read_to_end(&mut bytes).await?;
    *sent += bytes.len() as u64;
    if let Some(progress) = progress {
        progress(TransferProgress { sent: *sent, total });
    }
    Ok(bytes)
}

#[async_trait]
impl ImageServer for MemoryServer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_image(&self, mut upload: ImageUpload) -> Result<Box<dyn RemoteOperation>> {
        self.record(ServerCall::CreateImage {
            filename: upload.filename.clone(),
        });

        if self.state.lock().stall_uploads {
            std::future::pending::<()>().await;
        }
        if self.state.lock().reject_uploads {
            return Err(BakeError::ServerError {
                remote: self.name.clone(),
                status: 400,
                message: "simulated upload rejection".to_string(),
            });
        }

        let total = upload.total_size();
        let mut sent = 0;
        let meta = read_artifact(&mut upload.meta, &mut sent, total, &upload.progress).await?;
        let rootfs = read_artifact(&mut upload.rootfs, &mut sent, total, &upload.progress).await?;
        let fingerprint = bytes_fingerprint(&[&meta[..], &rootfs[..]]);

        let mut state = self.state.lock();
        state.images.entry(fingerprint.clone()).or_insert(StoredImage {
            created_at: Utc::now(),
            filename: upload.filename,
            size: total,
        });

        let metadata = match state.operation_metadata.clone() {
            Some(metadata) => metadata,
            None => {
                let mut metadata = serde_json::Map::new();
                metadata.insert("fingerprint".to_string(), fingerprint.into());
                metadata
            }
        };
        let record = OperationRecord {
            id: state.operation_id(),
            status: "Success".to_string(),
            status_code: STATUS_SUCCESS,
            metadata: Some(metadata),
            err: String::new(),
        };
        drop(state);

        Ok(self.operation(record))
    }

    async fn get_image(&self, fingerprint: &str) -> Result<ImageRecord> {
        self.record(ServerCall::GetImage(fingerprint.to_string()));

        let state = self.state.lock();
        let image = state
            .images
            .get(fingerprint)
            .ok_or_else(|| BakeError::NotFound(format!("image {fingerprint}")))?;

        Ok(ImageRecord {
            fingerprint: fingerprint.to_string(),
            created_at: image.created_at,
            aliases: state
                .aliases
                .iter()
                .filter(|(_, target)| target.as_str() == fingerprint)
                .map(|(name, _)| ImageAliasRef {
                    name: name.clone(),
                    description: String::new(),
                })
                .collect(),
            filename: image.filename.clone(),
            size: image.size,
        })
    }

    async fn delete_image(&self, fingerprint: &str) -> Result<Box<dyn RemoteOperation>> {
        self.record(ServerCall::DeleteImage(fingerprint.to_string()));

        let mut state = self.state.lock();
        if state.images.remove(fingerprint).is_none() {
            return Err(BakeError::NotFound(format!("image {fingerprint}")));
        }
        state.aliases.retain(|_, target| target != fingerprint);

        let record = OperationRecord {
            id: state.operation_id(),
            status: "Success".to_string(),
            status_code: STATUS_SUCCESS,
            metadata: None,
            err: String::new(),
        };
        drop(state);

        Ok(self.operation(record))
    }

    async fn list_image_aliases(&self) -> Result<Vec<AliasEntry>> {
        self.record(ServerCall::ListAliases);

        Ok(self
            .state
            .lock()
            .aliases
            .iter()
            .map(|(name, target)| AliasEntry {
                name: name.clone(),
                target: target.clone(),
                description: String::new(),
            })
            .collect())
    }

    async fn get_image_alias(&self, name: &str) -> Result<Option<AliasEntry>> {
        self.record(ServerCall::GetAlias(name.to_string()));

        Ok(self.state.lock().aliases.get(name).map(|target| AliasEntry {
            name: name.to_string(),
            target: target.clone(),
            description: String::new(),
        }))
    }

    async fn create_image_alias(&self, name: &str, target: &str) -> Result<()> {
        self.record(ServerCall::CreateAlias {
            name: name.to_string(),
            target: target.to_string(),
        });
        self.check_alias(name)?;

        let mut state = self.state.lock();
        if !state.images.contains_key(target) {
            return Err(BakeError::NotFound(format!("image {target}")));
        }
        if state.aliases.contains_key(name) {
            return Err(BakeError::ServerError {
                remote: self.name.clone(),
                status: 409,
                message: format!("Alias {name} already exists"),
            });
        }
        state.aliases.insert(name.to_string(), target.to_string());
        Ok(())
    }

    async fn delete_image_alias(&self, name: &str) -> Result<()> {
        self.record(ServerCall::DeleteAlias(name.to_string()));
        self.check_alias(name)?;

        match self.state.lock().aliases.remove(name) {
            Some(_) => Ok(()),
            None => Err(BakeError::NotFound(format!("image alias {name}"))),
        }
    }
}

/// Operation handle returned by [`MemoryServer`].
///
/// Completes immediately unless the server holds operations, in which case
/// `wait` never resolves and only `cancel` has an effect.
struct MemoryOperation {
    server: MemoryServer,
    record: OperationRecord,
    hold: bool,
}

#[async_trait]
impl RemoteOperation for MemoryOperation {
    fn id(&self) -> &str {
        &self.record.id
    }

    async fn wait(&self) -> Result<OperationRecord> {
        if self.hold {
            std::future::pending::<()>().await;
        }
        Ok(self.record.clone())
    }

    async fn cancel(&self) -> Result<()> {
        self.server
            .record(ServerCall::CancelOperation(self.record.id.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_aliases_follow_images() {
        let server = MemoryServer::new("local");
        server.insert_image("aaa", Utc::now());
        server.create_image_alias("one", "aaa").await.unwrap();

        let image = server.get_image("aaa").await.unwrap();
        assert_eq!(image.aliases.len(), 1);
        assert_eq!(image.aliases[0].name, "one");

        let op = server.delete_image("aaa").await.unwrap();
        assert!(op.wait().await.unwrap().is_success());
        assert!(server.alias_target("one").is_none());
        assert!(server.get_image("aaa").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_alias_requires_existing_image() {
        let server = MemoryServer::new("local");
        assert!(server.create_image_alias("one", "nope").await.is_err());
    }

    #[tokio::test]
    async fn test_duplicate_alias_rejected() {
        let server = MemoryServer::new("local");
        server.insert_image("aaa", Utc::now());
        server.create_image_alias("one", "aaa").await.unwrap();
        assert!(server.create_image_alias("one", "aaa").await.is_err());
    }

    #[tokio::test]
    async fn test_failing_alias_is_journaled() {
        let server = MemoryServer::new("local");
        server.insert_image("aaa", Utc::now());
        server.fail_alias("bad");

        assert!(server.create_image_alias("bad", "aaa").await.is_err());
        assert_eq!(
            server.journal(),
            vec![ServerCall::CreateAlias {
                name: "bad".to_string(),
                target: "aaa".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn test_delete_missing_alias_is_not_found() {
        let server = MemoryServer::new("local");
        let err = server.delete_image_alias("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }
}
