//! Built image resource lifecycle.
//!
//! A built image moves through `absent → creating → present → deleting →
//! absent`, with any number of alias-only updates while present. The only
//! durable handle is the composite id `<remote>/<fingerprint>`, which is
//! written into the record after every stage of a create has succeeded.

use std::collections::BTreeSet;
use std::sync::Arc;

use lxbake_core::config::ProviderConfig;
use lxbake_core::error::{BakeError, Result};
use lxbake_core::id::BuiltImageId;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::alias::{check_conflicts, ensure_aliases, reconcile, AliasReport};
use crate::build::BuildExecutor;
use crate::operation::cancelable_wait;
use crate::server::{ImageServer, LxdConnector, ProgressHandler, ServerConnector};
use crate::transfer::{log_progress, transfer};

/// Persisted record of one built image resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuiltImageState {
    /// Composite id, set only once the image exists.
    pub id: Option<String>,
    /// Builder definition (YAML).
    pub template: String,
    /// Requested remote; empty selects the default remote.
    pub remote: String,
    pub fingerprint: Option<String>,
    /// Aliases requested by the caller, or the visible set after a read.
    pub aliases: Vec<String>,
    /// Aliases attached to the image by some other mechanism.
    pub copied_aliases: Vec<String>,
    /// Store creation time, unix seconds.
    pub created_at: Option<i64>,
}

impl BuiltImageState {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
            ..Default::default()
        }
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    pub fn with_aliases<I, S>(mut self, aliases: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aliases = aliases.into_iter().map(Into::into).collect();
        self
    }

    /// Parsed composite id, `None` while the resource is absent.
    pub fn built_id(&self) -> Result<Option<BuiltImageId>> {
        self.id.as_deref().map(BuiltImageId::parse).transpose()
    }

    fn clear(&mut self) {
        self.id = None;
        self.fingerprint = None;
        self.created_at = None;
    }
}

/// Read-only configuration plus a way to reach remotes.
#[derive(Clone)]
pub struct Provider {
    config: Arc<ProviderConfig>,
    connector: Arc<dyn ServerConnector>,
}

impl Provider {
    pub fn new(config: ProviderConfig, connector: Arc<dyn ServerConnector>) -> Self {
        Self {
            config: Arc::new(config),
            connector,
        }
    }

    /// Provider talking to the LXD remotes named in `config`.
    pub fn lxd(config: ProviderConfig) -> Self {
        let connector = Arc::new(LxdConnector::new(config.clone()));
        Self::new(config, connector)
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn select_remote(&self, requested: &str) -> String {
        self.config.select_remote(requested).to_string()
    }

    pub fn server(&self, remote: &str) -> Result<Arc<dyn ImageServer>> {
        self.connector.connect(remote)
    }
}

/// Create/read/update/delete/exists for built images.
pub struct BuiltImageResource {
    provider: Provider,
    executor: BuildExecutor,
    progress: Option<ProgressHandler>,
}

impl BuiltImageResource {
    pub fn new(provider: Provider) -> Self {
        let executor = BuildExecutor::new(provider.config().builder.clone());
        Self {
            provider,
            executor,
            progress: Some(log_progress()),
        }
    }

    /// Replace the transfer progress handler.
    pub fn with_progress(mut self, progress: Option<ProgressHandler>) -> Self {
        self.progress = progress;
        self
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Build, import and alias a new image.
    ///
    /// # Process
    ///
    /// 1. Reject aliases already bound on the destination store
    /// 2. Run the builder on the template
    /// 3. Transfer the artifacts and take the store's fingerprint
    /// 4. Bind the requested aliases to that fingerprint
    /// 5. Record the id and hydrate the record from the store
    ///
    /// On failure `state` is left untouched. An image already imported when a
    /// later stage fails stays on the store.
    pub async fn create(
        &self,
        state: &mut BuiltImageState,
        cancel: &CancellationToken,
    ) -> Result<AliasReport> {
        if state.template.trim().is_empty() {
            return Err(BakeError::ConfigError("template must not be empty".to_string()));
        }

        let remote = self.provider.select_remote(&state.remote);
        let server = self.provider.server(&remote)?;

        check_conflicts(server.as_ref(), &state.aliases).await?;

        let artifacts = self.executor.build(&state.template, cancel).await?;
        let filename = artifacts
            .meta_path()
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.executor.config().meta_artifact)
            .to_string();

        let transferred = transfer(
            server.as_ref(),
            artifacts.meta_path(),
            artifacts.rootfs_path(),
            &filename,
            self.progress.clone(),
            cancel,
        )
        .await;
        artifacts.cleanup();
        let fingerprint = transferred?;

        let report = ensure_aliases(server.as_ref(), &state.aliases, &fingerprint).await?;
        if !report.is_clean() {
            tracing::warn!(
                fingerprint = %fingerprint,
                failures = report.failures.len(),
                "Some aliases could not be bound"
            );
        }

        let id = BuiltImageId::new(remote, fingerprint);
        let mut hydrated = state.clone();
        hydrated.id = Some(id.to_string());
        self.read(&mut hydrated).await?;
        *state = hydrated;

        tracing::info!(id = %id, "Built image created");
        Ok(report)
    }

    /// Refresh the record from the store.
    ///
    /// A missing image clears the id instead of failing.
    pub async fn read(&self, state: &mut BuiltImageState) -> Result<()> {
        let Some(id) = state.built_id()? else {
            return Ok(());
        };
        let server = self.server_for(&id)?;

        let image = match server.get_image(id.fingerprint()).await {
            Ok(image) => image,
            Err(e) if e.is_not_found() => {
                tracing::info!(id = %id, "Built image no longer exists");
                state.clear();
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let configured: BTreeSet<&str> = state.aliases.iter().map(String::as_str).collect();
        let copied: BTreeSet<&str> = state.copied_aliases.iter().map(String::as_str).collect();
        let visible: Vec<String> = image
            .aliases
            .iter()
            .filter(|alias| {
                let keep = configured.contains(alias.name.as_str())
                    || !copied.contains(alias.name.as_str());
                if !keep {
                    tracing::debug!(alias = %alias.name, "Filtered copied alias");
                }
                keep
            })
            .map(|alias| alias.name.clone())
            .collect();

        state.fingerprint = Some(id.fingerprint().to_string());
        state.created_at = Some(image.created_at.timestamp());
        state.aliases = visible;
        Ok(())
    }

    /// Move the image's aliases to `aliases`.
    ///
    /// Nothing else about a built image can change in place.
    pub async fn update(
        &self,
        state: &mut BuiltImageState,
        aliases: Vec<String>,
    ) -> Result<AliasReport> {
        let old: BTreeSet<&String> = state.aliases.iter().collect();
        let new: BTreeSet<&String> = aliases.iter().collect();
        if old == new {
            tracing::debug!("Aliases unchanged, nothing to update");
            return Ok(AliasReport::default());
        }

        let id = state
            .built_id()?
            .ok_or_else(|| BakeError::NotFound("built image has no id".to_string()))?;
        let server = self.server_for(&id)?;

        let report = reconcile(server.as_ref(), &state.aliases, &aliases, id.fingerprint()).await;
        state.aliases = aliases;
        Ok(report)
    }

    /// Delete the image and wait for the store to finish.
    pub async fn delete(&self, state: &mut BuiltImageState, cancel: &CancellationToken) -> Result<()> {
        let Some(id) = state.built_id()? else {
            return Ok(());
        };
        let server = self.server_for(&id)?;

        let op = server.delete_image(id.fingerprint()).await?;
        cancelable_wait(op.as_ref(), cancel).await?;

        state.clear();
        tracing::info!(id = %id, "Built image deleted");
        Ok(())
    }

    /// Probe the store; only not-found maps to `false`.
    pub async fn exists(&self, state: &BuiltImageState) -> Result<bool> {
        let Some(id) = state.built_id()? else {
            return Ok(false);
        };
        let server = self.server_for(&id)?;

        match server.get_image(id.fingerprint()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn server_for(&self, id: &BuiltImageId) -> Result<Arc<dyn ImageServer>> {
        let remote = self.provider.select_remote(id.remote());
        self.provider.server(&remote)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::fingerprint::bytes_fingerprint;
    use crate::server::{MemoryServer, ServerCall, StaticConnector};
    use chrono::{TimeZone, Utc};
    use lxbake_core::config::BuilderConfig;
    use std::time::Duration;
    use tempfile::TempDir;

    const TEMPLATE: &str = "image:\n  distribution: alpine\n";
    const BUILD_OK: &str = r#"cp "$1" lxd.tar.xz && printf rootfs > rootfs.squashfs"#;

    struct Fixture {
        _work: TempDir,
        server: MemoryServer,
        resource: BuiltImageResource,
    }

    fn fixture(script: &str) -> Fixture {
        let work = TempDir::new().unwrap();
        let server = MemoryServer::new("local");

        let config = ProviderConfig {
            builder: BuilderConfig {
                program: "sh".to_string(),
                args: vec!["-c".to_string(), script.to_string(), "builder".to_string()],
                privilege_wrapper: None,
                work_root: Some(work.path().to_path_buf()),
                ..Default::default()
            },
            ..Default::default()
        };

        let connector = StaticConnector::new().with_server("local", Arc::new(server.clone()));
        let provider = Provider::new(config, Arc::new(connector));
        Fixture {
            _work: work,
            server,
            resource: BuiltImageResource::new(provider).with_progress(None),
        }
    }

    fn expected_fingerprint() -> String {
        bytes_fingerprint(&[TEMPLATE.as_bytes(), &b"rootfs"[..]])
    }

    fn present(fingerprint: &str, aliases: &[&str]) -> BuiltImageState {
        BuiltImageState {
            id: Some(format!("local/{fingerprint}")),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            ..BuiltImageState::new(TEMPLATE)
        }
    }

    fn created_image_calls(server: &MemoryServer) -> usize {
        server
            .journal()
            .iter()
            .filter(|call| matches!(call, ServerCall::CreateImage { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_create_persists_composite_id() {
        let f = fixture(BUILD_OK);
        let mut state = BuiltImageState::new(TEMPLATE).with_aliases(["alpine/edge", "alpine"]);

        let report = f
            .resource
            .create(&mut state, &CancellationToken::new())
            .await
            .unwrap();

        let fingerprint = expected_fingerprint();
        assert!(report.is_clean());
        assert_eq!(state.id, Some(format!("local/{fingerprint}")));
        assert_eq!(state.fingerprint.as_deref(), Some(fingerprint.as_str()));
        assert!(state.created_at.is_some());
        assert_eq!(state.aliases, vec!["alpine", "alpine/edge"]);
        assert_eq!(f.server.alias_target("alpine").as_deref(), Some(fingerprint.as_str()));
        assert_eq!(std::fs::read_dir(f._work.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_create_on_unknown_remote_fails() {
        let f = fixture(BUILD_OK);
        let mut state = BuiltImageState::new(TEMPLATE).with_remote("elsewhere");

        let err = f
            .resource
            .create(&mut state, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BakeError::ConfigError(_)));
        assert!(state.id.is_none());
    }

    #[tokio::test]
    async fn test_alias_conflict_rejects_before_build() {
        let f = fixture(BUILD_OK);
        f.server.insert_image("other", Utc::now());
        f.server.insert_alias("taken", "other");
        let mut state = BuiltImageState::new(TEMPLATE).with_aliases(["free", "taken"]);

        let err = f
            .resource
            .create(&mut state, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, BakeError::AliasConflict { ref alias, .. } if alias == "taken"));
        assert!(state.id.is_none());
        assert_eq!(f.server.image_count(), 1);
        assert!(f.server.alias_target("free").is_none());
        assert_eq!(created_image_calls(&f.server), 0);
    }

    #[tokio::test]
    async fn test_build_failure_leaves_no_id() {
        let f = fixture("exit 1");
        let mut state = BuiltImageState::new(TEMPLATE);

        let err = f
            .resource
            .create(&mut state, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BakeError::BuildFailure { .. }));
        assert_eq!(state, BuiltImageState::new(TEMPLATE));
        assert_eq!(created_image_calls(&f.server), 0);
    }

    #[tokio::test]
    async fn test_missing_rootfs_never_transfers() {
        let f = fixture(r#"cp "$1" lxd.tar.xz"#);
        let mut state = BuiltImageState::new(TEMPLATE);

        let err = f
            .resource
            .create(&mut state, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BakeError::ArtifactMissing { .. }));
        assert!(state.id.is_none());
        assert_eq!(created_image_calls(&f.server), 0);
    }

    #[tokio::test]
    async fn test_transfer_failure_leaves_no_id() {
        let f = fixture(BUILD_OK);
        f.server.reject_uploads();
        let mut state = BuiltImageState::new(TEMPLATE);

        let err = f
            .resource
            .create(&mut state, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BakeError::TransferFailure(_)));
        assert!(state.id.is_none());
        assert_eq!(std::fs::read_dir(f._work.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_create_cancels_import() {
        let f = fixture(BUILD_OK);
        f.server.hold_operations();
        let mut state = BuiltImageState::new(TEMPLATE);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let server = f.server.clone();
        tokio::spawn(async move {
            while created_image_calls(&server) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            trigger.cancel();
        });

        let err = f.resource.create(&mut state, &cancel).await.unwrap_err();
        assert!(matches!(err, BakeError::Cancelled(_)));
        assert!(state.id.is_none());
        assert!(f
            .server
            .journal()
            .iter()
            .any(|call| matches!(call, ServerCall::CancelOperation(_))));
    }

    #[tokio::test]
    async fn test_empty_template_rejected() {
        let f = fixture(BUILD_OK);
        let mut state = BuiltImageState::new("  ");
        let err = f
            .resource
            .create(&mut state, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BakeError::ConfigError(_)));
    }

    #[tokio::test]
    async fn test_read_missing_image_clears_id() {
        let f = fixture(BUILD_OK);
        let mut state = present("gone", &["a"]);

        f.resource.read(&mut state).await.unwrap();
        assert!(state.id.is_none());
        assert!(state.fingerprint.is_none());
        assert!(state.created_at.is_none());
    }

    #[tokio::test]
    async fn test_read_filters_copied_aliases() {
        let f = fixture(BUILD_OK);
        let created = Utc.with_ymd_and_hms(2019, 1, 2, 3, 4, 5).unwrap();
        f.server.insert_image("fff", created);
        for alias in ["a", "b", "c"] {
            f.server.insert_alias(alias, "fff");
        }

        let mut state = present("fff", &["a"]);
        state.copied_aliases = vec!["a".to_string(), "b".to_string()];

        f.resource.read(&mut state).await.unwrap();
        assert_eq!(state.aliases, vec!["a", "c"]);
        assert_eq!(state.fingerprint.as_deref(), Some("fff"));
        assert_eq!(state.created_at, Some(created.timestamp()));
    }

    #[tokio::test]
    async fn test_read_without_id_is_noop() {
        let f = fixture(BUILD_OK);
        let mut state = BuiltImageState::new(TEMPLATE);
        f.resource.read(&mut state).await.unwrap();
        assert!(f.server.journal().is_empty());
    }

    #[tokio::test]
    async fn test_read_rejects_malformed_id() {
        let f = fixture(BUILD_OK);
        let mut state = BuiltImageState {
            id: Some("no-separator".to_string()),
            ..Default::default()
        };
        let err = f.resource.read(&mut state).await.unwrap_err();
        assert!(matches!(err, BakeError::InvalidId(_)));
    }

    #[tokio::test]
    async fn test_update_reconciles_aliases() {
        let f = fixture(BUILD_OK);
        f.server.insert_image("fff", Utc::now());
        for alias in ["a", "b"] {
            f.server.insert_alias(alias, "fff");
        }
        let mut state = present("fff", &["a", "b"]);

        let report = f
            .resource
            .update(&mut state, vec!["b".to_string(), "c".to_string()])
            .await
            .unwrap();

        assert!(report.is_clean());
        assert_eq!(state.aliases, vec!["b", "c"]);
        assert_eq!(
            f.server.journal(),
            vec![
                ServerCall::DeleteAlias("a".to_string()),
                ServerCall::CreateAlias {
                    name: "c".to_string(),
                    target: "fff".to_string()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_update_without_alias_change_is_noop() {
        let f = fixture(BUILD_OK);
        let mut state = present("fff", &["a", "b"]);

        let report = f
            .resource
            .update(&mut state, vec!["b".to_string(), "a".to_string()])
            .await
            .unwrap();
        assert!(report.is_clean());
        assert!(f.server.journal().is_empty());
    }

    #[tokio::test]
    async fn test_update_reports_partial_failure() {
        let f = fixture(BUILD_OK);
        f.server.insert_image("fff", Utc::now());
        f.server.fail_alias("bad");
        let mut state = present("fff", &[]);

        let report = f
            .resource
            .update(&mut state, vec!["bad".to_string(), "good".to_string()])
            .await
            .unwrap();
        assert_eq!(report.failures.len(), 1);
        assert_eq!(f.server.alias_target("good").as_deref(), Some("fff"));
    }

    #[tokio::test]
    async fn test_delete_removes_image() {
        let f = fixture(BUILD_OK);
        let mut state = BuiltImageState::new(TEMPLATE).with_aliases(["x"]);
        let cancel = CancellationToken::new();
        f.resource.create(&mut state, &cancel).await.unwrap();
        assert!(f.resource.exists(&state).await.unwrap());
        let before = state.clone();

        f.resource.delete(&mut state, &cancel).await.unwrap();
        assert!(state.id.is_none());
        // The old id must no longer resolve on the store.
        assert!(!f.resource.exists(&before).await.unwrap());
        assert_eq!(f.server.image_count(), 0);
        assert!(f.server.alias_target("x").is_none());
    }

    #[tokio::test]
    async fn test_delete_missing_image_propagates() {
        let f = fixture(BUILD_OK);
        let mut state = present("gone", &[]);
        let err = f
            .resource
            .delete(&mut state, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(state.id.is_some());
    }

    #[tokio::test]
    async fn test_exists_distinguishes_not_found() {
        let f = fixture(BUILD_OK);
        f.server.insert_image("fff", Utc::now());

        assert!(f.resource.exists(&present("fff", &[])).await.unwrap());
        assert!(!f.resource.exists(&present("gone", &[])).await.unwrap());
        assert!(!f.resource.exists(&BuiltImageState::default()).await.unwrap());

        let elsewhere = BuiltImageState {
            id: Some("elsewhere/fff".to_string()),
            ..Default::default()
        };
        assert!(f.resource.exists(&elsewhere).await.is_err());
    }

    #[test]
    fn test_state_serde_defaults() {
        let state: BuiltImageState = serde_json::from_str(r#"{"template":"t"}"#).unwrap();
        assert_eq!(state.template, "t");
        assert!(state.id.is_none());
        assert!(state.copied_aliases.is_empty());
    }
}
