use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{BakeError, Result};

/// Environment variable overriding the default remote.
pub const REMOTE_ENV: &str = "LXBAKE_REMOTE";

/// Provider configuration shared by every resource operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Remote used when a resource does not name one
    pub default_remote: String,

    /// Known image stores by name
    pub remotes: HashMap<String, RemoteConfig>,

    /// Image builder invocation
    pub builder: BuilderConfig,

    /// Log level
    pub log_level: LogLevel,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        let mut remotes = HashMap::new();
        remotes.insert("local".to_string(), RemoteConfig::default());

        Self {
            default_remote: "local".to_string(),
            remotes,
            builder: BuilderConfig::default(),
            log_level: LogLevel::Info,
        }
    }
}

impl ProviderConfig {
    /// Load configuration from a YAML (or JSON) file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            BakeError::ConfigError(format!("Failed to read {}: {}", path.display(), e))
        })?;

        serde_yaml::from_str(&data).map_err(|e| {
            BakeError::ConfigError(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Apply environment overrides (`LXBAKE_REMOTE`).
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(remote) = std::env::var(REMOTE_ENV) {
            if !remote.is_empty() {
                self.default_remote = remote;
            }
        }
        self
    }

    /// Pick the remote for a resource: its own selector if set, else the default.
    pub fn select_remote<'a>(&'a self, requested: &'a str) -> &'a str {
        if requested.is_empty() {
            &self.default_remote
        } else {
            requested
        }
    }

    /// Look up a remote by name.
    pub fn remote(&self, name: &str) -> Result<&RemoteConfig> {
        self.remotes
            .get(name)
            .ok_or_else(|| BakeError::ConfigError(format!("Unknown remote: {name}")))
    }
}

/// Connection settings for one LXD image store
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// HTTPS endpoint (e.g., "https://10.0.0.2:8443")
    pub address: String,

    /// LXD project (optional)
    pub project: Option<String>,

    /// Client certificate (PEM) for TLS client authentication
    pub client_cert: Option<PathBuf>,

    /// Client key (PKCS#8 PEM)
    pub client_key: Option<PathBuf>,

    /// Server certificate (PEM) to trust in addition to system roots
    pub server_cert: Option<PathBuf>,

    /// Skip server certificate verification
    pub accept_invalid_certs: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            address: "https://127.0.0.1:8443".to_string(),
            project: None,
            client_cert: None,
            client_key: None,
            server_cert: None,
            accept_invalid_certs: false,
        }
    }
}

/// External image builder invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuilderConfig {
    /// Builder executable
    pub program: String,

    /// Arguments placed before the definition file path
    pub args: Vec<String>,

    /// Privilege wrapper prepended to the command (e.g., "sudo")
    pub privilege_wrapper: Option<String>,

    /// File name the template is written to inside the build directory
    pub definition_file: String,

    /// Metadata archive produced by the builder
    pub meta_artifact: String,

    /// Filesystem image produced by the builder
    pub rootfs_artifact: String,

    /// Parent directory for per-build working directories (system temp dir if unset)
    pub work_root: Option<PathBuf>,

    /// Seconds a cancelled builder gets to exit after SIGTERM before SIGKILL
    pub cancel_grace_secs: u64,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            program: "distrobuilder".to_string(),
            args: vec!["build-lxd".to_string()],
            privilege_wrapper: Some("sudo".to_string()),
            definition_file: "distrobuilder.yaml".to_string(),
            meta_artifact: "lxd.tar.xz".to_string(),
            rootfs_artifact: "rootfs.squashfs".to_string(),
            work_root: None,
            cancel_grace_secs: 10,
        }
    }
}

/// Log level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}
