use thiserror::Error;

/// lxbake error types
#[derive(Error, Debug)]
pub enum BakeError {
    /// Image builder exited unsuccessfully or could not be started
    #[error("Build failed: {message}")]
    BuildFailure {
        status: Option<i32>,
        message: String,
    },

    /// Builder succeeded but an expected artifact is absent
    #[error("Build artifact missing: {path}")]
    ArtifactMissing { path: String },

    /// Store rejected the upload or the import operation failed
    #[error("Image transfer failed: {0}")]
    TransferFailure(String),

    /// Requested alias is already bound on the destination store
    #[error("Image alias already exists on destination: {alias} -> {target}")]
    AliasConflict { alias: String, target: String },

    /// Store has no such image, alias or operation
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed composite resource identity
    #[error("Invalid resource id: {0}")]
    InvalidId(String),

    /// Wait interrupted by the caller
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Server-side operation finished unsuccessfully
    #[error("Operation {id} failed: {message}")]
    OperationFailed { id: String, message: String },

    /// Store answered in a shape the client cannot work with
    #[error("Store contract violation: {0}")]
    ContractViolation(String),

    /// Any other non-success answer from the store
    #[error("Server error: {remote} {status} - {message}")]
    ServerError {
        remote: String,
        status: u16,
        message: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BakeError {
    /// Whether the store reported the target as absent.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BakeError::NotFound(_))
    }
}

impl From<serde_json::Error> for BakeError {
    fn from(err: serde_json::Error) -> Self {
        BakeError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for BakeError {
    fn from(err: serde_yaml::Error) -> Self {
        BakeError::SerializationError(err.to_string())
    }
}

/// Result type alias for lxbake operations
pub type Result<T> = std::result::Result<T, BakeError>;
