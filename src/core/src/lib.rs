//! lxbake Core - Foundational Types
//!
//! This module provides the error taxonomy, configuration types and the
//! composite resource identity shared by the lxbake runtime and CLI.

pub mod config;
pub mod error;
pub mod id;

// Re-export commonly used types
pub use config::{BuilderConfig, LogLevel, ProviderConfig, RemoteConfig};
pub use error::{BakeError, Result};
pub use id::BuiltImageId;

/// lxbake version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
