//! lxbake runtime - builds LXD images and manages them as resources.
//!
//! This crate wires the image builder, the image store client and the alias
//! reconciler into the built image lifecycle.

#![allow(clippy::result_large_err)]

pub mod alias;
pub mod build;
pub mod fingerprint;
pub mod lifecycle;
pub mod operation;
pub mod server;
pub mod transfer;

// Re-export common types
pub use alias::{AliasAction, AliasFailure, AliasPlan, AliasReport};
pub use build::{BuildArtifacts, BuildExecutor};
pub use lifecycle::{BuiltImageResource, BuiltImageState, Provider};
pub use operation::cancelable_wait;
pub use server::{
    AliasEntry, ImageRecord, ImageServer, LxdConnector, LxdServer, MemoryServer, OperationRecord,
    ProgressHandler, RemoteOperation, ServerConnector, StaticConnector, TransferProgress,
};
pub use transfer::transfer;

/// lxbake runtime version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
