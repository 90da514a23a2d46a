//! Split image fingerprints.
//!
//! LXD identifies a split image by the sha256 of the metadata archive
//! followed by the filesystem image.

use std::path::Path;

use lxbake_core::error::Result;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Fingerprint of in-memory artifact contents, in order.
pub fn bytes_fingerprint(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// Fingerprint of artifact files, streamed in order.
pub async fn file_fingerprint(paths: &[&Path]) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];

    for path in paths {
        let mut file = tokio::fs::File::open(path).await?;
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }

    Ok(hex::encode(hasher.finalize()))
}
