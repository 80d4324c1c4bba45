//! Content identifiers
//!
//! Hex-encoded digest of a file's bytes, used as the record key in label-bridge
//! files. SHA-1 by default; SHA-256 when configured.

use avscan_common::config::IdentifierAlgorithm;
use avscan_common::{Error, Result};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Read buffer size for hashing
const CHUNK_SIZE: usize = 64 * 1024;

/// Compute the identifier of the file at `file_path`
///
/// Hashing runs on the blocking pool so large files don't stall other tasks.
pub async fn compute_identifier(file_path: &Path, algorithm: IdentifierAlgorithm) -> Result<String> {
    let path_buf = file_path.to_path_buf();
    tracing::debug!(path = %path_buf.display(), ?algorithm, "Calculating identifier");

    let identifier = tokio::task::spawn_blocking(move || -> Result<String> {
        let file = std::fs::File::open(&path_buf).map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to open {} for hashing: {}", path_buf.display(), e),
            ))
        })?;
        let digest = match algorithm {
            IdentifierAlgorithm::Sha1 => hash_reader::<Sha1>(file),
            IdentifierAlgorithm::Sha256 => hash_reader::<Sha256>(file),
        };
        digest.map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to read {} for hashing: {}", path_buf.display(), e),
            ))
        })
    })
    .await
    .map_err(|e| Error::Internal(format!("Hash calculation task failed: {}", e)))??;

    Ok(identifier)
}

/// Identifier of an in-memory buffer
pub fn identifier_of_bytes(bytes: &[u8], algorithm: IdentifierAlgorithm) -> String {
    match algorithm {
        IdentifierAlgorithm::Sha1 => format!("{:x}", Sha1::digest(bytes)),
        IdentifierAlgorithm::Sha256 => format!("{:x}", Sha256::digest(bytes)),
    }
}

fn hash_reader<D: Digest>(mut reader: impl Read) -> std::io::Result<String>
where
    sha2::digest::Output<D>: std::fmt::LowerHex,
{
    let mut hasher = D::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
