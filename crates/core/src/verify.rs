//! Content-addressed verification of downloaded assets.
//!
//! The manifest format embeds lowercase hex MD5 digests, so MD5 is the one
//! algorithm applied everywhere: the builder when producing manifests and
//! the orchestrator when checking downloads. For compressed entries the
//! digest covers the archive bytes as downloaded, not the expanded content;
//! the core never decompresses anything.

use std::{fs, path::Path};

use md5::{Digest, Md5};

use crate::error::{Result, UpdateError};

/// Hex MD5 digest of a byte slice.
pub fn checksum_bytes(bytes: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hex MD5 digest of a file's full contents.
pub fn checksum_file(path: impl AsRef<Path>) -> Result<String> {
    let path = path.as_ref();
    let bytes = fs::read(path).map_err(|err| UpdateError::Storage {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })?;
    Ok(checksum_bytes(&bytes))
}

/// Check a byte buffer against a manifest-declared checksum.
///
/// Pure check; the caller decides what to do with the buffer on mismatch.
pub fn verify_bytes(rel_path: &str, bytes: &[u8], expected: &str) -> Result<()> {
    let actual = checksum_bytes(bytes);
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(UpdateError::Verification {
            path: rel_path.to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Check a file on disk against a manifest-declared checksum.
pub fn verify_file(path: impl AsRef<Path>, rel_path: &str, expected: &str) -> Result<()> {
    let actual = checksum_file(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(UpdateError::Verification {
            path: rel_path.to_string(),
            expected: expected.to_string(),
            actual,
        })
    }
}
